use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::endpoint::{ProxyEndpoint, DEFAULT_SOCKS_PORT};
use crate::socks::ClientOptions;
use crate::tls::{CertPolicy, PinStore, TlsOptions};
use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub proxy_host: String,
    pub proxy_port: u16,
    /// Upgrade tunnels to TLS after CONNECT
    pub encrypt: bool,
    pub cert_policy: CertPolicy,
    pub ca_file: Option<String>,
    /// Where trust-on-first-use pins are kept; in memory when unset
    pub pin_store_path: Option<String>,
    /// Deadline applied by the CLI to each step. The engine itself never times out.
    pub timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            proxy_host: "127.0.0.1".to_string(),
            proxy_port: DEFAULT_SOCKS_PORT,
            encrypt: false,
            cert_policy: CertPolicy::Strict,
            ca_file: None,
            pin_store_path: None,
            timeout_secs: 30,
        }
    }
}

impl Config {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings = config::Config::builder()
            .add_source(config::File::from(path.as_ref()))
            .build()?;

        let config: Config = settings.try_deserialize()?;
        Ok(config)
    }

    pub fn to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn endpoint(&self) -> ProxyEndpoint {
        ProxyEndpoint::new(self.proxy_host.clone(), self.proxy_port)
    }

    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }

    pub fn expand_path(&self, path: &str) -> PathBuf {
        if let Some(rest) = path.strip_prefix('~') {
            if let Some(home) = dirs::home_dir() {
                return home.join(rest.trim_start_matches('/'));
            }
        }
        PathBuf::from(path)
    }

    /// Build engine options, loading the pin store if one is configured.
    pub fn client_options(&self) -> Result<ClientOptions> {
        let pins = match &self.pin_store_path {
            Some(path) => PinStore::load(self.expand_path(path))?,
            None => PinStore::in_memory(),
        };

        Ok(ClientOptions {
            encrypt: self.encrypt,
            tls: TlsOptions {
                policy: self.cert_policy,
                ca_file: self.ca_file.as_deref().map(|path| self.expand_path(path)),
                pins,
            },
        })
    }
}
