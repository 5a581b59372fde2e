//! TLS upgrade of a tunneled stream and the certificate policies it can run under

use base64::Engine;
use chrono::{DateTime, Utc};
use openssl::ssl::{SslConnector, SslMethod, SslRef, SslVerifyMode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::str::FromStr;
use std::sync::Arc;
use tokio::sync::RwLock;
use tokio_openssl::SslStream;
use tracing::{debug, info, warn};

use crate::transport::BoxedStream;
use crate::{Error, Result};

/// How the peer certificate is checked during the upgrade.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CertPolicy {
    /// System roots (plus an optional CA file) and hostname verification
    #[default]
    Strict,
    /// Accept the first certificate seen for a domain, reject any other later
    TrustOnFirstUse,
    /// No verification at all
    Bypass,
}

impl FromStr for CertPolicy {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(CertPolicy::Strict),
            "tofu" | "trust_on_first_use" | "trust-on-first-use" => Ok(CertPolicy::TrustOnFirstUse),
            "bypass" | "insecure" => Ok(CertPolicy::Bypass),
            other => Err(Error::Config(config::ConfigError::Message(format!(
                "unknown certificate policy: {}",
                other
            )))),
        }
    }
}

/// A pinned certificate fingerprint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CertPin {
    pub fingerprint: String,
    pub first_seen: DateTime<Utc>,
}

/// Fingerprints accepted under [`CertPolicy::TrustOnFirstUse`], keyed by domain.
///
/// Clones share the same pins. When created with [`PinStore::load`] every new
/// pin is written back to that file as JSON.
#[derive(Debug, Clone, Default)]
pub struct PinStore {
    pins: Arc<RwLock<HashMap<String, CertPin>>>,
    path: Option<PathBuf>,
}

impl PinStore {
    pub fn in_memory() -> Self {
        Self::default()
    }

    /// Load pins from `path`; a missing file starts an empty store at that path.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let pins = if path.exists() {
            let content = std::fs::read_to_string(&path)?;
            serde_json::from_str(&content)?
        } else {
            HashMap::new()
        };

        debug!("Loaded {} certificate pins from {}", pins.len(), path.display());
        Ok(Self {
            pins: Arc::new(RwLock::new(pins)),
            path: Some(path),
        })
    }

    pub async fn get(&self, domain: &str) -> Option<CertPin> {
        self.pins.read().await.get(domain).cloned()
    }

    /// Pin `fingerprint` for `domain` if nothing is pinned yet, otherwise require a match.
    pub async fn verify(&self, domain: &str, fingerprint: &str) -> Result<()> {
        {
            let pins = self.pins.read().await;
            if let Some(pin) = pins.get(domain) {
                if pin.fingerprint == fingerprint {
                    return Ok(());
                }
                return Err(Error::CertificateMismatch {
                    domain: domain.to_string(),
                    pinned: pin.fingerprint.clone(),
                });
            }
        }

        let mut pins = self.pins.write().await;
        // another handshake may have pinned this domain while we waited for the lock
        if let Some(pin) = pins.get(domain) {
            if pin.fingerprint == fingerprint {
                return Ok(());
            }
            return Err(Error::CertificateMismatch {
                domain: domain.to_string(),
                pinned: pin.fingerprint.clone(),
            });
        }
        pins.insert(
            domain.to_string(),
            CertPin {
                fingerprint: fingerprint.to_string(),
                first_seen: Utc::now(),
            },
        );
        info!("Pinned certificate {} for {}", fingerprint, domain);

        if let Some(path) = &self.path {
            let content = serde_json::to_string_pretty(&*pins)?;
            tokio::fs::write(path, content).await?;
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default)]
pub struct TlsOptions {
    pub policy: CertPolicy,
    /// Extra trust anchors for [`CertPolicy::Strict`]
    pub ca_file: Option<PathBuf>,
    pub pins: PinStore,
}

/// Performs the client side of the TLS handshake over an established tunnel.
#[derive(Clone)]
pub struct TlsUpgrader {
    connector: SslConnector,
    policy: CertPolicy,
    pins: PinStore,
}

impl fmt::Debug for TlsUpgrader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsUpgrader")
            .field("policy", &self.policy)
            .finish()
    }
}

impl TlsUpgrader {
    pub fn new(options: &TlsOptions) -> Result<Self> {
        let mut builder = SslConnector::builder(SslMethod::tls_client())
            .map_err(|e| Error::unsupported_platform(format!("no usable TLS client: {}", e)))?;

        match options.policy {
            CertPolicy::Strict => {
                if let Some(ca_file) = &options.ca_file {
                    builder.set_ca_file(ca_file)?;
                }
                builder.set_verify(SslVerifyMode::PEER);
            }
            CertPolicy::TrustOnFirstUse => builder.set_verify(SslVerifyMode::NONE),
            CertPolicy::Bypass => {
                warn!("Certificate verification is disabled for tunneled TLS");
                builder.set_verify(SslVerifyMode::NONE);
            }
        }

        Ok(Self {
            connector: builder.build(),
            policy: options.policy,
            pins: options.pins.clone(),
        })
    }

    pub fn policy(&self) -> CertPolicy {
        self.policy
    }

    /// Run the handshake over `stream`, naming `domain` as the peer.
    pub async fn upgrade(&self, stream: BoxedStream, domain: &str) -> Result<SslStream<BoxedStream>> {
        let mut configuration = self.connector.configure()?;
        configuration.set_verify_hostname(self.policy == CertPolicy::Strict);
        let ssl = configuration.into_ssl(domain)?;

        let mut tls = SslStream::new(ssl, stream)?;
        Pin::new(&mut tls).connect().await?;

        if self.policy == CertPolicy::TrustOnFirstUse {
            let fingerprint = peer_fingerprint(tls.ssl())?;
            self.pins.verify(domain, &fingerprint).await?;
        }

        debug!(
            "TLS established with {} using {}",
            domain,
            tls.ssl().version_str()
        );
        Ok(tls)
    }
}

/// SHA-256 over the DER encoding of the peer's leaf certificate.
pub fn peer_fingerprint(ssl: &SslRef) -> Result<String> {
    let cert = ssl
        .peer_certificate()
        .ok_or_else(|| Error::protocol_violation("peer presented no certificate"))?;
    let digest = Sha256::digest(cert.to_der()?);
    Ok(format!(
        "sha256/{}",
        base64::engine::general_purpose::STANDARD.encode(digest)
    ))
}

#[cfg(test)]
pub(crate) mod testing {
    use openssl::pkey::PKey;
    use openssl::ssl::{Ssl, SslAcceptor, SslMethod};
    use openssl::x509::X509;
    use std::pin::Pin;
    use tokio::io::{AsyncRead, AsyncWrite};
    use tokio_openssl::SslStream;

    /// A TLS acceptor serving a fresh self-signed certificate for `host`.
    pub fn self_signed_acceptor(host: &str) -> SslAcceptor {
        let cert = rcgen::generate_simple_self_signed(vec![host.to_string()]).unwrap();
        let cert_pem = cert.serialize_pem().unwrap();
        let key_pem = cert.serialize_private_key_pem();

        let mut builder = SslAcceptor::mozilla_intermediate_v5(SslMethod::tls_server()).unwrap();
        builder
            .set_certificate(&X509::from_pem(cert_pem.as_bytes()).unwrap())
            .unwrap();
        builder
            .set_private_key(&PKey::private_key_from_pem(key_pem.as_bytes()).unwrap())
            .unwrap();
        builder.build()
    }

    pub async fn accept<S>(acceptor: &SslAcceptor, stream: S) -> Option<SslStream<S>>
    where
        S: AsyncRead + AsyncWrite + Unpin,
    {
        let ssl = Ssl::new(acceptor.context()).unwrap();
        let mut tls = SslStream::new(ssl, stream).unwrap();
        Pin::new(&mut tls).accept().await.ok()?;
        Some(tls)
    }
}
