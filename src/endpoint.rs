//! The local proxy endpoint and the signal announcing when it is ready
//!
//! Whatever runs the proxy process publishes its state through an
//! [`EndpointPublisher`]; clients only ever see a [`ProxyEndpoint`] once it is ready.

use serde::{Deserialize, Serialize};
use std::fmt;
use tokio::sync::watch;
use tracing::debug;
use url::Url;

use crate::{Error, Result};

pub const DEFAULT_SOCKS_PORT: u16 = 9050;

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ProxyEndpoint {
    pub host: String,
    pub port: u16,
}

impl ProxyEndpoint {
    pub fn new<H: Into<String>>(host: H, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }

    /// Parse `socks5://host[:port]` (or `socks5h://`).
    pub fn parse_url(input: &str) -> Result<Self> {
        let url = Url::parse(input)?;
        match url.scheme() {
            "socks5" | "socks5h" => {}
            other => {
                return Err(Error::endpoint(format!(
                    "unsupported proxy scheme: {}",
                    other
                )))
            }
        }

        let host = url
            .host_str()
            .ok_or_else(|| Error::endpoint(format!("no host in proxy URL: {}", input)))?;
        Ok(Self::new(host, url.port().unwrap_or(DEFAULT_SOCKS_PORT)))
    }

    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl fmt::Display for ProxyEndpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "socks5://{}:{}", self.host, self.port)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EndpointState {
    Off,
    Starting,
    Ready(ProxyEndpoint),
}

/// Owned by the single component that manages the proxy process.
#[derive(Debug)]
pub struct EndpointPublisher {
    tx: watch::Sender<EndpointState>,
}

impl Default for EndpointPublisher {
    fn default() -> Self {
        Self::new()
    }
}

impl EndpointPublisher {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(EndpointState::Off);
        Self { tx }
    }

    pub fn state(&self) -> EndpointState {
        self.tx.borrow().clone()
    }

    pub fn starting(&self) {
        debug!("Proxy endpoint starting");
        self.tx.send_replace(EndpointState::Starting);
    }

    pub fn ready(&self, endpoint: ProxyEndpoint) {
        debug!("Proxy endpoint ready at {}", endpoint);
        self.tx.send_replace(EndpointState::Ready(endpoint));
    }

    pub fn off(&self) {
        debug!("Proxy endpoint off");
        self.tx.send_replace(EndpointState::Off);
    }

    pub fn subscribe(&self) -> EndpointWatcher {
        EndpointWatcher {
            rx: self.tx.subscribe(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct EndpointWatcher {
    rx: watch::Receiver<EndpointState>,
}

impl EndpointWatcher {
    pub fn current(&self) -> EndpointState {
        self.rx.borrow().clone()
    }

    /// Wait until the endpoint is ready.
    ///
    /// Fails if the publisher goes away, or if the proxy is switched off
    /// after it was seen starting.
    pub async fn ready(&mut self) -> Result<ProxyEndpoint> {
        let mut seen_starting = false;
        loop {
            let state = self.rx.borrow_and_update().clone();
            match state {
                EndpointState::Ready(endpoint) => return Ok(endpoint),
                EndpointState::Starting => seen_starting = true,
                EndpointState::Off if seen_starting => {
                    return Err(Error::endpoint("proxy stopped before it became ready"))
                }
                EndpointState::Off => {}
            }

            self.rx
                .changed()
                .await
                .map_err(|_| Error::endpoint("proxy endpoint publisher dropped"))?;
        }
    }
}
