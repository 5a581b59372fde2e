//! SOCKS5 client engine
//!
//! The engine never tags requests: a reply is simply the next chunk that
//! arrives on the response channel. To keep one caller from consuming
//! another caller's reply, every operation that waits for a reply holds the
//! session lock for the whole write-then-await exchange. Commands issued
//! concurrently on the same client therefore run one after another.

use bytes::Bytes;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};

use crate::connection::{ConnectionState, TransportEvent};
use crate::endpoint::ProxyEndpoint;
use crate::socks::messages::{self, BoundAddress, GREETING};
use crate::socks::rpc::RpcRequest;
use crate::tls::{TlsOptions, TlsUpgrader};
use crate::transport::{EventReceiver, ProxyStream, Transport};
use crate::{Error, Result};

#[derive(Debug, Clone, Default)]
pub struct ClientOptions {
    /// Upgrade the tunnel to TLS right after a successful CONNECT
    pub encrypt: bool,
    pub tls: TlsOptions,
}

/// State only touched by the caller currently holding the session lock.
struct Session {
    replies: EventReceiver,
    bound: Option<BoundAddress>,
}

#[derive(Debug)]
pub struct Socks5Client {
    endpoint: Option<ProxyEndpoint>,
    upgrader: Option<TlsUpgrader>,
    transport: Arc<Transport>,
    session: Mutex<Session>,
    state: watch::Sender<ConnectionState>,
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session").field("bound", &self.bound).finish()
    }
}

/// Closes a client's transport from anywhere, e.g. when a caller-side deadline expires.
///
/// Any pending write, flush or exchange then fails with [`Error::Closed`].
#[derive(Debug, Clone)]
pub struct ShutdownHandle {
    transport: Arc<Transport>,
}

impl ShutdownHandle {
    /// Abort the transport and release the stream without flushing buffered output.
    pub async fn close(&self) {
        self.transport.abort();
        self.transport.close().await;
    }
}

impl Socks5Client {
    /// Dial the proxy over TCP.
    pub async fn open(endpoint: &ProxyEndpoint, options: ClientOptions) -> Result<Self> {
        let upgrader = build_upgrader(&options)?;

        let stream = TcpStream::connect(endpoint.addr()).await?;
        stream.set_nodelay(true)?;
        info!("Connected to SOCKS5 proxy at {}", endpoint);

        Ok(Self::assemble(stream, Some(endpoint.clone()), upgrader))
    }

    /// Run over a stream that is already connected to the proxy.
    pub fn attach<S: ProxyStream + 'static>(stream: S, options: ClientOptions) -> Result<Self> {
        let upgrader = build_upgrader(&options)?;
        Ok(Self::assemble(stream, None, upgrader))
    }

    fn assemble<S: ProxyStream + 'static>(
        stream: S,
        endpoint: Option<ProxyEndpoint>,
        upgrader: Option<TlsUpgrader>,
    ) -> Self {
        let (transport, replies) = Transport::attach(stream);
        let (state, _) = watch::channel(ConnectionState::Fresh);

        Self {
            endpoint,
            upgrader,
            transport: Arc::new(transport),
            session: Mutex::new(Session {
                replies,
                bound: None,
            }),
            state,
        }
    }

    pub fn endpoint(&self) -> Option<&ProxyEndpoint> {
        self.endpoint.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.state.subscribe()
    }

    pub fn encryption_enabled(&self) -> bool {
        self.upgrader.is_some()
    }

    /// Changes every time the underlying stream is swapped.
    pub fn transport_generation(&self) -> u64 {
        self.transport.generation()
    }

    /// Address the proxy bound for the tunnel, if it reported one.
    pub async fn bound_address(&self) -> Option<BoundAddress> {
        self.session.lock().await.bound.clone()
    }

    pub fn shutdown_handle(&self) -> ShutdownHandle {
        ShutdownHandle {
            transport: self.transport.clone(),
        }
    }

    /// Method negotiation: offer "no authentication" and require the proxy to pick it.
    pub async fn connect(&self) -> Result<()> {
        let mut session = self.session.lock().await;
        self.expect_state(ConnectionState::Fresh)?;

        debug!("Sending SOCKS5 greeting");
        let reply = self.exchange(&mut session, &GREETING).await?;
        messages::parse_method_selection(&reply)?;

        self.set_state(ConnectionState::Negotiated);
        debug!("SOCKS5 method negotiated");
        Ok(())
    }

    /// Ask the proxy to open a tunnel to `domain:port`, then upgrade it to TLS
    /// if encryption was requested.
    pub async fn connect_to(&self, domain: &str, port: u16) -> Result<()> {
        let request = messages::encode_connect(domain, port)?;

        let mut session = self.session.lock().await;
        self.expect_state(ConnectionState::Negotiated)?;

        debug!("Sending CONNECT to {}:{}", domain, port);
        let reply = self.exchange(&mut session, &request).await?;
        let reply = messages::parse_connect_reply(&reply)?;

        if !reply.succeeded() {
            let reason = messages::reply_reason(reply.status);
            warn!("CONNECT to {}:{} refused: {}", domain, port, reason);
            return Err(Error::Connect {
                domain: domain.to_string(),
                port,
                status: reply.status,
                reason,
            });
        }

        if let Some(bound) = &reply.bound {
            debug!("Proxy bound {} for the tunnel", bound);
        }
        session.bound = reply.bound;
        self.set_state(ConnectionState::Tunneled);
        info!("Tunnel established to {}:{}", domain, port);

        if let Some(upgrader) = &self.upgrader {
            self.upgrade(upgrader, domain).await?;
        }
        Ok(())
    }

    async fn upgrade(&self, upgrader: &TlsUpgrader, domain: &str) -> Result<()> {
        debug!(
            "Upgrading tunnel to {} with {:?} certificate policy",
            domain,
            upgrader.policy()
        );
        let result = self
            .transport
            .upgrade(|raw| upgrader.upgrade(raw, domain))
            .await;

        match result {
            Ok(()) => {
                self.set_state(ConnectionState::Encrypted);
                info!("Tunnel to {} is now encrypted", domain);
                Ok(())
            }
            Err(e) => {
                self.set_state(ConnectionState::Closed);
                Err(e)
            }
        }
    }

    /// Write `payload` and wait for exactly one reply chunk.
    pub async fn request(&self, payload: &[u8]) -> Result<Bytes> {
        let mut session = self.session.lock().await;
        self.expect_tunneled()?;
        self.exchange(&mut session, payload).await
    }

    /// Wait for the next inbound chunk without sending anything.
    pub async fn read(&self) -> Result<Bytes> {
        let mut session = self.session.lock().await;
        self.expect_tunneled()?;
        self.next_reply(&mut session).await
    }

    /// Capability probe: one `server.features` JSON-RPC line, reply decoded as text.
    pub async fn server_features(&self) -> Result<String> {
        let line = RpcRequest::server_features().to_line()?;
        let reply = self.request(&line).await?;
        String::from_utf8(reply.to_vec())
            .map_err(|e| Error::protocol_violation(format!("reply is not UTF-8: {}", e)))
    }

    /// One JSON-RPC call whose reply is expected to fit in a single chunk.
    pub async fn call(&self, request: &RpcRequest) -> Result<serde_json::Value> {
        let reply = self.request(&request.to_line()?).await?;
        Ok(serde_json::from_slice(trim_line(&reply))?)
    }

    /// Fire-and-forget text write. `None` and empty payloads send nothing.
    pub async fn write(&self, payload: Option<&str>) -> Result<()> {
        let payload = match payload {
            Some(payload) if !payload.is_empty() => payload,
            _ => return Ok(()),
        };
        if self.state().is_closed() {
            return Err(Error::Closed);
        }
        self.transport.write(payload.as_bytes()).await
    }

    pub async fn flush(&self) -> Result<()> {
        self.transport.flush().await
    }

    /// Flush, close the response channel, release the transport. Idempotent.
    pub async fn close(&self) {
        self.transport.close().await;

        let mut session = self.session.lock().await;
        session.replies.close();
        if !self.state().is_closed() {
            self.set_state(ConnectionState::Closed);
            debug!("SOCKS5 client closed");
        }
    }

    async fn exchange(&self, session: &mut Session, payload: &[u8]) -> Result<Bytes> {
        if let Err(e) = self.send(payload).await {
            self.shut_down(session).await;
            return Err(e);
        }
        self.next_reply(session).await
    }

    async fn send(&self, payload: &[u8]) -> Result<()> {
        self.transport.write(payload).await?;
        self.transport.flush().await
    }

    async fn next_reply(&self, session: &mut Session) -> Result<Bytes> {
        match session.replies.recv().await {
            Some(TransportEvent::Data(bytes)) => Ok(bytes),
            Some(TransportEvent::Error(e)) => {
                self.shut_down(session).await;
                Err(Error::transport(e))
            }
            None => {
                self.shut_down(session).await;
                Err(Error::Closed)
            }
        }
    }

    /// The transport is gone; release everything and move to `Closed`.
    async fn shut_down(&self, session: &mut Session) {
        self.transport.close().await;
        session.replies.close();
        self.set_state(ConnectionState::Closed);
    }

    fn set_state(&self, state: ConnectionState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("SOCKS5 connection {} -> {}", previous, state);
        }
    }

    fn expect_state(&self, expected: ConnectionState) -> Result<()> {
        let actual = self.state();
        if actual == expected {
            return Ok(());
        }
        if actual.is_closed() {
            return Err(Error::Closed);
        }
        Err(Error::InvalidState {
            expected: expected.as_str(),
            actual: actual.as_str(),
        })
    }

    fn expect_tunneled(&self) -> Result<()> {
        let actual = self.state();
        if actual.is_tunneled() {
            return Ok(());
        }
        if actual.is_closed() {
            return Err(Error::Closed);
        }
        Err(Error::InvalidState {
            expected: "tunneled",
            actual: actual.as_str(),
        })
    }
}

fn build_upgrader(options: &ClientOptions) -> Result<Option<TlsUpgrader>> {
    if !options.encrypt {
        return Ok(None);
    }
    TlsUpgrader::new(&options.tls).map(Some)
}

fn trim_line(reply: &[u8]) -> &[u8] {
    let end = reply
        .iter()
        .rposition(|b| !b.is_ascii_whitespace())
        .map(|i| i + 1)
        .unwrap_or(0);
    &reply[..end]
}
