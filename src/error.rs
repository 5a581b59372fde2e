use std::fmt;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("TLS handshake error: {0}")]
    Handshake(#[from] openssl::ssl::Error),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("URL parse error: {0}")]
    UrlParse(#[from] url::ParseError),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Negotiation error: {0}")]
    Negotiation(String),

    #[error("CONNECT to {domain}:{port} failed with status {status:#04x} ({reason})")]
    Connect {
        domain: String,
        port: u16,
        status: u8,
        reason: &'static str,
    },

    #[error("Encoding error: {0}")]
    Encoding(String),

    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    #[error("Unsupported platform: {0}")]
    UnsupportedPlatform(String),

    #[error("Certificate for {domain} does not match pinned fingerprint {pinned}")]
    CertificateMismatch { domain: String, pinned: String },

    #[error("Invalid state: expected {expected}, connection is {actual}")]
    InvalidState {
        expected: &'static str,
        actual: &'static str,
    },

    #[error("Connection closed")]
    Closed,

    #[error("Endpoint error: {0}")]
    Endpoint(String),
}

impl Error {
    pub fn transport<T: fmt::Display>(msg: T) -> Self {
        Error::Transport(msg.to_string())
    }

    pub fn negotiation<T: fmt::Display>(msg: T) -> Self {
        Error::Negotiation(msg.to_string())
    }

    pub fn encoding<T: fmt::Display>(msg: T) -> Self {
        Error::Encoding(msg.to_string())
    }

    pub fn protocol_violation<T: fmt::Display>(msg: T) -> Self {
        Error::ProtocolViolation(msg.to_string())
    }

    pub fn unsupported_platform<T: fmt::Display>(msg: T) -> Self {
        Error::UnsupportedPlatform(msg.to_string())
    }

    pub fn endpoint<T: fmt::Display>(msg: T) -> Self {
        Error::Endpoint(msg.to_string())
    }

    /// True for failures reported by the proxy or the peer, as opposed to local I/O.
    pub fn is_protocol(&self) -> bool {
        matches!(
            self,
            Error::Negotiation(_) | Error::Connect { .. } | Error::ProtocolViolation(_)
        )
    }
}
