//! Connection lifecycle and the events delivered by the transport listener

use bytes::Bytes;
use std::fmt;

/// Lifecycle of a SOCKS5 connection.
///
/// `Closed` is reachable from every other state and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Transport open, method negotiation not yet done
    Fresh,
    Negotiated,
    /// CONNECT succeeded; bytes are relayed to the target
    Tunneled,
    /// Tunneled, and the transport has been upgraded to TLS
    Encrypted,
    Closed,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Fresh => "fresh",
            ConnectionState::Negotiated => "negotiated",
            ConnectionState::Tunneled => "tunneled",
            ConnectionState::Encrypted => "encrypted",
            ConnectionState::Closed => "closed",
        }
    }

    pub fn is_tunneled(&self) -> bool {
        matches!(self, ConnectionState::Tunneled | ConnectionState::Encrypted)
    }

    pub fn is_closed(&self) -> bool {
        *self == ConnectionState::Closed
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A value produced on the response channel by the transport listener.
///
/// End of stream is not an event: the channel itself closes.
#[derive(Debug)]
pub enum TransportEvent {
    /// One inbound chunk, in wire order
    Data(Bytes),
    /// The stream failed; this is the last event before the channel closes
    Error(std::io::Error),
}
