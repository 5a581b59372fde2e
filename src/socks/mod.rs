//! SOCKS5 client engine
//!
//! Method negotiation and the CONNECT command over a [`Transport`](crate::transport::Transport),
//! with an optional TLS upgrade of the resulting tunnel.

pub mod client;
pub mod messages;
pub mod rpc;

pub use client::*;
pub use messages::{BoundAddress, ConnectReply};
pub use rpc::RpcRequest;
