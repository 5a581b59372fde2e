//! Newline-terminated JSON-RPC requests sent through an established tunnel

use bytes::{BufMut, Bytes, BytesMut};
use serde::Serialize;
use serde_json::Value;

use crate::Result;

/// Capability query understood by Electrum-style servers.
pub const SERVER_FEATURES: &str = "server.features";

#[derive(Debug, Clone, Serialize)]
pub struct RpcRequest {
    pub jsonrpc: &'static str,
    pub id: String,
    pub method: String,
    pub params: Value,
}

impl RpcRequest {
    pub fn new<M: Into<String>>(method: M, params: Value) -> Self {
        Self {
            jsonrpc: "2.0",
            id: uuid::Uuid::new_v4().to_string(),
            method: method.into(),
            params,
        }
    }

    pub fn server_features() -> Self {
        Self::new(SERVER_FEATURES, Value::Array(Vec::new()))
    }

    /// Serialized request followed by `\n`.
    pub fn to_line(&self) -> Result<Bytes> {
        let body = serde_json::to_vec(self)?;
        let mut line = BytesMut::with_capacity(body.len() + 1);
        line.put_slice(&body);
        line.put_u8(b'\n');
        Ok(line.freeze())
    }
}
