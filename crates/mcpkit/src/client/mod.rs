//! Clients for upstream MCP servers.
//!
//! Three transports are provided:
//! - [`StreamableClient`] - Streamable HTTP (recommended)
//! - [`SseClient`] - legacy SSE connection with a companion POST channel
//! - [`StdioClient`] - a subprocess speaking JSON-RPC over stdin/stdout

mod sse;
mod stdio;
mod streamable;

pub use sse::SseClient;
pub use stdio::StdioClient;
pub use streamable::StreamableClient;

use crate::types::tool::{CallToolResult, Tool};
use serde_json::Value;

/// Options for configuring an upstream client.
#[derive(Debug, Clone)]
pub struct ClientOptions {
    /// Client name for initialization
    pub client_name: String,
    /// Client version for initialization
    pub client_version: String,
    /// Request timeout in seconds
    pub timeout_secs: u64,
    /// Advertise streaming support to the upstream (streamable transport).
    pub streaming: bool,
}

impl Default for ClientOptions {
    fn default() -> Self {
        Self {
            client_name: "mcpkit-client".to_string(),
            client_version: env!("CARGO_PKG_VERSION").to_string(),
            timeout_secs: 30,
            streaming: false,
        }
    }
}

/// Errors that can occur when talking to an upstream MCP server.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Transport error: {0}")]
    Transport(String),

    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Timeout waiting for {0}")]
    Timeout(String),

    #[error("Upstream rejected '{method}': {message}")]
    Rpc { method: String, message: String },
}

/// Parse a JSON-RPC response into a `CallToolResult`.
///
/// An `error` envelope becomes `ClientError::Rpc`; a `result` that fails to
/// deserialize as a tool result is a protocol error.
pub(crate) fn parse_call_result(response: &Value) -> Result<CallToolResult, ClientError> {
    if let Some(error) = response.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .unwrap_or("Unknown error");
        return Err(ClientError::Rpc {
            method: "tools/call".to_string(),
            message: message.to_string(),
        });
    }

    let result = response
        .get("result")
        .ok_or_else(|| ClientError::Protocol("Missing result in response".into()))?;

    serde_json::from_value(result.clone())
        .map_err(|e| ClientError::Protocol(format!("Invalid tool result: {}", e)))
}

/// Parse a JSON-RPC response into the tool list.
pub(crate) fn parse_tools(response: &Value) -> Result<Vec<Tool>, ClientError> {
    let tools = response
        .get("result")
        .and_then(|r| r.get("tools"))
        .ok_or_else(|| ClientError::Protocol("Missing tools in response".into()))?;

    serde_json::from_value(tools.clone())
        .map_err(|e| ClientError::Protocol(format!("Failed to parse tools: {}", e)))
}
