//! Backend transports.
//!
//! A transport connects one prefix to its backend. Four variants:
//! templated REST over HTTP, a stdio MCP subprocess, an upstream MCP-SSE
//! server, and an upstream Streamable-HTTP server. All expose tool listing
//! and invocation; start/stop is degenerate for the HTTP variant.

mod http;
mod sse;
mod stdio;
mod streamable;

pub use http::HttpTransport;
pub use sse::SseTransport;
pub use stdio::StdioTransport;
pub use streamable::StreamableTransport;

use async_trait::async_trait;
use mcpkit::{CallToolParams, CallToolResult, Tool};
use std::sync::Arc;

use crate::config::{McpServer, McpServerType};
use crate::template::RequestContext;

/// Errors from transport lifecycle and tool listing. Tool invocation never
/// raises; failures come back as `isError` results.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid command: {0}")]
    InvalidCommand(String),

    #[error("transport not running")]
    NotRunning,

    #[error("upstream error: {0}")]
    Upstream(String),
}

impl From<mcpkit::client::ClientError> for TransportError {
    fn from(e: mcpkit::client::ClientError) -> Self {
        TransportError::Upstream(e.to_string())
    }
}

/// Backend-facing connector bound to one server definition.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Bring the backend up. Idempotent; serialized per transport.
    async fn start(&self) -> Result<(), TransportError>;

    /// Tear the backend down. Idempotent; safe to race with callers, which
    /// fail that one call and restart on the next.
    async fn stop(&self) -> Result<(), TransportError>;

    /// Whether the backend is currently up.
    fn is_running(&self) -> bool;

    /// Tools the backend exposes.
    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError>;

    /// Invoke a tool. Failures surface as `isError` results, never errors.
    async fn call_tool(&self, params: CallToolParams, req: &RequestContext) -> CallToolResult;
}

/// Build the transport for an MCP server definition.
///
/// HTTP template transports are not built here; they are assembled during
/// the state build from the server's allowed tool set.
pub fn create_transport(server: &McpServer) -> Result<Arc<dyn Transport>, TransportError> {
    match server.server_type {
        McpServerType::Stdio => Ok(Arc::new(StdioTransport::new(server)?)),
        McpServerType::Sse => Ok(Arc::new(SseTransport::new(server)?)),
        McpServerType::Streamable => Ok(Arc::new(StreamableTransport::new(server)?)),
    }
}

/// Cap diagnostic text surfaced to clients; full detail goes to logs.
pub(crate) fn truncate_diag(text: &str) -> String {
    const MAX: usize = 200;
    if text.chars().count() <= MAX {
        text.to_string()
    } else {
        let mut out: String = text.chars().take(MAX).collect();
        out.push('…');
        out
    }
}

/// Not-found result shared by every variant.
pub(crate) fn tool_not_found(name: &str, server: &str) -> CallToolResult {
    CallToolResult::error(format!("Tool {} not found on server {}", name, server))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_truncate_diag() {
        assert_eq!(truncate_diag("short"), "short");
        let long = "x".repeat(500);
        let capped = truncate_diag(&long);
        assert_eq!(capped.chars().count(), 201);
        assert!(capped.ends_with('…'));
    }

    #[test]
    fn test_create_transport_variants() {
        let stdio: McpServer = serde_json::from_value(json!({
            "name": "files", "type": "stdio", "command": "mcp-files --root /srv"
        }))
        .unwrap();
        assert!(create_transport(&stdio).is_ok());

        let bad: McpServer = serde_json::from_value(json!({
            "name": "files", "type": "stdio", "command": ""
        }))
        .unwrap();
        assert!(matches!(
            create_transport(&bad),
            Err(TransportError::InvalidCommand(_))
        ));

        let sse: McpServer = serde_json::from_value(json!({
            "name": "up", "type": "sse", "url": "http://up/sse"
        }))
        .unwrap();
        assert!(create_transport(&sse).is_ok());

        let streamable: McpServer = serde_json::from_value(json!({
            "name": "up", "type": "streamable", "url": "http://up/mcp"
        }))
        .unwrap();
        assert!(create_transport(&streamable).is_ok());
    }

    #[test]
    fn test_tool_not_found_shape() {
        let result = tool_not_found("nope", "backend");
        assert!(result.is_error);
        assert!(result.content[0]
            .as_text()
            .unwrap()
            .starts_with("Tool nope not found"));
    }
}
