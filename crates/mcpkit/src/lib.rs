//! mcpkit - MCP (Model Context Protocol) wire types and backend clients.
//!
//! The types module carries the JSON-RPC 2.0 envelope, the tool and content
//! shapes, and the gateway's string-coded error envelope. The optional
//! `client` feature adds clients for the three upstream MCP transports:
//! Streamable-HTTP, SSE, and stdio subprocesses.
//!
//! # Client Example (requires `client` feature)
//!
//! ```rust,ignore
//! use mcpkit::client::StreamableClient;
//!
//! let client = StreamableClient::new("http://localhost:8080/mcp");
//! client.initialize().await?;
//! let tools = client.list_tools().await?;
//! let result = client.call_tool("my_tool", json!({"key": "value"})).await?;
//! ```

pub mod types;

#[cfg(feature = "client")]
pub mod client;

// Re-export commonly used types at crate root
pub use types::content::Content;
pub use types::error::{ErrorCode, ErrorData};
pub use types::jsonrpc::{
    JsonRpcErrorResponse, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, RequestId,
};
pub use types::protocol::{
    Implementation, InitializeParams, InitializeResult, ServerCapabilities, ToolsCapability,
    LATEST_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER,
};
pub use types::tool::{CallToolParams, CallToolResult, ListToolsResult, Tool};
