//! Protocol lifecycle types: initialize handshake and capabilities.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Latest protocol revision this implementation speaks.
pub const LATEST_PROTOCOL_VERSION: &str = "2025-03-26";

/// Header carrying the protocol version on upstream HTTP transports.
pub const PROTOCOL_VERSION_HEADER: &str = "mcp-protocol-version";

/// Name and version of an MCP implementation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Implementation {
    pub name: String,
    pub version: String,
}

impl Implementation {
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }
}

impl Default for Implementation {
    fn default() -> Self {
        Self::new("Unknown", "0.0.0")
    }
}

/// Tools capability advertisement.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ToolsCapability {
    #[serde(default)]
    pub list_changed: bool,
}

/// Server capabilities returned from initialize.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServerCapabilities {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<ToolsCapability>,
}

impl ServerCapabilities {
    /// Capabilities of a tools-only server with listChanged advertisement.
    pub fn tools_only() -> Self {
        Self {
            tools: Some(ToolsCapability { list_changed: true }),
        }
    }
}

/// Parameters of the initialize request. Every field is lenient: missing
/// pieces fall back to defaults instead of rejecting the handshake.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct InitializeParams {
    #[serde(default)]
    pub protocol_version: Option<String>,

    #[serde(default)]
    pub capabilities: Option<Value>,

    #[serde(default)]
    pub client_info: Option<Implementation>,
}

/// Result of the initialize request.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitializeResult {
    pub protocol_version: String,
    pub server_info: Implementation,
    pub capabilities: ServerCapabilities,
}

impl InitializeResult {
    pub fn new(server_info: Implementation, capabilities: ServerCapabilities) -> Self {
        Self {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            server_info,
            capabilities,
        }
    }
}
