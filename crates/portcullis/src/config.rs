//! Declarative gateway configuration.
//!
//! A config bundles the routers, servers, and tools of one tenant. Field
//! names here are the persistence format (JSON or YAML on disk, and the
//! payload carried by notifiers).

use mcpkit::Tool;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;

/// MCP server startup policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Policy {
    /// Start the backend when the state is built and keep it running.
    OnStart,
    /// Open the backend per operation.
    #[default]
    OnDemand,
}

/// MCP server wire type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerType {
    Sse,
    Stdio,
    Streamable,
}

/// Where a tool argument is placed on the outbound request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ArgPosition {
    Query,
    Header,
    Path,
    #[default]
    Body,
}

/// One argument of a templated REST tool.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolArg {
    pub name: String,
    #[serde(default)]
    pub position: ArgPosition,
    #[serde(default, rename = "type")]
    pub arg_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub description: String,
    /// Default value, inserted when the caller omits the argument.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default: Option<Value>,
    /// Item schema for array-typed arguments.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<Value>,
}

/// A templated REST tool definition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDef {
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub method: String,
    /// URL template; `{{config.url}}` expands to the owning server's base URL
    /// and `{{args.X}}` / `{{request.headers.Y}}` substitute per call.
    pub path: String,
    #[serde(default)]
    pub headers: HashMap<String, String>,
    #[serde(default)]
    pub args: Vec<ToolArg>,
    #[serde(default)]
    pub request_body: String,
    #[serde(default)]
    pub response_body: String,
    /// JSON Schema advertised to MCP clients.
    #[serde(default)]
    pub input_schema: Value,
}

impl ToolDef {
    /// The MCP tool advertisement for this definition.
    pub fn to_tool(&self) -> Tool {
        let schema = if self.input_schema.is_object() {
            self.input_schema.clone()
        } else {
            serde_json::json!({ "type": "object" })
        };
        Tool {
            name: self.name.clone(),
            description: Some(self.description.clone()),
            input_schema: schema,
        }
    }
}

/// A REST backend exposing templated tools.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HttpServer {
    pub name: String,
    #[serde(default)]
    pub description: String,
    /// Base URL, exposed to templates as `config.url`.
    pub url: String,
    /// Names of tools this server exposes; must exist in the config's tools.
    #[serde(default)]
    pub tools: Vec<String>,
}

/// An MCP backend reached over stdio, SSE, or Streamable-HTTP.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpServer {
    pub name: String,
    #[serde(rename = "type")]
    pub server_type: McpServerType,
    #[serde(default)]
    pub description: String,
    #[serde(default)]
    pub policy: Policy,
    /// Shell-style command line for stdio servers.
    #[serde(default)]
    pub command: String,
    /// Extra arguments appended to the command line.
    #[serde(default)]
    pub args: Vec<String>,
    /// Endpoint URL for sse/streamable servers.
    #[serde(default)]
    pub url: String,
    /// Preinstalled servers get a start/stop liveness check at build time.
    #[serde(default)]
    pub preinstalled: bool,
}

/// CORS policy attached to a router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct Cors {
    #[serde(default)]
    pub allow_origins: Vec<String>,
    #[serde(default)]
    pub allow_credentials: bool,
    #[serde(default)]
    pub allow_methods: Vec<String>,
    #[serde(default)]
    pub allow_headers: Vec<String>,
    #[serde(default)]
    pub expose_headers: Vec<String>,
}

/// Binds a URL prefix to a named server within the same config.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Router {
    pub prefix: String,
    /// Name of an HttpServer or McpServer in the same config.
    pub server: String,
    /// External path prefix advertised in SSE `endpoint` events, for
    /// reverse-proxy deployments.
    #[serde(default)]
    pub sse_prefix: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cors: Option<Cors>,
}

/// A tenant-scoped configuration bundle. Unique key: `(tenant, name)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct McpConfig {
    pub name: String,
    #[serde(default)]
    pub tenant: String,
    /// Registered prefix of the owning tenant; when non-empty, every router
    /// prefix must live under it or the config is rejected at build time.
    #[serde(default)]
    pub tenant_prefix: String,
    #[serde(default)]
    pub routers: Vec<Router>,
    #[serde(default)]
    pub http_servers: Vec<HttpServer>,
    #[serde(default)]
    pub servers: Vec<McpServer>,
    #[serde(default)]
    pub tools: Vec<ToolDef>,
}

impl McpConfig {
    /// Index tools by name.
    pub fn tool_index(&self) -> HashMap<&str, &ToolDef> {
        self.tools.iter().map(|t| (t.name.as_str(), t)).collect()
    }
}
