//! Streamable HTTP MCP Client.
//!
//! Plain HTTP POST requests with JSON-RPC payloads; responses come back in
//! the HTTP response body. Session identity travels in the Mcp-Session-Id
//! header.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use reqwest::Client;
use serde_json::Value;

use super::{parse_call_result, parse_tools, ClientError, ClientOptions};
use crate::types::protocol::{InitializeResult, LATEST_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER};
use crate::types::tool::{CallToolResult, Tool};

const SESSION_HEADER: &str = "Mcp-Session-Id";

/// MCP client using the Streamable HTTP transport.
pub struct StreamableClient {
    base_url: String,
    client: Client,
    session_id: Mutex<Option<String>>,
    request_id: AtomicU64,
    options: ClientOptions,
}

impl StreamableClient {
    /// Create a new client for the given MCP endpoint URL.
    pub fn new(base_url: &str) -> Self {
        Self::with_options(base_url, ClientOptions::default())
    }

    /// Create a new client with custom options.
    pub fn with_options(base_url: &str, options: ClientOptions) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            client: Client::new(),
            session_id: Mutex::new(None),
            request_id: AtomicU64::new(1),
            options,
        }
    }

    /// Get the base URL of this client.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Session id assigned by the upstream, if initialized.
    pub fn session_id(&self) -> Option<String> {
        self.session_id.lock().expect("session id lock").clone()
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Initialize the MCP session.
    ///
    /// Must be called before any other method. Captures the session id the
    /// upstream hands back and sends the initialized notification.
    #[tracing::instrument(skip(self), fields(mcp.url = %self.base_url))]
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "initialize",
            "params": {
                "protocolVersion": LATEST_PROTOCOL_VERSION,
                "capabilities": {},
                "clientInfo": {
                    "name": self.options.client_name,
                    "version": self.options.client_version
                }
            }
        });

        let response = self.send_request(&request).await?;

        let result: InitializeResult = serde_json::from_value(
            response
                .get("result")
                .cloned()
                .ok_or_else(|| ClientError::Protocol("Missing result in initialize response".into()))?,
        )
        .map_err(|e| ClientError::Protocol(format!("Invalid initialize response: {}", e)))?;

        let notification = serde_json::json!({
            "jsonrpc": "2.0",
            "method": "notifications/initialized",
            "params": {}
        });
        self.send_notification(&notification).await?;

        tracing::info!(
            server = %result.server_info.name,
            version = %result.server_info.version,
            "upstream MCP session initialized"
        );

        Ok(result)
    }

    /// List available tools from the upstream server.
    #[tracing::instrument(skip(self))]
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ClientError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "tools/list",
            "params": {}
        });

        let response = self.send_request(&request).await?;
        parse_tools(&response)
    }

    /// Call a tool on the upstream server.
    #[tracing::instrument(skip(self, arguments), fields(tool.name = %name))]
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ClientError> {
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": self.next_id(),
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments
            }
        });

        let response = self.send_request(&request).await?;
        parse_call_result(&response)
    }

    /// Terminate the upstream session.
    pub async fn close(&self) -> Result<(), ClientError> {
        let session_id = self.session_id();
        let Some(session_id) = session_id else {
            return Ok(());
        };

        self.client
            .delete(&self.base_url)
            .header(SESSION_HEADER, session_id)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        *self.session_id.lock().expect("session id lock") = None;
        Ok(())
    }

    fn builder(&self, request: &Value) -> reqwest::RequestBuilder {
        let mut builder = self
            .client
            .post(&self.base_url)
            .header("Content-Type", "application/json")
            .header("Accept", "application/json, text/event-stream")
            .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION)
            .timeout(std::time::Duration::from_secs(self.options.timeout_secs))
            .json(request);

        if self.options.streaming {
            builder = builder.header("X-Streaming-Support", "true");
        }
        if let Some(session_id) = self.session_id() {
            builder = builder.header(SESSION_HEADER, session_id);
        }
        builder
    }

    async fn send_request(&self, request: &Value) -> Result<Value, ClientError> {
        let response = self
            .builder(request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        // Adopt the session id the upstream assigned on initialize.
        if let Some(id) = response
            .headers()
            .get(SESSION_HEADER)
            .and_then(|v| v.to_str().ok())
        {
            *self.session_id.lock().expect("session id lock") = Some(id.to_string());
        }

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClientError::Http {
                status: status.as_u16(),
                body,
            });
        }

        response
            .json::<Value>()
            .await
            .map_err(|e| ClientError::Transport(format!("Failed to parse response: {}", e)))
    }

    async fn send_notification(&self, notification: &Value) -> Result<(), ClientError> {
        let response = self
            .builder(notification)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        let status = response.status();
        if status != reqwest::StatusCode::ACCEPTED && !status.is_success() {
            return Err(ClientError::Http {
                status: status.as_u16(),
                body: format!("Notification failed with status {}", status),
            });
        }

        Ok(())
    }
}
