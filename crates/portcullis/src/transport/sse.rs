//! Upstream MCP-SSE transport.
//!
//! Connects to an upstream MCP server over the legacy SSE transport. The
//! connection is opened on start (or per operation under `on_demand`) and
//! torn down on stop.

use async_trait::async_trait;
use mcpkit::client::{ClientOptions, SseClient};
use mcpkit::{CallToolParams, CallToolResult, Tool};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{tool_not_found, truncate_diag, Transport, TransportError};
use crate::config::{McpServer, Policy};
use crate::template::RequestContext;

struct Inner {
    client: Option<Arc<SseClient>>,
    tools_cache: Vec<Tool>,
}

/// Transport over an upstream MCP-SSE server.
pub struct SseTransport {
    server: McpServer,
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl SseTransport {
    pub fn new(server: &McpServer) -> Result<Self, TransportError> {
        if server.url.is_empty() {
            return Err(TransportError::Upstream(format!(
                "sse server {} has no url",
                server.name
            )));
        }
        Ok(Self {
            server: server.clone(),
            inner: Mutex::new(Inner {
                client: None,
                tools_cache: Vec::new(),
            }),
            running: AtomicBool::new(false),
        })
    }

    fn on_demand(&self) -> bool {
        self.server.policy == Policy::OnDemand
    }

    fn client_options(&self) -> ClientOptions {
        ClientOptions::default()
    }

    async fn ensure_started(&self, inner: &mut Inner) -> Result<Arc<SseClient>, TransportError> {
        if let Some(client) = &inner.client {
            return Ok(client.clone());
        }

        let client = Arc::new(
            SseClient::connect_with_options(&self.server.url, self.client_options()).await?,
        );
        tracing::info!(server = %self.server.name, url = %self.server.url, "sse transport connected");
        inner.client = Some(client.clone());
        self.running.store(true, Ordering::Release);
        Ok(client)
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(client) = inner.client.take() {
            client.close();
            tracing::info!(server = %self.server.name, "sse transport stopped");
        }
        inner.tools_cache.clear();
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Transport for SseTransport {
    async fn start(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        self.ensure_started(&mut inner).await?;
        Ok(())
    }

    async fn stop(&self) -> Result<(), TransportError> {
        let mut inner = self.inner.lock().await;
        self.stop_locked(&mut inner).await;
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    async fn list_tools(&self) -> Result<Vec<Tool>, TransportError> {
        let mut inner = self.inner.lock().await;
        let client = self.ensure_started(&mut inner).await?;

        let result = client.list_tools().await;
        if let Ok(tools) = &result {
            inner.tools_cache = tools.clone();
            tracing::info!(server = %self.server.name, count = tools.len(), "fetched tools");
        }

        if self.on_demand() {
            self.stop_locked(&mut inner).await;
        }

        Ok(result?)
    }

    async fn call_tool(&self, params: CallToolParams, _req: &RequestContext) -> CallToolResult {
        let mut inner = self.inner.lock().await;

        let client = match self.ensure_started(&mut inner).await {
            Ok(client) => client,
            Err(e) => {
                tracing::error!(server = %self.server.name, error = %e, "failed to start transport");
                return CallToolResult::error(format!(
                    "Error calling tool {}: {}",
                    params.name,
                    truncate_diag(&e.to_string())
                ));
            }
        };

        if inner.tools_cache.is_empty() {
            match client.list_tools().await {
                Ok(tools) => inner.tools_cache = tools,
                Err(e) => {
                    tracing::warn!(server = %self.server.name, error = %e, "failed to prime tool cache");
                }
            }
        }

        if !inner.tools_cache.is_empty()
            && !inner.tools_cache.iter().any(|t| t.name == params.name)
        {
            if self.on_demand() {
                self.stop_locked(&mut inner).await;
            }
            return tool_not_found(&params.name, &self.server.name);
        }

        let result = client.call_tool(&params.name, Value::Object(params.args())).await;

        if self.on_demand() {
            self.stop_locked(&mut inner).await;
        }

        match result {
            Ok(result) => result,
            Err(e) => {
                tracing::error!(
                    server = %self.server.name,
                    tool = %params.name,
                    error = %e,
                    "tool call failed"
                );
                CallToolResult::error(format!(
                    "Error calling tool {}: {}",
                    params.name,
                    truncate_diag(&e.to_string())
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_missing_url_rejected() {
        let server: McpServer =
            serde_json::from_value(json!({ "name": "up", "type": "sse" })).unwrap();
        assert!(SseTransport::new(&server).is_err());
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let server: McpServer = serde_json::from_value(
            json!({ "name": "up", "type": "sse", "url": "http://up/sse" }),
        )
        .unwrap();
        let transport = SseTransport::new(&server).unwrap();
        transport.stop().await.unwrap();
        transport.stop().await.unwrap();
        assert!(!transport.is_running());
    }
}
