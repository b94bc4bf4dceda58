//! Upstream Streamable-HTTP transport.
//!
//! Same contract as the SSE transport but over Streamable-HTTP; advertises
//! streaming support to the upstream.

use async_trait::async_trait;
use mcpkit::client::{ClientOptions, StreamableClient};
use mcpkit::{CallToolParams, CallToolResult, Tool};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{tool_not_found, truncate_diag, Transport, TransportError};
use crate::config::{McpServer, Policy};
use crate::template::RequestContext;

struct Inner {
    client: Option<Arc<StreamableClient>>,
    tools_cache: Vec<Tool>,
}

/// Transport over an upstream Streamable-HTTP MCP server.
pub struct StreamableTransport {
    server: McpServer,
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl StreamableTransport {
    pub fn new(server: &McpServer) -> Result<Self, TransportError> {
        if server.url.is_empty() {
            return Err(TransportError::Upstream(format!(
                "streamable server {} has no url",
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

    async fn ensure_started(
        &self,
        inner: &mut Inner,
    ) -> Result<Arc<StreamableClient>, TransportError> {
        if let Some(client) = &inner.client {
            return Ok(client.clone());
        }

        let options = ClientOptions {
            streaming: true,
            ..ClientOptions::default()
        };
        let client = Arc::new(StreamableClient::with_options(&self.server.url, options));
        client.initialize().await?;

        tracing::info!(server = %self.server.name, url = %self.server.url, "streamable transport connected");
        inner.client = Some(client.clone());
        self.running.store(true, Ordering::Release);
        Ok(client)
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(client) = inner.client.take() {
            if let Err(e) = client.close().await {
                tracing::debug!(server = %self.server.name, error = %e, "upstream session close failed");
            }
            tracing::info!(server = %self.server.name, "streamable transport stopped");
        }
        inner.tools_cache.clear();
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Transport for StreamableTransport {
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
