//! Stdio MCP subprocess transport.
//!
//! The server's `command` is tokenized shell-style and spawned as a
//! subprocess speaking MCP over stdin/stdout. Under `policy=on_start` the
//! subprocess stays alive; `on_demand` transports open per operation and
//! close afterwards.

use async_trait::async_trait;
use mcpkit::client::StdioClient;
use mcpkit::{CallToolParams, CallToolResult, Tool};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;

use super::{tool_not_found, truncate_diag, Transport, TransportError};
use crate::config::{McpServer, Policy};
use crate::template::RequestContext;

struct Inner {
    client: Option<Arc<StdioClient>>,
    tools_cache: Vec<Tool>,
}

/// Transport over a stdio MCP subprocess.
pub struct StdioTransport {
    server: McpServer,
    program: String,
    args: Vec<String>,
    // Guards start/stop and the tools cache rebuild.
    inner: Mutex<Inner>,
    running: AtomicBool,
}

impl StdioTransport {
    pub fn new(server: &McpServer) -> Result<Self, TransportError> {
        let mut argv = shlex::split(&server.command)
            .ok_or_else(|| TransportError::InvalidCommand(server.command.clone()))?;
        argv.extend(server.args.iter().cloned());
        if argv.is_empty() {
            return Err(TransportError::InvalidCommand(server.command.clone()));
        }
        let program = argv.remove(0);

        Ok(Self {
            server: server.clone(),
            program,
            args: argv,
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

    /// Spawn and initialize the subprocess if it is not up. Caller holds
    /// the inner lock.
    async fn ensure_started(&self, inner: &mut Inner) -> Result<Arc<StdioClient>, TransportError> {
        if let Some(client) = &inner.client {
            return Ok(client.clone());
        }

        let client = Arc::new(StdioClient::spawn(&self.program, &self.args)?);
        client.initialize().await.map_err(|e| {
            // Don't leave a half-initialized child behind.
            let client = client.clone();
            tokio::spawn(async move { client.shutdown().await });
            TransportError::from(e)
        })?;

        tracing::info!(server = %self.server.name, program = %self.program, "stdio transport started");
        inner.client = Some(client.clone());
        self.running.store(true, Ordering::Release);
        Ok(client)
    }

    async fn stop_locked(&self, inner: &mut Inner) {
        if let Some(client) = inner.client.take() {
            client.shutdown().await;
            tracing::info!(server = %self.server.name, "stdio transport stopped");
        }
        inner.tools_cache.clear();
        self.running.store(false, Ordering::Release);
    }
}

#[async_trait]
impl Transport for StdioTransport {
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
        match &result {
            Ok(tools) => {
                inner.tools_cache = tools.clone();
                tracing::info!(server = %self.server.name, count = tools.len(), "fetched tools");
            }
            Err(e) => {
                tracing::error!(server = %self.server.name, error = %e, "failed to fetch tools");
            }
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

        // Fill the cache on first use so unknown tools short-circuit
        // without touching the subprocess again.
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

        let arguments = Value::Object(params.args());
        let result = client.call_tool(&params.name, arguments).await;

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

    fn server(command: &str) -> McpServer {
        serde_json::from_value(json!({
            "name": "files",
            "type": "stdio",
            "command": command,
            "policy": "on_demand"
        }))
        .unwrap()
    }

    #[test]
    fn test_command_tokenization() {
        let transport = StdioTransport::new(&server("mcp-files --root \"/srv/my data\"")).unwrap();
        assert_eq!(transport.program, "mcp-files");
        assert_eq!(transport.args, vec!["--root", "/srv/my data"]);
    }

    #[test]
    fn test_extra_args_appended() {
        let mut cfg = server("mcp-files");
        cfg.args = vec!["--verbose".to_string()];
        let transport = StdioTransport::new(&cfg).unwrap();
        assert_eq!(transport.args, vec!["--verbose"]);
    }

    #[test]
    fn test_empty_command_rejected() {
        assert!(matches!(
            StdioTransport::new(&server("")),
            Err(TransportError::InvalidCommand(_))
        ));
    }

    #[tokio::test]
    async fn test_not_running_until_started() {
        let transport = StdioTransport::new(&server("mcp-files")).unwrap();
        assert!(!transport.is_running());
        // stop on a never-started transport is a no-op
        transport.stop().await.unwrap();
        assert!(!transport.is_running());
    }

    #[tokio::test]
    async fn test_call_tool_spawn_failure_is_error_result() {
        let transport = StdioTransport::new(&server("/definitely/not/a/program")).unwrap();
        let params: CallToolParams =
            serde_json::from_value(json!({ "name": "x", "arguments": {} })).unwrap();
        let result = transport
            .call_tool(params, &RequestContext::default())
            .await;
        assert!(result.is_error);
        assert!(result.content[0].as_text().unwrap().contains("Error calling tool x"));
    }
}
