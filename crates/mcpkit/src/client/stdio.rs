//! Stdio MCP Client.
//!
//! Spawns a subprocess and speaks newline-delimited JSON-RPC over its
//! stdin/stdout. Environment and working directory are inherited from the
//! gateway process; stderr passes through for operator visibility.

use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};

use serde_json::Value;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::Mutex;
use tokio::time::{timeout, Duration};

use super::{parse_call_result, parse_tools, ClientError, ClientOptions};
use crate::types::protocol::{InitializeResult, LATEST_PROTOCOL_VERSION};
use crate::types::tool::{CallToolResult, Tool};

struct Pipes {
    stdin: ChildStdin,
    stdout: BufReader<ChildStdout>,
}

/// MCP client over a subprocess's stdin/stdout.
pub struct StdioClient {
    child: Mutex<Child>,
    // Requests are serialized over the pipe pair: one request in flight at a
    // time, responses matched by id.
    pipes: Mutex<Pipes>,
    request_id: AtomicU64,
    options: ClientOptions,
}

impl StdioClient {
    /// Spawn the subprocess and wire up its pipes. No MCP traffic happens
    /// until [`StdioClient::initialize`].
    pub fn spawn(program: &str, args: &[String]) -> Result<Self, ClientError> {
        Self::spawn_with_options(program, args, ClientOptions::default())
    }

    /// Spawn with custom options.
    pub fn spawn_with_options(
        program: &str,
        args: &[String],
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ClientError::Transport(format!("failed to spawn '{}': {}", program, e)))?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ClientError::Transport("child stdin unavailable".into()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ClientError::Transport("child stdout unavailable".into()))?;

        Ok(Self {
            child: Mutex::new(child),
            pipes: Mutex::new(Pipes {
                stdin,
                stdout: BufReader::new(stdout),
            }),
            request_id: AtomicU64::new(1),
            options,
        })
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Perform the MCP handshake with the subprocess.
    pub async fn initialize(&self) -> Result<InitializeResult, ClientError> {
        let id = self.next_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
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

        let response = self.send_request(id, &request).await?;

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
        self.send_line(&notification).await?;

        Ok(result)
    }

    /// List available tools from the subprocess.
    pub async fn list_tools(&self) -> Result<Vec<Tool>, ClientError> {
        let id = self.next_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/list",
            "params": {}
        });

        let response = self.send_request(id, &request).await?;
        parse_tools(&response)
    }

    /// Call a tool on the subprocess.
    pub async fn call_tool(
        &self,
        name: &str,
        arguments: Value,
    ) -> Result<CallToolResult, ClientError> {
        let id = self.next_id();
        let request = serde_json::json!({
            "jsonrpc": "2.0",
            "id": id,
            "method": "tools/call",
            "params": {
                "name": name,
                "arguments": arguments
            }
        });

        let response = self.send_request(id, &request).await?;
        parse_call_result(&response)
    }

    /// Terminate the subprocess.
    pub async fn shutdown(&self) {
        let mut child = self.child.lock().await;
        if let Err(e) = child.kill().await {
            tracing::debug!(error = %e, "stdio child already gone");
        }
    }

    /// Child process id, while it is alive.
    pub async fn pid(&self) -> Option<u32> {
        self.child.lock().await.id()
    }

    async fn send_line(&self, payload: &Value) -> Result<(), ClientError> {
        let mut pipes = self.pipes.lock().await;
        let mut line = payload.to_string();
        line.push('\n');
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Transport(format!("stdin write failed: {}", e)))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| ClientError::Transport(format!("stdin flush failed: {}", e)))?;
        Ok(())
    }

    /// Write one request and read lines until its response arrives.
    /// Notifications and unrelated ids are skipped.
    async fn send_request(&self, id: u64, request: &Value) -> Result<Value, ClientError> {
        let mut pipes = self.pipes.lock().await;

        let mut line = request.to_string();
        line.push('\n');
        pipes
            .stdin
            .write_all(line.as_bytes())
            .await
            .map_err(|e| ClientError::Transport(format!("stdin write failed: {}", e)))?;
        pipes
            .stdin
            .flush()
            .await
            .map_err(|e| ClientError::Transport(format!("stdin flush failed: {}", e)))?;

        let deadline = Duration::from_secs(self.options.timeout_secs);
        loop {
            let mut buf = String::new();
            let read = timeout(deadline, pipes.stdout.read_line(&mut buf))
                .await
                .map_err(|_| ClientError::Timeout("stdio response".into()))?
                .map_err(|e| ClientError::Transport(format!("stdout read failed: {}", e)))?;

            if read == 0 {
                return Err(ClientError::Transport("subprocess closed stdout".into()));
            }

            let trimmed = buf.trim();
            if trimmed.is_empty() {
                continue;
            }

            let Ok(value) = serde_json::from_str::<Value>(trimmed) else {
                tracing::debug!(line = %trimmed, "skipping non-JSON line from subprocess");
                continue;
            };

            if value.get("id").and_then(|v| v.as_u64()) == Some(id) {
                return Ok(value);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_spawn_missing_program_fails() {
        let result = StdioClient::spawn("/definitely/not/a/program", &[]);
        assert!(matches!(result, Err(ClientError::Transport(_))));
    }

    #[tokio::test]
    async fn test_spawn_and_shutdown() {
        // `cat` never speaks MCP but exercises the pipe plumbing.
        let client = StdioClient::spawn("cat", &[]).expect("spawn cat");
        assert!(client.pid().await.is_some());
        client.shutdown().await;
    }
}
