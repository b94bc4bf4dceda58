//! SSE (Server-Sent Events) MCP Client.
//!
//! Legacy transport: a long-lived SSE connection carries responses while
//! requests go out over HTTP POST to the endpoint the server advertises in
//! its first `endpoint` event.

use bytes::Bytes;
use futures::StreamExt;
use reqwest::Client;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::{timeout, Duration};

use super::{parse_call_result, parse_tools, ClientError, ClientOptions};
use crate::types::protocol::{InitializeResult, LATEST_PROTOCOL_VERSION, PROTOCOL_VERSION_HEADER};
use crate::types::tool::{CallToolResult, Tool};

type ResponseMap = Arc<Mutex<HashMap<u64, oneshot::Sender<Value>>>>;

/// MCP client using the SSE transport.
///
/// Maintains a persistent SSE connection for responses; requests are sent
/// via HTTP POST to the advertised message endpoint.
pub struct SseClient {
    base_url: String,
    post_url: String,
    client: Client,
    responses: ResponseMap,
    request_id: AtomicU64,
    listener: JoinHandle<()>,
    options: ClientOptions,
}

impl SseClient {
    /// Connect to an MCP server via SSE.
    ///
    /// Establishes the SSE stream, waits for the `endpoint` event, and
    /// performs the MCP initialization handshake.
    pub async fn connect(base_url: &str) -> Result<Self, ClientError> {
        Self::connect_with_options(base_url, ClientOptions::default()).await
    }

    /// Connect with full options.
    pub async fn connect_with_options(
        base_url: &str,
        options: ClientOptions,
    ) -> Result<Self, ClientError> {
        let base_url = base_url.trim_end_matches('/').to_string();
        let client = Client::new();

        let response = timeout(
            Duration::from_secs(options.timeout_secs),
            client
                .get(&base_url)
                .header("Accept", "text/event-stream")
                .header(PROTOCOL_VERSION_HEADER, LATEST_PROTOCOL_VERSION)
                .send(),
        )
        .await
        .map_err(|_| ClientError::Timeout("SSE connection".into()))?
        .map_err(|e| ClientError::Transport(e.to_string()))?;

        if !response.status().is_success() {
            return Err(ClientError::Http {
                status: response.status().as_u16(),
                body: "SSE connection failed".to_string(),
            });
        }

        let stream = response.bytes_stream();
        let responses: ResponseMap = Arc::new(Mutex::new(HashMap::new()));

        // The listener forwards the endpoint event once, then routes
        // responses by request id.
        let (endpoint_tx, endpoint_rx) = oneshot::channel();
        let listener = tokio::spawn(listen_for_responses(
            stream,
            responses.clone(),
            endpoint_tx,
        ));

        let endpoint = timeout(Duration::from_secs(5), endpoint_rx)
            .await
            .map_err(|_| ClientError::Timeout("endpoint event".into()))?
            .map_err(|_| ClientError::Protocol("SSE stream closed before endpoint event".into()))?;

        let post_url = resolve_endpoint(&base_url, &endpoint);

        let sse_client = Self {
            base_url,
            post_url,
            client,
            responses,
            request_id: AtomicU64::new(1),
            listener,
            options,
        };

        sse_client.initialize().await?;
        Ok(sse_client)
    }

    /// Get the base URL.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn next_id(&self) -> u64 {
        self.request_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Initialize the MCP session.
    async fn initialize(&self) -> Result<InitializeResult, ClientError> {
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
        self.send_notification(&notification).await?;

        Ok(result)
    }

    /// List available tools.
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

    /// Call a tool.
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

    /// Tear down the SSE stream.
    pub fn close(&self) {
        self.listener.abort();
    }

    /// Send a request and wait for its response on the SSE stream.
    async fn send_request(&self, id: u64, request: &Value) -> Result<Value, ClientError> {
        let (tx, rx) = oneshot::channel();
        self.responses.lock().await.insert(id, tx);

        let response = self
            .client
            .post(&self.post_url)
            .header("Content-Type", "application/json")
            .json(request)
            .send()
            .await
            .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() != reqwest::StatusCode::ACCEPTED && !response.status().is_success() {
            self.responses.lock().await.remove(&id);
            return Err(ClientError::Http {
                status: response.status().as_u16(),
                body: "Request failed".to_string(),
            });
        }

        timeout(Duration::from_secs(self.options.timeout_secs), rx)
            .await
            .map_err(|_| ClientError::Timeout("response".into()))?
            .map_err(|_| ClientError::Protocol("Response channel closed".into()))
    }

    /// Send a notification (no response expected).
    async fn send_notification(&self, notification: &Value) -> Result<(), ClientError> {
        let response = timeout(
            Duration::from_secs(5),
            self.client
                .post(&self.post_url)
                .header("Content-Type", "application/json")
                .json(notification)
                .send(),
        )
        .await
        .map_err(|_| ClientError::Timeout("notification".into()))?
        .map_err(|e| ClientError::Transport(e.to_string()))?;

        if response.status() != reqwest::StatusCode::ACCEPTED && !response.status().is_success() {
            return Err(ClientError::Http {
                status: response.status().as_u16(),
                body: "Notification failed".to_string(),
            });
        }

        Ok(())
    }
}

impl Drop for SseClient {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Resolve the advertised endpoint against the SSE base URL.
///
/// Servers send either an absolute URL or a path like
/// `/prefix/message?sessionId=...`.
fn resolve_endpoint(base_url: &str, endpoint: &str) -> String {
    if endpoint.contains("://") {
        return endpoint.to_string();
    }

    // Origin = scheme://host[:port] of the base URL.
    let origin = base_url
        .find("://")
        .and_then(|scheme_end| {
            base_url[scheme_end + 3..]
                .find('/')
                .map(|path_start| &base_url[..scheme_end + 3 + path_start])
        })
        .unwrap_or(base_url);

    format!("{}/{}", origin.trim_end_matches('/'), endpoint.trim_start_matches('/'))
}

/// Background task: parse SSE frames and route them.
async fn listen_for_responses(
    mut stream: impl futures::Stream<Item = Result<Bytes, reqwest::Error>> + Unpin,
    responses: ResponseMap,
    endpoint_tx: oneshot::Sender<String>,
) {
    let mut parser = FrameParser::default();
    let mut endpoint_tx = Some(endpoint_tx);

    while let Some(chunk_result) = stream.next().await {
        let Ok(chunk) = chunk_result else { break };

        for frame in parser.push(&String::from_utf8_lossy(&chunk)) {
            match frame.event.as_deref() {
                Some("endpoint") => {
                    if let Some(tx) = endpoint_tx.take() {
                        let _ = tx.send(frame.data);
                    }
                }
                Some("message") | None => {
                    let Ok(value) = serde_json::from_str::<Value>(&frame.data) else {
                        continue;
                    };
                    if let Some(id) = value.get("id").and_then(|v| v.as_u64()) {
                        let mut resp_map = responses.lock().await;
                        if let Some(sender) = resp_map.remove(&id) {
                            let _ = sender.send(value);
                        }
                    }
                    // Messages without a numeric id are server notifications;
                    // the gateway has no subscriber for them.
                }
                _ => {}
            }
        }
    }
}

/// One parsed SSE frame.
#[derive(Debug, Default, Clone, PartialEq)]
struct Frame {
    event: Option<String>,
    data: String,
}

/// Incremental SSE frame parser over text chunks.
#[derive(Default)]
struct FrameParser {
    buffer: String,
    current: Frame,
}

impl FrameParser {
    /// Feed a chunk, returning every frame completed by it.
    fn push(&mut self, text: &str) -> Vec<Frame> {
        self.buffer.push_str(text);
        let mut frames = Vec::new();

        while let Some(newline_pos) = self.buffer.find('\n') {
            let line: String = self.buffer.drain(..=newline_pos).collect();
            let trimmed = line.trim();

            if trimmed.is_empty() {
                if !self.current.data.is_empty() {
                    frames.push(std::mem::take(&mut self.current));
                } else {
                    self.current = Frame::default();
                }
                continue;
            }

            if let Some(rest) = trimmed.strip_prefix("event:") {
                self.current.event = Some(rest.trim().to_string());
            } else if let Some(rest) = trimmed.strip_prefix("data:") {
                self.current.data.push_str(rest.trim());
            }
            // Comment lines (": ping") and unknown fields are ignored.
        }

        frames
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_parser_single_frame() {
        let mut parser = FrameParser::default();
        let frames = parser.push("event: endpoint\ndata: /t/a/message?sessionId=abc\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("endpoint"));
        assert_eq!(frames[0].data, "/t/a/message?sessionId=abc");
    }

    #[test]
    fn test_frame_parser_split_across_chunks() {
        let mut parser = FrameParser::default();
        assert!(parser.push("event: mess").is_empty());
        assert!(parser.push("age\ndata: {\"id\":1}").is_empty());
        let frames = parser.push("\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("message"));
        assert_eq!(frames[0].data, "{\"id\":1}");
    }

    #[test]
    fn test_frame_parser_ignores_comments() {
        let mut parser = FrameParser::default();
        let frames = parser.push(": ping\n\nevent: heartbeat\ndata: ping\n\n");
        assert_eq!(frames.len(), 1);
        assert_eq!(frames[0].event.as_deref(), Some("heartbeat"));
    }

    #[test]
    fn test_resolve_endpoint_relative() {
        assert_eq!(
            resolve_endpoint("http://gw:8080/t/a/sse", "/t/a/message?sessionId=x"),
            "http://gw:8080/t/a/message?sessionId=x"
        );
    }

    #[test]
    fn test_resolve_endpoint_absolute() {
        assert_eq!(
            resolve_endpoint("http://gw:8080/t/a/sse", "http://other/m?sessionId=x"),
            "http://other/m?sessionId=x"
        );
    }
}
