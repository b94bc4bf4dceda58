//! HTTP front door.
//!
//! Every request lands on one wildcard handler: the path splits into a
//! routing prefix and an endpoint (`sse`, `message`, or `mcp`), the prefix
//! resolves against the current state snapshot, and the endpoint handlers
//! take over. Prefixes are config-defined, so routing happens here rather
//! than in axum's router.

mod mcp;
mod message;
mod methods;
mod sse;

use axum::body::Bytes;
use axum::extract::{Request, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpkit::{ErrorCode, ErrorData, JsonRpcErrorResponse, RequestId};
use std::collections::HashMap;
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::config::Cors;
use crate::loader::StateLoader;
use crate::session::{RequestSnapshot, Store};
use crate::state::State as GatewayState;
use crate::template::RequestContext;

/// Shared dispatcher state.
pub struct Gateway {
    sessions: Arc<dyn Store>,
    loader: Arc<StateLoader>,
}

impl Gateway {
    pub fn new(sessions: Arc<dyn Store>, loader: Arc<StateLoader>) -> Arc<Self> {
        Arc::new(Self { sessions, loader })
    }

    /// Current state snapshot; one load per request.
    pub fn state(&self) -> Arc<GatewayState> {
        self.loader.current()
    }

    pub fn sessions(&self) -> &Arc<dyn Store> {
        &self.sessions
    }
}

/// Build the axum router for the gateway.
pub fn router(gateway: Arc<Gateway>) -> axum::Router {
    axum::Router::new()
        .fallback(handle_root)
        .layer(TraceLayer::new_for_http())
        .with_state(gateway)
}

/// Decomposed request pieces shared by the endpoint handlers.
pub(crate) struct RequestParts {
    pub method: Method,
    pub headers: HeaderMap,
    pub query: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
    pub body: Bytes,
}

impl RequestParts {
    /// Header value as a string, empty when absent.
    pub fn header(&self, name: &str) -> &str {
        self.headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
    }

    /// Snapshot captured into session metadata.
    pub fn snapshot(&self) -> RequestSnapshot {
        RequestSnapshot {
            headers: header_map(&self.headers),
            queries: self.query.clone(),
            cookies: self.cookies.clone(),
        }
    }

    /// Template-visible view of this request.
    pub fn context(&self) -> RequestContext {
        RequestContext {
            headers: header_map(&self.headers),
            query: self.query.clone(),
            cookies: self.cookies.clone(),
            path: HashMap::new(),
            body: serde_json::from_slice(&self.body).unwrap_or(serde_json::Value::Null),
        }
    }
}

fn header_map(headers: &HeaderMap) -> HashMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            value
                .to_str()
                .ok()
                .map(|v| (name.as_str().to_string(), v.to_string()))
        })
        .collect()
}

#[tracing::instrument(skip_all, fields(path = %req.uri().path(), method = %req.method()))]
async fn handle_root(State(gateway): State<Arc<Gateway>>, req: Request) -> Response {
    let path = req.uri().path().to_string();
    let query = parse_query(req.uri().query().unwrap_or(""));

    let (head, body) = req.into_parts();
    let body = match axum::body::to_bytes(body, 4 * 1024 * 1024).await {
        Ok(bytes) => bytes,
        Err(_) => {
            return protocol_error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidRequest,
                "Failed to read request body",
            );
        }
    };

    let cookies = parse_cookies(
        head.headers
            .get(axum::http::header::COOKIE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or(""),
    );

    let parts = RequestParts {
        method: head.method,
        headers: head.headers,
        query,
        cookies,
        body,
    };

    // Path -> (prefix, endpoint). At least two segments.
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.len() < 2 {
        tracing::debug!(path = %path, "invalid path format");
        return protocol_error(
            StatusCode::BAD_REQUEST,
            ErrorCode::InvalidRequest,
            "Invalid path",
        );
    }

    let endpoint = segments[segments.len() - 1];
    let prefix = format!("/{}", segments[..segments.len() - 1].join("/"));

    let state = gateway.state();
    let Some(runtime) = state.runtime(&prefix) else {
        tracing::warn!(prefix = %prefix, "invalid prefix");
        return protocol_error(
            StatusCode::NOT_FOUND,
            ErrorCode::InvalidRequest,
            "Invalid prefix",
        );
    };

    // Auth hook: extension point, pass-through in the core.
    if let Some(response) = check_auth(&parts, &prefix) {
        return response;
    }

    let cors = runtime.router.cors.clone();

    let response = match endpoint {
        "sse" => {
            if parts.method != Method::GET {
                method_not_allowed("GET")
            } else {
                sse::handle(gateway.clone(), state.clone(), prefix.clone(), parts).await
            }
        }
        "message" => {
            if parts.method != Method::POST {
                method_not_allowed("POST")
            } else {
                message::handle(gateway.clone(), state.clone(), parts).await
            }
        }
        "mcp" => mcp::handle(gateway.clone(), state.clone(), prefix.clone(), parts).await,
        other => {
            tracing::warn!(endpoint = %other, prefix = %prefix, "invalid endpoint");
            protocol_error(
                StatusCode::NOT_FOUND,
                ErrorCode::InvalidRequest,
                "Invalid endpoint",
            )
        }
    };

    apply_cors(response, cors.as_ref())
}

/// Auth extension point; the core supplies a pass-through.
fn check_auth(_parts: &RequestParts, _prefix: &str) -> Option<Response> {
    None
}

/// Apply the router's CORS policy to the outgoing response.
fn apply_cors(mut response: Response, cors: Option<&Cors>) -> Response {
    let Some(cors) = cors else {
        return response;
    };

    let headers = response.headers_mut();
    let insert = |headers: &mut HeaderMap, name: &'static str, value: String| {
        if !value.is_empty() {
            if let Ok(value) = value.parse() {
                headers.insert(name, value);
            }
        }
    };

    insert(
        headers,
        "access-control-allow-origin",
        cors.allow_origins.join(", "),
    );
    insert(
        headers,
        "access-control-allow-methods",
        cors.allow_methods.join(", "),
    );
    insert(
        headers,
        "access-control-allow-headers",
        cors.allow_headers.join(", "),
    );
    insert(
        headers,
        "access-control-expose-headers",
        cors.expose_headers.join(", "),
    );
    if cors.allow_credentials {
        insert(
            headers,
            "access-control-allow-credentials",
            "true".to_string(),
        );
    }

    response
}

/// Bare protocol error: `{"error": {"code", "message"}}`.
pub(crate) fn protocol_error(status: StatusCode, code: ErrorCode, message: &str) -> Response {
    (
        status,
        Json(serde_json::json!({ "error": { "code": code, "message": message } })),
    )
        .into_response()
}

/// JSON-RPC error envelope with the request id when known.
pub(crate) fn rpc_error(
    status: StatusCode,
    id: Option<RequestId>,
    code: ErrorCode,
    message: impl Into<String>,
) -> Response {
    let envelope = JsonRpcErrorResponse::new(id, ErrorData::new(code, message));
    (status, Json(envelope)).into_response()
}

pub(crate) fn method_not_allowed(allow: &str) -> Response {
    let mut response = rpc_error(
        StatusCode::METHOD_NOT_ALLOWED,
        None,
        ErrorCode::ConnectionClosed,
        "Method not allowed",
    );
    if let Ok(value) = allow.parse() {
        response.headers_mut().insert("allow", value);
    }
    response
}

/// Minimal query-string parser with percent decoding.
fn parse_query(query: &str) -> HashMap<String, String> {
    query
        .split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| match pair.split_once('=') {
            Some((k, v)) => (percent_decode(k), percent_decode(v)),
            None => (percent_decode(pair), String::new()),
        })
        .collect()
}

fn parse_cookies(header: &str) -> HashMap<String, String> {
    header
        .split(';')
        .filter_map(|pair| pair.trim().split_once('='))
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'%' if i + 3 <= bytes.len() => {
                let hex = bytes.get(i + 1..i + 3);
                match hex.and_then(|h| u8::from_str_radix(std::str::from_utf8(h).ok()?, 16).ok()) {
                    Some(byte) => {
                        out.push(byte);
                        i += 3;
                    }
                    None => {
                        out.push(b'%');
                        i += 1;
                    }
                }
            }
            b'+' => {
                out.push(b' ');
                i += 1;
            }
            other => {
                out.push(other);
                i += 1;
            }
        }
    }
    String::from_utf8_lossy(&out).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_query() {
        let query = parse_query("sessionId=abc-123&flag&name=hello%20world");
        assert_eq!(query["sessionId"], "abc-123");
        assert_eq!(query["flag"], "");
        assert_eq!(query["name"], "hello world");
        assert!(parse_query("").is_empty());
    }

    #[test]
    fn test_parse_cookies() {
        let cookies = parse_cookies("a=1; session=xyz; b=2");
        assert_eq!(cookies["a"], "1");
        assert_eq!(cookies["session"], "xyz");
        assert!(parse_cookies("").is_empty());
    }

    #[test]
    fn test_percent_decode() {
        assert_eq!(percent_decode("a%2Fb+c"), "a/b c");
        assert_eq!(percent_decode("plain"), "plain");
        // Truncated escapes pass through.
        assert_eq!(percent_decode("%2"), "%2");
        assert_eq!(percent_decode("%zz"), "%zz");
    }
}
