//! Streamable-HTTP endpoint: `GET/POST/DELETE <prefix>/mcp`.
//!
//! POST carries JSON-RPC with responses in-band; `initialize` mints the
//! session and returns its id in the `Mcp-Session-Id` header. GET opens a
//! server-to-client event stream for an existing session. DELETE ends it.

use axum::http::{HeaderValue, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpkit::{ErrorCode, JsonRpcMessage, RequestId};
use std::sync::Arc;
use uuid::Uuid;

use super::methods::{handle_rpc, RpcOutcome, METHOD_INITIALIZE, METHOD_INITIALIZED};
use super::sse::event_stream;
use super::{rpc_error, Gateway, RequestParts};
use crate::session::{Connection, Meta, SessionKind};
use crate::state::State;

const SESSION_HEADER: &str = "mcp-session-id";

pub(crate) async fn handle(
    gateway: Arc<Gateway>,
    state: Arc<State>,
    prefix: String,
    parts: RequestParts,
) -> Response {
    let method = parts.method.clone();
    if method == Method::OPTIONS {
        StatusCode::OK.into_response()
    } else if method == Method::GET {
        handle_get(gateway, parts).await
    } else if method == Method::POST {
        handle_post(gateway, state, prefix, parts).await
    } else if method == Method::DELETE {
        handle_delete(gateway, parts).await
    } else {
        let mut response = rpc_error(
            StatusCode::METHOD_NOT_ALLOWED,
            None,
            ErrorCode::ConnectionClosed,
            "Method not allowed",
        );
        response
            .headers_mut()
            .insert("allow", HeaderValue::from_static("GET, POST, DELETE"));
        response
    }
}

/// Session addressed by the `Mcp-Session-Id` header.
async fn get_session(
    gateway: &Arc<Gateway>,
    parts: &RequestParts,
) -> Option<Arc<dyn Connection>> {
    let session_id = parts.header(SESSION_HEADER);
    if session_id.is_empty() {
        tracing::warn!("missing Mcp-Session-Id header");
        return None;
    }
    match gateway.sessions().get(session_id).await {
        Ok(conn) => Some(conn),
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "session not found");
            None
        }
    }
}

fn session_not_found() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({ "error": "Session not found" })),
    )
        .into_response()
}

/// GET: open the server-to-client stream for an existing session.
async fn handle_get(gateway: Arc<Gateway>, parts: RequestParts) -> Response {
    if !accepts(&parts, "text/event-stream") {
        return rpc_error(
            StatusCode::NOT_ACCEPTABLE,
            None,
            ErrorCode::InvalidRequest,
            "Not Acceptable: Client must accept text/event-stream",
        );
    }

    let Some(conn) = get_session(&gateway, &parts).await else {
        return session_not_found();
    };

    let session_id = conn.meta().id.clone();

    // Same pump as the legacy stream, minus the endpoint event. The
    // session outlives this stream; DELETE ends it.
    let mut response = event_stream(gateway.sessions().clone(), conn, None, false).into_response();
    if let Ok(value) = HeaderValue::from_str(&session_id) {
        response.headers_mut().insert(SESSION_HEADER, value);
    }
    response
}

/// POST: one JSON-RPC message, response in-band.
async fn handle_post(
    gateway: Arc<Gateway>,
    state: Arc<State>,
    prefix: String,
    parts: RequestParts,
) -> Response {
    if !accepts(&parts, "application/json") || !accepts(&parts, "text/event-stream") {
        return rpc_error(
            StatusCode::NOT_ACCEPTABLE,
            None,
            ErrorCode::ConnectionClosed,
            "Not Acceptable: Client must accept both application/json and text/event-stream",
        );
    }

    if !parts.header("content-type").contains("application/json") {
        return rpc_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            None,
            ErrorCode::ConnectionClosed,
            "Unsupported Media Type: Content-Type must be application/json",
        );
    }

    let msg: JsonRpcMessage = match serde_json::from_slice(&parts.body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(error = %e, "invalid JSON-RPC request");
            return rpc_error(
                StatusCode::BAD_REQUEST,
                None,
                ErrorCode::ParseError,
                "Invalid JSON-RPC request",
            );
        }
    };

    // Session state machine: initialize mints a session; everything else
    // requires a live one.
    let header_session_id = parts.header(SESSION_HEADER).to_string();
    let mut minted_session_id = None;

    let conn = if msg.method == METHOD_INITIALIZE {
        if !header_session_id.is_empty()
            && gateway.sessions().get(&header_session_id).await.is_ok()
        {
            return rpc_error(
                StatusCode::BAD_REQUEST,
                msg.id.clone(),
                ErrorCode::InvalidRequest,
                "Invalid Request: Server already initialized",
            );
        }

        let session_id = Uuid::new_v4().to_string();
        let meta = Meta::new(
            session_id.clone(),
            prefix.clone(),
            SessionKind::Streamable,
            parts.snapshot(),
        );

        match gateway.sessions().register(meta).await {
            Ok(conn) => {
                tracing::info!(session_id = %session_id, prefix = %prefix, "streamable session created");
                minted_session_id = Some(session_id);
                conn
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to create session");
                return rpc_error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    msg.id.clone(),
                    ErrorCode::InternalError,
                    "Failed to create session",
                );
            }
        }
    } else {
        match gateway.sessions().get(&header_session_id).await {
            Ok(conn) if !header_session_id.is_empty() => conn,
            _ => {
                return rpc_error(
                    StatusCode::NOT_FOUND,
                    msg.id.clone(),
                    ErrorCode::RequestTimeout,
                    "Session not found",
                );
            }
        }
    };

    let current = parts.context();
    let outcome = handle_rpc(&gateway, &state, &conn, &msg, &current).await;

    let mut response = match outcome {
        RpcOutcome::Accepted => {
            debug_assert!(msg.method == METHOD_INITIALIZED || msg.is_notification());
            StatusCode::ACCEPTED.into_response()
        }

        RpcOutcome::Result(result) => {
            let id = msg.id.clone().unwrap_or_else(RequestId::empty);
            let envelope = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            });
            (StatusCode::OK, Json(envelope)).into_response()
        }

        RpcOutcome::Error {
            status,
            code,
            message,
        } => rpc_error(status, msg.id.clone(), code, message),
    };

    if let Some(session_id) = minted_session_id {
        if let Ok(value) = HeaderValue::from_str(&session_id) {
            response.headers_mut().insert(SESSION_HEADER, value);
        }
    }

    response
}

/// DELETE: terminate the session.
async fn handle_delete(gateway: Arc<Gateway>, parts: RequestParts) -> Response {
    let Some(conn) = get_session(&gateway, &parts).await else {
        return session_not_found();
    };

    let session_id = conn.meta().id.clone();
    match gateway.sessions().unregister(&session_id).await {
        Ok(()) => {
            tracing::info!(session_id = %session_id, "session terminated");
            StatusCode::OK.into_response()
        }
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "failed to terminate session");
            rpc_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                None,
                ErrorCode::InternalError,
                "Failed to terminate session",
            )
        }
    }
}

/// Accept-header check; `*/*` satisfies anything.
fn accepts(parts: &RequestParts, content_type: &str) -> bool {
    let accept = parts.header("accept");
    accept.contains(content_type) || accept.contains("*/*")
}
