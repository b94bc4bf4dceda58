//! SSE companion POST endpoint: `POST <prefix>/message?sessionId=<uuid>`.
//!
//! Decodes one JSON-RPC message, handles it, and returns 202 immediately;
//! the response payload travels as a `message` event on the paired SSE
//! stream.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use mcpkit::{ErrorCode, JsonRpcMessage, RequestId};
use std::sync::Arc;

use super::methods::{handle_rpc, RpcOutcome};
use super::{rpc_error, Gateway, RequestParts};
use crate::session::Message;
use crate::state::State;

pub(crate) async fn handle(
    gateway: Arc<Gateway>,
    state: Arc<State>,
    parts: RequestParts,
) -> Response {
    let Some(session_id) = parts.query.get("sessionId").filter(|s| !s.is_empty()) else {
        tracing::warn!("missing sessionId parameter");
        return rpc_error(
            StatusCode::BAD_REQUEST,
            None,
            ErrorCode::InvalidRequest,
            "Missing sessionId parameter",
        );
    };

    let conn = match gateway.sessions().get(session_id).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "session not found");
            return (
                StatusCode::NOT_FOUND,
                Json(serde_json::json!({ "error": "Session not found" })),
            )
                .into_response();
        }
    };

    if !parts.header("content-type").contains("application/json") {
        tracing::warn!(
            session_id = %session_id,
            content_type = %parts.header("content-type"),
            "invalid content type"
        );
        return rpc_error(
            StatusCode::UNSUPPORTED_MEDIA_TYPE,
            None,
            ErrorCode::InvalidRequest,
            "Unsupported Media Type: Content-Type must be application/json",
        );
    }

    let msg: JsonRpcMessage = match serde_json::from_slice(&parts.body) {
        Ok(msg) => msg,
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "invalid JSON-RPC message");
            return rpc_error(
                StatusCode::BAD_REQUEST,
                None,
                ErrorCode::ParseError,
                "Invalid message",
            );
        }
    };

    tracing::debug!(
        method = %msg.method,
        request_id = ?msg.id,
        session_id = %session_id,
        "processing message"
    );

    let current = parts.context();
    let outcome = handle_rpc(&gateway, &state, &conn, &msg, &current).await;

    match outcome {
        RpcOutcome::Accepted => StatusCode::ACCEPTED.into_response(),

        RpcOutcome::Result(result) => {
            // Clients that omit the id on initialize get "" back.
            let id = msg.id.clone().unwrap_or_else(RequestId::empty);
            let envelope = serde_json::json!({
                "jsonrpc": "2.0",
                "id": id,
                "result": result,
            });

            if let Err(e) = conn.send(Message::rpc(envelope.to_string())).await {
                tracing::warn!(
                    session_id = %conn.meta().id,
                    error = %e,
                    "failed to deliver response via SSE"
                );
            }

            StatusCode::ACCEPTED.into_response()
        }

        RpcOutcome::Error {
            status,
            code,
            message,
        } => rpc_error(status, msg.id.clone(), code, message),
    }
}
