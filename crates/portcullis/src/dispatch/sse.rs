//! Legacy SSE endpoint: `GET <prefix>/sse`.
//!
//! Registers a session, advertises the companion POST endpoint in the
//! first event, then pumps the session queue to the client with a
//! heartbeat on idle.

use axum::http::StatusCode;
use axum::response::sse::Event;
use axum::response::{IntoResponse, Response, Sse};
use mcpkit::ErrorCode;
use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use uuid::Uuid;

use super::{protocol_error, Gateway, RequestParts};
use crate::session::{Connection, Meta, SessionKind, Store};
use crate::state::State;

/// Reverse proxies commonly idle out at 30 s; stay under that.
pub(crate) const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(25);

pub(crate) async fn handle(
    gateway: Arc<Gateway>,
    state: Arc<State>,
    prefix: String,
    parts: RequestParts,
) -> Response {
    let session_id = Uuid::new_v4().to_string();
    let meta = Meta::new(
        session_id.clone(),
        prefix.clone(),
        SessionKind::Sse,
        parts.snapshot(),
    );

    tracing::info!(
        session_id = %session_id,
        prefix = %prefix,
        user_agent = %parts.header("user-agent"),
        "establishing SSE connection"
    );

    let conn = match gateway.sessions().register(meta).await {
        Ok(conn) => conn,
        Err(e) => {
            tracing::error!(session_id = %session_id, error = %e, "failed to register SSE session");
            return protocol_error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                "Failed to create SSE connection",
            );
        }
    };

    // Endpoint the client must POST JSON-RPC messages to, honoring the
    // router's external prefix for reverse-proxy deployments.
    let mut endpoint_url = format!("{prefix}/message?sessionId={session_id}");
    let sse_prefix = state.sse_prefix(&prefix);
    if !sse_prefix.is_empty() {
        endpoint_url = format!(
            "{}/{}",
            sse_prefix.trim_end_matches('/'),
            endpoint_url.trim_start_matches('/')
        );
    }

    let endpoint_event = Event::default().event("endpoint").data(endpoint_url);

    event_stream(
        gateway.sessions().clone(),
        conn,
        Some(endpoint_event),
        true,
    )
    .into_response()
}

/// Pump a session's event queue into an SSE response.
///
/// Emits `initial` first when given, then loops: next queued event, or a
/// heartbeat after 25 s of silence. When the client goes away (or the
/// queue closes) the session is unregistered if `unregister_on_close`.
pub(crate) fn event_stream(
    sessions: Arc<dyn Store>,
    conn: Arc<dyn Connection>,
    initial: Option<Event>,
    unregister_on_close: bool,
) -> Sse<ReceiverStream<Result<Event, Infallible>>> {
    let (tx, rx) = mpsc::channel::<Result<Event, Infallible>>(16);
    let session_id = conn.meta().id.clone();

    tokio::spawn(async move {
        if let Some(event) = initial {
            if tx.send(Ok(event)).await.is_err() {
                tracing::warn!(session_id = %session_id, "client gone before first event");
            } else {
                tracing::info!(session_id = %session_id, "SSE stream ready");
            }
        }

        loop {
            match tokio::time::timeout(HEARTBEAT_INTERVAL, conn.recv()).await {
                Ok(Some(message)) => {
                    tracing::debug!(
                        session_id = %session_id,
                        event = %message.event,
                        bytes = message.data.len(),
                        "forwarding event"
                    );
                    let event = Event::default().event(message.event).data(message.data);
                    if tx.send(Ok(event)).await.is_err() {
                        break;
                    }
                }
                Ok(None) => {
                    tracing::info!(session_id = %session_id, "session queue closed");
                    break;
                }
                Err(_) => {
                    let heartbeat = Event::default().event("heartbeat").data("ping");
                    if tx.send(Ok(heartbeat)).await.is_err() {
                        break;
                    }
                }
            }
        }

        if unregister_on_close {
            if let Err(e) = sessions.unregister(&session_id).await {
                tracing::debug!(session_id = %session_id, error = %e, "session already gone");
            } else {
                tracing::info!(session_id = %session_id, "SSE session cleaned up");
            }
        }
    });

    Sse::new(ReceiverStream::new(rx))
}
