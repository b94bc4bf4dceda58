//! JSON-RPC method table.
//!
//! Shared by the SSE companion POST endpoint and the Streamable-HTTP
//! endpoint; the caller decides whether the outcome travels in-band or as
//! an SSE `message` event.

use axum::http::StatusCode;
use mcpkit::{
    CallToolParams, ErrorCode, Implementation, InitializeParams, InitializeResult,
    JsonRpcMessage, ListToolsResult, ServerCapabilities,
};
use serde_json::Value;
use std::sync::Arc;

use super::Gateway;
use crate::session::Connection;
use crate::state::{BackendProto, State};
use crate::template::RequestContext;

pub(crate) const METHOD_INITIALIZE: &str = "initialize";
pub(crate) const METHOD_INITIALIZED: &str = "notifications/initialized";
pub(crate) const METHOD_PING: &str = "ping";
pub(crate) const METHOD_TOOLS_LIST: &str = "tools/list";
pub(crate) const METHOD_TOOLS_CALL: &str = "tools/call";

/// Outcome of handling one JSON-RPC message.
pub(crate) enum RpcOutcome {
    /// A result payload for the request's id.
    Result(Value),
    /// Notification accepted; 202, no body.
    Accepted,
    /// Protocol failure with its HTTP status.
    Error {
        status: StatusCode,
        code: ErrorCode,
        message: String,
    },
}

impl RpcOutcome {
    fn error(status: StatusCode, code: ErrorCode, message: impl Into<String>) -> Self {
        RpcOutcome::Error {
            status,
            code,
            message: message.into(),
        }
    }
}

/// Handle one decoded JSON-RPC message for an established session.
pub(crate) async fn handle_rpc(
    _gateway: &Arc<Gateway>,
    state: &State,
    conn: &Arc<dyn Connection>,
    msg: &JsonRpcMessage,
    current: &RequestContext,
) -> RpcOutcome {
    match msg.method.as_str() {
        METHOD_INITIALIZED => RpcOutcome::Accepted,

        METHOD_INITIALIZE => handle_initialize(msg),

        METHOD_PING => RpcOutcome::Result(serde_json::json!({})),

        METHOD_TOOLS_LIST => handle_tools_list(state, conn).await,

        METHOD_TOOLS_CALL => handle_tools_call(state, conn, msg, current).await,

        other => {
            tracing::warn!(method = %other, session_id = %conn.meta().id, "unknown method");
            RpcOutcome::error(
                StatusCode::NOT_FOUND,
                ErrorCode::MethodNotFound,
                "Method not found",
            )
        }
    }
}

fn handle_initialize(msg: &JsonRpcMessage) -> RpcOutcome {
    // Lenient parse: absent params and absent fields all default.
    let params: InitializeParams = match &msg.params {
        Some(params) => match serde_json::from_value(params.clone()) {
            Ok(params) => params,
            Err(e) => {
                return RpcOutcome::error(
                    StatusCode::BAD_REQUEST,
                    ErrorCode::InvalidParams,
                    format!("Invalid initialize parameters: {e}"),
                );
            }
        },
        None => InitializeParams::default(),
    };

    if let Some(client) = &params.client_info {
        tracing::info!(client = %client.name, version = %client.version, "client initialized");
    }

    let result = InitializeResult::new(
        Implementation::new("portcullis", env!("CARGO_PKG_VERSION")),
        ServerCapabilities::tools_only(),
    );

    match serde_json::to_value(&result) {
        Ok(value) => RpcOutcome::Result(value),
        Err(e) => RpcOutcome::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            e.to_string(),
        ),
    }
}

async fn handle_tools_list(state: &State, conn: &Arc<dyn Connection>) -> RpcOutcome {
    let prefix = &conn.meta().prefix;
    let Some(runtime) = state.runtime(prefix) else {
        return RpcOutcome::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            "Server configuration not found",
        );
    };

    // http runtimes answer from the precomputed schemas; MCP backends are
    // asked live.
    let tools = if runtime.backend_proto == BackendProto::Http {
        runtime.tools_schema.clone()
    } else {
        let Some(transport) = &runtime.transport else {
            return RpcOutcome::error(
                StatusCode::INTERNAL_SERVER_ERROR,
                ErrorCode::InternalError,
                "Failed to fetch tools",
            );
        };
        match transport.list_tools().await {
            Ok(tools) => tools,
            Err(e) => {
                tracing::error!(prefix = %prefix, error = %e, "failed to fetch tools");
                return RpcOutcome::error(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    ErrorCode::InternalError,
                    "Failed to fetch tools",
                );
            }
        }
    };

    match serde_json::to_value(ListToolsResult::all(tools)) {
        Ok(value) => RpcOutcome::Result(value),
        Err(e) => RpcOutcome::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            e.to_string(),
        ),
    }
}

async fn handle_tools_call(
    state: &State,
    conn: &Arc<dyn Connection>,
    msg: &JsonRpcMessage,
    current: &RequestContext,
) -> RpcOutcome {
    let prefix = &conn.meta().prefix;
    let Some(runtime) = state.runtime(prefix) else {
        return RpcOutcome::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            "Server configuration not found",
        );
    };

    let params: CallToolParams = match msg
        .params
        .clone()
        .map(serde_json::from_value::<CallToolParams>)
        .transpose()
    {
        Ok(Some(params)) if !params.name.is_empty() => params,
        Ok(_) => {
            return RpcOutcome::error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidParams,
                "Invalid tool call parameters: missing tool name",
            );
        }
        Err(e) => {
            return RpcOutcome::error(
                StatusCode::BAD_REQUEST,
                ErrorCode::InvalidParams,
                format!("Invalid tool call parameters: {e}"),
            );
        }
    };

    let Some(transport) = &runtime.transport else {
        return RpcOutcome::error(
            StatusCode::NOT_FOUND,
            ErrorCode::MethodNotFound,
            "Server configuration not found",
        );
    };

    tracing::info!(
        tool = %params.name,
        session_id = %conn.meta().id,
        prefix = %prefix,
        "invoking tool"
    );

    // Session-capture merged with the live request; the live request wins.
    let session_ctx = RequestContext {
        headers: conn.meta().request.headers.clone(),
        query: conn.meta().request.queries.clone(),
        cookies: conn.meta().request.cookies.clone(),
        path: Default::default(),
        body: Value::Null,
    };
    let merged = session_ctx.merge(current);

    // Tool failures come back as isError results, never JSON-RPC errors.
    let result = transport.call_tool(params, &merged).await;

    match serde_json::to_value(&result) {
        Ok(value) => RpcOutcome::Result(value),
        Err(e) => RpcOutcome::error(
            StatusCode::INTERNAL_SERVER_ERROR,
            ErrorCode::InternalError,
            e.to_string(),
        ),
    }
}
