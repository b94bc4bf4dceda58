//! HTTP reload notifier.
//!
//! `notify` POSTs the config (or an empty body for the reload signal) to a
//! peer's `/_reload` endpoint. `watch` runs a loopback-only HTTP server
//! exposing `POST /_reload` and fans received updates out to watchers.

use async_trait::async_trait;
use axum::body::Bytes;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::post;
use axum::Json;
use gateconf::{NotifierApiConfig, NotifierRole};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{role_can_receive, role_can_send, Notifier, NotifierError, Update, Watchers};
use crate::config::McpConfig;

/// Notifier over HTTP `POST /_reload`.
pub struct ApiNotifier {
    config: NotifierApiConfig,
    role: NotifierRole,
    watchers: Arc<Watchers>,
    server: Mutex<Option<JoinHandle<()>>>,
    client: reqwest::Client,
}

impl ApiNotifier {
    pub fn new(config: NotifierApiConfig, role: NotifierRole) -> Self {
        Self {
            config,
            role,
            watchers: Arc::new(Watchers::new()),
            server: Mutex::new(None),
            client: reqwest::Client::new(),
        }
    }

    /// The peer's reload URL, normalizing a bare base URL.
    fn reload_url(&self) -> String {
        let target = self.config.target_url.trim_end_matches('/');
        if target.ends_with("/_reload") {
            target.to_string()
        } else {
            format!("{}/_reload", target)
        }
    }

    async fn ensure_server(&self) -> Result<(), NotifierError> {
        let mut server = self.server.lock().await;
        if server.is_some() {
            return Ok(());
        }

        // Loopback only: reloads from off-box travel over Redis or signals.
        let listener = tokio::net::TcpListener::bind(("127.0.0.1", self.config.port))
            .await
            .map_err(|e| NotifierError::Backend(format!("failed to bind reload listener: {e}")))?;

        tracing::info!(port = self.config.port, "reload endpoint listening");

        let app = axum::Router::new()
            .route("/_reload", post(reload_endpoint))
            .with_state(self.watchers.clone());

        *server = Some(tokio::spawn(async move {
            if let Err(e) = axum::serve(listener, app).await {
                tracing::error!(error = %e, "reload endpoint server failed");
            }
        }));

        Ok(())
    }
}

/// `POST /_reload`: an empty body is the reload signal, otherwise the body
/// must be a config document.
async fn reload_endpoint(
    State(watchers): State<Arc<Watchers>>,
    body: Bytes,
) -> impl IntoResponse {
    let update: Update = if body.is_empty() {
        tracing::info!("received reload signal");
        None
    } else {
        match serde_json::from_slice::<McpConfig>(&body) {
            Ok(config) => {
                tracing::info!(name = %config.name, "received config update");
                Some(config)
            }
            Err(e) => {
                tracing::error!(error = %e, "invalid reload body");
                return (
                    StatusCode::BAD_REQUEST,
                    Json(serde_json::json!({ "error": format!("Invalid request body: {e}") })),
                );
            }
        }
    };

    watchers.fan_out(&update).await;

    (
        StatusCode::OK,
        Json(serde_json::json!({ "status": "success", "message": "Reload triggered" })),
    )
}

#[async_trait]
impl Notifier for ApiNotifier {
    async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Update>, NotifierError> {
        if !self.can_receive() {
            return Err(NotifierError::CannotReceive);
        }
        let rx = self.watchers.add().await;
        self.ensure_server().await?;
        Ok(rx)
    }

    async fn notify(&self, update: Update) -> Result<(), NotifierError> {
        if !self.can_send() {
            return Err(NotifierError::CannotSend);
        }
        if self.config.target_url.is_empty() {
            return Err(NotifierError::Backend("target URL is not configured".into()));
        }

        let url = self.reload_url();
        let request = match &update {
            Some(config) => self.client.post(&url).json(config),
            None => self.client.post(&url),
        };

        let response = request
            .send()
            .await
            .map_err(|e| NotifierError::Backend(e.to_string()))?;

        if response.status() != reqwest::StatusCode::OK {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(NotifierError::Backend(format!(
                "unexpected status code: {status}, body: {body}"
            )));
        }

        tracing::info!(
            target = %url,
            name = update.as_ref().map(|c| c.name.as_str()).unwrap_or("reload_signal"),
            "sent reload notification"
        );
        Ok(())
    }

    fn can_send(&self) -> bool {
        role_can_send(self.role)
    }

    fn can_receive(&self) -> bool {
        role_can_receive(self.role)
    }

    async fn close(&self) {
        if let Some(server) = self.server.lock().await.take() {
            server.abort();
        }
        self.watchers.clear().await;
        tracing::info!("api notifier closed");
    }
}
