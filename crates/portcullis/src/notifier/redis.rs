//! Redis pub/sub notifier.
//!
//! `notify` publishes the config JSON on a channel, or an empty string for
//! the bare reload signal. One subscriber per notifier instance fans
//! incoming updates out to every local watcher queue.

use async_trait::async_trait;
use futures::StreamExt;
use gateconf::{ClusterType, NotifierRedisConfig, NotifierRole};
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{role_can_receive, role_can_send, Notifier, NotifierError, Update, Watchers};
use crate::config::McpConfig;

/// Notifier over a Redis pub/sub channel.
pub struct RedisNotifier {
    config: NotifierRedisConfig,
    role: NotifierRole,
    watchers: Arc<Watchers>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl RedisNotifier {
    pub fn new(config: NotifierRedisConfig, role: NotifierRole) -> Self {
        if config.redis.cluster_type != ClusterType::Single {
            tracing::warn!(
                cluster_type = ?config.redis.cluster_type,
                "notifier uses a single-node Redis client; connecting to the first address"
            );
        }
        Self {
            config,
            role,
            watchers: Arc::new(Watchers::new()),
            listener: Mutex::new(None),
        }
    }

    async fn ensure_listening(&self) -> Result<(), NotifierError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let client = redis::Client::open(self.config.redis.url())
            .map_err(|e| NotifierError::Backend(e.to_string()))?;
        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| NotifierError::Backend(e.to_string()))?;
        pubsub
            .subscribe(&self.config.topic)
            .await
            .map_err(|e| NotifierError::Backend(e.to_string()))?;

        tracing::info!(topic = %self.config.topic, "watching Redis for config updates");

        let watchers = self.watchers.clone();
        *listener = Some(tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let payload: String = match msg.get_payload() {
                    Ok(p) => p,
                    Err(e) => {
                        tracing::warn!(error = %e, "undecodable notifier payload");
                        continue;
                    }
                };
                let update = parse_payload(&payload);
                watchers.fan_out(&update).await;
            }
            tracing::info!("redis notifier subscriber stopped");
        }));

        Ok(())
    }
}

/// Empty payloads are the reload signal; anything else should be a config.
/// Malformed configs degrade to a reload signal rather than being lost.
fn parse_payload(payload: &str) -> Update {
    if payload.trim().is_empty() {
        return None;
    }
    match serde_json::from_str::<McpConfig>(payload) {
        Ok(config) => {
            tracing::debug!(name = %config.name, tenant = %config.tenant, "received config update");
            Some(config)
        }
        Err(e) => {
            tracing::warn!(error = %e, "malformed config payload, treating as reload signal");
            None
        }
    }
}

#[async_trait]
impl Notifier for RedisNotifier {
    async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Update>, NotifierError> {
        if !self.can_receive() {
            return Err(NotifierError::CannotReceive);
        }
        let rx = self.watchers.add().await;
        self.ensure_listening().await?;
        Ok(rx)
    }

    async fn notify(&self, update: Update) -> Result<(), NotifierError> {
        if !self.can_send() {
            return Err(NotifierError::CannotSend);
        }

        let payload = match &update {
            Some(config) => {
                serde_json::to_string(config).map_err(|e| NotifierError::Backend(e.to_string()))?
            }
            None => String::new(),
        };

        let client = redis::Client::open(self.config.redis.url())
            .map_err(|e| NotifierError::Backend(e.to_string()))?;
        let mut conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| NotifierError::Backend(e.to_string()))?;

        let _: () = redis::AsyncCommands::publish(&mut conn, &self.config.topic, payload)
            .await
            .map_err(|e| NotifierError::Backend(e.to_string()))?;

        tracing::info!(
            topic = %self.config.topic,
            name = update.as_ref().map(|c| c.name.as_str()).unwrap_or("reload_signal"),
            "published config update"
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
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.watchers.clear().await;
        tracing::info!("redis notifier closed");
    }
}
