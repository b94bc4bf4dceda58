//! Configuration reload fan-out.
//!
//! A notifier propagates config updates between gateway replicas. `watch`
//! hands back a bounded queue of updates; `notify` broadcasts one. The
//! payload is `None` for a bare reload signal ("refetch from source") or
//! `Some(config)` when the update carries the new config inline.
//!
//! Delivery is at-least-once at best: watcher queues are bounded at 10 and
//! overflow drops, because a stuck subscriber must not block cluster-wide
//! reload propagation.

mod api;
mod composite;
mod redis;
pub mod signal;

pub use api::ApiNotifier;
pub use composite::CompositeNotifier;
pub use redis::RedisNotifier;
pub use signal::SignalNotifier;

use async_trait::async_trait;
use gateconf::{NotifierConfig, NotifierRole, NotifierType};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use crate::config::McpConfig;

/// Per-watcher queue capacity.
pub const WATCH_QUEUE_CAPACITY: usize = 10;

/// An update received from the cluster: an inline config, or `None`
/// meaning "reload from source".
pub type Update = Option<McpConfig>;

/// Errors from the notifier layer.
#[derive(Debug, thiserror::Error)]
pub enum NotifierError {
    #[error("notifier is not configured to receive updates")]
    CannotReceive,

    #[error("notifier is not configured to send updates")]
    CannotSend,

    #[error("{0}")]
    Backend(String),
}

/// Propagates configuration updates across gateway replicas.
#[async_trait]
pub trait Notifier: Send + Sync {
    /// Subscribe to updates. Each call returns an independent queue.
    async fn watch(&self) -> Result<mpsc::Receiver<Update>, NotifierError>;

    /// Broadcast an update.
    async fn notify(&self, update: Update) -> Result<(), NotifierError>;

    /// Whether `notify` is permitted.
    fn can_send(&self) -> bool;

    /// Whether `watch` is permitted.
    fn can_receive(&self) -> bool;

    /// Release network and task resources. Watcher queues close.
    async fn close(&self);
}

/// Shared watcher registry used by every backend.
pub(crate) struct Watchers {
    senders: Mutex<Vec<mpsc::Sender<Update>>>,
}

impl Watchers {
    pub(crate) fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    /// Add a watcher and return its queue.
    pub(crate) async fn add(&self) -> mpsc::Receiver<Update> {
        let (tx, rx) = mpsc::channel(WATCH_QUEUE_CAPACITY);
        self.senders.lock().await.push(tx);
        rx
    }

    /// Fan an update out to every live watcher; overflow drops with a
    /// warning, closed watchers are pruned.
    pub(crate) async fn fan_out(&self, update: &Update) {
        let mut senders = self.senders.lock().await;
        senders.retain(|tx| match tx.try_send(update.clone()) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                tracing::warn!("watcher queue full, dropping update");
                true
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        });
    }

    /// Drop all watcher queues, closing their receivers.
    pub(crate) async fn clear(&self) {
        self.senders.lock().await.clear();
    }

    #[cfg(test)]
    pub(crate) async fn len(&self) -> usize {
        self.senders.lock().await.len()
    }
}

/// Role gating shared by every backend.
pub(crate) fn role_can_send(role: NotifierRole) -> bool {
    matches!(role, NotifierRole::Sender | NotifierRole::Both)
}

pub(crate) fn role_can_receive(role: NotifierRole) -> bool {
    matches!(role, NotifierRole::Receiver | NotifierRole::Both)
}

/// Build the notifier selected by configuration.
pub fn create_notifier(config: &NotifierConfig) -> Result<Arc<dyn Notifier>, NotifierError> {
    match config.kind {
        NotifierType::Redis => Ok(Arc::new(RedisNotifier::new(
            config.redis.clone(),
            config.role,
        ))),
        NotifierType::Api => Ok(Arc::new(ApiNotifier::new(config.api.clone(), config.role))),
        NotifierType::Signal => Ok(Arc::new(SignalNotifier::new(
            config.signal.clone(),
            config.role,
        ))),
    }
}
