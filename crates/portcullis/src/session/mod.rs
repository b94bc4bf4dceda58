//! Client session management.
//!
//! A session is a long-lived client context identified by a UUID. It carries
//! a snapshot of the request that established it (so tools can bind to auth
//! headers present only at session setup) and a bounded queue of outbound
//! SSE events with one consumer: the stream writer.

mod memory;
mod redis;

pub use memory::MemoryStore;
pub use redis::RedisStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gateconf::{SessionConfig, SessionStoreKind};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// Outbound queue capacity per session. Overflow drops the event.
pub const EVENT_QUEUE_CAPACITY: usize = 100;

/// Errors from the session layer.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("session not found: {0}")]
    NotFound(String),

    #[error("session already exists: {0}")]
    AlreadyExists(String),

    #[error("event queue is full")]
    QueueFull,

    #[error("connection is closed")]
    Closed,

    #[error("session store error: {0}")]
    Store(String),
}

/// Which wire transport established the session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionKind {
    Sse,
    Streamable,
}

/// Snapshot of the request that established a session.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RequestSnapshot {
    pub headers: HashMap<String, String>,
    pub queries: HashMap<String, String>,
    pub cookies: HashMap<String, String>,
}

/// Session metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Meta {
    pub id: String,
    pub created_at: DateTime<Utc>,
    pub prefix: String,
    #[serde(rename = "type")]
    pub kind: SessionKind,
    pub request: RequestSnapshot,
}

impl Meta {
    pub fn new(id: String, prefix: String, kind: SessionKind, request: RequestSnapshot) -> Self {
        Self {
            id,
            created_at: Utc::now(),
            prefix,
            kind,
            request,
        }
    }
}

/// One event destined for a session's stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub event: String,
    pub data: String,
}

impl Message {
    /// A `message` event carrying a JSON-RPC payload.
    pub fn rpc(data: impl Into<String>) -> Self {
        Self {
            event: "message".to_string(),
            data: data.into(),
        }
    }
}

/// Handle to a live session.
#[async_trait]
pub trait Connection: Send + Sync {
    /// Session metadata.
    fn meta(&self) -> &Meta;

    /// Receive the next queued event. Returns None when the session closes.
    /// Single consumer: the SSE writer for this session.
    async fn recv(&self) -> Option<Message>;

    /// Enqueue an event without blocking.
    async fn send(&self, message: Message) -> Result<(), SessionError>;

    /// Close the session's queue; subsequent sends fail.
    async fn close(&self);
}

/// Registry of live sessions.
#[async_trait]
pub trait Store: Send + Sync {
    /// Register a new session. Fails if the id already exists.
    async fn register(&self, meta: Meta) -> Result<Arc<dyn Connection>, SessionError>;

    /// Look up a session by id.
    async fn get(&self, id: &str) -> Result<Arc<dyn Connection>, SessionError>;

    /// Remove a session, closing its queue.
    async fn unregister(&self, id: &str) -> Result<(), SessionError>;

    /// All live sessions.
    async fn list(&self) -> Result<Vec<Arc<dyn Connection>>, SessionError>;
}

/// Build the configured session store.
pub async fn create_store(config: &SessionConfig) -> Result<Arc<dyn Store>, SessionError> {
    match config.store {
        SessionStoreKind::Memory => Ok(Arc::new(MemoryStore::new())),
        SessionStoreKind::Redis => {
            let store = RedisStore::connect(&config.redis).await?;
            Ok(Arc::new(store))
        }
    }
}
