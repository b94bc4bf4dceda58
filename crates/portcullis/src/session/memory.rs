//! In-memory session store.

use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

use super::{Connection, Message, Meta, SessionError, Store, EVENT_QUEUE_CAPACITY};

pub(super) struct MemoryConnection {
    meta: Meta,
    tx: mpsc::Sender<Message>,
    // Taken by the single consumer; None after close.
    rx: Mutex<Option<mpsc::Receiver<Message>>>,
    closed: AtomicBool,
}

impl MemoryConnection {
    pub(super) fn new(meta: Meta) -> Self {
        let (tx, rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        Self {
            meta,
            tx,
            rx: Mutex::new(Some(rx)),
            closed: AtomicBool::new(false),
        }
    }

    pub(super) fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Deliver without the closed-check error mapping; used by the Redis
    /// store's pub/sub listener where overflow is a drop, not an error.
    pub(super) fn try_deliver(&self, message: Message) -> Result<(), SessionError> {
        if self.is_closed() {
            return Err(SessionError::Closed);
        }
        self.tx.try_send(message).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => SessionError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => SessionError::Closed,
        })
    }
}

#[async_trait]
impl Connection for MemoryConnection {
    fn meta(&self) -> &Meta {
        &self.meta
    }

    async fn recv(&self) -> Option<Message> {
        let mut guard = self.rx.lock().await;
        match guard.as_mut() {
            Some(rx) => rx.recv().await,
            None => None,
        }
    }

    async fn send(&self, message: Message) -> Result<(), SessionError> {
        self.try_deliver(message)
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        // Dropping the receiver drains pending events and fails producers.
        self.rx.lock().await.take();
    }
}

/// In-memory session store. Reads dominate, so sessions live in a sharded
/// map; no I/O happens under its locks.
#[derive(Default)]
pub struct MemoryStore {
    conns: DashMap<String, Arc<MemoryConnection>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn register(&self, meta: Meta) -> Result<Arc<dyn Connection>, SessionError> {
        let id = meta.id.clone();
        let conn = Arc::new(MemoryConnection::new(meta));

        match self.conns.entry(id.clone()) {
            dashmap::mapref::entry::Entry::Occupied(_) => {
                Err(SessionError::AlreadyExists(id))
            }
            dashmap::mapref::entry::Entry::Vacant(entry) => {
                entry.insert(conn.clone());
                tracing::debug!(session_id = %id, "session registered");
                Ok(conn)
            }
        }
    }

    async fn get(&self, id: &str) -> Result<Arc<dyn Connection>, SessionError> {
        self.conns
            .get(id)
            .map(|entry| entry.value().clone() as Arc<dyn Connection>)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))
    }

    async fn unregister(&self, id: &str) -> Result<(), SessionError> {
        let (_, conn) = self
            .conns
            .remove(id)
            .ok_or_else(|| SessionError::NotFound(id.to_string()))?;
        conn.close().await;
        tracing::debug!(session_id = %id, "session unregistered");
        Ok(())
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Connection>>, SessionError> {
        Ok(self
            .conns
            .iter()
            .map(|entry| entry.value().clone() as Arc<dyn Connection>)
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::{RequestSnapshot, SessionKind};
    use chrono::Utc;

    fn meta(id: &str) -> Meta {
        Meta::new(
            id.to_string(),
            "/t/a".to_string(),
            SessionKind::Sse,
            RequestSnapshot::default(),
        )
    }

    #[tokio::test]
    async fn test_register_get_unregister() {
        let store = MemoryStore::new();
        let conn = store.register(meta("s1")).await.unwrap();
        assert!(conn.meta().created_at <= Utc::now());

        let fetched = store.get("s1").await.unwrap();
        assert_eq!(fetched.meta().id, "s1");
        assert_eq!(store.list().await.unwrap().len(), 1);

        store.unregister("s1").await.unwrap();
        assert!(matches!(
            store.get("s1").await,
            Err(SessionError::NotFound(_))
        ));
        assert!(store.list().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_register_duplicate_fails() {
        let store = MemoryStore::new();
        store.register(meta("dup")).await.unwrap();
        assert!(matches!(
            store.register(meta("dup")).await,
            Err(SessionError::AlreadyExists(_))
        ));
        // The original connection is untouched.
        assert_eq!(store.list().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_send_recv_in_order() {
        let store = MemoryStore::new();
        let conn = store.register(meta("s1")).await.unwrap();

        for i in 0..3 {
            conn.send(Message::rpc(format!("{{\"id\":{i}}}"))).await.unwrap();
        }
        for i in 0..3 {
            let msg = conn.recv().await.unwrap();
            assert_eq!(msg.event, "message");
            assert_eq!(msg.data, format!("{{\"id\":{i}}}"));
        }
    }

    #[tokio::test]
    async fn test_queue_full_is_nonfatal() {
        let store = MemoryStore::new();
        let conn = store.register(meta("s1")).await.unwrap();

        for _ in 0..EVENT_QUEUE_CAPACITY {
            conn.send(Message::rpc("{}")).await.unwrap();
        }
        assert!(matches!(
            conn.send(Message::rpc("{}")).await,
            Err(SessionError::QueueFull)
        ));

        // Still open: drain one slot and send again.
        assert!(conn.recv().await.is_some());
        conn.send(Message::rpc("{}")).await.unwrap();
    }

    #[tokio::test]
    async fn test_send_after_close_fails() {
        let store = MemoryStore::new();
        let conn = store.register(meta("s1")).await.unwrap();
        conn.close().await;
        assert!(matches!(
            conn.send(Message::rpc("{}")).await,
            Err(SessionError::Closed)
        ));
        assert!(conn.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_unregister_missing() {
        let store = MemoryStore::new();
        assert!(matches!(
            store.unregister("ghost").await,
            Err(SessionError::NotFound(_))
        ));
    }
}
