//! Redis-backed session store.
//!
//! Metadata is authoritative in Redis: key `<prefix>:<id>` holds the JSON
//! `Meta` with a TTL, and the set `<prefix>:ids` enumerates live sessions
//! with its TTL refreshed in lockstep. Events fan out across replicas over
//! a pub/sub channel; each store instance runs one subscriber that delivers
//! into locally registered queues.

use async_trait::async_trait;
use dashmap::DashMap;
use futures::StreamExt;
use gateconf::{ClusterType, SessionRedisConfig};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::task::JoinHandle;

use super::memory::MemoryConnection;
use super::{Connection, Message, Meta, SessionError, Store};

#[derive(Debug, Serialize, Deserialize)]
struct Envelope {
    action: String,
    meta: Meta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    message: Option<Message>,
}

struct Shared {
    conn: redis::aio::MultiplexedConnection,
    locals: DashMap<String, Arc<MemoryConnection>>,
    prefix: String,
    topic: String,
    ttl_secs: u64,
}

impl Shared {
    fn session_key(&self, id: &str) -> String {
        format!("{}:{}", self.prefix, id)
    }

    fn ids_key(&self) -> String {
        format!("{}:ids", self.prefix)
    }

    async fn renew_ttl(&self, id: &str) {
        let mut conn = self.conn.clone();
        let ttl = self.ttl_secs as i64;
        let result: redis::RedisResult<()> = async {
            let _: bool = conn.expire(self.session_key(id), ttl).await?;
            let _: bool = conn.expire(self.ids_key(), ttl).await?;
            Ok(())
        }
        .await;
        if let Err(e) = result {
            tracing::warn!(session_id = %id, error = %e, "failed to renew session TTL");
        }
    }

    async fn publish(&self, envelope: &Envelope) -> Result<(), SessionError> {
        let payload =
            serde_json::to_string(envelope).map_err(|e| SessionError::Store(e.to_string()))?;
        let mut conn = self.conn.clone();
        let _: () = conn
            .publish(&self.topic, payload)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        Ok(())
    }
}

struct RedisConnection {
    shared: Arc<Shared>,
    // Local queue; shared with the subscriber's delivery map when this
    // handle came from register().
    local: Arc<MemoryConnection>,
}

#[async_trait]
impl Connection for RedisConnection {
    fn meta(&self) -> &Meta {
        self.local.meta()
    }

    async fn recv(&self) -> Option<Message> {
        self.local.recv().await
    }

    async fn send(&self, message: Message) -> Result<(), SessionError> {
        if self.local.is_closed() {
            return Err(SessionError::Closed);
        }
        self.shared.renew_ttl(&self.meta().id).await;
        self.shared
            .publish(&Envelope {
                action: "event".to_string(),
                meta: self.meta().clone(),
                message: Some(message),
            })
            .await
    }

    async fn close(&self) {
        self.local.close().await;
    }
}

/// Redis session store.
pub struct RedisStore {
    shared: Arc<Shared>,
    listener: JoinHandle<()>,
}

impl RedisStore {
    /// Connect to Redis and start the cross-replica event subscriber.
    pub async fn connect(config: &SessionRedisConfig) -> Result<Self, SessionError> {
        if config.redis.cluster_type != ClusterType::Single {
            tracing::warn!(
                cluster_type = ?config.redis.cluster_type,
                "session store uses a single-node Redis client; connecting to the first address"
            );
        }

        let client = redis::Client::open(config.redis.url())
            .map_err(|e| SessionError::Store(e.to_string()))?;
        let conn = client
            .get_multiplexed_async_connection()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let shared = Arc::new(Shared {
            conn,
            locals: DashMap::new(),
            prefix: config.prefix.clone(),
            topic: config.topic.clone(),
            ttl_secs: config.ttl_secs,
        });

        let mut pubsub = client
            .get_async_pubsub()
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        pubsub
            .subscribe(&config.topic)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let listener = tokio::spawn(handle_updates(pubsub, shared.clone()));

        tracing::info!(topic = %config.topic, prefix = %config.prefix, "redis session store connected");

        Ok(Self { shared, listener })
    }

    /// Stop the subscriber task.
    pub fn close(&self) {
        self.listener.abort();
    }
}

impl Drop for RedisStore {
    fn drop(&mut self) {
        self.listener.abort();
    }
}

/// Deliver pub/sub envelopes into locally registered session queues.
async fn handle_updates(mut pubsub: redis::aio::PubSub, shared: Arc<Shared>) {
    let mut stream = pubsub.on_message();
    while let Some(msg) = stream.next().await {
        let payload: String = match msg.get_payload() {
            Ok(p) => p,
            Err(e) => {
                tracing::warn!(error = %e, "undecodable session update payload");
                continue;
            }
        };

        let envelope: Envelope = match serde_json::from_str(&payload) {
            Ok(e) => e,
            Err(e) => {
                tracing::warn!(error = %e, "malformed session update envelope");
                continue;
            }
        };

        match envelope.action.as_str() {
            "event" => {
                let Some(message) = envelope.message else {
                    continue;
                };
                let id = envelope.meta.id;
                if let Some(local) = shared.locals.get(&id) {
                    match local.try_deliver(message) {
                        Ok(()) => {}
                        Err(SessionError::QueueFull) => {
                            tracing::warn!(session_id = %id, "session queue full, dropping event");
                        }
                        Err(_) => {
                            tracing::debug!(session_id = %id, "event for closed local session");
                        }
                    }
                }
                // No local handle: another replica owns the stream.
            }
            "create" | "delete" => {
                tracing::debug!(
                    action = %envelope.action,
                    session_id = %envelope.meta.id,
                    "session lifecycle update"
                );
            }
            other => {
                tracing::debug!(action = %other, "unknown session update action");
            }
        }
    }
    tracing::info!("session update subscriber stopped");
}

#[async_trait]
impl Store for RedisStore {
    async fn register(&self, meta: Meta) -> Result<Arc<dyn Connection>, SessionError> {
        let data =
            serde_json::to_string(&meta).map_err(|e| SessionError::Store(e.to_string()))?;
        let mut conn = self.shared.conn.clone();

        let session_key = self.shared.session_key(&meta.id);
        let ids_key = self.shared.ids_key();
        let ttl = self.shared.ttl_secs;

        let result: redis::RedisResult<()> = async {
            let _: () = conn.set_ex(&session_key, data, ttl).await?;
            let _: () = conn.sadd(&ids_key, &meta.id).await?;
            let _: bool = conn.expire(&ids_key, ttl as i64).await?;
            Ok(())
        }
        .await;
        result.map_err(|e| SessionError::Store(e.to_string()))?;

        let local = Arc::new(MemoryConnection::new(meta.clone()));
        self.shared.locals.insert(meta.id.clone(), local.clone());

        let conn = Arc::new(RedisConnection {
            shared: self.shared.clone(),
            local,
        });

        // Lifecycle event for observability; Redis state is authoritative.
        if let Err(e) = self
            .shared
            .publish(&Envelope {
                action: "create".to_string(),
                meta,
                message: None,
            })
            .await
        {
            tracing::warn!(error = %e, "failed to publish session create");
        }

        Ok(conn)
    }

    async fn get(&self, id: &str) -> Result<Arc<dyn Connection>, SessionError> {
        // A handle registered on this replica carries the live queue.
        if let Some(local) = self.shared.locals.get(id) {
            let local = local.value().clone();
            self.shared.renew_ttl(id).await;
            return Ok(Arc::new(RedisConnection {
                shared: self.shared.clone(),
                local,
            }));
        }

        let mut conn = self.shared.conn.clone();
        let member: bool = conn
            .sismember(self.shared.ids_key(), id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        if !member {
            return Err(SessionError::NotFound(id.to_string()));
        }

        let data: Option<String> = conn
            .get(self.shared.session_key(id))
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        let data = data.ok_or_else(|| SessionError::NotFound(id.to_string()))?;

        self.shared.renew_ttl(id).await;

        let meta: Meta =
            serde_json::from_str(&data).map_err(|e| SessionError::Store(e.to_string()))?;

        // Detached handle: send publishes, recv only delivers if this
        // replica later hosts the stream.
        Ok(Arc::new(RedisConnection {
            shared: self.shared.clone(),
            local: Arc::new(MemoryConnection::new(meta)),
        }))
    }

    async fn unregister(&self, id: &str) -> Result<(), SessionError> {
        if let Some((_, local)) = self.shared.locals.remove(id) {
            local.close().await;
        }

        let mut conn = self.shared.conn.clone();
        let member: bool = conn
            .sismember(self.shared.ids_key(), id)
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;
        if !member {
            return Err(SessionError::NotFound(id.to_string()));
        }

        let result: redis::RedisResult<()> = async {
            let _: () = conn.del(self.shared.session_key(id)).await?;
            let _: () = conn.srem(self.shared.ids_key(), id).await?;
            Ok(())
        }
        .await;
        result.map_err(|e| SessionError::Store(e.to_string()))?;

        let meta = Meta::new(
            id.to_string(),
            String::new(),
            super::SessionKind::Streamable,
            super::RequestSnapshot::default(),
        );
        if let Err(e) = self
            .shared
            .publish(&Envelope {
                action: "delete".to_string(),
                meta,
                message: None,
            })
            .await
        {
            tracing::warn!(error = %e, "failed to publish session delete");
        }

        Ok(())
    }

    async fn list(&self) -> Result<Vec<Arc<dyn Connection>>, SessionError> {
        let mut conn = self.shared.conn.clone();
        let ids: Vec<String> = conn
            .smembers(self.shared.ids_key())
            .await
            .map_err(|e| SessionError::Store(e.to_string()))?;

        let mut sessions: Vec<Arc<dyn Connection>> = Vec::with_capacity(ids.len());
        for id in ids {
            match self.get(&id).await {
                Ok(conn) => sessions.push(conn),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "failed to load session metadata");
                }
            }
        }
        Ok(sessions)
    }
}
