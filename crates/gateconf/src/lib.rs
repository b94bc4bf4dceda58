//! Minimal configuration loading for the Portcullis gateway.
//!
//! Settings come from the process environment; there is no config file layer
//! here. The declarative MCP configs (routers, servers, tools) live elsewhere
//! and are loaded by the gateway's state loader, not this crate.

use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

/// Errors produced while reading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("invalid value for {var}: {value}")]
    InvalidValue { var: String, value: String },
}

/// Redis deployment topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterType {
    #[default]
    Single,
    Cluster,
    Sentinel,
}

impl ClusterType {
    fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "single" => Ok(Self::Single),
            "cluster" => Ok(Self::Cluster),
            "sentinel" => Ok(Self::Sentinel),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Which verbs a notifier participates in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierRole {
    Sender,
    Receiver,
    Both,
}

impl NotifierRole {
    fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "sender" => Ok(Self::Sender),
            "receiver" => Ok(Self::Receiver),
            "both" => Ok(Self::Both),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Notifier backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NotifierType {
    Redis,
    Api,
    Signal,
}

impl NotifierType {
    fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "redis" => Ok(Self::Redis),
            "api" => Ok(Self::Api),
            "signal" => Ok(Self::Signal),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Redis connection settings shared by the session store and the notifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedisSettings {
    /// host:port; multiple addresses may be separated by `;` or `,`
    /// (sentinel deployments list every sentinel here).
    pub addr: String,
    pub username: String,
    pub password: Option<String>,
    pub db: i64,
    pub cluster_type: ClusterType,
    /// Master name for sentinel mode.
    pub master_name: String,
}

impl Default for RedisSettings {
    fn default() -> Self {
        Self {
            addr: "localhost:6379".to_string(),
            username: String::new(),
            password: None,
            db: 0,
            cluster_type: ClusterType::Single,
            master_name: String::new(),
        }
    }
}

impl RedisSettings {
    /// Addresses split on `;` and `,`, empty parts dropped.
    pub fn addrs(&self) -> Vec<&str> {
        split_addrs(&self.addr)
    }

    /// Connection URL for the first configured address.
    pub fn url(&self) -> String {
        let addr = self.addrs().first().copied().unwrap_or("localhost:6379");
        let auth = match (&self.username, &self.password) {
            (u, Some(p)) if !u.is_empty() => format!("{u}:{p}@"),
            (u, None) if !u.is_empty() => format!("{u}@"),
            (_, Some(p)) => format!(":{p}@"),
            _ => String::new(),
        };
        format!("redis://{auth}{addr}/{}", self.db)
    }
}

/// Split an address list on `;` and `,`, trimming whitespace.
pub fn split_addrs(text: &str) -> Vec<&str> {
    text.split([';', ','])
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .collect()
}

/// Redis notifier settings (`NOTIFIER_REDIS_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierRedisConfig {
    #[serde(flatten)]
    pub redis: RedisSettings,
    /// Pub/sub channel carrying config updates.
    pub topic: String,
}

impl Default for NotifierRedisConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            topic: "mcp_config_updates".to_string(),
        }
    }
}

/// API notifier settings (`NOTIFIER_API_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierApiConfig {
    /// Listen port for the local `POST /_reload` receiver.
    pub port: u16,
    /// Peer base URL reloads are POSTed to.
    pub target_url: String,
}

impl Default for NotifierApiConfig {
    fn default() -> Self {
        Self {
            port: 8081,
            target_url: String::new(),
        }
    }
}

/// Signal notifier settings (`NOTIFIER_SIGNAL_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierSignalConfig {
    pub pid_file: String,
}

impl Default for NotifierSignalConfig {
    fn default() -> Self {
        Self {
            pid_file: default_pid_file(),
        }
    }
}

/// Default pid file under the system temp directory.
pub fn default_pid_file() -> String {
    env::temp_dir()
        .join("portcullis.pid")
        .to_string_lossy()
        .into_owned()
}

/// Full notifier configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NotifierConfig {
    pub kind: NotifierType,
    pub role: NotifierRole,
    pub redis: NotifierRedisConfig,
    pub api: NotifierApiConfig,
    pub signal: NotifierSignalConfig,
}

impl Default for NotifierConfig {
    fn default() -> Self {
        Self {
            kind: NotifierType::Redis,
            role: NotifierRole::Sender,
            redis: NotifierRedisConfig::default(),
            api: NotifierApiConfig::default(),
            signal: NotifierSignalConfig::default(),
        }
    }
}

impl NotifierConfig {
    /// Build from the `NOTIFIER_*` environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("NOTIFIER_TYPE") {
            cfg.kind = NotifierType::parse("NOTIFIER_TYPE", &v)?;
        }
        if let Ok(v) = env::var("NOTIFIER_ROLE") {
            cfg.role = NotifierRole::parse("NOTIFIER_ROLE", &v)?;
        }

        if let Ok(v) = env::var("NOTIFIER_REDIS_ADDR") {
            cfg.redis.redis.addr = v;
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_USERNAME") {
            cfg.redis.redis.username = v;
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_PASSWORD") {
            cfg.redis.redis.password = Some(v);
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_DB") {
            cfg.redis.redis.db = parse_num("NOTIFIER_REDIS_DB", &v)?;
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_CLUSTER_TYPE") {
            cfg.redis.redis.cluster_type = ClusterType::parse("NOTIFIER_REDIS_CLUSTER_TYPE", &v)?;
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_MASTER_NAME") {
            cfg.redis.redis.master_name = v;
        }
        if let Ok(v) = env::var("NOTIFIER_REDIS_TOPIC") {
            cfg.redis.topic = v;
        }

        if let Ok(v) = env::var("NOTIFIER_API_PORT") {
            cfg.api.port = parse_num("NOTIFIER_API_PORT", &v)?;
        }
        if let Ok(v) = env::var("NOTIFIER_API_TARGET_URL") {
            cfg.api.target_url = v;
        }

        if let Ok(v) = env::var("NOTIFIER_SIGNAL_PID_FILE") {
            cfg.signal.pid_file = v;
        }

        Ok(cfg)
    }
}

/// Session store backend selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum SessionStoreKind {
    #[default]
    Memory,
    Redis,
}

impl SessionStoreKind {
    pub fn parse(var: &str, value: &str) -> Result<Self, ConfigError> {
        match value {
            "memory" => Ok(Self::Memory),
            "redis" => Ok(Self::Redis),
            other => Err(ConfigError::InvalidValue {
                var: var.to_string(),
                value: other.to_string(),
            }),
        }
    }
}

/// Redis session store settings (`SESSION_REDIS_*`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRedisConfig {
    #[serde(flatten)]
    pub redis: RedisSettings,
    /// Key prefix for session metadata and the live-id set.
    pub prefix: String,
    /// Pub/sub channel carrying session events across replicas.
    pub topic: String,
    /// Session TTL, renewed on every touch.
    pub ttl_secs: u64,
}

impl Default for SessionRedisConfig {
    fn default() -> Self {
        Self {
            redis: RedisSettings::default(),
            prefix: "session".to_string(),
            topic: "session_updates".to_string(),
            ttl_secs: 24 * 60 * 60,
        }
    }
}

impl SessionRedisConfig {
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }
}

/// Session store configuration.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SessionConfig {
    pub store: SessionStoreKind,
    pub redis: SessionRedisConfig,
}

impl SessionConfig {
    /// Build from the `SESSION_*` environment, falling back to defaults.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut cfg = Self::default();

        if let Ok(v) = env::var("SESSION_STORE") {
            cfg.store = SessionStoreKind::parse("SESSION_STORE", &v)?;
        }
        if let Ok(v) = env::var("SESSION_REDIS_ADDR") {
            cfg.redis.redis.addr = v;
        }
        if let Ok(v) = env::var("SESSION_REDIS_USERNAME") {
            cfg.redis.redis.username = v;
        }
        if let Ok(v) = env::var("SESSION_REDIS_PASSWORD") {
            cfg.redis.redis.password = Some(v);
        }
        if let Ok(v) = env::var("SESSION_REDIS_DB") {
            cfg.redis.redis.db = parse_num("SESSION_REDIS_DB", &v)?;
        }
        if let Ok(v) = env::var("SESSION_REDIS_CLUSTER_TYPE") {
            cfg.redis.redis.cluster_type = ClusterType::parse("SESSION_REDIS_CLUSTER_TYPE", &v)?;
        }
        if let Ok(v) = env::var("SESSION_REDIS_MASTER_NAME") {
            cfg.redis.redis.master_name = v;
        }
        if let Ok(v) = env::var("SESSION_REDIS_PREFIX") {
            cfg.redis.prefix = v;
        }
        if let Ok(v) = env::var("SESSION_REDIS_TOPIC") {
            cfg.redis.topic = v;
        }
        if let Ok(v) = env::var("SESSION_REDIS_TTL_SECS") {
            cfg.redis.ttl_secs = parse_num("SESSION_REDIS_TTL_SECS", &v)?;
        }

        Ok(cfg)
    }
}

fn parse_num<T: std::str::FromStr>(var: &str, value: &str) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        var: var.to_string(),
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = NotifierConfig::default();
        assert_eq!(cfg.kind, NotifierType::Redis);
        assert_eq!(cfg.role, NotifierRole::Sender);
        assert_eq!(cfg.redis.topic, "mcp_config_updates");
        assert_eq!(cfg.api.port, 8081);
        assert!(cfg.signal.pid_file.ends_with("portcullis.pid"));

        let sess = SessionConfig::default();
        assert_eq!(sess.store, SessionStoreKind::Memory);
        assert_eq!(sess.redis.prefix, "session");
        assert_eq!(sess.redis.ttl_secs, 86400);
    }

    #[test]
    fn test_split_addrs() {
        assert_eq!(
            split_addrs("a:1;b:2, c:3"),
            vec!["a:1", "b:2", "c:3"]
        );
        assert_eq!(split_addrs(""), Vec::<&str>::new());
        assert_eq!(split_addrs("localhost:6379"), vec!["localhost:6379"]);
    }

    #[test]
    fn test_redis_url() {
        let mut settings = RedisSettings::default();
        assert_eq!(settings.url(), "redis://localhost:6379/0");

        settings.addr = "r1:7000;r2:7001".to_string();
        settings.db = 2;
        assert_eq!(settings.url(), "redis://r1:7000/2");

        settings.password = Some("hunter2".to_string());
        assert_eq!(settings.url(), "redis://:hunter2@r1:7000/2");
    }

    // Env-derived config is covered in one test so concurrent test threads
    // never race on the process environment.
    #[test]
    fn test_from_env() {
        env::set_var("NOTIFIER_TYPE", "api");
        env::set_var("NOTIFIER_ROLE", "both");
        env::set_var("NOTIFIER_API_PORT", "9099");
        env::set_var("NOTIFIER_API_TARGET_URL", "http://peer:8080");
        env::set_var("NOTIFIER_REDIS_ADDR", "r1:7000,r2:7001");
        env::set_var("NOTIFIER_REDIS_CLUSTER_TYPE", "sentinel");
        env::set_var("NOTIFIER_REDIS_TOPIC", "gw_updates");
        env::set_var("NOTIFIER_SIGNAL_PID_FILE", "/run/gw.pid");

        let cfg = NotifierConfig::from_env().unwrap();
        assert_eq!(cfg.kind, NotifierType::Api);
        assert_eq!(cfg.role, NotifierRole::Both);
        assert_eq!(cfg.api.port, 9099);
        assert_eq!(cfg.api.target_url, "http://peer:8080");
        assert_eq!(cfg.redis.redis.addrs(), vec!["r1:7000", "r2:7001"]);
        assert_eq!(cfg.redis.redis.cluster_type, ClusterType::Sentinel);
        assert_eq!(cfg.redis.topic, "gw_updates");
        assert_eq!(cfg.signal.pid_file, "/run/gw.pid");

        env::set_var("SESSION_STORE", "redis");
        env::set_var("SESSION_REDIS_TTL_SECS", "600");
        let sess = SessionConfig::from_env().unwrap();
        assert_eq!(sess.store, SessionStoreKind::Redis);
        assert_eq!(sess.redis.ttl(), Duration::from_secs(600));

        env::set_var("NOTIFIER_TYPE", "carrier-pigeon");
        assert!(NotifierConfig::from_env().is_err());

        for var in [
            "NOTIFIER_TYPE",
            "NOTIFIER_ROLE",
            "NOTIFIER_API_PORT",
            "NOTIFIER_API_TARGET_URL",
            "NOTIFIER_REDIS_ADDR",
            "NOTIFIER_REDIS_CLUSTER_TYPE",
            "NOTIFIER_REDIS_TOPIC",
            "NOTIFIER_SIGNAL_PID_FILE",
            "SESSION_STORE",
            "SESSION_REDIS_TTL_SECS",
        ] {
            env::remove_var(var);
        }
    }
}
