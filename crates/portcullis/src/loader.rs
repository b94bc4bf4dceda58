//! Config store access and state swaps.
//!
//! The loader owns the published `State` pointer. Reloads read every config
//! from the store, build a new state (reusing transports from the old one),
//! and publish it in a single atomic swap; readers never take a lock.

use anyhow::{Context as _, Result};
use arc_swap::ArcSwap;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::McpConfig;
use crate::state::State;

/// Source of declarative configs. The admin store behind this trait is
/// external; the gateway only ever lists.
#[async_trait]
pub trait ConfigStore: Send + Sync {
    async fn list_configs(&self) -> Result<Vec<McpConfig>>;
}

/// Config store over a directory of `*.json` / `*.yaml` / `*.yml` files,
/// one config per file, loaded in filename order.
pub struct FileConfigStore {
    dir: PathBuf,
}

impl FileConfigStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    fn parse(path: &Path, contents: &str) -> Result<McpConfig> {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();
        match ext {
            "json" => serde_json::from_str(contents)
                .with_context(|| format!("invalid JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(contents)
                .with_context(|| format!("invalid YAML config: {}", path.display())),
            other => anyhow::bail!("unsupported config extension '{}': {}", other, path.display()),
        }
    }
}

#[async_trait]
impl ConfigStore for FileConfigStore {
    async fn list_configs(&self) -> Result<Vec<McpConfig>> {
        let mut entries = tokio::fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("failed to read config dir {}", self.dir.display()))?;

        let mut paths = Vec::new();
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let ext = path
                .extension()
                .and_then(|e| e.to_str())
                .unwrap_or_default();
            if matches!(ext, "json" | "yaml" | "yml") {
                paths.push(path);
            }
        }
        paths.sort();

        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            let contents = tokio::fs::read_to_string(&path)
                .await
                .with_context(|| format!("failed to read {}", path.display()))?;
            match Self::parse(&path, &contents) {
                Ok(config) => {
                    tracing::debug!(
                        file = %path.display(),
                        name = %config.name,
                        tenant = %config.tenant,
                        "loaded config"
                    );
                    configs.push(config);
                }
                Err(e) => {
                    // One broken file must not take the rest down.
                    tracing::error!(file = %path.display(), error = %e, "skipping config");
                }
            }
        }

        Ok(configs)
    }
}

/// Owns the atomically swapped state and drives rebuilds.
pub struct StateLoader {
    store: Arc<dyn ConfigStore>,
    state: ArcSwap<State>,
}

impl StateLoader {
    pub fn new(store: Arc<dyn ConfigStore>) -> Arc<Self> {
        Arc::new(Self {
            store,
            state: ArcSwap::from_pointee(State::empty()),
        })
    }

    /// The currently published snapshot.
    pub fn current(&self) -> Arc<State> {
        self.state.load_full()
    }

    /// Load configs, rebuild, and publish.
    ///
    /// A failing store yields an empty config list (and therefore an empty
    /// state) rather than leaving the gateway without a snapshot; per-config
    /// failures are isolated inside the build.
    pub async fn reload(&self) -> Arc<State> {
        let configs = match self.store.list_configs().await {
            Ok(configs) => configs,
            Err(e) => {
                tracing::error!(error = %e, "failed to load configs, building empty state");
                Vec::new()
            }
        };

        tracing::info!(count = configs.len(), "rebuilding gateway state");

        let old = self.current();
        let new_state = Arc::new(State::build_from(configs, Some(&old)).await);
        self.state.store(new_state.clone());

        // Dropped transports stop only once the swap is visible; a request
        // that started on the old snapshot fails at most one call.
        new_state.stop_removed_transports(&old).await;

        tracing::info!(
            prefixes = ?new_state.runtime.keys().collect::<Vec<_>>(),
            "gateway state swapped"
        );

        new_state
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_config(dir: &Path, name: &str, contents: &str) {
        std::fs::write(dir.join(name), contents).unwrap();
    }

    const JSON_CONFIG: &str = r#"{
        "name": "demo",
        "tenant": "acme",
        "routers": [ { "prefix": "/acme/demo", "server": "backend" } ],
        "http_servers": [ { "name": "backend", "url": "http://u", "tools": [] } ]
    }"#;

    const YAML_CONFIG: &str = r#"
name: demo2
tenant: acme
routers:
  - prefix: /acme/demo2
    server: backend
http_servers:
  - name: backend
    url: http://u
    tools: []
"#;

    #[tokio::test]
    async fn test_file_store_reads_json_and_yaml() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "a.json", JSON_CONFIG);
        write_config(dir.path(), "b.yaml", YAML_CONFIG);
        write_config(dir.path(), "notes.txt", "ignored");

        let store = FileConfigStore::new(dir.path());
        let configs = store.list_configs().await.unwrap();
        assert_eq!(configs.len(), 2);
        assert_eq!(configs[0].name, "demo");
        assert_eq!(configs[1].name, "demo2");
    }

    #[tokio::test]
    async fn test_file_store_skips_broken_files() {
        let dir = tempfile::tempdir().unwrap();
        write_config(dir.path(), "a.json", JSON_CONFIG);
        write_config(dir.path(), "broken.json", "{ nope");

        let store = FileConfigStore::new(dir.path());
        let configs = store.list_configs().await.unwrap();
        assert_eq!(configs.len(), 1);
    }

    #[tokio::test]
    async fn test_reload_swaps_state() {
        let dir = tempfile::tempdir().unwrap();
        let loader = StateLoader::new(Arc::new(FileConfigStore::new(dir.path())));

        assert!(loader.current().runtime.is_empty());

        write_config(dir.path(), "a.json", JSON_CONFIG);
        let state = loader.reload().await;
        assert!(state.runtime.contains_key("/acme/demo"));
        assert!(loader.current().runtime.contains_key("/acme/demo"));

        // Removing the config removes the prefix on the next reload.
        std::fs::remove_file(dir.path().join("a.json")).unwrap();
        loader.reload().await;
        assert!(loader.current().runtime.is_empty());
    }

    #[tokio::test]
    async fn test_missing_dir_yields_empty_state() {
        let loader = StateLoader::new(Arc::new(FileConfigStore::new("/definitely/not/a/dir")));
        let state = loader.reload().await;
        assert!(state.runtime.is_empty());
    }
}
