//! Reload behavior across state swaps, driven through the loader.

use serde_json::json;
use std::sync::Arc;

use portcullis::loader::{FileConfigStore, StateLoader};

fn config(prefix: &str, command: &str) -> String {
    json!({
        "name": "procs",
        "tenant": "acme",
        "routers": [ { "prefix": prefix, "server": "files" } ],
        "servers": [
            {
                "name": "files",
                "type": "stdio",
                "command": command,
                "policy": "on_demand"
            }
        ]
    })
    .to_string()
}

#[tokio::test]
async fn test_prefix_appears_after_reload() {
    let dir = tempfile::tempdir().unwrap();
    let loader = StateLoader::new(Arc::new(FileConfigStore::new(dir.path())));
    loader.reload().await;
    assert!(loader.current().runtime("/acme/procs").is_none());

    // A peer notifies; the loader refetches and the prefix goes live.
    std::fs::write(dir.path().join("procs.json"), config("/acme/procs", "mcp-files")).unwrap();
    loader.reload().await;
    assert!(loader.current().runtime("/acme/procs").is_some());
}

#[tokio::test]
async fn test_old_snapshot_survives_swap() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("procs.json"), config("/acme/procs", "mcp-files")).unwrap();

    let loader = StateLoader::new(Arc::new(FileConfigStore::new(dir.path())));
    loader.reload().await;

    // An in-flight request holds the old snapshot across the swap.
    let held = loader.current();
    std::fs::write(dir.path().join("procs.json"), config("/acme/other", "mcp-files")).unwrap();
    loader.reload().await;

    assert!(held.runtime("/acme/procs").is_some());
    assert!(loader.current().runtime("/acme/procs").is_none());
    assert!(loader.current().runtime("/acme/other").is_some());
}

#[tokio::test]
async fn test_transport_identity_across_reloads() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("procs.json"), config("/acme/procs", "mcp-files")).unwrap();

    let loader = StateLoader::new(Arc::new(FileConfigStore::new(dir.path())));
    loader.reload().await;
    let first = loader
        .current()
        .runtime("/acme/procs")
        .unwrap()
        .transport
        .clone()
        .unwrap();

    // Unchanged server definition: the transport instance is carried over.
    loader.reload().await;
    let second = loader
        .current()
        .runtime("/acme/procs")
        .unwrap()
        .transport
        .clone()
        .unwrap();
    assert!(Arc::ptr_eq(&first, &second));

    // Changed command: a fresh transport replaces it.
    std::fs::write(
        dir.path().join("procs.json"),
        config("/acme/procs", "mcp-files --verbose"),
    )
    .unwrap();
    loader.reload().await;
    let third = loader
        .current()
        .runtime("/acme/procs")
        .unwrap()
        .transport
        .clone()
        .unwrap();
    assert!(!Arc::ptr_eq(&second, &third));
}
