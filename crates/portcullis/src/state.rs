//! Gateway runtime state.
//!
//! A `State` is an immutable snapshot mapping URL prefixes to runtimes. It
//! is rebuilt from the full config list on every reload and published
//! through one atomic pointer swap; in-flight requests keep reading the old
//! snapshot. Transports survive rebuilds when their server definition is
//! unchanged.

use mcpkit::Tool;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::{HttpServer, McpConfig, McpServer, McpServerType, Policy, Router, ToolDef};
use crate::transport::{create_transport, HttpTransport, Transport};

/// Per-prefix build failure. Never fatal to the whole rebuild; the affected
/// prefix is omitted and the gateway degrades partially.
#[derive(Debug, thiserror::Error)]
#[error("{message} (tenant: {tenant}, server: {server}, prefix: {prefix}, kind: {kind})")]
pub struct BuildStateError {
    pub message: String,
    pub tenant: String,
    pub server: String,
    pub prefix: String,
    pub kind: String,
}

impl BuildStateError {
    fn new(message: impl Into<String>, kind: &str) -> Self {
        Self {
            message: message.into(),
            tenant: String::new(),
            server: String::new(),
            prefix: String::new(),
            kind: kind.to_string(),
        }
    }

    fn with_tenant(mut self, tenant: &str) -> Self {
        self.tenant = tenant.to_string();
        self
    }

    fn with_server(mut self, server: &str) -> Self {
        self.server = server.to_string();
        self
    }

    fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }
}

/// Wire protocol of the backend bound to a prefix.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendProto {
    Http,
    Sse,
    Streamable,
    Stdio,
}

impl From<McpServerType> for BackendProto {
    fn from(t: McpServerType) -> Self {
        match t {
            McpServerType::Sse => BackendProto::Sse,
            McpServerType::Stdio => BackendProto::Stdio,
            McpServerType::Streamable => BackendProto::Streamable,
        }
    }
}

/// Counters gathered during a rebuild.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Metrics {
    pub total_tools: usize,
    pub http_servers: usize,
    pub mcp_servers: usize,
    pub idle_http_servers: usize,
    pub idle_mcp_servers: usize,
    pub missing_tools: usize,
}

/// The materialized binding of one prefix to a backend.
pub struct Runtime {
    pub backend_proto: BackendProto,
    pub router: Router,
    pub http_server: Option<HttpServer>,
    pub mcp_server: Option<McpServer>,
    /// Tools this prefix may call, keyed by name.
    pub tools: HashMap<String, ToolDef>,
    /// Tool advertisements, in the order the server declares them.
    pub tools_schema: Vec<Tool>,
    pub transport: Option<Arc<dyn Transport>>,
}

impl Runtime {
    fn new(router: Router) -> Self {
        Self {
            backend_proto: BackendProto::Http,
            router,
            http_server: None,
            mcp_server: None,
            tools: HashMap::new(),
            tools_schema: Vec::new(),
            transport: None,
        }
    }
}

/// Immutable snapshot of every runtime served by this gateway instance.
#[derive(Default)]
pub struct State {
    pub mcps: Vec<McpConfig>,
    pub runtime: HashMap<String, Runtime>,
    pub metrics: Metrics,
}

impl State {
    /// Empty state; what the gateway serves before the first load succeeds.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Runtime bound to a prefix.
    pub fn runtime(&self, prefix: &str) -> Option<&Runtime> {
        self.runtime.get(prefix)
    }

    /// Advertised SSE endpoint prefix for reverse-proxy deployments.
    pub fn sse_prefix(&self, prefix: &str) -> &str {
        self.runtime
            .get(prefix)
            .map(|r| r.router.sse_prefix.as_str())
            .unwrap_or("")
    }

    /// Build a new state from a config list.
    ///
    /// `old_state` enables transport reuse: a prefix whose MCP server is
    /// unchanged keeps its live transport. Stopping transports for prefixes
    /// that disappeared is the caller's job once the swap is visible
    /// ([`State::stop_removed_transports`]), so in-flight requests on the
    /// old snapshot fail at most one call.
    pub async fn build_from(configs: Vec<McpConfig>, old_state: Option<&State>) -> State {
        let mut state = State {
            mcps: configs.clone(),
            runtime: HashMap::new(),
            metrics: Metrics::default(),
        };

        for config in &configs {
            if let Err(e) = check_tenant_prefixes(config) {
                tracing::error!(error = %e, "rejecting config");
                continue;
            }

            let tools = config.tool_index();
            state.metrics.total_tools += config.tools.len();

            let prefix_map = state.build_prefix_map(config);
            state.process_http_servers(config, &prefix_map, &tools);
            state.process_mcp_servers(config, &prefix_map, old_state).await;
        }

        tracing::info!(
            total_tools = state.metrics.total_tools,
            http_servers = state.metrics.http_servers,
            mcp_servers = state.metrics.mcp_servers,
            idle_http_servers = state.metrics.idle_http_servers,
            idle_mcp_servers = state.metrics.idle_mcp_servers,
            missing_tools = state.metrics.missing_tools,
            "state built"
        );

        state
    }

    /// Scan routers: server name -> deduplicated prefixes, registering each
    /// router's runtime along the way.
    fn build_prefix_map(&mut self, config: &McpConfig) -> HashMap<String, Vec<String>> {
        let mut prefix_map: HashMap<String, Vec<String>> = HashMap::new();

        for router in &config.routers {
            let prefixes = prefix_map.entry(router.server.clone()).or_default();
            if !prefixes.contains(&router.prefix) {
                prefixes.push(router.prefix.clone());
            }
            self.runtime
                .entry(router.prefix.clone())
                .and_modify(|r| r.router = router.clone())
                .or_insert_with(|| Runtime::new(router.clone()));
            tracing::info!(
                tenant = %config.tenant,
                prefix = %router.prefix,
                server = %router.server,
                "registered router"
            );
        }

        prefix_map
    }

    fn process_http_servers(
        &mut self,
        config: &McpConfig,
        prefix_map: &HashMap<String, Vec<String>>,
        tools: &HashMap<&str, &ToolDef>,
    ) {
        self.metrics.http_servers += config.http_servers.len();

        for server in &config.http_servers {
            let Some(prefixes) = prefix_map.get(&server.name).filter(|p| !p.is_empty()) else {
                self.metrics.idle_http_servers += 1;
                tracing::warn!(server = %server.name, "no router references this http server");
                continue;
            };

            let (allowed_tools, allowed_schemas) = self.build_allowed_tools(server, tools);

            for prefix in prefixes {
                let transport: Arc<dyn Transport> =
                    Arc::new(HttpTransport::new(server.clone(), allowed_tools.clone()));
                if let Some(runtime) = self.runtime.get_mut(prefix) {
                    runtime.backend_proto = BackendProto::Http;
                    runtime.http_server = Some(server.clone());
                    runtime.tools = allowed_tools.clone();
                    runtime.tools_schema = allowed_schemas.clone();
                    runtime.transport = Some(transport);
                }
            }
        }
    }

    /// Intersect the server's declared tool names with the config's tools.
    fn build_allowed_tools(
        &mut self,
        server: &HttpServer,
        tools: &HashMap<&str, &ToolDef>,
    ) -> (HashMap<String, ToolDef>, Vec<Tool>) {
        let mut allowed_tools = HashMap::new();
        let mut allowed_schemas = Vec::new();

        for tool_name in &server.tools {
            match tools.get(tool_name.as_str()) {
                Some(tool) => {
                    allowed_schemas.push(tool.to_tool());
                    allowed_tools.insert(tool_name.clone(), (*tool).clone());
                }
                None => {
                    self.metrics.missing_tools += 1;
                    tracing::warn!(
                        server = %server.name,
                        tool = %tool_name,
                        "declared tool missing from config"
                    );
                }
            }
        }

        (allowed_tools, allowed_schemas)
    }

    async fn process_mcp_servers(
        &mut self,
        config: &McpConfig,
        prefix_map: &HashMap<String, Vec<String>>,
        old_state: Option<&State>,
    ) {
        self.metrics.mcp_servers += config.servers.len();

        for server in &config.servers {
            let Some(prefixes) = prefix_map.get(&server.name).filter(|p| !p.is_empty()) else {
                self.metrics.idle_mcp_servers += 1;
                tracing::warn!(server = %server.name, "no router references this mcp server");
                continue;
            };

            for prefix in prefixes {
                if let Err(e) = self
                    .bind_mcp_runtime(config, server, prefix, old_state)
                    .await
                {
                    tracing::error!(error = %e, "failed to build MCP runtime");
                    self.runtime.remove(prefix);
                }
            }
        }
    }

    async fn bind_mcp_runtime(
        &mut self,
        config: &McpConfig,
        server: &McpServer,
        prefix: &str,
        old_state: Option<&State>,
    ) -> Result<(), BuildStateError> {
        let transport = get_or_create_transport(server, prefix, old_state).map_err(|e| {
            e.with_tenant(&config.tenant)
                .with_server(&server.name)
                .with_prefix(prefix)
        })?;

        handle_startup_policy(server, &transport).await.map_err(|e| {
            e.with_tenant(&config.tenant)
                .with_server(&server.name)
                .with_prefix(prefix)
        })?;

        if let Some(runtime) = self.runtime.get_mut(prefix) {
            runtime.backend_proto = server.server_type.into();
            runtime.mcp_server = Some(server.clone());
            runtime.transport = Some(transport);
        }
        Ok(())
    }

    /// Stop transports whose prefix disappeared from this state. Called
    /// after the swap is observable; failures are logged, never fatal.
    pub async fn stop_removed_transports(&self, old_state: &State) {
        for (prefix, old_runtime) in &old_state.runtime {
            if self.runtime.contains_key(prefix) {
                continue;
            }
            let Some(server) = &old_runtime.mcp_server else {
                continue;
            };
            let Some(transport) = &old_runtime.transport else {
                continue;
            };

            tracing::info!(prefix = %prefix, server = %server.name, "stopping unused transport");
            if let Err(e) = transport.stop().await {
                tracing::warn!(
                    prefix = %prefix,
                    server = %server.name,
                    error = %e,
                    "failed to stop old transport"
                );
            }
        }
    }
}

/// Every router prefix must live under the tenant's registered prefix.
fn check_tenant_prefixes(config: &McpConfig) -> Result<(), BuildStateError> {
    if config.tenant_prefix.is_empty() {
        return Ok(());
    }
    let root = config.tenant_prefix.trim_end_matches('/');
    for router in &config.routers {
        let contained =
            router.prefix == root || router.prefix.starts_with(&format!("{}/", root));
        if !contained {
            return Err(BuildStateError::new(
                format!(
                    "router prefix {} escapes tenant prefix {}",
                    router.prefix, root
                ),
                "tenant_prefix_violation",
            )
            .with_tenant(&config.tenant)
            .with_prefix(&router.prefix));
        }
    }
    Ok(())
}

/// Reuse the old transport when the server definition is identical,
/// otherwise create a fresh one.
fn get_or_create_transport(
    server: &McpServer,
    prefix: &str,
    old_state: Option<&State>,
) -> Result<Arc<dyn Transport>, BuildStateError> {
    if let Some(old_runtime) = old_state.and_then(|s| s.runtime.get(prefix)) {
        if let (Some(old_server), Some(old_transport)) =
            (&old_runtime.mcp_server, &old_runtime.transport)
        {
            if old_server.server_type == server.server_type
                && old_server.command == server.command
                && old_server.url == server.url
                && old_server.args == server.args
            {
                tracing::info!(server = %server.name, prefix = %prefix, "reusing transport");
                return Ok(old_transport.clone());
            }
        }
    }

    create_transport(server).map_err(|e| {
        BuildStateError::new(
            format!("failed to create transport: {}", e),
            "transport_creation_failed",
        )
    })
}

/// Apply the startup policy: on_start transports are started and stay up;
/// preinstalled on_demand servers get a start/stop liveness check.
async fn handle_startup_policy(
    server: &McpServer,
    transport: &Arc<dyn Transport>,
) -> Result<(), BuildStateError> {
    let keep_running = server.policy == Policy::OnStart;
    if !keep_running && !server.preinstalled {
        return Ok(());
    }
    if transport.is_running() {
        return Ok(());
    }

    transport.start().await.map_err(|e| {
        BuildStateError::new(format!("failed to start server: {}", e), "startup_failed")
    })?;

    if keep_running {
        tracing::info!(server = %server.name, "started MCP server (policy on_start)");
    } else {
        transport.stop().await.map_err(|e| {
            BuildStateError::new(
                format!("failed to stop after liveness check: {}", e),
                "startup_failed",
            )
        })?;
        tracing::info!(server = %server.name, "verified preinstalled MCP server");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn http_config() -> McpConfig {
        serde_json::from_value(json!({
            "name": "demo",
            "tenant": "acme",
            "routers": [
                { "prefix": "/acme/demo", "server": "backend" },
                { "prefix": "/acme/demo2", "server": "backend" },
                { "prefix": "/acme/demo", "server": "backend" }
            ],
            "http_servers": [
                { "name": "backend", "url": "http://u", "tools": ["echo", "ghost"] },
                { "name": "orphan", "url": "http://o", "tools": [] }
            ],
            "tools": [
                {
                    "name": "echo",
                    "method": "POST",
                    "path": "{{config.url}}/e",
                    "input_schema": { "type": "object" }
                }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_build_http_runtimes() {
        let state = State::build_from(vec![http_config()], None).await;

        // Duplicate router prefix deduplicated.
        assert_eq!(state.runtime.len(), 2);
        let runtime = state.runtime("/acme/demo").unwrap();
        assert_eq!(runtime.backend_proto, BackendProto::Http);
        assert_eq!(runtime.tools.len(), 1);
        assert_eq!(runtime.tools_schema.len(), 1);
        assert_eq!(runtime.tools_schema[0].name, "echo");
        assert!(runtime.transport.is_some());

        assert_eq!(state.metrics.total_tools, 1);
        assert_eq!(state.metrics.http_servers, 2);
        assert_eq!(state.metrics.idle_http_servers, 1);
        assert_eq!(state.metrics.missing_tools, 1);
    }

    #[tokio::test]
    async fn test_tools_subset_of_config_tools() {
        let state = State::build_from(vec![http_config()], None).await;
        for runtime in state.runtime.values() {
            assert_eq!(runtime.tools.len(), runtime.tools_schema.len());
            for name in runtime.tools.keys() {
                assert!(state.mcps[0].tools.iter().any(|t| &t.name == name));
            }
        }
    }

    fn stdio_config(command: &str, description: &str) -> McpConfig {
        serde_json::from_value(json!({
            "name": "procs",
            "tenant": "acme",
            "routers": [ { "prefix": "/acme/procs", "server": "files" } ],
            "servers": [
                {
                    "name": "files",
                    "type": "stdio",
                    "description": description,
                    "command": command,
                    "policy": "on_demand"
                }
            ]
        }))
        .unwrap()
    }

    #[tokio::test]
    async fn test_transport_reuse_on_unchanged_server() {
        let old = State::build_from(vec![stdio_config("foo --bar", "v1")], None).await;
        let old_transport = old.runtime("/acme/procs").unwrap().transport.clone().unwrap();

        // Only the description changed: same transport instance.
        let new = State::build_from(vec![stdio_config("foo --bar", "v2")], Some(&old)).await;
        let new_transport = new.runtime("/acme/procs").unwrap().transport.clone().unwrap();
        assert!(Arc::ptr_eq(&old_transport, &new_transport));

        // The command changed: fresh transport.
        let changed = State::build_from(vec![stdio_config("foo --baz", "v2")], Some(&new)).await;
        let changed_transport = changed
            .runtime("/acme/procs")
            .unwrap()
            .transport
            .clone()
            .unwrap();
        assert!(!Arc::ptr_eq(&new_transport, &changed_transport));
    }

    #[tokio::test]
    async fn test_rebuild_is_idempotent() {
        let first = State::build_from(vec![http_config()], None).await;
        let second = State::build_from(vec![http_config()], Some(&first)).await;

        let mut first_keys: Vec<_> = first.runtime.keys().collect();
        let mut second_keys: Vec<_> = second.runtime.keys().collect();
        first_keys.sort();
        second_keys.sort();
        assert_eq!(first_keys, second_keys);
        assert_eq!(first.metrics, second.metrics);
    }

    #[tokio::test]
    async fn test_tenant_prefix_violation_rejects_config() {
        let mut config = http_config();
        config.tenant_prefix = "/other".to_string();
        let state = State::build_from(vec![config], None).await;
        assert!(state.runtime.is_empty());

        let mut config = http_config();
        config.tenant_prefix = "/acme".to_string();
        let state = State::build_from(vec![config], None).await;
        assert_eq!(state.runtime.len(), 2);
    }

    #[tokio::test]
    async fn test_bad_stdio_command_drops_prefix_only() {
        let mut config = stdio_config("", "v1");
        config.routers.push(crate::config::Router {
            prefix: "/acme/web".to_string(),
            server: "web".to_string(),
            sse_prefix: String::new(),
            cors: None,
        });
        config.http_servers = vec![crate::config::HttpServer {
            name: "web".to_string(),
            description: String::new(),
            url: "http://u".to_string(),
            tools: vec![],
        }];

        let state = State::build_from(vec![config], None).await;
        // The stdio prefix fails (empty command) but the http one survives.
        assert!(state.runtime("/acme/procs").is_none());
        assert!(state.runtime("/acme/web").is_some());
    }
}
