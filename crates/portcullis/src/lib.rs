//! portcullis - multi-tenant MCP gateway.
//!
//! Terminates MCP clients over two wire transports (legacy SSE with a
//! companion POST channel, and Streamable-HTTP), routes each session by URL
//! prefix to a declaratively configured backend, and translates tool calls
//! into REST requests, stdio MCP subprocesses, or upstream MCP servers.
//! Configuration reloads propagate across replicas through the notifier.
//!
//! Crate layout:
//! - [`config`] - the declarative per-tenant config model
//! - [`session`] - client session stores (memory, Redis)
//! - [`state`] - the per-prefix runtime map and its atomic rebuild
//! - [`transport`] - backend connectors (HTTP templates, stdio, SSE, streamable)
//! - [`template`] - request/response template rendering
//! - [`dispatch`] - the HTTP front door
//! - [`notifier`] - cluster-wide reload fan-out
//! - [`loader`] - config store access and state swaps

pub mod config;
pub mod dispatch;
pub mod loader;
pub mod notifier;
pub mod session;
pub mod state;
pub mod template;
pub mod transport;

pub use dispatch::Gateway;
pub use loader::{ConfigStore, FileConfigStore, StateLoader};
pub use state::{BuildStateError, State};
