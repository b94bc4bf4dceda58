//! Portcullis gateway daemon.

use anyhow::{Context, Result};
use clap::Parser;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

use portcullis::dispatch::{self, Gateway};
use portcullis::loader::{FileConfigStore, StateLoader};
use portcullis::notifier::{self, CompositeNotifier, Notifier, SignalNotifier};
use portcullis::session;

#[derive(Parser, Debug)]
#[command(name = "portcullis", about = "Multi-tenant MCP gateway", version)]
struct Cli {
    /// Address to serve MCP traffic on
    #[arg(long, default_value = "0.0.0.0:8080", env = "PORTCULLIS_LISTEN")]
    listen: SocketAddr,

    /// Directory of declarative config files (*.json, *.yaml)
    #[arg(long, env = "PORTCULLIS_CONFIG_DIR")]
    config_dir: PathBuf,

    /// Write the gateway pid here for the signal notifier
    #[arg(long, env = "PORTCULLIS_PID_FILE")]
    pid_file: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let cli = Cli::parse();

    if let Some(pid_file) = &cli.pid_file {
        notifier::signal::write_pid_file(pid_file).context("failed to write pid file")?;
    }

    // Session store and notifier settings come from the environment.
    let session_config = gateconf::SessionConfig::from_env()?;
    let notifier_config = gateconf::NotifierConfig::from_env()?;

    let sessions = session::create_store(&session_config)
        .await
        .context("failed to create session store")?;

    let loader = StateLoader::new(Arc::new(FileConfigStore::new(&cli.config_dir)));
    loader.reload().await;

    // Reload propagation: the configured backend combined with a local
    // SIGHUP receiver, so an operator can always force a reload on this
    // box while cluster-wide updates travel over the configured channel.
    // Payload updates and bare reload signals both refetch from the store.
    let mut children: Vec<Arc<dyn Notifier>> = Vec::new();
    match notifier::create_notifier(&notifier_config) {
        Ok(notifier) => children.push(notifier),
        Err(e) => {
            tracing::warn!(error = %e, "notifier unavailable, reloads are local only");
        }
    }
    children.push(Arc::new(SignalNotifier::new(
        notifier_config.signal.clone(),
        gateconf::NotifierRole::Receiver,
    )));
    let notifier = Arc::new(CompositeNotifier::new(children));
    if notifier.can_receive() {
        spawn_reload_loop(notifier, loader.clone());
    }

    let gateway = Gateway::new(sessions, loader);
    let app = dispatch::router(gateway);

    let listener = tokio::net::TcpListener::bind(cli.listen)
        .await
        .with_context(|| format!("failed to bind {}", cli.listen))?;
    tracing::info!(listen = %cli.listen, "portcullis listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("server error")?;

    if let Some(pid_file) = &cli.pid_file {
        notifier::signal::remove_pid_file(pid_file);
    }

    tracing::info!("portcullis stopped");
    Ok(())
}

fn spawn_reload_loop(notifier: Arc<dyn Notifier>, loader: Arc<StateLoader>) {
    tokio::spawn(async move {
        let mut rx = match notifier.watch().await {
            Ok(rx) => rx,
            Err(e) => {
                tracing::error!(error = %e, "failed to watch for config updates");
                return;
            }
        };

        while let Some(update) = rx.recv().await {
            match &update {
                Some(config) => {
                    // The store stays the source of truth; the inline
                    // payload only tells us what changed.
                    tracing::info!(name = %config.name, tenant = %config.tenant, "config update received");
                }
                None => tracing::info!("reload signal received"),
            }
            loader.reload().await;
        }

        tracing::info!("config update stream closed");
    });
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install ctrl-c handler");
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => tracing::info!("received ctrl-c, shutting down"),
        _ = terminate => tracing::info!("received SIGTERM, shutting down"),
    }
}
