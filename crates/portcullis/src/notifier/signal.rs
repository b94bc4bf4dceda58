//! OS signal notifier.
//!
//! `notify` sends SIGHUP to the process named in a pid file; `watch`
//! installs a SIGHUP handler that pushes the reload signal to watchers.
//! Signals carry no payload, so updates through this backend are always
//! bare reload signals.

use async_trait::async_trait;
use gateconf::{NotifierRole, NotifierSignalConfig};
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{role_can_receive, role_can_send, Notifier, NotifierError, Update, Watchers};

/// Notifier over SIGHUP and a pid file.
pub struct SignalNotifier {
    config: NotifierSignalConfig,
    role: NotifierRole,
    watchers: Arc<Watchers>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl SignalNotifier {
    pub fn new(config: NotifierSignalConfig, role: NotifierRole) -> Self {
        Self {
            config,
            role,
            watchers: Arc::new(Watchers::new()),
            listener: Mutex::new(None),
        }
    }

    async fn ensure_listening(&self) -> Result<(), NotifierError> {
        let mut listener = self.listener.lock().await;
        if listener.is_some() {
            return Ok(());
        }

        let mut hangup = tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
            .map_err(|e| NotifierError::Backend(format!("failed to install SIGHUP handler: {e}")))?;

        tracing::info!("watching SIGHUP for reload signals");

        let watchers = self.watchers.clone();
        *listener = Some(tokio::spawn(async move {
            while hangup.recv().await.is_some() {
                tracing::info!("received SIGHUP, forwarding reload signal");
                watchers.fan_out(&None).await;
            }
        }));

        Ok(())
    }
}

/// Read and validate the target pid from a pid file.
fn read_pid(pid_file: &Path) -> Result<i32, NotifierError> {
    let content = std::fs::read_to_string(pid_file).map_err(|e| {
        NotifierError::Backend(format!("PID file not found: {}: {e}", pid_file.display()))
    })?;

    let trimmed = content.trim();
    if trimmed.is_empty() {
        return Err(NotifierError::Backend(format!(
            "Empty PID file: {}",
            pid_file.display()
        )));
    }

    trimmed.parse::<i32>().map_err(|e| {
        NotifierError::Backend(format!("Invalid PID in file {}: {e}", pid_file.display()))
    })
}

#[async_trait]
impl Notifier for SignalNotifier {
    async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Update>, NotifierError> {
        if !self.can_receive() {
            return Err(NotifierError::CannotReceive);
        }
        let rx = self.watchers.add().await;
        self.ensure_listening().await?;
        Ok(rx)
    }

    async fn notify(&self, update: Update) -> Result<(), NotifierError> {
        if !self.can_send() {
            return Err(NotifierError::CannotSend);
        }
        if update.is_some() {
            tracing::debug!("signal notifier cannot carry a payload; sending bare reload signal");
        }

        let pid = read_pid(Path::new(&self.config.pid_file))?;
        let target = nix::unistd::Pid::from_raw(pid);

        // Signal 0 probes for existence before the real send.
        nix::sys::signal::kill(target, None)
            .map_err(|_| NotifierError::Backend(format!("Process with PID {pid} not found")))?;

        nix::sys::signal::kill(target, nix::sys::signal::Signal::SIGHUP)
            .map_err(|e| NotifierError::Backend(format!("Failed to send signal: {e}")))?;

        tracing::info!(pid = pid, pid_file = %self.config.pid_file, "sent SIGHUP");
        Ok(())
    }

    fn can_send(&self) -> bool {
        role_can_send(self.role)
    }

    fn can_receive(&self) -> bool {
        role_can_receive(self.role)
    }

    async fn close(&self) {
        if let Some(listener) = self.listener.lock().await.take() {
            listener.abort();
        }
        self.watchers.clear().await;
        tracing::info!("signal notifier closed");
    }
}

/// Write this process's pid for peers to signal.
pub fn write_pid_file(path: &Path) -> std::io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, std::process::id().to_string())?;
    tracing::info!(pid = std::process::id(), file = %path.display(), "wrote pid file");
    Ok(())
}

/// Remove the pid file on shutdown; missing is fine.
pub fn remove_pid_file(path: &Path) {
    match std::fs::remove_file(path) {
        Ok(()) => tracing::info!(file = %path.display(), "removed pid file"),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => tracing::warn!(file = %path.display(), error = %e, "failed to remove pid file"),
    }
}
