//! Composite notifier.
//!
//! Merges N child notifiers: `watch` forwards from every receivable child
//! into the merged watcher queues; `notify` broadcasts to every sendable
//! child and succeeds if at least one child succeeded. The gateway uses
//! this to pair, say, a Redis sender with a local signal receiver.

use async_trait::async_trait;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::{Notifier, NotifierError, Update, Watchers};

/// Fan-in/fan-out over several child notifiers.
pub struct CompositeNotifier {
    children: Vec<Arc<dyn Notifier>>,
    watchers: Arc<Watchers>,
    readers: Mutex<Vec<JoinHandle<()>>>,
}

impl CompositeNotifier {
    pub fn new(children: Vec<Arc<dyn Notifier>>) -> Self {
        Self {
            children,
            watchers: Arc::new(Watchers::new()),
            readers: Mutex::new(Vec::new()),
        }
    }

    /// Spawn one forwarder per receivable child. Runs once, on first watch.
    async fn ensure_readers(&self) -> Result<(), NotifierError> {
        let mut readers = self.readers.lock().await;
        if !readers.is_empty() {
            return Ok(());
        }

        for child in &self.children {
            if !child.can_receive() {
                continue;
            }
            let mut rx = child.watch().await?;
            let watchers = self.watchers.clone();
            readers.push(tokio::spawn(async move {
                while let Some(update) = rx.recv().await {
                    watchers.fan_out(&update).await;
                }
            }));
        }

        Ok(())
    }
}

#[async_trait]
impl Notifier for CompositeNotifier {
    async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Update>, NotifierError> {
        if !self.can_receive() {
            return Err(NotifierError::CannotReceive);
        }
        let rx = self.watchers.add().await;
        self.ensure_readers().await?;
        Ok(rx)
    }

    async fn notify(&self, update: Update) -> Result<(), NotifierError> {
        if !self.can_send() {
            return Err(NotifierError::CannotSend);
        }

        let mut successes = 0usize;
        let mut last_error = None;

        for child in &self.children {
            if !child.can_send() {
                continue;
            }
            match child.notify(update.clone()).await {
                Ok(()) => successes += 1,
                Err(e) => {
                    tracing::error!(error = %e, "child notifier failed");
                    last_error = Some(e);
                }
            }
        }

        match (successes, last_error) {
            (0, Some(e)) => Err(NotifierError::Backend(format!(
                "all child notifiers failed: {e}"
            ))),
            (_, Some(_)) => {
                tracing::warn!(successes, "some child notifiers failed");
                Ok(())
            }
            _ => Ok(()),
        }
    }

    fn can_send(&self) -> bool {
        self.children.iter().any(|c| c.can_send())
    }

    fn can_receive(&self) -> bool {
        self.children.iter().any(|c| c.can_receive())
    }

    /// Tear down forwarders and children in reverse order.
    async fn close(&self) {
        let mut readers = self.readers.lock().await;
        for reader in readers.drain(..).rev() {
            reader.abort();
        }
        for child in self.children.iter().rev() {
            child.close().await;
        }
        self.watchers.clear().await;
        tracing::info!("composite notifier closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gateconf::NotifierRole;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Test double: in-process notifier with controllable failure.
    struct StubNotifier {
        role: NotifierRole,
        fail_sends: bool,
        sent: AtomicUsize,
        watchers: Arc<Watchers>,
    }

    impl StubNotifier {
        fn new(role: NotifierRole, fail_sends: bool) -> Arc<Self> {
            Arc::new(Self {
                role,
                fail_sends,
                sent: AtomicUsize::new(0),
                watchers: Arc::new(Watchers::new()),
            })
        }

        async fn inject(&self, update: Update) {
            self.watchers.fan_out(&update).await;
        }
    }

    #[async_trait]
    impl Notifier for StubNotifier {
        async fn watch(&self) -> Result<tokio::sync::mpsc::Receiver<Update>, NotifierError> {
            if !self.can_receive() {
                return Err(NotifierError::CannotReceive);
            }
            Ok(self.watchers.add().await)
        }

        async fn notify(&self, _update: Update) -> Result<(), NotifierError> {
            if !self.can_send() {
                return Err(NotifierError::CannotSend);
            }
            if self.fail_sends {
                return Err(NotifierError::Backend("boom".into()));
            }
            self.sent.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn can_send(&self) -> bool {
            super::super::role_can_send(self.role)
        }

        fn can_receive(&self) -> bool {
            super::super::role_can_receive(self.role)
        }

        async fn close(&self) {
            self.watchers.clear().await;
        }
    }

    #[tokio::test]
    async fn test_roles_are_union_of_children() {
        let sender = StubNotifier::new(NotifierRole::Sender, false);
        let receiver = StubNotifier::new(NotifierRole::Receiver, false);
        let composite = CompositeNotifier::new(vec![sender, receiver]);
        assert!(composite.can_send());
        assert!(composite.can_receive());

        let empty = CompositeNotifier::new(vec![]);
        assert!(!empty.can_send());
        assert!(!empty.can_receive());
    }

    #[tokio::test]
    async fn test_watch_merges_children() {
        let a = StubNotifier::new(NotifierRole::Receiver, false);
        let b = StubNotifier::new(NotifierRole::Receiver, false);
        let composite = CompositeNotifier::new(vec![a.clone(), b.clone()]);

        let mut rx = composite.watch().await.unwrap();

        a.inject(None).await;
        b.inject(None).await;
        // Both children forward into the same merged queue.
        assert_eq!(rx.recv().await, Some(None));
        assert_eq!(rx.recv().await, Some(None));
    }

    #[tokio::test]
    async fn test_notify_partial_failure_succeeds() {
        let good = StubNotifier::new(NotifierRole::Sender, false);
        let bad = StubNotifier::new(NotifierRole::Sender, true);
        let composite = CompositeNotifier::new(vec![good.clone(), bad]);

        composite.notify(None).await.unwrap();
        assert_eq!(good.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_notify_total_failure_errors() {
        let bad1 = StubNotifier::new(NotifierRole::Sender, true);
        let bad2 = StubNotifier::new(NotifierRole::Sender, true);
        let composite = CompositeNotifier::new(vec![bad1, bad2]);

        assert!(matches!(
            composite.notify(None).await,
            Err(NotifierError::Backend(_))
        ));
    }

    #[tokio::test]
    async fn test_receiver_only_composite_rejects_notify() {
        let receiver = StubNotifier::new(NotifierRole::Receiver, false);
        let composite = CompositeNotifier::new(vec![receiver]);
        assert!(matches!(
            composite.notify(None).await,
            Err(NotifierError::CannotSend)
        ));
    }
}
