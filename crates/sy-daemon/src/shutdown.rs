use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::broadcast;
use tracing::{info, warn};

/// Broadcast-based shutdown coordinator.
///
/// Long-running tasks `select!` on [`ShutdownSignal::wait`] (or a receiver
/// from [`ShutdownSignal::subscribe`]) next to their main work.
///
/// ```ignore
/// let shutdown = ShutdownSignal::new();
/// let waiter = shutdown.clone();
///
/// tokio::select! {
///     _ = waiter.wait() => { /* stop */ }
///     _ = do_work() => {}
/// }
/// ```
#[derive(Debug, Clone)]
pub struct ShutdownSignal {
    trigger: broadcast::Sender<()>,
    shutting_down: Arc<AtomicBool>,
}

impl ShutdownSignal {
    pub fn new() -> Self {
        let (trigger, _) = broadcast::channel(1);
        Self {
            trigger,
            shutting_down: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.trigger.subscribe()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::Relaxed)
    }

    /// Trigger shutdown for all subscribers. Later calls only log.
    pub fn trigger(&self) {
        if self
            .shutting_down
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::Relaxed)
            .is_ok()
        {
            info!("shutdown signal triggered");
            let _ = self.trigger.send(());
        } else {
            warn!("shutdown already triggered");
        }
    }

    /// Resolve once shutdown has been triggered, including before the call.
    pub async fn wait(&self) {
        let mut rx = self.subscribe();
        if self.is_shutting_down() {
            return;
        }
        let _ = rx.recv().await;
    }

    pub fn subscriber_count(&self) -> usize {
        self.trigger.receiver_count()
    }
}

impl Default for ShutdownSignal {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn trigger_is_idempotent_and_shared_by_clones() {
        let signal = ShutdownSignal::new();
        let clone = signal.clone();
        assert!(!clone.is_shutting_down());
        signal.trigger();
        signal.trigger();
        assert!(clone.is_shutting_down());
    }

    #[test]
    fn subscriber_count_tracks_receivers() {
        let signal = ShutdownSignal::new();
        let rx = signal.subscribe();
        assert_eq!(signal.subscriber_count(), 1);
        drop(rx);
        assert_eq!(signal.subscriber_count(), 0);
    }

    #[tokio::test]
    async fn wait_returns_after_trigger() {
        let signal = ShutdownSignal::new();
        let waiter = signal.clone();
        let task = tokio::spawn(async move { waiter.wait().await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        signal.trigger();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn wait_after_trigger_returns_immediately() {
        let signal = ShutdownSignal::new();
        signal.trigger();
        tokio::time::timeout(Duration::from_millis(100), signal.wait())
            .await
            .unwrap();
    }
}
