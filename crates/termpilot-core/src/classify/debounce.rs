use std::time::Duration;

use tokio::sync::mpsc;
use tokio::time::timeout;

/// Trailing-edge debouncer: fires the callback once after `quiet` elapses
/// with no further pings. A burst of pings collapses into one firing.
pub struct Debouncer {
    tx: mpsc::UnboundedSender<()>,
}

impl Debouncer {
    pub fn new<F>(quiet: Duration, mut on_quiet: F) -> Self
    where
        F: FnMut() + Send + 'static,
    {
        let (tx, mut rx) = mpsc::unbounded_channel::<()>();

        tokio::spawn(async move {
            // Outer recv blocks until the first ping of a burst.
            while rx.recv().await.is_some() {
                loop {
                    match timeout(quiet, rx.recv()).await {
                        // Another ping inside the window: restart it.
                        Ok(Some(())) => continue,
                        // Sender dropped.
                        Ok(None) => return,
                        // Window expired with no traffic.
                        Err(_) => {
                            on_quiet();
                            break;
                        }
                    }
                }
            }
        });

        Self { tx }
    }

    /// Signal activity. Restarts the quiet window.
    pub fn ping(&self) {
        let _ = self.tx.send(());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn test_burst_collapses_to_one_firing() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let deb = Debouncer::new(Duration::from_millis(50), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        for _ in 0..10 {
            deb.ping();
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_separate_bursts_fire_separately() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let deb = Debouncer::new(Duration::from_millis(30), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        deb.ping();
        tokio::time::sleep(Duration::from_millis(100)).await;
        deb.ping();
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_no_ping_no_firing() {
        let count = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&count);
        let _deb = Debouncer::new(Duration::from_millis(20), move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(count.load(Ordering::SeqCst), 0);
    }
}
