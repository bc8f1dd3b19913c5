//! Shutdown coordination.

use std::time::Duration;

use tokio::sync::broadcast;
use tokio::task::JoinHandle;

/// Coordinator for graceful shutdown.
///
/// Background tasks (bootstrap watcher notices, signal listener) subscribe
/// and exit when the signal fires.
#[derive(Debug)]
pub struct Shutdown {
    tx: broadcast::Sender<()>,
}

impl Shutdown {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(1);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<()> {
        self.tx.subscribe()
    }

    pub fn trigger(&self) {
        let _ = self.tx.send(());
    }

    /// Tasks still listening.
    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }

    /// Wait up to `deadline` for `tasks` to finish, then abort the rest.
    /// Returns how many had to be aborted.
    pub async fn drain(&self, tasks: Vec<JoinHandle<()>>, deadline: Duration) -> usize {
        let started = tokio::time::Instant::now();
        let mut aborted = 0;
        for mut task in tasks {
            let left = deadline.saturating_sub(started.elapsed());
            if tokio::time::timeout(left, &mut task).await.is_err() {
                task.abort();
                aborted += 1;
            }
        }
        if aborted > 0 {
            tracing::warn!(aborted, "Shutdown deadline reached, aborted remaining tasks");
        }
        aborted
    }
}

impl Default for Shutdown {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_drain_waits_for_listeners() {
        let shutdown = Shutdown::new();
        let mut rx = shutdown.subscribe();
        let task = tokio::spawn(async move {
            let _ = rx.recv().await;
        });
        assert_eq!(shutdown.receiver_count(), 1);

        shutdown.trigger();
        let aborted = shutdown.drain(vec![task], Duration::from_secs(1)).await;
        assert_eq!(aborted, 0);
    }

    #[tokio::test]
    async fn test_drain_aborts_stuck_tasks() {
        let shutdown = Shutdown::new();
        let stuck = tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
        });
        let aborted = shutdown.drain(vec![stuck], Duration::from_millis(20)).await;
        assert_eq!(aborted, 1);
    }
}
