//! Idle worker reaper
//!
//! Periodically sweeps the registry and terminates workers that have not
//! served a request within the idle TTL.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

use crate::registry::SessionRegistry;

/// Background sweep task
pub struct IdleReaper {
    shutdown_tx: Option<mpsc::Sender<()>>,
    task: JoinHandle<()>,
}

impl IdleReaper {
    /// Start sweeping every `interval`. The first sweep runs one interval from now.
    pub fn spawn(registry: Arc<SessionRegistry>, interval: Duration) -> Self {
        let (shutdown_tx, mut shutdown_rx) = mpsc::channel::<()>(1);

        let task = tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + interval, interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            tracing::debug!("Idle reaper started (interval {:?})", interval);

            loop {
                tokio::select! {
                    _ = shutdown_rx.recv() => {
                        tracing::debug!("Idle reaper received shutdown signal");
                        break;
                    }
                    _ = ticker.tick() => {
                        let reaped = registry.reap_idle();
                        if !reaped.is_empty() {
                            tracing::info!(
                                "Reaped {} idle workers, {} remaining",
                                reaped.len(),
                                registry.count()
                            );
                        }
                    }
                }
            }
        });

        Self {
            shutdown_tx: Some(shutdown_tx),
            task,
        }
    }

    /// Stop sweeping and wait for the task to finish
    pub async fn stop(mut self) {
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(()).await;
        }
        let _ = self.task.await;
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::registry::RegistryOptions;
    use crate::worker::test_support::{self, ScriptWorker};
    use crate::worker::WorkerState;

    #[tokio::test]
    async fn test_reaper_removes_idle_worker() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = Arc::new(SessionRegistry::new(
            worker.launcher(),
            RegistryOptions {
                max_processes: 10,
                dispatch_timeout: Duration::from_secs(5),
                idle_ttl: Duration::from_millis(100),
            },
        ));

        let handle = registry.resolve("42").await.unwrap();
        let reaper = IdleReaper::spawn(registry.clone(), Duration::from_millis(50));

        tokio::time::sleep(Duration::from_millis(400)).await;
        assert_eq!(registry.count(), 0);
        assert_eq!(handle.state(), WorkerState::Dead);

        reaper.stop().await;
    }

    #[tokio::test]
    async fn test_stop_ends_task() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = Arc::new(SessionRegistry::new(
            worker.launcher(),
            RegistryOptions {
                max_processes: 1,
                dispatch_timeout: Duration::from_secs(5),
                idle_ttl: Duration::from_secs(600),
            },
        ));

        let reaper = IdleReaper::spawn(registry.clone(), Duration::from_secs(3600));
        tokio::time::timeout(Duration::from_secs(1), reaper.stop())
            .await
            .expect("reaper did not stop");
    }
}
