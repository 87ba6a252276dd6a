//! Session registry
//!
//! Maps chat ids to their worker. Each chat id owns a slot guarded by an async
//! mutex; launching, checkout, removal and reaping of a chat all go through that
//! slot, so the reaper can never retire a worker a request is about to use.
//! A global counter reserves capacity before a launch starts.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;

use crate::config::ManagerConfig;
use crate::worker::{Exchange, Launcher, WorkerHandle, WorkerSnapshot, WorkerState};
use crate::{Error, Result};

type Slot = Arc<AsyncMutex<Option<Arc<WorkerHandle>>>>;

/// Registry limits
#[derive(Debug, Clone)]
pub struct RegistryOptions {
    pub max_processes: usize,
    pub dispatch_timeout: Duration,
    pub idle_ttl: Duration,
}

impl RegistryOptions {
    pub fn from_config(config: &ManagerConfig) -> Self {
        Self {
            max_processes: config.max_processes,
            dispatch_timeout: config.dispatch_timeout(),
            idle_ttl: config.idle_ttl(),
        }
    }
}

/// Owner of all live chat workers
pub struct SessionRegistry {
    launcher: Launcher,
    options: RegistryOptions,
    slots: Mutex<HashMap<String, Slot>>,
    live: AtomicUsize,
    closed: AtomicBool,
}

impl SessionRegistry {
    pub fn new(launcher: Launcher, options: RegistryOptions) -> Self {
        Self {
            launcher,
            options,
            slots: Mutex::new(HashMap::new()),
            live: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        }
    }

    pub fn options(&self) -> &RegistryOptions {
        &self.options
    }

    /// Number of workers, including launches in progress
    pub fn count(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }

    /// Chat ids that currently have a registry slot
    pub fn session_ids(&self) -> Vec<String> {
        self.slots.lock().keys().cloned().collect()
    }

    fn slot(&self, session_id: &str) -> Slot {
        self.slots
            .lock()
            .entry(session_id.to_string())
            .or_insert_with(|| Arc::new(AsyncMutex::new(None)))
            .clone()
    }

    /// Return the chat's worker, launching one if there is none
    pub async fn resolve(&self, session_id: &str) -> Result<Arc<WorkerHandle>> {
        let slot = self.slot(session_id);
        let result = {
            let mut current = slot.lock().await;
            self.resolve_locked(session_id, &mut current).await
        };
        if result.is_err() {
            self.prune(session_id, &slot);
        }
        result
    }

    /// Resolve the chat's worker and start a request on it in one step
    pub async fn checkout(&self, session_id: &str) -> Result<Exchange> {
        let slot = self.slot(session_id);
        let result = {
            let mut current = slot.lock().await;
            match self.resolve_locked(session_id, &mut current).await {
                Ok(handle) => handle.try_begin(),
                Err(e) => Err(e),
            }
        };
        if result.is_err() {
            self.prune(session_id, &slot);
        }
        result
    }

    async fn resolve_locked(
        &self,
        session_id: &str,
        current: &mut Option<Arc<WorkerHandle>>,
    ) -> Result<Arc<WorkerHandle>> {
        if let Some(handle) = current.as_ref() {
            if handle.is_available() {
                return Ok(handle.clone());
            }
        }

        if let Some(stale) = current.take() {
            tracing::debug!(
                "Replacing {} worker for chat {}",
                stale.state(),
                session_id
            );
            self.release();
            stale.terminate();
        }

        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::Other("Session registry is shut down".to_string()));
        }

        self.reserve()?;
        match self.launcher.launch(session_id).await {
            Ok(handle) => {
                *current = Some(handle.clone());
                Ok(handle)
            }
            Err(e) => {
                self.release();
                Err(e)
            }
        }
    }

    /// Send one message to the chat's worker.
    ///
    /// A worker retired by the exchange is dropped from the registry so the
    /// next request starts a fresh process.
    pub async fn dispatch(&self, session_id: &str, message: &str) -> Result<String> {
        let exchange = self.checkout(session_id).await?;
        let handle = exchange.handle().clone();

        let result = exchange.send(message, self.options.dispatch_timeout).await;

        if handle.state() == WorkerState::Dead {
            self.remove_handle(session_id, &handle).await;
        }
        result
    }

    /// Remove and terminate the chat's worker. Returns whether one was present.
    pub async fn remove(&self, session_id: &str) -> bool {
        self.remove_matching(session_id, |_| true).await
    }

    /// Remove the chat's worker only if it is `handle`
    pub async fn remove_handle(&self, session_id: &str, handle: &Arc<WorkerHandle>) -> bool {
        self.remove_matching(session_id, |current| Arc::ptr_eq(current, handle))
            .await
    }

    async fn remove_matching<F>(&self, session_id: &str, matches: F) -> bool
    where
        F: Fn(&Arc<WorkerHandle>) -> bool,
    {
        let slot = self.slots.lock().get(session_id).cloned();
        let slot = match slot {
            Some(slot) => slot,
            None => return false,
        };

        let removed = {
            let mut current = slot.lock().await;
            match current.as_ref() {
                Some(handle) if matches(handle) => current.take(),
                _ => None,
            }
        };

        let found = match removed {
            Some(handle) => {
                self.release();
                handle.terminate();
                tracing::info!("Removed worker for chat {}", session_id);
                true
            }
            None => false,
        };

        self.prune(session_id, &slot);
        found
    }

    /// Terminate workers idle for longer than the TTL, plus any whose process
    /// has already gone. Busy workers and chats with a launch in progress are
    /// left for the next sweep. Returns the reaped chat ids.
    pub fn reap_idle(&self) -> Vec<String> {
        let ttl = self.options.idle_ttl;
        let now = Instant::now();
        let slots: Vec<(String, Slot)> = self
            .slots
            .lock()
            .iter()
            .map(|(id, slot)| (id.clone(), slot.clone()))
            .collect();

        let mut reaped = Vec::new();
        for (session_id, slot) in slots {
            let expired = {
                let mut current = match slot.try_lock() {
                    Ok(current) => current,
                    Err(_) => {
                        tracing::debug!("Skipping chat {}: launch in progress", session_id);
                        continue;
                    }
                };

                let expired = match current.as_ref() {
                    Some(handle) => {
                        let gone = handle.state() != WorkerState::Busy && !handle.is_available();
                        gone || handle.try_mark_expired(ttl, now)
                    }
                    None => false,
                };

                if expired {
                    current.take()
                } else {
                    None
                }
            };

            if let Some(handle) = expired {
                tracing::info!(
                    "Reaping worker for chat {} (pid {:?}, idle {:?})",
                    session_id,
                    handle.pid(),
                    now.saturating_duration_since(handle.last_used_at())
                );
                self.release();
                handle.terminate();
                reaped.push(session_id.clone());
            }

            self.prune(&session_id, &slot);
        }

        reaped
    }

    /// Status of every registered worker
    pub fn snapshot(&self) -> Vec<WorkerSnapshot> {
        let slots: Vec<Slot> = self.slots.lock().values().cloned().collect();
        let mut rows: Vec<WorkerSnapshot> = slots
            .iter()
            .filter_map(|slot| {
                slot.try_lock()
                    .ok()
                    .and_then(|current| current.as_ref().map(|h| h.snapshot()))
            })
            .collect();
        rows.sort_by(|a, b| a.chat_id.cmp(&b.chat_id));
        rows
    }

    /// Terminate every worker and refuse further launches. Waits for each
    /// process to exit or be killed.
    pub async fn shutdown(&self) {
        self.closed.store(true, Ordering::SeqCst);

        let slots: Vec<(String, Slot)> = self.slots.lock().drain().collect();
        let mut exits = Vec::new();

        for (session_id, slot) in slots {
            let handle = slot.lock().await.take();
            if let Some(handle) = handle {
                tracing::debug!("Stopping worker for chat {}", session_id);
                self.release();
                if let Some(exit) = handle.terminate() {
                    exits.push(exit);
                }
            }
        }

        let stopped = exits.len();
        for exit in exits {
            let _ = exit.await;
        }
        tracing::info!("Stopped {} workers", stopped);
    }

    fn reserve(&self) -> Result<()> {
        let limit = self.options.max_processes;
        self.live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| {
                (n < limit).then_some(n + 1)
            })
            .map(|_| ())
            .map_err(|_| {
                tracing::warn!("Worker capacity reached ({})", limit);
                Error::CapacityExceeded { limit }
            })
    }

    fn release(&self) {
        let _ = self
            .live
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
    }

    /// Drop an empty slot nobody else is holding
    fn prune(&self, session_id: &str, slot: &Slot) {
        let mut slots = self.slots.lock();
        let same = slots
            .get(session_id)
            .map(|s| Arc::ptr_eq(s, slot))
            .unwrap_or(false);
        // one reference in the map, one held by the caller
        if !same || Arc::strong_count(slot) > 2 {
            return;
        }
        let empty = slot.try_lock().map(|current| current.is_none()).unwrap_or(false);
        if empty {
            slots.remove(session_id);
        }
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::worker::test_support::{self, ScriptWorker};

    fn registry(worker: &ScriptWorker, max_processes: usize) -> Arc<SessionRegistry> {
        Arc::new(SessionRegistry::new(
            worker.launcher(),
            RegistryOptions {
                max_processes,
                dispatch_timeout: Duration::from_secs(5),
                idle_ttl: Duration::from_secs(600),
            },
        ))
    }

    #[tokio::test]
    async fn test_resolve_reuses_worker() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 10);

        let first = registry.resolve("42").await.unwrap();
        let second = registry.resolve("42").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(registry.count(), 1);
        assert_eq!(worker.start_count(), 1);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_resolve_launches_once() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 10);

        let tasks: Vec<_> = (0..5)
            .map(|_| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve("same").await })
            })
            .collect();

        let mut pids = Vec::new();
        for task in tasks {
            pids.push(task.await.unwrap().unwrap().pid());
        }
        pids.dedup();
        assert_eq!(pids.len(), 1);
        assert_eq!(worker.start_count(), 1);
        assert_eq!(registry.count(), 1);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_limit() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 2);

        registry.resolve("a").await.unwrap();
        registry.resolve("b").await.unwrap();
        let err = registry.resolve("c").await.unwrap_err();
        assert!(matches!(err, Error::CapacityExceeded { limit: 2 }));
        assert_eq!(registry.count(), 2);
        assert_eq!(worker.start_count(), 2);
        assert!(!registry.session_ids().contains(&"c".to_string()));

        // Existing chats keep working at capacity
        assert_eq!(registry.dispatch("a", "hi").await.unwrap(), "hi there");

        assert!(registry.remove("b").await);
        registry.resolve("c").await.unwrap();
        assert_eq!(registry.count(), 2);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_launches_respect_capacity() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 3);

        let tasks: Vec<_> = (0..8)
            .map(|i| {
                let registry = registry.clone();
                tokio::spawn(async move { registry.resolve(&format!("chat-{i}")).await })
            })
            .collect();

        let mut launched = 0;
        for task in tasks {
            match task.await.unwrap() {
                Ok(_) => launched += 1,
                Err(Error::CapacityExceeded { .. }) => {}
                Err(other) => panic!("unexpected error: {other:?}"),
            }
        }
        assert_eq!(launched, 3);
        assert_eq!(registry.count(), 3);
        assert_eq!(worker.start_count(), 3);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_dispatch_end_to_end() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 10);

        let reply = registry.dispatch("42", "hello").await.unwrap();
        assert_eq!(reply, "hi there");
        assert_eq!(registry.count(), 1);

        let handle = registry.resolve("42").await.unwrap();
        assert_eq!(handle.state(), WorkerState::Idle);
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_timeout_launches_fresh_worker() {
        let worker = ScriptWorker::new(test_support::SILENT);
        let registry = Arc::new(SessionRegistry::new(
            worker.launcher(),
            RegistryOptions {
                max_processes: 10,
                dispatch_timeout: Duration::from_millis(200),
                idle_ttl: Duration::from_secs(600),
            },
        ));

        let old = registry.resolve("42").await.unwrap();
        let err = registry.dispatch("42", "hello").await.unwrap_err();
        assert!(matches!(err, Error::DispatchTimeout(_)));
        assert_eq!(old.state(), WorkerState::Dead);
        assert_eq!(registry.count(), 0);

        let fresh = registry.resolve("42").await.unwrap();
        assert!(!Arc::ptr_eq(&old, &fresh));
        assert_ne!(old.pid(), fresh.pid());
        assert_eq!(worker.start_count(), 2);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_dispatch_same_chat_is_busy() {
        let worker = ScriptWorker::new(test_support::SLOW);
        let registry = registry(&worker, 10);
        registry.resolve("42").await.unwrap();

        let first = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.dispatch("42", "first").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let second = registry.dispatch("42", "second").await;
        assert!(matches!(second, Err(Error::Busy(_))));

        assert_eq!(first.await.unwrap().unwrap(), "done");
        assert_eq!(worker.input_count(), 1);
        registry.shutdown().await;
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_different_chats_dispatch_in_parallel() {
        let worker = ScriptWorker::new(test_support::SLOW);
        let registry = registry(&worker, 10);

        let started = std::time::Instant::now();
        let (a, b) = tokio::join!(registry.dispatch("a", "x"), registry.dispatch("b", "y"));
        assert_eq!(a.unwrap(), "done");
        assert_eq!(b.unwrap(), "done");
        // Each worker sleeps one second per message
        assert!(started.elapsed() < Duration::from_millis(1900));
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn test_reap_idle_workers() {
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
        registry.dispatch("42", "hello").await.unwrap();
        assert!(registry.reap_idle().is_empty());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(registry.reap_idle(), vec!["42".to_string()]);
        assert_eq!(registry.count(), 0);
        assert_eq!(handle.state(), WorkerState::Dead);
        assert!(registry.session_ids().is_empty());

        // Reaping is idempotent
        assert!(registry.reap_idle().is_empty());
        assert!(!registry.remove("42").await);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_reap_skips_busy_workers() {
        let worker = ScriptWorker::new(test_support::SLOW);
        let registry = Arc::new(SessionRegistry::new(
            worker.launcher(),
            RegistryOptions {
                max_processes: 10,
                dispatch_timeout: Duration::from_secs(5),
                idle_ttl: Duration::from_millis(1),
            },
        ));
        registry.resolve("42").await.unwrap();

        let in_flight = {
            let registry = registry.clone();
            tokio::spawn(async move { registry.dispatch("42", "slow").await })
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        assert!(registry.reap_idle().is_empty());
        assert_eq!(registry.count(), 1);

        assert_eq!(in_flight.await.unwrap().unwrap(), "done");
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(registry.reap_idle(), vec!["42".to_string()]);
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 10);

        let handle = registry.resolve("42").await.unwrap();
        assert!(registry.remove("42").await);
        assert!(!registry.remove("42").await);
        assert!(!registry.remove("never-seen").await);
        assert!(matches!(
            handle.state(),
            WorkerState::Terminating | WorkerState::Dead
        ));
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn test_failed_launch_frees_capacity() {
        let worker = ScriptWorker::new("exit 1\n");
        let registry = registry(&worker, 1);

        assert!(matches!(registry.resolve("a").await, Err(Error::SpawnFailure(_))));
        assert_eq!(registry.count(), 0);
        assert!(registry.session_ids().is_empty());
        assert!(matches!(registry.resolve("b").await, Err(Error::SpawnFailure(_))));
    }

    #[tokio::test]
    async fn test_shutdown_stops_everything() {
        let worker = ScriptWorker::new(test_support::REPLY_HI);
        let registry = registry(&worker, 10);

        let a = registry.resolve("a").await.unwrap();
        let b = registry.resolve("b").await.unwrap();
        registry.shutdown().await;

        assert_eq!(registry.count(), 0);
        assert_eq!(a.state(), WorkerState::Dead);
        assert_eq!(b.state(), WorkerState::Dead);
        assert!(matches!(registry.resolve("c").await, Err(Error::Other(_))));
    }
}
