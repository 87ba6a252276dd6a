//! Chat manager state
//!
//! Explicitly constructed owner of the session registry and the idle reaper.
//! Whatever serves chat requests holds one of these.

use std::sync::Arc;

use parking_lot::Mutex;

use crate::config::ManagerConfig;
use crate::reaper::IdleReaper;
use crate::registry::{RegistryOptions, SessionRegistry};
use crate::worker::{Launcher, WorkerHandle, WorkerSnapshot};
use crate::Result;

pub struct ChatManager {
    config: ManagerConfig,

    /// Chat id → worker mapping
    registry: Arc<SessionRegistry>,

    /// Running idle sweep, if started
    reaper: Mutex<Option<IdleReaper>>,
}

impl ChatManager {
    /// Build a manager from configuration. Fails if the worker program cannot be found.
    pub fn new(config: ManagerConfig) -> Result<Self> {
        config.validate()?;
        let launcher = Launcher::from_config(&config)?;
        Ok(Self::with_launcher(config, launcher))
    }

    /// Build a manager around an already resolved launcher. Registry limits
    /// still come from `config`.
    pub fn with_launcher(config: ManagerConfig, launcher: Launcher) -> Self {
        let registry = SessionRegistry::new(launcher, RegistryOptions::from_config(&config));
        Self {
            config,
            registry: Arc::new(registry),
            reaper: Mutex::new(None),
        }
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Start the idle reaper if it is not running
    pub fn start_reaper(&self) {
        let mut reaper = self.reaper.lock();
        if reaper.is_none() {
            *reaper = Some(IdleReaper::spawn(
                self.registry.clone(),
                self.config.reap_interval(),
            ));
            tracing::info!(
                "Idle reaper started (every {:?}, ttl {:?})",
                self.config.reap_interval(),
                self.config.idle_ttl()
            );
        }
    }

    /// Send a message to the chat's worker, starting one if needed
    pub async fn send_message(&self, chat_id: &str, message: &str) -> Result<String> {
        self.registry.dispatch(chat_id, message).await
    }

    /// Start the chat's worker ahead of its first message
    pub async fn prewarm(&self, chat_id: &str) -> Result<Arc<WorkerHandle>> {
        self.registry.resolve(chat_id).await
    }

    /// Stop the chat's worker. Returns whether one was running.
    pub async fn close_chat(&self, chat_id: &str) -> bool {
        self.registry.remove(chat_id).await
    }

    pub fn sessions(&self) -> Vec<WorkerSnapshot> {
        self.registry.snapshot()
    }

    pub fn session_count(&self) -> usize {
        self.registry.count()
    }

    /// Stop the reaper and every worker
    pub async fn shutdown(&self) {
        let reaper = self.reaper.lock().take();
        if let Some(reaper) = reaper {
            reaper.stop().await;
        }
        self.registry.shutdown().await;
        tracing::info!("Chat manager stopped");
    }
}
