//! Manager configuration
//!
//! Reads `config.toml` from `$CHAT_MANAGER_CONFIG` or the user config directory,
//! then applies `CHAT_*` environment overrides.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Environment variable pointing at an explicit config file
pub const CONFIG_PATH_ENV: &str = "CHAT_MANAGER_CONFIG";

/// Process-manager settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ManagerConfig {
    /// Worker executable (bare names are looked up in PATH)
    pub worker_program: String,

    /// Arguments passed to the worker, typically the script path
    pub worker_args: Vec<String>,

    /// Working directory for workers; defaults to the worker script's directory
    pub working_dir: Option<PathBuf>,

    /// Extra environment variables for every worker
    pub env: HashMap<String, String>,

    /// Maximum number of live workers
    pub max_processes: usize,

    pub handshake_timeout_secs: u64,

    pub dispatch_timeout_secs: u64,

    /// Idle time after which a worker is reaped
    pub idle_ttl_secs: u64,

    pub reap_interval_secs: u64,

    /// How long a terminating worker gets to exit before it is killed
    pub shutdown_grace_ms: u64,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            worker_program: "python3".to_string(),
            worker_args: vec!["scripts/persistent_bot.py".to_string()],
            working_dir: None,
            env: HashMap::new(),
            max_processes: 10,
            handshake_timeout_secs: 30,
            dispatch_timeout_secs: 60,
            idle_ttl_secs: 30 * 60,
            reap_interval_secs: 5 * 60,
            shutdown_grace_ms: 2000,
        }
    }
}

impl ManagerConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_secs(self.handshake_timeout_secs)
    }

    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_secs(self.reap_interval_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    /// Reject settings the manager cannot run with
    pub fn validate(&self) -> Result<()> {
        if self.worker_program.trim().is_empty() {
            return Err(Error::Config("worker_program must not be empty".to_string()));
        }
        if self.max_processes == 0 {
            return Err(Error::Config("max_processes must be at least 1".to_string()));
        }
        let timeouts = [
            ("handshake_timeout_secs", self.handshake_timeout_secs),
            ("dispatch_timeout_secs", self.dispatch_timeout_secs),
            ("idle_ttl_secs", self.idle_ttl_secs),
            ("reap_interval_secs", self.reap_interval_secs),
        ];
        for (name, value) in timeouts {
            if value == 0 {
                return Err(Error::Config(format!("{} must be greater than zero", name)));
            }
        }
        Ok(())
    }

    /// Apply `CHAT_*` overrides from the given variable lookup
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(program) = lookup("CHAT_WORKER_PROGRAM") {
            self.worker_program = program;
        }

        let numeric = |name: &str| -> Result<Option<u64>> {
            match lookup(name) {
                Some(raw) => raw
                    .trim()
                    .parse::<u64>()
                    .map(Some)
                    .map_err(|e| Error::Config(format!("{}={:?}: {}", name, raw, e))),
                None => Ok(None),
            }
        };

        if let Some(v) = numeric("CHAT_MAX_PROCESSES")? {
            self.max_processes = v as usize;
        }
        if let Some(v) = numeric("CHAT_HANDSHAKE_TIMEOUT_SECS")? {
            self.handshake_timeout_secs = v;
        }
        if let Some(v) = numeric("CHAT_DISPATCH_TIMEOUT_SECS")? {
            self.dispatch_timeout_secs = v;
        }
        if let Some(v) = numeric("CHAT_IDLE_TTL_SECS")? {
            self.idle_ttl_secs = v;
        }
        if let Some(v) = numeric("CHAT_REAP_INTERVAL_SECS")? {
            self.reap_interval_secs = v;
        }

        Ok(())
    }
}

/// Default location of the config file
pub fn default_config_path() -> PathBuf {
    dirs::config_dir()
        .map(|d| d.join("chat-process-manager"))
        .unwrap_or_else(|| PathBuf::from(".chat-process-manager"))
        .join("config.toml")
}

/// Load configuration from the standard location plus environment overrides
pub fn load() -> Result<ManagerConfig> {
    let path = std::env::var_os(CONFIG_PATH_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(default_config_path);

    let mut config = if path.exists() {
        read_config_from_path(&path)?
    } else {
        tracing::warn!("Config not found at {:?}, using defaults", path);
        ManagerConfig::default()
    };

    config.apply_env_overrides(|name| std::env::var(name).ok())?;
    config.validate()?;
    Ok(config)
}

/// Read configuration from a specific path
pub fn read_config_from_path(path: &Path) -> Result<ManagerConfig> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;

    let config: ManagerConfig = toml::from_str(&content)
        .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;

    tracing::debug!(
        "Loaded config from {:?} (max_processes={}, idle_ttl={}s)",
        path,
        config.max_processes,
        config.idle_ttl_secs
    );

    Ok(config)
}
