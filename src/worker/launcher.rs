//! Worker process launcher
//!
//! Spawns one worker per chat and waits for its readiness handshake.

use std::collections::HashMap;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use super::handle::WorkerHandle;
use crate::config::ManagerConfig;
use crate::utils;
use crate::{Error, Result};

/// Environment variable carrying the session id into the worker
pub const CHAT_ID_ENV: &str = "CHAT_ID";

/// How to start a worker process
#[derive(Debug, Clone)]
pub struct WorkerCommand {
    pub program: PathBuf,
    pub args: Vec<String>,
    pub working_dir: PathBuf,
    pub env: HashMap<String, String>,
}

impl WorkerCommand {
    /// Resolve the configured program and working directory
    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        let program = utils::resolve_program(&config.worker_program)?;
        let mut args = config.worker_args.clone();
        utils::absolutize_script(&mut args);
        let working_dir = utils::worker_directory(config.working_dir.as_deref(), &program, &args)?;

        Ok(Self {
            program,
            args,
            working_dir,
            env: config.env.clone(),
        })
    }
}

/// Starts workers and performs the readiness handshake
#[derive(Debug, Clone)]
pub struct Launcher {
    command: WorkerCommand,
    handshake_timeout: Duration,
    shutdown_grace: Duration,
}

impl Launcher {
    pub fn new(command: WorkerCommand, handshake_timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            command,
            handshake_timeout,
            shutdown_grace,
        }
    }

    pub fn from_config(config: &ManagerConfig) -> Result<Self> {
        Ok(Self::new(
            WorkerCommand::from_config(config)?,
            config.handshake_timeout(),
            config.shutdown_grace(),
        ))
    }

    pub fn command(&self) -> &WorkerCommand {
        &self.command
    }

    /// Spawn a worker for `session_id` and wait until it reports ready.
    ///
    /// The partially started process is terminated on any failure.
    pub async fn launch(&self, session_id: &str) -> Result<Arc<WorkerHandle>> {
        tracing::info!(
            "Launching worker for chat {}: {:?} {:?}",
            session_id,
            self.command.program,
            self.command.args
        );

        let child = tokio::process::Command::new(&self.command.program)
            .args(&self.command.args)
            .current_dir(&self.command.working_dir)
            .envs(&self.command.env)
            .env(CHAT_ID_ENV, session_id)
            .env("PYTHONUNBUFFERED", "1")
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                Error::SpawnFailure(format!(
                    "Failed to spawn {}: {}",
                    self.command.program.display(),
                    e
                ))
            })?;

        let handle = WorkerHandle::from_child(session_id, child, self.shutdown_grace)?;

        if let Err(e) = handle.await_ready(self.handshake_timeout).await {
            tracing::warn!("Worker for chat {} failed to start: {}", session_id, e);
            handle.terminate();
            return Err(e);
        }

        tracing::info!(
            "Worker for chat {} ready (pid {:?})",
            session_id,
            handle.pid()
        );

        Ok(handle)
    }
}
