//! Chat process manager
//!
//! Keeps one persistent worker process per chat session, exchanges
//! line-delimited JSON with it over stdio, bounds the number of live workers
//! and reaps the ones that sit idle.

pub mod commands;
pub mod config;
pub mod driver;
pub mod reaper;
pub mod registry;
pub mod worker;

mod error;
mod state;
mod utils;

pub use config::ManagerConfig;
pub use error::{Error, Result};
pub use registry::{RegistryOptions, SessionRegistry};
pub use state::ChatManager;

use std::sync::Arc;

use tracing_subscriber::EnvFilter;

fn init_tracing() {
    let mut filter = EnvFilter::from_default_env();
    if let Ok(directive) = "chat_process_manager=debug".parse() {
        filter = filter.add_directive(directive);
    }

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

/// Run the stdio front end until input ends or Ctrl-C
pub async fn run() -> Result<()> {
    init_tracing();

    tracing::info!("Starting chat process manager");

    let config = config::load()?;
    let manager = Arc::new(ChatManager::new(config)?);
    manager.start_reaper();

    let stdin = tokio::io::BufReader::new(tokio::io::stdin());
    let stdout = tokio::io::stdout();

    let served = tokio::select! {
        result = driver::serve(manager.clone(), stdin, stdout) => result,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Interrupted");
            Ok(())
        }
    };

    manager.shutdown().await;
    served
}
