//! Chat worker processes
//!
//! This module handles spawning, handshaking and exchanging line-delimited JSON
//! with the per-chat worker subprocesses.

mod handle;
mod launcher;
pub mod protocol;

pub use handle::{Exchange, WorkerHandle, WorkerSnapshot, WorkerState};
pub use launcher::{Launcher, WorkerCommand, CHAT_ID_ENV};
