//! Session management commands

use serde::{Deserialize, Serialize};

use crate::state::ChatManager;
use crate::worker::WorkerSnapshot;

/// Live workers, sorted by chat id
pub fn list_sessions(manager: &ChatManager) -> Vec<WorkerSnapshot> {
    manager.sessions()
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CloseReply {
    pub chat_id: String,
    pub closed: bool,
}

/// Stop a chat's worker. Closing a chat without a worker is not an error.
pub async fn close_session(manager: &ChatManager, chat_id: String) -> CloseReply {
    let closed = manager.close_chat(&chat_id).await;
    if closed {
        tracing::info!("Closed chat {}", chat_id);
    }
    CloseReply { chat_id, closed }
}
