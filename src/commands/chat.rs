//! Chat commands: send a message, pre-warm a chat's worker

use serde::{Deserialize, Deserializer, Serialize};
use tracing::Instrument;

use crate::state::ChatManager;
use crate::Error;

/// Body of a chat turn
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatRequest {
    pub message: String,
    #[serde(deserialize_with = "deserialize_chat_id")]
    pub chat_id: String,
}

/// Successful chat turn
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ChatReply {
    pub response: String,
}

/// Failed chat turn, reported with a 500 status by the HTTP layer
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ChatFailure {
    pub error: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub request_id: String,
}

impl ChatFailure {
    pub fn from_error(error: &Error, request_id: &str) -> Self {
        Self {
            error: error.to_string(),
            kind: error.kind().to_string(),
            request_id: request_id.to_string(),
        }
    }
}

/// Request to start a chat's worker before its first message
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitRequest {
    #[serde(deserialize_with = "deserialize_chat_id")]
    pub chat_id: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct InitReply {
    pub status: String,
    pub chat_id: String,
}

/// Chat ids arrive as strings or numbers
pub(crate) fn deserialize_chat_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawChatId {
        Text(String),
        Number(serde_json::Number),
    }

    Ok(match RawChatId::deserialize(deserializer)? {
        RawChatId::Text(s) => s,
        RawChatId::Number(n) => n.to_string(),
    })
}

fn new_request_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

fn validate_chat_id(chat_id: &str) -> crate::Result<()> {
    if chat_id.trim().is_empty() {
        return Err(Error::InvalidRequest("chatId is required".to_string()));
    }
    Ok(())
}

/// Run one chat turn
pub async fn send_message(
    manager: &ChatManager,
    request: ChatRequest,
) -> Result<ChatReply, ChatFailure> {
    let request_id = new_request_id();
    let span = tracing::info_span!("chat", request_id = %request_id, chat_id = %request.chat_id);

    async {
        let result = async {
            validate_chat_id(&request.chat_id)?;
            if request.message.trim().is_empty() {
                return Err(Error::InvalidRequest("message is required".to_string()));
            }
            manager.send_message(&request.chat_id, &request.message).await
        }
        .await;

        match result {
            Ok(response) => {
                tracing::debug!("Reply ready ({} chars)", response.len());
                Ok(ChatReply { response })
            }
            Err(e) => {
                tracing::warn!("Chat turn failed: {}", e);
                Err(ChatFailure::from_error(&e, &request_id))
            }
        }
    }
    .instrument(span)
    .await
}

/// Pre-warm a chat's worker
pub async fn init_chat(
    manager: &ChatManager,
    request: InitRequest,
) -> Result<InitReply, ChatFailure> {
    let request_id = new_request_id();
    let span = tracing::info_span!("init", request_id = %request_id, chat_id = %request.chat_id);

    async {
        let result = async {
            validate_chat_id(&request.chat_id)?;
            manager.prewarm(&request.chat_id).await
        }
        .await;

        match result {
            Ok(handle) => {
                tracing::info!("Chat initialized (pid {:?})", handle.pid());
                Ok(InitReply {
                    status: "ready".to_string(),
                    chat_id: request.chat_id.clone(),
                })
            }
            Err(e) => {
                tracing::warn!("Chat initialization failed: {}", e);
                Err(ChatFailure::from_error(&e, &request_id))
            }
        }
    }
    .instrument(span)
    .await
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chat_id_accepts_numbers() {
        let request: ChatRequest =
            serde_json::from_str(r#"{"message":"hello","chatId":42}"#).unwrap();
        assert_eq!(request.chat_id, "42");

        let request: ChatRequest =
            serde_json::from_str(r#"{"message":"hello","chatId":"abc-1"}"#).unwrap();
        assert_eq!(request.chat_id, "abc-1");

        assert!(serde_json::from_str::<ChatRequest>(r#"{"message":"hello"}"#).is_err());
        assert!(serde_json::from_str::<InitRequest>(r#"{"chatId":[1]}"#).is_err());
    }

    #[test]
    fn test_failure_shape() {
        let failure = ChatFailure::from_error(&Error::CapacityExceeded { limit: 10 }, "req-1");
        let value = serde_json::to_value(&failure).unwrap();
        assert_eq!(value["type"], "capacity_exceeded");
        assert_eq!(value["requestId"], "req-1");
        assert!(value["error"].as_str().unwrap().contains("capacity"));
    }

    #[cfg(unix)]
    mod process {
        use super::*;
        use crate::state::tests::manager;
        use crate::worker::test_support::{self, ScriptWorker};

        #[tokio::test]
        async fn test_send_message_round_trip() {
            let worker = ScriptWorker::new(test_support::REPLY_HI);
            let manager = manager(&worker, 10);

            let request: ChatRequest =
                serde_json::from_str(r#"{"message":"hello","chatId":42}"#).unwrap();
            let reply = send_message(&manager, request).await.unwrap();
            assert_eq!(reply.response, "hi there");
            assert_eq!(manager.session_count(), 1);
            manager.shutdown().await;
        }

        #[tokio::test]
        async fn test_empty_message_is_rejected_without_launch() {
            let worker = ScriptWorker::new(test_support::REPLY_HI);
            let manager = manager(&worker, 10);

            let request = ChatRequest {
                message: "   ".to_string(),
                chat_id: "42".to_string(),
            };
            let failure = send_message(&manager, request).await.unwrap_err();
            assert_eq!(failure.kind, "invalid_request");
            assert_eq!(worker.start_count(), 0);
        }

        #[tokio::test]
        async fn test_capacity_failure_has_request_id() {
            let worker = ScriptWorker::new(test_support::REPLY_HI);
            let manager = manager(&worker, 1);

            init_chat(&manager, InitRequest { chat_id: "a".to_string() })
                .await
                .unwrap();
            let failure = init_chat(&manager, InitRequest { chat_id: "b".to_string() })
                .await
                .unwrap_err();
            assert_eq!(failure.kind, "capacity_exceeded");
            assert!(uuid::Uuid::parse_str(&failure.request_id).is_ok());
            manager.shutdown().await;
        }
    }
}
