//! Line-oriented stdio front end
//!
//! Reads one JSON request per line and writes one JSON reply per line. Used by
//! the `chat-process-manager` binary to drive the manager without an HTTP stack.
//!
//! Every request runs as its own task, so replies are written in completion
//! order. A request may carry an `id`, which is echoed on its reply; chat
//! replies also carry their `chatId`.

use std::sync::Arc;

use serde::Deserialize;
use serde_json::{json, Value as JsonValue};
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::task::JoinSet;

use crate::commands::chat::{self, deserialize_chat_id, ChatRequest, InitRequest};
use crate::commands::sessions;
use crate::state::ChatManager;
use crate::Result;

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "camelCase")]
enum DriverRequest {
    Chat(ChatRequest),
    Init(InitRequest),
    Close {
        #[serde(rename = "chatId", deserialize_with = "deserialize_chat_id")]
        chat_id: String,
    },
    Sessions,
}

fn invalid_request(detail: impl std::fmt::Display) -> JsonValue {
    json!({
        "error": format!("Invalid request: {}", detail),
        "type": "invalid_request",
    })
}

/// Split the optional correlation `id` off a request line
fn parse_line(line: &str) -> (Option<JsonValue>, std::result::Result<DriverRequest, JsonValue>) {
    let mut value: JsonValue = match serde_json::from_str(line) {
        Ok(value) => value,
        Err(e) => return (None, Err(invalid_request(e))),
    };

    let id = value.as_object_mut().and_then(|object| object.remove("id"));
    let request = serde_json::from_value(value).map_err(invalid_request);
    (id, request)
}

async fn handle_line(manager: &ChatManager, line: &str) -> JsonValue {
    let (id, request) = parse_line(line);

    let mut reply = match request {
        Ok(request) => handle_request(manager, request).await,
        Err(failure) => failure,
    };

    if let (Some(id), Some(object)) = (id, reply.as_object_mut()) {
        object.insert("id".to_string(), id);
    }
    reply
}

async fn handle_request(manager: &ChatManager, request: DriverRequest) -> JsonValue {
    let reply = match request {
        DriverRequest::Chat(request) => {
            let chat_id = request.chat_id.clone();
            let reply = match chat::send_message(manager, request).await {
                Ok(reply) => serde_json::to_value(reply),
                Err(failure) => serde_json::to_value(failure),
            };
            reply.map(|mut value| {
                if let Some(object) = value.as_object_mut() {
                    object.insert("chatId".to_string(), JsonValue::String(chat_id));
                }
                value
            })
        }
        DriverRequest::Init(request) => match chat::init_chat(manager, request).await {
            Ok(reply) => serde_json::to_value(reply),
            Err(failure) => serde_json::to_value(failure),
        },
        DriverRequest::Close { chat_id } => {
            serde_json::to_value(sessions::close_session(manager, chat_id).await)
        }
        DriverRequest::Sessions => serde_json::to_value(sessions::list_sessions(manager))
            .map(|rows| json!({ "sessions": rows })),
    };

    reply.unwrap_or_else(|e| json!({ "error": e.to_string(), "type": "json_error" }))
}

async fn write_reply<W>(output: &mut W, reply: &JsonValue) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut json = serde_json::to_string(reply)?;
    json.push('\n');
    output.write_all(json.as_bytes()).await?;
    output.flush().await?;
    Ok(())
}

/// Serve requests until the input ends and every started request has replied
pub async fn serve<R, W>(manager: Arc<ChatManager>, input: R, mut output: W) -> Result<()>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut tasks: JoinSet<JsonValue> = JoinSet::new();
    let mut input_open = true;

    while input_open || !tasks.is_empty() {
        tokio::select! {
            line = lines.next_line(), if input_open => match line? {
                Some(line) if line.trim().is_empty() => {}
                Some(line) => {
                    let manager = manager.clone();
                    tasks.spawn(async move { handle_line(&manager, &line).await });
                }
                None => {
                    tracing::debug!("Input closed");
                    input_open = false;
                }
            },
            Some(joined) = tasks.join_next() => {
                let reply = joined.unwrap_or_else(|e| {
                    tracing::error!("Request task failed: {}", e);
                    json!({ "error": format!("Request task failed: {}", e), "type": "internal_error" })
                });
                write_reply(&mut output, &reply).await?;
            }
        }
    }

    Ok(())
}
