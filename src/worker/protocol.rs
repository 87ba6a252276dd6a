//! Line-delimited JSON protocol spoken with chat workers
//!
//! Every message is a single JSON object followed by `\n`. The worker announces
//! itself with `{"status":"ready"}` and answers each request with either
//! `{"response": ...}` or `{"error": ...}`. Anything else on stdout is
//! diagnostic output.

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use crate::{Error, Result};

/// Request line written to the worker's stdin
#[derive(Debug, Serialize)]
struct RequestLine<'a> {
    message: &'a str,
}

/// Raw shape of a worker stdout object. Field types are left open so that
/// extra or oddly typed fields never hide a reply.
#[derive(Debug, Deserialize)]
struct RawMessage {
    #[serde(default)]
    status: Option<JsonValue>,
    #[serde(default)]
    response: Option<JsonValue>,
    #[serde(default)]
    error: Option<JsonValue>,
}

/// Decoded worker stdout message
#[derive(Debug, Clone, PartialEq)]
pub enum WorkerMessage {
    /// Handshake signal, only meaningful during launch
    Ready,
    /// Successful reply
    Response(String),
    /// Worker-reported failure
    Error(String),
    /// Structured but non-authoritative output
    Other(JsonValue),
}

impl WorkerMessage {
    /// Outcome of an in-flight request, or `None` if this message does not settle one
    pub fn into_reply(self) -> Option<Result<String>> {
        match self {
            WorkerMessage::Response(text) => Some(Ok(text)),
            WorkerMessage::Error(detail) => Some(Err(Error::Worker(detail))),
            WorkerMessage::Ready | WorkerMessage::Other(_) => None,
        }
    }
}

/// Encode a chat message as one request line
pub fn encode_request(message: &str) -> Result<String> {
    let mut json = serde_json::to_string(&RequestLine { message })?;
    json.push('\n');
    Ok(json)
}

/// Decode one stdout line. Returns `None` for lines that are not JSON objects.
pub fn decode_line(line: &str) -> Option<WorkerMessage> {
    let trimmed = line.trim();
    if !trimmed.starts_with('{') {
        return None;
    }

    let value: JsonValue = serde_json::from_str(trimmed).ok()?;
    let raw: RawMessage = match serde_json::from_value(value.clone()) {
        Ok(raw) => raw,
        Err(_) => return Some(WorkerMessage::Other(value)),
    };

    match (raw.error, raw.response, raw.status) {
        (Some(error), _, _) if !error.is_null() => Some(WorkerMessage::Error(payload_text(error))),
        (_, Some(response), _) if !response.is_null() => {
            Some(WorkerMessage::Response(payload_text(response)))
        }
        (_, _, Some(JsonValue::String(status))) if status == "ready" => Some(WorkerMessage::Ready),
        _ => Some(WorkerMessage::Other(value)),
    }
}

fn payload_text(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        other => other.to_string(),
    }
}

/// Classification of a worker stderr line
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Diagnostic {
    /// Progress bars and informational logging
    Noise,
    /// Anything that may explain a later failure
    Error,
}

const NOISE_MARKERS: &[&str] = &[
    "Batches:",
    "it/s]",
    "s/it]",
    "%|",
    " - INFO - ",
    " - DEBUG - ",
    "INFO:",
    "DEBUG:",
];

/// Classify one stderr line
pub fn classify_diagnostic(line: &str) -> Diagnostic {
    let trimmed = line.trim();
    if trimmed.is_empty() || NOISE_MARKERS.iter().any(|m| trimmed.contains(m)) {
        Diagnostic::Noise
    } else {
        Diagnostic::Error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_encode_request_is_one_line() {
        let line = encode_request("hello\nworld \"quoted\"").unwrap();
        assert!(line.ends_with('\n'));
        assert_eq!(line.matches('\n').count(), 1);
        let value: JsonValue = serde_json::from_str(line.trim_end()).unwrap();
        assert_eq!(value, json!({"message": "hello\nworld \"quoted\""}));
    }

    #[test]
    fn test_decode_replies() {
        assert_eq!(
            decode_line(r#"{"response":"hi there"}"#),
            Some(WorkerMessage::Response("hi there".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"error":"Chat ID not provided"}"#),
            Some(WorkerMessage::Error("Chat ID not provided".to_string()))
        );
        assert_eq!(decode_line("  {\"status\":\"ready\"}\r"), Some(WorkerMessage::Ready));
    }

    #[test]
    fn test_error_wins_over_response() {
        assert_eq!(
            decode_line(r#"{"response":"partial","error":"boom"}"#),
            Some(WorkerMessage::Error("boom".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"response":"ok","error":null}"#),
            Some(WorkerMessage::Response("ok".to_string()))
        );
    }

    #[test]
    fn test_non_string_payloads_are_rendered() {
        assert_eq!(
            decode_line(r#"{"error":{"code":3}}"#),
            Some(WorkerMessage::Error(r#"{"code":3}"#.to_string()))
        );
    }

    #[test]
    fn test_non_replies() {
        assert_eq!(decode_line("Loading embedding model..."), None);
        assert_eq!(decode_line("{not json"), None);
        assert_eq!(decode_line("[1,2,3]"), None);

        let other = decode_line(r#"{"status":"loading","progress":0.5}"#).unwrap();
        assert!(matches!(other, WorkerMessage::Other(_)));
        assert!(other.into_reply().is_none());

        let null_response = decode_line(r#"{"response":null}"#).unwrap();
        assert!(null_response.into_reply().is_none());

        assert!(matches!(
            decode_line(r#"{"status":1}"#),
            Some(WorkerMessage::Other(_))
        ));
    }

    #[test]
    fn test_replies_with_extra_fields() {
        assert_eq!(
            decode_line(r#"{"status":200,"response":"hi there"}"#),
            Some(WorkerMessage::Response("hi there".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"status":["busy"],"error":"overloaded","took_ms":12}"#),
            Some(WorkerMessage::Error("overloaded".to_string()))
        );
        assert_eq!(
            decode_line(r#"{"status":"ready","version":2,"model":{"name":"x"}}"#),
            Some(WorkerMessage::Ready)
        );
    }

    #[test]
    fn test_into_reply() {
        let reply = WorkerMessage::Response("ok".to_string()).into_reply();
        assert_eq!(reply.unwrap().unwrap(), "ok");

        let failure = WorkerMessage::Error("boom".to_string()).into_reply().unwrap();
        assert!(matches!(failure, Err(Error::Worker(ref d)) if d == "boom"));

        assert!(WorkerMessage::Ready.into_reply().is_none());
    }

    #[test]
    fn test_classify_diagnostics() {
        assert_eq!(
            classify_diagnostic("Batches: 100%|██████████| 1/1 [00:00<00:00, 12.31it/s]"),
            Diagnostic::Noise
        );
        assert_eq!(
            classify_diagnostic("2024-01-01 10:00:00,000 - __main__ - INFO - Bot ready"),
            Diagnostic::Noise
        );
        assert_eq!(classify_diagnostic("   "), Diagnostic::Noise);
        assert_eq!(
            classify_diagnostic("Traceback (most recent call last):"),
            Diagnostic::Error
        );
        assert_eq!(
            classify_diagnostic("2024-01-01 - __main__ - ERROR - Groq API key not found"),
            Diagnostic::Error
        );
    }
}
