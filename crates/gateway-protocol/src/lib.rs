use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Hard ceiling for a single framed message, newline excluded.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

const DEFAULT_MAX_TOKENS: u32 = 1000;

fn default_max_tokens() -> u32 {
    DEFAULT_MAX_TOKENS
}

fn default_stream() -> bool {
    true
}

/// One line on the wire. The `type` field selects the variant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum WireMessage {
    Request(InferenceRequest),
    Task(TaskAssignment),
    Response(TokenResponse),
    Error(ErrorReport),
    Heartbeat,
    Status(NodeStatus),
}

/// Client -> gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InferenceRequest {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
    #[serde(default)]
    pub priority: i32,
}

impl InferenceRequest {
    /// The client supplied id, if it carries anything besides whitespace.
    pub fn requested_id(&self) -> Option<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
    }
}

/// Gateway -> worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub id: String,
    pub client_socket: usize,
    #[serde(default)]
    pub model: String,
    #[serde(default)]
    pub prompt: String,
    #[serde(default = "default_max_tokens")]
    pub max_tokens: u32,
    #[serde(default = "default_stream")]
    pub stream: bool,
}

/// Worker -> gateway (one token or a full result) and gateway -> client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenResponse {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub token: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
    #[serde(default)]
    pub finished: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_socket: Option<usize>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorReport {
    #[serde(default)]
    pub id: String,
    pub message: String,
}

/// Worker self report. `load` is informational.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub node_id: String,
    #[serde(default)]
    pub available: bool,
    #[serde(default)]
    pub load: f32,
}

#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("empty message")]
    Empty,
    #[error("message exceeds {limit} bytes")]
    Oversized { limit: usize },
    #[error("message is not valid UTF-8")]
    InvalidUtf8,
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
}

impl WireMessage {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Request(_) => "request",
            Self::Task(_) => "task",
            Self::Response(_) => "response",
            Self::Error(_) => "error",
            Self::Heartbeat => "heartbeat",
            Self::Status(_) => "status",
        }
    }

    pub fn token(id: &str, token: &str) -> Self {
        Self::Response(TokenResponse {
            id: id.to_string(),
            token: Some(token.to_string()),
            result: None,
            finished: false,
            client_socket: None,
        })
    }

    pub fn stream_end(id: &str) -> Self {
        Self::Response(TokenResponse {
            id: id.to_string(),
            token: None,
            result: None,
            finished: true,
            client_socket: None,
        })
    }

    pub fn full_result(id: &str, result: &str) -> Self {
        Self::Response(TokenResponse {
            id: id.to_string(),
            token: None,
            result: Some(result.to_string()),
            finished: true,
            client_socket: None,
        })
    }

    pub fn error(id: &str, message: &str) -> Self {
        Self::Error(ErrorReport {
            id: id.to_string(),
            message: message.to_string(),
        })
    }
}

pub fn decode(line: &str) -> Result<WireMessage, DecodeError> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return Err(DecodeError::Empty);
    }
    if trimmed.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::Oversized {
            limit: MAX_MESSAGE_BYTES,
        });
    }
    Ok(serde_json::from_str(trimmed)?)
}

/// Serialises a message as one newline terminated line.
pub fn encode(message: &WireMessage) -> Result<Vec<u8>, serde_json::Error> {
    let mut bytes = serde_json::to_vec(message)?;
    bytes.push(b'\n');
    Ok(bytes)
}

/// Splits every complete line out of `buffer`. A partial line stays in the
/// buffer for the next read; blank lines are skipped.
pub fn drain_lines(buffer: &mut Vec<u8>) -> Vec<Result<String, DecodeError>> {
    let mut lines = Vec::new();

    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line_bytes = buffer.drain(..=pos).collect::<Vec<u8>>();
        match String::from_utf8(line_bytes) {
            Ok(line) if line.trim().is_empty() => continue,
            Ok(line) => lines.push(Ok(line.trim_end().to_string())),
            Err(_) => lines.push(Err(DecodeError::InvalidUtf8)),
        }
    }

    // A peer that never sends a newline must not grow the buffer forever.
    if buffer.len() > MAX_MESSAGE_BYTES {
        buffer.clear();
        lines.push(Err(DecodeError::Oversized {
            limit: MAX_MESSAGE_BYTES,
        }));
    }

    lines
}

/// `drain_lines` followed by `decode` on every line.
pub fn drain_messages(buffer: &mut Vec<u8>) -> Vec<Result<WireMessage, DecodeError>> {
    drain_lines(buffer)
        .into_iter()
        .map(|line| line.and_then(|l| decode(&l)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_are_applied() {
        let msg = decode(r#"{"type":"request","id":"r1","prompt":"hi"}"#).expect("decode request");
        match msg {
            WireMessage::Request(req) => {
                assert_eq!(req.requested_id(), Some("r1"));
                assert_eq!(req.prompt, "hi");
                assert_eq!(req.max_tokens, 1000);
                assert!(req.stream);
                assert_eq!(req.priority, 0);
                assert_eq!(req.model, "");
            }
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn blank_request_id_counts_as_missing() {
        let msg = decode(r#"{"type":"request","id":"  ","prompt":"hi"}"#).expect("decode");
        let WireMessage::Request(req) = msg else {
            panic!("expected request");
        };
        assert_eq!(req.requested_id(), None);
    }

    #[test]
    fn unknown_type_is_malformed() {
        let err = decode(r#"{"type":"bogus","id":"x"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn missing_type_is_malformed() {
        let err = decode(r#"{"id":"x","prompt":"hi"}"#).unwrap_err();
        assert!(matches!(err, DecodeError::Malformed(_)));
    }

    #[test]
    fn worker_side_messages_decode() {
        let status = decode(r#"{"type":"status","node_id":"npu-0","available":true,"load":0.5}"#)
            .expect("status");
        assert_eq!(
            status,
            WireMessage::Status(NodeStatus {
                node_id: "npu-0".to_string(),
                available: true,
                load: 0.5,
            })
        );

        let heartbeat = decode(r#"{"type":"heartbeat"}"#).expect("heartbeat");
        assert_eq!(heartbeat, WireMessage::Heartbeat);

        let token = decode(r#"{"type":"response","id":"r1","client_socket":3,"token":"he","finished":false}"#)
            .expect("token");
        let WireMessage::Response(resp) = token else {
            panic!("expected response");
        };
        assert_eq!(resp.token.as_deref(), Some("he"));
        assert_eq!(resp.client_socket, Some(3));
        assert!(!resp.finished);
    }

    #[test]
    fn encode_is_newline_terminated_and_tagged() {
        let bytes = encode(&WireMessage::token("r1", "he")).expect("encode");
        assert_eq!(bytes.last(), Some(&b'\n'));
        let text = String::from_utf8(bytes).expect("utf8");
        assert!(text.contains(r#""type":"response""#));
        assert!(text.contains(r#""token":"he""#));
        assert!(!text.contains("result"));
    }

    #[test]
    fn partial_line_waits_for_newline() {
        let mut buffer = br#"{"type":"heartbeat"}"#.to_vec();
        let parsed = drain_messages(&mut buffer);
        assert!(parsed.is_empty());
        assert!(!buffer.is_empty());

        buffer.push(b'\n');
        let parsed = drain_messages(&mut buffer);
        assert_eq!(parsed.len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn malformed_line_does_not_block_following_lines() {
        let mut buffer = b"not json\n\n{\"type\":\"heartbeat\"}\n{\"type\":\"st".to_vec();
        let parsed = drain_messages(&mut buffer);
        assert_eq!(parsed.len(), 2);
        assert!(parsed[0].is_err());
        assert!(matches!(parsed[1], Ok(WireMessage::Heartbeat)));
        assert_eq!(buffer, b"{\"type\":\"st".to_vec());
    }

    #[test]
    fn runaway_line_is_dropped() {
        let mut buffer = vec![b'a'; MAX_MESSAGE_BYTES + 1];
        let parsed = drain_messages(&mut buffer);
        assert_eq!(parsed.len(), 1);
        assert!(matches!(parsed[0], Err(DecodeError::Oversized { .. })));
        assert!(buffer.is_empty());
    }
}
