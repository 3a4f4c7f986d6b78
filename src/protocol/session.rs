//! Per-request session state on top of a protocol connection.

use crate::error::{DubError, ErrorKind};
use crate::protocol::frame::{Frame, MessageType};
use serde_json::Value;
use uuid::Uuid;

/// Server code for a successful response.
const SUCCESS_CODE: u64 = 1000;

/// Map a server error code to the crate error taxonomy.
pub fn error_for_code(code: u32, message: &str) -> DubError {
    let message = format!("server error {}: {}", code, message);
    match code {
        1001 | 4001 | 4003 | 45000001 => DubError::Auth { message },
        1002 | 1003 | 4029 => DubError::Quota { message },
        1004 | 5000 | 5003 => DubError::Network { message },
        1005 => DubError::Timeout {
            operation: message,
            after: std::time::Duration::ZERO,
        },
        _ => DubError::Protocol { message },
    }
}

/// Decoded result content carried by a server frame.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct ResultPayload {
    pub sequence: Option<i32>,
    /// Recognized text, for JSON responses that carry one.
    pub text: Option<String>,
    /// Synthesized audio bytes, for audio frames.
    pub audio: Vec<u8>,
}

/// A server frame demultiplexed into what the caller cares about.
#[derive(Debug, Clone, PartialEq)]
pub enum ServerEvent {
    PartialResult(ResultPayload),
    FinalResult(ResultPayload),
    Ack { sequence: Option<i32> },
    Error { code: u32, message: String },
}

impl ServerEvent {
    pub fn is_terminal(&self) -> bool {
        matches!(self, ServerEvent::FinalResult(_) | ServerEvent::Error { .. })
    }
}

#[derive(Debug, Clone, PartialEq)]
enum SessionState {
    Open,
    Complete,
    Failed {
        kind: ErrorKind,
        code: Option<u32>,
        message: String,
    },
}

/// One logical request/response exchange.
///
/// Sequence numbers start at 1 and only increase; the final audio chunk is
/// sent with the negated next number. The session completes exactly once.
#[derive(Debug)]
pub struct ProtocolSession {
    id: Uuid,
    request_type: MessageType,
    next_sequence: i32,
    sent_last: bool,
    buffer: Vec<u8>,
    text: String,
    state: SessionState,
}

impl ProtocolSession {
    pub fn new(request_type: MessageType) -> Self {
        Self {
            id: Uuid::new_v4(),
            request_type,
            next_sequence: 1,
            sent_last: false,
            buffer: Vec::new(),
            text: String::new(),
            state: SessionState::Open,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn request_type(&self) -> MessageType {
        self.request_type
    }

    /// Allocate the next positive sequence number.
    pub fn next_sequence(&mut self) -> i32 {
        let sequence = self.next_sequence;
        self.next_sequence = self.next_sequence.saturating_add(1);
        sequence
    }

    /// Allocate the negative sequence number that closes the audio stream.
    pub fn final_sequence(&mut self) -> i32 {
        self.sent_last = true;
        -self.next_sequence()
    }

    pub fn has_sent_last(&self) -> bool {
        self.sent_last
    }

    pub fn is_complete(&self) -> bool {
        !matches!(self.state, SessionState::Open)
    }

    pub fn is_failed(&self) -> bool {
        matches!(self.state, SessionState::Failed { .. })
    }

    /// The terminal error, rebuilt fresh for every caller.
    pub fn failure(&self) -> Option<DubError> {
        match &self.state {
            SessionState::Failed {
                kind,
                code,
                message,
            } => Some(match code {
                Some(code) => error_for_code(*code, message),
                None => rebuild_error(*kind, message),
            }),
            _ => None,
        }
    }

    /// Mark the session failed by a local error. No-op once complete.
    pub fn fail(&mut self, error: &DubError) {
        if self.is_complete() {
            return;
        }
        self.state = SessionState::Failed {
            kind: error.kind(),
            code: None,
            message: error.to_string(),
        };
    }

    /// Accumulated audio from audio frames.
    pub fn audio(&self) -> &[u8] {
        &self.buffer
    }

    pub fn take_audio(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }

    /// Text accumulated from partial and final results.
    pub fn transcript(&self) -> &str {
        &self.text
    }

    /// Classify an inbound frame and advance the session state.
    pub fn on_frame(&mut self, frame: Frame) -> ServerEvent {
        let event = classify(frame);
        match &event {
            ServerEvent::PartialResult(payload) | ServerEvent::FinalResult(payload) => {
                self.buffer.extend_from_slice(&payload.audio);
                if let Some(text) = &payload.text {
                    // Responses carry the full hypothesis so far, not a delta.
                    self.text.clone_from(text);
                }
            }
            ServerEvent::Ack { .. } => {}
            ServerEvent::Error { code, message } => {
                if !self.is_complete() {
                    self.state = SessionState::Failed {
                        kind: error_for_code(*code, message).kind(),
                        code: Some(*code),
                        message: message.clone(),
                    };
                }
            }
        }
        if matches!(event, ServerEvent::FinalResult(_)) && !self.is_complete() {
            self.state = SessionState::Complete;
        }
        event
    }
}

fn rebuild_error(kind: ErrorKind, message: &str) -> DubError {
    let message = message.to_string();
    match kind {
        ErrorKind::Auth => DubError::Auth { message },
        ErrorKind::Network => DubError::Network { message },
        ErrorKind::Quota => DubError::Quota { message },
        ErrorKind::Timeout => DubError::Timeout {
            operation: message,
            after: std::time::Duration::ZERO,
        },
        ErrorKind::Cancelled => DubError::Cancelled { reason: message },
        _ => DubError::Protocol { message },
    }
}

fn classify(frame: Frame) -> ServerEvent {
    let sequence = frame.sequence;
    let last = frame.flags.is_last() || sequence.is_some_and(|s| s < 0);

    match frame.message_type {
        MessageType::Error => ServerEvent::Error {
            code: frame.error_code.unwrap_or(0),
            message: String::from_utf8_lossy(&frame.payload).into_owned(),
        },
        MessageType::AudioOnlyServer => {
            if frame.payload.is_empty() && !last {
                return ServerEvent::Ack { sequence };
            }
            let payload = ResultPayload {
                sequence,
                text: None,
                audio: frame.payload,
            };
            if last {
                ServerEvent::FinalResult(payload)
            } else {
                ServerEvent::PartialResult(payload)
            }
        }
        MessageType::FullServerResponse | MessageType::FrontEndResult => {
            let json: Option<Value> = if frame.payload.is_empty() {
                None
            } else {
                frame.json().ok()
            };

            if let Some(json) = &json
                && let Some(code) = json.get("code").and_then(Value::as_u64)
                && code != SUCCESS_CODE
                && code != 0
            {
                let message = json
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or("request failed")
                    .to_string();
                return ServerEvent::Error {
                    code: u32::try_from(code).unwrap_or(u32::MAX),
                    message,
                };
            }

            let is_end = json
                .as_ref()
                .and_then(|j| j.get("is_end"))
                .and_then(Value::as_bool)
                .unwrap_or(false);
            let payload = ResultPayload {
                sequence,
                text: json.as_ref().and_then(extract_text),
                audio: Vec::new(),
            };
            if frame.message_type == MessageType::FullServerResponse && (last || is_end) {
                ServerEvent::FinalResult(payload)
            } else {
                ServerEvent::PartialResult(payload)
            }
        }
        MessageType::FullClientRequest | MessageType::AudioOnlyRequest => ServerEvent::Error {
            code: 0,
            message: format!("unexpected client frame {:?} from server", frame.message_type),
        },
    }
}

/// Pull recognized text out of a response body.
///
/// `result` is either an object with `text` or a list of utterances whose
/// texts are joined with spaces; a bare top-level `text` is also accepted.
fn extract_text(json: &Value) -> Option<String> {
    match json.get("result") {
        Some(Value::Object(map)) => map.get("text").and_then(Value::as_str).map(str::to_string),
        Some(Value::Array(items)) => {
            let parts: Vec<&str> = items
                .iter()
                .filter_map(|item| item.get("text").and_then(Value::as_str))
                .filter(|t| !t.is_empty())
                .collect();
            if parts.is_empty() {
                None
            } else {
                Some(parts.join(" "))
            }
        }
        _ => json.get("text").and_then(Value::as_str).map(str::to_string),
    }
}
