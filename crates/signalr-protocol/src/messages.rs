use serde_json::Value;
use std::collections::HashMap;

/// Headers are copied verbatim between the wire and the in-memory message;
/// an empty map round-trips as `{}`, never `null`.
pub type Headers = HashMap<String, String>;

/// Wire-stable integer tags. Mirrors the table in the SignalR hub protocol:
/// 1..9 are real messages, -1 is a purely local diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i8)]
pub enum MessageType {
    Invocation = 1,
    StreamItem = 2,
    Completion = 3,
    StreamInvocation = 4,
    CancelInvocation = 5,
    Ping = 6,
    Close = 7,
    Ack = 8,
    Sequence = 9,
    InvocationBindingFailure = -1,
}

impl MessageType {
    pub fn from_tag(tag: i64) -> Option<Self> {
        match tag {
            1 => Some(Self::Invocation),
            2 => Some(Self::StreamItem),
            3 => Some(Self::Completion),
            4 => Some(Self::StreamInvocation),
            5 => Some(Self::CancelInvocation),
            6 => Some(Self::Ping),
            7 => Some(Self::Close),
            8 => Some(Self::Ack),
            9 => Some(Self::Sequence),
            -1 => Some(Self::InvocationBindingFailure),
            _ => None,
        }
    }

    pub fn tag(self) -> i64 {
        self as i8 as i64
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct InvocationMessage {
    pub headers: Headers,
    pub invocation_id: Option<String>,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamItemMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub item: Value,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CompletionMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub result: Option<Value>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StreamInvocationMessage {
    pub headers: Headers,
    pub invocation_id: String,
    pub target: String,
    pub arguments: Vec<Value>,
    pub stream_ids: Option<Vec<String>>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CancelInvocationMessage {
    pub headers: Headers,
    pub invocation_id: String,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct CloseMessage {
    pub error: Option<String>,
    pub allow_reconnect: Option<bool>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AckMessage {
    pub sequence_id: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequenceMessage {
    pub sequence_id: u64,
}

/// Local-only: a record had the right tag but a field was the wrong shape.
/// Never sent on the wire; produced by a decoder and routed to `on_error`.
#[derive(Debug, Clone, PartialEq)]
pub struct BindingFailureMessage {
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq)]
pub enum HubMessage {
    Invocation(InvocationMessage),
    StreamItem(StreamItemMessage),
    Completion(CompletionMessage),
    StreamInvocation(StreamInvocationMessage),
    CancelInvocation(CancelInvocationMessage),
    Ping,
    Close(CloseMessage),
    Ack(AckMessage),
    Sequence(SequenceMessage),
    InvocationBindingFailure(BindingFailureMessage),
}

impl HubMessage {
    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Invocation(_) => MessageType::Invocation,
            Self::StreamItem(_) => MessageType::StreamItem,
            Self::Completion(_) => MessageType::Completion,
            Self::StreamInvocation(_) => MessageType::StreamInvocation,
            Self::CancelInvocation(_) => MessageType::CancelInvocation,
            Self::Ping => MessageType::Ping,
            Self::Close(_) => MessageType::Close,
            Self::Ack(_) => MessageType::Ack,
            Self::Sequence(_) => MessageType::Sequence,
            Self::InvocationBindingFailure(_) => MessageType::InvocationBindingFailure,
        }
    }

    /// The invocation id this message correlates to, if it carries one.
    /// Used by the engine to look up `streamHandlers` and pending invocations.
    pub fn invocation_id(&self) -> Option<&str> {
        match self {
            Self::Invocation(m) => m.invocation_id.as_deref(),
            Self::StreamItem(m) => Some(&m.invocation_id),
            Self::Completion(m) => Some(&m.invocation_id),
            Self::StreamInvocation(m) => Some(&m.invocation_id),
            Self::CancelInvocation(m) => Some(&m.invocation_id),
            _ => None,
        }
    }
}

/// `{"protocol":<name>,"version":1}`, always JSON-framed even under the
/// binary protocol.
#[derive(Debug, Clone, PartialEq, serde::Serialize, serde::Deserialize)]
pub struct HandshakeRequest {
    pub protocol: String,
    pub version: u32,
}

/// `{}` on success, `{"error":"..."}` on failure.
#[derive(Debug, Clone, PartialEq, Default, serde::Serialize, serde::Deserialize)]
pub struct HandshakeResponse {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
