//! JSON text encoding: one UTF-8 JSON object per message, terminated by a
//! single record-separator byte (`0x1E`).

use crate::error::CodecError;
use crate::messages::{
    AckMessage, BindingFailureMessage, CancelInvocationMessage, CloseMessage, CompletionMessage,
    HandshakeRequest, HandshakeResponse, HubMessage, InvocationMessage, MessageType,
    SequenceMessage, StreamInvocationMessage, StreamItemMessage,
};
use serde_json::{Map, Value};

pub const RECORD_SEPARATOR: u8 = 0x1E;

fn headers_from(v: &Map<String, Value>) -> crate::messages::Headers {
    v.get("headers")
        .and_then(Value::as_object)
        .map(|m| {
            m.iter()
                .filter_map(|(k, v)| v.as_str().map(|s| (k.clone(), s.to_owned())))
                .collect()
        })
        .unwrap_or_default()
}

fn string_field(obj: &Map<String, Value>, field: &str) -> Result<String, CodecError> {
    obj.get(field)
        .and_then(Value::as_str)
        .map(str::to_owned)
        .ok_or_else(|| CodecError::BindingFailure {
            field: field.to_owned(),
            detail: "missing or not a string".to_owned(),
        })
}

fn stream_ids(obj: &Map<String, Value>) -> Option<Vec<String>> {
    obj.get("streamIds").and_then(Value::as_array).map(|a| {
        a.iter()
            .filter_map(Value::as_str)
            .map(str::to_owned)
            .collect()
    })
}

/// Parse one already-deserialized JSON object into a [`HubMessage`].
///
/// A record whose `type` tag is present but whose required fields are
/// missing or ill-typed does not raise: it becomes an
/// `InvocationBindingFailure` message for the engine to route to `on_error`.
pub fn message_from_value(value: Value) -> Result<HubMessage, CodecError> {
    let Value::Object(obj) = value else {
        return Ok(HubMessage::InvocationBindingFailure(BindingFailureMessage {
            detail: "record is not a JSON object".to_owned(),
        }));
    };

    // Absent `type` defaults to ping, matching the protocol's own leniency.
    let tag = obj.get("type").and_then(Value::as_i64).unwrap_or(6);
    let Some(message_type) = MessageType::from_tag(tag) else {
        return Ok(HubMessage::InvocationBindingFailure(BindingFailureMessage {
            detail: format!("unknown message type {tag}"),
        }));
    };

    let result = (|| -> Result<HubMessage, CodecError> {
        Ok(match message_type {
            MessageType::Invocation => HubMessage::Invocation(InvocationMessage {
                headers: headers_from(&obj),
                invocation_id: obj
                    .get("invocationId")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                target: string_field(&obj, "target")?,
                arguments: obj
                    .get("arguments")
                    .and_then(Value::as_array)
                    .cloned()
                    .unwrap_or_default(),
                stream_ids: stream_ids(&obj),
            }),
            MessageType::StreamItem => HubMessage::StreamItem(StreamItemMessage {
                headers: headers_from(&obj),
                invocation_id: string_field(&obj, "invocationId")?,
                item: obj.get("item").cloned().unwrap_or(Value::Null),
            }),
            MessageType::Completion => HubMessage::Completion(CompletionMessage {
                headers: headers_from(&obj),
                invocation_id: string_field(&obj, "invocationId")?,
                result: obj.get("result").cloned(),
                error: obj
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
            }),
            MessageType::StreamInvocation => {
                HubMessage::StreamInvocation(StreamInvocationMessage {
                    headers: headers_from(&obj),
                    invocation_id: string_field(&obj, "invocationId")?,
                    target: string_field(&obj, "target")?,
                    arguments: obj
                        .get("arguments")
                        .and_then(Value::as_array)
                        .cloned()
                        .unwrap_or_default(),
                    stream_ids: stream_ids(&obj),
                })
            }
            MessageType::CancelInvocation => {
                HubMessage::CancelInvocation(CancelInvocationMessage {
                    headers: headers_from(&obj),
                    invocation_id: string_field(&obj, "invocationId")?,
                })
            }
            MessageType::Ping => HubMessage::Ping,
            MessageType::Close => HubMessage::Close(CloseMessage {
                error: obj
                    .get("error")
                    .and_then(Value::as_str)
                    .map(str::to_owned),
                allow_reconnect: obj.get("allowReconnect").and_then(Value::as_bool),
            }),
            MessageType::Ack => HubMessage::Ack(AckMessage {
                sequence_id: obj
                    .get("sequenceId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CodecError::BindingFailure {
                        field: "sequenceId".to_owned(),
                        detail: "missing or not an unsigned integer".to_owned(),
                    })?,
            }),
            MessageType::Sequence => HubMessage::Sequence(SequenceMessage {
                sequence_id: obj
                    .get("sequenceId")
                    .and_then(Value::as_u64)
                    .ok_or_else(|| CodecError::BindingFailure {
                        field: "sequenceId".to_owned(),
                        detail: "missing or not an unsigned integer".to_owned(),
                    })?,
            }),
            MessageType::InvocationBindingFailure => {
                HubMessage::InvocationBindingFailure(BindingFailureMessage {
                    detail: "local diagnostic type received from the wire".to_owned(),
                })
            }
        })
    })();

    match result {
        Ok(m) => Ok(m),
        Err(CodecError::BindingFailure { field, detail }) => {
            Ok(HubMessage::InvocationBindingFailure(BindingFailureMessage {
                detail: format!("{field}: {detail}"),
            }))
        }
        Err(e) => Err(e),
    }
}

fn headers_to_value(headers: &crate::messages::Headers) -> Value {
    Value::Object(
        headers
            .iter()
            .map(|(k, v)| (k.clone(), Value::String(v.clone())))
            .collect(),
    )
}

/// Serialize one [`HubMessage`] to its JSON object (without the trailing
/// record separator — callers append that when framing for the wire).
pub fn message_to_value(message: &HubMessage) -> Value {
    let mut obj = Map::new();
    obj.insert(
        "type".to_owned(),
        Value::from(message.message_type().tag()),
    );
    match message {
        HubMessage::Invocation(m) => {
            obj.insert("headers".to_owned(), headers_to_value(&m.headers));
            if let Some(id) = &m.invocation_id {
                obj.insert("invocationId".to_owned(), Value::String(id.clone()));
            }
            obj.insert("target".to_owned(), Value::String(m.target.clone()));
            obj.insert("arguments".to_owned(), Value::Array(m.arguments.clone()));
            if let Some(ids) = &m.stream_ids {
                obj.insert(
                    "streamIds".to_owned(),
                    Value::Array(ids.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        HubMessage::StreamItem(m) => {
            obj.insert("headers".to_owned(), headers_to_value(&m.headers));
            obj.insert(
                "invocationId".to_owned(),
                Value::String(m.invocation_id.clone()),
            );
            obj.insert("item".to_owned(), m.item.clone());
        }
        HubMessage::Completion(m) => {
            obj.insert("headers".to_owned(), headers_to_value(&m.headers));
            obj.insert(
                "invocationId".to_owned(),
                Value::String(m.invocation_id.clone()),
            );
            if let Some(result) = &m.result {
                obj.insert("result".to_owned(), result.clone());
            }
            if let Some(error) = &m.error {
                obj.insert("error".to_owned(), Value::String(error.clone()));
            }
        }
        HubMessage::StreamInvocation(m) => {
            obj.insert("headers".to_owned(), headers_to_value(&m.headers));
            obj.insert(
                "invocationId".to_owned(),
                Value::String(m.invocation_id.clone()),
            );
            obj.insert("target".to_owned(), Value::String(m.target.clone()));
            obj.insert("arguments".to_owned(), Value::Array(m.arguments.clone()));
            if let Some(ids) = &m.stream_ids {
                obj.insert(
                    "streamIds".to_owned(),
                    Value::Array(ids.iter().cloned().map(Value::String).collect()),
                );
            }
        }
        HubMessage::CancelInvocation(m) => {
            obj.insert("headers".to_owned(), headers_to_value(&m.headers));
            obj.insert(
                "invocationId".to_owned(),
                Value::String(m.invocation_id.clone()),
            );
        }
        HubMessage::Ping => {}
        HubMessage::Close(m) => {
            if let Some(error) = &m.error {
                obj.insert("error".to_owned(), Value::String(error.clone()));
            }
            if let Some(allow) = m.allow_reconnect {
                obj.insert("allowReconnect".to_owned(), Value::Bool(allow));
            }
        }
        HubMessage::Ack(m) => {
            obj.insert("sequenceId".to_owned(), Value::from(m.sequence_id));
        }
        HubMessage::Sequence(m) => {
            obj.insert("sequenceId".to_owned(), Value::from(m.sequence_id));
        }
        HubMessage::InvocationBindingFailure(_) => {
            // Never sent on the wire.
        }
    }
    Value::Object(obj)
}

/// Encode one message as JSON text followed by the record separator.
pub fn encode(message: &HubMessage) -> String {
    let mut s = message_to_value(message).to_string();
    s.push(RECORD_SEPARATOR as char);
    s
}

/// Encode the handshake request frame (JSON + record separator), used
/// unconditionally regardless of the negotiated hub protocol.
pub fn encode_handshake_request(protocol: &str, version: u32) -> String {
    let mut s = serde_json::to_string(&HandshakeRequest {
        protocol: protocol.to_owned(),
        version,
    })
    .expect("HandshakeRequest always serializes");
    s.push(RECORD_SEPARATOR as char);
    s
}

/// Split a raw chunk of text into complete, non-empty records on the record
/// separator, returning the leftover tail for the caller to keep.
fn split_records(buf: &str) -> (Vec<&str>, &str) {
    let mut records = Vec::new();
    let mut rest = buf;
    while let Some(idx) = rest.find(RECORD_SEPARATOR as char) {
        let (record, tail) = rest.split_at(idx);
        if !record.is_empty() {
            records.push(record);
        }
        rest = &tail[1..];
    }
    (records, rest)
}

/// Decode the handshake frame plus any hub messages coalesced in the same
/// payload. Returns `(handshake_response, remaining_messages)`.
pub fn decode_handshake(raw: &str) -> Result<(HandshakeResponse, Vec<HubMessage>), CodecError> {
    let (records, _tail) = split_records(raw);
    let mut iter = records.into_iter();
    let first = iter.next().unwrap_or("{}");
    let response: HandshakeResponse = serde_json::from_str(first)?;
    let mut messages = Vec::new();
    for record in iter {
        let value: Value = serde_json::from_str(record)?;
        messages.push(message_from_value(value)?);
    }
    Ok((response, messages))
}

/// A buffering JSON decoder: owns the residual tail across calls so partial
/// records delivered by the transport are reassembled correctly.
#[derive(Debug, Default)]
pub struct JsonDecoder {
    tail: String,
}

impl JsonDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed newly-received text, returning every complete record as a
    /// decoded message. Binding failures are returned as `Ok` values (see
    /// [`HubMessage::InvocationBindingFailure`]); only malformed JSON itself
    /// is an `Err`.
    pub fn push(&mut self, chunk: &str) -> Result<Vec<HubMessage>, CodecError> {
        self.tail.push_str(chunk);
        let (records, tail) = split_records(&self.tail);
        let mut out = Vec::with_capacity(records.len());
        for record in &records {
            let value: Value = serde_json::from_str(record)?;
            out.push(message_from_value(value)?);
        }
        let tail = tail.to_owned();
        self.tail = tail;
        Ok(out)
    }
}
