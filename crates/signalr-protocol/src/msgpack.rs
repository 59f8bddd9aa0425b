//! MessagePack binary encoding: each message is a length-prefixed MessagePack
//! array whose first element is the integer tag; field order is fixed by the
//! SignalR MessagePack profile. The decoder emits the same [`HubMessage`]
//! records the JSON decoder does — callers above this module never need to
//! know which wire form produced a value.
//!
//! There is no MessagePack reference to translate here: the upstream source
//! this crate is otherwise grounded on leaves its MessagePack protocol
//! unimplemented (`raise ValueError("Not implemented yet")`). This module is
//! new construction against the published SignalR MessagePack profile.

use crate::error::CodecError;
use crate::messages::{
    AckMessage, BindingFailureMessage, CancelInvocationMessage, CloseMessage, CompletionMessage,
    HubMessage, InvocationMessage, MessageType, SequenceMessage, StreamInvocationMessage,
    StreamItemMessage,
};
use rmpv::Value as Pack;
use serde_json::Value as Json;

fn json_to_pack(v: &Json) -> Pack {
    match v {
        Json::Null => Pack::Nil,
        Json::Bool(b) => Pack::Boolean(*b),
        Json::Number(n) => {
            if let Some(i) = n.as_i64() {
                Pack::Integer(i.into())
            } else if let Some(u) = n.as_u64() {
                Pack::Integer(u.into())
            } else {
                Pack::F64(n.as_f64().unwrap_or(0.0))
            }
        }
        Json::String(s) => Pack::String(s.clone().into()),
        Json::Array(a) => Pack::Array(a.iter().map(json_to_pack).collect()),
        Json::Object(o) => Pack::Map(
            o.iter()
                .map(|(k, v)| (Pack::String(k.clone().into()), json_to_pack(v)))
                .collect(),
        ),
    }
}

fn pack_to_json(v: &Pack) -> Json {
    match v {
        Pack::Nil => Json::Null,
        Pack::Boolean(b) => Json::Bool(*b),
        Pack::Integer(i) => i
            .as_i64()
            .map(Json::from)
            .or_else(|| i.as_u64().map(Json::from))
            .unwrap_or(Json::Null),
        Pack::F32(f) => serde_json::Number::from_f64(f64::from(*f))
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Pack::F64(f) => serde_json::Number::from_f64(*f)
            .map(Json::Number)
            .unwrap_or(Json::Null),
        Pack::String(s) => Json::String(s.as_str().unwrap_or_default().to_owned()),
        Pack::Binary(b) => Json::Array(b.iter().map(|x| Json::from(*x)).collect()),
        Pack::Array(a) => Json::Array(a.iter().map(pack_to_json).collect()),
        Pack::Map(m) => Json::Object(
            m.iter()
                .map(|(k, v)| (k.as_str().unwrap_or_default().to_owned(), pack_to_json(v)))
                .collect(),
        ),
        Pack::Ext(_, _) => Json::Null,
    }
}

fn headers_to_pack(headers: &crate::messages::Headers) -> Pack {
    Pack::Map(
        headers
            .iter()
            .map(|(k, v)| (Pack::String(k.clone().into()), Pack::String(v.clone().into())))
            .collect(),
    )
}

fn headers_from_pack(v: &Pack) -> crate::messages::Headers {
    match v {
        Pack::Map(m) => m
            .iter()
            .filter_map(|(k, v)| {
                Some((k.as_str()?.to_owned(), v.as_str().unwrap_or_default().to_owned()))
            })
            .collect(),
        _ => Default::default(),
    }
}

fn str_of(v: &Pack) -> Option<String> {
    v.as_str().map(str::to_owned)
}

fn arr(v: &Pack) -> &[Pack] {
    match v {
        Pack::Array(a) => a.as_slice(),
        _ => &[],
    }
}

fn stream_ids_from(v: Option<&Pack>) -> Option<Vec<String>> {
    match v {
        Some(Pack::Array(a)) => Some(a.iter().filter_map(str_of).collect()),
        _ => None,
    }
}

fn binding_failure(detail: impl Into<String>) -> HubMessage {
    HubMessage::InvocationBindingFailure(BindingFailureMessage {
        detail: detail.into(),
    })
}

/// Decode one already-unpacked MessagePack array value into a [`HubMessage`].
pub fn message_from_value(value: Pack) -> Result<HubMessage, CodecError> {
    let elems = match &value {
        Pack::Array(a) => a.clone(),
        _ => return Ok(binding_failure("record is not a MessagePack array")),
    };
    let Some(tag) = elems.first().and_then(Pack::as_i64) else {
        return Ok(binding_failure("missing message type tag"));
    };
    let Some(message_type) = MessageType::from_tag(tag) else {
        return Ok(binding_failure(format!("unknown message type {tag}")));
    };

    Ok(match message_type {
        MessageType::Invocation => {
            let headers = elems.get(1).map(headers_from_pack).unwrap_or_default();
            let invocation_id = elems.get(2).and_then(str_of);
            let Some(target) = elems.get(3).and_then(str_of) else {
                return Ok(binding_failure("invocation missing target"));
            };
            let arguments = elems.get(4).map(arr).unwrap_or_default().iter().map(pack_to_json).collect();
            let stream_ids = stream_ids_from(elems.get(5));
            HubMessage::Invocation(InvocationMessage {
                headers,
                invocation_id,
                target,
                arguments,
                stream_ids,
            })
        }
        MessageType::StreamItem => {
            let headers = elems.get(1).map(headers_from_pack).unwrap_or_default();
            let Some(invocation_id) = elems.get(2).and_then(str_of) else {
                return Ok(binding_failure("stream item missing invocationId"));
            };
            let item = elems.get(3).map(pack_to_json).unwrap_or(Json::Null);
            HubMessage::StreamItem(StreamItemMessage {
                headers,
                invocation_id,
                item,
            })
        }
        MessageType::Completion => {
            let headers = elems.get(1).map(headers_from_pack).unwrap_or_default();
            let Some(invocation_id) = elems.get(2).and_then(str_of) else {
                return Ok(binding_failure("completion missing invocationId"));
            };
            let result_kind = elems.get(3).and_then(Pack::as_i64).unwrap_or(2);
            let (result, error) = match result_kind {
                1 => (None, elems.get(4).and_then(str_of)),
                3 => (elems.get(4).map(pack_to_json), None),
                _ => (None, None),
            };
            HubMessage::Completion(CompletionMessage {
                headers,
                invocation_id,
                result,
                error,
            })
        }
        MessageType::StreamInvocation => {
            let headers = elems.get(1).map(headers_from_pack).unwrap_or_default();
            let Some(invocation_id) = elems.get(2).and_then(str_of) else {
                return Ok(binding_failure("stream invocation missing invocationId"));
            };
            let Some(target) = elems.get(3).and_then(str_of) else {
                return Ok(binding_failure("stream invocation missing target"));
            };
            let arguments = elems.get(4).map(arr).unwrap_or_default().iter().map(pack_to_json).collect();
            let stream_ids = stream_ids_from(elems.get(5));
            HubMessage::StreamInvocation(StreamInvocationMessage {
                headers,
                invocation_id,
                target,
                arguments,
                stream_ids,
            })
        }
        MessageType::CancelInvocation => {
            let headers = elems.get(1).map(headers_from_pack).unwrap_or_default();
            let Some(invocation_id) = elems.get(2).and_then(str_of) else {
                return Ok(binding_failure("cancel invocation missing invocationId"));
            };
            HubMessage::CancelInvocation(CancelInvocationMessage {
                headers,
                invocation_id,
            })
        }
        MessageType::Ping => HubMessage::Ping,
        MessageType::Close => HubMessage::Close(CloseMessage {
            error: elems.get(1).and_then(str_of),
            allow_reconnect: elems.get(2).and_then(Pack::as_bool),
        }),
        MessageType::Ack => {
            let Some(sequence_id) = elems.get(1).and_then(Pack::as_u64) else {
                return Ok(binding_failure("ack missing sequenceId"));
            };
            HubMessage::Ack(AckMessage { sequence_id })
        }
        MessageType::Sequence => {
            let Some(sequence_id) = elems.get(1).and_then(Pack::as_u64) else {
                return Ok(binding_failure("sequence missing sequenceId"));
            };
            HubMessage::Sequence(SequenceMessage { sequence_id })
        }
        MessageType::InvocationBindingFailure => {
            binding_failure("local diagnostic type received from the wire")
        }
    })
}

/// Encode one message as a MessagePack array, prefixed on the wire by its
/// own byte length (per the SignalR binary framing rule).
pub fn encode(message: &HubMessage) -> Result<Vec<u8>, CodecError> {
    let value = match message {
        HubMessage::Invocation(m) => {
            let mut v = vec![
                Pack::from(MessageType::Invocation.tag()),
                headers_to_pack(&m.headers),
                m.invocation_id
                    .as_ref()
                    .map_or(Pack::Nil, |s| Pack::String(s.clone().into())),
                Pack::String(m.target.clone().into()),
                Pack::Array(m.arguments.iter().map(json_to_pack).collect()),
            ];
            v.push(match &m.stream_ids {
                Some(ids) => Pack::Array(ids.iter().cloned().map(|s| Pack::String(s.into())).collect()),
                None => Pack::Nil,
            });
            Pack::Array(v)
        }
        HubMessage::StreamItem(m) => Pack::Array(vec![
            Pack::from(MessageType::StreamItem.tag()),
            headers_to_pack(&m.headers),
            Pack::String(m.invocation_id.clone().into()),
            json_to_pack(&m.item),
        ]),
        HubMessage::Completion(m) => {
            let mut v = vec![
                Pack::from(MessageType::Completion.tag()),
                headers_to_pack(&m.headers),
                Pack::String(m.invocation_id.clone().into()),
            ];
            match (&m.error, &m.result) {
                (Some(err), _) => {
                    v.push(Pack::from(1));
                    v.push(Pack::String(err.clone().into()));
                }
                (None, Some(result)) => {
                    v.push(Pack::from(3));
                    v.push(json_to_pack(result));
                }
                (None, None) => {
                    v.push(Pack::from(2));
                }
            }
            Pack::Array(v)
        }
        HubMessage::StreamInvocation(m) => {
            let mut v = vec![
                Pack::from(MessageType::StreamInvocation.tag()),
                headers_to_pack(&m.headers),
                Pack::String(m.invocation_id.clone().into()),
                Pack::String(m.target.clone().into()),
                Pack::Array(m.arguments.iter().map(json_to_pack).collect()),
            ];
            v.push(match &m.stream_ids {
                Some(ids) => Pack::Array(ids.iter().cloned().map(|s| Pack::String(s.into())).collect()),
                None => Pack::Nil,
            });
            Pack::Array(v)
        }
        HubMessage::CancelInvocation(m) => Pack::Array(vec![
            Pack::from(MessageType::CancelInvocation.tag()),
            headers_to_pack(&m.headers),
            Pack::String(m.invocation_id.clone().into()),
        ]),
        HubMessage::Ping => Pack::Array(vec![Pack::from(MessageType::Ping.tag())]),
        HubMessage::Close(m) => Pack::Array(vec![
            Pack::from(MessageType::Close.tag()),
            m.error
                .as_ref()
                .map_or(Pack::Nil, |s| Pack::String(s.clone().into())),
            m.allow_reconnect.map_or(Pack::Nil, Pack::Boolean),
        ]),
        HubMessage::Ack(m) => Pack::Array(vec![
            Pack::from(MessageType::Ack.tag()),
            Pack::from(m.sequence_id),
        ]),
        HubMessage::Sequence(m) => Pack::Array(vec![
            Pack::from(MessageType::Sequence.tag()),
            Pack::from(m.sequence_id),
        ]),
        HubMessage::InvocationBindingFailure(_) => {
            // Never sent on the wire.
            Pack::Array(vec![Pack::from(MessageType::Ping.tag())])
        }
    };

    let mut body = Vec::new();
    rmpv::encode::write_value(&mut body, &value).map_err(|e| CodecError::BindingFailure {
        field: "<root>".to_owned(),
        detail: e.to_string(),
    })?;

    // SignalR's binary framing is a variable-length-quantity byte count
    // prefix, not a MessagePack type itself.
    let mut framed = encode_varint_len(body.len());
    framed.extend_from_slice(&body);
    Ok(framed)
}

fn encode_varint_len(mut len: usize) -> Vec<u8> {
    let mut out = Vec::new();
    loop {
        let mut byte = (len & 0x7f) as u8;
        len >>= 7;
        if len > 0 {
            byte |= 0x80;
        }
        out.push(byte);
        if len == 0 {
            break;
        }
    }
    out
}

/// Read one VarInt-prefixed-length MessagePack record from `buf`, returning
/// the decoded message and the number of bytes consumed, or `None` if the
/// buffer does not yet contain a complete record.
pub fn decode_one(buf: &[u8]) -> Result<Option<(HubMessage, usize)>, CodecError> {
    let mut len = 0usize;
    let mut shift = 0u32;
    let mut pos = 0usize;
    loop {
        let Some(&byte) = buf.get(pos) else {
            return Ok(None);
        };
        len |= usize::from(byte & 0x7f) << shift;
        pos += 1;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    if buf.len() < pos + len {
        return Ok(None);
    }
    let body = &buf[pos..pos + len];
    let value = rmpv::decode::read_value(&mut std::io::Cursor::new(body))?;
    let message = message_from_value(value)?;
    Ok(Some((message, pos + len)))
}

/// A buffering MessagePack decoder, the binary counterpart of
/// [`crate::json::JsonDecoder`].
#[derive(Debug, Default)]
pub struct MsgPackDecoder {
    buf: Vec<u8>,
}

impl MsgPackDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<HubMessage>, CodecError> {
        self.buf.extend_from_slice(chunk);
        let mut out = Vec::new();
        let mut consumed = 0;
        while let Some((message, used)) = decode_one(&self.buf[consumed..])? {
            out.push(message);
            consumed += used;
        }
        self.buf.drain(0..consumed);
        Ok(out)
    }
}
