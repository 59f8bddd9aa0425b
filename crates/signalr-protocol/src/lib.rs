//! Hub message schema and wire codecs shared by the text (JSON) and binary
//! (MessagePack) SignalR protocols.
//!
//! This crate does no I/O: it only knows how to turn bytes into
//! [`HubMessage`] values and back. Transports and the hub engine live in
//! `signalr-client`.

pub mod error;
pub mod json;
pub mod messages;
pub mod msgpack;

pub use error::CodecError;
pub use messages::{
    AckMessage, BindingFailureMessage, CancelInvocationMessage, CloseMessage, CompletionMessage,
    HandshakeRequest, HandshakeResponse, Headers, HubMessage, InvocationMessage, MessageType,
    SequenceMessage, StreamInvocationMessage, StreamItemMessage,
};

/// Which of the two hub protocols a connection negotiated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HubProtocol {
    Json,
    MessagePack,
}

impl HubProtocol {
    pub fn name(self) -> &'static str {
        match self {
            Self::Json => "json",
            Self::MessagePack => "messagepack",
        }
    }

    pub fn version(self) -> u32 {
        1
    }

    pub fn transfer_format(self) -> TransferFormat {
        match self {
            Self::Json => TransferFormat::Text,
            Self::MessagePack => TransferFormat::Binary,
        }
    }

    /// Decode every complete message currently buffered in `decoder`.
    pub fn push_text(
        self,
        decoder: &mut json::JsonDecoder,
        chunk: &str,
    ) -> Result<Vec<HubMessage>, CodecError> {
        debug_assert_eq!(self, Self::Json);
        decoder.push(chunk)
    }

    pub fn push_binary(
        self,
        decoder: &mut msgpack::MsgPackDecoder,
        chunk: &[u8],
    ) -> Result<Vec<HubMessage>, CodecError> {
        debug_assert_eq!(self, Self::MessagePack);
        decoder.push(chunk)
    }
}

/// Whether a transport carries this protocol's frames as text or bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferFormat {
    Text,
    Binary,
}

impl TransferFormat {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Text => "Text",
            Self::Binary => "Binary",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use messages::*;
    use serde_json::json;

    fn sample_invocation() -> HubMessage {
        HubMessage::Invocation(InvocationMessage {
            headers: Headers::new(),
            invocation_id: Some("abc123".to_owned()),
            target: "SendMessage".to_owned(),
            arguments: vec![json!("u"), json!("m")],
            stream_ids: None,
        })
    }

    #[test]
    fn json_round_trip_invocation() {
        let original = sample_invocation();
        let encoded = json::encode(&original);
        assert!(encoded.ends_with('\u{1e}'));
        let mut decoder = json::JsonDecoder::new();
        let decoded = decoder.push(&encoded).unwrap();
        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn json_round_trip_completion_with_error() {
        let original = HubMessage::Completion(CompletionMessage {
            headers: Headers::new(),
            invocation_id: "id-1".to_owned(),
            result: None,
            error: Some("boom".to_owned()),
        });
        let encoded = json::encode(&original);
        let mut decoder = json::JsonDecoder::new();
        let decoded = decoder.push(&encoded).unwrap();
        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn json_decoder_buffers_partial_tail_across_calls() {
        let full = json::encode(&sample_invocation());
        let split = full.len() / 2;
        let (first, second) = full.split_at(split);

        let mut decoder = json::JsonDecoder::new();
        let from_first = decoder.push(first).unwrap();
        assert!(from_first.is_empty(), "no complete record yet");

        let from_second = decoder.push(second).unwrap();
        assert_eq!(from_second, vec![sample_invocation()]);
    }

    #[test]
    fn json_decoder_extracts_all_complete_records_plus_keeps_tail() {
        let mut buf = String::new();
        buf.push_str(&json::encode(&sample_invocation()));
        buf.push_str(&json::encode(&HubMessage::Ping));
        buf.push_str("{\"type\":6"); // incomplete tail

        let mut decoder = json::JsonDecoder::new();
        let decoded = decoder.push(&buf).unwrap();
        assert_eq!(decoded, vec![sample_invocation(), HubMessage::Ping]);

        let decoded2 = decoder.push(",\"extra\":1}\u{1e}").unwrap();
        assert_eq!(decoded2.len(), 1);
    }

    #[test]
    fn json_binding_failure_on_ill_typed_field_is_not_fatal() {
        let raw = "{\"type\":1,\"target\":42}\u{1e}"; // target should be a string
        let mut decoder = json::JsonDecoder::new();
        let decoded = decoder.push(raw).unwrap();
        assert_eq!(decoded.len(), 1);
        assert!(matches!(decoded[0], HubMessage::InvocationBindingFailure(_)));
    }

    #[test]
    fn decode_handshake_splits_coalesced_messages() {
        let mut raw = String::from("{}\u{1e}");
        raw.push_str(&json::encode(&HubMessage::Ping));
        let (response, messages) = json::decode_handshake(&raw).unwrap();
        assert!(response.error.is_none());
        assert_eq!(messages, vec![HubMessage::Ping]);
    }

    #[test]
    fn decode_handshake_reports_error() {
        let raw = "{\"error\":\"nope\"}\u{1e}";
        let (response, messages) = json::decode_handshake(raw).unwrap();
        assert_eq!(response.error.as_deref(), Some("nope"));
        assert!(messages.is_empty());
    }

    #[test]
    fn msgpack_round_trip_invocation_with_stream_ids() {
        let original = HubMessage::Invocation(InvocationMessage {
            headers: Headers::new(),
            invocation_id: Some("id-9".to_owned()),
            target: "UploadStream".to_owned(),
            arguments: vec![],
            stream_ids: Some(vec!["s1".to_owned()]),
        });
        let encoded = msgpack::encode(&original).unwrap();
        let mut decoder = msgpack::MsgPackDecoder::new();
        let decoded = decoder.push(&encoded).unwrap();
        assert_eq!(decoded, vec![original]);
    }

    #[test]
    fn msgpack_round_trip_completion_result_and_void() {
        let with_result = HubMessage::Completion(CompletionMessage {
            headers: Headers::new(),
            invocation_id: "id-1".to_owned(),
            result: Some(json!(42)),
            error: None,
        });
        let encoded = msgpack::encode(&with_result).unwrap();
        let mut decoder = msgpack::MsgPackDecoder::new();
        assert_eq!(decoder.push(&encoded).unwrap(), vec![with_result]);

        let void = HubMessage::Completion(CompletionMessage {
            headers: Headers::new(),
            invocation_id: "id-2".to_owned(),
            result: None,
            error: None,
        });
        let encoded = msgpack::encode(&void).unwrap();
        let mut decoder = msgpack::MsgPackDecoder::new();
        assert_eq!(decoder.push(&encoded).unwrap(), vec![void]);
    }

    #[test]
    fn msgpack_decoder_buffers_partial_tail() {
        let full = msgpack::encode(&sample_invocation()).unwrap();
        let split = full.len() / 2;
        let (first, second) = full.split_at(split);
        let mut decoder = msgpack::MsgPackDecoder::new();
        assert!(decoder.push(first).unwrap().is_empty());
        assert_eq!(decoder.push(second).unwrap(), vec![sample_invocation()]);
    }

    #[test]
    fn ack_and_sequence_round_trip_both_encodings() {
        let ack = HubMessage::Ack(AckMessage { sequence_id: 1394 });
        let seq = HubMessage::Sequence(SequenceMessage { sequence_id: 1234 });

        let mut jd = json::JsonDecoder::new();
        assert_eq!(jd.push(&json::encode(&ack)).unwrap(), vec![ack.clone()]);
        assert_eq!(jd.push(&json::encode(&seq)).unwrap(), vec![seq.clone()]);

        let mut md = msgpack::MsgPackDecoder::new();
        assert_eq!(
            md.push(&msgpack::encode(&ack).unwrap()).unwrap(),
            vec![ack]
        );
        assert_eq!(
            md.push(&msgpack::encode(&seq).unwrap()).unwrap(),
            vec![seq]
        );
    }
}
