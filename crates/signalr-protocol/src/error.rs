use thiserror::Error;

/// Errors produced while encoding or decoding hub messages.
///
/// `BindingFailure` is not fatal to a connection: per the protocol's own
/// rules a record with the right shape but ill-typed fields is delivered to
/// the engine as a message (tag -1), not raised. Callers that only want the
/// "this buffer is corrupt" case should match on `Io`/`Handshake` instead.
#[derive(Debug, Error)]
pub enum CodecError {
    #[error("malformed JSON record: {0}")]
    Json(#[from] serde_json::Error),

    #[error("malformed MessagePack record: {0}")]
    MsgPackDecode(#[from] rmp_serde::decode::Error),

    #[error("failed to encode MessagePack record: {0}")]
    MsgPackEncode(#[from] rmp_serde::encode::Error),

    #[error("malformed MessagePack value: {0}")]
    MsgPackValue(#[from] rmpv::decode::Error),

    #[error("record present but field {field} has the wrong shape: {detail}")]
    BindingFailure { field: String, detail: String },

    #[error("handshake response carried an error: {0}")]
    HandshakeRejected(String),

    #[error("record is not valid UTF-8: {0}")]
    Utf8(#[from] std::str::Utf8Error),
}
