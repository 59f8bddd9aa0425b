use thiserror::Error;

/// The single error taxonomy for everything that can go wrong starting,
/// running, or invoking on a hub connection. Every disposition in the
/// design's error table (negotiate failures, handshake rejection, socket
/// failures, binding failures, timeouts) is one variant here rather than a
/// mix of exception types and message structs threaded through the same
/// callback.
#[derive(Debug, Error, Clone)]
pub enum HubConnectionError {
    #[error("negotiate response was malformed: {0}")]
    NegotiateValidation(String),

    #[error("negotiate rejected the request: unauthorized")]
    Unauthorized,

    #[error("hub returned an error (status {status}): {detail}")]
    Hub { status: u16, detail: String },

    #[error("hub connection is not running: {0}")]
    HubConnection(String),

    #[error("handshake rejected by server: {0}")]
    Handshake(String),

    #[error("socket handshake failed: {0}")]
    SocketHandshake(String),

    #[error("socket closed: {0}")]
    SocketClosed(String),

    #[error("message binding failure: {0}")]
    BindingFailure(String),

    #[error("timed out waiting for connection state")]
    Timeout,

    #[error("invocation completed with a server-side error: {0}")]
    CompletionError(String),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("transport I/O error: {0}")]
    Io(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl From<signalr_protocol::CodecError> for HubConnectionError {
    fn from(value: signalr_protocol::CodecError) -> Self {
        Self::Codec(value.to_string())
    }
}

impl From<std::io::Error> for HubConnectionError {
    fn from(value: std::io::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<reqwest::Error> for HubConnectionError {
    fn from(value: reqwest::Error) -> Self {
        Self::Io(value.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for HubConnectionError {
    fn from(value: tokio_tungstenite::tungstenite::Error) -> Self {
        Self::SocketClosed(value.to_string())
    }
}
