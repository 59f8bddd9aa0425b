//! Transport clients (C2): WebSocket, SSE, and long-polling I/O behind one
//! small contract. Each client exposes `connect`, `close`, `send`,
//! `is_connection_closed`, and a stream of events standing in for the
//! `onOpen/onMessage/onError/onClose` callbacks — `connect` only returns
//! once the transport-specific open signal has been observed (HTTP 101 for
//! WebSocket, HTTP 200 for SSE/long-poll), so a successful `connect` call
//! itself plays the role of `onOpen`.

pub mod long_polling;
pub mod sse;
pub mod websocket;

use crate::error::HubConnectionError;
pub use signalr_protocol::TransferFormat;

/// One of the three interchangeable transports, named exactly as the
/// SignalR negotiate response spells them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportKind {
    WebSockets,
    ServerSentEvents,
    LongPolling,
}

impl TransportKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::WebSockets => "WebSockets",
            Self::ServerSentEvents => "ServerSentEvents",
            Self::LongPolling => "LongPolling",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "WebSockets" => Some(Self::WebSockets),
            "ServerSentEvents" => Some(Self::ServerSentEvents),
            "LongPolling" => Some(Self::LongPolling),
            _ => None,
        }
    }
}

/// One payload handed to or received from a transport. Binary carries
/// MessagePack frames; Text carries JSON-plus-record-separator frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportMessage {
    Text(String),
    Binary(Vec<u8>),
}

/// What the receive loop can observe after a successful `connect`.
#[derive(Debug)]
pub enum TransportEvent {
    Message(TransportMessage),
    /// The peer closed the socket/session in an orderly way.
    Closed,
    /// A fatal transport-level error (distinct from a protocol-level
    /// binding failure, which is a `HubMessage`, not a `TransportEvent`).
    Error(HubConnectionError),
}

/// Concrete transport client, one connected instance per (re)connect.
/// Modeled as an enum rather than a trait object: the `async fn`s below
/// aren't dyn-compatible without boxing every future, and a connection only
/// ever uses one transport kind for its whole lifetime (chosen once by
/// negotiation), so static dispatch through a match is both simpler and
/// idiomatic here.
pub enum AnyTransport {
    WebSocket(websocket::WebSocketTransport),
    Sse(sse::SseTransport),
    LongPolling(long_polling::LongPollingTransport),
}

impl AnyTransport {
    pub fn kind(&self) -> TransportKind {
        match self {
            Self::WebSocket(_) => TransportKind::WebSockets,
            Self::Sse(_) => TransportKind::ServerSentEvents,
            Self::LongPolling(_) => TransportKind::LongPolling,
        }
    }

    pub async fn send(&mut self, msg: TransportMessage) -> Result<(), HubConnectionError> {
        match self {
            Self::WebSocket(t) => t.send(msg).await,
            Self::Sse(t) => t.send(msg).await,
            Self::LongPolling(t) => t.send(msg).await,
        }
    }

    /// Await the next event. Never returns `None`-like; once closed it
    /// keeps yielding `Closed`.
    pub async fn recv_event(&mut self) -> TransportEvent {
        match self {
            Self::WebSocket(t) => t.recv_event().await,
            Self::Sse(t) => t.recv_event().await,
            Self::LongPolling(t) => t.recv_event().await,
        }
    }

    pub async fn close(&mut self) {
        match self {
            Self::WebSocket(t) => t.close().await,
            Self::Sse(t) => t.close().await,
            Self::LongPolling(t) => t.close().await,
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        match self {
            Self::WebSocket(t) => t.is_connection_closed(),
            Self::Sse(t) => t.is_connection_closed(),
            Self::LongPolling(t) => t.is_connection_closed(),
        }
    }
}
