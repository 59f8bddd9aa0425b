//! WebSocket transport client, built on `tokio-tungstenite` — the same
//! crate the teacher's forwarder uplink session already depends on for its
//! own WebSocket uplink. Using it means RFC 6455 framing (masking, the
//! 3-branch length rule, and fragment assembly) is handled by the library
//! rather than hand-rolled, the way the upstream Python reference does it
//! over a raw socket. `tokio-tungstenite` detects a masked frame from the
//! server as a protocol error but does not itself send the close frame back
//! — this module sends the 1002 close in response when it sees that error.

use crate::error::HubConnectionError;
use crate::transport::{TransportEvent, TransportMessage};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Error as WsError;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::error::ProtocolError;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message as WsMessage};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

pub struct WebSocketTransport {
    write: futures_util::stream::SplitSink<WsStream, WsMessage>,
    read: futures_util::stream::SplitStream<WsStream>,
    closed: Arc<AtomicBool>,
}

impl WebSocketTransport {
    /// Opens the socket and performs the RFC 6455 upgrade, requiring HTTP
    /// 101. `url` must already use the `ws`/`wss` scheme.
    pub async fn connect(
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, HubConnectionError> {
        let mut request = url
            .into_client_request()
            .map_err(|e| HubConnectionError::SocketHandshake(e.to_string()))?;
        for (k, v) in headers {
            if let (Ok(name), Ok(value)) = (
                tokio_tungstenite::tungstenite::http::HeaderName::try_from(k.as_str()),
                tokio_tungstenite::tungstenite::http::HeaderValue::from_str(v),
            ) {
                request.headers_mut().insert(name, value);
            }
        }

        let (stream, _response) = tokio_tungstenite::connect_async(request)
            .await
            .map_err(|e| HubConnectionError::SocketHandshake(e.to_string()))?;
        let (write, read) = stream.split();
        Ok(Self {
            write,
            read,
            closed: Arc::new(AtomicBool::new(false)),
        })
    }

    pub async fn send(&mut self, msg: TransportMessage) -> Result<(), HubConnectionError> {
        let ws_msg = match msg {
            TransportMessage::Text(s) => WsMessage::Text(s.into()),
            TransportMessage::Binary(b) => WsMessage::Binary(b.into()),
        };
        self.write.send(ws_msg).await.map_err(|e| {
            self.closed.store(true, Ordering::SeqCst);
            HubConnectionError::from(e)
        })
    }

    pub async fn recv_event(&mut self) -> TransportEvent {
        loop {
            match self.read.next().await {
                Some(Ok(WsMessage::Text(t))) => {
                    return TransportEvent::Message(TransportMessage::Text(t.to_string()));
                }
                Some(Ok(WsMessage::Binary(b))) => {
                    return TransportEvent::Message(TransportMessage::Binary(b.to_vec()));
                }
                Some(Ok(WsMessage::Ping(data))) => {
                    // Server-directed ping/pong control frames never surface to the engine.
                    let _ = self.write.send(WsMessage::Pong(data)).await;
                    continue;
                }
                Some(Ok(WsMessage::Pong(_))) => continue,
                Some(Ok(WsMessage::Close(_))) => {
                    self.closed.store(true, Ordering::SeqCst);
                    return TransportEvent::Closed;
                }
                Some(Ok(WsMessage::Frame(_))) => continue,
                Some(Err(e)) => {
                    if matches!(e, WsError::Protocol(ProtocolError::MaskedFrameFromServer)) {
                        let _ = self
                            .write
                            .send(WsMessage::Close(Some(CloseFrame {
                                code: CloseCode::Protocol,
                                reason: "protocol error".into(),
                            })))
                            .await;
                    }
                    self.closed.store(true, Ordering::SeqCst);
                    return TransportEvent::Error(HubConnectionError::from(e));
                }
                None => {
                    self.closed.store(true, Ordering::SeqCst);
                    return TransportEvent::Closed;
                }
            }
        }
    }

    pub async fn close(&mut self) {
        let _ = self.write.close().await;
        self.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_connection_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}
