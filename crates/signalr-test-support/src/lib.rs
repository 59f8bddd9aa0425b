//! A mock SignalR hub server for integration tests.
//!
//! Binds an HTTP+WebSocket listener on a random port, exposes `/negotiate`
//! and a WebSocket upgrade at the base path, performs the handshake, and
//! then drives one of a handful of canned [`Scenario`]s. Modeled directly on
//! `rt-test-utils`'s mock WebSocket server: bind port 0, spawn an accept
//! loop, validate the first message, drive a small per-connection state
//! machine, swallow connection-drop errors in the accept loop.

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::{any, post},
};
use futures_util::SinkExt;
use serde_json::{Value, json};
use signalr_protocol::json::{JsonDecoder, encode};
use signalr_protocol::messages::*;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

/// A canned server-side behavior for one test scenario.
#[derive(Clone)]
pub enum Scenario {
    /// Handshake succeeds; every `SendMessage(u, m)` Invocation is echoed
    /// back as a `ReceiveMessage(u, m)` Invocation. Drives S1.
    Echo,
    /// Handshake succeeds; every Invocation carrying an `invocationId` gets
    /// a Completion for that id whose result is its own arguments array.
    /// Drives S2.
    CompletionEcho,
    /// Handshake succeeds; a `StreamInvocation("Counter", [n, _])` yields
    /// `n` StreamItems (0..n) followed by a void Completion. Drives S3.
    CounterStream,
    /// Handshake succeeds; captures every StreamItem/Completion that
    /// arrives under streamed invocation ids into `received`. Drives S4.
    UploadCapture { received: Arc<std::sync::Mutex<Vec<HubMessage>>> },
    /// The connection is dropped immediately after the first successful
    /// handshake's one invocation; a reconnecting client should see
    /// `on_reconnect` once it comes back. Drives S5 (paired with a restart
    /// of the server on the same port by the test, or with the `attempts`
    /// counter to allow the Nth connection through).
    DisconnectOnce { attempts: Arc<AtomicU32> },
    /// Handshake fails with the given error message. Drives S6.
    HandshakeError(String),
    /// The handshake response and a `Close` message are sent in the same WS
    /// text frame, coalesced behind one record separator each.
    CoalescedClose,
}

pub struct MockHubServer {
    addr: SocketAddr,
    _task: tokio::task::JoinHandle<()>,
}

impl MockHubServer {
    pub async fn start(scenario: Scenario) -> Result<Self, std::io::Error> {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let state = Arc::new(scenario);
        let app = Router::new()
            .route("/negotiate", post(negotiate))
            .route("/", any(ws_upgrade))
            .with_state(state);

        let task = tokio::spawn(async move {
            let _ = axum::serve(listener, app).await;
        });

        Ok(Self { addr, _task: task })
    }

    /// Base `http://` URL for negotiate; swap scheme to `ws://` for the hub
    /// socket, as a real client would.
    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}/", self.addr)
    }
}

async fn negotiate() -> impl IntoResponse {
    axum::Json(json!({
        "negotiateVersion": 1,
        "connectionId": "mock-connection-id",
        "connectionToken": "mock-connection-token",
        "availableTransports": [
            { "transport": "WebSockets", "transferFormats": ["Text"] }
        ]
    }))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(scenario): State<Arc<Scenario>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, scenario))
}

async fn handle_socket(mut socket: WebSocket, scenario: Arc<Scenario>) {
    let mut decoder = JsonDecoder::new();

    // Handshake: the very first text frame is the handshake request.
    let Some(Ok(Message::Text(first))) = socket.recv().await else {
        return;
    };
    let _handshake_req: Result<Value, _> = serde_json::from_str(first.trim_end_matches('\u{1e}'));

    if let Scenario::HandshakeError(err) = scenario.as_ref() {
        let resp = format!("{{\"error\":{}}}\u{1e}", json!(err));
        let _ = socket.send(Message::Text(resp.into())).await;
        let _ = socket.close().await;
        return;
    }

    if let Scenario::CoalescedClose = scenario.as_ref() {
        let close = HubMessage::Close(CloseMessage { error: None, allow_reconnect: Some(false) });
        let frame = format!("{}\u{1e}{}", "{}", encode(&close));
        let _ = socket.send(Message::Text(frame.into())).await;
        let _ = socket.close().await;
        return;
    }

    if socket
        .send(Message::Text("{}\u{1e}".into()))
        .await
        .is_err()
    {
        return;
    }

    if let Scenario::DisconnectOnce { attempts } = scenario.as_ref()
        && attempts.fetch_add(1, Ordering::SeqCst) == 0
    {
        let _ = socket.close().await;
        return;
    }

    let mut receive_seq: u64 = 0;
    while let Some(Ok(msg)) = socket.recv().await {
        let Message::Text(text) = msg else {
            continue;
        };
        let messages = match decoder.push(&text) {
            Ok(m) => m,
            Err(_) => continue,
        };
        for message in messages {
            receive_seq += 1;
            if handle_message(&mut socket, scenario.as_ref(), message, receive_seq)
                .await
                .is_err()
            {
                return;
            }
        }
    }
}

async fn handle_message(
    socket: &mut WebSocket,
    scenario: &Scenario,
    message: HubMessage,
    _receive_seq: u64,
) -> Result<(), axum::Error> {
    match scenario {
        Scenario::Echo => {
            if let HubMessage::Invocation(inv) = &message
                && inv.target == "SendMessage"
            {
                let echo = HubMessage::Invocation(InvocationMessage {
                    headers: Headers::new(),
                    invocation_id: None,
                    target: "ReceiveMessage".to_owned(),
                    arguments: inv.arguments.clone(),
                    stream_ids: None,
                });
                socket.send(Message::Text(encode(&echo).into())).await?;
            }
        }
        Scenario::CompletionEcho => {
            if let HubMessage::Invocation(inv) = &message
                && let Some(id) = &inv.invocation_id
            {
                let completion = HubMessage::Completion(CompletionMessage {
                    headers: Headers::new(),
                    invocation_id: id.clone(),
                    result: Some(Value::Array(inv.arguments.clone())),
                    error: None,
                });
                socket
                    .send(Message::Text(encode(&completion).into()))
                    .await?;
            }
        }
        Scenario::CounterStream => {
            if let HubMessage::StreamInvocation(inv) = &message
                && inv.target == "Counter"
            {
                let count = inv.arguments.first().and_then(Value::as_u64).unwrap_or(0);
                for i in 0..count {
                    let item = HubMessage::StreamItem(StreamItemMessage {
                        headers: Headers::new(),
                        invocation_id: inv.invocation_id.clone(),
                        item: json!(i),
                    });
                    socket.send(Message::Text(encode(&item).into())).await?;
                }
                let completion = HubMessage::Completion(CompletionMessage {
                    headers: Headers::new(),
                    invocation_id: inv.invocation_id.clone(),
                    result: None,
                    error: None,
                });
                socket
                    .send(Message::Text(encode(&completion).into()))
                    .await?;
            }
        }
        Scenario::UploadCapture { received } => {
            if matches!(message, HubMessage::StreamItem(_) | HubMessage::Completion(_)) {
                received.lock().unwrap().push(message);
            }
        }
        Scenario::DisconnectOnce { .. } | Scenario::HandshakeError(_) | Scenario::CoalescedClose => {}
    }
    Ok(())
}
