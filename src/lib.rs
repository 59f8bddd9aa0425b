//! Public operations (C7): `HubConnection`, a thin wrapper over the hub
//! engine (C6) composed with negotiation (C4), the transport adapter (C3),
//! a transport client (C2), and an optional reconnection policy (C5).

pub mod adapter;
pub mod engine;
pub mod error;
pub mod negotiation;
pub mod options;
pub mod reconnect;
pub mod subject;
pub mod transport;

pub use engine::{InvocationArgs, StreamHandler};
pub use error::HubConnectionError;
pub use options::HubConnectionOptions;
pub use subject::Subject;

use adapter::{AdapterOutcome, ConnectionState, FiredCallback, SharedState, TransportAdapter};
use engine::HubEngine;
use serde_json::Value;
use signalr_protocol::{CompletionMessage, HubMessage, HubProtocol, TransferFormat};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use transport::long_polling::LongPollingTransport;
use transport::sse::SseTransport;
use transport::websocket::WebSocketTransport;
use transport::{AnyTransport, TransportEvent, TransportKind, TransportMessage};

tokio::task_local! {
    static ON_RUN_TASK: bool;
}

/// User-supplied lifecycle callbacks. Any of these left `None` are simply
/// never invoked.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<Arc<dyn Fn() + Send + Sync>>,
    pub on_close: Option<Arc<dyn Fn(Option<HubConnectionError>) + Send + Sync>>,
    pub on_error: Option<Arc<dyn Fn(HubConnectionError) + Send + Sync>>,
    pub on_reconnect: Option<Arc<dyn Fn() + Send + Sync>>,
}

enum Decoder {
    Json(signalr_protocol::json::JsonDecoder),
    MsgPack(signalr_protocol::msgpack::MsgPackDecoder),
}

impl Decoder {
    fn for_protocol(protocol: HubProtocol) -> Self {
        match protocol {
            HubProtocol::Json => Self::Json(signalr_protocol::json::JsonDecoder::default()),
            HubProtocol::MessagePack => Self::MsgPack(signalr_protocol::msgpack::MsgPackDecoder::default()),
        }
    }

    fn push(&mut self, msg: TransportMessage) -> Result<Vec<HubMessage>, HubConnectionError> {
        let messages = match (self, msg) {
            (Decoder::Json(d), TransportMessage::Text(s)) => d.push(&s)?,
            (Decoder::Json(d), TransportMessage::Binary(b)) => d.push(&String::from_utf8_lossy(&b))?,
            (Decoder::MsgPack(d), TransportMessage::Binary(b)) => d.push(&b)?,
            (Decoder::MsgPack(d), TransportMessage::Text(s)) => d.push(s.as_bytes())?,
        };
        Ok(messages)
    }
}

fn encode_message(protocol: HubProtocol, msg: &HubMessage) -> Result<TransportMessage, HubConnectionError> {
    match protocol {
        HubProtocol::Json => Ok(TransportMessage::Text(signalr_protocol::json::encode(msg))),
        HubProtocol::MessagePack => Ok(TransportMessage::Binary(signalr_protocol::msgpack::encode(msg)?)),
    }
}

struct ConnectOutcome {
    transport: AnyTransport,
    protocol: HubProtocol,
}

async fn connect_transport(hub_url: &str, options: &HubConnectionOptions) -> Result<ConnectOutcome, HubConnectionError> {
    let client = options.build_http_client()?;
    let mut headers = options.headers.clone();
    if let Some(factory) = &options.access_token_factory
        && let Some(token) = factory()
    {
        headers.insert("Authorization".to_owned(), format!("Bearer {token}"));
    }

    if options.skip_negotiation {
        let ws_url = negotiation::to_ws_scheme(&negotiation::to_http_scheme(hub_url)?);
        let transport = AnyTransport::WebSocket(WebSocketTransport::connect(ws_url.as_str(), &headers).await?);
        return Ok(ConnectOutcome {
            transport,
            protocol: HubProtocol::Json,
        });
    }

    let outcome = negotiation::negotiate(&client, hub_url, &headers).await?;
    if let Some(token) = &outcome.response.access_token {
        headers.insert("Authorization".to_owned(), format!("Bearer {token}"));
    }
    let (kind, format) = negotiation::select_transport(options.transport, &outcome.response.available_transports)
        .ok_or_else(|| HubConnectionError::NegotiateValidation("no compatible transport offered by server".to_owned()))?;
    let protocol = match format {
        TransferFormat::Text => HubProtocol::Json,
        TransferFormat::Binary => HubProtocol::MessagePack,
    };

    let transport = match kind {
        TransportKind::WebSockets => {
            let ws_url = negotiation::to_ws_scheme(&outcome.connection_url);
            AnyTransport::WebSocket(WebSocketTransport::connect(ws_url.as_str(), &headers).await?)
        }
        TransportKind::ServerSentEvents => {
            AnyTransport::Sse(SseTransport::connect(client.clone(), outcome.connection_url.as_str(), &headers).await?)
        }
        TransportKind::LongPolling => {
            let url = outcome.connection_url.as_str();
            AnyTransport::LongPolling(
                LongPollingTransport::connect(client.clone(), url, url, url, &headers, format, options.poll_timeout).await?,
            )
        }
    };

    Ok(ConnectOutcome { transport, protocol })
}

struct Established {
    transport: AnyTransport,
    protocol: HubProtocol,
    coalesced: Vec<HubMessage>,
}

async fn connect_and_handshake(hub_url: &str, options: &HubConnectionOptions) -> Result<Established, HubConnectionError> {
    let mut outcome = connect_transport(hub_url, options).await?;
    let request = signalr_protocol::json::encode_handshake_request(outcome.protocol.name(), outcome.protocol.version());
    outcome.transport.send(TransportMessage::Text(request)).await?;

    let response_text = match outcome.transport.recv_event().await {
        TransportEvent::Message(TransportMessage::Text(s)) => s,
        TransportEvent::Message(TransportMessage::Binary(b)) => String::from_utf8_lossy(&b).into_owned(),
        TransportEvent::Closed => return Err(HubConnectionError::SocketClosed("closed during handshake".to_owned())),
        TransportEvent::Error(e) => return Err(e),
    };

    let (handshake_response, coalesced) = signalr_protocol::json::decode_handshake(&response_text)?;
    if let Some(error) = handshake_response.error {
        return Err(HubConnectionError::Handshake(error));
    }

    Ok(Established {
        transport: outcome.transport,
        protocol: outcome.protocol,
        coalesced,
    })
}

/// A SignalR hub connection. Construct with [`HubConnection::new`], call
/// [`HubConnection::start`] once, then `invoke`/`send`/`stream`/`on` as
/// needed, and [`HubConnection::stop`] when done.
pub struct HubConnection {
    hub_url: String,
    options: HubConnectionOptions,
    engine: Arc<HubEngine>,
    outbound_rx: Mutex<Option<tokio::sync::mpsc::UnboundedReceiver<HubMessage>>>,
    state: SharedState,
    callbacks: Arc<Callbacks>,
    run_task: Mutex<Option<JoinHandle<()>>>,
    manually_closing: Arc<AtomicBool>,
    shutdown: Arc<tokio::sync::Notify>,
}

impl HubConnection {
    pub fn new(hub_url: impl Into<String>, options: HubConnectionOptions, callbacks: Callbacks) -> Result<Arc<Self>, HubConnectionError> {
        options.validate()?;
        let on_error = callbacks.on_error.clone().unwrap_or_else(|| Arc::new(|_| {}));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        Ok(Arc::new(Self {
            hub_url: hub_url.into(),
            options,
            engine: Arc::new(HubEngine::new(tx, on_error)),
            outbound_rx: Mutex::new(Some(rx)),
            state: SharedState::new(),
            callbacks: Arc::new(callbacks),
            run_task: Mutex::new(None),
            manually_closing: Arc::new(AtomicBool::new(false)),
            shutdown: Arc::new(tokio::sync::Notify::new()),
        }))
    }

    pub async fn state(&self) -> ConnectionState {
        self.state.get().await
    }

    pub async fn wait_until_state(&self, target: ConnectionState, timeout: Option<Duration>) -> Result<(), HubConnectionError> {
        adapter::wait_until_state(&self.state, target, timeout).await
    }

    /// Register a callback for server-initiated invocations of `target`.
    pub async fn on(&self, target: &str, callback: impl Fn(Vec<Value>) + Send + Sync + 'static) {
        self.engine.on(target, Arc::new(callback)).await;
    }

    /// Fire-and-forget invocation.
    pub async fn send(&self, target: &str, args: Vec<Value>) -> Result<(), HubConnectionError> {
        if self.state().await != ConnectionState::Connected {
            return Err(HubConnectionError::HubConnection("connection is not running".to_owned()));
        }
        self.engine.invoke(target, InvocationArgs::Values(args), None, None).await.map(|_| ())
    }

    /// Invoke and await the server's Completion.
    pub async fn invoke(&self, target: &str, args: Vec<Value>) -> Result<CompletionMessage, HubConnectionError> {
        self.invoke_with_id(target, args, None).await
    }

    pub async fn invoke_with_id(
        &self,
        target: &str,
        args: Vec<Value>,
        invocation_id: Option<String>,
    ) -> Result<CompletionMessage, HubConnectionError> {
        if self.state().await != ConnectionState::Connected {
            return Err(HubConnectionError::HubConnection("connection is not running".to_owned()));
        }
        let (tx, rx) = tokio::sync::oneshot::channel();
        self.engine
            .invoke(
                target,
                InvocationArgs::Values(args),
                Some(Box::new(move |msg| {
                    let _ = tx.send(msg);
                })),
                invocation_id,
            )
            .await?;
        rx.await.map_err(|_| HubConnectionError::HubConnection("connection closed before completion arrived".to_owned()))
    }

    /// Subscribe to a server-to-client stream.
    pub async fn stream(
        &self,
        target: &str,
        args: Vec<Value>,
        next: impl Fn(Value) + Send + Sync + 'static,
        complete: impl FnOnce() + Send + 'static,
        error: impl FnOnce(HubConnectionError) + Send + 'static,
    ) -> Result<String, HubConnectionError> {
        if self.state().await != ConnectionState::Connected {
            return Err(HubConnectionError::HubConnection("connection is not running".to_owned()));
        }
        let handler = StreamHandler {
            next: Arc::new(next),
            complete: Box::new(complete),
            error: Box::new(error),
        };
        self.engine.stream(target, args, handler).await
    }

    /// Upload a client-to-server stream via `subject`.
    pub async fn send_upload(&self, target: &str, subject: Subject) -> Result<String, HubConnectionError> {
        if self.state().await != ConnectionState::Connected {
            return Err(HubConnectionError::HubConnection("connection is not running".to_owned()));
        }
        self.engine.invoke(target, InvocationArgs::Upload(subject), None, None).await
    }

    fn fire(&self, fired: FiredCallback, close_error: Option<HubConnectionError>) {
        match fired {
            FiredCallback::OnOpen => {
                if let Some(cb) = &self.callbacks.on_open {
                    cb();
                }
            }
            FiredCallback::OnClose => {
                if let Some(cb) = &self.callbacks.on_close {
                    cb(close_error);
                }
            }
            FiredCallback::OnReconnect => {
                if let Some(cb) = &self.callbacks.on_reconnect {
                    cb();
                }
            }
        }
    }

    pub async fn start(self: &Arc<Self>) -> Result<(), HubConnectionError> {
        if self.state().await != ConnectionState::Disconnected {
            return Err(HubConnectionError::InvalidConfig("connection already started".to_owned()));
        }
        self.manually_closing.store(false, Ordering::SeqCst);
        let outbound_rx = self
            .outbound_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| HubConnectionError::InvalidConfig("connection can only be started once per instance".to_owned()))?;

        self.engine.reset_sequence_ids();
        self.state.set(ConnectionState::Connecting).await;

        let established = match connect_and_handshake(&self.hub_url, &self.options).await {
            Ok(e) => e,
            Err(err) => {
                self.state.set(ConnectionState::Disconnected).await;
                *self.outbound_rx.lock().await = Some(outbound_rx);
                return Err(err);
            }
        };

        if let Some(fired) = self.state.set(ConnectionState::Connected).await {
            self.fire(fired, None);
        }

        let this = self.clone();
        let task = tokio::spawn(ON_RUN_TASK.scope(true, async move {
            this.run(established, outbound_rx).await;
        }));
        *self.run_task.lock().await = Some(task);
        Ok(())
    }

    async fn run(self: Arc<Self>, mut established: Established, mut outbound_rx: tokio::sync::mpsc::UnboundedReceiver<HubMessage>) {
        'reconnect: loop {
            let mut adapter = TransportAdapter::new(established.transport, self.options.keep_alive_interval);
            let mut decoder = Decoder::for_protocol(established.protocol);
            let protocol = established.protocol;
            let mut ticker = tokio::time::interval(self.options.keep_alive_interval.max(Duration::from_millis(50)));
            ticker.tick().await;

            let mut last_error: Option<HubConnectionError> = None;

            let mut coalesced_closed = false;
            for msg in established.coalesced.drain(..) {
                if self.engine.route(msg).await {
                    coalesced_closed = true;
                    break;
                }
            }

            'connected: loop {
                if coalesced_closed {
                    break 'connected;
                }
                if self.manually_closing.load(Ordering::SeqCst) {
                    break 'connected;
                }
                tokio::select! {
                    biased;
                    () = self.shutdown.notified() => {
                        break 'connected;
                    }
                    outbound = outbound_rx.recv() => {
                        match outbound {
                            Some(hub_msg) => {
                                match encode_message(protocol, &hub_msg) {
                                    Ok(transport_msg) => {
                                        if let Err(e) = adapter.send(transport_msg).await {
                                            last_error = Some(e);
                                            break 'connected;
                                        }
                                    }
                                    Err(e) => {
                                        if let Some(cb) = &self.callbacks.on_error { cb(e); }
                                    }
                                }
                            }
                            None => {
                                self.manually_closing.store(true, Ordering::SeqCst);
                                break 'connected;
                            }
                        }
                    }
                    outcome = adapter.poll(&mut ticker) => {
                        match outcome {
                            AdapterOutcome::NeedsPing => {
                                if let Ok(ping) = encode_message(protocol, &HubMessage::Ping) {
                                    let _ = adapter.send(ping).await;
                                    adapter.note_sent_ping();
                                }
                            }
                            AdapterOutcome::Event(TransportEvent::Message(tm)) => {
                                match decoder.push(tm) {
                                    Ok(messages) => {
                                        let mut closed = false;
                                        for m in messages {
                                            if self.engine.route(m).await {
                                                closed = true;
                                                break;
                                            }
                                        }
                                        if closed {
                                            break 'connected;
                                        }
                                    }
                                    Err(e) => {
                                        if let Some(cb) = &self.callbacks.on_error { cb(e); }
                                    }
                                }
                            }
                            AdapterOutcome::Event(TransportEvent::Closed) => {
                                break 'connected;
                            }
                            AdapterOutcome::Event(TransportEvent::Error(e)) => {
                                last_error = Some(e);
                                break 'connected;
                            }
                        }
                    }
                }
            }

            adapter.close().await;

            if self.manually_closing.load(Ordering::SeqCst) {
                if let Some(fired) = self.state.set(ConnectionState::Disconnected).await {
                    self.fire(fired, last_error);
                }
                return;
            }

            let Some(policy_kind) = &self.options.reconnect else {
                if let Some(e) = &last_error
                    && let Some(cb) = &self.callbacks.on_error
                {
                    cb(e.clone());
                }
                if let Some(fired) = self.state.set(ConnectionState::Disconnected).await {
                    self.fire(fired, last_error);
                }
                return;
            };

            self.state.set(ConnectionState::Reconnecting).await;
            let mut policy = policy_kind.build();

            loop {
                let Some(delay) = policy.next() else {
                    if let Some(e) = &last_error
                        && let Some(cb) = &self.callbacks.on_error
                    {
                        cb(e.clone());
                    }
                    if let Some(fired) = self.state.set(ConnectionState::Disconnected).await {
                        self.fire(fired, last_error);
                    }
                    return;
                };
                tokio::select! {
                    () = tokio::time::sleep(delay) => {}
                    () = self.shutdown.notified() => {}
                }

                if self.manually_closing.load(Ordering::SeqCst) {
                    if let Some(fired) = self.state.set(ConnectionState::Disconnected).await {
                        self.fire(fired, None);
                    }
                    return;
                }

                match connect_and_handshake(&self.hub_url, &self.options).await {
                    Ok(new_established) => {
                        policy.reset();
                        self.engine.emit_reconnect_sequence();
                        if let Some(fired) = self.state.set(ConnectionState::Connected).await {
                            self.fire(fired, None);
                        }
                        established = new_established;
                        continue 'reconnect;
                    }
                    Err(e) => {
                        last_error = Some(e);
                        continue;
                    }
                }
            }
        }
    }

    pub async fn stop(&self) -> Result<(), HubConnectionError> {
        self.manually_closing.store(true, Ordering::SeqCst);
        self.shutdown.notify_one();
        let called_from_run_task = ON_RUN_TASK.try_with(|v| *v).unwrap_or(false);
        let task = self.run_task.lock().await.take();
        if let Some(task) = task {
            if called_from_run_task {
                // The run task's own receive loop notices `manually_closing`
                // on its next check; awaiting ourselves here would deadlock.
            } else {
                let _ = task.await;
            }
        }
        if let Some(fired) = self.state.set(ConnectionState::Disconnected).await {
            self.fire(fired, None);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_config_rejected_at_construction() {
        let options = HubConnectionOptions {
            skip_negotiation: true,
            transport: Some(TransportKind::LongPolling),
            ..Default::default()
        };
        let result = HubConnection::new("http://localhost/hub", options, Callbacks::default());
        assert!(matches!(result, Err(HubConnectionError::InvalidConfig(_))));
    }

    #[test]
    fn valid_options_construct_successfully() {
        let options = HubConnectionOptions::default();
        let connection = HubConnection::new("http://localhost/hub", options, Callbacks::default());
        assert!(connection.is_ok());
    }

    #[tokio::test]
    async fn fresh_connection_starts_disconnected() {
        let connection = HubConnection::new("http://localhost/hub", HubConnectionOptions::default(), Callbacks::default()).unwrap();
        assert_eq!(connection.state().await, ConnectionState::Disconnected);
    }

    #[test]
    fn json_decoder_round_trips_through_encode_message() {
        let msg = HubMessage::Ping;
        let encoded = encode_message(HubProtocol::Json, &msg).unwrap();
        let mut decoder = Decoder::for_protocol(HubProtocol::Json);
        let decoded = decoder.push(encoded).unwrap();
        assert_eq!(decoded, vec![HubMessage::Ping]);
    }

    #[test]
    fn msgpack_decoder_round_trips_through_encode_message() {
        let msg = HubMessage::Ping;
        let encoded = encode_message(HubProtocol::MessagePack, &msg).unwrap();
        let mut decoder = Decoder::for_protocol(HubProtocol::MessagePack);
        let decoded = decoder.push(encoded).unwrap();
        assert_eq!(decoded, vec![HubMessage::Ping]);
    }
}
