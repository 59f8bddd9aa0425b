//! Hub engine (C6): invocation correlation, stream handlers, inbound
//! message routing, and mandatory sequence-id/Ack bookkeeping. This module
//! is deliberately transport-agnostic — it only knows how to route decoded
//! [`HubMessage`]s and produce outbound ones onto `outbound`, the same
//! "pure logic, test it without a socket" split the teacher uses for
//! `apply_batch_counts` in its own session loop.

use crate::error::HubConnectionError;
use crate::subject::Subject;
use serde_json::Value;
use signalr_protocol::{
    AckMessage, CompletionMessage, HubMessage, InvocationMessage, MessageType, SequenceMessage,
    StreamInvocationMessage,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::{Mutex, mpsc};
use uuid::Uuid;

/// The three-callback record for a server-to-client stream, or for an
/// `invoke`/`send` completion tracked the same way (`next` unused there).
pub struct StreamHandler {
    pub next: Arc<dyn Fn(Value) + Send + Sync>,
    pub complete: Box<dyn FnOnce() + Send>,
    pub error: Box<dyn FnOnce(HubConnectionError) + Send>,
}

enum RegisteredHandler {
    Invocation(Box<dyn FnOnce(CompletionMessage) + Send>),
    Stream(StreamHandler),
}

/// Arguments to `invoke`/`send`: either a plain value list, or a client
/// upload source. Encoded as a tagged enum rather than a runtime type check.
pub enum InvocationArgs {
    Values(Vec<Value>),
    Upload(Subject),
}

type InvocationCallback = Arc<dyn Fn(Vec<Value>) + Send + Sync>;

pub struct HubEngine {
    handlers: Mutex<HashMap<String, Vec<InvocationCallback>>>,
    registered: Mutex<HashMap<String, RegisteredHandler>>,
    receive_sequence_id: AtomicU64,
    send_sequence_id: AtomicU64,
    outbound: mpsc::UnboundedSender<HubMessage>,
    on_error: Arc<dyn Fn(HubConnectionError) + Send + Sync>,
}

impl HubEngine {
    pub fn new(
        outbound: mpsc::UnboundedSender<HubMessage>,
        on_error: Arc<dyn Fn(HubConnectionError) + Send + Sync>,
    ) -> Self {
        Self {
            handlers: Mutex::new(HashMap::new()),
            registered: Mutex::new(HashMap::new()),
            receive_sequence_id: AtomicU64::new(0),
            send_sequence_id: AtomicU64::new(0),
            outbound,
            on_error,
        }
    }

    /// Register a callback for server-initiated invocations of `target`.
    /// Multiple callbacks for the same target all fire, in registration
    /// order.
    pub async fn on(&self, target: &str, callback: Arc<dyn Fn(Vec<Value>) + Send + Sync>) {
        self.handlers.lock().await.entry(target.to_owned()).or_default().push(callback);
    }

    pub fn reset_sequence_ids(&self) {
        self.receive_sequence_id.store(0, Ordering::SeqCst);
        self.send_sequence_id.store(0, Ordering::SeqCst);
    }

    pub fn receive_sequence_id(&self) -> u64 {
        self.receive_sequence_id.load(Ordering::SeqCst)
    }

    /// Sent once per reconnect, before `on_reconnect` fires, so the server
    /// knows which trackable messages it must replay.
    pub fn emit_reconnect_sequence(&self) {
        let id = self.receive_sequence_id();
        let _ = self.outbound.send(HubMessage::Sequence(SequenceMessage { sequence_id: id }));
    }

    pub async fn invoke(
        &self,
        target: &str,
        args: InvocationArgs,
        on_invocation: Option<Box<dyn FnOnce(CompletionMessage) + Send>>,
        invocation_id: Option<String>,
    ) -> Result<String, HubConnectionError> {
        let id = invocation_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let message = match args {
            InvocationArgs::Values(values) => {
                if let Some(cb) = on_invocation {
                    self.registered
                        .lock()
                        .await
                        .insert(id.clone(), RegisteredHandler::Invocation(cb));
                }
                HubMessage::Invocation(InvocationMessage {
                    headers: Default::default(),
                    invocation_id: Some(id.clone()),
                    target: target.to_owned(),
                    arguments: values,
                    stream_ids: None,
                })
            }
            InvocationArgs::Upload(subject) => {
                subject.bind(id.clone(), self.outbound.clone()).await;
                HubMessage::Invocation(InvocationMessage {
                    headers: Default::default(),
                    invocation_id: None,
                    target: target.to_owned(),
                    arguments: vec![],
                    stream_ids: Some(vec![id.clone()]),
                })
            }
        };
        self.send_sequence_id.fetch_add(1, Ordering::SeqCst);
        self.outbound
            .send(message)
            .map_err(|_| HubConnectionError::HubConnection("connection is not running".to_owned()))?;
        Ok(id)
    }

    /// Allocates an invocation id, registers `handler`, and sends the
    /// StreamInvocation. The caller owns attaching further behavior to the
    /// handler's callbacks before this returns its id.
    pub async fn stream(&self, target: &str, args: Vec<Value>, handler: StreamHandler) -> Result<String, HubConnectionError> {
        let id = Uuid::new_v4().to_string();
        self.registered.lock().await.insert(id.clone(), RegisteredHandler::Stream(handler));
        let message = HubMessage::StreamInvocation(StreamInvocationMessage {
            headers: Default::default(),
            invocation_id: id.clone(),
            target: target.to_owned(),
            arguments: args,
            stream_ids: None,
        });
        self.send_sequence_id.fetch_add(1, Ordering::SeqCst);
        self.outbound
            .send(message)
            .map_err(|_| HubConnectionError::HubConnection("connection is not running".to_owned()))?;
        Ok(id)
    }

    /// Route one decoded message per §4.6's table. Returns `true` if a
    /// Close message was seen — the caller must stop processing any further
    /// messages from the same decoded batch.
    pub async fn route(&self, msg: HubMessage) -> bool {
        let trackable = matches!(
            msg.message_type(),
            MessageType::Invocation
                | MessageType::StreamItem
                | MessageType::Completion
                | MessageType::StreamInvocation
                | MessageType::CancelInvocation
        );

        let mut close_seen = false;
        match msg {
            HubMessage::InvocationBindingFailure(b) => {
                tracing::warn!(detail = %b.detail, "binding failure");
                (self.on_error)(HubConnectionError::BindingFailure(b.detail));
            }
            HubMessage::Ping => {
                tracing::trace!("ping received");
            }
            HubMessage::Invocation(inv) => {
                let callbacks = {
                    let handlers = self.handlers.lock().await;
                    handlers.get(&inv.target).cloned().unwrap_or_default()
                };
                if callbacks.is_empty() {
                    tracing::debug!(target = %inv.target, "no handler registered for invocation target");
                }
                for cb in callbacks {
                    cb(inv.arguments.clone());
                }
            }
            HubMessage::StreamItem(item) => {
                let next = {
                    let registered = self.registered.lock().await;
                    match registered.get(&item.invocation_id) {
                        Some(RegisteredHandler::Stream(h)) => Some(h.next.clone()),
                        _ => None,
                    }
                };
                match next {
                    Some(next) => next(item.item),
                    None => tracing::warn!(id = %item.invocation_id, "stream item for unknown invocation"),
                }
            }
            HubMessage::Completion(comp) => {
                let entry = self.registered.lock().await.remove(&comp.invocation_id);
                if let Some(error) = comp.error.clone() {
                    (self.on_error)(HubConnectionError::CompletionError(error));
                }
                match entry {
                    Some(RegisteredHandler::Invocation(cb)) => cb(comp),
                    Some(RegisteredHandler::Stream(h)) => match comp.error {
                        Some(error) => (h.error)(HubConnectionError::CompletionError(error)),
                        None => (h.complete)(),
                    },
                    None => tracing::debug!(id = %comp.invocation_id, "completion for unknown or already-unregistered invocation"),
                }
            }
            HubMessage::StreamInvocation(inv) => {
                tracing::debug!(target = %inv.target, "server-originated streaming of client data is not supported");
            }
            HubMessage::CancelInvocation(cancel) => {
                if let Some(RegisteredHandler::Stream(h)) = self.registered.lock().await.remove(&cancel.invocation_id) {
                    (h.error)(HubConnectionError::HubConnection("invocation canceled".to_owned()));
                }
            }
            HubMessage::Close(close) => {
                tracing::info!(error = ?close.error, allow_reconnect = ?close.allow_reconnect, "close message received");
                close_seen = true;
            }
            HubMessage::Ack(ack) => tracing::trace!(sequence_id = ack.sequence_id, "ack received"),
            HubMessage::Sequence(seq) => tracing::trace!(sequence_id = seq.sequence_id, "sequence received"),
        }

        if trackable {
            let id = self.receive_sequence_id.fetch_add(1, Ordering::SeqCst) + 1;
            let _ = self.outbound.send(HubMessage::Ack(AckMessage { sequence_id: id }));
        }

        close_seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use signalr_protocol::{CancelInvocationMessage, CloseMessage, StreamItemMessage};
    use std::sync::Mutex as StdMutex;

    fn test_engine() -> (HubEngine, mpsc::UnboundedReceiver<HubMessage>, Arc<StdMutex<Vec<HubConnectionError>>>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let errors = Arc::new(StdMutex::new(Vec::new()));
        let errors_clone = errors.clone();
        let engine = HubEngine::new(tx, Arc::new(move |e| errors_clone.lock().unwrap().push(e)));
        (engine, rx, errors)
    }

    #[tokio::test]
    async fn invocation_dispatches_to_registered_handler() {
        let (engine, _rx, _errors) = test_engine();
        let received = Arc::new(StdMutex::new(Vec::new()));
        let received_clone = received.clone();
        engine
            .on(
                "ReceiveMessage",
                Arc::new(move |args| received_clone.lock().unwrap().push(args)),
            )
            .await;

        let msg = HubMessage::Invocation(InvocationMessage {
            headers: Default::default(),
            invocation_id: None,
            target: "ReceiveMessage".to_owned(),
            arguments: vec![Value::String("u".into()), Value::String("m".into())],
            stream_ids: None,
        });
        let close_seen = engine.route(msg).await;
        assert!(!close_seen);
        assert_eq!(received.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn completion_success_invokes_invocation_callback_once() {
        let (engine, _rx, _errors) = test_engine();
        let called = Arc::new(StdMutex::new(0));
        let called_clone = called.clone();
        engine
            .invoke(
                "SendMessage",
                InvocationArgs::Values(vec![]),
                Some(Box::new(move |_msg| *called_clone.lock().unwrap() += 1)),
                Some("fixed-id-1".to_owned()),
            )
            .await
            .unwrap();

        engine
            .route(HubMessage::Completion(CompletionMessage {
                headers: Default::default(),
                invocation_id: "fixed-id-1".to_owned(),
                result: Some(Value::Null),
                error: None,
            }))
            .await;
        assert_eq!(*called.lock().unwrap(), 1);

        // id must be unregistered: a duplicate completion is a no-op, not a
        // second callback invocation.
        engine
            .route(HubMessage::Completion(CompletionMessage {
                headers: Default::default(),
                invocation_id: "fixed-id-1".to_owned(),
                result: Some(Value::Null),
                error: None,
            }))
            .await;
        assert_eq!(*called.lock().unwrap(), 1);
    }

    #[tokio::test]
    async fn completion_with_error_routes_to_on_error_sink() {
        let (engine, _rx, errors) = test_engine();
        engine
            .route(HubMessage::Completion(CompletionMessage {
                headers: Default::default(),
                invocation_id: "unregistered".to_owned(),
                result: None,
                error: Some("boom".to_owned()),
            }))
            .await;
        assert_eq!(errors.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn stream_next_fires_five_times_then_complete_and_unregisters() {
        let (engine, _rx, _errors) = test_engine();
        let items = Arc::new(StdMutex::new(Vec::new()));
        let items_clone = items.clone();
        let completed = Arc::new(StdMutex::new(false));
        let completed_clone = completed.clone();
        let handler = StreamHandler {
            next: Arc::new(move |v| items_clone.lock().unwrap().push(v)),
            complete: Box::new(move || *completed_clone.lock().unwrap() = true),
            error: Box::new(|_| panic!("error should not fire")),
        };
        let id = engine.stream("Counter", vec![Value::from(5)], handler).await.unwrap();

        for i in 0..5 {
            engine
                .route(HubMessage::StreamItem(StreamItemMessage {
                    headers: Default::default(),
                    invocation_id: id.clone(),
                    item: Value::from(i),
                }))
                .await;
        }
        engine
            .route(HubMessage::Completion(CompletionMessage {
                headers: Default::default(),
                invocation_id: id.clone(),
                result: None,
                error: None,
            }))
            .await;

        assert_eq!(items.lock().unwrap().len(), 5);
        assert!(*completed.lock().unwrap());

        // Further StreamItems for the now-unregistered id are dropped, not delivered.
        engine
            .route(HubMessage::StreamItem(StreamItemMessage {
                headers: Default::default(),
                invocation_id: id,
                item: Value::from(99),
            }))
            .await;
        assert_eq!(items.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn cancel_invocation_fires_stream_error_and_unregisters() {
        let (engine, _rx, _errors) = test_engine();
        let errored = Arc::new(StdMutex::new(false));
        let errored_clone = errored.clone();
        let handler = StreamHandler {
            next: Arc::new(|_| {}),
            complete: Box::new(|| panic!("complete should not fire")),
            error: Box::new(move |_| *errored_clone.lock().unwrap() = true),
        };
        let id = engine.stream("Counter", vec![], handler).await.unwrap();
        engine
            .route(HubMessage::CancelInvocation(CancelInvocationMessage {
                headers: Default::default(),
                invocation_id: id,
            }))
            .await;
        assert!(*errored.lock().unwrap());
    }

    #[tokio::test]
    async fn close_message_stops_batch_processing() {
        let (engine, _rx, _errors) = test_engine();
        let close_seen = engine
            .route(HubMessage::Close(CloseMessage {
                error: Some("server shutting down".to_owned()),
                allow_reconnect: Some(false),
            }))
            .await;
        assert!(close_seen);
    }

    #[tokio::test]
    async fn every_trackable_tag_emits_exactly_one_ack() {
        let (engine, mut rx, _errors) = test_engine();
        engine
            .route(HubMessage::Invocation(InvocationMessage {
                headers: Default::default(),
                invocation_id: None,
                target: "X".to_owned(),
                arguments: vec![],
                stream_ids: None,
            }))
            .await;
        let ack = rx.recv().await.unwrap();
        assert!(matches!(ack, HubMessage::Ack(a) if a.sequence_id == 1));
        assert_eq!(engine.receive_sequence_id(), 1);

        engine.route(HubMessage::Ping).await;
        assert!(rx.try_recv().is_err());
        assert_eq!(engine.receive_sequence_id(), 1);
    }
}
