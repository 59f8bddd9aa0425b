//! Client-to-server streaming upload (C6's "Subject"): a small
//! multi-producer sink. `next`/`complete` both go through the same mutex so
//! concurrent producers still emit one well-ordered frame at a time, the way
//! the engine's own send path is globally serialized (§5).

use crate::error::HubConnectionError;
use signalr_protocol::{CompletionMessage, HubMessage, StreamItemMessage};
use std::sync::Arc;
use tokio::sync::{Mutex, mpsc};

struct SubjectInner {
    invocation_id: Option<String>,
    sink: Option<mpsc::UnboundedSender<HubMessage>>,
    completed: bool,
}

/// Handed to the caller by `invoke`/`send` when the arguments are an upload
/// source rather than a value list. `Subject::new` can be constructed before
/// the invocation id is known; the engine calls `bind` once it has assigned
/// one and opened the outbound channel.
#[derive(Clone)]
pub struct Subject {
    inner: Arc<Mutex<SubjectInner>>,
}

impl Subject {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(SubjectInner {
                invocation_id: None,
                sink: None,
                completed: false,
            })),
        }
    }

    pub(crate) async fn bind(&self, invocation_id: String, sink: mpsc::UnboundedSender<HubMessage>) {
        let mut inner = self.inner.lock().await;
        inner.invocation_id = Some(invocation_id);
        inner.sink = Some(sink);
    }

    /// Send one `StreamItem(id, item)` frame.
    pub async fn next(&self, item: serde_json::Value) -> Result<(), HubConnectionError> {
        let inner = self.inner.lock().await;
        if inner.completed {
            return Err(HubConnectionError::HubConnection(
                "subject already completed".to_owned(),
            ));
        }
        let id = inner
            .invocation_id
            .clone()
            .ok_or_else(|| HubConnectionError::HubConnection("subject not bound to an invocation yet".to_owned()))?;
        let sink = inner
            .sink
            .clone()
            .ok_or_else(|| HubConnectionError::HubConnection("subject not bound to an invocation yet".to_owned()))?;
        sink.send(HubMessage::StreamItem(StreamItemMessage {
            headers: Default::default(),
            invocation_id: id,
            item,
        }))
        .map_err(|_| HubConnectionError::HubConnection("connection closed".to_owned()))
    }

    /// Send a void client Completion for this subject's invocation id.
    pub async fn complete(&self) -> Result<(), HubConnectionError> {
        let mut inner = self.inner.lock().await;
        if inner.completed {
            return Ok(());
        }
        let id = inner
            .invocation_id
            .clone()
            .ok_or_else(|| HubConnectionError::HubConnection("subject not bound to an invocation yet".to_owned()))?;
        let sink = inner
            .sink
            .clone()
            .ok_or_else(|| HubConnectionError::HubConnection("subject not bound to an invocation yet".to_owned()))?;
        sink.send(HubMessage::Completion(CompletionMessage {
            headers: Default::default(),
            invocation_id: id,
            result: None,
            error: None,
        }))
        .map_err(|_| HubConnectionError::HubConnection("connection closed".to_owned()))?;
        inner.completed = true;
        Ok(())
    }
}

impl Default for Subject {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn next_before_bind_errors() {
        let subject = Subject::new();
        let err = subject.next(serde_json::json!("a")).await.unwrap_err();
        assert!(matches!(err, HubConnectionError::HubConnection(_)));
    }

    #[tokio::test]
    async fn bound_subject_emits_stream_items_then_completion() {
        let subject = Subject::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.bind("inv-1".to_owned(), tx).await;

        subject.next(serde_json::json!("a")).await.unwrap();
        subject.next(serde_json::json!("b")).await.unwrap();
        subject.complete().await.unwrap();

        let first = rx.recv().await.unwrap();
        assert!(matches!(first, HubMessage::StreamItem(m) if m.item == serde_json::json!("a")));
        let second = rx.recv().await.unwrap();
        assert!(matches!(second, HubMessage::StreamItem(m) if m.item == serde_json::json!("b")));
        let third = rx.recv().await.unwrap();
        assert!(matches!(third, HubMessage::Completion(m) if m.invocation_id == "inv-1"));
    }

    #[tokio::test]
    async fn next_after_complete_errors() {
        let subject = Subject::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        subject.bind("inv-1".to_owned(), tx).await;
        subject.complete().await.unwrap();
        let err = subject.next(serde_json::json!("a")).await.unwrap_err();
        assert!(matches!(err, HubConnectionError::HubConnection(_)));
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let subject = Subject::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        subject.bind("inv-1".to_owned(), tx).await;
        subject.complete().await.unwrap();
        subject.complete().await.unwrap();
        assert!(rx.recv().await.is_some());
        // second complete() must not have enqueued a duplicate frame.
        assert!(rx.try_recv().is_err());
    }
}
