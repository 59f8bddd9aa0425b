//! Server-Sent Events transport client.
//!
//! The upstream Python reference's SSE client reuses its WebSocket binary
//! frame parser for `_recv_frame` — a copy-paste artifact that never
//! actually parses `text/event-stream` syntax. This client parses the real
//! `data:` line grammar instead: concatenate consecutive `data:` lines,
//! terminate an event on a blank line, strip one trailing record separator.
//! Transfer-encoding dechunking is handled by `reqwest`'s body stream, the
//! same way the teacher's own HTTP calls rely on `reqwest` rather than a
//! hand-rolled socket reader.

use crate::error::HubConnectionError;
use crate::transport::{TransportEvent, TransportMessage};
use futures_util::StreamExt;
use signalr_protocol::json::RECORD_SEPARATOR;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

pub struct SseTransport {
    client: reqwest::Client,
    post_url: String,
    headers: HashMap<String, String>,
    rx: mpsc::Receiver<TransportEvent>,
    closed: Arc<AtomicBool>,
    _task: tokio::task::JoinHandle<()>,
}

impl SseTransport {
    pub async fn connect(
        client: reqwest::Client,
        url: &str,
        headers: &HashMap<String, String>,
    ) -> Result<Self, HubConnectionError> {
        let mut req = client
            .get(url)
            .header("Accept", "text/event-stream")
            .header("Cache-Control", "no-cache")
            .header("Connection", "keep-alive");
        for (k, v) in headers {
            req = req.header(k, v);
        }

        let response = req.send().await?;
        if response.status() != reqwest::StatusCode::OK {
            return Err(HubConnectionError::SocketHandshake(format!(
                "SSE connect returned status {}",
                response.status()
            )));
        }

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(256);
        let task_closed = closed.clone();
        let task = tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            let mut buf = String::new();
            while let Some(chunk) = stream.next().await {
                let chunk = match chunk {
                    Ok(c) => c,
                    Err(e) => {
                        let _ = tx
                            .send(TransportEvent::Error(HubConnectionError::from(e)))
                            .await;
                        break;
                    }
                };
                buf.push_str(&String::from_utf8_lossy(&chunk));
                while let Some(event) = take_one_event(&mut buf) {
                    if tx.send(TransportEvent::Message(TransportMessage::Text(event))).await.is_err() {
                        return;
                    }
                }
            }
            task_closed.store(true, Ordering::SeqCst);
            let _ = tx.send(TransportEvent::Closed).await;
        });

        Ok(Self {
            client,
            post_url: url.to_owned(),
            headers: headers.clone(),
            rx,
            closed,
            _task: task,
        })
    }

    pub async fn send(&mut self, msg: TransportMessage) -> Result<(), HubConnectionError> {
        let (body, content_type): (Vec<u8>, &str) = match msg {
            TransportMessage::Text(s) => (s.into_bytes(), "application/json"),
            TransportMessage::Binary(b) => (b, "application/octet-stream"),
        };
        let mut req = self
            .client
            .post(&self.post_url)
            .header("Content-Type", content_type)
            .body(body);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        req.send().await?;
        Ok(())
    }

    pub async fn recv_event(&mut self) -> TransportEvent {
        match self.rx.recv().await {
            Some(event) => event,
            None => TransportEvent::Closed,
        }
    }

    pub async fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
        self.rx.close();
    }

    pub fn is_connection_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Pull one complete SSE event (one or more `data:` lines, terminated by a
/// blank line) out of the front of `buf`, leaving any remaining partial
/// event in place. Multiple `data:` lines are joined with `\n`; one
/// trailing record separator is stripped if present. Comment-only blocks
/// (no `data:` line) are consumed and skipped.
fn take_one_event(buf: &mut String) -> Option<String> {
    loop {
        let blank_at = buf.find("\n\n").or_else(|| buf.find("\r\n\r\n"))?;
        let rest = &buf[blank_at..];
        let sep_len = if rest.starts_with("\r\n\r\n") { 4 } else { 2 };
        let event_block = buf[..blank_at].to_owned();
        let remaining = buf[blank_at + sep_len..].to_owned();
        *buf = remaining;

        let data_lines: Vec<&str> = event_block
            .lines()
            .filter_map(|line| line.strip_prefix("data:"))
            .map(|data| data.strip_prefix(' ').unwrap_or(data))
            .collect();

        if data_lines.is_empty() {
            continue;
        }

        let mut payload = data_lines.join("\n");
        if payload.ends_with(RECORD_SEPARATOR as char) {
            payload.pop();
        }
        return Some(payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_data_line_event_strips_trailing_separator() {
        let mut buf = format!("data: hello{}\n\n", RECORD_SEPARATOR as char);
        let event = take_one_event(&mut buf).unwrap();
        assert_eq!(event, "hello");
        assert!(buf.is_empty());
    }

    #[test]
    fn multiple_data_lines_are_concatenated() {
        let mut buf = "data: line one\ndata: line two\n\n".to_owned();
        let event = take_one_event(&mut buf).unwrap();
        assert_eq!(event, "line one\nline two");
    }

    #[test]
    fn partial_event_is_left_in_buffer() {
        let mut buf = "data: partial".to_owned();
        assert!(take_one_event(&mut buf).is_none());
        assert_eq!(buf, "data: partial");
    }

    #[test]
    fn leftover_bytes_after_event_are_preserved() {
        let mut buf = "data: first\n\ndata: second".to_owned();
        let first = take_one_event(&mut buf).unwrap();
        assert_eq!(first, "first");
        assert_eq!(buf, "data: second");
    }
}
