//! HTTP long-polling transport client.
//!
//! Upstream is a POST per message; downstream is a repeated GET. A 200
//! carries a payload (one HTTP response may bundle several record-separated
//! hub messages — unlike the upstream Python reference, which only ever
//! extracts the first record per poll, this delivers the whole payload
//! upward and lets the shared record-separator decoder in
//! `signalr-protocol` pull out every complete record); 204 means another
//! client took over this connection id and the transport must close; 404
//! and 400 are fatal; request timeouts are simply retried.

use crate::error::HubConnectionError;
use crate::transport::{TransferFormat, TransportEvent, TransportMessage};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::mpsc;

pub struct LongPollingTransport {
    client: reqwest::Client,
    send_url: String,
    delete_url: String,
    headers: HashMap<String, String>,
    rx: mpsc::Receiver<TransportEvent>,
    closed: Arc<AtomicBool>,
    _task: tokio::task::JoinHandle<()>,
}

impl LongPollingTransport {
    pub async fn connect(
        client: reqwest::Client,
        poll_url: &str,
        send_url: &str,
        delete_url: &str,
        headers: &HashMap<String, String>,
        format: TransferFormat,
        poll_timeout: std::time::Duration,
    ) -> Result<Self, HubConnectionError> {
        let accept = match format {
            TransferFormat::Text => "text/plain",
            TransferFormat::Binary => "application/octet-stream",
        };

        // One validating poll, matching the WS/SSE requirement that
        // `connect` only returns once the transport has proven reachable. A
        // timeout on this very first poll is retried in place, same as the
        // background loop.
        let first = loop {
            match poll_once(&client, poll_url, headers, accept, poll_timeout).await? {
                PollOutcome::Payload(payload) => break Some(payload),
                PollOutcome::Takeover => break None,
                PollOutcome::Timeout => continue,
            }
        };

        let closed = Arc::new(AtomicBool::new(false));
        let (tx, rx) = mpsc::channel(256);
        if let Some(payload) = first {
            let _ = tx.send(to_event(payload, format)).await;
        }

        let task_closed = closed.clone();
        let poll_url = poll_url.to_owned();
        let headers_clone = headers.clone();
        let task_client = client.clone();
        let task = tokio::spawn(async move {
            loop {
                if task_closed.load(Ordering::SeqCst) {
                    return;
                }
                match poll_once(&task_client, &poll_url, &headers_clone, accept, poll_timeout).await {
                    Ok(PollOutcome::Payload(payload)) => {
                        if tx.send(to_event(payload, format)).await.is_err() {
                            return;
                        }
                    }
                    Ok(PollOutcome::Takeover) => {
                        // 204: another client took over this connection id.
                        task_closed.store(true, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Closed).await;
                        return;
                    }
                    Ok(PollOutcome::Timeout) => continue,
                    Err(e) => {
                        task_closed.store(true, Ordering::SeqCst);
                        let _ = tx.send(TransportEvent::Error(e)).await;
                        return;
                    }
                }
            }
        });

        Ok(Self {
            client,
            send_url: send_url.to_owned(),
            delete_url: delete_url.to_owned(),
            headers: headers.clone(),
            rx,
            closed,
            _task: task,
        })
    }

    pub async fn send(&mut self, msg: TransportMessage) -> Result<(), HubConnectionError> {
        let (body, content_type): (Vec<u8>, &str) = match msg {
            TransportMessage::Text(s) => (s.into_bytes(), "text/plain"),
            TransportMessage::Binary(b) => (b, "application/octet-stream"),
        };
        let mut req = self
            .client
            .post(&self.send_url)
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

    /// `DELETE <base>?id=<connectionId>`; 200/202 success, 404 tolerated.
    pub async fn close(&mut self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let mut req = self.client.delete(&self.delete_url);
        for (k, v) in &self.headers {
            req = req.header(k, v);
        }
        if let Ok(resp) = req.send().await {
            let status = resp.status();
            if status != reqwest::StatusCode::OK
                && status != reqwest::StatusCode::ACCEPTED
                && status != reqwest::StatusCode::NOT_FOUND
            {
                tracing::warn!(%status, "long-polling close returned unexpected status");
            }
        }
        self.rx.close();
    }

    pub fn is_connection_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

fn to_event(payload: Vec<u8>, format: TransferFormat) -> TransportEvent {
    match format {
        TransferFormat::Text => {
            TransportEvent::Message(TransportMessage::Text(String::from_utf8_lossy(&payload).into_owned()))
        }
        TransferFormat::Binary => TransportEvent::Message(TransportMessage::Binary(payload)),
    }
}

enum PollOutcome {
    Payload(Vec<u8>),
    /// 204: another client took over this connection id.
    Takeover,
    /// Request-level timeout; the caller retries in place.
    Timeout,
}

/// One GET poll. `Payload` on 200, `Takeover` on 204, `Timeout` if the poll
/// doesn't resolve within `poll_timeout` (retried by the caller, never
/// fatal), `Err` on 404/400 (fatal) or any other unexpected status.
async fn poll_once(
    client: &reqwest::Client,
    url: &str,
    headers: &HashMap<String, String>,
    accept: &str,
    poll_timeout: std::time::Duration,
) -> Result<PollOutcome, HubConnectionError> {
    let mut req = client.get(url).header("Accept", accept).timeout(poll_timeout);
    for (k, v) in headers {
        req = req.header(k, v);
    }
    let response = match req.send().await {
        Ok(response) => response,
        Err(e) if e.is_timeout() => return Ok(PollOutcome::Timeout),
        Err(e) => return Err(HubConnectionError::from(e)),
    };
    match response.status() {
        reqwest::StatusCode::OK => Ok(PollOutcome::Payload(response.bytes().await?.to_vec())),
        reqwest::StatusCode::NO_CONTENT => Ok(PollOutcome::Takeover),
        reqwest::StatusCode::NOT_FOUND | reqwest::StatusCode::BAD_REQUEST => {
            Err(HubConnectionError::SocketClosed(format!(
                "long-polling GET returned fatal status {}",
                response.status()
            )))
        }
        other => Err(HubConnectionError::Io(format!(
            "long-polling GET returned unexpected status {other}"
        ))),
    }
}
