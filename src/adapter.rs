//! Transport adapter (C3): the uniform `{disconnected, connecting,
//! connected, reconnecting}` state machine, keep-alive accounting, and
//! message/ping bridging on top of any [`AnyTransport`]. Reconnection
//! orchestration itself (re-negotiating, rebuilding the transport, deferring
//! a retry) lives in the hub engine, which is the layer that already knows
//! about negotiation and the reconnect policy; this module only supplies
//! the primitives the engine's reconnect loop drives.

use crate::error::HubConnectionError;
use crate::transport::{AnyTransport, TransportEvent, TransportKind, TransportMessage};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Which user-visible callback a transition fires, per the table in §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiredCallback {
    OnOpen,
    OnClose,
    OnReconnect,
}

/// The connection state, shared between the task driving the receive loop
/// and any caller awaiting a particular state (`wait_until_state`).
#[derive(Clone)]
pub struct SharedState(Arc<RwLock<ConnectionState>>);

impl SharedState {
    pub fn new() -> Self {
        Self(Arc::new(RwLock::new(ConnectionState::Disconnected)))
    }

    pub async fn get(&self) -> ConnectionState {
        *self.0.read().await
    }

    /// Apply a transition, firing at most one callback. Same-state
    /// transitions are no-ops, as are any pair not named in the table.
    pub async fn set(&self, new: ConnectionState) -> Option<FiredCallback> {
        let mut guard = self.0.write().await;
        let old = *guard;
        if old == new {
            return None;
        }
        *guard = new;
        match (old, new) {
            (ConnectionState::Connecting, ConnectionState::Connected) => Some(FiredCallback::OnOpen),
            (ConnectionState::Connected, ConnectionState::Disconnected) => Some(FiredCallback::OnClose),
            (ConnectionState::Reconnecting, ConnectionState::Disconnected) => Some(FiredCallback::OnClose),
            (ConnectionState::Reconnecting, ConnectionState::Connected) => Some(FiredCallback::OnReconnect),
            _ => None,
        }
    }
}

impl Default for SharedState {
    fn default() -> Self {
        Self::new()
    }
}

/// Polls `shared` at 100ms intervals until it reaches `target` or `timeout`
/// elapses (`None` ⇒ wait forever).
pub async fn wait_until_state(
    shared: &SharedState,
    target: ConnectionState,
    timeout: Option<Duration>,
) -> Result<(), HubConnectionError> {
    let deadline = timeout.map(|d| Instant::now() + d);
    loop {
        if shared.get().await == target {
            return Ok(());
        }
        if let Some(dl) = deadline
            && Instant::now() >= dl
        {
            return Err(HubConnectionError::Timeout);
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
}

/// Tracks time since the last received message (a sent Ping counts too) to
/// decide when a keep-alive Ping is due.
struct ConnectionChecker {
    last_message: Instant,
    keep_alive_interval: Duration,
}

impl ConnectionChecker {
    fn new(keep_alive_interval: Duration) -> Self {
        Self {
            last_message: Instant::now(),
            keep_alive_interval,
        }
    }

    fn note_message(&mut self) {
        self.last_message = Instant::now();
    }

    fn needs_ping(&self) -> bool {
        self.last_message.elapsed() >= self.keep_alive_interval
    }
}

/// What one `poll` call surfaced: either a transport event or a due
/// keep-alive ping. The caller (engine) is responsible for actually
/// encoding and sending a Ping; the adapter only knows it's time for one.
pub enum AdapterOutcome {
    Event(TransportEvent),
    NeedsPing,
}

pub struct TransportAdapter {
    transport: AnyTransport,
    checker: ConnectionChecker,
}

impl TransportAdapter {
    pub fn new(transport: AnyTransport, keep_alive_interval: Duration) -> Self {
        Self {
            transport,
            checker: ConnectionChecker::new(keep_alive_interval),
        }
    }

    pub fn kind(&self) -> TransportKind {
        self.transport.kind()
    }

    pub async fn send(&mut self, msg: TransportMessage) -> Result<(), HubConnectionError> {
        self.transport.send(msg).await
    }

    /// Records that a Ping was just sent, so it counts toward keep-alive
    /// accounting the same way a received message does.
    pub fn note_sent_ping(&mut self) {
        self.checker.note_message();
    }

    /// Drives the `tokio::select!` race between the keep-alive tick and the
    /// transport's receive loop, matching the `biased` select pattern used
    /// elsewhere in the workspace's session loops.
    pub async fn poll(&mut self, ticker: &mut tokio::time::Interval) -> AdapterOutcome {
        loop {
            tokio::select! {
                biased;
                _ = ticker.tick() => {
                    if self.checker.needs_ping() {
                        return AdapterOutcome::NeedsPing;
                    }
                }
                event = self.transport.recv_event() => {
                    self.checker.note_message();
                    return AdapterOutcome::Event(event);
                }
            }
        }
    }

    pub fn is_connection_closed(&self) -> bool {
        self.transport.is_connection_closed()
    }

    pub async fn close(&mut self) {
        self.transport.close().await;
    }
}
