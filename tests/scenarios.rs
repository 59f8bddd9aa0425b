//! End-to-end scenario tests against the mock hub server in
//! `signalr-test-support`. Each test drives one scenario end to end through
//! the public `HubConnection` surface rather than exercising any single
//! module in isolation.

use serde_json::json;
use signalr_client::{HubConnection, HubConnectionOptions, reconnect::ReconnectPolicyKind};
use signalr_test_support::{MockHubServer, Scenario};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

fn options() -> HubConnectionOptions {
    HubConnectionOptions::default()
}

/// S1: a plain `send` reaches the server and the server's own Invocation
/// back to the client reaches a registered `on` handler.
#[tokio::test]
async fn s1_send_and_receive_invocation() {
    let server = MockHubServer::start(Scenario::Echo).await.unwrap();
    let connection = HubConnection::new(server.http_url(), options(), Default::default()).unwrap();

    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let received_clone = received.clone();
    connection
        .on("ReceiveMessage", move |args| {
            received_clone.lock().unwrap().push(args);
        })
        .await;

    connection.start().await.unwrap();
    connection.send("SendMessage", vec![json!("alice"), json!("hi")]).await.unwrap();

    for _ in 0..100 {
        if !received.lock().unwrap().is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let seen = received.lock().unwrap().clone();
    assert_eq!(seen, vec![vec![json!("alice"), json!("hi")]]);

    connection.stop().await.unwrap();
}

/// S2: `invoke` resolves its Completion regardless of success or error, per
/// the registered-`Invocation`-handler routing rule.
#[tokio::test]
async fn s2_invoke_resolves_completion() {
    let server = MockHubServer::start(Scenario::CompletionEcho).await.unwrap();
    let connection = HubConnection::new(server.http_url(), options(), Default::default()).unwrap();
    connection.start().await.unwrap();

    let completion = connection.invoke("Echo", vec![json!(1), json!(2)]).await.unwrap();
    assert_eq!(completion.result, Some(json!([1, 2])));
    assert!(completion.error.is_none());

    connection.stop().await.unwrap();
}

/// S3: `stream` delivers every StreamItem in order, then fires `complete`.
#[tokio::test]
async fn s3_stream_delivers_items_then_completes() {
    let server = MockHubServer::start(Scenario::CounterStream).await.unwrap();
    let connection = HubConnection::new(server.http_url(), options(), Default::default()).unwrap();
    connection.start().await.unwrap();

    let items = Arc::new(std::sync::Mutex::new(Vec::new()));
    let items_clone = items.clone();
    let (done_tx, done_rx) = tokio::sync::oneshot::channel();
    let done_tx = std::sync::Mutex::new(Some(done_tx));

    connection
        .stream(
            "Counter",
            vec![json!(3)],
            move |item| items_clone.lock().unwrap().push(item),
            move || {
                if let Some(tx) = done_tx.lock().unwrap().take() {
                    let _ = tx.send(());
                }
            },
            |_err| panic!("stream should not error"),
        )
        .await
        .unwrap();

    tokio::time::timeout(Duration::from_secs(2), done_rx).await.unwrap().unwrap();
    assert_eq!(*items.lock().unwrap(), vec![json!(0), json!(1), json!(2)]);

    connection.stop().await.unwrap();
}

/// S4: a client-to-server upload via `Subject` delivers every StreamItem
/// then a void Completion, observed server-side.
#[tokio::test]
async fn s4_upload_stream_delivers_items_then_completion() {
    let received = Arc::new(std::sync::Mutex::new(Vec::new()));
    let server = MockHubServer::start(Scenario::UploadCapture { received: received.clone() }).await.unwrap();
    let connection = HubConnection::new(server.http_url(), options(), Default::default()).unwrap();
    connection.start().await.unwrap();

    let subject = signalr_client::Subject::new();
    connection.send_upload("Upload", subject.clone()).await.unwrap();
    subject.next(json!("a")).await.unwrap();
    subject.next(json!("b")).await.unwrap();
    subject.complete().await.unwrap();

    for _ in 0..50 {
        if received.lock().unwrap().len() >= 3 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let seen_len = received.lock().unwrap().len();
    assert_eq!(seen_len, 3);

    connection.stop().await.unwrap();
}

/// S5: a dropped connection with a reconnect policy configured comes back
/// and fires `on_reconnect`.
#[tokio::test]
async fn s5_reconnects_after_drop_and_fires_on_reconnect() {
    let attempts = Arc::new(AtomicU32::new(0));
    let server = MockHubServer::start(Scenario::DisconnectOnce { attempts }).await.unwrap();

    let reconnected = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let reconnected_clone = reconnected.clone();

    let mut opts = options();
    opts.reconnect = Some(ReconnectPolicyKind::Raw {
        sleep_time: Duration::from_millis(20),
        max_attempts: Some(10),
    });

    let connection = HubConnection::new(
        server.http_url(),
        opts,
        signalr_client::Callbacks {
            on_reconnect: Some(Arc::new(move || {
                reconnected_clone.store(true, Ordering::SeqCst);
            })),
            ..Default::default()
        },
    )
    .unwrap();

    connection.start().await.unwrap();

    for _ in 0..100 {
        if reconnected.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(reconnected.load(Ordering::SeqCst), "on_reconnect never fired");

    connection.stop().await.unwrap();
}

/// S6: a handshake error surfaces from `start` itself rather than silently
/// leaving the connection half-open.
#[tokio::test]
async fn s6_handshake_error_surfaces_from_start() {
    let server = MockHubServer::start(Scenario::HandshakeError("nope".to_owned())).await.unwrap();
    let connection = HubConnection::new(server.http_url(), options(), Default::default()).unwrap();

    let err = connection.start().await.unwrap_err();
    assert!(matches!(err, signalr_client::HubConnectionError::Handshake(msg) if msg == "nope"));
    assert_eq!(connection.state().await, signalr_client::adapter::ConnectionState::Disconnected);
}

/// S7: a `Close` message coalesced into the same frame as the handshake
/// response must still end the connection and fire `on_close`, rather than
/// being silently dropped while the client waits on a socket the server has
/// already closed.
#[tokio::test]
async fn s7_coalesced_close_after_handshake_ends_connection() {
    let server = MockHubServer::start(Scenario::CoalescedClose).await.unwrap();
    let closed = Arc::new(std::sync::atomic::AtomicBool::new(false));
    let closed_clone = closed.clone();
    let callbacks = signalr_client::Callbacks {
        on_close: Some(Arc::new(move |_| {
            closed_clone.store(true, Ordering::SeqCst);
        })),
        ..Default::default()
    };
    let connection = HubConnection::new(server.http_url(), options(), callbacks).unwrap();

    connection.start().await.unwrap();

    for _ in 0..100 {
        if closed.load(Ordering::SeqCst) {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(closed.load(Ordering::SeqCst), "on_close never fired for a coalesced Close message");
    assert_eq!(connection.state().await, signalr_client::adapter::ConnectionState::Disconnected);
}
