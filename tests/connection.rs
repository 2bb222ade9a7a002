use std::time::Duration;

use feishu_relay::{
    connection::{ConnectionManager, ConnectionOptions, ConnectionState},
    events::EventEmitter,
};
use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::{net::TcpListener, sync::mpsc, time::timeout};
use tokio_tungstenite::{accept_async, tungstenite::Message};

async fn next_text<S>(ws: &mut tokio_tungstenite::WebSocketStream<S>) -> Option<String>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    while let Some(frame) = ws.next().await {
        match frame.ok()? {
            Message::Text(text) => return Some(text),
            Message::Close(_) => return None,
            _ => continue,
        }
    }
    None
}

async fn wait_connected(manager: &ConnectionManager) {
    for _ in 0..200 {
        if manager.is_connected() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("connection manager never connected");
}

#[tokio::test]
async fn hello_inbound_and_outbound_frames() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(8);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let hello = next_text(&mut ws).await.unwrap();
        seen_tx.send(hello).await.unwrap();

        ws.send(Message::Text("not json".into())).await.unwrap();
        ws.send(Message::Text(
            json!({"method": "message", "action": "respond", "taskid": "t1", "detail": {}})
                .to_string(),
        ))
        .await
        .unwrap();

        while let Some(text) = next_text(&mut ws).await {
            if seen_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let (inbound_tx, mut inbound_rx) = mpsc::channel(8);
    let options = ConnectionOptions::new(format!("ws://{addr}/socket"))
        .with_identity("hi, i am test-relay");
    let manager = ConnectionManager::new(options, inbound_tx, EventEmitter::disabled());
    manager.start();

    let hello: Value =
        serde_json::from_str(&timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap().unwrap())
            .unwrap();
    assert_eq!(
        hello,
        json!({"method": "system", "action": "hello", "detail": "hi, i am test-relay"})
    );

    // The non-JSON frame is dropped; the first delivered value is the respond envelope.
    let inbound = timeout(Duration::from_secs(5), inbound_rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(inbound["action"], "respond");
    assert_eq!(inbound["taskid"], "t1");

    wait_connected(&manager).await;
    assert!(manager.send_text("first").await);
    assert!(manager.send_json(&json!({"n": 2})).await);
    let first = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap();
    let second = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap();
    assert_eq!(first.as_deref(), Some("first"));
    assert_eq!(second.as_deref(), Some(r#"{"n":2}"#));

    manager.stop().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.send_text("after stop").await);
    server.abort();
}

#[tokio::test]
async fn reconnects_after_server_drop() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hello_tx, mut hello_rx) = mpsc::channel::<usize>(4);

    let server = tokio::spawn(async move {
        for attempt in 1..=2usize {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if next_text(&mut ws).await.is_some() {
                hello_tx.send(attempt).await.unwrap();
            }
            if attempt == 1 {
                drop(ws);
            } else {
                while next_text(&mut ws).await.is_some() {}
            }
        }
    });

    let (inbound_tx, _inbound_rx) = mpsc::channel(8);
    let manager = ConnectionManager::new(
        ConnectionOptions::new(format!("ws://{addr}/socket")),
        inbound_tx,
        EventEmitter::disabled(),
    );
    manager.start();

    let first = timeout(Duration::from_secs(5), hello_rx.recv()).await.unwrap();
    assert_eq!(first, Some(1));
    // First backoff step is one second.
    let second = timeout(Duration::from_secs(5), hello_rx.recv()).await.unwrap();
    assert_eq!(second, Some(2));

    wait_connected(&manager).await;
    manager.stop().await;
    server.abort();
}

#[tokio::test]
async fn no_reconnect_when_disabled() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        let _ = next_text(&mut ws).await;
        drop(ws);
    });

    let (inbound_tx, _inbound_rx) = mpsc::channel(8);
    let manager = ConnectionManager::new(
        ConnectionOptions::new(format!("ws://{addr}/socket")).with_reconnect(false),
        inbound_tx,
        EventEmitter::disabled(),
    );
    manager.start();

    for _ in 0..300 {
        if !manager.is_running() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert!(!manager.is_running());
    assert!(!manager.send_text("hello").await);
    manager.stop().await;
    server.abort();
}

#[tokio::test]
async fn zero_heartbeat_keeps_the_link_up() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (seen_tx, mut seen_rx) = mpsc::channel::<String>(8);

    let server = tokio::spawn(async move {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();
        while let Some(text) = next_text(&mut ws).await {
            if seen_tx.send(text).await.is_err() {
                break;
            }
        }
    });

    let (inbound_tx, _inbound_rx) = mpsc::channel(8);
    let options = ConnectionOptions::new(format!("ws://{addr}/socket"))
        .with_heartbeat(Duration::ZERO, Duration::ZERO);
    let manager = ConnectionManager::new(options, inbound_tx, EventEmitter::disabled());
    manager.start();

    let hello = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap();
    assert!(hello.is_some());
    wait_connected(&manager).await;
    tokio::time::sleep(Duration::from_millis(300)).await;

    assert!(manager.is_running());
    assert!(manager.is_connected());
    assert!(manager.send_text("still here").await);
    let echoed = timeout(Duration::from_secs(5), seen_rx.recv()).await.unwrap();
    assert_eq!(echoed.as_deref(), Some("still here"));

    manager.stop().await;
    server.abort();
}

/// The server reads the hello and then stops reading, so pings are never
/// answered and the client must give up on the socket and dial again.
#[tokio::test]
async fn missing_pong_forces_reconnect() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (hello_tx, mut hello_rx) = mpsc::channel::<usize>(4);

    let server = tokio::spawn(async move {
        let mut held = Vec::new();
        for attempt in 1..=2usize {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();
            if next_text(&mut ws).await.is_some() {
                hello_tx.send(attempt).await.unwrap();
            }
            held.push(ws);
        }
        std::future::pending::<()>().await;
    });

    let (inbound_tx, _inbound_rx) = mpsc::channel(8);
    let options = ConnectionOptions::new(format!("ws://{addr}/socket"))
        .with_heartbeat(Duration::from_millis(200), Duration::from_millis(200));
    let manager = ConnectionManager::new(options, inbound_tx, EventEmitter::disabled());
    manager.start();

    let first = timeout(Duration::from_secs(5), hello_rx.recv()).await.unwrap();
    assert_eq!(first, Some(1));
    // Pong deadline at ~400ms, then the one second backoff step.
    let second = timeout(Duration::from_secs(5), hello_rx.recv()).await.unwrap();
    assert_eq!(second, Some(2));

    manager.stop().await;
    server.abort();
}
