//! End-to-end gateway sessions against an in-process WebSocket server.

use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use hello_gateway::config::{BotConfig, ReconnectConfig};
use hello_gateway::types::Status;
use hello_gateway::{BotError, BotEvent, Client, ConnectionState};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::WebSocketStream;

type ServerWs = WebSocketStream<TcpStream>;

const TIMEOUT: Duration = Duration::from_secs(10);

fn config(url: String) -> BotConfig {
    BotConfig {
        token: Some("secret".into()),
        gateway_url: url,
        reconnect: ReconnectConfig {
            max_attempts: 0,
            delay_ms: 10,
            max_delay_ms: 10,
        },
        ready_timeout_ms: 5_000,
        ..BotConfig::default()
    }
}

async fn listen() -> (TcpListener, String) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("ws://{}", listener.local_addr().unwrap());
    (listener, url)
}

async fn accept(listener: &TcpListener) -> ServerWs {
    let (stream, _) = listener.accept().await.unwrap();
    tokio_tungstenite::accept_async(stream).await.unwrap()
}

async fn send(ws: &mut ServerWs, payload: Value) {
    ws.send(Message::Text(payload.to_string())).await.unwrap();
}

/// Next client payload with opcode `op`, skipping heartbeats and the like.
async fn next_op(ws: &mut ServerWs, op: u64) -> Value {
    while let Some(msg) = ws.next().await {
        if let Message::Text(text) = msg.unwrap() {
            let payload: Value = serde_json::from_str(&text).unwrap();
            if payload["op"] == op {
                return payload;
            }
        }
    }
    panic!("connection closed before op {op}");
}

async fn hello_and_identify(ws: &mut ServerWs) -> Value {
    send(ws, json!({"op": 10, "d": {"heartbeat_interval": 45_000}})).await;
    next_op(ws, 2).await
}

/// Reply to HELLO-then-IDENTIFY with READY for session `abc` at sequence 1.
async fn establish(ws: &mut ServerWs, heartbeat_interval: u64) {
    send(ws, json!({"op": 10, "d": {"heartbeat_interval": heartbeat_interval}})).await;
    next_op(ws, 2).await;
    send(
        ws,
        json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "abc"}}),
    )
    .await;
}

/// Expect RESUME on a fresh socket and confirm it; returns the RESUME payload.
async fn resume(ws: &mut ServerWs) -> Value {
    send(ws, json!({"op": 10, "d": {"heartbeat_interval": 45_000}})).await;
    let resume = next_op(ws, 6).await;
    send(ws, json!({"op": 0, "s": 2, "t": "RESUMED", "d": null})).await;
    resume
}

/// Keep reading until the client hangs up; returns the heartbeats seen.
fn drain(mut ws: ServerWs) -> tokio::task::JoinHandle<Vec<Value>> {
    tokio::spawn(async move {
        let mut heartbeats = Vec::new();
        while let Some(Ok(msg)) = ws.next().await {
            if let Message::Text(text) = msg {
                let payload: Value = serde_json::from_str(&text).unwrap();
                if payload["op"] == 1 {
                    heartbeats.push(payload);
                }
            }
        }
        heartbeats
    })
}

fn retrying(url: String) -> BotConfig {
    let mut cfg = config(url);
    cfg.reconnect.max_attempts = 3;
    cfg
}

async fn wait_for_reconnect(events: &async_channel::Receiver<BotEvent>) -> u32 {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let BotEvent::Reconnect { attempts } = events.recv().await.unwrap() {
                return attempts;
            }
        }
    })
    .await
    .expect("no reconnect event")
}

async fn wait_for_disconnect(events: &async_channel::Receiver<BotEvent>) -> String {
    tokio::time::timeout(TIMEOUT, async {
        loop {
            if let BotEvent::Disconnect { reason } = events.recv().await.unwrap() {
                return reason;
            }
        }
    })
    .await
    .expect("no disconnect event")
}

// -- happy path --

#[tokio::test]
async fn identify_ready_send_and_disconnect() {
    let (listener, url) = listen().await;
    let (status_tx, status_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        let identify = hello_and_identify(&mut ws).await;
        assert_eq!(identify["d"]["token"], "secret");

        send(
            &mut ws,
            json!({"op": 0, "s": 1, "t": "READY", "d": {"session_id": "abc"}}),
        )
        .await;

        let status = next_op(&mut ws, 3).await;
        status_tx.send(status).ok();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let client = Client::new(config(url)).unwrap();
    let events = client.events();

    client.connect().await.unwrap();
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.gateway().session().session_id.as_deref(), Some("abc"));
    assert_eq!(client.gateway().session().sequence, Some(1));

    let ready = tokio::time::timeout(TIMEOUT, events.recv()).await.unwrap().unwrap();
    assert!(matches!(ready, BotEvent::Ready(ref r) if r.session_id == "abc"));

    client.presence().set_status(Status::Idle).await.unwrap();
    let status = tokio::time::timeout(TIMEOUT, status_rx).await.unwrap().unwrap();
    assert_eq!(status["d"]["status"], "idle");

    client.disconnect();
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert!(matches!(
        client.presence().set_status(Status::Online).await,
        Err(BotError::NotConnected)
    ));
    assert_eq!(wait_for_disconnect(&events).await, "client disconnect");

    server.abort();
}

// -- failures --

#[tokio::test]
async fn unreachable_gateway_gives_up() {
    let (listener, url) = listen().await;
    drop(listener);

    let client = Client::new(config(url)).unwrap();
    let events = client.events();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BotError::Disconnected), "{err:?}");
    assert_eq!(client.state(), ConnectionState::Disconnected);
    assert_eq!(wait_for_disconnect(&events).await, "reconnect attempts exhausted");
}

#[tokio::test]
async fn authentication_close_is_fatal() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut ws = accept(&listener).await;
        hello_and_identify(&mut ws).await;
        ws.close(Some(CloseFrame {
            code: CloseCode::from(4004),
            reason: "bad token".into(),
        }))
        .await
        .ok();
        while let Some(Ok(_)) = ws.next().await {}
    });

    let mut cfg = config(url);
    cfg.reconnect.max_attempts = 5;
    let client = Client::new(cfg).unwrap();
    let events = client.events();

    let err = client.connect().await.unwrap_err();
    assert!(matches!(err, BotError::Disconnected), "{err:?}");
    assert!(wait_for_disconnect(&events).await.contains("4004"));

    server.abort();
}

// -- reconnects --

#[tokio::test]
async fn dropped_socket_resumes_after_backoff() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        establish(&mut first, 45_000).await;
        first.close(None).await.ok();
        drain(first);

        let mut second = accept(&listener).await;
        let payload = resume(&mut second).await;
        (payload, second)
    });

    let client = Client::new(retrying(url)).unwrap();
    let events = client.events();
    client.connect().await.unwrap();

    // One backoff attempt was spent and is reported, then forgotten.
    assert_eq!(wait_for_reconnect(&events).await, 1);
    assert_eq!(client.state(), ConnectionState::Connected);
    let session = client.gateway().session();
    assert_eq!(session.reconnect_attempts, 0);
    assert_eq!(session.sequence, Some(2));

    let (payload, _second) = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(payload["d"]["token"], "secret");
    assert_eq!(payload["d"]["session_id"], "abc");
    assert_eq!(payload["d"]["seq"], 1);

    client.disconnect();
}

#[tokio::test]
async fn server_reconnect_request_keeps_the_session() {
    let (listener, url) = listen().await;

    let server = tokio::spawn(async move {
        let mut first = accept(&listener).await;
        establish(&mut first, 45_000).await;
        send(&mut first, json!({"op": 7, "d": null})).await;
        drain(first);

        let mut second = accept(&listener).await;
        let payload = resume(&mut second).await;
        (payload, second)
    });

    // No backoff budget at all: op 7 must not consume one.
    let client = Client::new(config(url)).unwrap();
    let events = client.events();
    client.connect().await.unwrap();

    assert_eq!(wait_for_reconnect(&events).await, 0);
    assert_eq!(client.state(), ConnectionState::Connected);
    assert_eq!(client.gateway().session().session_id.as_deref(), Some("abc"));

    let (payload, _second) = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();
    assert_eq!(payload["d"]["session_id"], "abc");

    client.disconnect();
}

#[tokio::test]
async fn missed_heartbeat_ack_reconnects_once() {
    let (listener, url) = listen().await;
    let (listener_tx, listener_rx) = oneshot::channel();

    let server = tokio::spawn(async move {
        // Heartbeats on the first socket are never acknowledged.
        let mut first = accept(&listener).await;
        establish(&mut first, 200).await;
        let heartbeats = drain(first);

        let mut second = accept(&listener).await;
        resume(&mut second).await;
        listener_tx.send(listener).ok();
        (heartbeats.await.unwrap(), second)
    });

    let client = Client::new(config(url)).unwrap();
    let events = client.events();
    client.connect().await.unwrap();

    assert_eq!(wait_for_reconnect(&events).await, 0);
    let (heartbeats, _second) = tokio::time::timeout(TIMEOUT, server).await.unwrap().unwrap();

    // One unanswered heartbeat is enough to declare the socket dead.
    assert_eq!(heartbeats.len(), 1, "{heartbeats:?}");

    // The resumed socket stays put: no further connection attempts.
    let listener = listener_rx.await.unwrap();
    assert!(
        tokio::time::timeout(Duration::from_millis(500), listener.accept())
            .await
            .is_err()
    );
    assert_eq!(client.state(), ConnectionState::Connected);

    client.disconnect();
}
