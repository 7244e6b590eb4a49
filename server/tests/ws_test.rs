//! Integration tests for the WebSocket handshake and notification fan-out.

use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::Message;

type WsStream = tokio_tungstenite::WebSocketStream<
    tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
>;
type WsWrite = futures_util::stream::SplitSink<WsStream, Message>;
type WsRead = futures_util::stream::SplitStream<WsStream>;

/// Helper: start the server on a random port and return (base_url, addr).
async fn start_test_server() -> (String, SocketAddr) {
    let tmp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let data_dir = tmp_dir.path().to_str().unwrap().to_string();

    let db = taskstream_server::db::init_db(&data_dir).expect("Failed to init DB");
    let jwt_secret = taskstream_server::auth::jwt::load_or_generate_jwt_secret(&data_dir)
        .expect("Failed to generate JWT secret");

    let state = taskstream_server::state::AppState {
        db,
        jwt_secret,
        registry: Arc::new(taskstream_server::ws::registry::Registry::new()),
    };

    let app = taskstream_server::routes::build_router(state);
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();

    tokio::spawn(async move {
        axum::serve(
            listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await
        .unwrap();
        let _keep = tmp_dir;
    });

    (format!("http://{}", addr), addr)
}

/// Register a user and return their access token.
async fn register_user(base_url: &str, email: &str) -> String {
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/register", base_url))
        .json(&json!({ "email": email, "password": "sekrit1", "name": "Test User" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 200, "Registration failed for {}", email);
    let body: serde_json::Value = resp.json().await.unwrap();
    body["token"].as_str().unwrap().to_string()
}

/// Open a socket without authenticating. The caller drives the handshake.
async fn connect_raw(addr: &SocketAddr) -> (WsWrite, WsRead) {
    let (ws_stream, _) = tokio_tungstenite::connect_async(format!("ws://{}/ws", addr))
        .await
        .expect("Failed to connect to WebSocket");
    ws_stream.split()
}

/// Open a socket, perform the auth handshake, and consume the ack.
async fn connect_stream(addr: &SocketAddr, token: &str) -> (WsWrite, WsRead) {
    let (mut write, mut read) = connect_raw(addr).await;

    write
        .send(Message::Text(
            json!({ "type": "auth", "token": token }).to_string().into(),
        ))
        .await
        .expect("Failed to send auth frame");

    let ack = tokio::time::timeout(Duration::from_secs(2), read.next())
        .await
        .expect("Timed out waiting for auth ack")
        .expect("Stream ended before ack")
        .expect("Read error before ack");

    match ack {
        Message::Text(text) => {
            let v: serde_json::Value = serde_json::from_str(&text).unwrap();
            assert_eq!(v["type"], "auth_success");
        }
        other => panic!("Expected auth ack, got: {:?}", other),
    }

    (write, read)
}

/// Read frames until the next JSON notification, skipping pings/pongs.
async fn next_event(read: &mut WsRead) -> serde_json::Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Timed out waiting for event")
            .expect("Stream ended while waiting for event")
            .expect("Read error while waiting for event");

        match msg {
            Message::Text(text) => return serde_json::from_str(&text).unwrap(),
            Message::Ping(_) | Message::Pong(_) => continue,
            other => panic!("Expected text event, got: {:?}", other),
        }
    }
}

/// Assert that no notification arrives within the window.
async fn expect_silence(read: &mut WsRead, window: Duration) {
    let result = tokio::time::timeout(window, read.next()).await;
    if let Ok(Some(Ok(msg))) = result {
        assert!(
            matches!(msg, Message::Ping(_) | Message::Pong(_)),
            "Expected silence, got: {:?}",
            msg
        );
    }
}

/// Assert the server closes the connection with a policy-violation frame.
async fn expect_policy_close(read: &mut WsRead) {
    loop {
        match tokio::time::timeout(Duration::from_secs(2), read.next())
            .await
            .expect("Timed out waiting for close")
        {
            Some(Ok(Message::Close(Some(frame)))) => {
                assert_eq!(
                    frame.code,
                    CloseCode::Policy,
                    "Expected close code 1008, got {:?}",
                    frame.code
                );
                return;
            }
            Some(Ok(Message::Close(None))) | None => return,
            Some(Ok(_)) => continue,
            Some(Err(_)) => return, // connection torn down — acceptable
        }
    }
}

#[tokio::test]
async fn test_handshake_with_valid_token() {
    let (base_url, addr) = start_test_server().await;
    let token = register_user(&base_url, "ws1@example.com").await;

    let (mut _write, mut read) = connect_stream(&addr, &token).await;

    // Authenticated and idle: nothing further arrives.
    expect_silence(&mut read, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_handshake_rejects_wrong_message_type() {
    let (_base_url, addr) = start_test_server().await;
    let (mut write, mut read) = connect_raw(&addr).await;

    write
        .send(Message::Text(
            json!({ "type": "hello", "token": "whatever" }).to_string().into(),
        ))
        .await
        .unwrap();

    expect_policy_close(&mut read).await;
}

#[tokio::test]
async fn test_handshake_rejects_malformed_payload() {
    let (_base_url, addr) = start_test_server().await;
    let (mut write, mut read) = connect_raw(&addr).await;

    write
        .send(Message::Text("this is not json".into()))
        .await
        .unwrap();

    expect_policy_close(&mut read).await;
}

#[tokio::test]
async fn test_handshake_rejects_invalid_token() {
    let (_base_url, addr) = start_test_server().await;
    let (mut write, mut read) = connect_raw(&addr).await;

    write
        .send(Message::Text(
            json!({ "type": "auth", "token": "not-a-jwt" }).to_string().into(),
        ))
        .await
        .unwrap();

    expect_policy_close(&mut read).await;
}

#[tokio::test]
async fn test_fan_out_reaches_every_owner_stream_and_nobody_else() {
    let (base_url, addr) = start_test_server().await;
    let alice = register_user(&base_url, "alice-ws@example.com").await;
    let bob = register_user(&base_url, "bob-ws@example.com").await;

    // Alice has two devices connected, Bob one.
    let (_aw1, mut alice_read1) = connect_stream(&addr, &alice).await;
    let (_aw2, mut alice_read2) = connect_stream(&addr, &alice).await;
    let (_bw, mut bob_read) = connect_stream(&addr, &bob).await;

    // Alice creates a task over the request path.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/tasks", base_url))
        .bearer_auth(&alice)
        .json(&json!({ "title": "Shared across devices" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);
    let task: serde_json::Value = resp.json().await.unwrap();

    // Both of Alice's streams receive the notification.
    for read in [&mut alice_read1, &mut alice_read2] {
        let event = next_event(read).await;
        assert_eq!(event["type"], "created");
        assert_eq!(event["data"]["title"], "Shared across devices");
        assert_eq!(event["data"]["id"], task["id"]);
    }

    // Bob's stream stays quiet.
    expect_silence(&mut bob_read, Duration::from_millis(300)).await;
}

#[tokio::test]
async fn test_event_sequence_over_one_stream() {
    let (base_url, addr) = start_test_server().await;
    let token = register_user(&base_url, "sequence@example.com").await;
    let (_write, mut read) = connect_stream(&addr, &token).await;
    let client = reqwest::Client::new();

    // create → update → toggle → delete
    let resp = client
        .post(format!("{}/api/tasks", base_url))
        .bearer_auth(&token)
        .json(&json!({ "title": "Lifecycle" }))
        .send()
        .await
        .unwrap();
    let task: serde_json::Value = resp.json().await.unwrap();
    let task_id = task["id"].as_i64().unwrap();

    client
        .put(format!("{}/api/tasks/{}", base_url, task_id))
        .bearer_auth(&token)
        .json(&json!({ "title": "Lifecycle, renamed" }))
        .send()
        .await
        .unwrap();
    client
        .patch(format!("{}/api/tasks/{}/toggle", base_url, task_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();
    client
        .delete(format!("{}/api/tasks/{}", base_url, task_id))
        .bearer_auth(&token)
        .send()
        .await
        .unwrap();

    // Per-stream delivery preserves enqueue order.
    let event = next_event(&mut read).await;
    assert_eq!(event["type"], "created");
    assert_eq!(event["data"]["title"], "Lifecycle");

    let event = next_event(&mut read).await;
    assert_eq!(event["type"], "updated");
    assert_eq!(event["data"]["title"], "Lifecycle, renamed");

    let event = next_event(&mut read).await;
    assert_eq!(event["type"], "toggled");
    assert_eq!(event["data"]["is_completed"], true);

    let event = next_event(&mut read).await;
    assert_eq!(event["type"], "deleted");
    assert_eq!(event["data"]["id"].as_i64().unwrap(), task_id);
}

#[tokio::test]
async fn test_disconnect_cleans_up_and_later_mutations_still_succeed() {
    let (base_url, addr) = start_test_server().await;
    let token = register_user(&base_url, "cleanup@example.com").await;

    // Connect and then immediately close.
    {
        let (mut write, _read) = connect_stream(&addr, &token).await;
        write.send(Message::Close(None)).await.unwrap();
    }

    // Give the server a moment to clean up.
    tokio::time::sleep(Duration::from_millis(100)).await;

    // Mutating with the stream gone is fine.
    let client = reqwest::Client::new();
    let resp = client
        .post(format!("{}/api/tasks", base_url))
        .bearer_auth(&token)
        .json(&json!({ "title": "After disconnect" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    // A fresh stream receives subsequent notifications.
    let (_write2, mut read2) = connect_stream(&addr, &token).await;
    let resp = client
        .post(format!("{}/api/tasks", base_url))
        .bearer_auth(&token)
        .json(&json!({ "title": "After reconnect" }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), 201);

    let event = next_event(&mut read2).await;
    assert_eq!(event["type"], "created");
    assert_eq!(event["data"]["title"], "After reconnect");
}
