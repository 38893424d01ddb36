//! Integration tests for the relay HTTP/WebSocket server

use futures_util::{SinkExt, StreamExt};
use pulse_relay::access::Capability;
use pulse_relay::config::{Config, UserSeed};
use pulse_relay::server::{self, AppState};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::time::Duration;
use tokio_tungstenite::tungstenite::Message;

type WsStream =
    tokio_tungstenite::WebSocketStream<tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>>;

fn seed(user_id: &str, secret: &str, admin: bool, sensors: &[&str], capability: Capability) -> UserSeed {
    UserSeed {
        user_id: user_id.to_string(),
        secret: secret.to_string(),
        admin,
        sensors: sensors.iter().map(|s| s.to_string()).collect(),
        capability,
    }
}

fn test_config() -> Config {
    Config {
        bind: "127.0.0.1".to_string(),
        port: 0,
        max_subscribers: 8,
        update_capacity: 64,
        session_ttl_secs: None,
        ingest_token: None,
        users: vec![
            seed("alice", "wonderland", false, &["hr-1"], Capability::Mutate),
            seed("bob", "builder", false, &["mot-1"], Capability::View),
            seed("root", "toor", true, &[], Capability::View),
        ],
    }
}

async fn start_server() -> (SocketAddr, tokio::sync::oneshot::Sender<()>) {
    let config = test_config();
    let state = AppState::new(&config);
    server::run(&config, state)
        .await
        .expect("failed to start server")
}

async fn login(client: &reqwest::Client, addr: SocketAddr, user: &str, secret: &str) -> String {
    let response = client
        .post(format!("http://{addr}/auth/login"))
        .json(&json!({"userId": user, "secret": secret}))
        .send()
        .await
        .expect("login request failed");
    assert!(response.status().is_success(), "login rejected for {user}");

    let body: Value = response.json().await.expect("login body not JSON");
    body["token"].as_str().expect("missing token").to_string()
}

async fn ingest(client: &reqwest::Client, addr: SocketAddr, batch: Value) -> Value {
    let response = client
        .post(format!("http://{addr}/ingest"))
        .json(&batch)
        .send()
        .await
        .expect("ingest request failed");
    assert!(response.status().is_success());
    response.json().await.expect("ingest body not JSON")
}

async fn connect_stream(addr: SocketAddr, token: &str) -> WsStream {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token={token}"))
        .await
        .expect("ws connect failed");
    ws
}

async fn next_json(ws: &mut WsStream) -> Value {
    loop {
        let message = tokio::time::timeout(Duration::from_secs(5), ws.next())
            .await
            .expect("timed out waiting for frame")
            .expect("stream ended")
            .expect("ws error");
        if let Message::Text(text) = message {
            return serde_json::from_str(&text).expect("frame not JSON");
        }
    }
}

/// Read frames until one satisfies `matches`.
async fn next_matching(ws: &mut WsStream, matches: impl Fn(&Value) -> bool) -> Value {
    loop {
        let frame = next_json(ws).await;
        if matches(&frame) {
            return frame;
        }
    }
}

#[tokio::test]
async fn test_health_endpoint() {
    let (addr, shutdown_tx) = start_server().await;

    let client = reqwest::Client::new();
    let response = client
        .get(format!("http://{addr}/health"))
        .send()
        .await
        .expect("failed to send request");
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("failed to parse JSON");
    assert_eq!(body["status"], "ok");
    assert!(body["version"].as_str().is_some());
    assert_eq!(body["subscribers"], 0);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_login_failure_is_generic() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    // Unknown user and wrong secret must be byte-identical responses.
    let mut bodies = Vec::new();
    for (user, secret) in [("mallory", "x"), ("alice", "x")] {
        let response = client
            .post(format!("http://{addr}/auth/login"))
            .json(&json!({"userId": user, "secret": secret}))
            .send()
            .await
            .expect("login request failed");
        assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);
        bodies.push(response.text().await.expect("no body"));
    }
    assert_eq!(bodies[0], bodies[1]);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_authorized_sensor_listing() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();
    let token = login(&client, addr, "alice", "wonderland").await;

    let response = client
        .get(format!("http://{addr}/sensors/authorized"))
        .bearer_auth(&token)
        .send()
        .await
        .expect("listing request failed");
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("listing body not JSON");
    assert_eq!(body["sensors"], json!(["hr-1"]));

    // No token: unauthenticated, not an empty list.
    let response = client
        .get(format!("http://{addr}/sensors/authorized"))
        .send()
        .await
        .expect("listing request failed");
    assert_eq!(response.status(), reqwest::StatusCode::UNAUTHORIZED);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_stream_snapshot_then_filtered_deltas() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    let report = ingest(
        &client,
        addr,
        json!({
            "heart_rate": {"sensorId": "hr-1", "value": 72, "timestamp": 100},
            "motion": {"sensorId": "mot-1", "value": 0.5, "timestamp": 100},
        }),
    )
    .await;
    assert_eq!(report["accepted"], 2);

    let alice_token = login(&client, addr, "alice", "wonderland").await;
    let bob_token = login(&client, addr, "bob", "builder").await;

    // First frame is the complete authorized snapshot, nothing more.
    let mut alice_ws = connect_stream(addr, &alice_token).await;
    let snapshot = next_json(&mut alice_ws).await;
    assert_eq!(snapshot["heart_rate"]["sensorId"], "hr-1");
    assert_eq!(snapshot["heart_rate"]["value"].as_f64(), Some(72.0));
    assert_eq!(snapshot["heart_rate"]["active"], true);
    assert!(snapshot.get("motion").is_none());

    let mut bob_ws = connect_stream(addr, &bob_token).await;
    let snapshot = next_json(&mut bob_ws).await;
    assert_eq!(snapshot["motion"]["sensorId"], "mot-1");
    assert!(snapshot.get("heart_rate").is_none());

    // A heart-rate update reaches alice but never bob.
    ingest(
        &client,
        addr,
        json!({"heart_rate": {"sensorId": "hr-1", "value": 84, "timestamp": 200}}),
    )
    .await;
    ingest(
        &client,
        addr,
        json!({"motion": {"sensorId": "mot-1", "value": 0.9, "timestamp": 201}}),
    )
    .await;

    let delta = next_json(&mut alice_ws).await;
    assert_eq!(delta["heart_rate"]["value"].as_f64(), Some(84.0));

    // Bob's next frame skips straight to the motion update.
    let delta = next_json(&mut bob_ws).await;
    assert!(delta.get("heart_rate").is_none());
    assert_eq!(delta["motion"]["value"].as_f64(), Some(0.9));

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_toggle_commands_over_stream() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();

    ingest(
        &client,
        addr,
        json!({"heart_rate": {"sensorId": "hr-1", "value": 72, "timestamp": 100}}),
    )
    .await;

    // Alice holds a Mutate grant: deactivate succeeds.
    let alice_token = login(&client, addr, "alice", "wonderland").await;
    let mut alice_ws = connect_stream(addr, &alice_token).await;
    next_json(&mut alice_ws).await; // snapshot

    alice_ws
        .send(Message::Text(
            json!({"sensorId": "hr-1", "action": "deactivate"}).to_string(),
        ))
        .await
        .expect("send failed");
    let reply = next_matching(&mut alice_ws, |v| v.get("ok").is_some()).await;
    assert_eq!(reply["ok"], true);
    assert_eq!(reply["sensorId"], "hr-1");

    // Bob has no grant on hr-1 at all: the activation is forbidden.
    let bob_token = login(&client, addr, "bob", "builder").await;
    let mut bob_ws = connect_stream(addr, &bob_token).await;
    next_json(&mut bob_ws).await; // snapshot

    bob_ws
        .send(Message::Text(
            json!({"sensorId": "hr-1", "action": "activate"}).to_string(),
        ))
        .await
        .expect("send failed");
    let reply = next_matching(&mut bob_ws, |v| v.get("ok").is_some()).await;
    assert_eq!(reply["ok"], false);
    assert_eq!(reply["error"], "forbidden");

    // The sensor stayed deactivated: a fresh session's snapshot shows it.
    let fresh_token = login(&client, addr, "alice", "wonderland").await;
    let mut fresh_ws = connect_stream(addr, &fresh_token).await;
    let snapshot = next_json(&mut fresh_ws).await;
    assert_eq!(snapshot["heart_rate"]["active"], false);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_admin_user_management() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();
    let root_token = login(&client, addr, "root", "toor").await;

    let response = client
        .post(format!("http://{addr}/admin/users"))
        .bearer_auth(&root_token)
        .json(&json!({
            "userId": "carol",
            "secret": "c4rol",
            "sensorIds": ["temp-1"],
            "capability": "mutate",
        }))
        .send()
        .await
        .expect("add-user request failed");
    assert!(response.status().is_success());

    let carol_token = login(&client, addr, "carol", "c4rol").await;
    let response = client
        .get(format!("http://{addr}/sensors/authorized"))
        .bearer_auth(&carol_token)
        .send()
        .await
        .expect("listing request failed");
    let body: Value = response.json().await.expect("listing body not JSON");
    assert_eq!(body["sensors"], json!(["temp-1"]));

    let response = client
        .post(format!("http://{addr}/admin/revoke"))
        .bearer_auth(&root_token)
        .json(&json!({"userId": "carol", "sensorIds": ["temp-1"]}))
        .send()
        .await
        .expect("revoke request failed");
    assert!(response.status().is_success());

    let response = client
        .get(format!("http://{addr}/sensors/authorized"))
        .bearer_auth(&carol_token)
        .send()
        .await
        .expect("listing request failed");
    let body: Value = response.json().await.expect("listing body not JSON");
    assert_eq!(body["sensors"], json!([]));

    // Non-admin sessions cannot touch the admin surface.
    let alice_token = login(&client, addr, "alice", "wonderland").await;
    let response = client
        .post(format!("http://{addr}/admin/users"))
        .bearer_auth(&alice_token)
        .json(&json!({"userId": "eve", "secret": "e"}))
        .send()
        .await
        .expect("add-user request failed");
    assert_eq!(response.status(), reqwest::StatusCode::FORBIDDEN);

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_stream_rejects_invalid_token() {
    let (addr, shutdown_tx) = start_server().await;

    let result =
        tokio_tungstenite::connect_async(format!("ws://{addr}/ws?token=not-a-session")).await;
    assert!(result.is_err());

    let _ = shutdown_tx.send(());
}

#[tokio::test]
async fn test_one_stream_per_token() {
    let (addr, shutdown_tx) = start_server().await;
    let client = reqwest::Client::new();
    let token = login(&client, addr, "alice", "wonderland").await;

    let mut first = connect_stream(addr, &token).await;
    next_json(&mut first).await; // snapshot

    // The same token cannot back a second live stream.
    let mut second = connect_stream(addr, &token).await;
    let message = tokio::time::timeout(Duration::from_secs(5), second.next())
        .await
        .expect("timed out waiting for close");
    match message {
        Some(Ok(Message::Close(_))) | None => {}
        other => panic!("expected close, got {other:?}"),
    }

    let _ = shutdown_tx.send(());
}
