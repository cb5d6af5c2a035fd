use diagram_colab::config::Config;
use diagram_colab::db::MemoryDiagramStore;
use diagram_colab::models::{DiagramKey, DiagramSnapshot, SessionConflictResponse, SessionResponse};
use diagram_colab::services::auth_service::Claims;
use diagram_colab::{build_app, AppState};
use futures_util::{SinkExt, StreamExt};
use jsonwebtoken::{encode, EncodingKey, Header};
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio_tungstenite::tungstenite::{self, Message};
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};
use uuid::Uuid;

const SECRET: &str = "collaboration-flow-secret";

type Socket = WebSocketStream<MaybeTlsStream<TcpStream>>;

struct TestServer {
    addr: SocketAddr,
    key: DiagramKey,
    http: reqwest::Client,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(Config::default()).await
    }

    async fn start_with(config: Config) -> Self {
        let key = DiagramKey::new(Uuid::new_v4(), Uuid::new_v4());
        let store = Arc::new(MemoryDiagramStore::new());
        store.insert_diagram(key, DiagramSnapshot::default());

        let config = Config { auth_jwt_secret: Some(SECRET.to_string()), ..config };
        let app = build_app(AppState::new(config, store));
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, key, http: reqwest::Client::new() }
    }

    fn token(&self, sub: &str, role: Option<&str>) -> String {
        let claims = Claims {
            sub: sub.to_string(),
            exp: (chrono::Utc::now().timestamp() + 3600) as usize,
            email: None,
            name: None,
            roles: role.map(|r| format!("tm/{}/{}", self.key.threat_model_id, r)).into_iter().collect(),
        };
        encode(&Header::default(), &claims, &EncodingKey::from_secret(SECRET.as_bytes())).unwrap()
    }

    fn url(&self, path: &str) -> String {
        format!(
            "http://{}/api/v1/threat_models/{}/diagrams/{}/{}",
            self.addr, self.key.threat_model_id, self.key.diagram_id, path
        )
    }

    async fn create(&self, token: &str) -> reqwest::Response {
        self.http.post(self.url("collaborate")).bearer_auth(token).send().await.unwrap()
    }

    async fn join(&self, token: &str) -> reqwest::Response {
        self.http.put(self.url("collaborate")).bearer_auth(token).send().await.unwrap()
    }

    async fn connect(&self, session: &SessionResponse, token: &str) -> Socket {
        let url = format!("{}?token={}", session.websocket_url, token);
        let (socket, _) = tokio_tungstenite::connect_async(url).await.unwrap();
        socket
    }
}

async fn next_frame(socket: &mut Socket) -> Value {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(3), socket.next())
            .await
            .expect("timed out waiting for a frame")
            .expect("socket closed")
            .expect("socket error");
        match msg {
            Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
            Message::Close(frame) => panic!("socket closed: {:?}", frame),
            _ => continue,
        }
    }
}

/// Skip frames until one of `message_type` arrives
async fn wait_for(socket: &mut Socket, message_type: &str) -> Value {
    loop {
        let frame = next_frame(socket).await;
        if frame["message_type"] == message_type {
            return frame;
        }
    }
}

/// Like `wait_for`, but keeps the socket busy so the server never sees it idle
async fn wait_for_while_active(socket: &mut Socket, message_type: &str) -> Value {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    let mut last_sent: Option<tokio::time::Instant> = None;
    loop {
        let now = tokio::time::Instant::now();
        assert!(now < deadline, "timed out waiting for {}", message_type);
        if last_sent.map_or(true, |t| now - t >= Duration::from_millis(250)) {
            // the server may already be closing the socket
            let _ = socket.send(Message::Text(json!({"message_type": "sync_status_request"}).to_string().into())).await;
            last_sent = Some(now);
        }
        match tokio::time::timeout(Duration::from_millis(250), socket.next()).await {
            Err(_) => continue,
            Ok(Some(Ok(Message::Text(text)))) => {
                let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                if frame["message_type"] == message_type {
                    return frame;
                }
            }
            Ok(Some(Ok(Message::Close(frame)))) => panic!("socket closed: {:?}", frame),
            Ok(Some(Ok(_))) => {}
            Ok(other) => panic!("socket failed: {:?}", other),
        }
    }
}

/// Read until the server's close frame and return its code
async fn close_code(socket: &mut Socket) -> u16 {
    loop {
        let msg = tokio::time::timeout(Duration::from_secs(5), socket.next())
            .await
            .expect("timed out waiting for the close frame")
            .expect("stream ended without a close frame")
            .expect("socket error");
        if let Message::Close(frame) = msg {
            return frame.map(|f| u16::from(f.code)).unwrap_or(1005);
        }
    }
}

async fn send(socket: &mut Socket, frame: Value) {
    socket.send(Message::Text(frame.to_string().into())).await.unwrap();
}

fn add_cell(operation_id: &str, cell_id: &str) -> Value {
    json!({
        "message_type": "diagram_operation",
        "operation_id": operation_id,
        "operation": {
            "type": "patch",
            "cells": [{
                "id": cell_id,
                "operation": "add",
                "data": {
                    "id": cell_id,
                    "shape": "process",
                    "geometry": {"x": 100.0, "y": 100.0, "width": 80.0, "height": 60.0}
                }
            }]
        }
    })
}

#[tokio::test]
async fn session_rest_lifecycle() {
    let server = TestServer::start().await;
    let host = server.token("host", Some("owner"));
    let alice = server.token("alice", Some("writer"));
    let outsider = server.token("mallory", None);

    let health = server.http.get(format!("http://{}/api/v1/health", server.addr)).send().await.unwrap();
    assert_eq!(health.status(), 200);

    let anonymous = server.http.post(server.url("collaborate")).send().await.unwrap();
    assert_eq!(anonymous.status(), 401);

    let created = server.create(&host).await;
    assert_eq!(created.status(), 201);
    let session: SessionResponse = created.json().await.unwrap();
    assert_eq!(session.host.user_id, "host");
    assert!(session.websocket_url.starts_with("ws://"));
    assert!(session.websocket_url.ends_with("/ws"));

    let conflict = server.create(&alice).await;
    assert_eq!(conflict.status(), 409);
    let conflict: SessionConflictResponse = conflict.json().await.unwrap();
    assert_eq!(conflict.session_id, session.session_id);

    assert_eq!(server.join(&outsider).await.status(), 403);
    let joined: SessionResponse = server.join(&alice).await.json().await.unwrap();
    assert_eq!(joined.participants.len(), 2);

    let status = server.http.get(server.url("collaborate")).bearer_auth(&alice).send().await.unwrap();
    assert_eq!(status.status(), 200);

    let left = server.http.delete(server.url("collaborate")).bearer_auth(&host).send().await.unwrap();
    assert_eq!(left.status(), 204);
    let gone = server.http.get(server.url("collaborate")).bearer_auth(&alice).send().await.unwrap();
    assert_eq!(gone.status(), 404);
}

#[tokio::test]
async fn operations_flow_between_sockets() {
    let server = TestServer::start().await;
    let host_token = server.token("host", Some("owner"));
    let alice_token = server.token("alice", Some("writer"));
    let rita_token = server.token("rita", Some("reader"));

    let session: SessionResponse = server.create(&host_token).await.json().await.unwrap();
    server.join(&alice_token).await;
    server.join(&rita_token).await;

    let mut host = server.connect(&session, &host_token).await;
    let first = next_frame(&mut host).await;
    assert_eq!(first["message_type"], "diagram_state_sync");
    assert_eq!(first["update_vector"], 0);

    let mut alice = server.connect(&session, &alice_token).await;
    assert_eq!(next_frame(&mut alice).await["message_type"], "diagram_state_sync");
    let joined = wait_for(&mut host, "participant_joined").await;
    assert_eq!(joined["user"]["user_id"], "alice");

    send(&mut alice, add_cell("op-1", "c1")).await;
    let op = wait_for(&mut host, "diagram_operation").await;
    assert_eq!(op["operation_id"], "op-1");
    assert_eq!(op["update_vector"], 1);
    assert_eq!(op["user"]["user_id"], "alice");

    let model: DiagramSnapshot = server
        .http
        .get(server.url("model"))
        .bearer_auth(&alice_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(model.update_vector, 1);
    assert_eq!(model.cells.len(), 1);

    let mut rita = server.connect(&session, &rita_token).await;
    send(&mut rita, add_cell("op-2", "c2")).await;
    let denied = wait_for(&mut rita, "authorization_denied").await;
    assert_eq!(denied["original_operation_id"], "op-2");
    assert_eq!(denied["reason"], "insufficient_permissions");

    send(&mut alice, json!({"message_type": "sync_status_request"})).await;
    let status = wait_for(&mut alice, "sync_status_response").await;
    assert_eq!(status["update_vector"], 1);

    let left = server.http.delete(server.url("collaborate")).bearer_auth(&host_token).send().await.unwrap();
    assert_eq!(left.status(), 204);
    let ended = wait_for(&mut alice, "session_ended").await;
    assert_eq!(ended["reason"], "host_left");
}

#[tokio::test]
async fn socket_requires_rest_join_first() {
    let server = TestServer::start().await;
    let host_token = server.token("host", Some("owner"));
    let bob_token = server.token("bob", Some("writer"));
    let session: SessionResponse = server.create(&host_token).await.json().await.unwrap();

    let url = format!("{}?token={}", session.websocket_url, bob_token);
    match tokio_tungstenite::connect_async(url).await {
        Err(tungstenite::Error::Http(response)) => assert_eq!(response.status(), 403),
        Err(other) => panic!("unexpected error {:?}", other),
        Ok(_) => panic!("socket should have been refused"),
    }
}

#[tokio::test]
async fn malformed_frame_keeps_the_socket_open() {
    let server = TestServer::start().await;
    let host_token = server.token("host", Some("owner"));
    let session: SessionResponse = server.create(&host_token).await.json().await.unwrap();

    let mut host = server.connect(&session, &host_token).await;
    wait_for(&mut host, "diagram_state_sync").await;

    send(&mut host, json!({"message_type": "teleport"})).await;
    let err = wait_for(&mut host, "error").await;
    assert_eq!(err["error"], "invalid_message");

    send(&mut host, json!({"message_type": "resync_request"})).await;
    let resync = wait_for(&mut host, "resync_response").await;
    assert_eq!(resync["method"], "rest_api");
}

fn short_idle_config() -> Config {
    Config { idle_timeout_secs: 1, ..Config::default() }
}

#[tokio::test]
async fn silent_participant_is_closed_as_going_away() {
    let server = TestServer::start_with(short_idle_config()).await;
    let host_token = server.token("host", Some("owner"));
    let alice_token = server.token("alice", Some("writer"));
    let session: SessionResponse = server.create(&host_token).await.json().await.unwrap();
    server.join(&alice_token).await;

    let mut host = server.connect(&session, &host_token).await;
    // alice never sends anything and never answers pings
    let mut alice = server.connect(&session, &alice_token).await;

    let left = wait_for_while_active(&mut host, "participant_left").await;
    assert_eq!(left["user"]["user_id"], "alice");
    assert_eq!(close_code(&mut alice).await, 1001);

    let status: SessionResponse = server
        .http
        .get(server.url("collaborate"))
        .bearer_auth(&host_token)
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    let alice_view = status.participants.iter().find(|p| p.user.user_id == "alice").unwrap();
    assert!(!alice_view.connected);
}

#[tokio::test]
async fn silent_host_ends_the_session() {
    let server = TestServer::start_with(short_idle_config()).await;
    let host_token = server.token("host", Some("owner"));
    let alice_token = server.token("alice", Some("writer"));
    let session: SessionResponse = server.create(&host_token).await.json().await.unwrap();
    server.join(&alice_token).await;

    let mut host = server.connect(&session, &host_token).await;
    let mut alice = server.connect(&session, &alice_token).await;

    let left = wait_for_while_active(&mut alice, "participant_left").await;
    assert_eq!(left["user"]["user_id"], "host");
    let ended = wait_for_while_active(&mut alice, "session_ended").await;
    assert_eq!(ended["reason"], "host_disconnected");
    assert_eq!(close_code(&mut host).await, 1001);

    // the registry drops the session once the actor has wound down
    for _ in 0..50 {
        let status = server.http.get(server.url("collaborate")).bearer_auth(&alice_token).send().await.unwrap();
        if status.status() == 404 {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("session outlived its host");
}
