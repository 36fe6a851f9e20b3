mod support;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use janus_fleet::config::{BackendConfig, Config};
use janus_fleet::gateway::Gateway;
use janus_fleet::websocket;
use support::{wait_until, MockJanus};

struct TestBed {
    gateway: Arc<Gateway>,
    addr: SocketAddr,
    state_dir: tempfile::TempDir,
    server: tokio::task::JoinHandle<()>,
}

impl TestBed {
    async fn start(backends: Vec<BackendConfig>) -> Self {
        let state_dir = tempfile::tempdir().expect("tempdir");
        let config = Config {
            state_path: state_dir.path().join("rooms.json"),
            keep_alive_timeout_ms: 60_000,
            sync_interval_ms: 600_000,
            backends,
            ..Default::default()
        };
        let gateway = Gateway::initialize(config, None)
            .await
            .expect("gateway initialize");
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        let addr = listener.local_addr().expect("addr");
        let server = websocket::serve(gateway.clone(), listener);
        Self {
            gateway,
            addr,
            state_dir,
            server,
        }
    }

    fn state_file(&self) -> std::path::PathBuf {
        self.state_dir.path().join("rooms.json")
    }

    async fn stop(self) {
        self.gateway.terminate().await;
        self.server.abort();
    }
}

struct TestClient {
    ws: WebSocketStream<MaybeTlsStream<TcpStream>>,
}

impl TestClient {
    /// Connect as `user` and consume the greeting frame.
    async fn connect(addr: SocketAddr, user: &str) -> Self {
        let url = format!("ws://{addr}/ws?id={user}");
        let (ws, _) = connect_async(url.as_str()).await.expect("client connect");
        let mut client = Self { ws };
        let greeting = client.next_text().await;
        assert_eq!(greeting, "connected");
        client
    }

    async fn send(&mut self, value: Value) {
        self.ws
            .send(Message::Text(value.to_string()))
            .await
            .expect("client send");
    }

    async fn send_raw(&mut self, text: &str) {
        self.ws
            .send(Message::Text(text.to_string()))
            .await
            .expect("client send");
    }

    async fn next_text(&mut self) -> String {
        loop {
            let frame = timeout(Duration::from_secs(5), self.ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("connection ended")
                .expect("websocket error");
            match frame {
                Message::Text(text) => return text,
                Message::Close(_) => panic!("connection closed unexpectedly"),
                _ => continue,
            }
        }
    }

    async fn next_json(&mut self) -> Value {
        serde_json::from_str(&self.next_text().await).expect("frame should be JSON")
    }

    /// Skip unrelated frames (async events) until the reply echoing
    /// `transaction` arrives.
    async fn response_for(&mut self, transaction: &str) -> Value {
        loop {
            let value = self.next_json().await;
            if value.get("transaction").and_then(Value::as_str) == Some(transaction) {
                return value;
            }
        }
    }

    async fn event_of_type(&mut self, kind: &str) -> Value {
        loop {
            let value = self.next_json().await;
            if value.get("type").and_then(Value::as_str) == Some(kind) {
                return value;
            }
        }
    }

    async fn expect_silence(&mut self, window: Duration) {
        match timeout(window, self.ws.next()).await {
            Err(_) => {}
            Ok(Some(Ok(Message::Text(text)))) => panic!("unexpected frame: {text}"),
            Ok(_) => {}
        }
    }

    /// Wait for the server to close this connection.
    async fn expect_close(&mut self) {
        let outcome = timeout(Duration::from_secs(5), async {
            loop {
                match self.ws.next().await {
                    None | Some(Ok(Message::Close(_))) | Some(Err(_)) => return,
                    Some(Ok(_)) => continue,
                }
            }
        })
        .await;
        assert!(outcome.is_ok(), "connection was not closed");
    }

    async fn create_room(&mut self, transaction: &str) -> String {
        self.send(json!({
            "type": "create_room",
            "transaction": transaction,
            "load": { "description": "demo" },
        }))
        .await;
        let response = self.response_for(transaction).await;
        assert_eq!(response["type"], "create_room");
        response["load"]["context"]["room_id"]
            .as_str()
            .expect("room id in response")
            .to_string()
    }

    async fn attach(&mut self, transaction: &str, room_id: &str) -> u64 {
        self.send(json!({
            "type": "attach",
            "transaction": transaction,
            "load": { "room_id": room_id },
        }))
        .await;
        let response = self.response_for(transaction).await;
        assert_eq!(response["type"], "attach");
        response["load"].as_u64().expect("handle id in response")
    }
}

#[tokio::test]
async fn create_room_end_to_end() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    alice
        .send(json!({
            "type": "create_room",
            "transaction": "t1",
            "load": { "description": "demo" },
        }))
        .await;
    let response = alice.response_for("t1").await;

    assert_eq!(response["type"], "create_room");
    assert_eq!(response["transaction"], "t1");
    let context = &response["load"]["context"];
    let room_id = context["room_id"].as_str().expect("room id");
    assert_eq!(context["instance_id"], "instance_0");
    assert!(context["secret"].is_string());
    assert!(context["pin"].is_string());
    assert_eq!(response["load"]["result"]["janus"], "success");

    // Stored and persisted.
    assert!(bed.gateway.rooms_snapshot().contains_key(room_id));
    let persisted = std::fs::read_to_string(bed.state_file()).expect("state file");
    assert!(persisted.contains(room_id));

    bed.stop().await;
}

#[tokio::test]
async fn keepalive_and_unknown_types() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    alice
        .send(json!({ "type": "keepalive", "transaction": "ka" }))
        .await;
    let response = alice.response_for("ka").await;
    assert_eq!(response["type"], "keepalive");
    assert_eq!(response["load"], "alice");

    alice
        .send(json!({ "type": "reboot", "transaction": "tu" }))
        .await;
    let response = alice.response_for("tu").await;
    assert_eq!(response["type"], "unknown");
    assert_eq!(response["load"], Value::Null);

    bed.stop().await;
}

#[tokio::test]
async fn join_goes_only_to_the_owning_backend() {
    let mock_a = MockJanus::start().await;
    let mock_b = MockJanus::start().await;
    let bed = TestBed::start(vec![
        mock_a.backend_config("instance_a"),
        mock_b.backend_config("instance_b"),
    ])
    .await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    let room_id = alice.create_room("t1").await;
    let owner = bed.gateway.rooms_snapshot()[&room_id].instance_id.clone();
    let (owner_mock, other_mock) = if owner == "instance_a" {
        (&mock_a, &mock_b)
    } else {
        (&mock_b, &mock_a)
    };

    let handle_id = alice.attach("t-attach", &room_id).await;

    alice
        .send(json!({
            "type": "join",
            "transaction": "t2",
            "load": {
                "room_id": room_id,
                "handle_id": handle_id,
                "ptype": "publisher",
            },
        }))
        .await;
    let response = alice.response_for("t2").await;
    assert_eq!(response["type"], "join");
    assert_eq!(response["transaction"], "t2");

    assert!(owner_mock.saw_plugin_request("join"));
    assert!(!other_mock.saw_plugin_request("join"));

    bed.stop().await;
}

#[tokio::test]
async fn media_lifecycle_operations_round_trip() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    let room_id = alice.create_room("t1").await;
    let handle_id = alice.attach("t2", &room_id).await;

    alice
        .send(json!({
            "type": "publish",
            "transaction": "t3",
            "load": {
                "room_id": room_id,
                "handle_id": handle_id,
                "jsep": { "type": "offer", "sdp": "v=0" },
            },
        }))
        .await;
    let response = alice.response_for("t3").await;
    assert_eq!(response["type"], "publish");
    assert_eq!(response["load"]["jsep"]["type"], "answer");

    alice
        .send(json!({
            "type": "configure",
            "transaction": "t4",
            "load": {
                "room_id": room_id,
                "handle_id": handle_id,
                "audio": true,
                "video": false,
            },
        }))
        .await;
    assert_eq!(alice.response_for("t4").await["type"], "configure");

    alice
        .send(json!({
            "type": "candidate",
            "transaction": "t5",
            "load": {
                "room_id": room_id,
                "handle_id": handle_id,
                "candidate": { "candidate": "candidate:0 1 UDP 1 127.0.0.1 40000 typ host" },
            },
        }))
        .await;
    assert_eq!(alice.response_for("t5").await["type"], "trickle");

    alice
        .send(json!({
            "type": "unpublish",
            "transaction": "t6",
            "load": { "room_id": room_id, "handle_id": handle_id },
        }))
        .await;
    assert_eq!(alice.response_for("t6").await["type"], "unpublish");

    alice
        .send(json!({
            "type": "hangup",
            "transaction": "t7",
            "load": { "room_id": room_id, "handle_id": handle_id },
        }))
        .await;
    assert_eq!(alice.response_for("t7").await["type"], "hangup");

    alice
        .send(json!({
            "type": "leave",
            "transaction": "t8",
            "load": { "room_id": room_id, "handle_id": handle_id },
        }))
        .await;
    assert_eq!(alice.response_for("t8").await["type"], "leave");

    alice
        .send(json!({
            "type": "detach",
            "transaction": "t9",
            "load": { "room_id": room_id, "handle_id": handle_id },
        }))
        .await;
    assert_eq!(alice.response_for("t9").await["type"], "detach");

    alice
        .send(json!({
            "type": "destroy_room",
            "transaction": "t10",
            "load": { "room_id": room_id },
        }))
        .await;
    let response = alice.response_for("t10").await;
    assert_eq!(response["type"], "destroy_room");
    assert!(!bed.gateway.rooms_snapshot().contains_key(&room_id));

    bed.stop().await;
}

#[tokio::test]
async fn trickle_events_reach_only_the_owning_user() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;
    let mut bob = TestClient::connect(bed.addr, "bob").await;

    let room_id = alice.create_room("t1").await;
    let handle_id = alice.attach("t2", &room_id).await;

    mock.emit(json!({
        "janus": "trickle",
        "sender": handle_id,
        "candidate": { "sdpMid": "0", "candidate": "candidate:0 1 UDP 1 127.0.0.1 40000 typ host" },
    }));

    let event = alice.event_of_type("trickle").await;
    assert_eq!(event["sender"], json!(handle_id));
    assert_eq!(event["data"]["sdpMid"], "0");

    bob.expect_silence(Duration::from_millis(300)).await;

    bed.stop().await;
}

#[tokio::test]
async fn superseding_connection_tears_down_the_previous_one() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;

    let mut first = TestClient::connect(bed.addr, "alice").await;
    let room_id = first.create_room("t1").await;
    let handle_id = first.attach("t2", &room_id).await;

    let _second = TestClient::connect(bed.addr, "alice").await;

    // The old connection is closed and the user's handles are released.
    first.expect_close().await;
    wait_until(
        || mock.saw_plugin_request_for_handle("leave", handle_id),
        "leave of the superseded handle",
    )
    .await;
    wait_until(
        || mock.saw_verb_for_handle("detach", handle_id),
        "detach of the superseded handle",
    )
    .await;

    bed.stop().await;
}

#[tokio::test]
async fn join_and_configure_repairs_already_in_room_once() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    let room_id = alice.create_room("t1").await;
    let stale_handle = alice.attach("t2", &room_id).await;
    let handle_id = alice.attach("t3", &room_id).await;

    mock.fail_next_message(436, "User already exists in room");
    alice
        .send(json!({
            "type": "joinandconfigure",
            "transaction": "t4",
            "load": {
                "room_id": room_id,
                "handle_id": handle_id,
                "ptype": "publisher",
                "jsep": { "type": "offer", "sdp": "v=0" },
            },
        }))
        .await;
    let response = alice.response_for("t4").await;

    assert_eq!(response["type"], "joinandconfigure");
    assert_eq!(response["load"]["jsep"]["type"], "answer");
    // One failed attempt, one retry.
    assert_eq!(mock.count_plugin_requests("joinandconfigure"), 2);
    // The conflicting handle was released, the joining one kept.
    assert!(mock.saw_verb_for_handle("detach", stale_handle));
    assert!(!mock.saw_verb_for_handle("detach", handle_id));

    bed.stop().await;
}

#[tokio::test]
async fn rooms_listing_carries_no_credentials() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    let room_id = alice.create_room("t1").await;

    alice
        .send(json!({ "type": "rooms", "transaction": "t2" }))
        .await;
    let response = alice.response_for("t2").await;
    assert_eq!(response["type"], "rooms");
    let listing = response["load"].as_array().expect("rooms array");
    let room = listing
        .iter()
        .find(|entry| entry["room_id"] == room_id.as_str())
        .expect("created room listed");
    assert!(room.get("secret").is_none());
    assert!(room.get("pin").is_none());
    assert_eq!(room["instance_id"], "instance_0");

    // The gateway still knows the credentials; reconciliation carried them
    // forward from the previous table.
    let rooms = bed.gateway.rooms_snapshot();
    assert!(rooms[&room_id].secret.is_some());
    assert!(rooms[&room_id].pin.is_some());

    bed.stop().await;
}

#[tokio::test]
async fn reconciliation_is_idempotent_on_unchanged_state() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    alice.create_room("t1").await;

    bed.gateway.synchronize().await.expect("first pass");
    let first = std::fs::read_to_string(bed.state_file()).expect("state file");
    let table_after_first = bed.gateway.rooms_snapshot();

    bed.gateway.synchronize().await.expect("second pass");
    let second = std::fs::read_to_string(bed.state_file()).expect("state file");

    assert_eq!(first, second);
    assert_eq!(table_after_first, bed.gateway.rooms_snapshot());

    bed.stop().await;
}

#[tokio::test]
async fn duplicate_backend_identity_is_fatal() {
    let mock = MockJanus::start().await;
    let dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        state_path: dir.path().join("rooms.json"),
        backends: vec![
            mock.backend_config("dup"),
            mock.backend_config("dup"),
        ],
        ..Default::default()
    };

    let err = Gateway::initialize(config, None)
        .await
        .expect_err("duplicate identity should fail initialization");
    assert!(err.to_string().contains("duplicate backend identity"));
}

#[tokio::test]
async fn connection_without_identity_is_closed_immediately() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;

    let url = format!("ws://{}/ws", bed.addr);
    let (mut ws, _) = connect_async(url.as_str()).await.expect("handshake");
    let frame = timeout(Duration::from_secs(2), ws.next())
        .await
        .expect("expected the server to close");
    match frame {
        None | Some(Ok(Message::Close(_))) | Some(Err(_)) => {}
        Some(Ok(other)) => panic!("unexpected frame before close: {other:?}"),
    }

    bed.stop().await;
}

#[tokio::test]
async fn allocation_with_empty_pool_reports_no_instance() {
    let bed = TestBed::start(Vec::new()).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    alice
        .send(json!({
            "type": "create_room",
            "transaction": "t1",
            "load": { "description": "demo" },
        }))
        .await;
    let response = alice.response_for("t1").await;
    assert_eq!(response["type"], "error");
    assert!(response["load"]
        .as_str()
        .expect("error message")
        .contains("no instance available"));

    bed.stop().await;
}

#[tokio::test]
async fn malformed_messages_echo_a_best_effort_transaction() {
    let mock = MockJanus::start().await;
    let bed = TestBed::start(vec![mock.backend_config("instance_0")]).await;
    let mut alice = TestClient::connect(bed.addr, "alice").await;

    // `type` has the wrong JSON type; the envelope fails validation but the
    // transaction is still echoed and the connection survives.
    alice.send_raw(r#"{"type":42,"transaction":"tbad"}"#).await;
    let response = alice.response_for("tbad").await;
    assert_eq!(response["type"], "error");

    alice
        .send(json!({ "type": "keepalive", "transaction": "ka" }))
        .await;
    let response = alice.response_for("ka").await;
    assert_eq!(response["type"], "keepalive");

    bed.stop().await;
}

#[tokio::test]
async fn keepalive_timeout_closes_the_connection() {
    let mock = MockJanus::start().await;
    let state_dir = tempfile::tempdir().expect("tempdir");
    let config = Config {
        state_path: state_dir.path().join("rooms.json"),
        keep_alive_timeout_ms: 300,
        sync_interval_ms: 600_000,
        backends: vec![mock.backend_config("instance_0")],
        ..Default::default()
    };
    let gateway = Gateway::initialize(config, None)
        .await
        .expect("gateway initialize");
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    let server = websocket::serve(gateway.clone(), listener);

    let mut alice = TestClient::connect(addr, "alice").await;
    alice.expect_close().await;

    gateway.terminate().await;
    server.abort();
}
