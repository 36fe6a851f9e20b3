//! In-process mock Janus backend: a WebSocket server speaking just enough of
//! the signaling and admin protocols to drive the gateway end to end.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{
    ErrorResponse, Request, Response as HandshakeResponse,
};
use tokio_tungstenite::tungstenite::Message;

use janus_fleet::config::BackendConfig;

#[derive(Default)]
struct MockState {
    counter: AtomicU64,
    requests: Mutex<Vec<Value>>,
    admin_requests: Mutex<Vec<Value>>,
    rooms: Mutex<Vec<Value>>,
    handles: Mutex<Vec<u64>>,
    /// Next plugin `message` answers with this plugin-level error.
    fail_next: Mutex<Option<(i64, String)>>,
    /// Next plugin `message` gets no reply at all.
    swallow_next: Mutex<bool>,
    /// Outbox of the most recent signaling connection, for injected events.
    event_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

pub struct MockJanus {
    pub addr: SocketAddr,
    pub admin_addr: SocketAddr,
    state: Arc<MockState>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl MockJanus {
    pub async fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind signaling");
        let admin_listener = TcpListener::bind("127.0.0.1:0").await.expect("bind admin");
        let addr = listener.local_addr().expect("signaling addr");
        let admin_addr = admin_listener.local_addr().expect("admin addr");

        let state = Arc::new(MockState::default());
        let mut tasks = Vec::new();

        {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = listener.accept().await else {
                        break;
                    };
                    tokio::spawn(handle_signaling(stream, state.clone()));
                }
            }));
        }
        {
            let state = state.clone();
            tasks.push(tokio::spawn(async move {
                loop {
                    let Ok((stream, _)) = admin_listener.accept().await else {
                        break;
                    };
                    tokio::spawn(handle_admin(stream, state.clone()));
                }
            }));
        }

        Self {
            addr,
            admin_addr,
            state,
            tasks,
        }
    }

    /// Backend config pointing at this mock, tuned for fast tests.
    pub fn backend_config(&self, name: &str) -> BackendConfig {
        let mut config =
            BackendConfig::new(name, "127.0.0.1", self.addr.port(), self.admin_addr.port());
        config.keepalive_interval_ms = 200;
        config.poll_interval_ms = 60_000;
        config.transaction_timeout_ms = 2_000;
        config
    }

    pub fn requests(&self) -> Vec<Value> {
        self.state.requests.lock().unwrap().clone()
    }

    pub fn saw_verb(&self, verb: &str) -> bool {
        self.requests()
            .iter()
            .any(|request| request["janus"] == verb)
    }

    pub fn saw_verb_for_handle(&self, verb: &str, handle_id: u64) -> bool {
        self.requests()
            .iter()
            .any(|request| request["janus"] == verb && request["handle_id"] == json!(handle_id))
    }

    pub fn saw_plugin_request(&self, name: &str) -> bool {
        self.count_plugin_requests(name) > 0
    }

    pub fn count_plugin_requests(&self, name: &str) -> usize {
        self.requests()
            .iter()
            .filter(|request| request["body"]["request"] == name)
            .count()
    }

    pub fn saw_plugin_request_for_handle(&self, name: &str, handle_id: u64) -> bool {
        self.requests().iter().any(|request| {
            request["body"]["request"] == name && request["handle_id"] == json!(handle_id)
        })
    }

    pub fn fail_next_message(&self, code: i64, reason: &str) {
        *self.state.fail_next.lock().unwrap() = Some((code, reason.to_string()));
    }

    pub fn swallow_next_message(&self) {
        *self.state.swallow_next.lock().unwrap() = true;
    }

    /// Push an asynchronous event down the current signaling connection.
    pub fn emit(&self, event: Value) {
        if let Some(tx) = self.state.event_tx.lock().unwrap().as_ref() {
            let _ = tx.send(event.to_string());
        }
    }

    /// Server-side drop of the current signaling connection.
    pub fn kick(&self) {
        *self.state.event_tx.lock().unwrap() = None;
    }
}

impl Drop for MockJanus {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// Poll a condition until it holds or the window runs out.
pub async fn wait_until(mut pred: impl FnMut() -> bool, what: &str) {
    for _ in 0..100 {
        if pred() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    panic!("timed out waiting for {what}");
}

async fn accept_ws(stream: TcpStream) -> Option<tokio_tungstenite::WebSocketStream<TcpStream>> {
    let echo_protocol = |request: &Request,
                         mut response: HandshakeResponse|
     -> Result<HandshakeResponse, ErrorResponse> {
        if let Some(proto) = request.headers().get("Sec-WebSocket-Protocol") {
            response
                .headers_mut()
                .insert("Sec-WebSocket-Protocol", proto.clone());
        }
        Ok(response)
    };
    tokio_tungstenite::accept_hdr_async(stream, echo_protocol)
        .await
        .ok()
}

async fn handle_signaling(stream: TcpStream, state: Arc<MockState>) {
    let Some(ws) = accept_ws(stream).await else {
        return;
    };
    let (mut sink, mut source) = ws.split();

    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<String>();
    *state.event_tx.lock().unwrap() = Some(inject_tx);

    loop {
        tokio::select! {
            inject = inject_rx.recv() => {
                let Some(text) = inject else { break };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
            frame = source.next() => {
                match frame {
                    Some(Ok(Message::Text(text))) => {
                        for reply in state.respond_signaling(&text) {
                            if sink.send(Message::Text(reply)).await.is_err() {
                                return;
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(_)) => break,
                }
            }
        }
    }
}

async fn handle_admin(stream: TcpStream, state: Arc<MockState>) {
    let Some(mut ws) = accept_ws(stream).await else {
        return;
    };
    while let Some(frame) = ws.next().await {
        match frame {
            Ok(Message::Text(text)) => {
                for reply in state.respond_admin(&text) {
                    if ws.send(Message::Text(reply)).await.is_err() {
                        return;
                    }
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }
}

impl MockState {
    fn next_id(&self) -> u64 {
        self.counter.fetch_add(1, Ordering::SeqCst) + 1
    }

    fn respond_signaling(&self, text: &str) -> Vec<String> {
        let Ok(request) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        self.requests.lock().unwrap().push(request.clone());
        let transaction = request["transaction"].clone();

        match request["janus"].as_str().unwrap_or_default() {
            "create" => vec![json!({
                "janus": "success",
                "transaction": transaction,
                "data": { "id": self.next_id() },
            })
            .to_string()],
            "claim" => vec![json!({
                "janus": "success",
                "transaction": transaction,
                "data": {},
            })
            .to_string()],
            "attach" => {
                let handle_id = self.next_id();
                self.handles.lock().unwrap().push(handle_id);
                vec![json!({
                    "janus": "success",
                    "transaction": transaction,
                    "data": { "id": handle_id },
                })
                .to_string()]
            }
            "detach" => {
                let handle_id = request["handle_id"].as_u64().unwrap_or_default();
                self.handles.lock().unwrap().retain(|id| *id != handle_id);
                vec![json!({ "janus": "success", "transaction": transaction }).to_string()]
            }
            "keepalive" | "trickle" => {
                vec![json!({ "janus": "ack", "transaction": transaction }).to_string()]
            }
            "destroy" | "hangup" => {
                vec![json!({ "janus": "success", "transaction": transaction }).to_string()]
            }
            "message" => self.respond_plugin(&request, transaction),
            _ => vec![json!({ "janus": "success", "transaction": transaction }).to_string()],
        }
    }

    fn respond_plugin(&self, request: &Value, transaction: Value) -> Vec<String> {
        if *self.swallow_next.lock().unwrap() {
            *self.swallow_next.lock().unwrap() = false;
            return Vec::new();
        }
        if let Some((code, reason)) = self.fail_next.lock().unwrap().take() {
            return vec![plugin_success(
                transaction,
                json!({ "videoroom": "event", "error_code": code, "error": reason }),
            )];
        }

        let body = &request["body"];
        let handle = request["handle_id"].clone();
        match body["request"].as_str().unwrap_or_default() {
            "create" => {
                let room = body["room"].clone();
                self.rooms.lock().unwrap().push(json!({
                    "room": room,
                    "description": body.get("description").cloned().unwrap_or(Value::Null),
                    "max_publishers": body.get("publishers").cloned().unwrap_or(json!(6)),
                    "bitrate": body.get("bitrate").cloned().unwrap_or(json!(128_000)),
                    "num_participants": 0,
                }));
                vec![plugin_success(
                    transaction,
                    json!({ "videoroom": "created", "room": room, "permanent": false }),
                )]
            }
            "destroy" => {
                let room = body["room"].clone();
                self.rooms.lock().unwrap().retain(|entry| entry["room"] != room);
                vec![plugin_success(
                    transaction,
                    json!({ "videoroom": "destroyed", "room": room }),
                )]
            }
            "edit" => vec![plugin_success(
                transaction,
                json!({ "videoroom": "edited", "room": body["room"] }),
            )],
            "list" => {
                let list = self.rooms.lock().unwrap().clone();
                vec![plugin_success(
                    transaction,
                    json!({ "videoroom": "success", "list": list }),
                )]
            }
            "listparticipants" => vec![plugin_success(
                transaction,
                json!({
                    "videoroom": "participants",
                    "room": body["room"],
                    "participants": [],
                }),
            )],
            "join" => vec![
                ack(transaction.clone()),
                plugin_event(
                    transaction,
                    handle,
                    json!({ "videoroom": "joined", "room": body["room"], "publishers": [] }),
                    None,
                ),
            ],
            "joinandconfigure" => vec![
                ack(transaction.clone()),
                plugin_event(
                    transaction,
                    handle,
                    json!({ "videoroom": "joined", "room": body["room"], "publishers": [] }),
                    Some(json!({ "type": "answer", "sdp": "v=0" })),
                ),
            ],
            "configure" | "publish" | "start" => vec![
                ack(transaction.clone()),
                plugin_event(
                    transaction,
                    handle,
                    json!({ "videoroom": "event", "configured": "ok" }),
                    Some(json!({ "type": "answer", "sdp": "v=0" })),
                ),
            ],
            "unpublish" => vec![
                ack(transaction.clone()),
                plugin_event(
                    transaction,
                    handle,
                    json!({ "videoroom": "event", "unpublished": "ok" }),
                    None,
                ),
            ],
            "leave" => vec![
                ack(transaction.clone()),
                plugin_event(
                    transaction,
                    handle,
                    json!({ "videoroom": "event", "leaving": "ok" }),
                    None,
                ),
            ],
            _ => vec![plugin_success(transaction, json!({ "videoroom": "event" }))],
        }
    }

    fn respond_admin(&self, text: &str) -> Vec<String> {
        let Ok(request) = serde_json::from_str::<Value>(text) else {
            return Vec::new();
        };
        self.admin_requests.lock().unwrap().push(request.clone());
        let transaction = request["transaction"].clone();

        match request["janus"].as_str().unwrap_or_default() {
            "list_handles" => {
                let handles = self.handles.lock().unwrap().clone();
                vec![json!({
                    "janus": "success",
                    "transaction": transaction,
                    "handles": handles,
                })
                .to_string()]
            }
            "handle_info" => vec![json!({
                "janus": "success",
                "transaction": transaction,
                "info": { "handle_id": request["handle_id"], "plugin": "janus.plugin.videoroom" },
            })
            .to_string()],
            "info" => vec![json!({
                "janus": "server_info",
                "transaction": transaction,
                "name": "Mock Janus",
                "sessions": 1,
            })
            .to_string()],
            _ => vec![json!({ "janus": "success", "transaction": transaction }).to_string()],
        }
    }
}

fn ack(transaction: Value) -> String {
    json!({ "janus": "ack", "transaction": transaction }).to_string()
}

fn plugin_success(transaction: Value, data: Value) -> String {
    json!({
        "janus": "success",
        "transaction": transaction,
        "plugindata": { "plugin": "janus.plugin.videoroom", "data": data },
    })
    .to_string()
}

fn plugin_event(transaction: Value, sender: Value, data: Value, jsep: Option<Value>) -> String {
    let mut event = json!({
        "janus": "event",
        "transaction": transaction,
        "sender": sender,
        "plugindata": { "plugin": "janus.plugin.videoroom", "data": data },
    });
    if let Some(jsep) = jsep {
        event["jsep"] = jsep;
    }
    event.to_string()
}
