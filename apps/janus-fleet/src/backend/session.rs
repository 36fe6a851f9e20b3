//! Session client for one Janus instance.
//!
//! Owns two resilient sockets (signaling + admin), the transaction
//! correlation tables, the session/keepalive lifecycle, and the
//! `handle -> user` ownership table. Requests return a [`Reply`] or reject
//! with a [`TransactionError`]; asynchronous backend traffic is forwarded to
//! the orchestrator as [`BackendEvent`]s.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use serde_json::{json, Value};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{interval, timeout};
use tracing::{debug, info, warn};
use transport_reconnect::{ReconnectConfig, ResilientSocket, SocketEvent};
use uuid::Uuid;

use crate::config::BackendConfig;

use super::wire::{Envelope, ParticipantType, Reply, TransactionError, Verb};

const SIGNALING_PROTOCOL: &str = "janus-protocol";
const ADMIN_PROTOCOL: &str = "janus-admin-protocol";
const VIDEOROOM_PLUGIN: &str = "janus.plugin.videoroom";
const ADMIN_CONNECT_WAIT: Duration = Duration::from_secs(20);
const MAX_PUBLISHERS: u64 = 6;

/// Traffic surfaced to the orchestrator, decoupled from any pending
/// transaction.
#[derive(Debug)]
pub enum BackendEvent {
    Connected {
        instance: String,
    },
    Disconnected {
        instance: String,
    },
    Message {
        instance: String,
        envelope: Envelope,
        raw: Value,
    },
}

/// Instance-level liveness numbers refreshed by the usage poll.
#[derive(Debug, Clone, Default)]
pub struct InstanceStats {
    pub active_handles: usize,
    pub server_info: Option<Value>,
}

#[derive(Debug, Clone, Default)]
pub struct JoinParams {
    pub room: String,
    pub handle_id: u64,
    pub user_id: Option<String>,
    pub ptype: ParticipantType,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub audiocodec: Option<String>,
    pub videocodec: Option<String>,
    pub feed: Option<u64>,
    pub display: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct ConfigureParams {
    pub room: String,
    pub handle_id: u64,
    pub ptype: ParticipantType,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub jsep: Option<Value>,
    pub audio: Option<bool>,
    pub video: Option<bool>,
    pub audiocodec: Option<String>,
    pub videocodec: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct PublishParams {
    pub room: String,
    pub handle_id: u64,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub jsep: Value,
    pub audiocodec: Option<String>,
    pub videocodec: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct StartParams {
    pub room: String,
    pub handle_id: u64,
    pub pin: Option<String>,
    pub secret: Option<String>,
    pub answer: Value,
}

#[derive(Debug, Clone, Default)]
pub struct CreateRoomParams {
    pub room: String,
    pub description: Option<String>,
    pub secret: Option<String>,
    pub pin: Option<String>,
    pub bitrate: Option<u64>,
    pub bitrate_cap: Option<bool>,
    pub fir_freq: Option<u64>,
    pub videocodec: Option<String>,
    pub vp9_profile: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct EditRoomParams {
    pub room: String,
    pub handle_id: u64,
    pub secret: Option<String>,
    pub new_secret: Option<String>,
    pub new_pin: Option<String>,
}

struct PendingCall {
    /// Fire-and-forget verbs (`keepalive`, `trickle`) complete on the
    /// immediate ack; everything else waits for the real reply.
    ack_completes: bool,
    reply: oneshot::Sender<Reply>,
}

struct SessionInner {
    config: BackendConfig,
    socket: ResilientSocket,
    admin_socket: ResilientSocket,
    session_id: Mutex<Option<u64>>,
    local_handle: Mutex<Option<u64>>,
    handles: Mutex<HashMap<u64, String>>,
    calls: Mutex<HashMap<String, PendingCall>>,
    admin_calls: Mutex<HashMap<String, PendingCall>>,
    connected: AtomicBool,
    admin_connected: watch::Sender<bool>,
    connect_result: Mutex<Option<oneshot::Sender<Result<(), TransactionError>>>>,
    events: mpsc::UnboundedSender<BackendEvent>,
    stats: Mutex<InstanceStats>,
}

/// A live client against one backend instance.
pub struct BackendSession {
    inner: Arc<SessionInner>,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl BackendSession {
    /// Open both channels and wait for the first session bring-up. Any
    /// failure in the create/claim -> attach -> admin chain fails this call;
    /// afterwards the session recovers on its own.
    pub async fn connect(
        config: BackendConfig,
        events: mpsc::UnboundedSender<BackendEvent>,
    ) -> Result<Self, TransactionError> {
        let link_config = ReconnectConfig {
            connect_timeout: Duration::from_secs(3),
            max_retries: Some(100),
            ..Default::default()
        };
        let (socket, socket_events) = ResilientSocket::connect_subscribed(
            config.url(),
            ReconnectConfig {
                subprotocol: Some(SIGNALING_PROTOCOL.to_string()),
                ..link_config.clone()
            },
        );
        let (admin_socket, admin_events) = ResilientSocket::connect_subscribed(
            config.admin_url(),
            ReconnectConfig {
                subprotocol: Some(ADMIN_PROTOCOL.to_string()),
                ..link_config
            },
        );

        let (ready_tx, ready_rx) = oneshot::channel();
        let (admin_connected, _) = watch::channel(false);
        let inner = Arc::new(SessionInner {
            config,
            socket,
            admin_socket,
            session_id: Mutex::new(None),
            local_handle: Mutex::new(None),
            handles: Mutex::new(HashMap::new()),
            calls: Mutex::new(HashMap::new()),
            admin_calls: Mutex::new(HashMap::new()),
            connected: AtomicBool::new(false),
            admin_connected,
            connect_result: Mutex::new(Some(ready_tx)),
            events,
            stats: Mutex::new(InstanceStats::default()),
        });

        let session = Self {
            inner,
            tasks: Mutex::new(Vec::new()),
        };
        session.spawn_pumps(socket_events, admin_events);

        match ready_rx.await {
            Ok(Ok(())) => Ok(session),
            Ok(Err(err)) => Err(err),
            Err(_) => Err(TransactionError::ChannelClosed),
        }
    }

    fn spawn_pumps(
        &self,
        socket_events: tokio::sync::broadcast::Receiver<SocketEvent>,
        admin_events: tokio::sync::broadcast::Receiver<SocketEvent>,
    ) {
        let mut tasks = self.tasks.lock();

        // Signaling pump: session bring-up on open, reply correlation and
        // event forwarding on traffic.
        {
            let inner = self.inner.clone();
            let mut rx = socket_events;
            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(SocketEvent::Open) => {
                            // Bring-up awaits replies routed by this task, so
                            // it runs on its own.
                            let inner = inner.clone();
                            tokio::spawn(async move { bring_up(inner).await });
                        }
                        Ok(SocketEvent::Message(text)) => inner.on_signaling_message(&text),
                        Ok(SocketEvent::Closed) => inner.on_signaling_closed(),
                        Ok(SocketEvent::Error(err)) => {
                            warn!(instance = %inner.config.server_name, "socket error: {err}");
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                instance = %inner.config.server_name,
                                "signaling pump lagged, {missed} events dropped"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Admin pump: correlation only, plus the connected flag the bring-up
        // chain waits on.
        {
            let inner = self.inner.clone();
            let mut rx = admin_events;
            tasks.push(tokio::spawn(async move {
                loop {
                    match rx.recv().await {
                        Ok(SocketEvent::Open) => {
                            let _ = inner.admin_connected.send_replace(true);
                        }
                        Ok(SocketEvent::Message(text)) => inner.on_admin_message(&text),
                        Ok(SocketEvent::Closed) => {
                            let _ = inner.admin_connected.send_replace(false);
                        }
                        Ok(SocketEvent::Error(err)) => {
                            debug!(instance = %inner.config.server_name, "admin socket error: {err}");
                        }
                        Err(RecvError::Lagged(missed)) => {
                            warn!(
                                instance = %inner.config.server_name,
                                "admin pump lagged, {missed} events dropped"
                            );
                        }
                        Err(RecvError::Closed) => break,
                    }
                }
            }));
        }

        // Keepalive: the backend expires sessions that miss these.
        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(inner.config.keepalive_interval());
                loop {
                    ticker.tick().await;
                    if !inner.connected.load(Ordering::SeqCst) {
                        continue;
                    }
                    if let Err(err) = inner.keepalive().await {
                        warn!(instance = %inner.config.server_name, "keepalive failed: {err}");
                    }
                }
            }));
        }

        // Usage poll: refreshes instance-level stats over the admin channel.
        {
            let inner = self.inner.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = interval(inner.config.poll_interval());
                loop {
                    ticker.tick().await;
                    if !*inner.admin_connected.borrow() {
                        continue;
                    }
                    match inner.admin_info().await {
                        Ok(reply) => {
                            inner.stats.lock().server_info = Some(reply.raw);
                        }
                        Err(err) => {
                            debug!(instance = %inner.config.server_name, "usage poll failed: {err}");
                        }
                    }
                }
            }));
        }
    }

    pub fn id(&self) -> &str {
        &self.inner.config.server_name
    }

    pub fn connected(&self) -> bool {
        self.inner.connected.load(Ordering::SeqCst)
    }

    pub fn session_id(&self) -> Option<u64> {
        *self.inner.session_id.lock()
    }

    pub fn local_handle(&self) -> Option<u64> {
        *self.inner.local_handle.lock()
    }

    pub fn is_local_handle(&self, handle_id: u64) -> bool {
        self.local_handle() == Some(handle_id)
    }

    pub fn owner_of(&self, handle_id: u64) -> Option<String> {
        self.inner.handles.lock().get(&handle_id).cloned()
    }

    pub fn handles_for(&self, user_id: &str) -> Vec<u64> {
        self.inner
            .handles
            .lock()
            .iter()
            .filter(|(_, owner)| owner.as_str() == user_id)
            .map(|(handle, _)| *handle)
            .collect()
    }

    pub fn stats(&self) -> InstanceStats {
        self.inner.stats.lock().clone()
    }

    pub fn record_active_handles(&self, count: usize) {
        self.inner.stats.lock().active_handles = count;
    }

    /// Allocate a handle; when a user is given, the handle is recorded as
    /// owned by them.
    pub async fn attach(&self, user_id: Option<&str>) -> Result<u64, TransactionError> {
        self.inner.attach_handle(user_id).await
    }

    pub async fn detach(&self, handle_id: u64) -> Result<Reply, TransactionError> {
        let reply = self
            .inner
            .transaction(json!({ "janus": "detach", "handle_id": handle_id }))
            .await?;
        self.inner.handles.lock().remove(&handle_id);
        Ok(reply)
    }

    pub async fn join(&self, params: JoinParams) -> Result<Reply, TransactionError> {
        let mut body = json!({
            "request": "join",
            "room": params.room,
            "ptype": params.ptype,
            "offer_audio": true,
            "offer_video": true,
            "audio": true,
            "video": true,
        });
        if params.ptype == ParticipantType::Publisher {
            set_opt(&mut body, "id", &params.user_id);
        }
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "secret", &params.secret);
        set_opt(&mut body, "audiocodec", &params.audiocodec);
        set_opt(&mut body, "videocodec", &params.videocodec);
        set_opt(&mut body, "feed", &params.feed);
        set_opt(&mut body, "display", &params.display);

        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": params.handle_id,
                "body": body,
            }))
            .await
    }

    pub async fn join_and_configure(
        &self,
        params: JoinParams,
        jsep: Value,
    ) -> Result<Reply, TransactionError> {
        let mut body = json!({
            "request": "joinandconfigure",
            "room": params.room,
            "ptype": params.ptype,
            "audiocodec": params.audiocodec.as_deref().unwrap_or("opus"),
            "videocodec": params.videocodec.as_deref().unwrap_or("vp8"),
            "offer_audio": true,
            "offer_video": true,
            "audio": true,
            "video": true,
        });
        if params.ptype == ParticipantType::Publisher {
            set_opt(&mut body, "id", &params.user_id);
        }
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "secret", &params.secret);
        set_opt(&mut body, "feed", &params.feed);

        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": params.handle_id,
                "jsep": jsep,
                "body": body,
            }))
            .await
    }

    pub async fn configure(&self, params: ConfigureParams) -> Result<Reply, TransactionError> {
        let mut body = json!({
            "request": "configure",
            "room": params.room,
            "ptype": params.ptype,
        });
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "secret", &params.secret);
        set_opt(&mut body, "audiocodec", &params.audiocodec);
        set_opt(&mut body, "videocodec", &params.videocodec);
        if let Some(audio) = params.audio {
            body["offer_audio"] = json!(audio);
            body["audio"] = json!(audio);
        }
        if let Some(video) = params.video {
            body["offer_video"] = json!(video);
            body["video"] = json!(video);
        }

        let mut request = json!({
            "janus": "message",
            "handle_id": params.handle_id,
            "body": body,
        });
        if let Some(jsep) = params.jsep {
            request["jsep"] = jsep;
        }
        self.inner.transaction(request).await
    }

    pub async fn publish(&self, params: PublishParams) -> Result<Reply, TransactionError> {
        let mut body = json!({
            "request": "publish",
            "room": params.room,
            "audiocodec": params.audiocodec.as_deref().unwrap_or("opus"),
            "videocodec": params.videocodec.as_deref().unwrap_or("vp8"),
            "offer_audio": true,
            "offer_video": true,
            "audio": true,
            "video": true,
        });
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "secret", &params.secret);

        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": params.handle_id,
                "jsep": params.jsep,
                "body": body,
            }))
            .await
    }

    pub async fn unpublish(
        &self,
        handle_id: u64,
        pin: Option<&str>,
        secret: Option<&str>,
    ) -> Result<Reply, TransactionError> {
        let mut body = json!({ "request": "unpublish" });
        set_opt(&mut body, "pin", &pin);
        set_opt(&mut body, "secret", &secret);
        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": body,
            }))
            .await
    }

    pub async fn start(&self, params: StartParams) -> Result<Reply, TransactionError> {
        let mut body = json!({ "request": "start", "room": params.room });
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "secret", &params.secret);
        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": params.handle_id,
                "jsep": params.answer,
                "body": body,
            }))
            .await
    }

    pub async fn leave(&self, handle_id: u64) -> Result<Reply, TransactionError> {
        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": { "request": "leave" },
            }))
            .await
    }

    pub async fn hangup(&self, handle_id: u64) -> Result<Reply, TransactionError> {
        self.inner
            .transaction(json!({ "janus": "hangup", "handle_id": handle_id }))
            .await
    }

    /// Relay one ICE candidate; completes on the ack.
    pub async fn trickle(&self, handle_id: u64, candidate: Value) -> Result<Reply, TransactionError> {
        self.inner
            .transaction(json!({
                "janus": "trickle",
                "handle_id": handle_id,
                "candidate": candidate,
            }))
            .await
    }

    pub async fn create_room(&self, params: CreateRoomParams) -> Result<Reply, TransactionError> {
        let handle_id = self.local_handle_or_err()?;
        let mut body = json!({
            "request": "create",
            "room": params.room,
            "permanent": false,
            "is_private": false,
            "admin_key": self.inner.config.admin_key,
            "publishers": MAX_PUBLISHERS,
        });
        set_opt(&mut body, "description", &params.description);
        set_opt(&mut body, "secret", &params.secret);
        set_opt(&mut body, "pin", &params.pin);
        set_opt(&mut body, "bitrate", &params.bitrate);
        set_opt(&mut body, "bitrate_cap", &params.bitrate_cap);
        set_opt(&mut body, "fir_freq", &params.fir_freq);
        set_opt(&mut body, "videocodec", &params.videocodec);
        set_opt(&mut body, "vp9_profile", &params.vp9_profile);

        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": body,
            }))
            .await
    }

    pub async fn edit_room(&self, params: EditRoomParams) -> Result<Reply, TransactionError> {
        let mut body = json!({ "request": "edit", "room": params.room });
        set_opt(&mut body, "secret", &params.secret);
        set_opt(&mut body, "new_secret", &params.new_secret);
        set_opt(&mut body, "new_pin", &params.new_pin);
        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": params.handle_id,
                "body": body,
            }))
            .await
    }

    pub async fn destroy_room(
        &self,
        handle_id: u64,
        room: &str,
        secret: Option<&str>,
    ) -> Result<Reply, TransactionError> {
        let mut body = json!({
            "request": "destroy",
            "room": room,
            "permanent": true,
            "admin_key": self.inner.config.admin_key,
        });
        set_opt(&mut body, "secret", &secret);
        self.inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": body,
            }))
            .await
    }

    pub async fn list_rooms(&self) -> Result<Vec<Value>, TransactionError> {
        let handle_id = self.local_handle_or_err()?;
        let reply = self
            .inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": { "request": "list" },
            }))
            .await?;
        Ok(reply
            .envelope
            .plugin_data()
            .and_then(|data| data.get("list"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn list_participants(&self, room: &str) -> Result<Vec<Value>, TransactionError> {
        let handle_id = self.local_handle_or_err()?;
        let reply = self
            .inner
            .transaction(json!({
                "janus": "message",
                "handle_id": handle_id,
                "body": { "request": "listparticipants", "room": room },
            }))
            .await?;
        Ok(reply
            .envelope
            .plugin_data()
            .and_then(|data| data.get("participants"))
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default())
    }

    pub async fn get_status(&self) -> Result<Reply, TransactionError> {
        self.inner.transaction(json!({ "janus": "get_status" })).await
    }

    /// Admin channel: every handle currently open on our session.
    pub async fn list_handles(&self) -> Result<Vec<u64>, TransactionError> {
        let mut request = json!({ "janus": "list_handles" });
        if let Some(session_id) = self.session_id() {
            request["session_id"] = json!(session_id);
        }
        let reply = self.inner.admin_transaction(request).await?;
        Ok(reply
            .raw
            .get("handles")
            .and_then(Value::as_array)
            .map(|handles| handles.iter().filter_map(Value::as_u64).collect())
            .unwrap_or_default())
    }

    /// Admin channel: introspection detail for one handle.
    pub async fn handle_info(&self, handle_id: u64) -> Result<Value, TransactionError> {
        let mut request = json!({ "janus": "handle_info", "handle_id": handle_id });
        if let Some(session_id) = self.session_id() {
            request["session_id"] = json!(session_id);
        }
        let reply = self.inner.admin_transaction(request).await?;
        Ok(reply.raw.get("info").cloned().unwrap_or(Value::Null))
    }

    pub async fn admin_info(&self) -> Result<Reply, TransactionError> {
        self.inner.admin_info().await
    }

    /// Destroy the remote session and stop both channels for good.
    pub async fn disconnect(&self) {
        if self.inner.session_id.lock().is_some() {
            if let Err(err) = self.inner.transaction(json!({ "janus": "destroy" })).await {
                warn!(instance = %self.id(), "session destroy failed: {err}");
            }
        }
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.inner.session_id.lock() = None;
        *self.inner.local_handle.lock() = None;
        self.inner.connected.store(false, Ordering::SeqCst);
        self.inner.handles.lock().clear();
        self.inner.calls.lock().clear();
        self.inner.admin_calls.lock().clear();
        self.inner.admin_socket.close();
        self.inner.socket.close();
    }

    fn local_handle_or_err(&self) -> Result<u64, TransactionError> {
        self.local_handle().ok_or(TransactionError::NotConnected)
    }
}

impl Drop for BackendSession {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

async fn bring_up(inner: Arc<SessionInner>) {
    let result = inner.establish().await;
    match &result {
        Ok(()) => {
            inner.connected.store(true, Ordering::SeqCst);
            info!(instance = %inner.config.server_name, "backend session established");
            let _ = inner.events.send(BackendEvent::Connected {
                instance: inner.config.server_name.clone(),
            });
        }
        Err(err) => {
            warn!(instance = %inner.config.server_name, "session bring-up failed: {err}");
        }
    }
    if let Some(ready) = inner.connect_result.lock().take() {
        let _ = ready.send(result);
    }
}

impl SessionInner {
    /// create/claim -> attach bookkeeping handle -> admin channel up.
    async fn establish(&self) -> Result<(), TransactionError> {
        let known = *self.session_id.lock();
        let reply = match known {
            // A claim the backend rejects (expired session, restarted
            // backend) falls back to a fresh session.
            Some(session_id) => match self.claim_session(session_id).await {
                Ok(reply) => reply,
                Err(TransactionError::Backend { code, reason, .. }) => {
                    warn!(
                        instance = %self.config.server_name,
                        "claim of session {session_id} rejected ({code} {reason}), creating a new one"
                    );
                    *self.session_id.lock() = None;
                    self.create_session().await?
                }
                Err(err) => return Err(err),
            },
            None => self.create_session().await?,
        };
        if let Some(session_id) = reply.envelope.data_id() {
            *self.session_id.lock() = Some(session_id);
        }

        let handle_id = self.attach_handle(None).await?;
        *self.local_handle.lock() = Some(handle_id);
        debug!(instance = %self.config.server_name, handle_id, "bookkeeping handle attached");

        self.wait_admin().await
    }

    async fn wait_admin(&self) -> Result<(), TransactionError> {
        let mut rx = self.admin_connected.subscribe();
        let result = match timeout(ADMIN_CONNECT_WAIT, rx.wait_for(|connected| *connected)).await {
            Ok(Ok(_)) => Ok(()),
            Ok(Err(_)) => Err(TransactionError::ChannelClosed),
            Err(_) => Err(TransactionError::Timeout {
                verb: "admin-connect".to_string(),
            }),
        };
        result
    }

    async fn create_session(&self) -> Result<Reply, TransactionError> {
        self.transaction(json!({ "janus": "create" })).await
    }

    async fn claim_session(&self, session_id: u64) -> Result<Reply, TransactionError> {
        self.transaction(json!({ "janus": "claim", "session_id": session_id }))
            .await
    }

    async fn attach_handle(&self, user_id: Option<&str>) -> Result<u64, TransactionError> {
        let reply = self
            .transaction(json!({
                "janus": "attach",
                "plugin": VIDEOROOM_PLUGIN,
                "opaque_id": Uuid::new_v4().to_string(),
            }))
            .await?;
        let handle_id = reply.envelope.data_id().ok_or(TransactionError::Backend {
            verb: "attach".to_string(),
            code: 0,
            reason: "attach reply carried no handle id".to_string(),
        })?;
        if let Some(user_id) = user_id {
            self.handles.lock().insert(handle_id, user_id.to_string());
        }
        Ok(handle_id)
    }

    async fn keepalive(&self) -> Result<(), TransactionError> {
        self.transaction(json!({ "janus": "keepalive" })).await.map(|_| ())
    }

    async fn admin_info(&self) -> Result<Reply, TransactionError> {
        self.admin_transaction(json!({ "janus": "info" })).await
    }

    async fn transaction(&self, mut request: Value) -> Result<Reply, TransactionError> {
        if request.get("session_id").is_none() {
            if let Some(session_id) = *self.session_id.lock() {
                request["session_id"] = json!(session_id);
            }
        }
        self.run(&self.socket, &self.calls, request).await
    }

    async fn admin_transaction(&self, mut request: Value) -> Result<Reply, TransactionError> {
        request["admin_secret"] = json!(self.config.admin_secret);
        self.run(&self.admin_socket, &self.admin_calls, request).await
    }

    /// Correlated send: record the pending entry, write the frame, wait for
    /// the matching reply or the deadline, whichever comes first.
    async fn run(
        &self,
        socket: &ResilientSocket,
        table: &Mutex<HashMap<String, PendingCall>>,
        mut request: Value,
    ) -> Result<Reply, TransactionError> {
        let verb = request
            .get("janus")
            .and_then(Value::as_str)
            .unwrap_or("message")
            .to_string();
        let id = Uuid::new_v4().to_string();
        request["transaction"] = json!(id);
        let payload = serde_json::to_string(&request)?;

        let (reply_tx, reply_rx) = oneshot::channel();
        table.lock().insert(
            id.clone(),
            PendingCall {
                ack_completes: matches!(verb.as_str(), "keepalive" | "trickle"),
                reply: reply_tx,
            },
        );
        socket.send(payload);

        let reply = match self.config.transaction_timeout() {
            Some(deadline) => match timeout(deadline, reply_rx).await {
                Ok(Ok(reply)) => reply,
                Ok(Err(_)) => return Err(TransactionError::ChannelClosed),
                Err(_) => {
                    table.lock().remove(&id);
                    return Err(TransactionError::Timeout { verb });
                }
            },
            None => reply_rx.await.map_err(|_| TransactionError::ChannelClosed)?,
        };

        if let Some((code, reason)) = reply.envelope.failure() {
            return Err(TransactionError::Backend { verb, code, reason });
        }
        Ok(reply)
    }

    fn on_signaling_message(&self, text: &str) {
        let Some((envelope, raw)) = Envelope::parse(text) else {
            debug!(instance = %self.config.server_name, "dropping unparseable frame");
            return;
        };
        complete_call(&self.calls, &envelope, &raw);
        let _ = self.events.send(BackendEvent::Message {
            instance: self.config.server_name.clone(),
            envelope,
            raw,
        });
    }

    fn on_admin_message(&self, text: &str) {
        let Some((envelope, raw)) = Envelope::parse(text) else {
            debug!(instance = %self.config.server_name, "dropping unparseable admin frame");
            return;
        };
        complete_call(&self.admin_calls, &envelope, &raw);
    }

    fn on_signaling_closed(&self) {
        let was_connected = self.connected.swap(false, Ordering::SeqCst);
        // Dropping the completion handles wakes every in-flight caller with a
        // link-lost rejection.
        self.calls.lock().clear();
        if was_connected {
            info!(instance = %self.config.server_name, "backend link lost");
            let _ = self.events.send(BackendEvent::Disconnected {
                instance: self.config.server_name.clone(),
            });
        }
    }
}

/// Route one inbound message to its pending entry, if completion applies.
/// Late and duplicate replies find no entry and are ignored.
fn complete_call(
    table: &Mutex<HashMap<String, PendingCall>>,
    envelope: &Envelope,
    raw: &Value,
) -> bool {
    let Some(id) = envelope.transaction.as_deref() else {
        return false;
    };
    let mut calls = table.lock();
    let done = match calls.get(id) {
        Some(pending) => pending.ack_completes || envelope.janus != Verb::Ack,
        None => return false,
    };
    if !done {
        return false;
    }
    if let Some(pending) = calls.remove(id) {
        let _ = pending.reply.send(Reply {
            envelope: envelope.clone(),
            raw: raw.clone(),
        });
    }
    true
}

fn set_opt<T: Serialize>(body: &mut Value, key: &str, value: &Option<T>) {
    if let Some(value) = value {
        body[key] = json!(value);
    }
}
