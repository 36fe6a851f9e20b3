//! The orchestrator: owns the backend pool, the reconciled room table, the
//! client connection registry, and the request-dispatch table. All state is
//! owned by the [`Gateway`] instance; nothing is process-global.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::Notify;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::{
    BackendEvent, BackendSession, ConfigureParams, CreateRoomParams, InstanceStats, JoinParams,
    PublishParams, StartParams, TransactionError, Verb,
};
use crate::backend::wire::Envelope;
use crate::config::Config;
use crate::protocol::{
    self, CandidateLoad, ClientEnvelope, ClientRequest, ClientResponse, ConfigureLoad,
    CreateRoomLoad, JoinAndConfigureLoad, JoinLoad, PublishLoad, RoomHandleLoad, RoomLoad,
    StartLoad,
};
use crate::rooms::{merge_rooms, room_id_string, RoomContext, RoomStore};
use crate::selection::{RoundRobin, SelectInstance};

/// Videoroom error code for a publisher that already has a live leg in the
/// room; repaired once by force-detaching the user's other handles.
const ALREADY_IN_ROOM: i64 = 436;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("duplicate backend identity {0}")]
    DuplicateInstance(String),
    #[error("no instance available")]
    NoInstanceAvailable,
    #[error("unknown room {0}")]
    UnknownRoom(String),
    #[error("instance {0} is not part of the pool")]
    UnknownInstance(String),
    #[error("missing {0}")]
    UnknownConnection(String),
    #[error(transparent)]
    BadLoad(#[from] protocol::BadLoad),
    #[error(transparent)]
    Transaction(#[from] TransactionError),
}

struct ClientConnection {
    tx: UnboundedSender<String>,
    shutdown: Arc<Notify>,
}

pub struct Gateway {
    config: Config,
    instances: RwLock<HashMap<String, Arc<BackendSession>>>,
    rooms: RwLock<HashMap<String, RoomContext>>,
    handle_infos: Mutex<HashMap<u64, Value>>,
    stats: Mutex<HashMap<String, InstanceStats>>,
    connections: DashMap<String, ClientConnection>,
    selector: Box<dyn SelectInstance>,
    store: RoomStore,
    tasks: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl std::fmt::Debug for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Gateway").finish_non_exhaustive()
    }
}

impl Gateway {
    /// Bring up the pool, run one reconciliation pass, and start the
    /// periodic sync + event pumps. The client acceptor is started
    /// separately (see [`crate::websocket::serve`]).
    pub async fn initialize(
        config: Config,
        selector: Option<Box<dyn SelectInstance>>,
    ) -> anyhow::Result<Arc<Self>> {
        let store = RoomStore::new(&config.state_path);
        let rooms = store.load()?;

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let mut instances: HashMap<String, Arc<BackendSession>> = HashMap::new();
        for backend in &config.backends {
            info!(instance = %backend.server_name, "connecting backend");
            match BackendSession::connect(backend.clone(), events_tx.clone()).await {
                Ok(session) => {
                    let id = session.id().to_string();
                    if instances.contains_key(&id) {
                        return Err(GatewayError::DuplicateInstance(id).into());
                    }
                    instances.insert(id, Arc::new(session));
                }
                Err(err) => {
                    warn!(instance = %backend.server_name, "backend connect failed: {err}");
                }
            }
        }

        let gateway = Arc::new(Self {
            config,
            instances: RwLock::new(instances),
            rooms: RwLock::new(rooms),
            handle_infos: Mutex::new(HashMap::new()),
            stats: Mutex::new(HashMap::new()),
            connections: DashMap::new(),
            selector: selector.unwrap_or_else(|| Box::new(RoundRobin::new())),
            store,
            tasks: Mutex::new(Vec::new()),
        });

        gateway.synchronize().await?;
        gateway.spawn_background(events_rx);
        Ok(gateway)
    }

    fn spawn_background(self: &Arc<Self>, mut events_rx: UnboundedReceiver<BackendEvent>) {
        let mut tasks = self.tasks.lock();

        {
            let gateway = self.clone();
            tasks.push(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(gateway.config.sync_interval());
                ticker.tick().await; // initialize() already ran the first pass
                loop {
                    ticker.tick().await;
                    if let Err(err) = gateway.synchronize().await {
                        warn!("synchronization failed: {err}");
                    }
                }
            }));
        }

        {
            let gateway = self.clone();
            tasks.push(tokio::spawn(async move {
                while let Some(event) = events_rx.recv().await {
                    gateway.on_backend_event(event);
                }
            }));
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Current reconciled room table (copies out).
    pub fn rooms_snapshot(&self) -> HashMap<String, RoomContext> {
        self.rooms.read().clone()
    }

    pub fn connected_instances(&self) -> usize {
        self.instances
            .read()
            .values()
            .filter(|instance| instance.connected())
            .count()
    }

    /// One reconciliation pass: rebuild the room table from authoritative
    /// per-backend listings, carrying gateway-only fields forward. The table
    /// is swapped and persisted only when the result differs.
    pub async fn synchronize(&self) -> Result<(), GatewayError> {
        let mut pool: Vec<Arc<BackendSession>> = self.instances.read().values().cloned().collect();
        pool.sort_by(|a, b| a.id().cmp(b.id()));

        let mut discovered = Vec::new();
        for instance in pool {
            if !instance.connected() {
                continue;
            }

            let rooms = instance.list_rooms().await?;
            let handles = instance.list_handles().await?;
            instance.record_active_handles(handles.len());
            for handle_id in handles {
                match instance.handle_info(handle_id).await {
                    Ok(info) if !info.is_null() => {
                        self.handle_infos.lock().insert(handle_id, info);
                    }
                    Ok(_) => {}
                    Err(err) => {
                        warn!(
                            instance = %instance.id(),
                            handle_id, "handle introspection failed: {err}"
                        );
                    }
                }
            }
            self.stats
                .lock()
                .insert(instance.id().to_string(), instance.stats());

            for listing in rooms {
                let Some(room_id) = room_id_string(listing.get("room")) else {
                    continue;
                };
                let participants = instance.list_participants(&room_id).await?;
                discovered.push(RoomContext::from_listing(
                    &room_id,
                    instance.id(),
                    &listing,
                    participants,
                ));
            }
        }

        let merged = {
            let rooms = self.rooms.read();
            merge_rooms(&rooms, discovered)
        };

        let changed = {
            let mut rooms = self.rooms.write();
            if *rooms == merged {
                false
            } else {
                *rooms = merged.clone();
                true
            }
        };
        if changed {
            self.persist(&merged);
        }
        Ok(())
    }

    fn persist(&self, rooms: &HashMap<String, RoomContext>) {
        if let Err(err) = self.store.save(rooms) {
            warn!("failed to persist room table: {err}");
        }
    }

    // ---- client connections -------------------------------------------------

    /// Register an accepted connection. A connection already registered for
    /// this user is superseded: its keepalive/reader is cancelled and (if
    /// configured) the user's handles are released before the new connection
    /// becomes usable.
    pub async fn register_connection(
        &self,
        user_id: &str,
        tx: UnboundedSender<String>,
    ) -> Arc<Notify> {
        if let Some((_, previous)) = self.connections.remove(user_id) {
            info!(%user_id, "connection already exists - superseding");
            previous.shutdown.notify_one();
            if self.config.detach_on_drop {
                self.detach_user_handles(user_id, None).await;
            }
        }
        let shutdown = Arc::new(Notify::new());
        self.connections.insert(
            user_id.to_string(),
            ClientConnection {
                tx,
                shutdown: shutdown.clone(),
            },
        );
        shutdown
    }

    /// Remove the registration, but only if it still belongs to the caller
    /// (a superseding connection may already have taken the slot). Returns
    /// whether the caller was still current.
    pub fn unregister_connection(&self, user_id: &str, shutdown: &Arc<Notify>) -> bool {
        let current = match self.connections.get(user_id) {
            Some(conn) => Arc::ptr_eq(&conn.shutdown, shutdown),
            None => false,
        };
        if current {
            self.connections.remove(user_id);
        }
        current
    }

    pub fn send_text(&self, user_id: &str, text: String) {
        if let Some(conn) = self.connections.get(user_id) {
            let _ = conn.tx.send(text);
        } else {
            debug!(%user_id, "connection already terminated");
        }
    }

    pub fn send_response(&self, user_id: &str, response: &ClientResponse) {
        match serde_json::to_string(response) {
            Ok(text) => self.send_text(user_id, text),
            Err(err) => warn!("failed to encode response: {err}"),
        }
    }

    fn notify(&self, user_id: &str, message: &Value) {
        match serde_json::to_string(message) {
            Ok(text) => self.send_text(user_id, text),
            Err(err) => warn!("failed to encode event: {err}"),
        }
    }

    /// Release every handle a user holds across the pool (leave + detach),
    /// optionally keeping one.
    pub async fn detach_user_handles(&self, user_id: &str, keep: Option<u64>) {
        let pool: Vec<Arc<BackendSession>> = self.instances.read().values().cloned().collect();
        for instance in pool {
            for handle_id in instance.handles_for(user_id) {
                if Some(handle_id) == keep {
                    continue;
                }
                if let Err(err) = instance.leave(handle_id).await {
                    warn!(instance = %instance.id(), handle_id, "leave failed: {err}");
                }
                if let Err(err) = instance.detach(handle_id).await {
                    warn!(instance = %instance.id(), handle_id, "detach failed: {err}");
                }
            }
        }
    }

    // ---- request dispatch ---------------------------------------------------

    /// Handle one inbound client message; the reply always echoes the
    /// request's transaction value, failures included.
    pub async fn process_request(&self, user_id: &str, envelope: ClientEnvelope) -> ClientResponse {
        let transaction = envelope.transaction.clone();
        let mut response = match self.dispatch(user_id, &envelope).await {
            Ok(response) => response,
            Err(err) => {
                warn!(%user_id, kind = %envelope.kind, "request failed: {err}");
                ClientResponse::error(err.to_string(), None)
            }
        };
        response.transaction = transaction;
        response
    }

    async fn dispatch(
        &self,
        user_id: &str,
        envelope: &ClientEnvelope,
    ) -> Result<ClientResponse, GatewayError> {
        match ClientRequest::parse(envelope)? {
            ClientRequest::Keepalive => self.on_keepalive(user_id),
            ClientRequest::CreateRoom(load) => self.on_create_room(load).await,
            ClientRequest::DestroyRoom(load) => self.on_destroy_room(load).await,
            ClientRequest::Attach(load) => self.on_attach(user_id, load).await,
            ClientRequest::Rooms => self.on_rooms().await,
            ClientRequest::Join(load) => self.on_join(user_id, load).await,
            ClientRequest::Configure(load) => self.on_configure(load).await,
            ClientRequest::JoinAndConfigure(load) => {
                self.on_join_and_configure(user_id, load).await
            }
            ClientRequest::Publish(load) => self.on_publish(load).await,
            ClientRequest::Unpublish(load) => self.on_unpublish(load).await,
            ClientRequest::Start(load) => self.on_start(load).await,
            ClientRequest::Leave(load) => self.on_leave(load).await,
            ClientRequest::Hangup(load) => self.on_hangup(load).await,
            ClientRequest::Detach(load) => self.on_detach(load).await,
            ClientRequest::Candidate(load) => self.on_candidate(load).await,
            ClientRequest::Unknown => Ok(ClientResponse::new("unknown", Value::Null)),
        }
    }

    fn on_keepalive(&self, user_id: &str) -> Result<ClientResponse, GatewayError> {
        if !self.connections.contains_key(user_id) {
            return Err(GatewayError::UnknownConnection(user_id.to_string()));
        }
        Ok(ClientResponse::new("keepalive", json!(user_id)))
    }

    async fn on_create_room(&self, load: CreateRoomLoad) -> Result<ClientResponse, GatewayError> {
        let instance = self.select_instance()?;
        let room_id = Uuid::new_v4().to_string();
        let secret = Uuid::new_v4().to_string();
        let pin = Uuid::new_v4().to_string();

        let reply = instance
            .create_room(CreateRoomParams {
                room: room_id.clone(),
                description: load.description.clone(),
                secret: Some(secret.clone()),
                pin: Some(pin.clone()),
                bitrate: load.bitrate,
                bitrate_cap: load.bitrate_cap,
                fir_freq: load.fir_freq,
                videocodec: load.videocodec.clone(),
                vp9_profile: load.vp9_profile.clone(),
            })
            .await?;

        let data = reply.envelope.plugin_data().cloned().unwrap_or(Value::Null);
        let room_id = room_id_string(data.get("room")).unwrap_or(room_id);
        let context = RoomContext::created(&room_id, instance.id(), load.description, secret, pin);

        let snapshot = {
            let mut rooms = self.rooms.write();
            rooms.insert(room_id.clone(), context.clone());
            rooms.clone()
        };
        self.persist(&snapshot);

        Ok(ClientResponse::new(
            "create_room",
            json!({ "context": context, "result": reply.raw }),
        ))
    }

    async fn on_destroy_room(&self, load: RoomLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let handle_id = instance
            .local_handle()
            .ok_or(TransactionError::NotConnected)?;
        let reply = instance
            .destroy_room(handle_id, &context.room_id, context.secret.as_deref())
            .await?;

        let snapshot = {
            let mut rooms = self.rooms.write();
            rooms.remove(&load.room_id);
            rooms.clone()
        };
        self.persist(&snapshot);

        Ok(ClientResponse::new("destroy_room", reply.raw))
    }

    async fn on_attach(
        &self,
        user_id: &str,
        load: RoomLoad,
    ) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let handle_id = instance.attach(Some(user_id)).await?;
        Ok(ClientResponse::new("attach", json!(handle_id)))
    }

    async fn on_rooms(&self) -> Result<ClientResponse, GatewayError> {
        self.synchronize().await?;
        let mut listing: Vec<RoomContext> =
            self.rooms.read().values().map(RoomContext::public).collect();
        listing.sort_by(|a, b| a.room_id.cmp(&b.room_id));
        Ok(ClientResponse::new("rooms", json!(listing)))
    }

    async fn on_join(&self, user_id: &str, load: JoinLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        info!(
            handle_id = load.handle_id,
            ptype = ?load.ptype,
            %user_id,
            room = %load.room_id,
            instance = %context.instance_id,
            "joining room"
        );
        let instance = self.instance_for(&context)?;
        let reply = instance
            .join(JoinParams {
                room: context.room_id.clone(),
                handle_id: load.handle_id,
                user_id: Some(user_id.to_string()),
                ptype: load.ptype,
                pin: context.pin.clone(),
                secret: context.secret.clone(),
                feed: load.feed,
                display: load.display.clone(),
                ..Default::default()
            })
            .await?;
        Ok(ClientResponse::new("join", reply.raw))
    }

    async fn on_configure(&self, load: ConfigureLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance
            .configure(ConfigureParams {
                room: context.room_id.clone(),
                handle_id: load.handle_id,
                ptype: load.ptype,
                pin: context.pin.clone(),
                secret: context.secret.clone(),
                jsep: load.jsep.clone(),
                audio: load.audio,
                video: load.video,
                ..Default::default()
            })
            .await?;
        Ok(ClientResponse::new(
            "configure",
            jsep_and_data(&reply.raw, reply.envelope.plugin_data()),
        ))
    }

    async fn on_join_and_configure(
        &self,
        user_id: &str,
        load: JoinAndConfigureLoad,
    ) -> Result<ClientResponse, GatewayError> {
        match self.join_and_configure_once(user_id, &load).await {
            Err(GatewayError::Transaction(err)) if err.code() == Some(ALREADY_IN_ROOM) => {
                info!(%user_id, "already in room - detaching conflicting handles and retrying");
                self.detach_user_handles(user_id, Some(load.handle_id)).await;
                self.join_and_configure_once(user_id, &load).await
            }
            result => result,
        }
    }

    async fn join_and_configure_once(
        &self,
        user_id: &str,
        load: &JoinAndConfigureLoad,
    ) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        info!(
            handle_id = load.handle_id,
            ptype = ?load.ptype,
            %user_id,
            room = %load.room_id,
            instance = %context.instance_id,
            "joining room (joinandconfigure)"
        );
        let instance = self.instance_for(&context)?;
        let reply = instance
            .join_and_configure(
                JoinParams {
                    room: context.room_id.clone(),
                    handle_id: load.handle_id,
                    user_id: Some(user_id.to_string()),
                    ptype: load.ptype,
                    pin: context.pin.clone(),
                    secret: context.secret.clone(),
                    feed: load.feed,
                    ..Default::default()
                },
                load.jsep.clone(),
            )
            .await?;
        Ok(ClientResponse::new(
            "joinandconfigure",
            jsep_and_data(&reply.raw, reply.envelope.plugin_data()),
        ))
    }

    async fn on_publish(&self, load: PublishLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance
            .publish(PublishParams {
                room: context.room_id.clone(),
                handle_id: load.handle_id,
                pin: context.pin.clone(),
                secret: context.secret.clone(),
                jsep: load.jsep.clone(),
                ..Default::default()
            })
            .await?;
        Ok(ClientResponse::new(
            "publish",
            jsep_and_data(&reply.raw, reply.envelope.plugin_data()),
        ))
    }

    async fn on_unpublish(&self, load: RoomHandleLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance
            .unpublish(
                load.handle_id,
                context.pin.as_deref(),
                context.secret.as_deref(),
            )
            .await?;
        Ok(ClientResponse::new("unpublish", reply.raw))
    }

    async fn on_start(&self, load: StartLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance
            .start(StartParams {
                room: context.room_id.clone(),
                handle_id: load.handle_id,
                pin: context.pin.clone(),
                secret: context.secret.clone(),
                answer: load.answer.clone(),
            })
            .await?;
        Ok(ClientResponse::new("start", reply.raw))
    }

    async fn on_leave(&self, load: RoomHandleLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance.leave(load.handle_id).await?;
        Ok(ClientResponse::new("leave", reply.raw))
    }

    async fn on_hangup(&self, load: RoomHandleLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance.hangup(load.handle_id).await?;
        Ok(ClientResponse::new("hangup", reply.raw))
    }

    async fn on_detach(&self, load: RoomHandleLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance.detach(load.handle_id).await?;
        Ok(ClientResponse::new("detach", reply.raw))
    }

    async fn on_candidate(&self, load: CandidateLoad) -> Result<ClientResponse, GatewayError> {
        let context = self.room_context(&load.room_id)?;
        let instance = self.instance_for(&context)?;
        let reply = instance
            .trickle(load.handle_id, load.candidate.clone())
            .await?;
        Ok(ClientResponse::new("trickle", reply.raw))
    }

    // ---- backend events -----------------------------------------------------

    fn on_backend_event(&self, event: BackendEvent) {
        match event {
            BackendEvent::Connected { instance } => {
                info!(%instance, "backend connected");
            }
            BackendEvent::Disconnected { instance } => {
                info!(%instance, "backend disconnected");
            }
            BackendEvent::Message {
                instance,
                envelope,
                raw,
            } => self.route_backend_message(&instance, envelope, raw),
        }
    }

    /// Attribute an asynchronous backend message to a user via the handle
    /// table and push the classified event to their connection.
    fn route_backend_message(&self, instance_id: &str, envelope: Envelope, raw: Value) {
        let Some(sender) = envelope.sender else {
            if envelope.janus != Verb::Ack {
                debug!(%instance_id, "backend message without sender");
            }
            return;
        };
        let Some(instance) = self.instances.read().get(instance_id).cloned() else {
            return;
        };
        let Some(user_id) = instance.owner_of(sender) else {
            if !instance.is_local_handle(sender) {
                debug!(%instance_id, sender, "dropping event for unattributed handle");
            }
            return;
        };

        let message = match envelope.janus {
            Verb::Trickle => {
                let candidate = envelope.candidate.clone().unwrap_or(Value::Null);
                protocol::trickle_event(sender, &candidate)
            }
            Verb::Media => protocol::media_event(sender, &raw),
            Verb::Event => {
                let data = envelope.plugin_data().cloned().unwrap_or(Value::Null);
                let videoroom = data
                    .get("videoroom")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                if let Some(leaving) = data.get("leaving").filter(|_| videoroom == "event") {
                    protocol::leaving_event(sender, leaving)
                } else if let Some(publishers) = data
                    .get("publishers")
                    .filter(|_| videoroom == "joined" || videoroom == "event")
                {
                    protocol::publishers_event(publishers)
                } else {
                    protocol::internal_event(&raw)
                }
            }
            _ => protocol::internal_event(&raw),
        };
        self.notify(&user_id, &message);
    }

    // ---- teardown -----------------------------------------------------------

    /// Stop the sync timer, disconnect every backend session, cancel all
    /// client timers, and clear the in-memory tables. The acceptor is closed
    /// by whoever owns its task.
    pub async fn terminate(&self) {
        info!("terminating gateway");
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }

        let snapshot = self.rooms.read().clone();
        self.persist(&snapshot);

        let pool: Vec<Arc<BackendSession>> = {
            let mut instances = self.instances.write();
            instances.drain().map(|(_, instance)| instance).collect()
        };
        for instance in pool {
            info!(instance = %instance.id(), "disconnecting instance");
            instance.disconnect().await;
        }

        for entry in self.connections.iter() {
            entry.value().shutdown.notify_one();
        }
        self.connections.clear();
        self.rooms.write().clear();
        self.handle_infos.lock().clear();
        self.stats.lock().clear();
    }

    // ---- lookups ------------------------------------------------------------

    fn room_context(&self, room_id: &str) -> Result<RoomContext, GatewayError> {
        self.rooms
            .read()
            .get(room_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownRoom(room_id.to_string()))
    }

    fn instance_for(&self, context: &RoomContext) -> Result<Arc<BackendSession>, GatewayError> {
        self.instances
            .read()
            .get(&context.instance_id)
            .cloned()
            .ok_or_else(|| GatewayError::UnknownInstance(context.instance_id.clone()))
    }

    fn select_instance(&self) -> Result<Arc<BackendSession>, GatewayError> {
        let mut pool: Vec<Arc<BackendSession>> = self
            .instances
            .read()
            .values()
            .filter(|instance| instance.connected())
            .cloned()
            .collect();
        pool.sort_by(|a, b| a.id().cmp(b.id()));
        self.selector
            .select(&pool)
            .ok_or(GatewayError::NoInstanceAvailable)
    }
}

/// Response shape for media negotiation replies: the backend's JSEP answer
/// (if any) plus the plugin payload.
fn jsep_and_data(raw: &Value, plugin_data: Option<&Value>) -> Value {
    json!({
        "jsep": raw.get("jsep").cloned().unwrap_or(Value::Null),
        "data": plugin_data.cloned().unwrap_or(Value::Null),
    })
}
