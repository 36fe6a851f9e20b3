//! Client-facing signaling protocol: one JSON object per WebSocket frame,
//! `{ type, transaction, load }` in both directions. Inbound frames are
//! validated into [`ClientRequest`] at the boundary; unknown types map to an
//! explicit [`ClientRequest::Unknown`] instead of silently proceeding.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;

use crate::backend::ParticipantType;

/// First frame sent to every accepted connection.
pub const GREETING: &str = "connected";

/// Raw inbound frame, before the type tag is interpreted.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientEnvelope {
    #[serde(rename = "type")]
    pub kind: String,
    /// Opaque echo value; returned untouched on the response.
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub load: Option<Value>,
}

/// Outbound frame for request replies and error reports.
#[derive(Debug, Clone, Serialize)]
pub struct ClientResponse {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub transaction: Option<String>,
    pub load: Value,
}

impl ClientResponse {
    pub fn new(kind: impl Into<String>, load: Value) -> Self {
        Self {
            kind: kind.into(),
            transaction: None,
            load,
        }
    }

    pub fn error(message: impl Into<String>, transaction: Option<String>) -> Self {
        Self {
            kind: "error".to_string(),
            transaction,
            load: json!(message.into()),
        }
    }
}

#[derive(Debug, Error)]
#[error("malformed {kind} load: {detail}")]
pub struct BadLoad {
    pub kind: String,
    pub detail: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CreateRoomLoad {
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub bitrate_cap: Option<bool>,
    #[serde(default)]
    pub fir_freq: Option<u64>,
    #[serde(default)]
    pub videocodec: Option<String>,
    #[serde(default)]
    pub vp9_profile: Option<String>,
}

/// Operations addressed at a room as a whole.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomLoad {
    pub room_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinLoad {
    pub room_id: String,
    pub handle_id: u64,
    #[serde(default)]
    pub ptype: ParticipantType,
    #[serde(default)]
    pub feed: Option<u64>,
    #[serde(default)]
    pub display: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct JoinAndConfigureLoad {
    pub room_id: String,
    pub handle_id: u64,
    #[serde(default)]
    pub ptype: ParticipantType,
    pub jsep: Value,
    #[serde(default)]
    pub feed: Option<u64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ConfigureLoad {
    pub room_id: String,
    pub handle_id: u64,
    #[serde(default)]
    pub ptype: ParticipantType,
    #[serde(default)]
    pub jsep: Option<Value>,
    #[serde(default)]
    pub audio: Option<bool>,
    #[serde(default)]
    pub video: Option<bool>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PublishLoad {
    pub room_id: String,
    pub handle_id: u64,
    pub jsep: Value,
}

/// Operations addressed at one handle in a room.
#[derive(Debug, Clone, Deserialize)]
pub struct RoomHandleLoad {
    pub room_id: String,
    pub handle_id: u64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct StartLoad {
    pub room_id: String,
    pub handle_id: u64,
    pub answer: Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CandidateLoad {
    pub room_id: String,
    pub handle_id: u64,
    pub candidate: Value,
}

/// Every operation a client can request.
#[derive(Debug, Clone)]
pub enum ClientRequest {
    Keepalive,
    CreateRoom(CreateRoomLoad),
    DestroyRoom(RoomLoad),
    Attach(RoomLoad),
    Rooms,
    Join(JoinLoad),
    Configure(ConfigureLoad),
    JoinAndConfigure(JoinAndConfigureLoad),
    Publish(PublishLoad),
    Unpublish(RoomHandleLoad),
    Start(StartLoad),
    Leave(RoomHandleLoad),
    Hangup(RoomHandleLoad),
    Detach(RoomHandleLoad),
    Candidate(CandidateLoad),
    Unknown,
}

impl ClientRequest {
    pub fn parse(envelope: &ClientEnvelope) -> Result<Self, BadLoad> {
        let load = envelope.load.clone().unwrap_or(Value::Null);
        Ok(match envelope.kind.as_str() {
            "keepalive" => Self::Keepalive,
            "create_room" => Self::CreateRoom(typed(&envelope.kind, load)?),
            "destroy_room" => Self::DestroyRoom(typed(&envelope.kind, load)?),
            "attach" => Self::Attach(typed(&envelope.kind, load)?),
            "rooms" => Self::Rooms,
            "join" => Self::Join(typed(&envelope.kind, load)?),
            "configure" => Self::Configure(typed(&envelope.kind, load)?),
            "joinandconfigure" => Self::JoinAndConfigure(typed(&envelope.kind, load)?),
            "publish" => Self::Publish(typed(&envelope.kind, load)?),
            "unpublish" => Self::Unpublish(typed(&envelope.kind, load)?),
            "start" => Self::Start(typed(&envelope.kind, load)?),
            "leave" => Self::Leave(typed(&envelope.kind, load)?),
            "hangup" => Self::Hangup(typed(&envelope.kind, load)?),
            "detach" => Self::Detach(typed(&envelope.kind, load)?),
            "candidate" => Self::Candidate(typed(&envelope.kind, load)?),
            _ => Self::Unknown,
        })
    }
}

fn typed<T: DeserializeOwned>(kind: &str, load: Value) -> Result<T, BadLoad> {
    serde_json::from_value(load).map_err(|err| BadLoad {
        kind: kind.to_string(),
        detail: err.to_string(),
    })
}

// Backend-originated events pushed to the owning client, outside any
// request/reply exchange.

pub fn trickle_event(sender: u64, candidate: &Value) -> Value {
    json!({ "type": "trickle", "sender": sender, "data": candidate })
}

pub fn media_event(sender: u64, raw: &Value) -> Value {
    json!({
        "type": "media",
        "sender": sender,
        "data": {
            "type": raw.get("type").cloned().unwrap_or(Value::Null),
            "receiving": raw.get("receiving").cloned().unwrap_or(Value::Null),
        },
    })
}

pub fn leaving_event(sender: u64, leaving: &Value) -> Value {
    json!({ "type": "leaving", "data": { "leaving": leaving, "sender": sender } })
}

pub fn publishers_event(publishers: &Value) -> Value {
    json!({ "type": "publishers", "data": publishers })
}

pub fn internal_event(raw: &Value) -> Value {
    json!({ "type": "internal", "data": raw })
}
