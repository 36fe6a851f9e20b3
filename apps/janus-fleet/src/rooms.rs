//! Reconciled room state: the merged per-room view, the merge rules, and the
//! file-backed store the table is persisted to.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs;
use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// One room as the gateway sees it: authoritative listing fields from the
/// owning backend, plus the secret/pin only the gateway knows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomContext {
    pub room_id: String,
    /// Identity of the backend that owns this room.
    pub instance_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pin: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pin_required: Option<bool>,
    #[serde(default)]
    pub max_publishers: Option<u64>,
    #[serde(default)]
    pub bitrate: Option<u64>,
    #[serde(default)]
    pub fir_freq: Option<u64>,
    #[serde(default)]
    pub audiocodec: Option<String>,
    #[serde(default)]
    pub videocodec: Option<String>,
    #[serde(default)]
    pub record: Option<bool>,
    #[serde(default)]
    pub num_participants: Option<u64>,
    #[serde(default)]
    pub participants: Vec<Value>,
}

/// Subset of a videoroom `list` entry the gateway keeps.
#[derive(Debug, Default, Deserialize)]
struct ListingFields {
    description: Option<String>,
    pin_required: Option<bool>,
    max_publishers: Option<u64>,
    bitrate: Option<u64>,
    fir_freq: Option<u64>,
    audiocodec: Option<String>,
    videocodec: Option<String>,
    record: Option<bool>,
    num_participants: Option<u64>,
}

impl RoomContext {
    /// Build a record from one backend listing entry. Secret and pin stay
    /// empty here; the merge carries them forward from the previous table.
    pub fn from_listing(
        room_id: &str,
        instance_id: &str,
        listing: &Value,
        participants: Vec<Value>,
    ) -> Self {
        let fields: ListingFields = serde_json::from_value(listing.clone()).unwrap_or_default();
        Self {
            room_id: room_id.to_string(),
            instance_id: instance_id.to_string(),
            secret: None,
            pin: None,
            description: fields.description,
            pin_required: fields.pin_required,
            max_publishers: fields.max_publishers,
            bitrate: fields.bitrate,
            fir_freq: fields.fir_freq,
            audiocodec: fields.audiocodec,
            videocodec: fields.videocodec,
            record: fields.record,
            num_participants: fields.num_participants,
            participants,
        }
    }

    /// Record for a room this gateway just created. Listing fields arrive on
    /// the next reconciliation pass.
    pub fn created(
        room_id: &str,
        instance_id: &str,
        description: Option<String>,
        secret: String,
        pin: String,
    ) -> Self {
        Self {
            room_id: room_id.to_string(),
            instance_id: instance_id.to_string(),
            secret: Some(secret),
            pin: Some(pin),
            description,
            pin_required: None,
            max_publishers: None,
            bitrate: None,
            fir_freq: None,
            audiocodec: None,
            videocodec: None,
            record: None,
            num_participants: None,
            participants: Vec::new(),
        }
    }

    /// Copy safe to hand to clients: no secret, no pin.
    pub fn public(&self) -> Self {
        let mut room = self.clone();
        room.secret = None;
        room.pin = None;
        room
    }
}

/// Room ids arrive as strings or numbers depending on backend configuration;
/// normalize both to a string key.
pub fn room_id_string(value: Option<&Value>) -> Option<String> {
    match value? {
        Value::String(id) => Some(id.clone()),
        Value::Number(id) => Some(id.to_string()),
        _ => None,
    }
}

/// Merge one reconciliation pass into a fresh table.
///
/// Secrets and pins are carried forward from `previous` (the backend listing
/// never returns them); the previous in-memory value wins over anything
/// older. A room id reported by two different backends is ambiguous and is
/// dropped from the merged view entirely.
pub fn merge_rooms(
    previous: &HashMap<String, RoomContext>,
    discovered: Vec<RoomContext>,
) -> HashMap<String, RoomContext> {
    let mut merged: HashMap<String, RoomContext> = HashMap::new();
    let mut collided: HashSet<String> = HashSet::new();

    for mut room in discovered {
        if collided.contains(&room.room_id) {
            continue;
        }
        if let Some(existing) = merged.get(&room.room_id) {
            if existing.instance_id != room.instance_id {
                collided.insert(room.room_id.clone());
                merged.remove(&room.room_id);
            }
            continue;
        }
        if let Some(prior) = previous.get(&room.room_id) {
            if room.secret.is_none() {
                room.secret = prior.secret.clone();
            }
            if room.pin.is_none() {
                room.pin = prior.pin.clone();
            }
        }
        merged.insert(room.room_id.clone(), room);
    }

    merged
}

/// Whole-file JSON store for the room table, rewritten wholesale on change.
#[derive(Debug, Clone)]
pub struct RoomStore {
    path: PathBuf,
}

impl RoomStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &std::path::Path {
        &self.path
    }

    /// Missing file reads as an empty table.
    pub fn load(&self) -> anyhow::Result<HashMap<String, RoomContext>> {
        if !self.path.exists() {
            return Ok(HashMap::new());
        }
        let text = fs::read_to_string(&self.path)
            .with_context(|| format!("reading room state {}", self.path.display()))?;
        serde_json::from_str(&text)
            .with_context(|| format!("parsing room state {}", self.path.display()))
    }

    /// Serialization is key-ordered so identical tables produce identical
    /// bytes.
    pub fn save(&self, rooms: &HashMap<String, RoomContext>) -> anyhow::Result<()> {
        let ordered: BTreeMap<&String, &RoomContext> = rooms.iter().collect();
        let text = serde_json::to_string_pretty(&ordered)?;
        fs::write(&self.path, text)
            .with_context(|| format!("writing room state {}", self.path.display()))
    }
}
