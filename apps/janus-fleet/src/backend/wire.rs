//! Janus wire-protocol envelopes, shared by the signaling and admin channels.
//!
//! Outbound requests are built as raw JSON (the body shapes are dictated by
//! the videoroom plugin); inbound traffic is validated into [`Envelope`] at
//! the boundary, keeping the raw value alongside for passthrough.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// The `janus` field of an inbound message. Unrecognized verbs collapse into
/// [`Verb::Other`] instead of failing the parse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Verb {
    Success,
    Error,
    Ack,
    Event,
    Trickle,
    Media,
    Timeout,
    Webrtcup,
    Hangup,
    Detached,
    Slowlink,
    #[serde(other)]
    Other,
}

/// Top-level error object of an `error` reply.
#[derive(Debug, Clone, Deserialize)]
pub struct WireError {
    pub code: i64,
    #[serde(default)]
    pub reason: String,
}

/// Plugin envelope; `data.error`/`data.error_code` signal plugin-level
/// failure even inside an outer `success`.
#[derive(Debug, Clone, Deserialize)]
pub struct PluginData {
    #[serde(default)]
    pub plugin: Option<String>,
    #[serde(default)]
    pub data: Value,
}

/// One inbound backend message.
#[derive(Debug, Clone, Deserialize)]
pub struct Envelope {
    pub janus: Verb,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub session_id: Option<u64>,
    #[serde(default)]
    pub sender: Option<u64>,
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub error: Option<WireError>,
    #[serde(default)]
    pub plugindata: Option<PluginData>,
    #[serde(default)]
    pub jsep: Option<Value>,
    #[serde(default)]
    pub candidate: Option<Value>,
}

impl Envelope {
    /// Parse a text frame, keeping the raw value for passthrough.
    pub fn parse(text: &str) -> Option<(Envelope, Value)> {
        let raw: Value = serde_json::from_str(text).ok()?;
        let envelope: Envelope = serde_json::from_value(raw.clone()).ok()?;
        Some((envelope, raw))
    }

    /// `data.id` of a `create`/`attach` style reply.
    pub fn data_id(&self) -> Option<u64> {
        self.data.as_ref()?.get("id")?.as_u64()
    }

    /// The `plugindata.data` payload, if any.
    pub fn plugin_data(&self) -> Option<&Value> {
        self.plugindata.as_ref().map(|plugin| &plugin.data)
    }

    /// Backend-reported failure carried by this message: a top-level `error`
    /// reply, a `timeout` verb, or a plugin-level error embedded in an
    /// otherwise successful envelope.
    pub fn failure(&self) -> Option<(i64, String)> {
        if self.janus == Verb::Error {
            return match &self.error {
                Some(err) => Some((err.code, err.reason.clone())),
                None => Some((0, "backend error".to_string())),
            };
        }
        if let Some(data) = self.plugin_data() {
            if let Some(message) = data.get("error").and_then(Value::as_str) {
                let code = data.get("error_code").and_then(Value::as_i64).unwrap_or(0);
                return Some((code, message.to_string()));
            }
        }
        if self.janus == Verb::Timeout {
            return Some((0, "session timed out".to_string()));
        }
        None
    }
}

/// A completed transaction: the validated envelope plus the raw reply for
/// callers that forward it verbatim.
#[derive(Debug, Clone)]
pub struct Reply {
    pub envelope: Envelope,
    pub raw: Value,
}

/// Publisher vs. subscriber leg, as carried in `ptype` fields on both the
/// client and backend protocols.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ParticipantType {
    #[default]
    Publisher,
    Subscriber,
}

/// Everything a transaction can fail with. Always delivered to the caller as
/// a rejected operation, never as a crash.
#[derive(Debug, Error)]
pub enum TransactionError {
    #[error("{verb} - timeout")]
    Timeout { verb: String },
    #[error("{verb} failed: {code} {reason}")]
    Backend {
        verb: String,
        code: i64,
        reason: String,
    },
    #[error("failed to encode request: {0}")]
    Encode(#[from] serde_json::Error),
    #[error("backend link lost before a reply arrived")]
    ChannelClosed,
    #[error("backend session is not connected")]
    NotConnected,
}

impl TransactionError {
    /// Backend error code, when the failure carries one.
    pub fn code(&self) -> Option<i64> {
        match self {
            TransactionError::Backend { code, .. } => Some(*code),
            _ => None,
        }
    }
}
