//! janus-fleet: a control-plane gateway that fronts a pool of independent
//! Janus SFU instances as one logical service.
//!
//! Rooms are load-balanced across backends, per-client signaling
//! transactions are proxied to the owning backend, and the room/participant
//! view is reconciled from authoritative per-backend listings on a timer.
//! Media, ICE and SDP payloads are forwarded untouched.

pub mod backend;
pub mod cli;
pub mod config;
pub mod gateway;
pub mod protocol;
pub mod rooms;
pub mod selection;
pub mod websocket;
