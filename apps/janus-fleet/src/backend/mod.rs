//! Everything that talks to a Janus instance: wire envelopes and the
//! session client that owns the signaling + admin channels.

pub mod session;
pub mod wire;

pub use session::{
    BackendEvent, BackendSession, ConfigureParams, CreateRoomParams, EditRoomParams,
    InstanceStats, JoinParams, PublishParams, StartParams,
};
pub use wire::{Envelope, ParticipantType, Reply, TransactionError, Verb};
