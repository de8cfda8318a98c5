//! # chronos-core — Room coordination for broadcast timing sync
//!
//! Coordinates timing synchronization between League of Legends observer
//! clients and a producer during a live broadcast, over a shared pub/sub
//! broker.
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────┐      broker topics      ┌──────────────────┐
//! │ ProducerSession  │ ◄──── rooms/{R}/* ────► │ ObserverSession  │
//! │  RoomRegistry    │                         │  room mirror     │
//! │  PresenceTracker │                         │  PresenceTracker │
//! │  SyncCoordinator │                         │  LocalClient-    │
//! └────────┬─────────┘                         │  Bridge          │
//!          │                                   └────────┬─────────┘
//!          ▼                                            ▼
//!     Transport (seam)                           Replay API (seam)
//! ```
//!
//! The producer creates rooms, tracks membership, assigns the main
//! observer, and issues sync commands; observers join a room, mirror it,
//! and apply sync commands to the local game client. The two sides share
//! nothing but broker traffic.
//!
//! ## Modules
//!
//! - [`protocol`] — Wire records (JSON payloads, one schema for both sides)
//! - [`topics`] — Topic scheme, the wire contract
//! - [`room`] — Room codes and the producer-side registry
//! - [`presence`] — Membership, liveness, role tracking
//! - [`sync`] — The sync command state machine
//! - [`transport`] — Broker seam + in-process broker
//! - [`bridge`] — Local game client seam
//! - [`producer`] / [`observer`] — The two session roles

pub mod bridge;
pub mod observer;
pub mod presence;
pub mod producer;
pub mod protocol;
pub mod room;
pub mod sync;
pub mod topics;
pub mod transport;

// Re-exports for convenience
pub use bridge::{BridgeError, LocalClientBridge};
pub use observer::{JoinError, ObserverConfig, ObserverEvent, ObserverSession};
pub use presence::{
    Liveness, Member, PresenceTracker, PresenceTransition, RoleChange, RoleError,
};
pub use producer::{ProducerConfig, ProducerError, ProducerEvent, ProducerSession};
pub use protocol::{
    AckOutcome, MemberId, MemberRole, ProtocolError, RoomMessage, TargetScope,
};
pub use room::{RegistryError, RoomId, RoomIdError, RoomRegistry};
pub use sync::{
    AckDisposition, CancelReason, MemberOutcome, SyncCoordinator, SyncDisposition, SyncReport,
};
pub use topics::{parse_topic, room_pattern, topic_for, Purpose};
pub use transport::{Envelope, MemoryBroker, MemoryTransport, Transport, TransportError};
