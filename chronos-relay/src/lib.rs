//! # chronos-relay — WebSocket fan-out for room coordination
//!
//! A minimal pub/sub relay so productions without an external broker can
//! still run: [`RelayServer`] fans published topics out to subscribed
//! connections, and [`RelayTransport`] plugs the relay into
//! `chronos-core`'s `Transport` seam.
//!
//! ```text
//! ProducerSession ── RelayTransport ──┐
//!                                     ├──▶ RelayServer (topic fan-out)
//! ObserverSession ── RelayTransport ──┘
//! ```
//!
//! The relay is deliberately dumb: no retained messages, no auth, no
//! persistence. Anything a real broker deployment needs beyond fan-out
//! belongs to that broker's configuration, not here.

pub mod client;
pub mod frame;
pub mod server;

// Re-exports for convenience
pub use client::RelayTransport;
pub use frame::{FrameError, RelayFrame};
pub use server::{RelayConfig, RelayServer, RelayStats};
