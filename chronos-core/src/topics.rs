//! Broker topic scheme for room traffic.
//!
//! Topic grammar: `rooms/{R}/{purpose}` where `{R}` is the 5-character room
//! code and `{purpose}` is one of the fixed purpose set. This mapping is the
//! wire contract: producer and observer must agree on it byte for byte, so
//! it lives here and nowhere else.

use crate::room::RoomId;

/// Root segment of every room topic.
pub const TOPIC_ROOT: &str = "rooms";

/// The fixed set of message purposes, one broker topic each.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Purpose {
    Join,
    Leave,
    Heartbeat,
    SyncRequest,
    SyncAck,
    Role,
}

impl Purpose {
    /// All purposes, in topic-listing order.
    pub const ALL: [Purpose; 6] = [
        Purpose::Join,
        Purpose::Leave,
        Purpose::Heartbeat,
        Purpose::SyncRequest,
        Purpose::SyncAck,
        Purpose::Role,
    ];

    /// The topic leaf segment for this purpose.
    pub fn as_str(&self) -> &'static str {
        match self {
            Purpose::Join => "join",
            Purpose::Leave => "leave",
            Purpose::Heartbeat => "heartbeat",
            Purpose::SyncRequest => "sync-request",
            Purpose::SyncAck => "sync-ack",
            Purpose::Role => "role",
        }
    }

    /// Parse a topic leaf segment.
    pub fn from_segment(segment: &str) -> Option<Purpose> {
        Purpose::ALL.iter().copied().find(|p| p.as_str() == segment)
    }
}

impl std::fmt::Display for Purpose {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The topic a (room, purpose) pair publishes on.
pub fn topic_for(room: &RoomId, purpose: Purpose) -> String {
    format!("{TOPIC_ROOT}/{room}/{}", purpose.as_str())
}

/// Subscription pattern covering all of a room's traffic.
pub fn room_pattern(room: &RoomId) -> String {
    format!("{TOPIC_ROOT}/{room}/#")
}

/// Parse a topic back into its room and purpose.
///
/// Returns `None` for topics outside the room scheme; callers discard those
/// silently (a foreign topic is not an error).
pub fn parse_topic(topic: &str) -> Option<(RoomId, Purpose)> {
    let mut segments = topic.split('/');
    if segments.next()? != TOPIC_ROOT {
        return None;
    }
    let room = RoomId::parse(segments.next()?).ok()?;
    let purpose = Purpose::from_segment(segments.next()?)?;
    if segments.next().is_some() {
        return None;
    }
    Some((room, purpose))
}
