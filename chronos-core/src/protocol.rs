//! Wire records for room coordination traffic.
//!
//! Each broker topic carries exactly one record type (see [`crate::topics`]),
//! so the payload itself is untagged. Payloads are JSON — a single
//! self-describing schema shared verbatim by producer and observer:
//!
//! ```text
//! rooms/{R}/join          {"memberId": …, "displayLabel": …}
//! rooms/{R}/leave         {"memberId": …}
//! rooms/{R}/heartbeat     {"memberId": …, "timestamp": …}
//! rooms/{R}/sync-request  {"sequence": …, "targetScope": …}
//! rooms/{R}/sync-ack      {"sequence": …, "memberId": …, "outcome": …, "reason"?: …}
//! rooms/{R}/role          {"memberId": …, "role": …}
//! ```

use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};
use uuid::Uuid;

use crate::topics::Purpose;

/// Stable member identity, derived from the connection session.
///
/// Never user-chosen: two observers with the same display label remain
/// distinct members.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
pub struct MemberId(Uuid);

impl MemberId {
    /// Mint a fresh identity for a new connection session.
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    /// Create with an explicit UUID (for testing).
    pub fn from_uuid(id: Uuid) -> Self {
        Self(id)
    }

    /// Short prefix for display labels of members seen before their join
    /// record arrived.
    pub fn short(&self) -> String {
        self.0.to_string()[..8].to_string()
    }
}

impl Default for MemberId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MemberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Role a member holds inside a room.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum MemberRole {
    Observer,
    MainObserver,
}

/// Which members a sync command targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TargetScope {
    /// Every connected member of the room.
    All,
    /// A single member.
    Member(MemberId),
}

impl TargetScope {
    /// Whether the given member falls inside this scope.
    pub fn includes(&self, member: MemberId) -> bool {
        match self {
            TargetScope::All => true,
            TargetScope::Member(m) => *m == member,
        }
    }
}

/// Acknowledgement outcome transmitted by an observer.
///
/// `timed-out` is deliberately absent: it is synthesized locally by the
/// producer for members that never responded, never sent on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AckOutcome {
    Applied,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JoinRecord {
    pub member_id: MemberId,
    pub display_label: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LeaveRecord {
    pub member_id: MemberId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeartbeatRecord {
    pub member_id: MemberId,
    /// Sender wall clock, milliseconds since the Unix epoch.
    pub timestamp: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncRequestRecord {
    pub sequence: u64,
    pub target_scope: TargetScope,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncAckRecord {
    pub sequence: u64,
    pub member_id: MemberId,
    pub outcome: AckOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoleRecord {
    pub member_id: MemberId,
    pub role: MemberRole,
}

/// A decoded room message, one variant per topic purpose.
#[derive(Debug, Clone, PartialEq)]
pub enum RoomMessage {
    Join(JoinRecord),
    Leave(LeaveRecord),
    Heartbeat(HeartbeatRecord),
    SyncRequest(SyncRequestRecord),
    SyncAck(SyncAckRecord),
    Role(RoleRecord),
}

impl RoomMessage {
    /// Create a join announcement.
    pub fn join(member_id: MemberId, display_label: impl Into<String>) -> Self {
        Self::Join(JoinRecord {
            member_id,
            display_label: display_label.into(),
        })
    }

    /// Create a leave announcement.
    pub fn leave(member_id: MemberId) -> Self {
        Self::Leave(LeaveRecord { member_id })
    }

    /// Create a heartbeat stamped with the current wall clock.
    pub fn heartbeat(member_id: MemberId) -> Self {
        Self::Heartbeat(HeartbeatRecord {
            member_id,
            timestamp: now_millis(),
        })
    }

    /// Create a sync request.
    pub fn sync_request(sequence: u64, target_scope: TargetScope) -> Self {
        Self::SyncRequest(SyncRequestRecord {
            sequence,
            target_scope,
        })
    }

    /// Create a successful sync acknowledgement.
    pub fn sync_applied(sequence: u64, member_id: MemberId) -> Self {
        Self::SyncAck(SyncAckRecord {
            sequence,
            member_id,
            outcome: AckOutcome::Applied,
            reason: None,
        })
    }

    /// Create a failed sync acknowledgement with a reason.
    pub fn sync_failed(sequence: u64, member_id: MemberId, reason: impl Into<String>) -> Self {
        Self::SyncAck(SyncAckRecord {
            sequence,
            member_id,
            outcome: AckOutcome::Failed,
            reason: Some(reason.into()),
        })
    }

    /// Create a role announcement.
    pub fn role(member_id: MemberId, role: MemberRole) -> Self {
        Self::Role(RoleRecord { member_id, role })
    }

    /// The topic purpose this message travels on.
    pub fn purpose(&self) -> Purpose {
        match self {
            RoomMessage::Join(_) => Purpose::Join,
            RoomMessage::Leave(_) => Purpose::Leave,
            RoomMessage::Heartbeat(_) => Purpose::Heartbeat,
            RoomMessage::SyncRequest(_) => Purpose::SyncRequest,
            RoomMessage::SyncAck(_) => Purpose::SyncAck,
            RoomMessage::Role(_) => Purpose::Role,
        }
    }

    /// Serialize the payload for the wire.
    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        let result = match self {
            RoomMessage::Join(r) => serde_json::to_vec(r),
            RoomMessage::Leave(r) => serde_json::to_vec(r),
            RoomMessage::Heartbeat(r) => serde_json::to_vec(r),
            RoomMessage::SyncRequest(r) => serde_json::to_vec(r),
            RoomMessage::SyncAck(r) => serde_json::to_vec(r),
            RoomMessage::Role(r) => serde_json::to_vec(r),
        };
        result.map_err(|e| ProtocolError::Serialization(e.to_string()))
    }

    /// Deserialize a payload received on a topic with the given purpose.
    pub fn decode(purpose: Purpose, bytes: &[u8]) -> Result<Self, ProtocolError> {
        let map_err = |e: serde_json::Error| ProtocolError::Deserialization(e.to_string());
        let msg = match purpose {
            Purpose::Join => RoomMessage::Join(serde_json::from_slice(bytes).map_err(map_err)?),
            Purpose::Leave => RoomMessage::Leave(serde_json::from_slice(bytes).map_err(map_err)?),
            Purpose::Heartbeat => {
                RoomMessage::Heartbeat(serde_json::from_slice(bytes).map_err(map_err)?)
            }
            Purpose::SyncRequest => {
                RoomMessage::SyncRequest(serde_json::from_slice(bytes).map_err(map_err)?)
            }
            Purpose::SyncAck => {
                RoomMessage::SyncAck(serde_json::from_slice(bytes).map_err(map_err)?)
            }
            Purpose::Role => RoomMessage::Role(serde_json::from_slice(bytes).map_err(map_err)?),
        };
        Ok(msg)
    }
}

/// Milliseconds since the Unix epoch, for heartbeat stamping.
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// Protocol errors.
#[derive(Debug, Clone)]
pub enum ProtocolError {
    Serialization(String),
    Deserialization(String),
}

impl std::fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Serialization(e) => write!(f, "Serialization error: {e}"),
            Self::Deserialization(e) => write!(f, "Deserialization error: {e}"),
        }
    }
}

impl std::error::Error for ProtocolError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_roundtrip() {
        let member = MemberId::new();
        let msg = RoomMessage::join(member, "Caster-A");

        let encoded = msg.encode().unwrap();
        let decoded = RoomMessage::decode(Purpose::Join, &encoded).unwrap();

        assert_eq!(decoded, msg);
        assert_eq!(decoded.purpose(), Purpose::Join);
    }

    #[test]
    fn test_join_field_names() {
        let member = MemberId::new();
        let msg = RoomMessage::join(member, "Caster-A");

        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert!(json.get("memberId").is_some());
        assert_eq!(json["displayLabel"], "Caster-A");
    }

    #[test]
    fn test_heartbeat_carries_timestamp() {
        let member = MemberId::new();
        let msg = RoomMessage::heartbeat(member);

        match &msg {
            RoomMessage::Heartbeat(r) => assert!(r.timestamp > 0),
            other => panic!("expected heartbeat, got {other:?}"),
        }

        let encoded = msg.encode().unwrap();
        let decoded = RoomMessage::decode(Purpose::Heartbeat, &encoded).unwrap();
        assert_eq!(decoded, msg);
    }

    #[test]
    fn test_sync_request_scope_all() {
        let msg = RoomMessage::sync_request(7, TargetScope::All);
        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();

        assert_eq!(json["sequence"], 7);
        assert_eq!(json["targetScope"], "all");
    }

    #[test]
    fn test_sync_request_scope_single_member() {
        let member = MemberId::new();
        let msg = RoomMessage::sync_request(3, TargetScope::Member(member));

        let encoded = msg.encode().unwrap();
        let decoded = RoomMessage::decode(Purpose::SyncRequest, &encoded).unwrap();
        match decoded {
            RoomMessage::SyncRequest(r) => {
                assert_eq!(r.target_scope, TargetScope::Member(member));
                assert!(r.target_scope.includes(member));
                assert!(!r.target_scope.includes(MemberId::new()));
            }
            other => panic!("expected sync request, got {other:?}"),
        }
    }

    #[test]
    fn test_applied_ack_omits_reason() {
        let member = MemberId::new();
        let msg = RoomMessage::sync_applied(4, member);

        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["outcome"], "applied");
        assert!(json.get("reason").is_none());
    }

    #[test]
    fn test_failed_ack_roundtrip() {
        let member = MemberId::new();
        let msg = RoomMessage::sync_failed(4, member, "local-apply-error");

        let encoded = msg.encode().unwrap();
        let decoded = RoomMessage::decode(Purpose::SyncAck, &encoded).unwrap();
        match decoded {
            RoomMessage::SyncAck(r) => {
                assert_eq!(r.outcome, AckOutcome::Failed);
                assert_eq!(r.reason.as_deref(), Some("local-apply-error"));
            }
            other => panic!("expected sync ack, got {other:?}"),
        }
    }

    #[test]
    fn test_role_record_kebab_case() {
        let member = MemberId::new();
        let msg = RoomMessage::role(member, MemberRole::MainObserver);

        let json: serde_json::Value =
            serde_json::from_slice(&msg.encode().unwrap()).unwrap();
        assert_eq!(json["role"], "main-observer");
    }

    #[test]
    fn test_decode_garbage_errors() {
        let garbage = b"not json";
        assert!(RoomMessage::decode(Purpose::Join, garbage).is_err());
    }

    #[test]
    fn test_decode_wrong_purpose_errors() {
        let encoded = RoomMessage::sync_request(1, TargetScope::All).encode().unwrap();
        // A sync request payload has no memberId field.
        assert!(RoomMessage::decode(Purpose::Leave, &encoded).is_err());
    }

    #[test]
    fn test_member_id_short() {
        let member = MemberId::from_uuid(
            Uuid::parse_str("550e8400-e29b-41d4-a716-446655440000").unwrap(),
        );
        assert_eq!(member.short(), "550e8400");
    }

    #[test]
    fn test_scope_includes_all() {
        assert!(TargetScope::All.includes(MemberId::new()));
    }
}
