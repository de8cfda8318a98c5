//! The synchronization command state machine.
//!
//! One command may be outstanding per room:
//!
//! ```text
//! issued ──▶ awaiting-acks ──▶ completed          (every target applied)
//!                         ├──▶ partially-failed   (every target reported, some failed)
//!                         └──▶ timed-out          (timer fired / cancelled / superseded)
//! ```
//!
//! The coordinator itself is pure state — sequence allocation, target
//! bookkeeping, ack classification. Timers and publishing belong to the
//! owning room task, which keeps every transition deterministic under test.

use std::collections::HashMap;
use std::time::Instant;

use crate::protocol::{AckOutcome, MemberId, SyncAckRecord, TargetScope};

/// Terminal disposition of a sync command.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncDisposition {
    /// Every targeted member applied the change.
    Completed,
    /// Every targeted member reported, at least one failed.
    PartiallyFailed,
    /// At least one targeted member never reported.
    TimedOut,
}

/// Per-member result inside a resolved command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemberOutcome {
    Applied,
    Failed(String),
    NoResponse,
}

/// Why a command was resolved before its own timer fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CancelReason {
    /// The room was closed (or the session left) with the command in flight.
    RoomClosed,
    /// A newer command for the same room displaced this one.
    Superseded,
}

impl std::fmt::Display for CancelReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::RoomClosed => write!(f, "room closed"),
            Self::Superseded => write!(f, "superseded"),
        }
    }
}

/// Resolved command, handed back to the caller of `request_sync`.
#[derive(Debug, Clone, PartialEq)]
pub struct SyncReport {
    pub sequence: u64,
    pub disposition: SyncDisposition,
    /// One entry per targeted member, in target order.
    pub outcomes: Vec<(MemberId, MemberOutcome)>,
    /// Present when the command was cancelled rather than genuinely resolved.
    pub cancelled: Option<CancelReason>,
}

impl SyncReport {
    /// Members that reported a failure, with reasons.
    pub fn failed_members(&self) -> Vec<(MemberId, &str)> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                MemberOutcome::Failed(reason) => Some((*id, reason.as_str())),
                _ => None,
            })
            .collect()
    }

    /// Members that never responded.
    pub fn unresponsive_members(&self) -> Vec<MemberId> {
        self.outcomes
            .iter()
            .filter_map(|(id, outcome)| match outcome {
                MemberOutcome::NoResponse => Some(*id),
                _ => None,
            })
            .collect()
    }
}

/// What became of an inbound ack.
#[derive(Debug, Clone, PartialEq)]
pub enum AckDisposition {
    /// Recorded; more targets outstanding.
    Recorded,
    /// Recorded, and it was the last outstanding target.
    Resolved(SyncReport),
    /// Referenced a superseded or unknown sequence; discarded.
    Stale,
}

#[derive(Debug)]
struct InFlight {
    sequence: u64,
    /// Targeted members, in resolution order.
    targets: Vec<MemberId>,
    outcomes: HashMap<MemberId, MemberOutcome>,
    issued_at: Instant,
}

impl InFlight {
    fn report(&self, disposition: SyncDisposition, cancelled: Option<CancelReason>) -> SyncReport {
        let outcomes = self
            .targets
            .iter()
            .map(|id| {
                let outcome = self
                    .outcomes
                    .get(id)
                    .cloned()
                    .unwrap_or(MemberOutcome::NoResponse);
                (*id, outcome)
            })
            .collect();
        SyncReport {
            sequence: self.sequence,
            disposition,
            outcomes,
            cancelled,
        }
    }

    fn all_reported(&self) -> bool {
        self.targets.iter().all(|id| self.outcomes.contains_key(id))
    }

    fn any_failed(&self) -> bool {
        self.outcomes
            .values()
            .any(|o| matches!(o, MemberOutcome::Failed(_)))
    }
}

/// Allocates sequence numbers and tracks the in-flight command for one room.
#[derive(Debug, Default)]
pub struct SyncCoordinator {
    last_sequence: u64,
    in_flight: Option<InFlight>,
}

impl SyncCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolve a scope against the connected member set.
    ///
    /// `All` narrows to the members connected right now; a single-member
    /// scope is kept verbatim even if that member is unknown — the command
    /// then times out enumerating it as non-responsive, which is the
    /// observable answer to "sync someone who isn't there".
    pub fn resolve_targets(scope: TargetScope, connected: &[MemberId]) -> Vec<MemberId> {
        match scope {
            TargetScope::All => connected.to_vec(),
            TargetScope::Member(id) => vec![id],
        }
    }

    /// Begin a new command against the given targets.
    ///
    /// Returns the allocated sequence number, plus the report for any
    /// in-flight command this one displaced (resolved as timed-out,
    /// annotated superseded).
    ///
    /// An empty target set resolves immediately: the returned sequence is
    /// paired with a vacuous completed report in `immediate`.
    pub fn begin(&mut self, targets: Vec<MemberId>) -> SyncStart {
        let superseded = self.take_in_flight().map(|cmd| {
            log::debug!(
                "sync {} superseded with {} of {} targets reported",
                cmd.sequence,
                cmd.outcomes.len(),
                cmd.targets.len()
            );
            cmd.report(SyncDisposition::TimedOut, Some(CancelReason::Superseded))
        });

        self.last_sequence += 1;
        let sequence = self.last_sequence;

        if targets.is_empty() {
            return SyncStart {
                sequence,
                superseded,
                immediate: Some(SyncReport {
                    sequence,
                    disposition: SyncDisposition::Completed,
                    outcomes: Vec::new(),
                    cancelled: None,
                }),
            };
        }

        self.in_flight = Some(InFlight {
            sequence,
            targets,
            outcomes: HashMap::new(),
            issued_at: Instant::now(),
        });
        SyncStart {
            sequence,
            superseded,
            immediate: None,
        }
    }

    /// Classify and record an inbound ack.
    pub fn record_ack(&mut self, ack: &SyncAckRecord) -> AckDisposition {
        let Some(cmd) = self.in_flight.as_mut() else {
            log::debug!("ack for sequence {} with nothing in flight, discarding", ack.sequence);
            return AckDisposition::Stale;
        };
        if ack.sequence != cmd.sequence {
            log::debug!(
                "ack for sequence {} while {} is in flight, discarding",
                ack.sequence,
                cmd.sequence
            );
            return AckDisposition::Stale;
        }
        if !cmd.targets.contains(&ack.member_id) {
            log::debug!("ack from untargeted member {}, discarding", ack.member_id);
            return AckDisposition::Stale;
        }
        if cmd.outcomes.contains_key(&ack.member_id) {
            log::debug!("duplicate ack from member {}, discarding", ack.member_id);
            return AckDisposition::Stale;
        }

        let outcome = match ack.outcome {
            AckOutcome::Applied => MemberOutcome::Applied,
            AckOutcome::Failed => MemberOutcome::Failed(
                ack.reason.clone().unwrap_or_else(|| "unspecified".to_string()),
            ),
        };
        cmd.outcomes.insert(ack.member_id, outcome);

        if cmd.all_reported() {
            let disposition = if cmd.any_failed() {
                SyncDisposition::PartiallyFailed
            } else {
                SyncDisposition::Completed
            };
            let report = cmd.report(disposition, None);
            self.in_flight = None;
            AckDisposition::Resolved(report)
        } else {
            AckDisposition::Recorded
        }
    }

    /// Resolve the in-flight command because its timer fired.
    pub fn expire(&mut self) -> Option<SyncReport> {
        let cmd = self.take_in_flight()?;
        log::info!(
            "sync {} timed out after {:?} with {} of {} targets reported",
            cmd.sequence,
            cmd.issued_at.elapsed(),
            cmd.outcomes.len(),
            cmd.targets.len()
        );
        Some(cmd.report(SyncDisposition::TimedOut, None))
    }

    /// Resolve the in-flight command because the room went away or a newer
    /// command displaced it.
    pub fn cancel(&mut self, reason: CancelReason) -> Option<SyncReport> {
        let cmd = self.take_in_flight()?;
        Some(cmd.report(SyncDisposition::TimedOut, Some(reason)))
    }

    /// Sequence number of the command currently awaiting acks.
    pub fn in_flight_sequence(&self) -> Option<u64> {
        self.in_flight.as_ref().map(|cmd| cmd.sequence)
    }

    /// The most recently allocated sequence number.
    pub fn last_sequence(&self) -> u64 {
        self.last_sequence
    }

    fn take_in_flight(&mut self) -> Option<InFlight> {
        self.in_flight.take()
    }
}

/// Result of [`SyncCoordinator::begin`].
#[derive(Debug)]
pub struct SyncStart {
    pub sequence: u64,
    /// Report for the command this one displaced, if any.
    pub superseded: Option<SyncReport>,
    /// Present when the command resolved without any targets to wait on.
    pub immediate: Option<SyncReport>,
}
