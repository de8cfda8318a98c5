//! Per-room membership and role tracking.
//!
//! Driven purely by received messages: the producer's tracker is the
//! authority for the rooms it owns, an observer's tracker is a read-oriented
//! mirror of the room it joined, and the two converge only through broker
//! traffic — never shared memory. A mirror may lag the authority by at most
//! one message round-trip.
//!
//! Every liveness and role change appends a [`PresenceTransition`], so a
//! message sequence can be replayed deterministically in tests and a member
//! never vanishes without a recorded transition.

use std::time::{Duration, Instant};

use crate::protocol::{MemberId, MemberRole};

/// Connection liveness of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Connected,
    Disconnected,
}

/// One member of a room.
#[derive(Debug, Clone)]
pub struct Member {
    pub id: MemberId,
    pub label: String,
    pub liveness: Liveness,
    pub role: MemberRole,
    last_seen: Instant,
}

impl Member {
    fn new(id: MemberId, label: String) -> Self {
        Self {
            id,
            label,
            liveness: Liveness::Connected,
            role: MemberRole::Observer,
            last_seen: Instant::now(),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.liveness == Liveness::Connected
    }

    /// No join or heartbeat seen for longer than `timeout`.
    pub fn is_idle(&self, timeout: Duration) -> bool {
        self.last_seen.elapsed() > timeout
    }
}

/// Recorded membership/role state change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresenceTransition {
    Joined { member: MemberId },
    Left { member: MemberId },
    HeartbeatTimeout { member: MemberId },
    RolePromoted { member: MemberId },
    RoleDemoted { member: MemberId },
    RoleCleared { member: MemberId },
}

/// Result of a successful main-observer assignment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoleChange {
    pub promoted: MemberId,
    pub demoted: Option<MemberId>,
}

/// A member going disconnected, with the side effect on the room role.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Departure {
    pub member: MemberId,
    /// The departing member held main-observer; the role is now vacant.
    pub role_cleared: bool,
}

/// Role assignment errors.
#[derive(Debug, Clone)]
pub enum RoleError {
    /// Target member is unknown or not currently connected.
    NotConnected(MemberId),
}

impl std::fmt::Display for RoleError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NotConnected(m) => write!(f, "member {m} is not connected"),
        }
    }
}

impl std::error::Error for RoleError {}

/// Membership and role state for a single room.
///
/// Members are kept in join order. At most one member holds
/// [`MemberRole::MainObserver`] at any time; the invariant is enforced here
/// and nowhere else.
#[derive(Debug)]
pub struct PresenceTracker {
    members: Vec<Member>,
    transitions: Vec<PresenceTransition>,
    heartbeat_timeout: Duration,
}

impl PresenceTracker {
    /// Create a tracker that marks members disconnected after
    /// `heartbeat_timeout` without traffic.
    pub fn new(heartbeat_timeout: Duration) -> Self {
        Self {
            members: Vec::new(),
            transitions: Vec::new(),
            heartbeat_timeout,
        }
    }

    /// Process a join announcement.
    ///
    /// Idempotent: a duplicate join of a connected member only refreshes its
    /// label and liveness clock. Returns `true` when the member actually
    /// transitioned to connected (first join or reconnect).
    pub fn apply_join(&mut self, id: MemberId, label: &str) -> bool {
        if let Some(member) = self.members.iter_mut().find(|m| m.id == id) {
            member.label = label.to_string();
            member.last_seen = Instant::now();
            if member.is_connected() {
                return false;
            }
            member.liveness = Liveness::Connected;
            self.transitions.push(PresenceTransition::Joined { member: id });
            return true;
        }
        self.members.push(Member::new(id, label.to_string()));
        self.transitions.push(PresenceTransition::Joined { member: id });
        true
    }

    /// Process a leave announcement.
    ///
    /// Unknown or already-disconnected members are a no-op.
    pub fn apply_leave(&mut self, id: MemberId) -> Option<Departure> {
        let member = self.members.iter_mut().find(|m| m.id == id)?;
        if !member.is_connected() {
            return None;
        }
        member.liveness = Liveness::Disconnected;
        self.transitions.push(PresenceTransition::Left { member: id });
        let role_cleared = self.clear_role_if_main(id);
        Some(Departure {
            member: id,
            role_cleared,
        })
    }

    /// Refresh a member's liveness clock from a heartbeat.
    ///
    /// Heartbeats from unknown members are ignored: membership is only ever
    /// established by a join.
    pub fn apply_heartbeat(&mut self, id: MemberId) -> bool {
        match self.members.iter_mut().find(|m| m.id == id) {
            Some(member) => {
                member.last_seen = Instant::now();
                if !member.is_connected() {
                    // A heartbeat after a missed window counts as a rejoin.
                    member.liveness = Liveness::Connected;
                    self.transitions.push(PresenceTransition::Joined { member: id });
                }
                true
            }
            None => {
                log::debug!("heartbeat from unknown member {id}, ignoring");
                false
            }
        }
    }

    /// Mark connected members without recent traffic as disconnected.
    ///
    /// Returns the members that timed out, with role side effects.
    pub fn sweep_idle(&mut self) -> Vec<Departure> {
        let timeout = self.heartbeat_timeout;
        let stale: Vec<MemberId> = self
            .members
            .iter()
            .filter(|m| m.is_connected() && m.is_idle(timeout))
            .map(|m| m.id)
            .collect();

        let mut departures = Vec::with_capacity(stale.len());
        for id in stale {
            if let Some(member) = self.members.iter_mut().find(|m| m.id == id) {
                member.liveness = Liveness::Disconnected;
            }
            self.transitions
                .push(PresenceTransition::HeartbeatTimeout { member: id });
            let role_cleared = self.clear_role_if_main(id);
            departures.push(Departure {
                member: id,
                role_cleared,
            });
        }
        departures
    }

    /// Promote a member to main observer, demoting any previous holder.
    ///
    /// Producer-only operation. Fails if the target is unknown or
    /// disconnected.
    pub fn assign_main_observer(&mut self, id: MemberId) -> Result<RoleChange, RoleError> {
        let connected = self
            .members
            .iter()
            .any(|m| m.id == id && m.is_connected());
        if !connected {
            return Err(RoleError::NotConnected(id));
        }

        let demoted = self.main_observer().filter(|current| *current != id);
        if let Some(previous) = demoted {
            self.set_role(previous, MemberRole::Observer);
            self.transitions
                .push(PresenceTransition::RoleDemoted { member: previous });
        }
        self.set_role(id, MemberRole::MainObserver);
        self.transitions
            .push(PresenceTransition::RolePromoted { member: id });
        Ok(RoleChange {
            promoted: id,
            demoted,
        })
    }

    /// Apply a role announcement received from the wire (mirror path).
    ///
    /// A role record may arrive before the member's join record; such members
    /// get a placeholder entry that the join later relabels.
    pub fn apply_role(&mut self, id: MemberId, role: MemberRole) {
        if self.members.iter().all(|m| m.id != id) {
            self.members
                .push(Member::new(id, format!("member-{}", id.short())));
            self.transitions.push(PresenceTransition::Joined { member: id });
        }
        match role {
            MemberRole::MainObserver => {
                if let Some(previous) = self.main_observer().filter(|current| *current != id) {
                    self.set_role(previous, MemberRole::Observer);
                    self.transitions
                        .push(PresenceTransition::RoleDemoted { member: previous });
                }
                if self.member(id).map(|m| m.role) != Some(MemberRole::MainObserver) {
                    self.set_role(id, MemberRole::MainObserver);
                    self.transitions
                        .push(PresenceTransition::RolePromoted { member: id });
                }
            }
            MemberRole::Observer => {
                if self.member(id).map(|m| m.role) == Some(MemberRole::MainObserver) {
                    self.set_role(id, MemberRole::Observer);
                    self.transitions
                        .push(PresenceTransition::RoleDemoted { member: id });
                }
            }
        }
    }

    /// The current main observer, if one is assigned.
    pub fn main_observer(&self) -> Option<MemberId> {
        self.members
            .iter()
            .find(|m| m.role == MemberRole::MainObserver)
            .map(|m| m.id)
    }

    pub fn member(&self, id: MemberId) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// All members in join order, connected or not.
    pub fn members(&self) -> &[Member] {
        &self.members
    }

    /// Connected members in join order.
    pub fn connected_members(&self) -> Vec<MemberId> {
        self.members
            .iter()
            .filter(|m| m.is_connected())
            .map(|m| m.id)
            .collect()
    }

    pub fn connected_count(&self) -> usize {
        self.members.iter().filter(|m| m.is_connected()).count()
    }

    /// The recorded transition history, oldest first.
    pub fn transitions(&self) -> &[PresenceTransition] {
        &self.transitions
    }

    fn set_role(&mut self, id: MemberId, role: MemberRole) {
        if let Some(member) = self.members.iter_mut().find(|m| m.id == id) {
            member.role = role;
        }
    }

    fn clear_role_if_main(&mut self, id: MemberId) -> bool {
        let was_main = self
            .member(id)
            .map(|m| m.role == MemberRole::MainObserver)
            .unwrap_or(false);
        if was_main {
            self.set_role(id, MemberRole::Observer);
            self.transitions
                .push(PresenceTransition::RoleCleared { member: id });
        }
        was_main
    }
}
