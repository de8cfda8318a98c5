//! Producer session: room ownership, role assignment, sync fan-out.
//!
//! The producer owns every room it created. Each room runs a sequential
//! actor task that is the only writer of that room's presence and sync
//! state, so inbound broker messages are serialized per room while distinct
//! rooms progress concurrently:
//!
//! ```text
//! broker ──▶ subscription (rooms/{R}/#) ──▶ ┌────────────────┐
//!                                           │ room actor {R} │──▶ events
//! ProducerSession ──▶ commands ───────────▶ │ presence, sync │──▶ publishes
//!                                           └────────────────┘
//! ```
//!
//! Commands (`assign_main_observer`, `request_sync`, `close`) travel over an
//! mpsc channel and answer through oneshots; `request_sync` suspends its
//! caller until every targeted member acked or the timer fired, whichever
//! comes first.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;

use crate::presence::{PresenceTracker, RoleChange, RoleError};
use crate::protocol::{MemberId, MemberRole, RoomMessage, TargetScope};
use crate::room::{RegistryError, RoomId, RoomRegistry};
use crate::sync::{AckDisposition, CancelReason, SyncCoordinator, SyncReport};
use crate::topics;
use crate::transport::{Envelope, Transport, TransportError};

/// Producer-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ProducerConfig {
    /// Expected member heartbeat cadence.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a member counts as disconnected.
    pub heartbeat_misses: u32,
    /// How long a sync command waits for acks.
    pub sync_timeout: Duration,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for ProducerConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_misses: 3,
            sync_timeout: Duration::from_secs(4),
            event_capacity: 256,
        }
    }
}

impl ProducerConfig {
    /// Idle window after which a member is marked disconnected.
    pub fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_misses
    }
}

/// Events surfaced to the producer UI.
#[derive(Debug, Clone)]
pub enum ProducerEvent {
    MemberJoined {
        room: RoomId,
        member: MemberId,
        label: String,
    },
    MemberLeft {
        room: RoomId,
        member: MemberId,
    },
    MemberTimedOut {
        room: RoomId,
        member: MemberId,
    },
    RoleChanged {
        room: RoomId,
        main_observer: Option<MemberId>,
    },
    SyncResolved {
        room: RoomId,
        report: SyncReport,
    },
}

/// Producer operation errors.
#[derive(Debug)]
pub enum ProducerError {
    Registry(RegistryError),
    Transport(TransportError),
    Role(RoleError),
    UnknownRoom(RoomId),
}

impl std::fmt::Display for ProducerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Registry(e) => write!(f, "{e}"),
            Self::Transport(e) => write!(f, "{e}"),
            Self::Role(e) => write!(f, "{e}"),
            Self::UnknownRoom(room) => write!(f, "room {room} is not active"),
        }
    }
}

impl std::error::Error for ProducerError {}

impl From<RegistryError> for ProducerError {
    fn from(e: RegistryError) -> Self {
        Self::Registry(e)
    }
}

impl From<TransportError> for ProducerError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

impl From<RoleError> for ProducerError {
    fn from(e: RoleError) -> Self {
        Self::Role(e)
    }
}

enum RoomCommand {
    AssignMainObserver {
        member: MemberId,
        reply: oneshot::Sender<Result<RoleChange, RoleError>>,
    },
    RequestSync {
        scope: TargetScope,
        reply: oneshot::Sender<SyncReport>,
    },
    Close,
}

struct RoomHandle {
    commands: mpsc::Sender<RoomCommand>,
    task: tokio::task::JoinHandle<()>,
}

/// The producer's connection-scoped session.
///
/// Constructed from an already-connected [`Transport`]; dropped (or
/// explicitly shut down) on disconnect. Holds no global state; the room
/// maps live behind locks so commands work through a shared handle.
pub struct ProducerSession {
    transport: Arc<dyn Transport>,
    config: ProducerConfig,
    registry: tokio::sync::Mutex<RoomRegistry>,
    rooms: tokio::sync::Mutex<HashMap<RoomId, RoomHandle>>,
    event_tx: mpsc::Sender<ProducerEvent>,
    event_rx: tokio::sync::Mutex<Option<mpsc::Receiver<ProducerEvent>>>,
}

impl ProducerSession {
    pub fn new(transport: Arc<dyn Transport>, config: ProducerConfig) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            transport,
            config,
            registry: tokio::sync::Mutex::new(RoomRegistry::new()),
            rooms: tokio::sync::Mutex::new(HashMap::new()),
            event_tx,
            event_rx: tokio::sync::Mutex::new(Some(event_rx)),
        }
    }

    /// Take the event receiver (can only be called once).
    pub async fn take_event_rx(&self) -> Option<mpsc::Receiver<ProducerEvent>> {
        self.event_rx.lock().await.take()
    }

    /// Create a room and start its actor.
    pub async fn create_room(&self) -> Result<RoomId, ProducerError> {
        let room = self.registry.lock().await.create_room()?;
        let inbound = match self.transport.subscribe(&topics::room_pattern(&room)) {
            Ok(rx) => rx,
            Err(e) => {
                self.registry.lock().await.close_room(&room);
                return Err(e.into());
            }
        };

        let (command_tx, command_rx) = mpsc::channel(32);
        let actor = RoomActor {
            room: room.clone(),
            transport: self.transport.clone(),
            presence: PresenceTracker::new(self.config.heartbeat_timeout()),
            sync: SyncCoordinator::new(),
            pending_sync: None,
            sync_deadline: None,
            event_tx: self.event_tx.clone(),
            config: self.config.clone(),
        };
        let task = tokio::spawn(actor.run(inbound, command_rx));

        log::info!("room {room} created");
        self.rooms.lock().await.insert(
            room.clone(),
            RoomHandle {
                commands: command_tx,
                task,
            },
        );
        Ok(room)
    }

    /// Close a room, cancelling any in-flight sync. Idempotent.
    pub async fn close_room(&self, room: &RoomId) {
        let removed = self.registry.lock().await.close_room(room);
        let handle = self.rooms.lock().await.remove(room);
        if let Some(handle) = handle {
            let _ = handle.commands.send(RoomCommand::Close).await;
        }
        if removed {
            log::info!("room {room} closed");
        }
    }

    /// Close every active room (session teardown before disconnect).
    pub async fn shutdown(&self) {
        let rooms = self.registry.lock().await.active_rooms();
        for room in rooms {
            self.close_room(&room).await;
        }
    }

    /// Promote a member to main observer and broadcast the change.
    pub async fn assign_main_observer(
        &self,
        room: &RoomId,
        member: MemberId,
    ) -> Result<RoleChange, ProducerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(
            room,
            RoomCommand::AssignMainObserver {
                member,
                reply: reply_tx,
            },
        )
        .await?;
        let result = reply_rx
            .await
            .map_err(|_| ProducerError::UnknownRoom(room.clone()))?;
        Ok(result?)
    }

    /// Issue a sync command and wait for its resolution.
    pub async fn request_sync(
        &self,
        room: &RoomId,
        scope: TargetScope,
    ) -> Result<SyncReport, ProducerError> {
        let (reply_tx, reply_rx) = oneshot::channel();
        self.send_command(
            room,
            RoomCommand::RequestSync {
                scope,
                reply: reply_tx,
            },
        )
        .await?;
        reply_rx
            .await
            .map_err(|_| ProducerError::UnknownRoom(room.clone()))
    }

    pub async fn active_rooms(&self) -> Vec<RoomId> {
        self.registry.lock().await.active_rooms()
    }

    pub async fn is_active(&self, room: &RoomId) -> bool {
        self.registry.lock().await.is_active(room)
    }

    async fn send_command(&self, room: &RoomId, command: RoomCommand) -> Result<(), ProducerError> {
        let commands = {
            let rooms = self.rooms.lock().await;
            rooms
                .get(room)
                .ok_or_else(|| ProducerError::UnknownRoom(room.clone()))?
                .commands
                .clone()
        };
        commands
            .send(command)
            .await
            .map_err(|_| ProducerError::UnknownRoom(room.clone()))
    }
}

impl Drop for ProducerSession {
    fn drop(&mut self) {
        // Actors exit on their own once the command channels close, but an
        // aborted task never leaves a sync waiter hanging past the session.
        if let Ok(rooms) = self.rooms.try_lock() {
            for handle in rooms.values() {
                handle.task.abort();
            }
        }
    }
}

/// Sequential owner of one room's state.
struct RoomActor {
    room: RoomId,
    transport: Arc<dyn Transport>,
    presence: PresenceTracker,
    sync: SyncCoordinator,
    pending_sync: Option<oneshot::Sender<SyncReport>>,
    sync_deadline: Option<Instant>,
    event_tx: mpsc::Sender<ProducerEvent>,
    config: ProducerConfig,
}

impl RoomActor {
    async fn run(
        mut self,
        mut inbound: mpsc::UnboundedReceiver<Envelope>,
        mut commands: mpsc::Receiver<RoomCommand>,
    ) {
        let mut sweep = tokio::time::interval(self.config.heartbeat_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            let deadline = self.sync_deadline;
            let sync_timer = async move {
                match deadline {
                    Some(at) => tokio::time::sleep_until(at).await,
                    None => std::future::pending().await,
                }
            };

            tokio::select! {
                envelope = inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break, // Transport gone.
                    }
                }
                command = commands.recv() => {
                    match command {
                        Some(RoomCommand::Close) | None => {
                            self.handle_close().await;
                            break;
                        }
                        Some(command) => self.handle_command(command).await,
                    }
                }
                _ = sweep.tick() => {
                    self.sweep_presence().await;
                }
                _ = sync_timer => {
                    if let Some(report) = self.sync.expire() {
                        self.resolve_sync(report).await;
                    }
                }
            }
        }
        log::debug!("room {} actor stopped", self.room);
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Some((room, purpose)) = topics::parse_topic(&envelope.topic) else {
            log::debug!("message on foreign topic {}, ignoring", envelope.topic);
            return;
        };
        if room != self.room {
            return;
        }
        let message = match RoomMessage::decode(purpose, &envelope.payload) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("undecodable {purpose} message in room {room}: {e}");
                return;
            }
        };

        match message {
            RoomMessage::Join(record) => {
                let changed = self.presence.apply_join(record.member_id, &record.display_label);
                if changed {
                    log::info!(
                        "member {} ({}) joined room {}",
                        record.display_label,
                        record.member_id,
                        self.room
                    );
                    self.confirm_join(record.member_id);
                    self.emit(ProducerEvent::MemberJoined {
                        room: self.room.clone(),
                        member: record.member_id,
                        label: record.display_label,
                    })
                    .await;
                } else {
                    // Re-announced join (the member may have missed the
                    // first confirmation). Repeat only the role record —
                    // the roster replay echoes back as joins and must not
                    // re-trigger itself.
                    let role = self
                        .presence
                        .member(record.member_id)
                        .map(|m| m.role)
                        .unwrap_or(MemberRole::Observer);
                    self.publish(RoomMessage::role(record.member_id, role));
                }
            }
            RoomMessage::Leave(record) => {
                if let Some(departure) = self.presence.apply_leave(record.member_id) {
                    log::info!("member {} left room {}", record.member_id, self.room);
                    self.emit(ProducerEvent::MemberLeft {
                        room: self.room.clone(),
                        member: departure.member,
                    })
                    .await;
                    if departure.role_cleared {
                        self.emit(ProducerEvent::RoleChanged {
                            room: self.room.clone(),
                            main_observer: None,
                        })
                        .await;
                    }
                }
            }
            RoomMessage::Heartbeat(record) => {
                self.presence.apply_heartbeat(record.member_id);
            }
            RoomMessage::SyncAck(record) => {
                if let AckDisposition::Resolved(report) = self.sync.record_ack(&record) {
                    self.resolve_sync(report).await;
                }
            }
            // The producer is the origin of sync requests and role records;
            // seeing them back on the wire is just the broker's echo.
            RoomMessage::SyncRequest(_) | RoomMessage::Role(_) => {
                log::trace!("own {purpose} echo in room {}", self.room);
            }
        }
    }

    async fn handle_command(&mut self, command: RoomCommand) {
        match command {
            RoomCommand::AssignMainObserver { member, reply } => {
                let result = self.presence.assign_main_observer(member);
                if let Ok(change) = &result {
                    self.publish(RoomMessage::role(change.promoted, MemberRole::MainObserver));
                    log::info!("member {} is now main observer of {}", member, self.room);
                    self.emit(ProducerEvent::RoleChanged {
                        room: self.room.clone(),
                        main_observer: Some(member),
                    })
                    .await;
                }
                let _ = reply.send(result);
            }
            RoomCommand::RequestSync { scope, reply } => {
                let targets =
                    SyncCoordinator::resolve_targets(scope, &self.presence.connected_members());
                let start = self.sync.begin(targets);

                if let Some(superseded) = start.superseded {
                    self.resolve_sync(superseded).await;
                }

                if let Some(report) = start.immediate {
                    log::info!(
                        "sync {} in room {} had no targets, resolving immediately",
                        report.sequence,
                        self.room
                    );
                    self.emit(ProducerEvent::SyncResolved {
                        room: self.room.clone(),
                        report: report.clone(),
                    })
                    .await;
                    let _ = reply.send(report);
                    return;
                }

                log::info!("sync {} issued in room {}", start.sequence, self.room);
                self.publish(RoomMessage::sync_request(start.sequence, scope));
                self.pending_sync = Some(reply);
                self.sync_deadline = Some(Instant::now() + self.config.sync_timeout);
            }
            RoomCommand::Close => unreachable!("close handled by the run loop"),
        }
    }

    async fn handle_close(&mut self) {
        if let Some(report) = self.sync.cancel(CancelReason::RoomClosed) {
            self.resolve_sync(report).await;
        }
    }

    async fn sweep_presence(&mut self) {
        for departure in self.presence.sweep_idle() {
            log::info!(
                "member {} timed out of room {}",
                departure.member,
                self.room
            );
            self.emit(ProducerEvent::MemberTimedOut {
                room: self.room.clone(),
                member: departure.member,
            })
            .await;
            if departure.role_cleared {
                self.emit(ProducerEvent::RoleChanged {
                    room: self.room.clone(),
                    main_observer: None,
                })
                .await;
            }
        }
    }

    /// Answer a processed join so the newcomer's mirror converges: its own
    /// role record is the join confirmation, then the current roster and the
    /// standing main-observer assignment. Everything republished here is
    /// idempotent on receipt.
    fn confirm_join(&self, joiner: MemberId) {
        self.publish(RoomMessage::role(joiner, MemberRole::Observer));
        for member in self.presence.members() {
            if member.id != joiner && member.is_connected() {
                self.publish(RoomMessage::join(member.id, member.label.clone()));
            }
        }
        if let Some(main) = self.presence.main_observer() {
            self.publish(RoomMessage::role(main, MemberRole::MainObserver));
        }
    }

    async fn resolve_sync(&mut self, report: SyncReport) {
        self.sync_deadline = None;
        if let Some(reply) = self.pending_sync.take() {
            let _ = reply.send(report.clone());
        }
        self.emit(ProducerEvent::SyncResolved {
            room: self.room.clone(),
            report,
        })
        .await;
    }

    fn publish(&self, message: RoomMessage) {
        let topic = topics::topic_for(&self.room, message.purpose());
        match message.encode() {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(&topic, payload) {
                    log::error!("publish on {topic} failed: {e}");
                }
            }
            Err(e) => log::error!("encoding {} message failed: {e}", message.purpose()),
        }
    }

    async fn emit(&self, event: ProducerEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::MemoryBroker;

    #[tokio::test]
    async fn test_create_room_registers_and_spawns() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        let room = producer.create_room().await.unwrap();
        assert!(producer.is_active(&room).await);
        assert_eq!(producer.active_rooms().await, vec![room]);
    }

    #[tokio::test]
    async fn test_close_room_idempotent() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        let room = producer.create_room().await.unwrap();
        producer.close_room(&room).await;
        assert!(!producer.is_active(&room).await);

        // Closing again, or closing a room that never existed, is a no-op.
        producer.close_room(&room).await;
        producer
            .close_room(&RoomId::parse("ZZZZZ").unwrap())
            .await;
    }

    #[tokio::test]
    async fn test_commands_to_unknown_room_fail() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        let ghost = RoomId::parse("ZZZZZ").unwrap();
        assert!(matches!(
            producer.assign_main_observer(&ghost, MemberId::new()).await,
            Err(ProducerError::UnknownRoom(_))
        ));
        assert!(matches!(
            producer.request_sync(&ghost, TargetScope::All).await,
            Err(ProducerError::UnknownRoom(_))
        ));
    }

    #[tokio::test]
    async fn test_assign_unknown_member_is_role_error() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        let room = producer.create_room().await.unwrap();
        let result = producer.assign_main_observer(&room, MemberId::new()).await;
        assert!(matches!(result, Err(ProducerError::Role(_))));
    }

    #[tokio::test]
    async fn test_sync_with_no_members_completes_vacuously() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        let room = producer.create_room().await.unwrap();
        let report = producer.request_sync(&room, TargetScope::All).await.unwrap();
        assert_eq!(report.disposition, crate::sync::SyncDisposition::Completed);
        assert!(report.outcomes.is_empty());
    }

    #[tokio::test]
    async fn test_shutdown_closes_all_rooms() {
        let broker = MemoryBroker::default();
        let producer =
            ProducerSession::new(Arc::new(broker.transport()), ProducerConfig::default());

        producer.create_room().await.unwrap();
        producer.create_room().await.unwrap();
        producer.shutdown().await;
        assert!(producer.active_rooms().await.is_empty());
    }
}
