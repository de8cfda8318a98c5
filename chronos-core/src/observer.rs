//! Observer session: join one room, mirror it, apply sync commands.
//!
//! An observer joins at most one room at a time. Its view of the room is a
//! read-oriented mirror fed exclusively by received messages — it may lag
//! the producer's authoritative state by a message round-trip, never more.
//!
//! Joining announces the member on the room's join topic and waits for the
//! producer to answer with the member's own role record; no answer within
//! the join timeout means the room does not exist (or its producer is
//! gone), surfaced as [`JoinError::RoomNotFound`].
//!
//! A received sync request inside the member's scope drives the local
//! client bridge as a blocking step with its own timeout, then publishes
//! exactly one ack for that sequence.

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{mpsc, RwLock};
use tokio::time::Instant;

use crate::bridge::LocalClientBridge;
use crate::presence::{Member, PresenceTracker};
use crate::protocol::{MemberId, RoomMessage, SyncRequestRecord};
use crate::room::RoomId;
use crate::topics::{self, Purpose};
use crate::transport::{Envelope, Transport, TransportError};

/// Observer-side tuning knobs.
#[derive(Debug, Clone)]
pub struct ObserverConfig {
    /// Cadence of outgoing heartbeats.
    pub heartbeat_interval: Duration,
    /// Consecutive missed heartbeats before a mirrored member counts as
    /// disconnected.
    pub heartbeat_misses: u32,
    /// How long to wait for the producer's join confirmation.
    pub join_timeout: Duration,
    /// How often the join announcement is repeated while unconfirmed.
    /// The broker gives no subscription acknowledgement, so the first
    /// announcement can race the producer's own subscription; repeats are
    /// idempotent on the producer.
    pub join_retry_interval: Duration,
    /// How long one local client call may take.
    pub bridge_timeout: Duration,
    /// Event channel capacity.
    pub event_capacity: usize,
}

impl Default for ObserverConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval: Duration::from_secs(2),
            heartbeat_misses: 3,
            join_timeout: Duration::from_secs(3),
            join_retry_interval: Duration::from_millis(500),
            bridge_timeout: Duration::from_secs(3),
            event_capacity: 256,
        }
    }
}

impl ObserverConfig {
    fn heartbeat_timeout(&self) -> Duration {
        self.heartbeat_interval * self.heartbeat_misses
    }
}

/// Events surfaced to the observer UI.
#[derive(Debug, Clone)]
pub enum ObserverEvent {
    MemberJoined { member: MemberId, label: String },
    MemberLeft { member: MemberId },
    MemberTimedOut { member: MemberId },
    RoleChanged { main_observer: Option<MemberId> },
    SyncApplied { sequence: u64 },
    SyncFailed { sequence: u64, reason: String },
}

/// Join failures.
#[derive(Debug)]
pub enum JoinError {
    /// This session is already in a room; leave first.
    AlreadyJoined(RoomId),
    /// No presence confirmation within the join timeout.
    RoomNotFound(RoomId),
    Transport(TransportError),
}

impl std::fmt::Display for JoinError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::AlreadyJoined(room) => write!(f, "already joined room {room}"),
            Self::RoomNotFound(room) => write!(f, "room {room} not found"),
            Self::Transport(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for JoinError {}

impl From<TransportError> for JoinError {
    fn from(e: TransportError) -> Self {
        Self::Transport(e)
    }
}

struct JoinedRoom {
    room: RoomId,
    mirror: Arc<RwLock<PresenceTracker>>,
    actor: tokio::task::JoinHandle<()>,
    heartbeat: tokio::task::JoinHandle<()>,
}

/// The observer's connection-scoped session.
pub struct ObserverSession {
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn LocalClientBridge>,
    member_id: MemberId,
    config: ObserverConfig,
    joined: Option<JoinedRoom>,
    event_tx: mpsc::Sender<ObserverEvent>,
    event_rx: Option<mpsc::Receiver<ObserverEvent>>,
}

impl ObserverSession {
    /// Create a session over a connected transport. A fresh member identity
    /// is minted per session — identity follows the connection, not the
    /// display label.
    pub fn new(
        transport: Arc<dyn Transport>,
        bridge: Arc<dyn LocalClientBridge>,
        config: ObserverConfig,
    ) -> Self {
        let (event_tx, event_rx) = mpsc::channel(config.event_capacity);
        Self {
            transport,
            bridge,
            member_id: MemberId::new(),
            config,
            joined: None,
            event_tx,
            event_rx: Some(event_rx),
        }
    }

    pub fn member_id(&self) -> MemberId {
        self.member_id
    }

    /// Take the event receiver (can only be called once).
    pub fn take_event_rx(&mut self) -> Option<mpsc::Receiver<ObserverEvent>> {
        self.event_rx.take()
    }

    pub fn joined_room(&self) -> Option<&RoomId> {
        self.joined.as_ref().map(|j| &j.room)
    }

    /// Mirrored members of the joined room, in join order.
    pub async fn members(&self) -> Vec<Member> {
        match &self.joined {
            Some(joined) => joined.mirror.read().await.members().to_vec(),
            None => Vec::new(),
        }
    }

    /// Mirrored main observer of the joined room.
    pub async fn main_observer(&self) -> Option<MemberId> {
        match &self.joined {
            Some(joined) => joined.mirror.read().await.main_observer(),
            None => None,
        }
    }

    /// Join a room and wait for the producer's confirmation.
    pub async fn join_room(&mut self, room: RoomId, label: &str) -> Result<(), JoinError> {
        if let Some(joined) = &self.joined {
            return Err(JoinError::AlreadyJoined(joined.room.clone()));
        }

        let mut inbound = self.transport.subscribe(&topics::room_pattern(&room))?;
        log::info!("joining room {room} as {label} ({})", self.member_id);

        // Announce on an interval until the producer answers with our own
        // role record — the confirmation that the join was seen. Mirror the
        // room's traffic while waiting.
        let mut mirror = PresenceTracker::new(self.config.heartbeat_timeout());
        let deadline = Instant::now() + self.config.join_timeout;
        let mut announce = tokio::time::interval(self.config.join_retry_interval);
        announce.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        'wait: loop {
            tokio::select! {
                _ = announce.tick() => {
                    self.publish(&room, RoomMessage::join(self.member_id, label))?;
                }
                received = tokio::time::timeout_at(deadline, inbound.recv()) => {
                    let envelope = match received {
                        Ok(Some(envelope)) => envelope,
                        Ok(None) => return Err(JoinError::Transport(TransportError::Closed)),
                        Err(_) => {
                            log::warn!("no presence response from room {room}");
                            return Err(JoinError::RoomNotFound(room));
                        }
                    };
                    let Some((_, purpose)) = topics::parse_topic(&envelope.topic) else {
                        continue;
                    };
                    let Ok(message) = RoomMessage::decode(purpose, &envelope.payload) else {
                        continue;
                    };
                    let confirmed = matches!(
                        &message,
                        RoomMessage::Role(record) if record.member_id == self.member_id
                    );
                    apply_to_mirror(&mut mirror, &message);
                    if confirmed {
                        break 'wait;
                    }
                }
            }
        }
        log::info!("joined room {room}");

        let mirror = Arc::new(RwLock::new(mirror));
        let actor = RoomMirrorActor {
            room: room.clone(),
            member_id: self.member_id,
            transport: self.transport.clone(),
            bridge: self.bridge.clone(),
            mirror: mirror.clone(),
            event_tx: self.event_tx.clone(),
            config: self.config.clone(),
            last_acked: None,
        };
        let actor_task = tokio::spawn(actor.run(inbound));
        let heartbeat_task = tokio::spawn(heartbeat_loop(
            self.transport.clone(),
            room.clone(),
            self.member_id,
            self.config.heartbeat_interval,
        ));

        self.joined = Some(JoinedRoom {
            room,
            mirror,
            actor: actor_task,
            heartbeat: heartbeat_task,
        });
        Ok(())
    }

    /// Announce departure and drop the room mirror. No-op when not joined.
    pub async fn leave_room(&mut self) {
        if let Some(joined) = self.joined.take() {
            let _ = self.publish(&joined.room, RoomMessage::leave(self.member_id));
            joined.actor.abort();
            joined.heartbeat.abort();
            log::info!("left room {}", joined.room);
        }
    }

    fn publish(&self, room: &RoomId, message: RoomMessage) -> Result<(), TransportError> {
        let topic = topics::topic_for(room, message.purpose());
        let payload = message
            .encode()
            .map_err(|e| TransportError::Connection(e.to_string()))?;
        self.transport.publish(&topic, payload)
    }
}

impl Drop for ObserverSession {
    fn drop(&mut self) {
        // A dropped session goes silent: no leave message, heartbeats stop,
        // and the producer learns of the departure through its heartbeat
        // timeout — the same observable behavior as a crashed client.
        if let Some(joined) = self.joined.take() {
            joined.actor.abort();
            joined.heartbeat.abort();
        }
    }
}

async fn heartbeat_loop(
    transport: Arc<dyn Transport>,
    room: RoomId,
    member_id: MemberId,
    interval: Duration,
) {
    let topic = topics::topic_for(&room, Purpose::Heartbeat);
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Ok(payload) = RoomMessage::heartbeat(member_id).encode() else {
            continue;
        };
        if transport.publish(&topic, payload).is_err() {
            log::debug!("heartbeat publish failed, stopping");
            break;
        }
    }
}

/// Update a mirror from one received message. Shared by the join wait and
/// the mirror actor so both apply identical rules.
fn apply_to_mirror(mirror: &mut PresenceTracker, message: &RoomMessage) -> Option<ObserverEvent> {
    match message {
        RoomMessage::Join(record) => {
            let changed = mirror.apply_join(record.member_id, &record.display_label);
            changed.then(|| ObserverEvent::MemberJoined {
                member: record.member_id,
                label: record.display_label.clone(),
            })
        }
        RoomMessage::Leave(record) => mirror
            .apply_leave(record.member_id)
            .map(|departure| ObserverEvent::MemberLeft {
                member: departure.member,
            }),
        RoomMessage::Heartbeat(record) => {
            mirror.apply_heartbeat(record.member_id);
            None
        }
        RoomMessage::Role(record) => {
            let before = mirror.main_observer();
            mirror.apply_role(record.member_id, record.role);
            let after = mirror.main_observer();
            (before != after).then_some(ObserverEvent::RoleChanged {
                main_observer: after,
            })
        }
        // Producer-bound traffic; the mirror has no use for it.
        RoomMessage::SyncRequest(_) | RoomMessage::SyncAck(_) => None,
    }
}

/// Sequential owner of the observer's room mirror.
struct RoomMirrorActor {
    room: RoomId,
    member_id: MemberId,
    transport: Arc<dyn Transport>,
    bridge: Arc<dyn LocalClientBridge>,
    mirror: Arc<RwLock<PresenceTracker>>,
    event_tx: mpsc::Sender<ObserverEvent>,
    config: ObserverConfig,
    /// Highest sequence already answered; repeated deliveries are not
    /// re-acked.
    last_acked: Option<u64>,
}

impl RoomMirrorActor {
    async fn run(mut self, mut inbound: mpsc::UnboundedReceiver<Envelope>) {
        let mut sweep = tokio::time::interval(self.config.heartbeat_interval);
        sweep.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    match envelope {
                        Some(envelope) => self.handle_envelope(envelope).await,
                        None => break,
                    }
                }
                _ = sweep.tick() => {
                    let departures = self.mirror.write().await.sweep_idle();
                    for departure in departures {
                        self.emit(ObserverEvent::MemberTimedOut {
                            member: departure.member,
                        })
                        .await;
                        if departure.role_cleared {
                            self.emit(ObserverEvent::RoleChanged { main_observer: None }).await;
                        }
                    }
                }
            }
        }
        log::debug!("room {} mirror stopped", self.room);
    }

    async fn handle_envelope(&mut self, envelope: Envelope) {
        let Some((room, purpose)) = topics::parse_topic(&envelope.topic) else {
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

        if let RoomMessage::SyncRequest(request) = &message {
            self.handle_sync_request(request.clone()).await;
            return;
        }

        let suppress_own = matches!(
            &message,
            RoomMessage::Join(record) if record.member_id == self.member_id
        );
        let event = apply_to_mirror(&mut *self.mirror.write().await, &message);
        if let Some(event) = event {
            if !suppress_own {
                self.emit(event).await;
            }
        }
    }

    /// Drive the local client and answer with exactly one ack.
    async fn handle_sync_request(&mut self, request: SyncRequestRecord) {
        if !request.target_scope.includes(self.member_id) {
            return;
        }
        if self.last_acked.is_some_and(|acked| request.sequence <= acked) {
            log::debug!(
                "sync request {} already answered, ignoring",
                request.sequence
            );
            return;
        }
        self.last_acked = Some(request.sequence);

        let bridge = self.bridge.clone();
        let sequence = request.sequence;
        let call = tokio::task::spawn_blocking(move || bridge.apply_sync(&request));
        let outcome = tokio::time::timeout(self.config.bridge_timeout, call).await;

        let (ack, event) = match outcome {
            Ok(Ok(Ok(()))) => {
                log::info!("sync {sequence} applied in room {}", self.room);
                (
                    RoomMessage::sync_applied(sequence, self.member_id),
                    ObserverEvent::SyncApplied { sequence },
                )
            }
            Ok(Ok(Err(e))) => {
                log::warn!("sync {sequence} rejected by local client: {e}");
                (
                    RoomMessage::sync_failed(sequence, self.member_id, e.reason()),
                    ObserverEvent::SyncFailed {
                        sequence,
                        reason: e.reason().to_string(),
                    },
                )
            }
            Ok(Err(join_error)) => {
                log::error!("local client bridge panicked: {join_error}");
                (
                    RoomMessage::sync_failed(sequence, self.member_id, "local-apply-error"),
                    ObserverEvent::SyncFailed {
                        sequence,
                        reason: "local-apply-error".to_string(),
                    },
                )
            }
            Err(_) => {
                log::warn!(
                    "local client call exceeded {:?} for sync {sequence}",
                    self.config.bridge_timeout
                );
                (
                    RoomMessage::sync_failed(sequence, self.member_id, "local-apply-timeout"),
                    ObserverEvent::SyncFailed {
                        sequence,
                        reason: "local-apply-timeout".to_string(),
                    },
                )
            }
        };

        let topic = topics::topic_for(&self.room, ack.purpose());
        match ack.encode() {
            Ok(payload) => {
                if let Err(e) = self.transport.publish(&topic, payload) {
                    log::error!("ack publish on {topic} failed: {e}");
                }
            }
            Err(e) => log::error!("encoding ack failed: {e}"),
        }
        self.emit(event).await;
    }

    async fn emit(&self, event: ObserverEvent) {
        let _ = self.event_tx.send(event).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::AppliedBridge;
    use crate::transport::MemoryBroker;

    fn session(broker: &MemoryBroker) -> ObserverSession {
        ObserverSession::new(
            Arc::new(broker.transport()),
            Arc::new(AppliedBridge),
            ObserverConfig {
                join_timeout: Duration::from_millis(100),
                ..ObserverConfig::default()
            },
        )
    }

    #[tokio::test]
    async fn test_join_without_producer_is_room_not_found() {
        let broker = MemoryBroker::default();
        let mut observer = session(&broker);

        let room = RoomId::parse("A1B2C").unwrap();
        let result = observer.join_room(room.clone(), "Caster-A").await;
        assert!(matches!(result, Err(JoinError::RoomNotFound(r)) if r == room));
        assert!(observer.joined_room().is_none());
    }

    #[tokio::test]
    async fn test_join_confirmed_by_role_record() {
        let broker = MemoryBroker::default();
        let mut observer = session(&broker);
        let room = RoomId::parse("A1B2C").unwrap();

        // Stand in for the producer: answer the join with a role record.
        let producer_side = broker.transport();
        let mut join_rx = producer_side.subscribe("rooms/A1B2C/join").unwrap();
        tokio::task::yield_now().await;
        let answer = tokio::spawn(async move {
            let envelope = join_rx.recv().await.unwrap();
            let message = RoomMessage::decode(Purpose::Join, &envelope.payload).unwrap();
            let RoomMessage::Join(record) = message else {
                panic!("expected join record")
            };
            let role = RoomMessage::role(record.member_id, crate::protocol::MemberRole::Observer);
            producer_side
                .publish("rooms/A1B2C/role", role.encode().unwrap())
                .unwrap();
        });

        observer.join_room(room.clone(), "Caster-A").await.unwrap();
        answer.await.unwrap();

        assert_eq!(observer.joined_room(), Some(&room));
        // The mirror contains the observer itself.
        let members = observer.members().await;
        assert_eq!(members.len(), 1);
        assert_eq!(members[0].id, observer.member_id());
    }

    #[tokio::test]
    async fn test_second_join_rejected() {
        let broker = MemoryBroker::default();
        let mut observer = session(&broker);
        let room = RoomId::parse("A1B2C").unwrap();

        let producer_side = broker.transport();
        let mut join_rx = producer_side.subscribe("rooms/A1B2C/join").unwrap();
        tokio::task::yield_now().await;
        tokio::spawn(async move {
            let envelope = join_rx.recv().await.unwrap();
            let RoomMessage::Join(record) =
                RoomMessage::decode(Purpose::Join, &envelope.payload).unwrap()
            else {
                panic!("expected join record")
            };
            producer_side
                .publish(
                    "rooms/A1B2C/role",
                    RoomMessage::role(record.member_id, crate::protocol::MemberRole::Observer)
                        .encode()
                        .unwrap(),
                )
                .unwrap();
        });
        observer.join_room(room.clone(), "Caster-A").await.unwrap();

        let other = RoomId::parse("ZZZZZ").unwrap();
        assert!(matches!(
            observer.join_room(other, "Caster-A").await,
            Err(JoinError::AlreadyJoined(r)) if r == room
        ));
    }

    #[tokio::test]
    async fn test_leave_room_announces_and_resets() {
        let broker = MemoryBroker::default();
        let mut observer = session(&broker);
        let room = RoomId::parse("A1B2C").unwrap();

        let watcher = broker.transport();
        let mut leave_rx = watcher.subscribe("rooms/A1B2C/leave").unwrap();
        let producer_side = broker.transport();
        let mut join_rx = producer_side.subscribe("rooms/A1B2C/join").unwrap();
        tokio::task::yield_now().await;
        tokio::spawn(async move {
            let envelope = join_rx.recv().await.unwrap();
            let RoomMessage::Join(record) =
                RoomMessage::decode(Purpose::Join, &envelope.payload).unwrap()
            else {
                panic!("expected join record")
            };
            producer_side
                .publish(
                    "rooms/A1B2C/role",
                    RoomMessage::role(record.member_id, crate::protocol::MemberRole::Observer)
                        .encode()
                        .unwrap(),
                )
                .unwrap();
        });
        observer.join_room(room, "Caster-A").await.unwrap();

        observer.leave_room().await;
        assert!(observer.joined_room().is_none());

        let envelope = tokio::time::timeout(Duration::from_secs(1), leave_rx.recv())
            .await
            .unwrap()
            .unwrap();
        let RoomMessage::Leave(record) =
            RoomMessage::decode(Purpose::Leave, &envelope.payload).unwrap()
        else {
            panic!("expected leave record")
        };
        assert_eq!(record.member_id, observer.member_id());

        // Leaving again is a no-op.
        observer.leave_room().await;
    }
}
