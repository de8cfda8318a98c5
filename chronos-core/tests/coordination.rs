//! End-to-end producer/observer coordination over the in-process broker.
//!
//! These tests wire real sessions to a real (in-memory) broker and drive
//! the full join → assign → sync → ack pipeline.

use std::sync::Arc;
use std::time::Duration;

use chronos_core::bridge::{AppliedBridge, FailingBridge, LocalClientBridge, SlowBridge};
use chronos_core::observer::{ObserverConfig, ObserverEvent, ObserverSession};
use chronos_core::producer::{ProducerConfig, ProducerEvent, ProducerSession};
use chronos_core::sync::{CancelReason, MemberOutcome, SyncDisposition};
use chronos_core::transport::MemoryBroker;
use chronos_core::{MemberId, ProducerError, TargetScope};
use tokio::time::timeout;

fn producer(broker: &MemoryBroker, config: ProducerConfig) -> ProducerSession {
    ProducerSession::new(Arc::new(broker.transport()), config)
}

fn observer(
    broker: &MemoryBroker,
    bridge: impl LocalClientBridge + 'static,
) -> ObserverSession {
    ObserverSession::new(
        Arc::new(broker.transport()),
        Arc::new(bridge),
        ObserverConfig::default(),
    )
}

/// Wait for a specific producer event, draining others.
async fn expect_event<T>(
    rx: &mut tokio::sync::mpsc::Receiver<ProducerEvent>,
    mut pick: impl FnMut(&ProducerEvent) -> Option<T>,
) -> T {
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if let Some(value) = pick(&event) {
                return value;
            }
        }
    })
    .await
    .expect("expected event never arrived")
}

#[tokio::test]
async fn test_full_sync_pipeline_completes() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let mut events = producer.take_event_rx().await.unwrap();

    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let o1_id = o1.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();

    // Producer saw the join.
    let joined = expect_event(&mut events, |e| match e {
        ProducerEvent::MemberJoined { member, label, .. } => {
            Some((*member, label.clone()))
        }
        _ => None,
    })
    .await;
    assert_eq!(joined, (o1_id, "Caster-A".to_string()));

    // Assign the main observer; the observer's mirror converges.
    let change = producer.assign_main_observer(&room, o1_id).await.unwrap();
    assert_eq!(change.promoted, o1_id);
    timeout(Duration::from_secs(2), async {
        loop {
            if o1.main_observer().await == Some(o1_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("mirror never saw the role change");

    // Sync everyone; the bridge applies, so the command completes.
    let report = producer.request_sync(&room, TargetScope::All).await.unwrap();
    assert_eq!(report.disposition, SyncDisposition::Completed);
    assert_eq!(report.sequence, 1);
    assert_eq!(report.outcomes, vec![(o1_id, MemberOutcome::Applied)]);
    assert!(report.cancelled.is_none());
}

#[tokio::test]
async fn test_sync_with_multiple_observers() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let mut o2 = observer(&broker, AppliedBridge);
    o1.join_room(room.clone(), "Caster-A").await.unwrap();
    o2.join_room(room.clone(), "Caster-B").await.unwrap();

    let report = producer.request_sync(&room, TargetScope::All).await.unwrap();
    assert_eq!(report.disposition, SyncDisposition::Completed);
    assert_eq!(report.outcomes.len(), 2);
    assert!(report
        .outcomes
        .iter()
        .all(|(_, outcome)| *outcome == MemberOutcome::Applied));
}

#[tokio::test]
async fn test_bridge_failure_is_partial_failure() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let mut o2 = observer(&broker, FailingBridge::new("replay not loaded"));
    let o2_id = o2.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();
    o2.join_room(room.clone(), "Caster-B").await.unwrap();

    let report = producer.request_sync(&room, TargetScope::All).await.unwrap();
    assert_eq!(report.disposition, SyncDisposition::PartiallyFailed);
    assert_eq!(report.failed_members(), vec![(o2_id, "replay not loaded")]);
    assert!(report.unresponsive_members().is_empty());
}

#[tokio::test]
async fn test_sync_targeting_absent_member_times_out() {
    let broker = MemoryBroker::default();
    let config = ProducerConfig {
        sync_timeout: Duration::from_millis(200),
        ..ProducerConfig::default()
    };
    let producer = producer(&broker, config);
    let room = producer.create_room().await.unwrap();

    // O2 never joined anything.
    let ghost = MemberId::new();
    let report = producer
        .request_sync(&room, TargetScope::Member(ghost))
        .await
        .unwrap();

    assert_eq!(report.disposition, SyncDisposition::TimedOut);
    assert_eq!(report.unresponsive_members(), vec![ghost]);
    assert!(report.cancelled.is_none());
}

#[tokio::test]
async fn test_second_sync_supersedes_first() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    // The slow bridge keeps the first command's ack in flight long enough
    // for the second command to displace it.
    let mut o1 = observer(&broker, SlowBridge::new(Duration::from_millis(300)));
    let o1_id = o1.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();

    let producer = Arc::new(producer);
    let first = {
        let producer = producer.clone();
        let room = room.clone();
        tokio::spawn(async move { producer.request_sync(&room, TargetScope::All).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let second = producer.request_sync(&room, TargetScope::All).await.unwrap();
    let first = first.await.unwrap().unwrap();

    assert_eq!(first.sequence, 1);
    assert_eq!(first.disposition, SyncDisposition::TimedOut);
    assert_eq!(first.cancelled, Some(CancelReason::Superseded));

    // The first command's late ack was discarded; the second resolved on
    // its own ack alone.
    assert_eq!(second.sequence, 2);
    assert_eq!(second.disposition, SyncDisposition::Completed);
    assert_eq!(second.outcomes, vec![(o1_id, MemberOutcome::Applied)]);
}

#[tokio::test]
async fn test_close_room_cancels_in_flight_sync() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, SlowBridge::new(Duration::from_secs(2)));
    o1.join_room(room.clone(), "Caster-A").await.unwrap();

    let producer = Arc::new(producer);
    let pending = {
        let producer = producer.clone();
        let room = room.clone();
        tokio::spawn(async move { producer.request_sync(&room, TargetScope::All).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    producer.close_room(&room).await;

    let report = timeout(Duration::from_secs(1), pending)
        .await
        .expect("cancellation must resolve the waiter promptly")
        .unwrap()
        .unwrap();
    assert_eq!(report.disposition, SyncDisposition::TimedOut);
    assert_eq!(report.cancelled, Some(CancelReason::RoomClosed));
}

#[tokio::test]
async fn test_heartbeat_timeout_clears_role_then_assignment_fails() {
    let broker = MemoryBroker::default();
    let config = ProducerConfig {
        heartbeat_interval: Duration::from_millis(100),
        heartbeat_misses: 3,
        ..ProducerConfig::default()
    };
    let producer = producer(&broker, config);
    let mut events = producer.take_event_rx().await.unwrap();
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let o1_id = o1.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();
    producer.assign_main_observer(&room, o1_id).await.unwrap();

    // Drop the session: heartbeats stop with no leave message, exactly as
    // a crashed client would go silent.
    drop(o1);

    let timed_out = expect_event(&mut events, |e| match e {
        ProducerEvent::MemberTimedOut { member, .. } => Some(*member),
        _ => None,
    })
    .await;
    assert_eq!(timed_out, o1_id);

    let cleared = expect_event(&mut events, |e| match e {
        ProducerEvent::RoleChanged { main_observer, .. } => Some(*main_observer),
        _ => None,
    })
    .await;
    assert_eq!(cleared, None);

    // The timed-out member can no longer hold the role.
    let result = producer.assign_main_observer(&room, o1_id).await;
    assert!(matches!(result, Err(ProducerError::Role(_))));
}

#[tokio::test]
async fn test_leave_shrinks_sync_targets() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let mut events = producer.take_event_rx().await.unwrap();
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let mut o2 = observer(&broker, AppliedBridge);
    let o2_id = o2.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();
    o2.join_room(room.clone(), "Caster-B").await.unwrap();

    o2.leave_room().await;
    let left = expect_event(&mut events, |e| match e {
        ProducerEvent::MemberLeft { member, .. } => Some(*member),
        _ => None,
    })
    .await;
    assert_eq!(left, o2_id);

    let report = producer.request_sync(&room, TargetScope::All).await.unwrap();
    assert_eq!(report.disposition, SyncDisposition::Completed);
    assert_eq!(report.outcomes.len(), 1, "only the remaining member is targeted");
}

#[tokio::test]
async fn test_late_joiner_mirror_converges() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let o1_id = o1.member_id();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();
    producer.assign_main_observer(&room, o1_id).await.unwrap();

    // O2 joins after the fact; the roster replay and the standing role
    // assignment bring its mirror up to date.
    let mut o2 = observer(&broker, AppliedBridge);
    o2.join_room(room.clone(), "Caster-B").await.unwrap();

    timeout(Duration::from_secs(2), async {
        loop {
            let members = o2.members().await;
            if members.len() == 2 && o2.main_observer().await == Some(o1_id) {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    })
    .await
    .expect("late joiner's mirror never converged");
}

#[tokio::test]
async fn test_observer_events_report_sync_outcomes() {
    let broker = MemoryBroker::default();
    let producer = producer(&broker, ProducerConfig::default());
    let room = producer.create_room().await.unwrap();

    let mut o1 = observer(&broker, AppliedBridge);
    let mut o1_events = o1.take_event_rx().unwrap();
    o1.join_room(room.clone(), "Caster-A").await.unwrap();

    producer.request_sync(&room, TargetScope::All).await.unwrap();

    let applied = timeout(Duration::from_secs(5), async {
        loop {
            match o1_events.recv().await.expect("event channel closed") {
                ObserverEvent::SyncApplied { sequence } => return sequence,
                _ => continue,
            }
        }
    })
    .await
    .expect("observer never reported the applied sync");
    assert_eq!(applied, 1);
}
