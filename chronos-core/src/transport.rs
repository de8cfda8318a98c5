//! The broker seam.
//!
//! The coordination core talks to the outside world through [`Transport`]:
//! publish bytes to a topic, subscribe to a topic pattern, disconnect.
//! Connection establishment lives on the concrete implementation — the core
//! never retries a failed connect (that is a UI action).
//!
//! [`MemoryBroker`] is the in-process implementation used by tests and
//! single-machine runs: a broadcast channel fanned out to pattern-matched
//! per-subscription queues. Delivery preserves per-publisher order within
//! the channel, the property the room protocol relies on.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};

/// One delivered message.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// Transport errors.
#[derive(Debug, Clone)]
pub enum TransportError {
    /// Broker unreachable or refused the connection.
    Connection(String),
    /// The transport was disconnected.
    Closed,
}

impl std::fmt::Display for TransportError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connection(e) => write!(f, "Connection error: {e}"),
            Self::Closed => write!(f, "Transport is disconnected"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Publish/subscribe access to the shared broker.
///
/// Subscriptions deliver asynchronously through an unbounded queue; dropping
/// the receiver ends the subscription.
pub trait Transport: Send + Sync {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError>;

    fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError>;

    fn disconnect(&self);
}

/// Match a topic against a subscription pattern.
///
/// Grammar (the broker subset the protocol relies on): `+` matches exactly
/// one level, a trailing `#` matches any remainder, every other segment
/// matches literally.
pub fn topic_matches(pattern: &str, topic: &str) -> bool {
    let mut pattern_segments = pattern.split('/');
    let mut topic_segments = topic.split('/');

    loop {
        match (pattern_segments.next(), topic_segments.next()) {
            (Some("#"), _) => return pattern_segments.next().is_none(),
            (Some("+"), Some(_)) => continue,
            (Some(p), Some(t)) if p == t => continue,
            (None, None) => return true,
            _ => return false,
        }
    }
}

/// In-process pub/sub broker.
///
/// Every transport handle shares one fan-out channel; each subscription runs
/// a forwarding task that filters by pattern. A subscriber that falls behind
/// the channel capacity drops the missed messages with a warning rather than
/// stalling publishers.
#[derive(Clone)]
pub struct MemoryBroker {
    sender: broadcast::Sender<Envelope>,
}

impl MemoryBroker {
    /// Create a broker buffering up to `capacity` undelivered messages per
    /// subscriber.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Hand out a transport handle, as a fresh client connection would.
    pub fn transport(&self) -> MemoryTransport {
        MemoryTransport {
            sender: self.sender.clone(),
            closed: Arc::new(AtomicBool::new(false)),
        }
    }
}

impl Default for MemoryBroker {
    fn default() -> Self {
        Self::new(256)
    }
}

/// One client connection to a [`MemoryBroker`].
#[derive(Clone)]
pub struct MemoryTransport {
    sender: broadcast::Sender<Envelope>,
    closed: Arc<AtomicBool>,
}

impl Transport for MemoryTransport {
    fn publish(&self, topic: &str, payload: Vec<u8>) -> Result<(), TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }
        // No subscribers is not an error: pub/sub traffic is fire-and-forget.
        let _ = self.sender.send(Envelope {
            topic: topic.to_string(),
            payload,
        });
        Ok(())
    }

    fn subscribe(
        &self,
        pattern: &str,
    ) -> Result<mpsc::UnboundedReceiver<Envelope>, TransportError> {
        if self.closed.load(Ordering::Relaxed) {
            return Err(TransportError::Closed);
        }

        let mut feed = self.sender.subscribe();
        let (tx, rx) = mpsc::unbounded_channel();
        let pattern = pattern.to_string();
        let closed = self.closed.clone();

        tokio::spawn(async move {
            loop {
                match feed.recv().await {
                    Ok(envelope) => {
                        if closed.load(Ordering::Relaxed) {
                            break;
                        }
                        if !topic_matches(&pattern, &envelope.topic) {
                            continue;
                        }
                        if tx.send(envelope).is_err() {
                            break; // Subscriber dropped the receiver.
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        log::warn!("subscription {pattern} lagged by {n} messages");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });

        Ok(rx)
    }

    fn disconnect(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}
