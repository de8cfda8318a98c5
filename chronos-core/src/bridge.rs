//! The local game-client seam.
//!
//! On the observer side a sync request ends in a call against the local
//! client's Replay API. That protocol is not this crate's business: the
//! observer session only hands the received command to a
//! [`LocalClientBridge`] and interprets success or failure. The call is
//! treated as a blocking step — implementations may do blocking I/O — and is
//! run on the blocking pool under its own timeout by the session.

use std::time::Duration;

use crate::protocol::SyncRequestRecord;

/// Bridge failures, both carrying the reason reported back in the ack.
#[derive(Debug, Clone)]
pub enum BridgeError {
    /// The local client is unreachable (no replay loaded, API not up).
    Unavailable(String),
    /// The client refused or failed to apply the state change.
    Rejected(String),
}

impl BridgeError {
    /// The reason string transmitted in the failed ack.
    pub fn reason(&self) -> &str {
        match self {
            Self::Unavailable(r) | Self::Rejected(r) => r,
        }
    }
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unavailable(r) => write!(f, "local client unavailable: {r}"),
            Self::Rejected(r) => write!(f, "local client rejected sync: {r}"),
        }
    }
}

impl std::error::Error for BridgeError {}

/// Applies a sync command to the local game client.
pub trait LocalClientBridge: Send + Sync {
    fn apply_sync(&self, request: &SyncRequestRecord) -> Result<(), BridgeError>;
}

/// Test double: every sync applies cleanly.
pub struct AppliedBridge;

impl LocalClientBridge for AppliedBridge {
    fn apply_sync(&self, _request: &SyncRequestRecord) -> Result<(), BridgeError> {
        Ok(())
    }
}

/// Test double: every sync is rejected with a fixed reason.
pub struct FailingBridge {
    pub reason: String,
}

impl FailingBridge {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl LocalClientBridge for FailingBridge {
    fn apply_sync(&self, _request: &SyncRequestRecord) -> Result<(), BridgeError> {
        Err(BridgeError::Rejected(self.reason.clone()))
    }
}

/// Test double: blocks for a fixed delay before applying, to exercise the
/// session's bridge timeout.
pub struct SlowBridge {
    pub delay: Duration,
}

impl SlowBridge {
    pub fn new(delay: Duration) -> Self {
        Self { delay }
    }
}

impl LocalClientBridge for SlowBridge {
    fn apply_sync(&self, _request: &SyncRequestRecord) -> Result<(), BridgeError> {
        std::thread::sleep(self.delay);
        Ok(())
    }
}
