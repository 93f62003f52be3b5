//! # Runtime events emitted by sessions, the registry, the ledger and the lifecycle.
//!
//! The [`EventKind`] enum classifies event types across four categories:
//! - **Client events**: sessions connected, disconnected, purged or changing state
//! - **Admission events**: duplicates, stale generations, epoch bumps
//! - **Flow events**: throttling hysteresis
//! - **Broker events**: lifecycle transitions, unload, fatal escalation, shutdown
//!
//! The [`Event`] struct carries metadata such as timestamps, client id,
//! epochs, counts and reasons.
//!
//! ## Ordering guarantees
//! Each event has a globally unique sequence number (`seq`) that increases monotonically.
//!
//! ## Example
//! ```rust
//! use brokerline::{Event, EventKind};
//!
//! let ev = Event::new(EventKind::EpochAdvanced)
//!     .with_client("client-a")
//!     .with_epoch(4)
//!     .with_count(2);
//!
//! assert_eq!(ev.kind, EventKind::EpochAdvanced);
//! assert_eq!(ev.client.as_deref(), Some("client-a"));
//! assert_eq!(ev.count, Some(2));
//! ```

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::SystemTime;

use crate::core::BrokerState;
use crate::session::SessionState;

/// Global sequence counter for event ordering.
static EVENT_SEQ: AtomicU64 = AtomicU64::new(0);

/// Classification of runtime events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    // === Subscriber events ===
    /// Subscriber panicked during event processing.
    ///
    /// Sets:
    /// - `client`: subscriber name
    /// - `reason`: panic info/message
    SubscriberPanicked,

    /// Subscriber dropped an event (queue full or worker closed).
    ///
    /// Sets:
    /// - `client`: subscriber name
    /// - `reason`: reason string (e.g., "full", "closed")
    SubscriberOverflow,

    // === Client events ===
    /// A session was created for a client.
    ///
    /// Sets:
    /// - `client`: client id
    ClientConnected,

    /// A session reached `Disconnected` on its own (idle, all done, sync disconnect).
    ///
    /// Sets:
    /// - `client`: client id
    /// - `reason`: what triggered the disconnect
    ClientDisconnected,

    /// A session was purged together with its buffered work.
    ///
    /// Sets:
    /// - `client`: client id
    /// - `count`: requests discarded by the purge
    ClientPurged,

    /// A session moved between states.
    ///
    /// Sets:
    /// - `client`: client id
    /// - `session_state`: new state
    SessionStateChanged,

    /// Every registered session is done (`AllRequestDone` / `GetResponseOnly`).
    AllClientsDone,

    /// The last session left the registry.
    RegistryEmpty,

    // === Admission events ===
    /// A repeated `(epoch, message_id)` pair was dropped.
    ///
    /// Sets:
    /// - `client`, `epoch`, `reason` (message id)
    DuplicateDropped,

    /// A request from an older batch epoch was dropped.
    ///
    /// Sets:
    /// - `client`, `epoch` (the stale epoch)
    StaleRequestDropped,

    /// A flush from an older batch epoch was dropped.
    ///
    /// Sets:
    /// - `client`, `epoch` (the stale epoch), `count`
    StaleFlushDropped,

    /// A newer batch epoch was accepted and older unflushed work discarded.
    ///
    /// Sets:
    /// - `client`, `epoch` (new epoch), `count` (discarded requests)
    EpochAdvanced,

    // === Flow events ===
    /// Queued message count crossed the start threshold.
    ///
    /// Sets:
    /// - `count`: queued messages at the crossing
    ThrottleStarted,

    /// Queued message count fell to the stop threshold.
    ///
    /// Sets:
    /// - `count`: queued messages at the crossing
    ThrottleStopped,

    // === Broker events ===
    /// The broker lifecycle moved between states.
    ///
    /// Sets:
    /// - `broker_state`: new state
    BrokerStateChanged,

    /// The unload decision was taken (fires once).
    ///
    /// Sets:
    /// - `suspend`: whether the broker suspends rather than finishes
    /// - `reason`: trigger
    UnloadRequested,

    /// A store reported an unrecoverable condition; the job must fail.
    ///
    /// Sets:
    /// - `client`, `reason`
    StoreFatal,

    /// Shutdown requested (OS signal observed).
    ShutdownRequested,

    /// All sessions closed within the configured grace period.
    AllClosedWithinGrace,

    /// Grace period exceeded; some sessions did not close in time.
    GraceExceeded,
}

/// Runtime event with optional metadata.
///
/// - `seq`: monotonic global sequence for ordering
/// - `at`: wall-clock timestamp (for logs)
/// - other optional fields are set depending on the [`EventKind`]
#[derive(Clone, Debug)]
pub struct Event {
    /// Globally unique, monotonically increasing sequence number.
    pub seq: u64,
    /// Wall-clock timestamp.
    pub at: SystemTime,
    /// Event classification.
    pub kind: EventKind,

    /// Client (or subscriber) the event concerns.
    pub client: Option<Arc<str>>,
    /// Human-readable reason (errors, overflow details, message ids).
    pub reason: Option<Arc<str>>,
    /// Batch epoch involved.
    pub epoch: Option<i64>,
    /// Count of requests/messages involved.
    pub count: Option<u64>,
    /// New session state for `SessionStateChanged`.
    pub session_state: Option<SessionState>,
    /// New broker state for `BrokerStateChanged`.
    pub broker_state: Option<BrokerState>,
    /// Unload mode for `UnloadRequested`.
    pub suspend: Option<bool>,
}

impl Event {
    /// Creates a new event of the given kind with current timestamp and next sequence number.
    pub fn new(kind: EventKind) -> Self {
        Self {
            seq: EVENT_SEQ.fetch_add(1, AtomicOrdering::Relaxed),
            at: SystemTime::now(),
            kind,
            client: None,
            reason: None,
            epoch: None,
            count: None,
            session_state: None,
            broker_state: None,
            suspend: None,
        }
    }

    /// Attaches a human-readable reason.
    #[inline]
    pub fn with_reason(mut self, reason: impl Into<Arc<str>>) -> Self {
        self.reason = Some(reason.into());
        self
    }

    /// Attaches a client id.
    #[inline]
    pub fn with_client(mut self, client: impl Into<Arc<str>>) -> Self {
        self.client = Some(client.into());
        self
    }

    /// Attaches a batch epoch.
    #[inline]
    pub fn with_epoch(mut self, epoch: i64) -> Self {
        self.epoch = Some(epoch);
        self
    }

    /// Attaches a request/message count.
    #[inline]
    pub fn with_count(mut self, count: u64) -> Self {
        self.count = Some(count);
        self
    }

    /// Attaches the new session state.
    #[inline]
    pub fn with_session_state(mut self, state: SessionState) -> Self {
        self.session_state = Some(state);
        self
    }

    /// Attaches the new broker state.
    #[inline]
    pub fn with_broker_state(mut self, state: BrokerState) -> Self {
        self.broker_state = Some(state);
        self
    }

    /// Attaches the unload mode.
    #[inline]
    pub fn with_suspend(mut self, suspend: bool) -> Self {
        self.suspend = Some(suspend);
        self
    }

    /// Creates a subscriber overflow event.
    #[inline]
    pub fn subscriber_overflow(subscriber: &'static str, reason: &'static str) -> Self {
        Event::new(EventKind::SubscriberOverflow)
            .with_client(subscriber)
            .with_reason(format!("subscriber={subscriber} reason={reason}"))
    }

    /// Creates a subscriber panic event.
    #[inline]
    pub fn subscriber_panicked(subscriber: &'static str, info: String) -> Self {
        Event::new(EventKind::SubscriberPanicked)
            .with_client(subscriber)
            .with_reason(info)
    }

    #[inline]
    pub fn is_subscriber_overflow(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberOverflow)
    }

    #[inline]
    pub fn is_subscriber_panic(&self) -> bool {
        matches!(self.kind, EventKind::SubscriberPanicked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sequence_numbers_increase() {
        let a = Event::new(EventKind::ClientConnected);
        let b = Event::new(EventKind::ClientConnected);
        assert!(b.seq > a.seq);
    }

    #[test]
    fn subscriber_helpers_tag_kind() {
        let ev = Event::subscriber_overflow("audit", "full");
        assert!(ev.is_subscriber_overflow());
        assert_eq!(ev.reason.as_deref(), Some("subscriber=audit reason=full"));
        assert!(Event::subscriber_panicked("audit", "boom".into()).is_subscriber_panic());
    }
}
