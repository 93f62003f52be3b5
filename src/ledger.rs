//! # Broker-wide counter ledger.
//!
//! [`CounterLedger`] tracks request/response flow for one broker instance and
//! raises throttling signals with hysteresis. The hot admission/completion path is
//! lock-free: flow counters are plain atomics, and the published invariants
//!
//! ```text
//! processed + processing <= total
//! directly_replied       <= processed
//! ```
//!
//! hold for every snapshot because writers and the reader agree on an **order**:
//!
//! ```text
//! writer (completion):   processing -= n  ──►  processed += n
//! writer (direct reply): processing -= 1  ──►  processed += 1  ──►  directly_replied += 1
//! writer (admission):    total += 1       ──►  (later, dispatch) processing += 1
//!
//! reader (snapshot):     directly_replied ──► processed ──► processing ──► total
//! ```
//!
//! A unit moving from `processing` to `processed` is therefore seen in at most one
//! of the two, and anything counted in either was already admitted to `total`.
//! Purge counters change as a group and sit behind a small mutex.

use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::events::{Bus, Event, EventKind};

/// Counters folded in from purged clients; persisted by the hosting process.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct PurgeCounters {
    /// Requests that belonged to purged clients.
    pub total: i64,
    /// Of those, requests already processed at purge time.
    pub processed: i64,
    /// Of those, requests that failed.
    pub failed: i64,
}

/// Final per-client totals reported when a client is removed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ClientTotals {
    /// Requests the client had admitted.
    pub total: i64,
    /// Requests processed.
    pub processed: i64,
    /// Requests failed.
    pub failed: i64,
}

/// Point-in-time view of the ledger.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Counters {
    pub total: i64,
    pub processed: i64,
    pub processing: i64,
    pub directly_replied: i64,
    pub reply_fetched: i64,
    pub reemitted: i64,
    pub queued: i64,
    pub throttling: bool,
    pub purged: PurgeCounters,
}

impl Counters {
    /// Requests still owed a response: `total - processed - purged.total + purged.processed`.
    pub fn outstanding(&self) -> i64 {
        self.total - self.processed - self.purged.total + self.purged.processed
    }
}

/// Atomic counters for one broker instance.
pub struct CounterLedger {
    total: AtomicI64,
    processed: AtomicI64,
    processing: AtomicI64,
    directly_replied: AtomicI64,
    reply_fetched: AtomicI64,
    reemitted: AtomicI64,

    queued: AtomicI64,
    throttling: AtomicBool,
    /// `(start, stop)`; `None` disables throttling.
    thresholds: Option<(u64, u64)>,

    purged: Mutex<PurgeCounters>,
    bus: Bus,
}

impl CounterLedger {
    /// Creates a ledger seeded with persisted purge counters.
    pub fn new(thresholds: Option<(u64, u64)>, purged: PurgeCounters, bus: Bus) -> Self {
        Self {
            total: AtomicI64::new(0),
            processed: AtomicI64::new(0),
            processing: AtomicI64::new(0),
            directly_replied: AtomicI64::new(0),
            reply_fetched: AtomicI64::new(0),
            reemitted: AtomicI64::new(0),
            queued: AtomicI64::new(0),
            throttling: AtomicBool::new(false),
            thresholds,
            purged: Mutex::new(purged),
            bus,
        }
    }

    /// Folds the persisted counts of a reattached client into the flow counters.
    pub fn restore_client(&self, total: i64, processed: i64) {
        self.total.fetch_add(total, Ordering::SeqCst);
        self.processed.fetch_add(processed, Ordering::SeqCst);
    }

    /// One request admitted: `total += 1`, then the queue grows and may start throttling.
    ///
    /// Returns `true` if this admission started throttling.
    pub fn request_admitted(&self) -> bool {
        self.total.fetch_add(1, Ordering::SeqCst);
        let queued = self.queued.fetch_add(1, Ordering::SeqCst) + 1;

        let Some((start, _)) = self.thresholds else {
            return false;
        };
        if queued >= start as i64
            && self
                .throttling
                .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!(queued, start, "message throttling started");
            self.bus
                .publish(Event::new(EventKind::ThrottleStarted).with_count(queued as u64));
            return true;
        }
        false
    }

    /// Unflushed requests were thrown away (epoch bump or purge): `total -= n`.
    pub fn requests_discarded(&self, n: i64) {
        if n <= 0 {
            return;
        }
        self.total.fetch_sub(n, Ordering::SeqCst);
        self.dequeue(n);
    }

    /// `n` requests handed to backend workers: `processing += n`, queue shrinks.
    ///
    /// Returns `true` if this dispatch stopped throttling.
    pub fn requests_dispatched(&self, n: i64) -> bool {
        self.processing.fetch_add(n, Ordering::SeqCst);
        self.dequeue(n)
    }

    /// A dispatched request was returned for redelivery: `processing -= 1`, `reemitted += 1`.
    pub fn request_reemitted(&self) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
        self.reemitted.fetch_add(1, Ordering::SeqCst);
        self.queued.fetch_add(1, Ordering::SeqCst);
    }

    /// `n` responses persisted: `processing -= n` **then** `processed += n`.
    pub fn responses_processed(&self, n: i64) {
        self.processing.fetch_sub(n, Ordering::SeqCst);
        self.processed.fetch_add(n, Ordering::SeqCst);
    }

    /// Response returned to the client without storage.
    ///
    /// `processing -= 1`, `processed += 1`, **then** `directly_replied += 1`.
    pub fn direct_reply(&self) {
        self.processing.fetch_sub(1, Ordering::SeqCst);
        self.processed.fetch_add(1, Ordering::SeqCst);
        self.directly_replied.fetch_add(1, Ordering::SeqCst);
    }

    /// Client fetched `n` stored responses.
    pub fn replies_fetched(&self, n: i64) {
        self.reply_fetched.fetch_add(n, Ordering::SeqCst);
    }

    /// Folds a purged client's final totals into the purge counters.
    pub fn client_purged(&self, totals: ClientTotals) {
        let mut purged = self.purged.lock();
        purged.total += totals.total;
        purged.processed += totals.processed;
        purged.failed += totals.failed;
        debug!(
            purged_total = purged.total,
            purged_processed = purged.processed,
            purged_failed = purged.failed,
            "client purge folded into ledger"
        );
    }

    /// Current purge counters (for persistence by the hosting process).
    pub fn purge_counters(&self) -> PurgeCounters {
        *self.purged.lock()
    }

    /// True while throttling is active.
    pub fn is_throttling(&self) -> bool {
        self.throttling.load(Ordering::SeqCst)
    }

    /// Takes a snapshot that satisfies the ledger invariants.
    pub fn snapshot(&self) -> Counters {
        let directly_replied = self.directly_replied.load(Ordering::SeqCst);
        let processed = self.processed.load(Ordering::SeqCst);
        let processing = self.processing.load(Ordering::SeqCst);
        let total = self.total.load(Ordering::SeqCst);
        let reemitted = self.reemitted.load(Ordering::SeqCst);
        let reply_fetched = self.reply_fetched.load(Ordering::SeqCst);
        let queued = self.queued.load(Ordering::SeqCst);
        let throttling = self.throttling.load(Ordering::SeqCst);
        let purged = *self.purged.lock();

        Counters {
            total,
            processed,
            processing,
            directly_replied,
            reply_fetched,
            reemitted,
            queued,
            throttling,
            purged,
        }
    }

    /// Shrinks the queue by `n` (never below zero) and may stop throttling.
    fn dequeue(&self, n: i64) -> bool {
        let prev = self
            .queued
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |q| Some((q - n).max(0)))
            .unwrap_or_else(|q| q);
        let queued = (prev - n).max(0);

        let Some((_, stop)) = self.thresholds else {
            return false;
        };
        if queued <= stop as i64
            && self
                .throttling
                .compare_exchange(true, false, Ordering::SeqCst, Ordering::SeqCst)
                .is_ok()
        {
            warn!(queued, stop, "message throttling stopped");
            self.bus
                .publish(Event::new(EventKind::ThrottleStopped).with_count(queued as u64));
            return true;
        }
        false
    }
}
