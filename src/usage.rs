//! Resource-usage reporting hook.
//!
//! The hosting process injects a [`UsageReporter`] to feed its autoscaling and
//! accounting; the registry calls it when clients come and go.

use crate::ledger::ClientTotals;
use crate::session::ClientId;

/// Receives client arrivals and final per-client counts.
pub trait UsageReporter: Send + Sync + 'static {
    fn client_connected(&self, _client: &ClientId) {}

    /// Called once per session leaving the registry, purged or not.
    fn client_removed(&self, _client: &ClientId, _totals: &ClientTotals) {}
}

/// Reporter that ignores everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopUsage;

impl UsageReporter for NoopUsage {}
