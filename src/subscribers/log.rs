//! # Logging subscriber.
//!
//! [`LogWriter`] renders every broker event through `tracing`, one line per event.
//!
//! ## Output format
//! ```text
//! [client-connected] client=alpha
//! [epoch-advanced] client=alpha epoch=3 discarded=2
//! [throttle-started] queued=5000
//! [broker-state] state=Idle
//! [unload] suspend=true reason="session idle timeout"
//! ```

use async_trait::async_trait;
use tracing::{info, warn};

use crate::events::{Event, EventKind};
use crate::subscribers::Subscribe;

/// Logging subscriber. Enabled via the `logging` feature.
pub struct LogWriter;

#[async_trait]
impl Subscribe for LogWriter {
    async fn on_event(&self, e: &Event) {
        let client = e.client.as_deref().unwrap_or("-");
        match e.kind {
            EventKind::ClientConnected => info!("[client-connected] client={client}"),
            EventKind::ClientDisconnected => {
                info!("[client-disconnected] client={client} reason={:?}", e.reason)
            }
            EventKind::ClientPurged => {
                info!("[client-purged] client={client} discarded={:?}", e.count)
            }
            EventKind::SessionStateChanged => {
                info!("[session-state] client={client} state={:?}", e.session_state)
            }
            EventKind::AllClientsDone => info!("[all-clients-done]"),
            EventKind::RegistryEmpty => info!("[registry-empty]"),
            EventKind::DuplicateDropped => info!(
                "[duplicate] client={client} epoch={:?} message={:?}",
                e.epoch, e.reason
            ),
            EventKind::StaleRequestDropped => {
                info!("[stale-request] client={client} epoch={:?}", e.epoch)
            }
            EventKind::StaleFlushDropped => info!(
                "[stale-flush] client={client} epoch={:?} count={:?}",
                e.epoch, e.count
            ),
            EventKind::EpochAdvanced => info!(
                "[epoch-advanced] client={client} epoch={:?} discarded={:?}",
                e.epoch, e.count
            ),
            EventKind::ThrottleStarted => warn!("[throttle-started] queued={:?}", e.count),
            EventKind::ThrottleStopped => info!("[throttle-stopped] queued={:?}", e.count),
            EventKind::BrokerStateChanged => info!("[broker-state] state={:?}", e.broker_state),
            EventKind::UnloadRequested => {
                info!("[unload] suspend={:?} reason={:?}", e.suspend, e.reason)
            }
            EventKind::StoreFatal => warn!("[store-fatal] client={client} err={:?}", e.reason),
            EventKind::ShutdownRequested => info!("[shutdown-requested]"),
            EventKind::AllClosedWithinGrace => info!("[all-closed-within-grace]"),
            EventKind::GraceExceeded => warn!("[grace-exceeded]"),
            EventKind::SubscriberPanicked | EventKind::SubscriberOverflow => {
                warn!("[subscriber] {client} {:?}", e.reason)
            }
        }
    }

    fn name(&self) -> &'static str {
        "log-writer"
    }
}
