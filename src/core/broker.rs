//! # Broker: wires sessions, the ledger and the lifecycle, and drives unload.
//!
//! The [`Broker`] owns the event bus, the [`CounterLedger`], the
//! [`BrokerLifecycle`], the [`SessionRegistry`] and a [`SubscriberSet`]. It is
//! built by [`BrokerBuilder`](super::BrokerBuilder) and handed to the transport.
//!
//! ## High-level architecture
//! ```text
//! BrokerBuilder::build()
//!   ├─ Bus::new(cfg.bus_capacity)
//!   ├─ CounterLedger(thresholds, purge counters)
//!   ├─ BrokerLifecycle(cfg, context) ── start(): connection timeout armed
//!   ├─ SessionRegistry(factory, deps) ── spawn_listener()
//!   └─ subscriber_listener(): Bus ─► SubscriberSet::emit(&Event)
//!
//! Broker::run():
//!   ├─ lifecycle.unloaded()            ─► close sessions within grace ─► Ok(Unload)
//!   └─ wait_for_shutdown_signal()      ─► ShutdownRequested
//!                                        └─► lifecycle.unload(durable)
//!                                        └─► close sessions within grace:
//!                                               ├─ all closed → AllClosedWithinGrace
//!                                               └─ timeout    → GraceExceeded + Err
//! ```

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{BrokerLifecycle, Config, SessionRegistry, SharedContext, Unload, shutdown};
use crate::error::BrokerError;
use crate::events::{Bus, Event, EventKind};
use crate::ledger::CounterLedger;
use crate::subscribers::SubscriberSet;

/// One broker instance.
pub struct Broker {
    cfg: Config,
    bus: Bus,
    ledger: Arc<CounterLedger>,
    context: Arc<SharedContext>,
    lifecycle: Arc<BrokerLifecycle>,
    registry: Arc<SessionRegistry>,
    subs: Arc<SubscriberSet>,
    runtime_token: CancellationToken,
}

impl Broker {
    #[allow(clippy::too_many_arguments)]
    pub(super) fn new_internal(
        cfg: Config,
        bus: Bus,
        ledger: Arc<CounterLedger>,
        context: Arc<SharedContext>,
        lifecycle: Arc<BrokerLifecycle>,
        registry: Arc<SessionRegistry>,
        subs: Arc<SubscriberSet>,
        runtime_token: CancellationToken,
    ) -> Self {
        Self {
            cfg,
            bus,
            ledger,
            context,
            lifecycle,
            registry,
            subs,
            runtime_token,
        }
    }

    pub fn config(&self) -> &Config {
        &self.cfg
    }

    pub fn bus(&self) -> &Bus {
        &self.bus
    }

    pub fn ledger(&self) -> &Arc<CounterLedger> {
        &self.ledger
    }

    pub fn context(&self) -> &Arc<SharedContext> {
        &self.context
    }

    pub fn lifecycle(&self) -> &Arc<BrokerLifecycle> {
        &self.lifecycle
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Subscribes to the bus and forwards events to the subscriber set (fire-and-forget).
    pub(super) fn subscriber_listener(&self) {
        if self.subs.is_empty() {
            return;
        }
        let mut rx = self.bus.subscribe();
        let set = Arc::clone(&self.subs);
        let rt = self.runtime_token.clone();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rt.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => set.emit(&ev),
                        Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "subscriber listener lagged");
                        }
                    }
                }
            }
        });
    }

    /// Runs until the lifecycle unloads or a termination signal arrives.
    ///
    /// Marks the shared context initialized, then waits. Either way every
    /// remaining session is closed within [`Config::shutdown_grace`]; sessions
    /// still open after that are reported through [`BrokerError::GraceExceeded`].
    pub async fn run(&self) -> Result<Unload, BrokerError> {
        self.context.initialized.set();

        let signal = async {
            match shutdown::wait_for_shutdown_signal().await {
                Ok(received) => received,
                Err(err) => {
                    warn!(error = %err, "signal handlers unavailable; waiting for unload only");
                    std::future::pending().await
                }
            }
        };

        let decision = tokio::select! {
            decision = self.lifecycle.unloaded() => decision,
            received = signal => {
                info!(signal = %received, "shutdown signal received");
                self.bus.publish(
                    Event::new(EventKind::ShutdownRequested).with_reason(received.as_str()),
                );
                self.lifecycle.unload(self.context.is_durable(), "shutdown signal");
                self.lifecycle.unloaded().await
            }
        };

        let closed = self.close_with_grace().await;
        self.subs.shutdown().await;
        self.runtime_token.cancel();
        closed.map(|()| decision)
    }

    /// Closes every session within the grace period.
    async fn close_with_grace(&self) -> Result<(), BrokerError> {
        let grace = self.cfg.shutdown_grace;
        let registry = Arc::clone(&self.registry);
        let pending = registry.sessions().await;
        let closing = tokio::spawn(async move { registry.close_all().await });

        match tokio::time::timeout(grace, closing).await {
            Ok(_) => {
                self.bus.publish(Event::new(EventKind::AllClosedWithinGrace));
                Ok(())
            }
            Err(_) => {
                warn!(?grace, "sessions did not close within grace");
                self.bus.publish(Event::new(EventKind::GraceExceeded));
                let stuck = pending
                    .iter()
                    .filter(|s| !s.is_released())
                    .map(|s| s.client_id().to_string())
                    .collect();
                Err(BrokerError::GraceExceeded { grace, stuck })
            }
        }
    }
}
