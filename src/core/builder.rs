use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use super::{Broker, BrokerLifecycle, Config, SessionRegistry, SharedContext};
use crate::{
    events::Bus,
    ledger::{CounterLedger, PurgeCounters},
    session::SessionDeps,
    store::{MemoryStoreFactory, StoreFactory},
    subscribers::{Subscribe, SubscriberSet},
    usage::{NoopUsage, UsageReporter},
};

/// Builder for constructing a [`Broker`] with its collaborators.
pub struct BrokerBuilder {
    cfg: Config,
    factory: Option<Arc<dyn StoreFactory>>,
    subscribers: Vec<Arc<dyn Subscribe>>,
    usage: Arc<dyn UsageReporter>,
    purged: PurgeCounters,
    context: Option<Arc<SharedContext>>,
}

impl BrokerBuilder {
    /// Creates a new builder with the given configuration.
    pub fn new(cfg: Config) -> Self {
        Self {
            cfg,
            factory: None,
            subscribers: Vec::new(),
            usage: Arc::new(NoopUsage),
            purged: PurgeCounters::default(),
            context: None,
        }
    }

    /// Sets the store factory. Defaults to [`MemoryStoreFactory`].
    pub fn with_store_factory(mut self, factory: Arc<dyn StoreFactory>) -> Self {
        self.factory = Some(factory);
        self
    }

    /// Sets event subscribers for observability.
    ///
    /// Subscribers receive broker events through dedicated workers with bounded queues.
    pub fn with_subscribers(mut self, subscribers: Vec<Arc<dyn Subscribe>>) -> Self {
        self.subscribers = subscribers;
        self
    }

    /// Sets the resource-usage reporter.
    pub fn with_usage(mut self, usage: Arc<dyn UsageReporter>) -> Self {
        self.usage = usage;
        self
    }

    /// Seeds the ledger with purge counters persisted by a previous run.
    pub fn with_purge_counters(mut self, purged: PurgeCounters) -> Self {
        self.purged = purged;
        self
    }

    /// Shares an existing context instead of creating one from `cfg.durable`.
    pub fn with_context(mut self, context: Arc<SharedContext>) -> Self {
        self.context = Some(context);
        self
    }

    /// Builds the broker, arms the lifecycle and spawns the listeners.
    ///
    /// Must be called inside a Tokio runtime.
    pub fn build(self) -> Arc<Broker> {
        let bus = Bus::new(self.cfg.bus_capacity_clamped());
        let runtime_token = CancellationToken::new();
        let context = self
            .context
            .unwrap_or_else(|| Arc::new(SharedContext::new(self.cfg.durable)));
        let ledger = Arc::new(CounterLedger::new(
            self.cfg.throttle_thresholds(),
            self.purged,
            bus.clone(),
        ));
        let lifecycle = BrokerLifecycle::new(&self.cfg, Arc::clone(&context), bus.clone());
        let factory = self
            .factory
            .unwrap_or_else(|| Arc::new(MemoryStoreFactory::new()) as Arc<dyn StoreFactory>);

        let registry = SessionRegistry::new(
            factory,
            SessionDeps {
                ledger: Arc::clone(&ledger),
                bus: bus.clone(),
                context: Arc::clone(&context),
                idle_timeout: self.cfg.client_idle_timeout(),
            },
            Arc::clone(&lifecycle),
            self.usage,
            runtime_token.clone(),
        );
        let subs = Arc::new(SubscriberSet::new(self.subscribers, bus.clone()));

        let broker = Arc::new(Broker::new_internal(
            self.cfg,
            bus,
            ledger,
            context,
            Arc::clone(&lifecycle),
            Arc::clone(&registry),
            subs,
            runtime_token,
        ));

        registry.spawn_listener();
        broker.subscriber_listener();
        lifecycle.start();
        broker
    }
}
