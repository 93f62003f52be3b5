//! # brokerline
//!
//! **Brokerline** is the client-session and flow-control core of a
//! request/response message broker.
//!
//! It tracks every attached client as a [`ClientSession`], admits and flushes
//! their requests into a [`RequestStore`], keeps broker-wide counters in a
//! [`CounterLedger`] (with throttling hysteresis), and decides through the
//! [`BrokerLifecycle`] when the broker process should suspend or finish.
//! Transports, dispatchers and persistence engines plug in around it.
//!
//! ## Architecture
//! ### Overview
//! ```text
//!   transport (endpoints)                  dispatchers
//!          │ get_or_create / purge              │ requests_dispatched / responses_persisted
//!          ▼                                    ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │  Broker (runtime wiring)                                          │
//! │  - SessionRegistry (case-insensitive client ids, owner checks)    │
//! │  - BrokerLifecycle (Started/Running/Idle → Suspend/Finished)      │
//! │  - CounterLedger   (queued / dispatched / processed, throttling)  │
//! │  - SubscriberSet   (fans out to user subscribers)                 │
//! └──────┬──────────────────┬──────────────────┬───────────────┬──────┘
//!        ▼                  ▼                  ▼               │
//!     ┌──────────────┐   ┌──────────────┐   ┌──────────────┐   │
//!     │ClientSession │   │ClientSession │   │ClientSession │   │
//!     │ epoch + dedup│   │ epoch + dedup│   │ epoch + dedup│   │
//!     │ idle timeout │   │ idle timeout │   │ idle timeout │   │
//!     └┬─────────────┘   └┬─────────────┘   └┬─────────────┘   │
//!      │ RequestStore     │ RequestStore     │ RequestStore    │
//!      ▼                  ▼                  ▼                 ▼
//! ┌───────────────────────────────────────────────────────────────────┐
//! │                        Bus (broadcast channel)                    │
//! │                   (capacity: Config::bus_capacity)                │
//! └─────────────────────────────────┬─────────────────────────────────┘
//!                                   ▼
//!                ┌──────────────────┴───────────────────┐
//!                ▼                                      ▼
//!     registry listener                       subscriber_listener
//!  (evict on ClientDisconnected,                      │
//!   escalate StoreFatal)                        SubscriberSet
//! ```
//!
//! ### Session lifecycle
//! ```text
//! open() ─┬─► ClientConnected ──flush(eom)──► EndRequests ──all processed──► AllRequestDone
//!         ├─► EndRequests      (reattached, end-of-message already recorded)
//!         └─► GetResponseOnly  (reattached, every request already processed)
//!
//! any non-terminal ── disconnect() / idle timeout / purge() / done with no endpoint ──► Disconnected
//! ```
//!
//! ## Features
//! | Area              | Description                                                   | Key types / traits                         |
//! |-------------------|---------------------------------------------------------------|--------------------------------------------|
//! | **Sessions**      | Epoch-guarded admission, dedup, flush, idle disconnect.       | [`ClientSession`], [`ResponseReader`]      |
//! | **Registry**      | Lookup, creation, purge and eviction of sessions.             | [`SessionRegistry`]                        |
//! | **Flow control**  | Broker-wide counters and throttling hysteresis.               | [`CounterLedger`]                          |
//! | **Lifecycle**     | Connection and idle timeouts, latched unload decision.        | [`BrokerLifecycle`], [`Unload`]            |
//! | **Storage**       | Pluggable request persistence.                                | [`RequestStore`], [`StoreFactory`]         |
//! | **Subscriber API**| Hook into broker events (logging, metrics, custom).           | [`Subscribe`]                              |
//! | **Errors**        | Typed errors for sessions and stores.                         | [`BrokerError`], [`StoreError`]            |
//! | **Configuration** | Centralize broker settings.                                   | [`Config`]                                 |
//!
//! ## Optional features
//! - `logging`: exports a simple built-in [`LogWriter`] _(demo/reference only)_.
//!
//! ## Example
//! ```rust
//! use std::time::Duration;
//! use brokerline::{BrokerBuilder, ClientId, Config, Principal, Request};
//!
//! #[tokio::main(flavor = "current_thread")]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let cfg = Config::new(
//!         Duration::from_secs(60),  // client idle timeout
//!         Duration::from_secs(300), // connection timeout
//!         Duration::from_secs(30),  // session idle timeout
//!         10_000,                   // throttle start
//!         5_000,                    // throttle stop
//!     );
//!     let broker = BrokerBuilder::new(cfg).build();
//!
//!     let session = broker
//!         .registry()
//!         .get_or_create(&ClientId::new("client-a"), &Principal::anonymous())
//!         .await?;
//!     session.request_received(Request::new("m-1", b"payload".to_vec()), 0).await?;
//!     session.flush(1, 0, Duration::from_secs(5), true).await?;
//!
//!     assert_eq!(broker.ledger().snapshot().total, 1);
//!     Ok(())
//! }
//! ```
mod core;
mod error;
mod events;
mod ledger;
mod session;
mod store;
mod subscribers;
mod timeout;
mod usage;

// ---- Public re-exports ----

pub use crate::core::{
    Broker, BrokerBuilder, BrokerLifecycle, BrokerState, Config, Latch, SessionRegistry,
    SharedContext, Unload,
};
pub use error::{BrokerError, StoreError};
pub use events::{Bus, Event, EventKind};
pub use ledger::{ClientTotals, CounterLedger, Counters, PurgeCounters};
pub use session::{
    Admission, ClientId, ClientSession, EndpointId, FlushOutcome, Principal, ResponseReader,
    SessionDeps, SessionState,
};
pub use store::{
    MemoryStore, MemoryStoreFactory, MessageId, Request, RequestStore, StoreEvent, StoreFactory,
};
pub use subscribers::{Subscribe, SubscriberSet};
pub use timeout::RetriggerableTimeout;
pub use usage::{NoopUsage, UsageReporter};

// Optional: expose a simple built-in logger subscriber (demo/reference).
// Enable with: `--features logging`
#[cfg(feature = "logging")]
pub use subscribers::LogWriter;
