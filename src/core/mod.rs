//! Broker core: configuration, lifecycle, session registry and runtime wiring.
//!
//! The public entry points are [`BrokerBuilder`] and [`Broker`]; the remaining
//! types are exposed for transports and monitoring.
//!
//! Internal modules:
//! - [`config`]: broker settings and sentinel helpers;
//! - [`context`]: broker-wide flags and latches shared with sessions;
//! - [`lifecycle`]: Started/Running/Idle/Suspend/Finished and the unload latch;
//! - [`registry`]: session creation, lookup, purge and eviction;
//! - [`broker`]: wiring, subscriber fan-out and graceful shutdown;
//! - [`shutdown`]: cross-platform shutdown signal handling.

mod broker;
mod builder;
mod config;
mod context;
mod lifecycle;
mod registry;
mod shutdown;

pub use broker::Broker;
pub use builder::BrokerBuilder;
pub use config::Config;
pub use context::{Latch, SharedContext};
pub use lifecycle::{BrokerLifecycle, BrokerState, Unload};
pub use registry::SessionRegistry;
