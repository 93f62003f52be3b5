//! Broker events: types and broadcast bus.
//!
//! This module groups the event **data model** and the **bus** used to
//! publish/subscribe to events emitted by sessions, the ledger, the registry
//! and the lifecycle.
//!
//! ## Contents
//! - [`EventKind`], [`Event`] event classification and payload metadata
//! - [`Bus`] thin wrapper over `tokio::sync::broadcast`
//!
//! ## Quick reference
//! - **Publishers**: `ClientSession`, `CounterLedger`, `SessionRegistry`,
//!   `BrokerLifecycle`, `SubscriberSet` workers (overflow/panic).
//! - **Consumers**: `SessionRegistry` listener (eviction, fatal escalation) and
//!   the `Broker` listener that fans out to the `SubscriberSet`.

mod bus;
mod event;

pub use bus::Bus;
pub use event::{Event, EventKind};
