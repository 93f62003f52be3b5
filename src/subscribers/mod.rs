//! # Event subscribers for the broker.
//!
//! This module provides the [`Subscribe`] trait and the [`SubscriberSet`] fan-out
//! that delivers broker events published on the [`Bus`](crate::events::Bus).
//!
//! ## Architecture
//! ```text
//! Event flow:
//!   ClientSession / Ledger / Registry / Lifecycle ── publish(Event) ──► Bus
//!                                                                       │
//!                                          Broker listener ◄────────────┘
//!                                                 │
//!                                        SubscriberSet::emit(&Event)
//!                                      ┌──────────┼──────────┐
//!                                      ▼          ▼          ▼
//!                                  LogWriter   Metrics    Custom ...
//! ```
//!
//! ## Implementing custom subscribers
//! ```no_run
//! use brokerline::Subscribe;
//! use brokerline::{Event, EventKind};
//! use async_trait::async_trait;
//!
//! struct ThrottleAlarm;
//!
//! #[async_trait]
//! impl Subscribe for ThrottleAlarm {
//!     async fn on_event(&self, event: &Event) {
//!         if event.kind == EventKind::ThrottleStarted {
//!             // page someone
//!         }
//!     }
//!
//!     fn name(&self) -> &'static str {
//!         "throttle-alarm"
//!     }
//! }
//! ```

#[cfg(feature = "logging")]
mod log;
mod set;
mod subscribe;

#[cfg(feature = "logging")]
pub use log::LogWriter;
pub use set::SubscriberSet;
pub use subscribe::Subscribe;
