//! Per-client sessions.
//!
//! - [`ClientSession`]: state machine, batch epochs, duplicate suppression and
//!   the flush/end-of-message protocol over one [`RequestStore`](crate::RequestStore)
//! - [`SessionState`]: the session state machine
//! - [`ClientId`], [`Principal`], [`EndpointId`]: identities
//! - [`ResponseReader`]: response-delivery handler supplied by the transport

mod client;
mod id;
mod reader;
mod state;

pub use client::{Admission, ClientSession, FlushOutcome, SessionDeps};
pub use id::{ClientId, EndpointId, Principal};
pub use reader::ResponseReader;
pub use state::SessionState;
