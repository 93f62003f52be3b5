//! # Request store collaborator.
//!
//! The broker core never persists anything itself: every session delegates request
//! buffering and response bookkeeping to a [`RequestStore`] opened through a
//! [`StoreFactory`]. Durable deployments plug in a persistent engine; interactive
//! deployments and tests use [`MemoryStore`].
//!
//! ## Contract
//! ```text
//! ClientSession ──put_request()──────────────► buffered (unflushed)
//!               ──flush(count, eom)──────────► flushed  (visible to dispatchers)
//!               ──discard_unflushed_requests()► buffered dropped, count returned
//!               ◄──subscribe(): StoreEvent────  AllRequestsProcessed
//!                                               AllOrAvailableResponsesDispatched
//!                                               Fatal(StoreError)
//! ```
//!
//! Counters are read without locking by the session and must be monotonic, except
//! `all_requests_count` which shrinks when unflushed requests are discarded.

mod memory;

pub use memory::{MemoryStore, MemoryStoreFactory};

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::broadcast;

use crate::error::StoreError;
use crate::session::ClientId;

/// Client-assigned message identifier, unique within one batch epoch.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MessageId(Arc<str>);

impl MessageId {
    pub fn new(id: impl Into<Arc<str>>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MessageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MessageId {
    fn from(id: &str) -> Self {
        Self::new(id)
    }
}

impl From<String> for MessageId {
    fn from(id: String) -> Self {
        Self::new(id)
    }
}

/// One client request as handed to the store. The body is opaque to the core.
#[derive(Clone, Debug)]
pub struct Request {
    pub message_id: MessageId,
    pub body: Vec<u8>,
}

impl Request {
    pub fn new(message_id: impl Into<MessageId>, body: impl Into<Vec<u8>>) -> Self {
        Self {
            message_id: message_id.into(),
            body: body.into(),
        }
    }
}

/// Notifications raised by a store.
#[derive(Clone, Debug)]
pub enum StoreEvent {
    /// Every admitted request has been processed.
    AllRequestsProcessed,
    /// Every available response has been handed to the client.
    AllOrAvailableResponsesDispatched,
    /// Unrecoverable store failure.
    Fatal(StoreError),
}

/// Per-client request/response buffer.
#[async_trait]
pub trait RequestStore: Send + Sync + 'static {
    /// Buffers one request; it stays invisible to dispatchers until flushed.
    async fn put_request(&self, request: Request) -> Result<(), StoreError>;

    /// Commits buffered requests. `count` is the client's cumulative sent count.
    async fn flush(
        &self,
        count: u64,
        timeout: Duration,
        end_of_message: bool,
    ) -> Result<(), StoreError>;

    /// Drops every buffered (unflushed) request and returns how many were dropped.
    async fn discard_unflushed_requests(&self) -> Result<u64, StoreError>;

    /// Releases the store; `delete` removes its persisted content.
    async fn close(&self, delete: bool);

    fn all_requests_count(&self) -> u64;
    fn flushed_requests_count(&self) -> u64;
    fn processed_requests_count(&self) -> u64;
    fn processing_requests_count(&self) -> u64;

    fn failed_requests_count(&self) -> u64 {
        0
    }

    /// True once an end-of-message flush has been durably recorded.
    fn end_of_message_recorded(&self) -> bool;

    /// Receiver for subsequent store events.
    fn subscribe(&self) -> broadcast::Receiver<StoreEvent>;
}

/// Opens (or reattaches to) the store of one client.
#[async_trait]
pub trait StoreFactory: Send + Sync + 'static {
    async fn open(
        &self,
        client: &ClientId,
        durable: bool,
    ) -> Result<Arc<dyn RequestStore>, StoreError>;
}
