//! In-memory [`RequestStore`] for interactive brokers and tests.
//!
//! Requests move through three stages:
//! ```text
//! put_request ─► buffered ─flush─► ready ─dispatch─► processing ─complete/fail─► done
//! ```
//! `dispatch`/`complete`/`fail` are the dispatcher-side hooks; they drive the
//! counters and raise [`StoreEvent::AllRequestsProcessed`] once end-of-message was
//! flushed and nothing is left.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;
use tracing::trace;

use super::{Request, RequestStore, StoreEvent, StoreFactory};
use crate::error::StoreError;
use crate::session::ClientId;

#[derive(Default)]
struct MemoryState {
    buffered: Vec<Request>,
    ready: VecDeque<Request>,
    flushed: u64,
    processing: u64,
    processed: u64,
    failed: u64,
    end_of_message: bool,
    closed: bool,
    deleted: bool,
    fail_next: Option<StoreError>,
}

impl MemoryState {
    fn all_done(&self) -> bool {
        self.end_of_message
            && self.buffered.is_empty()
            && self.processing == 0
            && self.processed + self.failed == self.flushed
    }
}

/// Volatile request store.
pub struct MemoryStore {
    state: Mutex<MemoryState>,
    events: broadcast::Sender<StoreEvent>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            state: Mutex::new(MemoryState::default()),
            events,
        }
    }

    /// Store that looks like one reattached after a restart.
    pub fn with_persisted(flushed: u64, processed: u64, end_of_message: bool) -> Self {
        let store = Self::new();
        {
            let mut st = store.state.lock();
            st.flushed = flushed;
            st.processed = processed.min(flushed);
            st.end_of_message = end_of_message;
        }
        store
    }

    /// Makes the next fallible operation return `err`.
    pub fn fail_next(&self, err: StoreError) {
        self.state.lock().fail_next = Some(err);
    }

    /// Hands up to `n` flushed requests to a dispatcher.
    pub fn dispatch(&self, n: usize) -> Vec<Request> {
        let mut st = self.state.lock();
        let take = n.min(st.ready.len());
        let batch: Vec<Request> = st.ready.drain(..take).collect();
        st.processing += batch.len() as u64;
        batch
    }

    /// Records `n` responses persisted for dispatched requests.
    pub fn complete(&self, n: u64) {
        self.settle(n, false);
    }

    /// Records `n` dispatched requests as failed.
    pub fn fail(&self, n: u64) {
        self.settle(n, true);
    }

    /// Signals that every available response reached the client.
    pub fn responses_dispatched(&self) {
        let _ = self.events.send(StoreEvent::AllOrAvailableResponsesDispatched);
    }

    /// Raises a fatal store event.
    pub fn raise_fatal(&self, err: StoreError) {
        let _ = self.events.send(StoreEvent::Fatal(err));
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn is_deleted(&self) -> bool {
        self.state.lock().deleted
    }

    pub fn buffered_count(&self) -> usize {
        self.state.lock().buffered.len()
    }

    fn settle(&self, n: u64, failed: bool) {
        let done = {
            let mut st = self.state.lock();
            let n = n.min(st.processing);
            st.processing -= n;
            if failed {
                st.failed += n;
            } else {
                st.processed += n;
            }
            st.all_done()
        };
        if done {
            let _ = self.events.send(StoreEvent::AllRequestsProcessed);
        }
    }

    fn check(st: &mut MemoryState) -> Result<(), StoreError> {
        if let Some(err) = st.fail_next.take() {
            return Err(err);
        }
        if st.closed {
            return Err(StoreError::Disposed);
        }
        Ok(())
    }
}

#[async_trait]
impl RequestStore for MemoryStore {
    async fn put_request(&self, request: Request) -> Result<(), StoreError> {
        let mut st = self.state.lock();
        Self::check(&mut st)?;
        st.buffered.push(request);
        Ok(())
    }

    async fn flush(
        &self,
        count: u64,
        _timeout: Duration,
        end_of_message: bool,
    ) -> Result<(), StoreError> {
        let done = {
            let mut st = self.state.lock();
            Self::check(&mut st)?;
            let batch: Vec<Request> = st.buffered.drain(..).collect();
            st.flushed += batch.len() as u64;
            st.ready.extend(batch);
            if end_of_message {
                st.end_of_message = true;
            }
            trace!(count, flushed = st.flushed, end_of_message, "memory store flushed");
            end_of_message && st.all_done()
        };
        if done {
            let _ = self.events.send(StoreEvent::AllRequestsProcessed);
        }
        Ok(())
    }

    async fn discard_unflushed_requests(&self) -> Result<u64, StoreError> {
        let mut st = self.state.lock();
        Self::check(&mut st)?;
        let n = st.buffered.len() as u64;
        st.buffered.clear();
        Ok(n)
    }

    async fn close(&self, delete: bool) {
        let mut st = self.state.lock();
        st.closed = true;
        if delete {
            st.deleted = true;
            st.buffered.clear();
            st.ready.clear();
        }
    }

    fn all_requests_count(&self) -> u64 {
        let st = self.state.lock();
        st.flushed + st.buffered.len() as u64
    }

    fn flushed_requests_count(&self) -> u64 {
        self.state.lock().flushed
    }

    fn processed_requests_count(&self) -> u64 {
        self.state.lock().processed
    }

    fn processing_requests_count(&self) -> u64 {
        self.state.lock().processing
    }

    fn failed_requests_count(&self) -> u64 {
        self.state.lock().failed
    }

    fn end_of_message_recorded(&self) -> bool {
        self.state.lock().end_of_message
    }

    fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.events.subscribe()
    }
}

/// Factory handing out one [`MemoryStore`] per client.
///
/// Stores survive a session close so a client reattaching after eviction sees its
/// previous counts, as a persistent engine would; deleted stores are forgotten.
#[derive(Default)]
pub struct MemoryStoreFactory {
    stores: Mutex<HashMap<ClientId, Arc<MemoryStore>>>,
}

impl MemoryStoreFactory {
    pub fn new() -> Self {
        Self::default()
    }

    /// Installs a store to be returned for `client` on the next `open`.
    pub fn preload(&self, client: ClientId, store: Arc<MemoryStore>) {
        self.stores.lock().insert(client, store);
    }

    /// Returns the store currently associated with `client`.
    pub fn store(&self, client: &ClientId) -> Option<Arc<MemoryStore>> {
        self.stores.lock().get(client).cloned()
    }
}

#[async_trait]
impl StoreFactory for MemoryStoreFactory {
    async fn open(
        &self,
        client: &ClientId,
        _durable: bool,
    ) -> Result<Arc<dyn RequestStore>, StoreError> {
        let mut stores = self.stores.lock();
        let store = match stores.get(client) {
            Some(existing) if !existing.is_deleted() => {
                let existing = Arc::clone(existing);
                existing.state.lock().closed = false;
                existing
            }
            _ => {
                let fresh = Arc::new(MemoryStore::new());
                stores.insert(client.clone(), Arc::clone(&fresh));
                fresh
            }
        };
        Ok(store)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn flush_moves_buffered_requests() {
        let store = MemoryStore::new();
        store.put_request(Request::new("a", b"1".to_vec())).await.unwrap();
        store.put_request(Request::new("b", b"2".to_vec())).await.unwrap();
        assert_eq!(store.all_requests_count(), 2);
        assert_eq!(store.flushed_requests_count(), 0);

        store.flush(2, Duration::from_secs(1), false).await.unwrap();
        assert_eq!(store.flushed_requests_count(), 2);
        assert_eq!(store.dispatch(5).len(), 2);
        assert_eq!(store.processing_requests_count(), 2);
    }

    #[tokio::test]
    async fn all_processed_fires_after_end_of_message() {
        let store = MemoryStore::new();
        let mut rx = store.subscribe();
        store.put_request(Request::new("a", Vec::new())).await.unwrap();
        store.flush(1, Duration::from_secs(1), true).await.unwrap();
        store.dispatch(1);
        store.complete(1);

        assert_matches!(rx.recv().await, Ok(StoreEvent::AllRequestsProcessed));
    }

    #[tokio::test]
    async fn discard_only_touches_unflushed() {
        let store = MemoryStore::new();
        store.put_request(Request::new("a", Vec::new())).await.unwrap();
        store.flush(1, Duration::from_secs(1), false).await.unwrap();
        store.put_request(Request::new("b", Vec::new())).await.unwrap();

        assert_eq!(store.discard_unflushed_requests().await.unwrap(), 1);
        assert_eq!(store.all_requests_count(), 1);
    }

    #[tokio::test]
    async fn injected_and_closed_failures() {
        let store = MemoryStore::new();
        store.fail_next(StoreError::Failed { reason: "x".into() });
        assert_matches!(
            store.put_request(Request::new("a", Vec::new())).await,
            Err(StoreError::Failed { .. })
        );
        store.close(false).await;
        assert_matches!(
            store.put_request(Request::new("a", Vec::new())).await,
            Err(StoreError::Disposed)
        );
    }

    #[tokio::test]
    async fn factory_reattaches_until_deleted() {
        let factory = MemoryStoreFactory::new();
        let client = ClientId::new("c");
        let first = factory.open(&client, true).await.unwrap();
        first.put_request(Request::new("a", Vec::new())).await.unwrap();
        first.close(false).await;

        let again = factory.open(&client, true).await.unwrap();
        assert_eq!(again.all_requests_count(), 1);

        again.close(true).await;
        let fresh = factory.open(&client, true).await.unwrap();
        assert_eq!(fresh.all_requests_count(), 0);
    }
}
