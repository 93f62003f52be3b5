//! # Client session: per-client state machine and admission protocol.
//!
//! A [`ClientSession`] fronts one client's [`RequestStore`]. It decides which
//! requests are admitted, when flushes are forwarded, and when the session may
//! end.
//!
//! ## Architecture
//! ```text
//! request_received(req, epoch)
//!   ├─ epoch <  current ─► StaleEpoch (trace)
//!   ├─ epoch == current ─► [epoch read lock] seen.insert(id)?
//!   │                        ├─ new ─► ledger.request_admitted ─► store.put_request
//!   │                        └─ dup ─► Duplicate (trace)
//!   └─ epoch >  current ─► [epoch write lock] re-check
//!                            └─► store.discard_unflushed ─► ledger.requests_discarded
//!                                ─► current = epoch ─► seen.clear ─► epoch_tx.send
//!
//! flush(count, epoch, timeout, eom)           (durable sessions)
//!   ├─ epoch <  current ─► StaleEpoch, no side effects
//!   ├─ epoch >  current ─► wait on epoch_tx (timeout | disposal) ─► retry
//!   └─ epoch == current ─► [epoch guard] [state lock] store.flush
//!                            └─ eom ─► EndRequests
//!
//! end-of-message holds the epoch guard exclusively, so it waits for admissions
//! already inside the store and every later admission sees EndRequests
//!
//! store events ─► AllRequestsProcessed ─► AllRequestDone ─► auto-disconnect?
//!             ─► AllOrAvailableResponsesDispatched ─► auto-disconnect?
//!             ─► Fatal ─► reader.session_failed + StoreFatal on the bus
//! ```
//!
//! ## Rules
//! - Lock order is epoch guard, then state, then reader.
//! - The epoch only grows. Once it grows, unflushed requests of the old epoch are
//!   discarded before any request of the new one is admitted.
//! - `Disconnected` is terminal; the registry evicts on `ClientDisconnected`.
//! - A failed end-of-message flush leaves the idle timeout disarmed until the next
//!   successful flush.

use std::collections::HashSet;
use std::fmt;
use std::sync::{Arc, Weak};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::Duration;

use dashmap::DashSet;
use parking_lot::Mutex as SyncMutex;
use tokio::sync::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard, broadcast, watch};
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, trace, warn};

use super::{ClientId, EndpointId, Principal, ResponseReader, SessionState};
use crate::core::SharedContext;
use crate::error::{BrokerError, StoreError};
use crate::events::{Bus, Event, EventKind};
use crate::ledger::{ClientTotals, CounterLedger};
use crate::store::{MessageId, Request, RequestStore, StoreEvent};
use crate::timeout::RetriggerableTimeout;

/// Budget of the flush issued when reconciling an interactive session on disconnect.
const RECONCILE_FLUSH_TIMEOUT: Duration = Duration::from_secs(30);

/// Result of [`ClientSession::request_received`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Stored and counted.
    Admitted,
    /// Same message id already admitted in this epoch.
    Duplicate,
    /// Request belongs to an older batch epoch.
    StaleEpoch,
}

/// Result of [`ClientSession::flush`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushOutcome {
    /// Forwarded to the store.
    Flushed,
    /// Flush belongs to an older batch epoch and was dropped.
    StaleEpoch,
}

enum EpochGuard<'a> {
    Shared(RwLockReadGuard<'a, i64>),
    Exclusive(RwLockWriteGuard<'a, i64>),
}

impl EpochGuard<'_> {
    fn current(&self) -> i64 {
        match self {
            EpochGuard::Shared(guard) => **guard,
            EpochGuard::Exclusive(guard) => **guard,
        }
    }
}

/// Broker-wide collaborators handed to every session.
#[derive(Clone)]
pub struct SessionDeps {
    pub ledger: Arc<CounterLedger>,
    pub bus: Bus,
    pub context: Arc<SharedContext>,
    /// `None` disables the idle timeout.
    pub idle_timeout: Option<Duration>,
}

/// Per-client session.
pub struct ClientSession {
    me: Weak<Self>,
    client: ClientId,
    owner: Principal,
    durable: bool,
    store: Arc<dyn RequestStore>,
    ledger: Arc<CounterLedger>,
    bus: Bus,
    context: Arc<SharedContext>,

    state: Mutex<SessionState>,
    state_tx: watch::Sender<SessionState>,

    epoch: RwLock<i64>,
    epoch_tx: watch::Sender<i64>,
    seen: DashSet<MessageId>,

    endpoints: SyncMutex<HashSet<EndpointId>>,
    reader: Mutex<Option<Arc<dyn ResponseReader>>>,
    directly_replied: AtomicI64,

    idle: RetriggerableTimeout,
    idle_span: Option<Duration>,
    idle_parked: AtomicBool,

    disposed: CancellationToken,
    closing: AtomicBool,
    released: AtomicBool,
}

impl fmt::Debug for ClientSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientSession")
            .field("client", &self.client)
            .field("state", &self.state())
            .field("epoch", &self.current_epoch())
            .field("durable", &self.durable)
            .finish_non_exhaustive()
    }
}

impl ClientSession {
    /// Builds a session over an opened store and starts its background work.
    ///
    /// The initial state comes from what the store already holds: a reattached
    /// client whose end-of-message was recorded and fully processed only fetches
    /// responses; one whose end-of-message was recorded keeps waiting; anything
    /// else accepts requests again.
    ///
    /// With `restore` the store's persisted counts are folded into the ledger.
    /// Pass it only on the first attach of a client in this process; later
    /// sessions reopen counts the ledger already holds.
    ///
    /// A session that opens already done and unbound ends on its own.
    pub fn open(
        client: ClientId,
        owner: Principal,
        store: Arc<dyn RequestStore>,
        deps: SessionDeps,
        restore: bool,
    ) -> Arc<Self> {
        let events = store.subscribe();

        let all = store.all_requests_count();
        let done = store.processed_requests_count() + store.failed_requests_count();
        let initial = if store.end_of_message_recorded() && done >= all {
            SessionState::GetResponseOnly
        } else if store.end_of_message_recorded() {
            SessionState::EndRequests
        } else {
            SessionState::ClientConnected
        };
        if restore && all > 0 {
            deps.ledger
                .restore_client(all as i64, store.processed_requests_count() as i64);
        }

        let (state_tx, _) = watch::channel(initial);
        let (epoch_tx, _) = watch::channel(-1);
        let session = Arc::new_cyclic(|me| Self {
            me: me.clone(),
            idle: RetriggerableTimeout::new(format!("client-idle:{client}")),
            client,
            owner,
            durable: deps.context.is_durable(),
            store,
            ledger: deps.ledger,
            bus: deps.bus,
            context: deps.context,
            state: Mutex::new(initial),
            state_tx,
            epoch: RwLock::new(-1),
            epoch_tx,
            seen: DashSet::new(),
            endpoints: SyncMutex::new(HashSet::new()),
            reader: Mutex::new(None),
            directly_replied: AtomicI64::new(0),
            idle_span: deps.idle_timeout,
            idle_parked: AtomicBool::new(false),
            disposed: CancellationToken::new(),
            closing: AtomicBool::new(false),
            released: AtomicBool::new(false),
        });

        debug!(client = %session.client, state = initial.as_str(), restore, persisted = all, "session opened");
        session.bus.publish(
            Event::new(EventKind::SessionStateChanged)
                .with_client(session.client.as_str())
                .with_session_state(initial),
        );

        session.spawn_store_listener(events);
        session.refresh_idle();
        if initial.is_done() {
            let weak = Arc::downgrade(&session);
            tokio::spawn(async move {
                if let Some(session) = weak.upgrade() {
                    session.try_auto_disconnect("reattached done").await;
                }
            });
        }
        session
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client
    }

    pub fn owner(&self) -> &Principal {
        &self.owner
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// Current state (lock-free mirror).
    pub fn state(&self) -> SessionState {
        *self.state_tx.borrow()
    }

    /// Receiver that observes every state change.
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Current batch epoch; `-1` before the first request.
    pub fn current_epoch(&self) -> i64 {
        *self.epoch_tx.borrow()
    }

    /// Requests held by the store for this client.
    pub fn requests_count(&self) -> u64 {
        self.store.all_requests_count()
    }

    pub fn directly_replied_count(&self) -> i64 {
        self.directly_replied.load(Ordering::SeqCst)
    }

    /// True while the idle timeout is registered.
    pub fn idle_armed(&self) -> bool {
        self.idle.is_armed()
    }

    /// Final counts reported when the session leaves the registry.
    pub fn totals(&self) -> ClientTotals {
        ClientTotals {
            total: self.store.all_requests_count() as i64,
            processed: self.store.processed_requests_count() as i64,
            failed: self.store.failed_requests_count() as i64,
        }
    }

    /// Admits one request tagged with the sender's batch epoch.
    pub async fn request_received(
        &self,
        request: Request,
        batch_epoch: i64,
    ) -> Result<Admission, BrokerError> {
        if self.disposed.is_cancelled() {
            return Err(self.disposed_error());
        }
        let state = self.state();
        if state != SessionState::ClientConnected {
            return Err(self.state_error(state));
        }

        loop {
            let current = self.epoch.read().await;
            if batch_epoch < *current {
                trace!(
                    client = %self.client,
                    epoch = batch_epoch,
                    current = *current,
                    message_id = %request.message_id,
                    "stale request dropped"
                );
                self.bus.publish(
                    Event::new(EventKind::StaleRequestDropped)
                        .with_client(self.client.as_str())
                        .with_epoch(batch_epoch),
                );
                return Ok(Admission::StaleEpoch);
            }
            if batch_epoch == *current {
                // the read guard stays held so an epoch bump cannot interleave
                return self.admit(request, batch_epoch).await;
            }
            drop(current);
            self.advance_epoch(batch_epoch).await?;
        }
    }

    /// Runs with the epoch read guard held, so an end-of-message flush cannot
    /// complete between the state check and the store write.
    async fn admit(&self, request: Request, epoch: i64) -> Result<Admission, BrokerError> {
        self.ensure_accepting()?;
        let message_id = request.message_id.clone();
        if !self.seen.insert(message_id.clone()) {
            trace!(client = %self.client, epoch, %message_id, "duplicate request dropped");
            self.bus.publish(
                Event::new(EventKind::DuplicateDropped)
                    .with_client(self.client.as_str())
                    .with_epoch(epoch)
                    .with_reason(message_id.as_str()),
            );
            return Ok(Admission::Duplicate);
        }

        self.ledger.request_admitted();
        if let Err(err) = self.store.put_request(request).await {
            self.ledger.requests_discarded(1);
            self.seen.remove(&message_id);
            return Err(self.store_failure(err));
        }

        if !self.idle.reset() {
            trace!(client = %self.client, "idle timeout already firing");
        }
        Ok(Admission::Admitted)
    }

    /// Moves to a newer epoch, throwing away the old epoch's unflushed requests.
    async fn advance_epoch(&self, epoch: i64) -> Result<(), BrokerError> {
        let mut current = self.epoch.write().await;
        if epoch <= *current {
            return Ok(());
        }
        self.ensure_accepting()?;

        let discarded = self
            .store
            .discard_unflushed_requests()
            .await
            .map_err(|err| self.store_failure(err))?;
        self.ledger.requests_discarded(discarded as i64);

        let previous = std::mem::replace(&mut *current, epoch);
        self.seen.clear();
        self.epoch_tx.send_replace(epoch);

        debug!(client = %self.client, previous, epoch, discarded, "batch epoch advanced");
        self.bus.publish(
            Event::new(EventKind::EpochAdvanced)
                .with_client(self.client.as_str())
                .with_epoch(epoch)
                .with_count(discarded),
        );
        Ok(())
    }

    /// Commits buffered requests; `end_of_message` closes the request stream.
    ///
    /// Durable sessions check `batch_epoch`: older flushes are dropped, newer ones
    /// wait up to `timeout` for [`request_received`](Self::request_received) to
    /// advance the epoch.
    pub async fn flush(
        &self,
        count: u64,
        batch_epoch: i64,
        timeout: Duration,
        end_of_message: bool,
    ) -> Result<FlushOutcome, BrokerError> {
        let state = self.state();
        if state != SessionState::ClientConnected {
            return Err(self.state_error(state));
        }
        if !self.durable {
            let _guard = self.lock_epoch(end_of_message).await;
            return self.flush_store(count, timeout, end_of_message).await;
        }

        let deadline = Instant::now() + timeout;
        loop {
            let guard = self.lock_epoch(end_of_message).await;
            let current = guard.current();
            if batch_epoch < current {
                debug!(
                    client = %self.client,
                    epoch = batch_epoch,
                    current,
                    count,
                    "stale flush dropped"
                );
                self.bus.publish(
                    Event::new(EventKind::StaleFlushDropped)
                        .with_client(self.client.as_str())
                        .with_epoch(batch_epoch)
                        .with_count(count),
                );
                return Ok(FlushOutcome::StaleEpoch);
            }
            if batch_epoch == current {
                let outcome = self.flush_store(count, timeout, end_of_message).await;
                drop(guard);
                return outcome;
            }
            drop(guard);
            self.await_epoch(batch_epoch, deadline, timeout).await?;
        }
    }

    /// End-of-message takes the epoch guard exclusively: admissions already
    /// writing to the store finish first, later ones see `EndRequests`.
    async fn lock_epoch(&self, exclusive: bool) -> EpochGuard<'_> {
        if exclusive {
            EpochGuard::Exclusive(self.epoch.write().await)
        } else {
            EpochGuard::Shared(self.epoch.read().await)
        }
    }

    /// Waits until the epoch reaches `target`, the deadline passes, or disposal.
    async fn await_epoch(
        &self,
        target: i64,
        deadline: Instant,
        budget: Duration,
    ) -> Result<(), BrokerError> {
        let mut rx = self.epoch_tx.subscribe();
        let reached = async move { rx.wait_for(|epoch| *epoch >= target).await.is_ok() };

        tokio::select! {
            _ = self.disposed.cancelled() => Err(self.disposed_error()),
            res = time::timeout_at(deadline, reached) => match res {
                Ok(true) => Ok(()),
                Ok(false) => Err(self.disposed_error()),
                Err(_) => {
                    debug!(client = %self.client, epoch = target, ?budget, "flush timed out waiting for epoch");
                    Err(BrokerError::FlushTimeout {
                        client: self.client.clone(),
                        epoch: target,
                        waited: budget,
                    })
                }
            }
        }
    }

    async fn flush_store(
        &self,
        count: u64,
        timeout: Duration,
        end_of_message: bool,
    ) -> Result<FlushOutcome, BrokerError> {
        let mut state = self.state.lock().await;
        if *state != SessionState::ClientConnected {
            return Err(self.state_error(*state));
        }

        if end_of_message {
            self.idle.stop();
        }
        if let Err(err) = self.store.flush(count, timeout, end_of_message).await {
            if end_of_message {
                self.idle_parked.store(true, Ordering::SeqCst);
                warn!(client = %self.client, error = %err, "end-of-message flush failed; idle timeout left disarmed");
            }
            return Err(self.store_failure(err));
        }
        self.idle_parked.store(false, Ordering::SeqCst);

        if end_of_message {
            self.set_state(&mut state, SessionState::EndRequests);
        }
        drop(state);

        if end_of_message && self.durable {
            self.idle.stop();
        } else {
            self.refresh_idle();
        }
        trace!(client = %self.client, count, end_of_message, "flush forwarded");
        Ok(FlushOutcome::Flushed)
    }

    /// Disconnects if nothing would be lost; returns whether the session ended.
    ///
    /// Deferred interactive sessions commit whatever is still buffered so their
    /// flush counter matches what the client sent.
    pub async fn disconnect(&self) -> Result<bool, BrokerError> {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return Ok(true);
        }
        if self.can_disconnect(*state) {
            self.finish(&mut state, "sync disconnect", false).await;
            return Ok(true);
        }

        debug!(client = %self.client, state = state.as_str(), "disconnect deferred");
        if !self.durable && *state == SessionState::ClientConnected {
            let all = self.store.all_requests_count();
            if all > self.store.flushed_requests_count() {
                self.store
                    .flush(all, RECONCILE_FLUSH_TIMEOUT, false)
                    .await
                    .map_err(|err| self.store_failure(err))?;
            }
        }
        Ok(false)
    }

    fn can_disconnect(&self, state: SessionState) -> bool {
        match state {
            SessionState::GetResponseOnly | SessionState::AllRequestDone => true,
            SessionState::ClientConnected => {
                (self.store.processing_requests_count() == 0
                    && self.completed() >= self.store.flushed_requests_count())
                    || self.fast_path_idle()
            }
            _ => self.fast_path_idle(),
        }
    }

    /// Interactive session with every request answered.
    fn fast_path_idle(&self) -> bool {
        !self.durable
            && self.store.processing_requests_count() == 0
            && self.completed() >= self.store.all_requests_count()
    }

    fn completed(&self) -> u64 {
        self.store.processed_requests_count()
            + self.store.failed_requests_count()
            + self.directly_replied.load(Ordering::SeqCst).max(0) as u64
    }

    fn is_idle(&self) -> bool {
        self.store.processing_requests_count() == 0
            && self.store.flushed_requests_count() <= self.completed()
    }

    /// Installs the response reader, disposing any previous one.
    pub async fn get_or_replace_response_reader(
        &self,
        reader: Arc<dyn ResponseReader>,
    ) -> Result<(), BrokerError> {
        if self.disposed.is_cancelled() {
            reader.dispose().await;
            return Err(self.disposed_error());
        }
        let previous = self.reader.lock().await.replace(reader);
        if let Some(previous) = previous {
            trace!(client = %self.client, "response reader replaced");
            previous.dispose().await;
        }
        Ok(())
    }

    /// Binds an endpoint; returns `false` if it was already bound.
    pub fn attach_endpoint(&self, endpoint: EndpointId) -> bool {
        self.endpoints.lock().insert(endpoint)
    }

    /// Unbinds an endpoint; the last one leaving attempts a disconnect.
    pub async fn detach_endpoint(&self, endpoint: EndpointId) -> Result<bool, BrokerError> {
        let empty = {
            let mut endpoints = self.endpoints.lock();
            endpoints.remove(&endpoint);
            endpoints.is_empty()
        };
        if !empty {
            return Ok(false);
        }
        self.disconnect().await
    }

    pub fn endpoint_count(&self) -> usize {
        self.endpoints.lock().len()
    }

    // ---------------------------
    // Dispatcher hooks
    // ---------------------------

    /// `n` requests handed to backend workers.
    pub fn requests_dispatched(&self, n: u64) {
        self.ledger.requests_dispatched(n as i64);
        self.refresh_idle();
    }

    /// `n` responses persisted for dispatched requests.
    pub fn responses_persisted(&self, n: u64) {
        self.ledger.responses_processed(n as i64);
        self.refresh_idle();
    }

    /// One response returned to the client without storage.
    pub fn direct_reply(&self) {
        self.ledger.direct_reply();
        self.directly_replied.fetch_add(1, Ordering::SeqCst);
        self.refresh_idle();
    }

    /// A dispatched request went back to the queue after a worker returned it.
    pub fn request_reemitted(&self) {
        self.ledger.request_reemitted();
        self.refresh_idle();
    }

    /// Client fetched `n` stored responses.
    pub fn replies_fetched(&self, n: u64) {
        self.ledger.replies_fetched(n as i64);
        self.idle.reset();
    }

    // ---------------------------
    // Teardown
    // ---------------------------

    /// Releases the session and its store, keeping persisted content.
    pub async fn close(&self) {
        self.dispose(false).await;
    }

    /// Throws away buffered work, ends the session and deletes its store.
    ///
    /// Returns the final counts to fold into the purge counters.
    pub async fn purge(&self) -> ClientTotals {
        let mut state = self.state.lock().await;
        let discarded = match self.store.discard_unflushed_requests().await {
            Ok(n) => n,
            Err(err) => {
                warn!(client = %self.client, error = %err, "discard on purge failed");
                0
            }
        };
        self.ledger.requests_discarded(discarded as i64);
        let totals = self.totals();

        if !state.is_terminal() {
            self.set_state(&mut state, SessionState::Disconnected);
            self.idle.stop();
            if let Some(reader) = self.current_reader().await {
                reader.client_disconnect(true).await;
            }
        }
        drop(state);

        debug!(client = %self.client, discarded, total = totals.total, "session purged");
        self.bus.publish(
            Event::new(EventKind::ClientPurged)
                .with_client(self.client.as_str())
                .with_count(discarded),
        );
        self.dispose(true).await;
        totals
    }

    async fn dispose(&self, delete: bool) {
        if self.closing.swap(true, Ordering::SeqCst) {
            return;
        }
        self.disposed.cancel();
        self.idle.stop();
        let reader = self.reader.lock().await.take();
        if let Some(reader) = reader {
            reader.dispose().await;
        }
        self.store.close(delete).await;
        self.released.store(true, Ordering::SeqCst);
        trace!(client = %self.client, delete, "session disposed");
    }

    /// True once disposal started; new operations fail with `Disposed`.
    pub fn is_disposed(&self) -> bool {
        self.disposed.is_cancelled()
    }

    /// True once the store handle was released.
    pub fn is_released(&self) -> bool {
        self.released.load(Ordering::SeqCst)
    }

    // ---------------------------
    // Helpers
    // ---------------------------

    fn set_state(&self, guard: &mut SessionState, next: SessionState) {
        if *guard == next {
            return;
        }
        let previous = std::mem::replace(guard, next);
        self.state_tx.send_replace(next);
        debug!(client = %self.client, from = previous.as_str(), to = next.as_str(), "session state changed");
        self.bus.publish(
            Event::new(EventKind::SessionStateChanged)
                .with_client(self.client.as_str())
                .with_session_state(next),
        );
    }

    /// Moves to `Disconnected` and tells the registry to evict.
    async fn finish(&self, state: &mut SessionState, reason: &'static str, purged: bool) {
        self.set_state(state, SessionState::Disconnected);
        self.idle.stop();
        if let Some(reader) = self.current_reader().await {
            reader.client_disconnect(purged).await;
        }
        self.bus.publish(
            Event::new(EventKind::ClientDisconnected)
                .with_client(self.client.as_str())
                .with_reason(reason),
        );
    }

    async fn current_reader(&self) -> Option<Arc<dyn ResponseReader>> {
        self.reader.lock().await.clone()
    }

    /// Ends a finished session when nothing is bound to it.
    async fn try_auto_disconnect(&self, reason: &'static str) {
        if self.endpoint_count() > 0 || self.context.singleton_connected() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.is_done() {
            self.finish(&mut state, reason, false).await;
        }
    }

    /// Arms the idle timeout when nothing is outstanding, stops it otherwise.
    fn refresh_idle(&self) {
        let Some(span) = self.idle_span else {
            return;
        };
        if self.idle_parked.load(Ordering::SeqCst) || self.disposed.is_cancelled() {
            return;
        }
        let state = self.state();
        if state.is_terminal() || (self.durable && state == SessionState::EndRequests) {
            self.idle.stop();
            return;
        }
        if !self.is_idle() {
            self.idle.stop();
            return;
        }
        if self.idle.is_armed() {
            self.idle.reset();
            return;
        }

        let weak = self.me.clone();
        self.idle.register(span, span, move || {
            let weak = weak.clone();
            async move {
                if let Some(session) = weak.upgrade() {
                    session.on_idle().await;
                }
            }
        });
    }

    async fn on_idle(&self) {
        let mut state = self.state.lock().await;
        if state.is_terminal() {
            return;
        }
        if !self.is_idle() {
            trace!(client = %self.client, "idle timeout fired with work outstanding");
            return;
        }
        debug!(client = %self.client, state = state.as_str(), "client idle timeout");
        self.finish(&mut state, "idle timeout", false).await;
    }

    fn spawn_store_listener(self: &Arc<Self>, mut rx: broadcast::Receiver<StoreEvent>) {
        let weak = Arc::downgrade(self);
        let token = self.disposed.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => {
                            let Some(session) = weak.upgrade() else { break };
                            session.on_store_event(ev).await;
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "session store listener lagged");
                        }
                    }
                }
            }
        });
    }

    async fn on_store_event(&self, event: StoreEvent) {
        match event {
            StoreEvent::AllRequestsProcessed => {
                {
                    let mut state = self.state.lock().await;
                    if state.is_active() {
                        self.set_state(&mut state, SessionState::AllRequestDone);
                    }
                }
                self.try_auto_disconnect("all requests done").await;
                self.refresh_idle();
            }
            StoreEvent::AllOrAvailableResponsesDispatched => {
                self.try_auto_disconnect("responses dispatched").await;
            }
            StoreEvent::Fatal(err) => {
                if let Some(reader) = self.current_reader().await {
                    reader.session_failed().await;
                }
                self.escalate(&err);
            }
        }
    }

    fn escalate(&self, err: &StoreError) {
        error!(client = %self.client, error = %err, "fatal store failure");
        self.bus.publish(
            Event::new(EventKind::StoreFatal)
                .with_client(self.client.as_str())
                .with_reason(err.as_message()),
        );
    }

    /// Maps a store failure, escalating fatal ones and absorbing disposal races.
    fn store_failure(&self, source: StoreError) -> BrokerError {
        if matches!(source, StoreError::Disposed) && self.disposed.is_cancelled() {
            debug!(client = %self.client, "store call raced session disposal");
            return self.disposed_error();
        }
        if source.is_fatal() {
            self.escalate(&source);
        }
        BrokerError::Store {
            client: self.client.clone(),
            source,
        }
    }

    fn ensure_accepting(&self) -> Result<(), BrokerError> {
        match self.state() {
            SessionState::ClientConnected => Ok(()),
            state => Err(self.state_error(state)),
        }
    }

    fn state_error(&self, state: SessionState) -> BrokerError {
        let client = self.client.clone();
        match state {
            SessionState::GetResponseOnly => BrokerError::AlreadyGettingResponses { client },
            SessionState::EndRequests => BrokerError::AlreadyEndedRequests { client },
            state => BrokerError::Rejected { client, state },
        }
    }

    fn disposed_error(&self) -> BrokerError {
        BrokerError::Disposed {
            client: self.client.clone(),
        }
    }
}
