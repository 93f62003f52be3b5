//! # Session registry - event-driven client session manager.
//!
//! Registry owns every live [`ClientSession`] and reacts to bus events:
//! - `ClientDisconnected` → evict the session and close it
//! - `StoreFatal` → escalate to [`BrokerLifecycle::service_failed`]
//! - `SessionStateChanged(AllRequestDone)` → re-evaluate [`SessionRegistry::all_done`]
//!
//! ## Architecture
//! ```text
//! transport ──► get_or_create(client, principal)
//!                 ├─ found   ─► owner check ─► session
//!                 └─ missing ─► lifecycle.attach() ─► factory.open() ─► ClientSession::open
//!                               (persisted counts restored on the first attach only)
//!                               └─► lifecycle.client_connected + usage.client_connected
//!
//! Bus → Registry listener
//!         ├─► ClientDisconnected(id) → evict(id) → close → after_removal()
//!         ├─► StoreFatal             → lifecycle.service_failed()
//!         └─► SessionStateChanged    → AllClientsDone?
//!
//! after_removal(): empty → RegistryEmpty + lifecycle.all_clients_gone()
//!                  else  → AllClientsDone if every session is done
//! ```
//!
//! ## Rules
//! - One registry-wide lock serializes every mutation.
//! - Evicted and purged sessions are disposed **after** leaving the map, outside the lock.
//! - A client's persisted counts enter the ledger once per process; reattaching
//!   after eviction reopens counts the ledger already holds.
//! - Eviction only removes a session that is already `Disconnected`, so a fresh
//!   session under the same id is never evicted by a stale event.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashSet;
use futures::future::join_all;
use tokio::sync::{RwLock, broadcast};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

use super::BrokerLifecycle;
use crate::error::BrokerError;
use crate::events::{Bus, Event, EventKind};
use crate::ledger::ClientTotals;
use crate::session::{ClientId, ClientSession, Principal, SessionDeps, SessionState};
use crate::store::StoreFactory;
use crate::usage::UsageReporter;

/// Registry of live client sessions.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<ClientId, Arc<ClientSession>>>,
    /// Clients whose persisted counts are already in the ledger.
    restored: DashSet<ClientId>,
    factory: Arc<dyn StoreFactory>,
    deps: SessionDeps,
    lifecycle: Arc<BrokerLifecycle>,
    usage: Arc<dyn UsageReporter>,
    bus: Bus,
    runtime_token: CancellationToken,
}

impl SessionRegistry {
    pub fn new(
        factory: Arc<dyn StoreFactory>,
        deps: SessionDeps,
        lifecycle: Arc<BrokerLifecycle>,
        usage: Arc<dyn UsageReporter>,
        runtime_token: CancellationToken,
    ) -> Arc<Self> {
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            restored: DashSet::new(),
            factory,
            bus: deps.bus.clone(),
            deps,
            lifecycle,
            usage,
            runtime_token,
        })
    }

    /// Spawns the event listener that evicts sessions and escalates failures.
    ///
    /// Call once during broker init.
    pub fn spawn_listener(self: Arc<Self>) {
        let mut rx = self.bus.subscribe();
        let rt = self.runtime_token.clone();
        let me = self.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = rt.cancelled() => break,
                    msg = rx.recv() => match msg {
                        Ok(ev) => me.handle_event(&ev).await,
                        Err(broadcast::error::RecvError::Closed) => break,
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!(skipped, "registry listener lagged");
                            me.sweep().await;
                        }
                    }
                }
            }
        });
    }

    async fn handle_event(&self, event: &Event) {
        match event.kind {
            EventKind::ClientDisconnected => {
                if let Some(client) = &event.client {
                    self.evict(&ClientId::new(client)).await;
                }
            }
            EventKind::StoreFatal => {
                let lifecycle = Arc::clone(&self.lifecycle);
                let reason = event
                    .reason
                    .as_deref()
                    .unwrap_or("store failure")
                    .to_string();
                tokio::spawn(async move { lifecycle.service_failed(&reason).await });
            }
            EventKind::SessionStateChanged
                if event.session_state == Some(SessionState::AllRequestDone) =>
            {
                if self.all_done().await {
                    self.bus.publish(Event::new(EventKind::AllClientsDone));
                }
            }
            _ => {}
        }
    }

    /// Returns the session for `client`, creating it on first reference.
    #[instrument(level = "debug", skip_all, fields(client = %client))]
    pub async fn get_or_create(
        &self,
        client: &ClientId,
        principal: &Principal,
    ) -> Result<Arc<ClientSession>, BrokerError> {
        {
            let sessions = self.sessions.read().await;
            if let Some(session) = sessions.get(client) {
                if !session.state().is_terminal() {
                    return Self::checked(session, client, principal);
                }
            }
        }

        self.lifecycle.attach()?;

        let session = {
            let mut sessions = self.sessions.write().await;
            if let Some(session) = sessions.get(client) {
                if !session.state().is_terminal() {
                    return Self::checked(session, client, principal);
                }
            }
            if let Some(ended) = sessions.remove(client) {
                // release the old store handle before the factory reopens it
                self.retire(client, ended).await;
            }

            let store = self
                .factory
                .open(client, self.deps.context.is_durable())
                .await
                .map_err(|source| BrokerError::Store {
                    client: client.clone(),
                    source,
                })?;
            let first_attach = self.restored.insert(client.clone());
            let session = ClientSession::open(
                client.clone(),
                principal.clone(),
                store,
                self.deps.clone(),
                first_attach,
            );
            sessions.insert(client.clone(), Arc::clone(&session));
            session
        };

        self.lifecycle.client_connected();
        self.usage.client_connected(client);
        info!(client = %client, state = session.state().as_str(), "client connected");
        self.bus
            .publish(Event::new(EventKind::ClientConnected).with_client(client.as_str()));
        Ok(session)
    }

    /// Looks up an existing session.
    pub async fn get(
        &self,
        client: &ClientId,
        principal: &Principal,
    ) -> Result<Arc<ClientSession>, BrokerError> {
        let sessions = self.sessions.read().await;
        match sessions.get(client) {
            Some(session) => Self::checked(session, client, principal),
            None => Err(BrokerError::ClientNotFound {
                client: client.clone(),
            }),
        }
    }

    /// Removes a client with its buffered work and deletes its store.
    #[instrument(level = "debug", skip_all, fields(client = %client))]
    pub async fn purge(
        &self,
        client: &ClientId,
        principal: &Principal,
    ) -> Result<ClientTotals, BrokerError> {
        let session = {
            let mut sessions = self.sessions.write().await;
            let Some(session) = sessions.get(client) else {
                return Err(BrokerError::ClientNotFound {
                    client: client.clone(),
                });
            };
            if !session.owner().admits(principal) {
                return Err(BrokerError::AccessDenied {
                    client: client.clone(),
                });
            }
            sessions.remove(client)
        };
        let Some(session) = session else {
            return Err(BrokerError::ClientNotFound {
                client: client.clone(),
            });
        };

        let totals = session.purge().await;
        self.deps.ledger.client_purged(totals);
        self.usage.client_removed(client, &totals);
        info!(client = %client, total = totals.total, processed = totals.processed, "client purged");
        self.after_removal().await;
        Ok(totals)
    }

    /// True iff every registered session is `AllRequestDone` or `GetResponseOnly`.
    pub async fn all_done(&self) -> bool {
        let sessions = self.sessions.read().await;
        sessions.values().all(|s| s.state().is_done())
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Returns sorted list of registered client ids.
    pub async fn list(&self) -> Vec<String> {
        let sessions = self.sessions.read().await;
        let mut ids: Vec<String> = sessions.keys().map(|id| id.to_string()).collect();
        ids.sort_unstable();
        ids
    }

    /// Handles to every registered session.
    pub async fn sessions(&self) -> Vec<Arc<ClientSession>> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Empties the registry and closes every session concurrently.
    pub async fn close_all(&self) {
        let drained: Vec<(ClientId, Arc<ClientSession>)> = {
            let mut sessions = self.sessions.write().await;
            sessions.drain().collect()
        };
        join_all(
            drained
                .into_iter()
                .map(|(client, session)| async move { self.retire(&client, session).await }),
        )
        .await;
    }

    /// Removes `client` if its session already ended.
    async fn evict(&self, client: &ClientId) {
        let removed = {
            let mut sessions = self.sessions.write().await;
            let ended = sessions
                .get(client)
                .is_some_and(|session| session.state().is_terminal());
            if ended {
                sessions.remove(client)
            } else {
                None
            }
        };
        let Some(session) = removed else {
            return;
        };
        debug!(client = %client, "session evicted");
        self.retire(client, session).await;
        self.after_removal().await;
    }

    /// Evicts every ended session; recovers from a lagged listener.
    async fn sweep(&self) {
        let ended: Vec<ClientId> = {
            let sessions = self.sessions.read().await;
            sessions
                .iter()
                .filter(|(_, s)| s.state().is_terminal())
                .map(|(id, _)| id.clone())
                .collect()
        };
        for client in ended {
            self.evict(&client).await;
        }
    }

    async fn retire(&self, client: &ClientId, session: Arc<ClientSession>) {
        let totals = session.totals();
        session.close().await;
        self.usage.client_removed(client, &totals);
    }

    async fn after_removal(&self) {
        let (empty, done) = {
            let sessions = self.sessions.read().await;
            (
                sessions.is_empty(),
                sessions.values().all(|s| s.state().is_done()),
            )
        };
        if empty {
            debug!("registry empty");
            self.lifecycle.all_clients_gone();
            self.bus.publish(Event::new(EventKind::RegistryEmpty));
        } else if done {
            self.bus.publish(Event::new(EventKind::AllClientsDone));
        }
    }

    fn checked(
        session: &Arc<ClientSession>,
        client: &ClientId,
        principal: &Principal,
    ) -> Result<Arc<ClientSession>, BrokerError> {
        if session.owner().admits(principal) {
            Ok(Arc::clone(session))
        } else {
            warn!(client = %client, "session access denied");
            Err(BrokerError::AccessDenied {
                client: client.clone(),
            })
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use assert_matches::assert_matches;
    use parking_lot::Mutex;

    use crate::core::{BrokerState, Config, SharedContext};
    use crate::ledger::{CounterLedger, PurgeCounters};
    use crate::store::{MemoryStoreFactory, Request};

    #[derive(Default)]
    struct Recorder {
        connected: Mutex<Vec<String>>,
        removed: Mutex<Vec<(String, ClientTotals)>>,
    }

    impl UsageReporter for Recorder {
        fn client_connected(&self, client: &ClientId) {
            self.connected.lock().push(client.to_string());
        }
        fn client_removed(&self, client: &ClientId, totals: &ClientTotals) {
            self.removed.lock().push((client.to_string(), *totals));
        }
    }

    struct Fixture {
        registry: Arc<SessionRegistry>,
        lifecycle: Arc<BrokerLifecycle>,
        ledger: Arc<CounterLedger>,
        usage: Arc<Recorder>,
        factory: Arc<MemoryStoreFactory>,
        context: Arc<SharedContext>,
    }

    fn fixture() -> Fixture {
        let cfg = Config::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 0, 0);
        let bus = Bus::new(256);
        let context = Arc::new(SharedContext::new(true));
        let ledger = Arc::new(CounterLedger::new(None, PurgeCounters::default(), bus.clone()));
        let lifecycle = BrokerLifecycle::new(&cfg, Arc::clone(&context), bus.clone());
        let usage = Arc::new(Recorder::default());
        let factory = Arc::new(MemoryStoreFactory::new());
        let registry = SessionRegistry::new(
            factory.clone(),
            SessionDeps {
                ledger: Arc::clone(&ledger),
                bus,
                context: Arc::clone(&context),
                idle_timeout: None,
            },
            Arc::clone(&lifecycle),
            usage.clone(),
            CancellationToken::new(),
        );
        Arc::clone(&registry).spawn_listener();
        Fixture {
            registry,
            lifecycle,
            ledger,
            usage,
            factory,
            context,
        }
    }

    async fn wait_for(events: &mut broadcast::Receiver<Event>, kind: EventKind) {
        while events.recv().await.unwrap().kind != kind {}
    }

    #[tokio::test]
    async fn lookups_are_case_insensitive_and_owner_checked() {
        let f = fixture();
        let alice = Principal::new("alice");

        let a = f
            .registry
            .get_or_create(&ClientId::new("Job-1"), &alice)
            .await
            .unwrap();
        let b = f
            .registry
            .get_or_create(&ClientId::new("job-1"), &Principal::new("ALICE"))
            .await
            .unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(f.registry.len().await, 1);
        assert_eq!(f.lifecycle.state(), BrokerState::Running);
        assert_eq!(f.usage.connected.lock().as_slice(), ["Job-1"]);

        assert_matches!(
            f.registry
                .get_or_create(&ClientId::new("job-1"), &Principal::new("mallory"))
                .await,
            Err(BrokerError::AccessDenied { .. })
        );
        assert_matches!(
            f.registry
                .get(&ClientId::new("job-2"), &alice)
                .await,
            Err(BrokerError::ClientNotFound { .. })
        );
    }

    #[tokio::test]
    async fn anonymous_sessions_accept_any_caller() {
        let f = fixture();
        let id = ClientId::new("shared");
        f.registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        f.registry.get(&id, &Principal::new("bob")).await.unwrap();
    }

    #[tokio::test]
    async fn purge_reports_totals_and_empties_the_registry() {
        let f = fixture();
        let id = ClientId::new("purged");
        let owner = Principal::new("alice");
        let session = f.registry.get_or_create(&id, &owner).await.unwrap();
        session
            .request_received(Request::new("a", Vec::new()), 0)
            .await
            .unwrap();
        session
            .flush(1, 0, Duration::from_secs(1), false)
            .await
            .unwrap();
        session
            .request_received(Request::new("b", Vec::new()), 0)
            .await
            .unwrap();

        assert_matches!(
            f.registry.purge(&id, &Principal::new("bob")).await,
            Err(BrokerError::AccessDenied { .. })
        );

        let totals = f.registry.purge(&id, &owner).await.unwrap();
        assert_eq!(totals.total, 1);
        assert!(f.registry.is_empty().await);
        assert_eq!(f.lifecycle.state(), BrokerState::Idle);

        let c = f.ledger.snapshot();
        assert_eq!(c.total, 1);
        assert_eq!(c.purged.total, 1);
        assert_eq!(c.outstanding(), 0);
        assert_eq!(f.usage.removed.lock().len(), 1);
        assert!(f.factory.store(&id).unwrap().is_deleted());
    }

    #[tokio::test]
    async fn all_done_tracks_every_session() {
        let f = fixture();
        assert!(f.registry.all_done().await);

        let id = ClientId::new("one");
        let s = f
            .registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        assert!(!f.registry.all_done().await);

        // keep it bound so reaching AllRequestDone does not end it
        s.attach_endpoint(crate::session::EndpointId(1));
        s.request_received(Request::new("a", Vec::new()), 0)
            .await
            .unwrap();
        s.flush(1, 0, Duration::from_secs(1), true).await.unwrap();
        let store = f.factory.store(&id).unwrap();
        store.dispatch(1);
        store.complete(1);

        let mut states = s.subscribe_state();
        states
            .wait_for(|st| *st == SessionState::AllRequestDone)
            .await
            .unwrap();
        assert!(f.registry.all_done().await);
    }

    #[tokio::test]
    async fn disconnected_sessions_are_evicted() {
        let f = fixture();
        let mut events = f.registry.bus.subscribe();
        let id = ClientId::new("short-lived");
        let s = f
            .registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();

        assert!(s.disconnect().await.unwrap());
        loop {
            let ev = events.recv().await.unwrap();
            if ev.kind == EventKind::RegistryEmpty {
                break;
            }
        }
        assert!(f.registry.is_empty().await);
        assert!(s.is_disposed());
        assert_eq!(f.lifecycle.state(), BrokerState::Idle);
        assert_eq!(f.usage.removed.lock().len(), 1);
    }

    #[tokio::test]
    async fn reattaching_client_is_not_counted_twice() {
        let f = fixture();
        let mut events = f.registry.bus.subscribe();
        let id = ClientId::new("returning");
        let s = f
            .registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        s.request_received(Request::new("a", Vec::new()), 0)
            .await
            .unwrap();
        s.request_received(Request::new("b", Vec::new()), 0)
            .await
            .unwrap();
        assert_eq!(f.ledger.snapshot().total, 2);

        assert!(s.disconnect().await.unwrap());
        wait_for(&mut events, EventKind::RegistryEmpty).await;

        let again = f
            .registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        assert!(!Arc::ptr_eq(&s, &again));
        assert_eq!(again.requests_count(), 2);
        let c = f.ledger.snapshot();
        assert_eq!(c.total, 2);
        assert_eq!(c.outstanding(), 2);
    }

    #[tokio::test]
    async fn first_attach_restores_persisted_counts() {
        let f = fixture();
        let id = ClientId::new("resumed");
        f.factory.preload(
            id.clone(),
            Arc::new(crate::store::MemoryStore::with_persisted(5, 2, false)),
        );
        f.registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        let c = f.ledger.snapshot();
        assert_eq!((c.total, c.processed), (5, 2));
    }

    #[tokio::test]
    async fn fatal_store_failure_unloads_the_broker() {
        let f = fixture();
        let id = ClientId::new("doomed");
        f.registry
            .get_or_create(&id, &Principal::anonymous())
            .await
            .unwrap();
        f.context.initialized.set();
        f.context.job_finished.set();

        f.factory
            .store(&id)
            .unwrap()
            .raise_fatal(crate::error::StoreError::ResourceExhausted {
                reason: "quota".into(),
            });
        let decision = tokio::time::timeout(Duration::from_secs(5), f.lifecycle.unloaded())
            .await
            .expect("fatal failure never unloaded the broker");
        assert!(decision.suspend);
        assert_eq!(f.lifecycle.state(), BrokerState::Suspend);
    }
}
