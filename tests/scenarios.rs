//! End-to-end flows through a built broker backed by the in-memory store.

use std::sync::Arc;
use std::time::Duration;

use assert_matches::assert_matches;
use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::broadcast;

use brokerline::{
    Admission, Broker, BrokerBuilder, BrokerError, BrokerState, ClientId, Config, EndpointId,
    Event, EventKind, MemoryStoreFactory, Principal, Request, SessionState, Subscribe, Unload,
};

const FLUSH: Duration = Duration::from_secs(5);

fn config(durable: bool) -> Config {
    Config::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 0, 0).with_durable(durable)
}

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn broker(durable: bool) -> (Arc<Broker>, Arc<MemoryStoreFactory>) {
    init_tracing();
    let factory = Arc::new(MemoryStoreFactory::new());
    let broker = BrokerBuilder::new(config(durable))
        .with_store_factory(factory.clone())
        .build();
    (broker, factory)
}

async fn wait_for(events: &mut broadcast::Receiver<Event>, kind: EventKind) -> Event {
    loop {
        match events.recv().await {
            Ok(ev) if ev.kind == kind => return ev,
            Ok(_) | Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => panic!("bus closed before {kind:?}"),
        }
    }
}

#[tokio::test]
async fn finished_client_is_disconnected_and_evicted() {
    let (broker, factory) = broker(true);
    let mut events = broker.bus().subscribe();
    let id = ClientId::new("job-42");

    let session = broker
        .registry()
        .get_or_create(&id, &Principal::anonymous())
        .await
        .unwrap();
    for n in 0..3 {
        let admitted = session
            .request_received(Request::new(format!("m-{n}"), Vec::new()), 0)
            .await
            .unwrap();
        assert_eq!(admitted, Admission::Admitted);
    }
    assert_eq!(broker.ledger().snapshot().total, 3);

    session.flush(3, 0, FLUSH, true).await.unwrap();
    assert_eq!(session.state(), SessionState::EndRequests);

    let store = factory.store(&id).unwrap();
    assert_eq!(store.dispatch(3).len(), 3);
    session.requests_dispatched(3);
    store.complete(3);
    session.responses_persisted(3);

    wait_for(&mut events, EventKind::RegistryEmpty).await;
    assert_eq!(session.state(), SessionState::Disconnected);
    assert!(broker.registry().is_empty().await);
    assert_eq!(broker.lifecycle().state(), BrokerState::Idle);

    let counters = broker.ledger().snapshot();
    assert_eq!(counters.total, 3);
    assert_eq!(counters.processed, 3);
    assert_eq!(counters.processing, 0);
}

#[tokio::test]
async fn bound_endpoint_keeps_finished_client_attached() {
    let (broker, factory) = broker(true);
    let id = ClientId::new("job-bound");
    let session = broker
        .registry()
        .get_or_create(&id, &Principal::anonymous())
        .await
        .unwrap();
    assert!(session.attach_endpoint(EndpointId(7)));

    session
        .request_received(Request::new("only", Vec::new()), 0)
        .await
        .unwrap();
    session.flush(1, 0, FLUSH, true).await.unwrap();
    let store = factory.store(&id).unwrap();
    store.dispatch(1);
    store.complete(1);

    let mut states = session.subscribe_state();
    states
        .wait_for(|s| *s == SessionState::AllRequestDone)
        .await
        .unwrap();
    assert_eq!(broker.registry().len().await, 1);

    // the last endpoint leaving ends the finished session
    assert!(session.detach_endpoint(EndpointId(7)).await.unwrap());
    states
        .wait_for(|s| *s == SessionState::Disconnected)
        .await
        .unwrap();
}

#[tokio::test]
async fn reconnect_with_newer_epoch_discards_unflushed_requests() {
    let (broker, _factory) = broker(true);
    let id = ClientId::new("flaky");
    let owner = Principal::new("alice");

    let first = broker.registry().get_or_create(&id, &owner).await.unwrap();
    first
        .request_received(Request::new("a", Vec::new()), 0)
        .await
        .unwrap();
    first
        .request_received(Request::new("b", Vec::new()), 0)
        .await
        .unwrap();
    assert_eq!(broker.ledger().snapshot().total, 2);

    // same client, new connection, next batch
    let again = broker
        .registry()
        .get_or_create(&ClientId::new("FLAKY"), &owner)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));
    again
        .request_received(Request::new("a", Vec::new()), 1)
        .await
        .unwrap();

    let counters = broker.ledger().snapshot();
    assert_eq!(counters.total, 1);
    assert_eq!(counters.queued, 1);
    assert_eq!(again.current_epoch(), 1);

    // a late flush from the old connection is dropped
    assert_matches!(
        again.flush(2, 0, FLUSH, true).await,
        Ok(brokerline::FlushOutcome::StaleEpoch)
    );
    assert_eq!(again.state(), SessionState::ClientConnected);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_are_admitted_once() {
    let (broker, factory) = broker(true);
    let id = ClientId::new("dup");
    let session = broker
        .registry()
        .get_or_create(&id, &Principal::anonymous())
        .await
        .unwrap();
    let before = broker.ledger().snapshot().total;

    let tasks: Vec<_> = (0..8)
        .map(|_| {
            let session = Arc::clone(&session);
            tokio::spawn(async move {
                session
                    .request_received(Request::new("X", b"same".to_vec()), 5)
                    .await
            })
        })
        .collect();

    let mut admitted = 0;
    for task in tasks {
        match task.await.unwrap().unwrap() {
            Admission::Admitted => admitted += 1,
            Admission::Duplicate => {}
            other => panic!("unexpected admission {other:?}"),
        }
    }
    assert_eq!(admitted, 1);
    assert_eq!(broker.ledger().snapshot().total, before + 1);
    assert_eq!(factory.store(&id).unwrap().buffered_count(), 1);
}

#[tokio::test]
async fn unload_closes_sessions_and_reports_the_decision() {
    let (broker, factory) = broker(true);
    let id = ClientId::new("resident");
    broker
        .registry()
        .get_or_create(&id, &Principal::anonymous())
        .await
        .unwrap();

    let runner = {
        let broker = Arc::clone(&broker);
        tokio::spawn(async move { broker.run().await })
    };
    broker.context().initialized.wait().await;
    assert!(broker.lifecycle().unload(true, "operator"));

    let decision = runner.await.unwrap().unwrap();
    assert_eq!(decision, Unload { suspend: true });
    assert!(broker.registry().is_empty().await);
    assert!(factory.store(&id).unwrap().is_closed());
    assert_matches!(
        broker
            .registry()
            .get_or_create(&ClientId::new("late"), &Principal::anonymous())
            .await,
        Err(BrokerError::Unloading)
    );
}

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<EventKind>>,
}

#[async_trait]
impl Subscribe for Recorder {
    async fn on_event(&self, event: &Event) {
        self.seen.lock().push(event.kind);
    }

    fn name(&self) -> &'static str {
        "recorder"
    }
}

#[tokio::test]
async fn subscribers_observe_client_traffic() {
    let recorder = Arc::new(Recorder::default());
    let broker = BrokerBuilder::new(config(false))
        .with_subscribers(vec![recorder.clone() as Arc<dyn Subscribe>])
        .build();
    let mut events = broker.bus().subscribe();

    broker
        .registry()
        .get_or_create(&ClientId::new("watched"), &Principal::anonymous())
        .await
        .unwrap();
    wait_for(&mut events, EventKind::ClientConnected).await;

    tokio::time::timeout(Duration::from_secs(5), async {
        while !recorder.seen.lock().contains(&EventKind::ClientConnected) {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("subscriber never saw the client");
}
