//! # Broker lifecycle: decides when the broker process unloads.
//!
//! ## State machine
//! ```text
//! Started ──first client──► Running ──registry empty──► Idle ──session idle timeout──► Suspend  (durable)
//!    │                         ▲                          │                          └► Finished (interactive)
//!    │                         └────────client───────────┘
//!    └──connection timeout (no client ever)──► Finished
//! ```
//!
//! ## Rules
//! - The unload decision is latched: [`BrokerLifecycle::unload`] succeeds once and
//!   every later [`BrokerLifecycle::attach`] fails with [`BrokerError::Unloading`].
//! - One [`RetriggerableTimeout`] serves both the connection and the idle timeout.
//! - `attach()` also fails when resetting the timeout reports its callback running,
//!   since that callback may be unloading right now.
//! - `service_failed()` is idempotent and waits for the shared context's
//!   `initialized` and `job_finished` latches before unloading.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{Config, SharedContext};
use crate::error::BrokerError;
use crate::events::{Bus, Event, EventKind};
use crate::timeout::RetriggerableTimeout;

/// Broker-wide state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BrokerState {
    Started,
    Running,
    Idle,
    Suspend,
    Finished,
}

/// The unload decision handed to the process owner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Unload {
    /// Keep persisted state for a later resume instead of finishing the job.
    pub suspend: bool,
}

/// Broker-wide state machine driving process unload.
pub struct BrokerLifecycle {
    me: Weak<Self>,
    state: Mutex<BrokerState>,
    timeout: RetriggerableTimeout,
    connection_timeout: Option<Duration>,
    session_idle_timeout: Option<Duration>,
    context: Arc<SharedContext>,
    bus: Bus,
    unloading: AtomicBool,
    failed: AtomicBool,
    unload_tx: watch::Sender<Option<Unload>>,
}

impl BrokerLifecycle {
    pub fn new(cfg: &Config, context: Arc<SharedContext>, bus: Bus) -> Arc<Self> {
        let (unload_tx, _) = watch::channel(None);
        Arc::new_cyclic(|me| Self {
            me: me.clone(),
            state: Mutex::new(BrokerState::Started),
            timeout: RetriggerableTimeout::new("broker-lifecycle"),
            connection_timeout: cfg.client_connection_timeout(),
            session_idle_timeout: cfg.session_idle_timeout(),
            context,
            bus,
            unloading: AtomicBool::new(false),
            failed: AtomicBool::new(false),
            unload_tx,
        })
    }

    /// Arms the connection timeout. Call once, inside the runtime.
    pub fn start(&self) {
        if let Some(span) = self.connection_timeout {
            self.arm(span);
        }
        debug!(connection_timeout = ?self.connection_timeout, "broker lifecycle started");
    }

    pub fn state(&self) -> BrokerState {
        *self.state.lock()
    }

    pub fn is_unloading(&self) -> bool {
        self.unloading.load(Ordering::SeqCst)
    }

    /// Admission check for a new client attachment.
    pub fn attach(&self) -> Result<(), BrokerError> {
        if self.is_unloading() {
            return Err(BrokerError::Unloading);
        }
        if !self.timeout.reset() {
            debug!("attach raced a firing lifecycle timeout");
            return Err(BrokerError::Unloading);
        }
        Ok(())
    }

    /// A client session was created.
    pub fn client_connected(&self) {
        let mut state = self.state.lock();
        if matches!(*state, BrokerState::Started | BrokerState::Idle) {
            self.timeout.stop();
            self.transition(&mut state, BrokerState::Running);
        }
    }

    /// The registry became empty.
    pub fn all_clients_gone(&self) {
        let mut state = self.state.lock();
        if *state != BrokerState::Running {
            return;
        }
        self.transition(&mut state, BrokerState::Idle);
        if let Some(span) = self.session_idle_timeout {
            self.arm(span);
        }
    }

    /// Latches the unload decision. Returns `false` if it was already taken.
    pub fn unload(&self, suspend: bool, reason: &str) -> bool {
        if self
            .unloading
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            return false;
        }
        self.timeout.stop();
        {
            let mut state = self.state.lock();
            let next = if suspend {
                BrokerState::Suspend
            } else {
                BrokerState::Finished
            };
            self.transition(&mut state, next);
        }

        info!(suspend, reason, "broker unloading");
        self.bus.publish(
            Event::new(EventKind::UnloadRequested)
                .with_suspend(suspend)
                .with_reason(reason),
        );
        self.unload_tx.send_replace(Some(Unload { suspend }));
        true
    }

    /// Resolves with the unload decision once it is taken.
    pub async fn unloaded(&self) -> Unload {
        let mut rx = self.unload_tx.subscribe();
        match rx.wait_for(Option::is_some).await {
            Ok(decision) => (*decision).unwrap_or_default(),
            Err(_) => Unload::default(),
        }
    }

    /// An external collaborator hit an unrecoverable failure.
    pub async fn service_failed(&self, reason: &str) {
        if self.failed.swap(true, Ordering::SeqCst) {
            return;
        }
        warn!(reason, "service failed; unloading once the job settles");
        self.context.initialized.wait().await;
        self.context.job_finished.wait().await;
        self.unload(self.context.is_durable(), reason);
    }

    fn arm(&self, span: Duration) {
        let weak = self.me.clone();
        self.timeout.register(span, span, move || {
            let weak = weak.clone();
            async move {
                if let Some(lifecycle) = weak.upgrade() {
                    lifecycle.on_timeout();
                }
            }
        });
    }

    fn on_timeout(&self) {
        let decision = match self.state() {
            BrokerState::Started => Some((false, "no client connected")),
            BrokerState::Idle => Some((self.context.is_durable(), "session idle timeout")),
            _ => None,
        };
        if let Some((suspend, reason)) = decision {
            self.unload(suspend, reason);
        }
    }

    fn transition(&self, state: &mut BrokerState, next: BrokerState) {
        if *state == next {
            return;
        }
        info!(from = ?*state, to = ?next, "broker state changed");
        *state = next;
        self.bus
            .publish(Event::new(EventKind::BrokerStateChanged).with_broker_state(next));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time;

    fn lifecycle(durable: bool) -> Arc<BrokerLifecycle> {
        let cfg = Config::new(
            Duration::from_secs(60),
            Duration::from_secs(10),
            Duration::from_secs(20),
            0,
            0,
        );
        let lc = BrokerLifecycle::new(&cfg, Arc::new(SharedContext::new(durable)), Bus::new(16));
        lc.start();
        lc
    }

    #[tokio::test(start_paused = true)]
    async fn finishes_when_no_client_ever_connects() {
        let lc = lifecycle(true);
        let decision = lc.unloaded().await;
        assert_eq!(decision, Unload { suspend: false });
        assert_eq!(lc.state(), BrokerState::Finished);
        assert!(lc.attach().is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn durable_broker_suspends_after_idle() {
        let lc = lifecycle(true);
        lc.attach().unwrap();
        lc.client_connected();
        assert_eq!(lc.state(), BrokerState::Running);

        // connection timeout must not fire while running
        time::sleep(Duration::from_secs(30)).await;
        assert!(!lc.is_unloading());

        lc.all_clients_gone();
        assert_eq!(lc.state(), BrokerState::Idle);
        assert_eq!(lc.unloaded().await, Unload { suspend: true });
        assert_eq!(lc.state(), BrokerState::Suspend);
    }

    #[tokio::test(start_paused = true)]
    async fn interactive_broker_finishes_after_idle() {
        let lc = lifecycle(false);
        lc.client_connected();
        lc.all_clients_gone();
        assert_eq!(lc.unloaded().await, Unload { suspend: false });
        assert_eq!(lc.state(), BrokerState::Finished);
    }

    #[tokio::test(start_paused = true)]
    async fn reconnect_during_idle_returns_to_running() {
        let lc = lifecycle(true);
        lc.client_connected();
        lc.all_clients_gone();
        time::sleep(Duration::from_secs(5)).await;
        lc.attach().unwrap();
        lc.client_connected();

        time::sleep(Duration::from_secs(60)).await;
        assert_eq!(lc.state(), BrokerState::Running);
        assert!(!lc.is_unloading());
    }

    #[tokio::test]
    async fn unload_is_latched() {
        let lc = lifecycle(false);
        assert!(lc.unload(true, "first"));
        assert!(!lc.unload(false, "second"));
        assert_eq!(lc.unloaded().await, Unload { suspend: true });
        assert!(matches!(lc.attach(), Err(BrokerError::Unloading)));
    }

    #[tokio::test]
    async fn service_failure_waits_for_the_job() {
        let cfg = Config::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 0, 0);
        let ctx = Arc::new(SharedContext::new(true));
        let lc = BrokerLifecycle::new(&cfg, Arc::clone(&ctx), Bus::new(16));
        lc.start();

        let failing = {
            let lc = Arc::clone(&lc);
            tokio::spawn(async move { lc.service_failed("disk full").await })
        };
        tokio::task::yield_now().await;
        assert!(!lc.is_unloading());

        ctx.initialized.set();
        ctx.job_finished.set();
        failing.await.unwrap();
        assert_eq!(lc.unloaded().await, Unload { suspend: true });

        // a second report is a no-op
        lc.service_failed("again").await;
        assert_eq!(lc.state(), BrokerState::Suspend);
    }

    #[tokio::test(start_paused = true)]
    async fn attach_is_refused_while_the_timeout_callback_runs() {
        let cfg = Config::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 0, 0);
        let lc = BrokerLifecycle::new(&cfg, Arc::new(SharedContext::new(true)), Bus::new(16));
        lc.start();
        lc.attach().unwrap();

        let entered = Arc::new(tokio::sync::Notify::new());
        let release = Arc::new(tokio::sync::Notify::new());
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            lc.timeout
                .register(Duration::from_secs(60), Duration::from_secs(1), move || {
                    let entered = Arc::clone(&entered);
                    let release = Arc::clone(&release);
                    async move {
                        entered.notify_one();
                        release.notified().await;
                    }
                });
        }

        entered.notified().await;
        assert!(!lc.is_unloading());
        assert!(matches!(lc.attach(), Err(BrokerError::Unloading)));

        release.notify_one();
        time::sleep(Duration::from_millis(10)).await;
        assert!(lc.attach().is_ok());
        assert!(!lc.is_unloading());
    }
}
