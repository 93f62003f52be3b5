//! # Retriggerable timeout: a named, single-slot, periodically re-armable timer.
//!
//! [`RetriggerableTimeout`] owns at most one registration. Each registration is
//! driven by one background task that sleeps until the armed deadline, re-checks
//! it, and invokes the callback.
//!
//! ## Architecture
//! ```text
//! register(span, first_delay, cb) ──► slot = Armed { armed_at, expected = first_delay }
//!                                       └─► spawn driver(token)
//!
//! driver loop:
//!   ├─► sleep_until(armed_at + expected)   (woken early by reset / cancelled by stop)
//!   ├─► re-check: now - armed_at ≥ expected - tolerance ?  no → loop (raced a reset)
//!   ├─► firing = true ─► cb().await ─► firing = false
//!   └─► armed_at = now, expected = span     (periodic)
//! ```
//!
//! ## Rules
//! - At most **one** callback invocation in flight per instance.
//! - `reset()` is debounced: it re-arms only if more than [`RESET_DEBOUNCE`]
//!   elapsed since the last arm, bounding reprogramming cost under high request rates.
//! - `reset()` while the callback runs returns `false`: the caller must treat the
//!   timeout as already fired.
//! - `stop()` from inside the callback is allowed; the driver exits after the callback returns.
//! - `register()` must be called from within a Tokio runtime.

use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

use futures::FutureExt;
use futures::future::BoxFuture;
use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::{self, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{error, trace};

/// Minimum time between two effective re-arms through [`RetriggerableTimeout::reset`].
pub const RESET_DEBOUNCE: Duration = Duration::from_secs(1);

/// Slack accepted when checking that a wake-up really reached its deadline.
const FIRE_TOLERANCE: Duration = Duration::from_millis(50);

type Callback = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

/// Current registration.
struct Armed {
    span: Duration,
    armed_at: Instant,
    expected: Duration,
    callback: Callback,
    wake: Arc<Notify>,
    token: CancellationToken,
}

struct Inner {
    name: Arc<str>,
    slot: Mutex<Option<Armed>>,
    firing: AtomicBool,
    rearms: AtomicU64,
}

/// Named single-slot timeout with debounced re-arming and re-entrancy protection.
pub struct RetriggerableTimeout {
    inner: Arc<Inner>,
}

impl RetriggerableTimeout {
    /// Creates an unarmed timeout.
    pub fn new(name: impl Into<Arc<str>>) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                slot: Mutex::new(None),
                firing: AtomicBool::new(false),
                rearms: AtomicU64::new(0),
            }),
        }
    }

    /// Returns the timeout name.
    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Arms the timeout, replacing any previous registration.
    ///
    /// The callback first fires after `first_delay`, then every `span` until stopped
    /// or re-registered. A callback still running from a replaced registration keeps
    /// the re-entrancy flag set, so the new registration waits for it.
    pub fn register<F, Fut>(&self, span: Duration, first_delay: Duration, callback: F)
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let callback: Callback = Arc::new(move || callback().boxed());
        let token = CancellationToken::new();
        let wake = Arc::new(Notify::new());

        let previous = self.inner.slot.lock().replace(Armed {
            span,
            armed_at: Instant::now(),
            expected: first_delay,
            callback,
            wake: Arc::clone(&wake),
            token: token.clone(),
        });
        if let Some(prev) = previous {
            prev.token.cancel();
        }

        trace!(timeout = %self.inner.name, ?span, ?first_delay, "timeout registered");
        tokio::spawn(drive(Arc::clone(&self.inner), token, wake));
    }

    /// Disarms the timeout. A callback already running finishes normally.
    pub fn stop(&self) {
        if let Some(armed) = self.inner.slot.lock().take() {
            armed.token.cancel();
            trace!(timeout = %self.inner.name, "timeout stopped");
        }
    }

    /// Pushes the deadline to `now + span`.
    ///
    /// No-op (returning `true`) when unarmed or when the last arm is within
    /// [`RESET_DEBOUNCE`]. Returns `false` if the callback is executing.
    pub fn reset(&self) -> bool {
        let mut slot = self.inner.slot.lock();
        if self.inner.firing.load(Ordering::Acquire) {
            return false;
        }
        let Some(armed) = slot.as_mut() else {
            return true;
        };

        let now = Instant::now();
        if now.saturating_duration_since(armed.armed_at) <= RESET_DEBOUNCE {
            return true;
        }
        armed.armed_at = now;
        armed.expected = armed.span;
        armed.wake.notify_one();
        self.inner.rearms.fetch_add(1, Ordering::Relaxed);
        true
    }

    /// True while a registration is active.
    pub fn is_armed(&self) -> bool {
        self.inner.slot.lock().is_some()
    }

    /// True while the callback is executing.
    pub fn is_firing(&self) -> bool {
        self.inner.firing.load(Ordering::Acquire)
    }

    /// Number of effective re-arms performed by [`reset`](Self::reset).
    pub fn rearm_count(&self) -> u64 {
        self.inner.rearms.load(Ordering::Relaxed)
    }
}

impl Drop for RetriggerableTimeout {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Background loop for one registration; exits when its token is cancelled.
async fn drive(inner: Arc<Inner>, token: CancellationToken, wake: Arc<Notify>) {
    loop {
        let deadline = {
            let slot = inner.slot.lock();
            match slot.as_ref() {
                Some(armed) if !token.is_cancelled() => armed.armed_at + armed.expected,
                _ => return,
            }
        };

        tokio::select! {
            _ = token.cancelled() => return,
            _ = wake.notified() => continue,
            _ = time::sleep_until(deadline) => {}
        }

        let callback = {
            let mut slot = inner.slot.lock();
            let Some(armed) = slot.as_mut() else { return };
            if token.is_cancelled() {
                return;
            }
            let now = Instant::now();
            if now.saturating_duration_since(armed.armed_at) + FIRE_TOLERANCE < armed.expected {
                trace!(timeout = %inner.name, "wake-up raced a reset; not firing");
                continue;
            }
            if inner
                .firing
                .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
                .is_err()
            {
                // previous registration's callback is still running
                armed.armed_at = now;
                armed.expected = armed.span;
                continue;
            }
            Arc::clone(&armed.callback)
        };

        trace!(timeout = %inner.name, "timeout fired");
        if let Err(panic_err) = AssertUnwindSafe(callback()).catch_unwind().await {
            error!(timeout = %inner.name, ?panic_err, "timeout callback panicked");
        }
        inner.firing.store(false, Ordering::Release);

        let mut slot = inner.slot.lock();
        if token.is_cancelled() {
            return;
        }
        if let Some(armed) = slot.as_mut() {
            armed.armed_at = Instant::now();
            armed.expected = armed.span;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    fn counting(timeout: &RetriggerableTimeout, span: Duration, first: Duration) -> Arc<AtomicUsize> {
        let hits = Arc::new(AtomicUsize::new(0));
        let h = Arc::clone(&hits);
        timeout.register(span, first, move || {
            let h = Arc::clone(&h);
            async move {
                h.fetch_add(1, Ordering::SeqCst);
            }
        });
        hits
    }

    #[tokio::test(start_paused = true)]
    async fn fires_after_first_delay_then_periodically() {
        let t = RetriggerableTimeout::new("periodic");
        let hits = counting(&t, Duration::from_secs(10), Duration::from_secs(5));

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);

        time::sleep(Duration::from_secs(2)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_within_debounce_rearms_once() {
        let t = RetriggerableTimeout::new("debounce");
        let _hits = counting(&t, Duration::from_secs(10), Duration::from_secs(10));

        time::sleep(Duration::from_secs(2)).await;
        assert!(t.reset());
        assert!(t.reset());
        time::sleep(Duration::from_millis(500)).await;
        assert!(t.reset());
        assert_eq!(t.rearm_count(), 1);

        time::sleep(Duration::from_secs(2)).await;
        assert!(t.reset());
        assert_eq!(t.rearm_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_moves_the_deadline() {
        let t = RetriggerableTimeout::new("moved");
        let hits = counting(&t, Duration::from_secs(10), Duration::from_secs(10));

        time::sleep(Duration::from_secs(5)).await;
        assert!(t.reset());

        time::sleep(Duration::from_secs(7)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0, "original deadline must not fire");

        time::sleep(Duration::from_secs(4)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn reset_during_callback_reports_failure() {
        let t = RetriggerableTimeout::new("busy");
        let entered = Arc::new(Notify::new());
        let release = Arc::new(Notify::new());
        {
            let entered = Arc::clone(&entered);
            let release = Arc::clone(&release);
            t.register(Duration::from_secs(60), Duration::from_secs(1), move || {
                let entered = Arc::clone(&entered);
                let release = Arc::clone(&release);
                async move {
                    entered.notify_one();
                    release.notified().await;
                }
            });
        }

        entered.notified().await;
        assert!(t.is_firing());
        assert!(!t.reset());

        release.notify_one();
        time::sleep(Duration::from_millis(10)).await;
        assert!(!t.is_firing());
        assert!(t.is_armed());
    }

    #[tokio::test(start_paused = true)]
    async fn stop_prevents_firing() {
        let t = RetriggerableTimeout::new("stopped");
        let hits = counting(&t, Duration::from_secs(3), Duration::from_secs(3));

        time::sleep(Duration::from_secs(1)).await;
        t.stop();
        assert!(!t.is_armed());

        time::sleep(Duration::from_secs(10)).await;
        assert_eq!(hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn register_replaces_previous_registration() {
        let t = RetriggerableTimeout::new("replaced");
        let first = counting(&t, Duration::from_secs(2), Duration::from_secs(2));
        let second = counting(&t, Duration::from_secs(5), Duration::from_secs(5));

        time::sleep(Duration::from_secs(6)).await;
        assert_eq!(first.load(Ordering::SeqCst), 0);
        assert_eq!(second.load(Ordering::SeqCst), 1);
    }
}
