//! # Broker-wide shared context.
//!
//! State shared by every session and the lifecycle that is decided by whoever
//! boots the broker: durability, whether a singleton client instance is bound,
//! and two one-shot latches the lifecycle waits on before a forced unload.

use std::sync::atomic::{AtomicBool, Ordering};

use tokio::sync::watch;

/// One-shot flag that can be awaited.
#[derive(Debug)]
pub struct Latch {
    tx: watch::Sender<bool>,
}

impl Default for Latch {
    fn default() -> Self {
        Self::new()
    }
}

impl Latch {
    pub fn new() -> Self {
        let (tx, _rx) = watch::channel(false);
        Self { tx }
    }

    /// Opens the latch; idempotent.
    pub fn set(&self) {
        self.tx.send_if_modified(|open| !std::mem::replace(open, true));
    }

    pub fn is_set(&self) -> bool {
        *self.tx.borrow()
    }

    /// Resolves once the latch is open.
    pub async fn wait(&self) {
        let mut rx = self.tx.subscribe();
        // the sender lives in `self`, so the channel cannot close while we wait
        let _ = rx.wait_for(|open| *open).await;
    }
}

/// Context shared by sessions, the registry and the lifecycle.
#[derive(Debug)]
pub struct SharedContext {
    durable: bool,
    singleton_connected: AtomicBool,
    /// Broker finished bootstrapping.
    pub initialized: Latch,
    /// The hosting job recorded its completion status.
    pub job_finished: Latch,
}

impl SharedContext {
    pub fn new(durable: bool) -> Self {
        Self {
            durable,
            singleton_connected: AtomicBool::new(false),
            initialized: Latch::new(),
            job_finished: Latch::new(),
        }
    }

    pub fn is_durable(&self) -> bool {
        self.durable
    }

    /// True while a singleton client instance is bound; sessions then never
    /// auto-disconnect when their endpoints drop.
    pub fn singleton_connected(&self) -> bool {
        self.singleton_connected.load(Ordering::Acquire)
    }

    pub fn set_singleton_connected(&self, connected: bool) {
        self.singleton_connected.store(connected, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn latch_releases_waiters_once_set() {
        let ctx = Arc::new(SharedContext::new(true));
        let waiter = {
            let ctx = Arc::clone(&ctx);
            tokio::spawn(async move { ctx.initialized.wait().await })
        };
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        ctx.initialized.set();
        ctx.initialized.set();
        waiter.await.unwrap();
        assert!(ctx.initialized.is_set());
        assert!(!ctx.job_finished.is_set());
    }
}
