//! # Broker runtime configuration.
//!
//! Provides [`Config`], the settings structure injected into the broker core.
//!
//! The five broker settings (`client_idle_timeout`, `client_connection_timeout`,
//! `session_idle_timeout`, `message_throttle_start_threshold`,
//! `message_throttle_stop_threshold`) carry **no defaults** here: whoever boots the
//! broker decides them and passes them to [`Config::new`].
//!
//! ## Sentinel values
//! - any timeout `= 0s` → that timeout is disabled (never fires)
//! - `message_throttle_start_threshold = 0` → throttling disabled
//! - `bus_capacity = 0` → clamped to 1 by the bus

use std::time::Duration;

/// Settings for one broker instance.
///
/// ## Field semantics
/// - `client_idle_timeout`: how long a session with no outstanding work stays attached
/// - `client_connection_timeout`: how long a fresh broker waits for its first client
/// - `session_idle_timeout`: how long an emptied broker waits before unloading
/// - `message_throttle_start_threshold` / `message_throttle_stop_threshold`: queue
///   high/low water marks
/// - `durable`: sessions persist requests and use batch epochs
/// - `bus_capacity`: event bus ring buffer size (min 1)
/// - `shutdown_grace`: maximum wait for sessions to close on OS shutdown
///
/// ## Notes
/// All fields are public for flexibility. Prefer the helper accessors to avoid
/// sprinkling sentinel checks (`0`) across the codebase.
#[derive(Clone, Debug)]
pub struct Config {
    /// Idle time after which a session with nothing outstanding is disconnected.
    pub client_idle_timeout: Duration,

    /// Time a freshly started broker waits for its first client before finishing.
    pub client_connection_timeout: Duration,

    /// Time an idle broker (no clients left) waits before suspending or finishing.
    pub session_idle_timeout: Duration,

    /// Queued message count at which throttling starts (`0` = disabled).
    pub message_throttle_start_threshold: u64,

    /// Queued message count at or below which throttling stops.
    pub message_throttle_stop_threshold: u64,

    /// Whether sessions are durable (persisted, epoch-checked) or interactive.
    pub durable: bool,

    /// Capacity of the event bus broadcast channel ring buffer.
    pub bus_capacity: usize,

    /// Maximum time to wait for sessions to close after an OS termination signal.
    pub shutdown_grace: Duration,
}

impl Config {
    /// Creates a configuration from the externally decided broker settings.
    ///
    /// Sessions start interactive (`durable = false`), the bus holds 1024 events
    /// and shutdown grace is 30s; adjust the public fields afterwards.
    pub fn new(
        client_idle_timeout: Duration,
        client_connection_timeout: Duration,
        session_idle_timeout: Duration,
        message_throttle_start_threshold: u64,
        message_throttle_stop_threshold: u64,
    ) -> Self {
        Self {
            client_idle_timeout,
            client_connection_timeout,
            session_idle_timeout,
            message_throttle_start_threshold,
            message_throttle_stop_threshold,
            durable: false,
            bus_capacity: 1024,
            shutdown_grace: Duration::from_secs(30),
        }
    }

    /// Returns a copy with the durability flag set.
    pub fn with_durable(mut self, durable: bool) -> Self {
        self.durable = durable;
        self
    }

    /// Client idle timeout as an `Option` (`None` → disabled).
    #[inline]
    pub fn client_idle_timeout(&self) -> Option<Duration> {
        non_zero(self.client_idle_timeout)
    }

    /// First-client connection timeout as an `Option` (`None` → disabled).
    #[inline]
    pub fn client_connection_timeout(&self) -> Option<Duration> {
        non_zero(self.client_connection_timeout)
    }

    /// Broker idle timeout as an `Option` (`None` → disabled).
    #[inline]
    pub fn session_idle_timeout(&self) -> Option<Duration> {
        non_zero(self.session_idle_timeout)
    }

    /// Throttle thresholds as `(start, stop)`, or `None` when throttling is disabled.
    #[inline]
    pub fn throttle_thresholds(&self) -> Option<(u64, u64)> {
        if self.message_throttle_start_threshold == 0 {
            None
        } else {
            Some((
                self.message_throttle_start_threshold,
                self.message_throttle_stop_threshold
                    .min(self.message_throttle_start_threshold),
            ))
        }
    }

    /// Returns a bus capacity clamped to a minimum of 1.
    #[inline]
    pub fn bus_capacity_clamped(&self) -> usize {
        self.bus_capacity.max(1)
    }
}

fn non_zero(d: Duration) -> Option<Duration> {
    if d == Duration::ZERO { None } else { Some(d) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_timeouts_are_disabled() {
        let cfg = Config::new(Duration::ZERO, Duration::from_secs(5), Duration::ZERO, 0, 0);
        assert_eq!(cfg.client_idle_timeout(), None);
        assert_eq!(cfg.client_connection_timeout(), Some(Duration::from_secs(5)));
        assert_eq!(cfg.session_idle_timeout(), None);
        assert_eq!(cfg.throttle_thresholds(), None);
    }

    #[test]
    fn stop_threshold_never_exceeds_start() {
        let cfg = Config::new(Duration::ZERO, Duration::ZERO, Duration::ZERO, 10, 50);
        assert_eq!(cfg.throttle_thresholds(), Some((10, 10)));
    }
}
