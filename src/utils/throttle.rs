//! Log throttling
//!
//! Packet-level warnings (unknown tags, truncated NAL units, failed
//! unreliable sends) can fire at frame rate. The throttler lets the first
//! occurrence of a key through and then suppresses the same key for an
//! interval, counting what it swallowed.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy)]
struct KeyState {
    last_logged: Instant,
    suppressed: u64,
}

/// Rate limiter for repeated log messages, keyed by a caller-chosen string
///
/// ```rust
/// use peercam::utils::LogThrottler;
/// use std::time::Duration;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("unknown_tag"));
/// assert!(!throttler.should_log("unknown_tag"));
/// assert_eq!(throttler.suppressed("unknown_tag"), 1);
/// ```
pub struct LogThrottler {
    keys: Mutex<HashMap<String, KeyState>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            keys: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` when a message for `key` should be emitted now.
    ///
    /// A `true` result restarts the interval and resets the suppressed count.
    pub fn should_log(&self, key: &str) -> bool {
        let now = Instant::now();
        let mut keys = self.keys.lock();

        match keys.get_mut(key) {
            Some(state) if now.duration_since(state.last_logged) < self.interval => {
                state.suppressed += 1;
                false
            }
            Some(state) => {
                state.last_logged = now;
                state.suppressed = 0;
                true
            }
            None => {
                keys.insert(
                    key.to_string(),
                    KeyState {
                        last_logged: now,
                        suppressed: 0,
                    },
                );
                true
            }
        }
    }

    /// Number of messages swallowed for `key` since it was last emitted
    pub fn suppressed(&self, key: &str) -> u64 {
        self.keys.lock().get(key).map(|s| s.suppressed).unwrap_or(0)
    }

    /// Forget `key`, so the next occurrence is logged immediately
    ///
    /// Call this when the condition recovers (e.g. a decoder session comes back).
    pub fn clear(&self, key: &str) {
        self.keys.lock().remove(key);
    }

    pub fn clear_all(&self) {
        self.keys.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.keys.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.keys.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`
///
/// ```rust
/// use peercam::utils::LogThrottler;
/// use peercam::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "bad_packet", "Dropping packet: {}", "empty");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}

/// Throttled `debug!`
#[macro_export]
macro_rules! debug_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::debug!($($arg)*);
        }
    };
}
