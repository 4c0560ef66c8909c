//! Time source shared by the store and protocol engines.
//!
//! A real server reads the wall clock; tests substitute a [`TestClock`] so that
//! expiration arithmetic can be exercised without sleeping.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Instant, SystemTime, UNIX_EPOCH};

/// A source of the current Unix time, in seconds, and process uptime.
pub trait Clock: Send + Sync {
    /// Seconds since the Unix epoch.
    fn now_unix(&self) -> u64;

    /// Seconds since this clock was created. Used for `stats` uptime.
    fn uptime(&self) -> u64;
}

/// Real wall-clock time, backed by `SystemTime`/`Instant`.
pub struct SystemClock {
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self {
        Self {
            started: Instant::now(),
        }
    }
}

impl Default for SystemClock {
    fn default() -> Self {
        Self::new()
    }
}

impl Clock for SystemClock {
    fn now_unix(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_secs()
    }

    fn uptime(&self) -> u64 {
        self.started.elapsed().as_secs()
    }
}

/// A manually-advanced clock for deterministic tests.
pub struct TestClock {
    now: AtomicU64,
}

impl TestClock {
    pub fn new(start_unix: u64) -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(start_unix),
        })
    }

    pub fn advance(&self, secs: u64) {
        self.now.fetch_add(secs, Ordering::SeqCst);
    }

    pub fn set(&self, unix: u64) {
        self.now.store(unix, Ordering::SeqCst);
    }
}

impl Clock for TestClock {
    fn now_unix(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }

    fn uptime(&self) -> u64 {
        0
    }
}

/// Expiration threshold below which an `exptime` is relative seconds and above which
/// (or equal to) it is an absolute Unix timestamp. Matches memcached's `REALTIME_MAXDELTA`.
pub const REALTIME_MAXDELTA: u32 = 60 * 60 * 24 * 30;

/// Resolves a raw `exptime` field into an absolute expiration time, or `None` if the
/// entry never expires.
///
/// - `0` never expires.
/// - `1..REALTIME_MAXDELTA` is relative to `created`.
/// - `>= REALTIME_MAXDELTA` is already an absolute Unix timestamp.
pub fn resolve_expiry(exptime: u32, created: u64) -> Option<u64> {
    if exptime == 0 {
        None
    } else if exptime < REALTIME_MAXDELTA {
        Some(created + exptime as u64)
    } else {
        Some(exptime as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn zero_never_expires() {
        assert_eq!(resolve_expiry(0, 1_000), None);
    }

    #[test]
    fn relative_adds_to_created() {
        assert_eq!(resolve_expiry(30, 1_000), Some(1_030));
    }

    #[test]
    fn absolute_ignores_created() {
        let abs = REALTIME_MAXDELTA + 100;
        assert_eq!(resolve_expiry(abs, 1_000), Some(abs as u64));
    }

    #[test]
    fn test_clock_advances() {
        let clock = TestClock::new(100);
        assert_eq!(clock.now_unix(), 100);
        clock.advance(50);
        assert_eq!(clock.now_unix(), 150);
    }
}
