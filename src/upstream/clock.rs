use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Source of "now" for circuit bookkeeping, as a duration since the Unix epoch.
///
/// Circuits never read the clock themselves: the executor samples it and
/// passes the value in, so tests can drive cooldowns without sleeping.
pub trait Clock: Send + Sync {
    fn now(&self) -> Duration;
}

/// Wall clock. A clock that steps backwards yields `Duration::ZERO` elapsed,
/// which the circuit treats as "retry window not yet reached".
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> Duration {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
    }
}

/// Manually driven clock with millisecond resolution.
#[derive(Debug, Default)]
pub struct ManualClock {
    now_ms: AtomicU64,
}

impl ManualClock {
    pub fn new(start: Duration) -> Self {
        Self {
            now_ms: AtomicU64::new(start.as_millis() as u64),
        }
    }

    pub fn set(&self, now: Duration) {
        self.now_ms.store(now.as_millis() as u64, Ordering::Release);
    }

    pub fn advance(&self, by: Duration) {
        self.now_ms.fetch_add(by.as_millis() as u64, Ordering::AcqRel);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> Duration {
        Duration::from_millis(self.now_ms.load(Ordering::Acquire))
    }
}
