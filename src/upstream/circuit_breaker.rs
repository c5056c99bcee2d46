use serde::{Deserialize, Serialize};
use std::time::Duration;

pub const DEFAULT_FAILURE_THRESHOLD: u32 = 3;
pub const DEFAULT_RETRY_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-upstream health record: Closed → Open, with a time-based probe window.
///
/// There is no stored half-open state. Once `retry_timeout` has elapsed since
/// the most recent failure, `is_callable` returns `true` even while `open` is
/// set; the flag itself is only cleared by a successful call or an explicit
/// reset. A failed probe refreshes `last_failure`, so the next probe waits a
/// full `retry_timeout` again.
///
/// All timestamps are durations since the Unix epoch, supplied by the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Circuit {
    identifier: String,
    failure_threshold: u32,
    retry_timeout: Duration,
    last_failure: Option<Duration>,
    failure_count: u32,
    open: bool,
}

impl Circuit {
    /// A closed circuit with default threshold and retry timeout.
    pub fn new(identifier: impl Into<String>) -> Self {
        Self {
            identifier: identifier.into(),
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            retry_timeout: DEFAULT_RETRY_TIMEOUT,
            last_failure: None,
            failure_count: 0,
            open: false,
        }
    }

    /// Values of zero are clamped to one.
    pub fn with_failure_threshold(mut self, failure_threshold: u32) -> Self {
        self.failure_threshold = failure_threshold.max(1);
        self
    }

    pub fn with_retry_timeout(mut self, retry_timeout: Duration) -> Self {
        self.retry_timeout = retry_timeout;
        self
    }

    /// Seed runtime state, e.g. when restoring from an external store.
    pub fn with_state(
        mut self,
        last_failure: Option<Duration>,
        failure_count: u32,
        open: bool,
    ) -> Self {
        self.last_failure = last_failure;
        self.failure_count = failure_count;
        self.open = open;
        self
    }

    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    pub fn failure_threshold(&self) -> u32 {
        self.failure_threshold
    }

    pub fn retry_timeout(&self) -> Duration {
        self.retry_timeout
    }

    pub fn last_failure(&self) -> Option<Duration> {
        self.last_failure
    }

    pub fn failure_count(&self) -> u32 {
        self.failure_count
    }

    pub fn is_open(&self) -> bool {
        self.open
    }

    pub fn handle_successful_call(&mut self) {
        self.reset_circuit();
    }

    /// Record a failure at `now`. Returns `true` when this call moved the
    /// circuit from closed to open.
    pub fn handle_failed_call(&mut self, now: Duration) -> bool {
        self.failure_count = self.failure_count.saturating_add(1);
        self.last_failure = Some(now);

        if self.open || self.failure_count < self.failure_threshold {
            return false;
        }
        self.trip();
        true
    }

    pub fn reset_circuit(&mut self) {
        if self.open || self.failure_count > 0 {
            tracing::info!(
                circuit = %self.identifier,
                failure_count = self.failure_count,
                was_open = self.open,
                "circuit_breaker: reset"
            );
        } else {
            tracing::debug!(circuit = %self.identifier, "circuit_breaker: reset (already closed)");
        }
        self.open = false;
        self.last_failure = None;
        self.failure_count = 0;
    }

    /// `true` once at least `retry_timeout` has passed since the last failure.
    /// Never `true` when no failure has been recorded.
    pub fn is_retry_time(&self, now: Duration) -> bool {
        match self.last_failure {
            Some(at) => now.saturating_sub(at) >= self.retry_timeout,
            None => false,
        }
    }

    pub fn is_callable(&self, now: Duration) -> bool {
        if self.is_retry_time(now) {
            return true;
        }
        !self.open
    }

    /// Open the circuit regardless of the failure counter.
    pub fn trip(&mut self) {
        tracing::warn!(
            circuit = %self.identifier,
            failure_count = self.failure_count,
            failure_threshold = self.failure_threshold,
            "circuit_breaker: opened"
        );
        self.open = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const T0: Duration = Duration::from_secs(1_700_000_000);

    fn circuit(threshold: u32, retry_secs: u64) -> Circuit {
        Circuit::new("test")
            .with_failure_threshold(threshold)
            .with_retry_timeout(Duration::from_secs(retry_secs))
    }

    #[test]
    fn test_new_circuit_is_closed() {
        let c = Circuit::new("openai");
        assert_eq!(c.identifier(), "openai");
        assert_eq!(c.failure_threshold(), 3);
        assert_eq!(c.retry_timeout(), Duration::from_secs(10));
        assert_eq!(c.failure_count(), 0);
        assert!(c.last_failure().is_none());
        assert!(!c.is_open());
        assert!(c.is_callable(T0));
    }

    #[test]
    fn test_trip_opens_circuit() {
        let mut c = circuit(3, 1000);
        c.trip();
        assert!(c.is_open());
        assert!(!c.is_callable(T0));
    }

    #[test]
    fn test_failed_calls_trip_at_threshold() {
        let mut c = circuit(3, 1000);

        assert!(c.is_callable(T0));
        assert!(!c.handle_failed_call(T0));
        assert!(c.is_callable(T0));
        assert!(!c.handle_failed_call(T0));
        assert!(c.is_callable(T0));
        assert!(c.handle_failed_call(T0));
        assert!(!c.is_callable(T0));
        assert_eq!(c.failure_count(), 3);
        assert_eq!(c.last_failure(), Some(T0));
    }

    #[test]
    fn test_failures_past_threshold_do_not_report_new_trip() {
        let mut c = circuit(1, 1000);
        assert!(c.handle_failed_call(T0));
        assert!(!c.handle_failed_call(T0));
        assert_eq!(c.failure_count(), 2);
        assert!(c.is_open());
    }

    #[derive(Clone, Default)]
    struct LogBuf(std::sync::Arc<std::sync::Mutex<Vec<u8>>>);

    impl std::io::Write for LogBuf {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl<'a> tracing_subscriber::fmt::MakeWriter<'a> for LogBuf {
        type Writer = LogBuf;

        fn make_writer(&'a self) -> Self::Writer {
            self.clone()
        }
    }

    fn captured_logs(f: impl FnOnce()) -> String {
        let buf = LogBuf::default();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(buf.clone())
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f);
        let bytes = buf.0.lock().unwrap().clone();
        String::from_utf8(bytes).unwrap()
    }

    #[test]
    fn test_open_is_logged_once_per_transition() {
        let mut c = circuit(2, 10);
        let logs = captured_logs(|| {
            c.handle_failed_call(T0);
            c.handle_failed_call(T0);
            // Past the threshold while open.
            c.handle_failed_call(T0 + Duration::from_secs(1));
            // Failed call after the retry window elapsed.
            c.handle_failed_call(T0 + Duration::from_secs(20));
        });

        assert!(c.is_open());
        assert_eq!(c.failure_count(), 4);
        assert_eq!(logs.matches("circuit_breaker: opened").count(), 1);
    }

    #[test]
    fn test_callable_after_retry_timeout() {
        let mut c = circuit(3, 3);
        for _ in 0..3 {
            c.handle_failed_call(T0);
        }
        assert!(!c.is_callable(T0));

        // One second later: still open.
        assert!(!c.is_callable(T0 + Duration::from_secs(1)));

        // Two more seconds: probe allowed, but the flag stays set.
        assert!(c.is_callable(T0 + Duration::from_secs(3)));
        assert!(c.is_open());
    }

    #[test]
    fn test_retry_boundary_is_inclusive() {
        let c = circuit(3, 10).with_state(Some(T0), 3, true);
        assert!(!c.is_callable(T0 + Duration::from_secs(9)));
        assert!(c.is_callable(T0 + Duration::from_secs(10)));
    }

    #[test]
    fn test_failed_probe_rearms_retry_window() {
        let mut c = circuit(3, 10).with_state(Some(T0), 3, true);
        let probe_at = T0 + Duration::from_secs(10);
        assert!(c.is_callable(probe_at));

        c.handle_failed_call(probe_at);
        assert!(c.is_open());
        assert_eq!(c.failure_count(), 4);
        assert!(!c.is_callable(probe_at + Duration::from_secs(9)));
        assert!(c.is_callable(probe_at + Duration::from_secs(10)));
    }

    #[test]
    fn test_successful_call_resets_any_state() {
        let mut c = circuit(3, 4).with_state(None, 5, true);
        c.handle_successful_call();
        assert_eq!(c.failure_count(), 0);
        assert!(!c.is_open());
        assert!(c.last_failure().is_none());

        let mut c = circuit(3, 4).with_state(Some(T0), 2, false);
        c.handle_successful_call();
        assert_eq!(c, circuit(3, 4));
    }

    #[test]
    fn test_reset_circuit_is_idempotent() {
        let mut c = circuit(3, 4).with_state(Some(T0), 5, true);
        c.reset_circuit();
        let once = c.clone();
        c.reset_circuit();
        assert_eq!(c, once);
        assert!(!c.is_open());
        assert!(c.last_failure().is_none());
        assert_eq!(c.failure_count(), 0);
    }

    #[test]
    fn test_is_retry_time() {
        let mut c = circuit(3, 100).with_state(None, 5, true);
        assert!(!c.is_retry_time(T0));

        c = c.with_state(Some(T0 - Duration::from_secs(1000)), 5, true);
        assert!(c.is_retry_time(T0));

        c = c.with_state(Some(T0 - Duration::from_secs(10)), 5, true);
        assert!(!c.is_retry_time(T0));
    }

    #[test]
    fn test_clock_going_backwards_is_not_retry_time() {
        let c = circuit(1, 5).with_state(Some(T0), 1, true);
        assert!(!c.is_retry_time(T0 - Duration::from_secs(60)));
        assert!(!c.is_callable(T0 - Duration::from_secs(60)));
    }

    #[test]
    fn test_zero_threshold_is_clamped() {
        let c = Circuit::new("x").with_failure_threshold(0);
        assert_eq!(c.failure_threshold(), 1);
    }

    #[test]
    fn test_serde_roundtrip_preserves_state() {
        let c = circuit(2, 7).with_state(Some(T0), 2, true);
        let json = serde_json::to_string(&c).unwrap();
        let back: Circuit = serde_json::from_str(&json).unwrap();
        assert_eq!(back, c);
    }
}
