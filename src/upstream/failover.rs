use crate::upstream::circuit_breaker::Circuit;
use crate::upstream::clock::{Clock, SystemClock};
use crate::upstream::store::{CircuitStore, InMemoryCircuitStore};
use dashmap::DashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// Outcome of a failed `FailoverExecutor::execute`.
#[derive(Debug)]
pub enum FailoverError<E> {
    /// No circuit registered under the id. A server-side misconfiguration.
    CircuitNotFound(String),
    /// The fallback action failed; its error is carried unchanged.
    Fallback(E),
}

impl<E: fmt::Display> fmt::Display for FailoverError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FailoverError::CircuitNotFound(id) => write!(f, "circuit does not exist: {}", id),
            FailoverError::Fallback(e) => write!(f, "fallback failed: {}", e),
        }
    }
}

impl<E> std::error::Error for FailoverError<E>
where
    E: std::error::Error + 'static,
{
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FailoverError::CircuitNotFound(_) => None,
            FailoverError::Fallback(e) => Some(e),
        }
    }
}

/// Runs a primary action guarded by a named circuit, falling back to a
/// secondary action when the circuit is not callable or the primary fails.
///
/// The fallback is the last tier: its result is returned as-is and never
/// recorded against the circuit.
///
/// Every get → mutate → update of a circuit runs under that circuit's lock,
/// so concurrent outcomes are all recorded. The lock is never held across
/// the primary or fallback call.
pub struct FailoverExecutor<S = InMemoryCircuitStore> {
    store: Arc<S>,
    clock: Arc<dyn Clock>,
    locks: Arc<DashMap<String, Arc<Mutex<()>>>>,
}

impl<S> Clone for FailoverExecutor<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            locks: self.locks.clone(),
        }
    }
}

impl<S: CircuitStore> FailoverExecutor<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self::with_clock(store, Arc::new(SystemClock))
    }

    pub fn with_clock(store: Arc<S>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            locks: Arc::new(DashMap::new()),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn add_circuit(&self, circuit: Circuit) {
        metrics::gauge!(
            "gateway_circuit_open",
            "circuit" => circuit.identifier().to_owned(),
        )
        .set(if circuit.is_open() { 1.0 } else { 0.0 });
        self.store.add(circuit);
    }

    pub fn get_circuit(&self, circuit_id: &str) -> Option<Circuit> {
        self.store.get(circuit_id)
    }

    /// Try `primary` under `circuit_id`, falling back to `fallback`.
    ///
    /// - unknown circuit: `CircuitNotFound`, neither action runs;
    /// - circuit callable: run `primary`, record the outcome, and on error run
    ///   `fallback`;
    /// - circuit not callable: run `fallback` only, no bookkeeping.
    pub async fn execute<T, E, P, PF, F, FF>(
        &self,
        circuit_id: &str,
        primary: P,
        fallback: F,
    ) -> Result<T, FailoverError<E>>
    where
        P: FnOnce() -> PF,
        PF: Future<Output = Result<T, E>>,
        F: FnOnce() -> FF,
        FF: Future<Output = Result<T, E>>,
        E: fmt::Display,
    {
        let Some(circuit) = self.store.get(circuit_id) else {
            error!(circuit = circuit_id, "failover: circuit does not exist");
            return Err(FailoverError::CircuitNotFound(circuit_id.to_owned()));
        };

        if !circuit.is_callable(self.clock.now()) {
            info!(
                circuit = circuit_id,
                failure_count = circuit.failure_count(),
                "failover: circuit open, calling fallback"
            );
            record_fallback(circuit_id, "circuit_open");
            return fallback().await.map_err(FailoverError::Fallback);
        }

        if circuit.is_open() {
            info!(circuit = circuit_id, "failover: retry window elapsed, probing primary");
        } else {
            debug!(circuit = circuit_id, "failover: calling primary");
        }

        match primary().await {
            Ok(value) => {
                self.record_success(circuit_id);
                Ok(value)
            }
            Err(e) => {
                info!(
                    circuit = circuit_id,
                    error = %e,
                    "failover: primary call failed, falling back"
                );
                self.record_failure(circuit_id);
                record_fallback(circuit_id, "primary_failed");
                fallback().await.map_err(FailoverError::Fallback)
            }
        }
    }

    /// Open a circuit by hand. Returns the updated circuit.
    pub fn trip_circuit(&self, circuit_id: &str) -> Option<Circuit> {
        let (circuit, was_open) = self.modify(circuit_id, |c| {
            let was_open = c.is_open();
            c.trip();
            was_open
        })?;
        if !was_open {
            record_transition(circuit_id, "opened");
        }
        Some(circuit)
    }

    /// Close a circuit by hand. Returns the updated circuit.
    pub fn reset_circuit(&self, circuit_id: &str) -> Option<Circuit> {
        let (circuit, was_open) = self.modify(circuit_id, |c| {
            let was_open = c.is_open();
            c.reset_circuit();
            was_open
        })?;
        if was_open {
            record_transition(circuit_id, "closed");
        }
        Some(circuit)
    }

    // Outcomes re-read the circuit after the primary's await: the snapshot
    // taken before it is stale once other flows have recorded theirs.

    fn record_success(&self, circuit_id: &str) {
        let closed = self.modify(circuit_id, |c| {
            let was_open = c.is_open();
            c.handle_successful_call();
            was_open
        });
        if let Some((_, true)) = closed {
            record_transition(circuit_id, "closed");
        }
    }

    fn record_failure(&self, circuit_id: &str) {
        let now = self.clock.now();
        let tripped = self.modify(circuit_id, |c| c.handle_failed_call(now));
        if let Some((_, true)) = tripped {
            record_transition(circuit_id, "opened");
        }
    }

    /// Fetch, mutate and write back a circuit under its lock. `None` when the
    /// circuit is not registered.
    fn modify<R>(
        &self,
        circuit_id: &str,
        f: impl FnOnce(&mut Circuit) -> R,
    ) -> Option<(Circuit, R)> {
        let lock = self.lock_for(circuit_id);
        let _held = lock.lock().unwrap_or_else(PoisonError::into_inner);
        let mut circuit = self.store.get(circuit_id)?;
        let out = f(&mut circuit);
        self.store.update(&circuit);
        Some((circuit, out))
    }

    fn lock_for(&self, circuit_id: &str) -> Arc<Mutex<()>> {
        if let Some(lock) = self.locks.get(circuit_id) {
            return lock.value().clone();
        }
        self.locks
            .entry(circuit_id.to_owned())
            .or_default()
            .value()
            .clone()
    }
}

fn record_fallback(circuit_id: &str, reason: &'static str) {
    metrics::counter!(
        "gateway_failover_fallback_total",
        "circuit" => circuit_id.to_owned(),
        "reason" => reason,
    )
    .increment(1);
}

fn record_transition(circuit_id: &str, transition: &'static str) {
    metrics::counter!(
        "gateway_circuit_transitions_total",
        "circuit" => circuit_id.to_owned(),
        "transition" => transition,
    )
    .increment(1);
    metrics::gauge!(
        "gateway_circuit_open",
        "circuit" => circuit_id.to_owned(),
    )
    .set(if transition == "opened" { 1.0 } else { 0.0 });
}
