use crate::upstream::circuit_breaker::Circuit;
use dashmap::DashMap;

/// Keyed container owning every registered circuit.
///
/// `get` hands out an owned snapshot; a caller that mutates it must write it
/// back with `update`. Implementations backed by out-of-process storage rely
/// on that write-through, so callers never skip it.
pub trait CircuitStore: Send + Sync {
    /// Register a circuit under its identifier. An existing entry is replaced.
    fn add(&self, circuit: Circuit);

    /// `None` when nothing is registered under `identifier`.
    fn get(&self, identifier: &str) -> Option<Circuit>;

    /// Persist a circuit previously fetched with `get` and mutated.
    fn update(&self, circuit: &Circuit);

    /// All circuits, sorted by identifier.
    fn circuits(&self) -> Vec<Circuit>;
}

/// Process-local store. Shard locks are held only for the clone or insert.
#[derive(Default)]
pub struct InMemoryCircuitStore {
    circuits: DashMap<String, Circuit>,
}

impl InMemoryCircuitStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.circuits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.circuits.is_empty()
    }
}

impl CircuitStore for InMemoryCircuitStore {
    fn add(&self, circuit: Circuit) {
        tracing::info!(
            circuit = %circuit.identifier(),
            failure_threshold = circuit.failure_threshold(),
            retry_timeout_secs = circuit.retry_timeout().as_secs(),
            "circuit_breaker: registered"
        );
        self.circuits.insert(circuit.identifier().to_string(), circuit);
    }

    fn get(&self, identifier: &str) -> Option<Circuit> {
        self.circuits.get(identifier).map(|entry| entry.value().clone())
    }

    fn update(&self, circuit: &Circuit) {
        // Fast path: overwrite in place without allocating a key.
        if let Some(mut entry) = self.circuits.get_mut(circuit.identifier()) {
            *entry = circuit.clone();
            return;
        }
        self.circuits.insert(circuit.identifier().to_string(), circuit.clone());
    }

    fn circuits(&self) -> Vec<Circuit> {
        let mut all: Vec<Circuit> = self
            .circuits
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        all.sort_by(|a, b| a.identifier().cmp(b.identifier()));
        all
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_add_and_get() {
        let store = InMemoryCircuitStore::new();
        let circuit = Circuit::new("primary")
            .with_failure_threshold(1)
            .with_retry_timeout(Duration::from_secs(1));
        store.add(circuit.clone());

        assert_eq!(store.get("primary"), Some(circuit));
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn test_get_unknown_is_none() {
        let store = InMemoryCircuitStore::new();
        assert!(store.is_empty());
        assert!(store.get("missing").is_none());
    }

    #[test]
    fn test_add_overwrites_existing() {
        let store = InMemoryCircuitStore::new();
        store.add(Circuit::new("openai").with_failure_threshold(3));
        store.add(Circuit::new("openai").with_failure_threshold(7));

        assert_eq!(store.len(), 1);
        assert_eq!(store.get("openai").unwrap().failure_threshold(), 7);
    }

    #[test]
    fn test_snapshot_mutation_requires_update() {
        let store = InMemoryCircuitStore::new();
        store.add(Circuit::new("openai"));

        let mut fetched = store.get("openai").unwrap();
        fetched.trip();
        assert!(!store.get("openai").unwrap().is_open());

        store.update(&fetched);
        assert!(store.get("openai").unwrap().is_open());
    }

    #[test]
    fn test_circuits_sorted_by_identifier() {
        let store = InMemoryCircuitStore::new();
        store.add(Circuit::new("b"));
        store.add(Circuit::new("c"));
        store.add(Circuit::new("a"));

        let ids: Vec<String> = store
            .circuits()
            .iter()
            .map(|c| c.identifier().to_string())
            .collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
