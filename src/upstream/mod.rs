pub mod backend;
pub mod circuit_breaker;
pub mod clock;
pub mod failover;
pub mod store;

pub use backend::{Backend, ForwardRequest};
pub use circuit_breaker::Circuit;
pub use clock::{Clock, ManualClock, SystemClock};
pub use failover::{FailoverError, FailoverExecutor};
pub use store::{CircuitStore, InMemoryCircuitStore};
