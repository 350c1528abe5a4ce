mod circuit_registry;
mod red_fix_tracker;
mod review_breaker;

pub use circuit_registry::{CircuitHealth, CircuitRegistry};
pub use red_fix_tracker::{issue_fingerprint, RedFixAttemptTracker, RedFixDenial};
pub use review_breaker::StaticReviewCircuitBreaker;
