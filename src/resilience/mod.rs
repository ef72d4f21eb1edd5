pub mod backoff;
pub mod circuit_breaker;
pub mod policy;

pub use backoff::{ExponentialBackoff, RetryError};
pub use circuit_breaker::{
    BreakerError, BreakerOpen, CallPermit, CircuitBreaker, CircuitBreakerRegistry,
    CircuitBreakerState, CircuitState,
};
pub use policy::{ResilienceError, ResiliencePolicy};

use crate::core::InitError;

/// Errors that may clear up on their own and are worth retrying.
pub trait Transient {
    fn is_transient(&self) -> bool;
}

impl Transient for InitError {
    fn is_transient(&self) -> bool {
        self.category.is_transient()
    }
}

impl Transient for std::io::Error {
    fn is_transient(&self) -> bool {
        InitError::from(std::io::Error::from(self.kind())).is_transient()
    }
}
