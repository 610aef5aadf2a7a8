//! Resilience primitives for downstream calls.
//!
//! - `circuit_breaker`: per-dependency Closed/Open/HalfOpen state machine
//! - `registry`: named breakers, one per dependency

pub mod circuit_breaker;
pub mod registry;

pub use circuit_breaker::{
    BreakerStats, BreakerStatus, CircuitBreaker, CircuitState, StateChange, StateObserver,
};
pub use registry::CircuitBreakerRegistry;
