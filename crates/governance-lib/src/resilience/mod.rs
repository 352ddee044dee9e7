//! Failure isolation for calls to unreliable dependencies
//!
//! This module provides:
//! - Per-dependency circuit breakers and a shared registry
//! - Ordered fallback chains with typed, absorbable failure kinds

mod breaker;
mod fallback;

pub use breaker::{BreakerConfig, BreakerRegistry, BreakerSnapshot, BreakerState, CircuitBreaker};
pub use fallback::{BreakerGuarded, FallbackChain, FnStrategy, Strategy, WithFallback};
