//! Resource governance for ingestion and query pipelines
//!
//! This crate provides:
//! - Priority-aware admission control over memory, CPU and concurrency
//! - Circuit breakers and ordered fallback chains
//! - Workload profiling, hardware sizing and adaptive tuning
//! - A decoupled, sampled log sink
//! - Health checks and observability

pub mod error;
pub mod governor;
pub mod health;
pub mod logging;
pub mod models;
pub mod observability;
pub mod resilience;
pub mod tuning;

pub use error::{
    AttemptFailure, FailureKind, FallbackError, RejectReason, ResourceUnavailableError,
    ServiceUnavailableError, SinkError, StrategyError, TunerError,
};
pub use governor::{
    GovernorBuilder, GovernorConfig, GovernorCounters, GovernorStats, MemoryReclaimer,
    ReservationGuard, ResourceGovernor,
};
pub use health::{
    ComponentHealth, ComponentStatus, HealthRegistry, HealthResponse, ReadinessResponse,
};
pub use models::*;
pub use observability::{GovernanceEvents, GovernanceMetrics};
