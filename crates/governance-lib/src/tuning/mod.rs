//! Workload-aware tuning
//!
//! This module provides:
//! - Multiplicative batch size adjustment
//! - Rolling-window workload classification
//! - Hardware detection and sizing formulas
//! - A background tuner publishing immutable recommendations

mod batch;
mod hardware;
mod profiler;
mod tuner;

pub use batch::{next_batch_size, AdaptiveBatchSizeController, BatchSizeConfig};
pub use hardware::HardwareProfile;
pub use profiler::{ModeThresholds, ProfilerConfig, WorkloadProfiler, WorkloadSnapshot};
pub use tuner::{AdaptiveTuner, Recommendation, TunerConfig};
