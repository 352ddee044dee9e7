//! Decoupled, load-adaptive logging
//!
//! This module provides:
//! - A bounded queue with a single background writer task
//! - Fixed-rate and per-source adaptive sampling filters
//! - Writers forwarding records to `tracing` or a JSON lines file

mod record;
mod sampler;
mod sink;
mod writer;

pub use record::{LogFields, LogRecord, Severity};
pub use sampler::{
    AdaptiveSampler, AdaptiveSamplerConfig, FixedRateConfig, FixedRateSampler, Sampler,
};
pub use sink::{AsyncLogSink, EnqueueOutcome, OverflowPolicy, SinkConfig, SinkStats};
pub use writer::{JsonLinesWriter, LogWriter, TracingWriter};
