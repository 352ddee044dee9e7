//! Core data models shared across the governance layer

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Scheduling priority of an admission request
///
/// Ordering follows urgency: `Critical > High > Normal > Low`.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Low,
    #[default]
    Normal,
    High,
    Critical,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::Low => "low",
            Priority::Normal => "normal",
            Priority::High => "high",
            Priority::Critical => "critical",
        }
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request for memory, CPU and a concurrency slot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRequest {
    pub operation_id: String,
    pub memory_mb: f64,
    pub cpu_percent: f64,
    pub priority: Priority,
    #[serde(with = "duration_millis")]
    pub timeout: Duration,
}

impl ResourceRequest {
    pub fn new(
        operation_id: impl Into<String>,
        memory_mb: f64,
        cpu_percent: f64,
        priority: Priority,
        timeout: Duration,
    ) -> Self {
        Self {
            operation_id: operation_id.into(),
            memory_mb,
            cpu_percent,
            priority,
            timeout,
        }
    }

    /// Returns a description of the first invalid amount, if any
    pub fn validate(&self) -> Option<String> {
        if !self.memory_mb.is_finite() || self.memory_mb < 0.0 {
            return Some(format!(
                "memory must be a non-negative amount of MB, got {}",
                self.memory_mb
            ));
        }
        if !self.cpu_percent.is_finite() || !(0.0..=100.0).contains(&self.cpu_percent) {
            return Some(format!(
                "cpu must be within 0-100 percent, got {}",
                self.cpu_percent
            ));
        }
        None
    }
}

/// Coarse classification of current system activity
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkloadMode {
    BulkIngestion,
    InteractiveQuery,
    Mixed,
    #[default]
    Idle,
}

impl WorkloadMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            WorkloadMode::BulkIngestion => "bulk_ingestion",
            WorkloadMode::InteractiveQuery => "interactive_query",
            WorkloadMode::Mixed => "mixed",
            WorkloadMode::Idle => "idle",
        }
    }

    /// Stable numeric code used for the workload mode gauge
    pub fn code(&self) -> i64 {
        match self {
            WorkloadMode::Idle => 0,
            WorkloadMode::Mixed => 1,
            WorkloadMode::InteractiveQuery => 2,
            WorkloadMode::BulkIngestion => 3,
        }
    }
}

impl fmt::Display for WorkloadMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Small closed set of values that may be attached to hints and log fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HintValue {
    Bool(bool),
    Int(i64),
    Float(f64),
    Str(String),
}

impl fmt::Display for HintValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HintValue::Bool(v) => write!(f, "{}", v),
            HintValue::Int(v) => write!(f, "{}", v),
            HintValue::Float(v) => write!(f, "{}", v),
            HintValue::Str(v) => f.write_str(v),
        }
    }
}

impl From<bool> for HintValue {
    fn from(v: bool) -> Self {
        HintValue::Bool(v)
    }
}

impl From<i64> for HintValue {
    fn from(v: i64) -> Self {
        HintValue::Int(v)
    }
}

impl From<usize> for HintValue {
    fn from(v: usize) -> Self {
        HintValue::Int(i64::try_from(v).unwrap_or(i64::MAX))
    }
}

impl From<f64> for HintValue {
    fn from(v: f64) -> Self {
        HintValue::Float(v)
    }
}

impl From<&str> for HintValue {
    fn from(v: &str) -> Self {
        HintValue::Str(v.to_string())
    }
}

impl From<String> for HintValue {
    fn from(v: String) -> Self {
        HintValue::Str(v)
    }
}

/// Ordered string-keyed map of hint values
pub type Hints = BTreeMap<String, HintValue>;

pub(crate) mod duration_millis {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let millis = u64::deserialize(d)?;
        Ok(Duration::from_millis(millis))
    }
}
