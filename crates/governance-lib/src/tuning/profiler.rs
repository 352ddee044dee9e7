//! Rolling-window workload classification

use crate::models::{duration_millis, WorkloadMode};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Per-minute rate thresholds used by [`WorkloadProfiler::detect_mode`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    /// Bulk ingestion needs more ingestions per minute than this...
    pub bulk_min_ingestion_rate: f64,
    /// ...and fewer queries per minute than this
    pub bulk_max_query_rate: f64,
    pub interactive_min_query_rate: f64,
    pub interactive_max_ingestion_rate: f64,
    pub mixed_min_query_rate: f64,
    pub mixed_min_ingestion_rate: f64,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            bulk_min_ingestion_rate: 50.0,
            bulk_max_query_rate: 5.0,
            interactive_min_query_rate: 10.0,
            interactive_max_ingestion_rate: 10.0,
            mixed_min_query_rate: 5.0,
            mixed_min_ingestion_rate: 10.0,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ProfilerConfig {
    #[serde(with = "duration_millis")]
    pub window: Duration,
    pub thresholds: ModeThresholds,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(60),
            thresholds: ModeThresholds::default(),
        }
    }
}

/// Point-in-time view of the profiler windows
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkloadSnapshot {
    pub mode: WorkloadMode,
    pub query_rate: f64,
    pub ingestion_rate: f64,
    pub queries_in_window: usize,
    pub ingestions_in_window: usize,
    pub mean_query_ms: Option<f64>,
    pub mean_ingestion_size: Option<f64>,
}

#[derive(Debug, Default)]
struct Windows {
    queries: VecDeque<(Instant, Duration)>,
    ingestions: VecDeque<(Instant, u64)>,
}

impl Windows {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some((at, _)) = self.queries.front() {
            if now.saturating_duration_since(*at) > window {
                self.queries.pop_front();
            } else {
                break;
            }
        }
        while let Some((at, _)) = self.ingestions.front() {
            if now.saturating_duration_since(*at) > window {
                self.ingestions.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Observes queries and ingestions and classifies the current workload
#[derive(Debug)]
pub struct WorkloadProfiler {
    config: ProfilerConfig,
    windows: Mutex<Windows>,
}

impl Default for WorkloadProfiler {
    fn default() -> Self {
        Self::new(ProfilerConfig::default())
    }
}

impl WorkloadProfiler {
    pub fn new(config: ProfilerConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn config(&self) -> &ProfilerConfig {
        &self.config
    }

    fn lock(&self) -> MutexGuard<'_, Windows> {
        self.windows.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Record a completed query and how long it took
    pub fn record_query(&self, duration: Duration) {
        self.record_query_at(duration, Instant::now());
    }

    /// Record an ingestion of `size` items
    pub fn record_ingestion(&self, size: u64) {
        self.record_ingestion_at(size, Instant::now());
    }

    pub(crate) fn record_query_at(&self, duration: Duration, now: Instant) {
        let mut windows = self.lock();
        windows.queries.push_back((now, duration));
        windows.prune(now, self.config.window);
    }

    pub(crate) fn record_ingestion_at(&self, size: u64, now: Instant) {
        let mut windows = self.lock();
        windows.ingestions.push_back((now, size));
        windows.prune(now, self.config.window);
    }

    /// Scale an in-window count to events per minute
    fn per_minute(&self, count: usize) -> f64 {
        let window_secs = self.config.window.as_secs_f64();
        if window_secs <= 0.0 {
            return 0.0;
        }
        count as f64 * 60.0 / window_secs
    }

    /// Queries per minute over the rolling window
    pub fn query_rate(&self) -> f64 {
        let count = {
            let mut windows = self.lock();
            windows.prune(Instant::now(), self.config.window);
            windows.queries.len()
        };
        self.per_minute(count)
    }

    /// Ingestions per minute over the rolling window
    pub fn ingestion_rate(&self) -> f64 {
        let count = {
            let mut windows = self.lock();
            windows.prune(Instant::now(), self.config.window);
            windows.ingestions.len()
        };
        self.per_minute(count)
    }

    /// Classify the workload from the current rates
    pub fn detect_mode(&self) -> WorkloadMode {
        self.snapshot().mode
    }

    fn classify(&self, query_rate: f64, ingestion_rate: f64) -> WorkloadMode {
        let t = &self.config.thresholds;
        if ingestion_rate > t.bulk_min_ingestion_rate && query_rate < t.bulk_max_query_rate {
            WorkloadMode::BulkIngestion
        } else if query_rate > t.interactive_min_query_rate
            && ingestion_rate < t.interactive_max_ingestion_rate
        {
            WorkloadMode::InteractiveQuery
        } else if query_rate > t.mixed_min_query_rate || ingestion_rate > t.mixed_min_ingestion_rate
        {
            WorkloadMode::Mixed
        } else {
            WorkloadMode::Idle
        }
    }

    pub fn snapshot(&self) -> WorkloadSnapshot {
        self.snapshot_at(Instant::now())
    }

    pub(crate) fn snapshot_at(&self, now: Instant) -> WorkloadSnapshot {
        let (queries, ingestions, mean_query_ms, mean_ingestion_size) = {
            let mut windows = self.lock();
            windows.prune(now, self.config.window);

            let queries = windows.queries.len();
            let ingestions = windows.ingestions.len();
            let mean_query_ms = (queries > 0).then(|| {
                let total: f64 = windows
                    .queries
                    .iter()
                    .map(|(_, d)| d.as_secs_f64() * 1000.0)
                    .sum();
                total / queries as f64
            });
            let mean_ingestion_size = (ingestions > 0).then(|| {
                let total: u64 = windows.ingestions.iter().map(|(_, s)| *s).sum();
                total as f64 / ingestions as f64
            });
            (queries, ingestions, mean_query_ms, mean_ingestion_size)
        };

        let query_rate = self.per_minute(queries);
        let ingestion_rate = self.per_minute(ingestions);
        WorkloadSnapshot {
            mode: self.classify(query_rate, ingestion_rate),
            query_rate,
            ingestion_rate,
            queries_in_window: queries,
            ingestions_in_window: ingestions,
            mean_query_ms,
            mean_ingestion_size,
        }
    }
}
