//! Sampling filters applied before a record is queued
//!
//! Both samplers always pass records at or above their never-sample
//! severity, so warnings and errors are never thinned out.

use super::record::{LogRecord, Severity};
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Filter deciding whether a record should be queued
pub trait Sampler: Send + Sync {
    fn should_emit(&self, record: &LogRecord) -> bool;
}

/// Configuration for the fixed-rate sampler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FixedRateConfig {
    /// Records at or above this severity always pass
    pub never_sample_at: Severity,
    /// Pass one of every `every_n` lower-severity records
    pub every_n: u64,
}

impl Default for FixedRateConfig {
    fn default() -> Self {
        Self {
            never_sample_at: Severity::Warning,
            every_n: 10,
        }
    }
}

/// Passes one in every N low-severity records by simple counting
#[derive(Debug)]
pub struct FixedRateSampler {
    config: FixedRateConfig,
    counter: AtomicU64,
}

impl FixedRateSampler {
    pub fn new(config: FixedRateConfig) -> Self {
        Self {
            config,
            counter: AtomicU64::new(0),
        }
    }
}

impl Sampler for FixedRateSampler {
    fn should_emit(&self, record: &LogRecord) -> bool {
        if record.severity >= self.config.never_sample_at {
            return true;
        }
        if self.config.every_n <= 1 {
            return true;
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        n % self.config.every_n == 0
    }
}

/// Configuration for the adaptive sampler
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AdaptiveSamplerConfig {
    /// Records at or above this severity always pass
    pub never_sample_at: Severity,
    /// Per-source rate (records/second) above which sampling kicks in
    pub target_rate_per_sec: f64,
    /// Trailing window used to measure the observed rate
    #[serde(with = "crate::models::duration_millis")]
    pub window: Duration,
    pub min_divisor: u64,
    pub max_divisor: u64,
}

impl Default for AdaptiveSamplerConfig {
    fn default() -> Self {
        Self {
            never_sample_at: Severity::Warning,
            target_rate_per_sec: 100.0,
            window: Duration::from_secs(10),
            min_divisor: 1,
            max_divisor: 1000,
        }
    }
}

#[derive(Debug, Default)]
struct SourceWindow {
    arrivals: VecDeque<Instant>,
    counter: u64,
    divisor: u64,
}

impl SourceWindow {
    fn prune(&mut self, now: Instant, window: Duration) {
        while let Some(front) = self.arrivals.front() {
            if now.saturating_duration_since(*front) > window {
                self.arrivals.pop_front();
            } else {
                break;
            }
        }
    }
}

/// Per-source sampler that raises its divisor as the source gets louder
///
/// `divisor = ceil(observed_rate / target_rate)`, clamped to
/// `[min_divisor, max_divisor]`.
#[derive(Debug)]
pub struct AdaptiveSampler {
    config: AdaptiveSamplerConfig,
    sources: DashMap<String, SourceWindow>,
}

impl AdaptiveSampler {
    pub fn new(config: AdaptiveSamplerConfig) -> Self {
        Self {
            config,
            sources: DashMap::new(),
        }
    }

    /// Divisor currently applied to a source (1 for unseen sources)
    pub fn divisor(&self, source: &str) -> u64 {
        self.sources
            .get(source)
            .map(|w| w.divisor.max(1))
            .unwrap_or(1)
    }

    fn compute_divisor(&self, arrivals: usize) -> u64 {
        let min = self.config.min_divisor.max(1);
        let max = self.config.max_divisor.max(min);
        let window_secs = self.config.window.as_secs_f64();
        if window_secs <= 0.0 || self.config.target_rate_per_sec <= 0.0 {
            return min;
        }
        let observed = arrivals as f64 / window_secs;
        let raw = (observed / self.config.target_rate_per_sec).ceil();
        (raw as u64).clamp(min, max)
    }

    pub(crate) fn should_emit_at(&self, record: &LogRecord, now: Instant) -> bool {
        let mut window = self.sources.entry(record.source.clone()).or_default();
        window.prune(now, self.config.window);
        window.arrivals.push_back(now);
        window.divisor = self.compute_divisor(window.arrivals.len());

        if record.severity >= self.config.never_sample_at {
            return true;
        }

        let pass = window.counter % window.divisor == 0;
        window.counter = window.counter.wrapping_add(1);
        pass
    }
}

impl Sampler for AdaptiveSampler {
    fn should_emit(&self, record: &LogRecord) -> bool {
        self.should_emit_at(record, Instant::now())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(severity: Severity, source: &str) -> LogRecord {
        LogRecord::new(severity, source, "message")
    }

    #[test]
    fn test_fixed_rate_passes_every_nth() {
        let sampler = FixedRateSampler::new(FixedRateConfig {
            never_sample_at: Severity::Warning,
            every_n: 5,
        });

        let passed = (0..20)
            .filter(|_| sampler.should_emit(&record(Severity::Info, "ingest")))
            .count();
        assert_eq!(passed, 4);
    }

    #[test]
    fn test_fixed_rate_never_samples_warnings() {
        let sampler = FixedRateSampler::new(FixedRateConfig {
            never_sample_at: Severity::Warning,
            every_n: 1000,
        });

        for _ in 0..50 {
            assert!(sampler.should_emit(&record(Severity::Warning, "ingest")));
            assert!(sampler.should_emit(&record(Severity::Critical, "ingest")));
        }
    }

    #[test]
    fn test_fixed_rate_every_one_passes_all() {
        let sampler = FixedRateSampler::new(FixedRateConfig {
            never_sample_at: Severity::Error,
            every_n: 1,
        });
        assert!((0..10).all(|_| sampler.should_emit(&record(Severity::Debug, "q"))));
    }

    #[test]
    fn test_adaptive_divisor_grows_with_rate() {
        let sampler = AdaptiveSampler::new(AdaptiveSamplerConfig {
            never_sample_at: Severity::Warning,
            target_rate_per_sec: 10.0,
            window: Duration::from_secs(1),
            min_divisor: 1,
            max_divisor: 100,
        });

        let now = Instant::now();
        let passed = (0..50)
            .filter(|_| sampler.should_emit_at(&record(Severity::Info, "query"), now))
            .count();

        // 50 records in a 1s window against a target of 10/s
        assert_eq!(sampler.divisor("query"), 5);
        assert!(passed < 50);
        assert!(passed >= 10);
    }

    #[test]
    fn test_adaptive_divisor_is_clamped() {
        let sampler = AdaptiveSampler::new(AdaptiveSamplerConfig {
            never_sample_at: Severity::Warning,
            target_rate_per_sec: 1.0,
            window: Duration::from_secs(1),
            min_divisor: 2,
            max_divisor: 8,
        });

        let now = Instant::now();
        sampler.should_emit_at(&record(Severity::Info, "quiet"), now);
        assert_eq!(sampler.divisor("quiet"), 2);

        for _ in 0..100 {
            sampler.should_emit_at(&record(Severity::Info, "loud"), now);
        }
        assert_eq!(sampler.divisor("loud"), 8);
    }

    #[test]
    fn test_adaptive_sources_are_independent() {
        let sampler = AdaptiveSampler::new(AdaptiveSamplerConfig {
            target_rate_per_sec: 5.0,
            window: Duration::from_secs(1),
            ..Default::default()
        });

        let now = Instant::now();
        for _ in 0..100 {
            sampler.should_emit_at(&record(Severity::Debug, "noisy"), now);
        }
        assert!(sampler.should_emit_at(&record(Severity::Debug, "calm"), now));
        assert_eq!(sampler.divisor("calm"), 1);
        assert_eq!(sampler.divisor("noisy"), 20);
    }

    #[test]
    fn test_adaptive_never_samples_warnings_under_load() {
        let sampler = AdaptiveSampler::new(AdaptiveSamplerConfig {
            target_rate_per_sec: 1.0,
            window: Duration::from_secs(60),
            max_divisor: 1000,
            ..Default::default()
        });

        let now = Instant::now();
        for _ in 0..500 {
            sampler.should_emit_at(&record(Severity::Info, "flood"), now);
        }
        for _ in 0..20 {
            assert!(sampler.should_emit_at(&record(Severity::Warning, "flood"), now));
        }
    }

    #[test]
    fn test_adaptive_window_expires_old_arrivals() {
        let sampler = AdaptiveSampler::new(AdaptiveSamplerConfig {
            target_rate_per_sec: 1.0,
            window: Duration::from_millis(100),
            ..Default::default()
        });

        let start = Instant::now();
        for _ in 0..50 {
            sampler.should_emit_at(&record(Severity::Info, "burst"), start);
        }
        assert!(sampler.divisor("burst") > 1);

        let later = start + Duration::from_secs(5);
        sampler.should_emit_at(&record(Severity::Info, "burst"), later);
        assert_eq!(sampler.divisor("burst"), 10);
    }
}
