//! Periodic tuning recommendations
//!
//! The tuner classifies the workload, refreshes available memory and
//! publishes an immutable [`Recommendation`]. Readers get an `Arc` to the
//! last complete snapshot; a new cycle swaps in a fresh one.

use super::hardware::HardwareProfile;
use super::profiler::WorkloadProfiler;
use crate::error::TunerError;
use crate::models::{duration_millis, Hints, WorkloadMode};
use crate::observability::{GovernanceEvents, GovernanceMetrics};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex, PoisonError, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TunerConfig {
    /// Time between tuning cycles
    #[serde(with = "duration_millis")]
    pub interval: Duration,
    /// Bounded wait for the loop to exit on stop
    #[serde(with = "duration_millis")]
    pub stop_timeout: Duration,
}

impl Default for TunerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            stop_timeout: Duration::from_secs(5),
        }
    }
}

/// One published tuning snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Recommendation {
    pub mode: WorkloadMode,
    pub batch_size: usize,
    pub cache_size: usize,
    pub worker_count: usize,
    pub hints: Hints,
    pub query_rate: f64,
    pub ingestion_rate: f64,
    pub available_memory_gb: f64,
    pub memory_pressure: f64,
    pub generated_at: DateTime<Utc>,
}

/// Policy hints for downstream pipelines
fn mode_hints(mode: WorkloadMode, batch_size: usize, hardware: &HardwareProfile) -> Hints {
    let mut hints = Hints::new();
    match mode {
        WorkloadMode::BulkIngestion => {
            hints.insert("read_cache_enabled".into(), false.into());
            hints.insert("write_buffering".into(), true.into());
            hints.insert("processing_unit_size".into(), batch_size.into());
            hints.insert("query_priority".into(), "low".into());
        }
        WorkloadMode::InteractiveQuery => {
            hints.insert("read_cache_enabled".into(), true.into());
            hints.insert("prefetch".into(), true.into());
            hints.insert("processing_unit_size".into(), batch_size.into());
            hints.insert("query_priority".into(), "high".into());
        }
        WorkloadMode::Mixed => {
            hints.insert("read_cache_enabled".into(), true.into());
            hints.insert("processing_unit_size".into(), batch_size.into());
            hints.insert("query_priority".into(), "normal".into());
        }
        WorkloadMode::Idle => {
            hints.insert("read_cache_enabled".into(), true.into());
            hints.insert("background_maintenance".into(), true.into());
        }
    }
    hints.insert("use_accelerator".into(), hardware.has_accelerator.into());
    hints
}

struct LoopHandle {
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<()>,
}

/// Turns workload observations into sizing recommendations
pub struct AdaptiveTuner {
    config: TunerConfig,
    profiler: Arc<WorkloadProfiler>,
    hardware: Mutex<HardwareProfile>,
    current: RwLock<Option<Arc<Recommendation>>>,
    metrics: Option<GovernanceMetrics>,
    events: GovernanceEvents,
    worker: tokio::sync::Mutex<Option<LoopHandle>>,
}

impl AdaptiveTuner {
    pub fn new(config: TunerConfig, profiler: Arc<WorkloadProfiler>, hardware: HardwareProfile) -> Self {
        Self {
            config,
            profiler,
            hardware: Mutex::new(hardware),
            current: RwLock::new(None),
            metrics: None,
            events: GovernanceEvents::new(),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn with_metrics(mut self, metrics: GovernanceMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn with_events(mut self, events: GovernanceEvents) -> Self {
        self.events = events;
        self
    }

    pub fn config(&self) -> &TunerConfig {
        &self.config
    }

    pub fn profiler(&self) -> &Arc<WorkloadProfiler> {
        &self.profiler
    }

    /// Current hardware profile
    pub fn hardware(&self) -> HardwareProfile {
        self.hardware
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one tuning cycle and publish its result
    pub fn generate_recommendation(&self) -> Arc<Recommendation> {
        let workload = self.profiler.snapshot();

        let hardware = {
            let mut hardware = self.hardware.lock().unwrap_or_else(PoisonError::into_inner);
            hardware.refresh_available_memory();
            hardware.clone()
        };

        let batch_size = hardware.recommended_batch_size(workload.mode);
        let recommendation = Arc::new(Recommendation {
            mode: workload.mode,
            batch_size,
            cache_size: hardware.recommended_cache_size(workload.mode),
            worker_count: hardware.recommended_workers(),
            hints: mode_hints(workload.mode, batch_size, &hardware),
            query_rate: workload.query_rate,
            ingestion_rate: workload.ingestion_rate,
            available_memory_gb: hardware.available_memory_gb,
            memory_pressure: hardware.memory_pressure(),
            generated_at: Utc::now(),
        });

        *self.current.write().unwrap_or_else(PoisonError::into_inner) =
            Some(recommendation.clone());

        if let Some(metrics) = &self.metrics {
            metrics.set_recommendation(
                recommendation.mode,
                recommendation.batch_size,
                recommendation.cache_size,
                recommendation.worker_count,
            );
        }
        self.events.recommendation_published(
            recommendation.mode,
            recommendation.batch_size,
            recommendation.cache_size,
            recommendation.worker_count,
        );
        recommendation
    }

    /// Last published snapshot, `None` before the first cycle
    pub fn recommendation(&self) -> Option<Arc<Recommendation>> {
        self.current
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub async fn is_running(&self) -> bool {
        self.worker.lock().await.is_some()
    }

    /// Start the background tuning loop
    ///
    /// The first cycle runs immediately.
    pub async fn start(self: &Arc<Self>, every: Duration) -> Result<(), TunerError> {
        if every.is_zero() {
            return Err(TunerError::ZeroInterval);
        }
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(TunerError::AlreadyRunning);
        }

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(run_loop(self.clone(), every, shutdown_rx));
        *worker = Some(LoopHandle { shutdown, join });

        info!(interval_ms = every.as_millis() as u64, "Tuner loop started");
        Ok(())
    }

    /// Signal the loop to stop and wait for it within the stop timeout
    pub async fn stop(&self) -> Result<(), TunerError> {
        let handle = match self.worker.lock().await.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };

        let _ = handle.shutdown.send(());
        let mut join = handle.join;

        match tokio::time::timeout(self.config.stop_timeout, &mut join).await {
            Ok(Ok(())) => {
                info!("Tuner loop stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Tuner loop terminated abnormally");
                Ok(())
            }
            Err(_) => {
                join.abort();
                warn!(
                    timeout_ms = self.config.stop_timeout.as_millis() as u64,
                    "Tuner loop did not stop in time, aborting"
                );
                Err(TunerError::StopTimeout(self.config.stop_timeout))
            }
        }
    }
}

async fn run_loop(tuner: Arc<AdaptiveTuner>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    let mut cycles = 0u64;

    loop {
        tokio::select! {
            biased;
            _ = shutdown.recv() => {
                debug!(cycles = cycles, "Tuner loop received shutdown");
                break;
            }
            _ = ticker.tick() => {
                let recommendation = tuner.generate_recommendation();
                cycles += 1;
                debug!(
                    cycle = cycles,
                    mode = %recommendation.mode,
                    batch_size = recommendation.batch_size,
                    "Tuning cycle complete"
                );
            }
        }
    }
}
