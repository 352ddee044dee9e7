//! Bounded asynchronous log pipeline
//!
//! Producers hand records to a bounded queue; a single background worker
//! forwards them, in order, to every configured writer. Sampling runs on
//! the producer side before a record takes up queue space.

use super::record::LogRecord;
use super::sampler::Sampler;
use super::writer::LogWriter;
use crate::error::SinkError;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What to do when the queue is full
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OverflowPolicy {
    /// Discard the incoming record and count it
    #[default]
    DropNewest,
    /// Wait for queue space
    Block,
}

/// Configuration for the log sink
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SinkConfig {
    /// Maximum number of queued records
    pub capacity: usize,
    pub overflow: OverflowPolicy,
    /// Bounded wait for the worker to drain on stop
    #[serde(with = "crate::models::duration_millis")]
    pub drain_timeout: Duration,
}

impl Default for SinkConfig {
    fn default() -> Self {
        Self {
            capacity: 10_000,
            overflow: OverflowPolicy::DropNewest,
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Result of offering a record to the sink
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Enqueued,
    /// The queue was full (or closed) and the record was discarded
    Dropped,
    /// A sampler filtered the record out
    SampledOut,
}

/// Point-in-time sink counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SinkStats {
    pub enqueued: u64,
    pub written: u64,
    pub dropped: u64,
    pub sampled_out: u64,
    pub write_errors: u64,
    pub queued: usize,
    pub capacity: usize,
    pub running: bool,
}

#[derive(Debug, Default)]
struct SinkCounters {
    enqueued: AtomicU64,
    written: AtomicU64,
    dropped: AtomicU64,
    sampled_out: AtomicU64,
    write_errors: AtomicU64,
}

struct WorkerHandle {
    shutdown: broadcast::Sender<()>,
    join: JoinHandle<mpsc::Receiver<LogRecord>>,
}

/// Bounded-queue log sink with a single background writer task
pub struct AsyncLogSink {
    config: SinkConfig,
    sender: mpsc::Sender<LogRecord>,
    receiver: Mutex<Option<mpsc::Receiver<LogRecord>>>,
    writers: Arc<Vec<Arc<dyn LogWriter>>>,
    samplers: Vec<Arc<dyn Sampler>>,
    counters: Arc<SinkCounters>,
    running: AtomicBool,
    worker: tokio::sync::Mutex<Option<WorkerHandle>>,
}

impl AsyncLogSink {
    pub fn new(config: SinkConfig) -> Self {
        Self::with_parts(config, Vec::new(), Vec::new())
    }

    /// Create a sink with writers and samplers
    pub fn with_parts(
        config: SinkConfig,
        writers: Vec<Arc<dyn LogWriter>>,
        samplers: Vec<Arc<dyn Sampler>>,
    ) -> Self {
        let (sender, receiver) = mpsc::channel(config.capacity.max(1));
        Self {
            config,
            sender,
            receiver: Mutex::new(Some(receiver)),
            writers: Arc::new(writers),
            samplers,
            counters: Arc::new(SinkCounters::default()),
            running: AtomicBool::new(false),
            worker: tokio::sync::Mutex::new(None),
        }
    }

    pub fn config(&self) -> &SinkConfig {
        &self.config
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    fn passes_samplers(&self, record: &LogRecord) -> bool {
        self.samplers.iter().all(|s| s.should_emit(record))
    }

    /// Offer a record without ever waiting
    ///
    /// Applies samplers, then drops the record if the queue is full,
    /// regardless of the configured overflow policy.
    pub fn try_enqueue(&self, record: LogRecord) -> EnqueueOutcome {
        if !self.passes_samplers(&record) {
            self.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::SampledOut;
        }
        self.offer(record)
    }

    /// Offer a record, honouring the overflow policy
    ///
    /// With [`OverflowPolicy::Block`] this waits for queue space; if the
    /// worker is not running that wait lasts until it is started.
    pub async fn enqueue(&self, record: LogRecord) -> EnqueueOutcome {
        if !self.passes_samplers(&record) {
            self.counters.sampled_out.fetch_add(1, Ordering::Relaxed);
            return EnqueueOutcome::SampledOut;
        }

        match self.config.overflow {
            OverflowPolicy::DropNewest => self.offer(record),
            OverflowPolicy::Block => match self.sender.send(record).await {
                Ok(()) => {
                    self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                    EnqueueOutcome::Enqueued
                }
                Err(_) => {
                    self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                    EnqueueOutcome::Dropped
                }
            },
        }
    }

    fn offer(&self, record: LogRecord) -> EnqueueOutcome {
        match self.sender.try_send(record) {
            Ok(()) => {
                self.counters.enqueued.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Enqueued
            }
            Err(_) => {
                self.counters.dropped.fetch_add(1, Ordering::Relaxed);
                EnqueueOutcome::Dropped
            }
        }
    }

    /// Spawn the background worker
    pub async fn start(&self) -> Result<(), SinkError> {
        let mut worker = self.worker.lock().await;
        if worker.is_some() {
            return Err(SinkError::AlreadyRunning);
        }

        let receiver = self
            .receiver
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .ok_or(SinkError::ReceiverLost)?;

        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let join = tokio::spawn(run_worker(
            receiver,
            self.writers.clone(),
            self.counters.clone(),
            shutdown_rx,
        ));

        *worker = Some(WorkerHandle { shutdown, join });
        self.running.store(true, Ordering::SeqCst);
        info!(
            capacity = self.config.capacity,
            writers = self.writers.len(),
            "Log sink worker started"
        );
        Ok(())
    }

    /// Signal the worker, wait for it to drain, and reclaim the queue
    pub async fn stop(&self) -> Result<(), SinkError> {
        let handle = match self.worker.lock().await.take() {
            Some(handle) => handle,
            None => return Ok(()),
        };
        self.running.store(false, Ordering::SeqCst);

        let _ = handle.shutdown.send(());
        let mut join = handle.join;

        match tokio::time::timeout(self.config.drain_timeout, &mut join).await {
            Ok(Ok(receiver)) => {
                *self.receiver.lock().unwrap_or_else(PoisonError::into_inner) = Some(receiver);
                info!("Log sink worker stopped");
                Ok(())
            }
            Ok(Err(e)) => {
                warn!(error = %e, "Log sink worker terminated abnormally");
                Err(SinkError::ReceiverLost)
            }
            Err(_) => {
                join.abort();
                warn!(
                    timeout_ms = self.config.drain_timeout.as_millis() as u64,
                    "Log sink worker did not drain in time, aborting"
                );
                Err(SinkError::DrainTimeout(self.config.drain_timeout))
            }
        }
    }

    pub fn stats(&self) -> SinkStats {
        let capacity = self.config.capacity.max(1);
        SinkStats {
            enqueued: self.counters.enqueued.load(Ordering::Relaxed),
            written: self.counters.written.load(Ordering::Relaxed),
            dropped: self.counters.dropped.load(Ordering::Relaxed),
            sampled_out: self.counters.sampled_out.load(Ordering::Relaxed),
            write_errors: self.counters.write_errors.load(Ordering::Relaxed),
            queued: capacity - self.sender.capacity(),
            capacity,
            running: self.is_running(),
        }
    }
}

fn write_all(writers: &[Arc<dyn LogWriter>], counters: &SinkCounters, record: &LogRecord) {
    for writer in writers {
        if let Err(e) = writer.write(record) {
            counters.write_errors.fetch_add(1, Ordering::Relaxed);
            debug!(writer = writer.name(), error = %e, "Log writer failed");
        }
    }
    counters.written.fetch_add(1, Ordering::Relaxed);
}

async fn run_worker(
    mut receiver: mpsc::Receiver<LogRecord>,
    writers: Arc<Vec<Arc<dyn LogWriter>>>,
    counters: Arc<SinkCounters>,
    mut shutdown: broadcast::Receiver<()>,
) -> mpsc::Receiver<LogRecord> {
    loop {
        tokio::select! {
            biased;
            record = receiver.recv() => match record {
                Some(record) => write_all(&writers, &counters, &record),
                None => break,
            },
            _ = shutdown.recv() => {
                let mut drained = 0u64;
                while let Ok(record) = receiver.try_recv() {
                    write_all(&writers, &counters, &record);
                    drained += 1;
                }
                debug!(drained = drained, "Log sink drained on shutdown");
                break;
            }
        }
    }

    for writer in writers.iter() {
        if let Err(e) = writer.flush() {
            counters.write_errors.fetch_add(1, Ordering::Relaxed);
            debug!(writer = writer.name(), error = %e, "Log writer flush failed");
        }
    }
    receiver
}
