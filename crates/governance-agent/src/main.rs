//! Governance Agent - resource governance for ingestion and query pipelines
//!
//! Builds the governor, breakers, tuner and log sink, runs their
//! background loops, and serves health, stats and metrics over HTTP.

use anyhow::{Context, Result};
use governance_agent::{api, config::AgentConfig, monitor};
use governance_lib::{
    health::{components, HealthRegistry},
    logging::{AdaptiveSampler, AsyncLogSink, JsonLinesWriter, LogWriter, Sampler, TracingWriter},
    resilience::BreakerRegistry,
    tuning::{AdaptiveTuner, HardwareProfile, WorkloadProfiler},
    GovernanceEvents, GovernanceMetrics, ResourceGovernor,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

const AGENT_VERSION: &str = env!("CARGO_PKG_VERSION");

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let config = AgentConfig::load()?;
    info!(service = %config.service_name, api_port = config.api_port, "Agent configured");

    let hardware = HardwareProfile::detect();
    let metrics = GovernanceMetrics::new().context("failed to register metrics")?;

    // Log sink: records go back into tracing and optionally to a file
    let mut writers: Vec<Arc<dyn LogWriter>> = vec![Arc::new(TracingWriter)];
    if let Some(path) = &config.log_file {
        writers.push(Arc::new(JsonLinesWriter::open(path)?));
    }
    let samplers: Vec<Arc<dyn Sampler>> =
        vec![Arc::new(AdaptiveSampler::new(config.sampler.clone()))];
    let sink = Arc::new(AsyncLogSink::with_parts(config.sink.clone(), writers, samplers));
    sink.start().await?;

    let events = GovernanceEvents::with_sink(sink.clone());
    events.log_startup(AGENT_VERSION);

    let governor = ResourceGovernor::builder(config.governor_config(&hardware))
        .metrics(metrics.clone())
        .events(events.clone())
        .build();
    info!(
        memory_limit_mb = governor.config().memory_limit_mb,
        cpu_limit_percent = governor.config().cpu_limit_percent,
        max_concurrent = governor.config().max_concurrent,
        "Resource governor ready"
    );

    let breakers = BreakerRegistry::new(config.breakers.clone())
        .with_events(events.clone())
        .with_metrics(metrics.clone());

    let profiler = Arc::new(WorkloadProfiler::new(config.profiler.clone()));
    let tuner = Arc::new(
        AdaptiveTuner::new(config.tuner.clone(), profiler, hardware)
            .with_metrics(metrics.clone())
            .with_events(events.clone()),
    );
    tuner.start(config.tuner.interval).await?;

    let health_registry = HealthRegistry::new();
    health_registry.register(components::GOVERNOR).await;
    health_registry.register(components::TUNER).await;
    health_registry.register(components::LOG_SINK).await;
    health_registry.register(components::BREAKERS).await;

    let app_state = Arc::new(api::AppState {
        health_registry: health_registry.clone(),
        metrics,
        governor: governor.clone(),
        tuner: tuner.clone(),
        breakers,
        sink: sink.clone(),
    });

    monitor::refresh_health(&app_state).await;
    health_registry.set_ready(true).await;

    let (shutdown_tx, _) = broadcast::channel(1);
    let monitor_handle = tokio::spawn(monitor::run(
        app_state.clone(),
        config.health_interval(),
        shutdown_tx.subscribe(),
    ));
    let api_handle = tokio::spawn(api::serve(config.api_port, app_state));

    // Wait for shutdown signal
    tokio::signal::ctrl_c().await?;
    events.log_shutdown("SIGINT received");
    health_registry.set_ready(false).await;

    let _ = shutdown_tx.send(());
    if let Err(e) = tuner.stop().await {
        warn!(error = %e, "Tuner did not stop cleanly");
    }
    governor.close();
    if let Err(e) = monitor_handle.await {
        warn!(error = %e, "Health monitor terminated abnormally");
    }
    api_handle.abort();
    if let Err(e) = sink.stop().await {
        warn!(error = %e, "Log sink did not drain cleanly");
    }

    info!("Shutdown complete");
    Ok(())
}
