//! HTTP API for health checks, governance snapshots and Prometheus metrics

use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use chrono::{DateTime, Utc};
use governance_lib::{
    health::{ComponentStatus, HealthRegistry},
    logging::{AsyncLogSink, SinkStats},
    resilience::{BreakerRegistry, BreakerSnapshot},
    tuning::{AdaptiveTuner, WorkloadSnapshot},
    GovernanceMetrics, GovernorStats, ResourceGovernor,
};
use prometheus::{Encoder, TextEncoder};
use serde::Serialize;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: GovernanceMetrics,
    pub governor: ResourceGovernor,
    pub tuner: Arc<AdaptiveTuner>,
    pub breakers: BreakerRegistry,
    pub sink: Arc<AsyncLogSink>,
}

/// Combined governance snapshot served on `/stats`
#[derive(Debug, Serialize)]
pub struct StatsResponse {
    pub governor: GovernorStats,
    pub workload: WorkloadSnapshot,
    pub breakers: Vec<BreakerSnapshot>,
    pub log_sink: SinkStats,
    pub collected_at: DateTime<Utc>,
}

/// Health check response - returns 200 if healthy, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.health().await;

    let status_code = match health.status {
        ComponentStatus::Healthy => StatusCode::OK,
        ComponentStatus::Degraded => StatusCode::OK, // Still operational
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.health_registry.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

async fn stats(State(state): State<Arc<AppState>>) -> Json<StatsResponse> {
    Json(StatsResponse {
        governor: state.governor.stats(),
        workload: state.tuner.profiler().snapshot(),
        breakers: state.breakers.snapshots(),
        log_sink: state.sink.stats(),
        collected_at: Utc::now(),
    })
}

/// Latest tuning recommendation, 404 before the first cycle
async fn recommendation(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.tuner.recommendation() {
        Some(rec) => (StatusCode::OK, Json(serde_json::to_value(&*rec).unwrap_or_default())),
        None => (
            StatusCode::NOT_FOUND,
            Json(serde_json::json!({ "error": "no recommendation published yet" })),
        ),
    }
}

/// Prometheus metrics endpoint
async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    state.metrics.set_sink_stats(&state.sink.stats());

    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            [("content-type", "text/plain; charset=utf-8")],
            Vec::new(),
        );
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/stats", get(stats))
        .route("/recommendation", get(recommendation))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
