//! Periodic component health refresh

use crate::api::AppState;
use governance_lib::health::{components, ComponentHealth};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::interval;
use tracing::{debug, info};

/// Recompute component health from live snapshots
pub async fn refresh_health(state: &AppState) {
    let registry = &state.health_registry;

    registry
        .update(
            components::GOVERNOR,
            ComponentHealth::from_governor(&state.governor.stats()),
        )
        .await;

    let sink_stats = state.sink.stats();
    state.metrics.set_sink_stats(&sink_stats);
    registry
        .update(components::LOG_SINK, ComponentHealth::from_sink(&sink_stats))
        .await;

    registry
        .update(
            components::BREAKERS,
            ComponentHealth::from_breakers(&state.breakers),
        )
        .await;

    let tuner_health = if state.tuner.recommendation().is_some() {
        ComponentHealth::healthy()
    } else {
        ComponentHealth::degraded("no recommendation published yet")
    };
    registry.update(components::TUNER, tuner_health).await;
}

/// Refresh health on every tick until shutdown
pub async fn run(state: Arc<AppState>, every: Duration, mut shutdown: broadcast::Receiver<()>) {
    info!(
        interval_secs = every.as_secs(),
        "Starting health monitor loop"
    );

    let mut ticker = interval(every);
    let mut refreshes = 0u64;

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                refresh_health(&state).await;
                refreshes += 1;
                if refreshes % 12 == 0 {
                    let health = state.health_registry.health().await;
                    debug!(status = ?health.status, refreshes = refreshes, "Health refreshed");
                }
            }
            _ = shutdown.recv() => {
                info!("Shutting down health monitor loop");
                break;
            }
        }
    }
}
