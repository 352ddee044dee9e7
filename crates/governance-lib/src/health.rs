//! Health check infrastructure for the governance layer
//!
//! Tracks component health and readiness for liveness and readiness
//! probes, and derives component status from governance snapshots.

use crate::governor::GovernorStats;
use crate::logging::SinkStats;
use crate::resilience::BreakerRegistry;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Health status of a component
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ComponentStatus {
    /// Component is functioning normally
    Healthy,
    /// Component is experiencing issues but still operational
    Degraded,
    /// Component has failed
    Unhealthy,
}

impl ComponentStatus {
    /// Returns true if the component is at least partially operational
    pub fn is_operational(&self) -> bool {
        matches!(self, ComponentStatus::Healthy | ComponentStatus::Degraded)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentHealth {
    pub status: ComponentStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_check_timestamp: i64,
}

impl ComponentHealth {
    fn with_status(status: ComponentStatus, message: Option<String>) -> Self {
        Self {
            status,
            message,
            last_check_timestamp: chrono::Utc::now().timestamp(),
        }
    }

    pub fn healthy() -> Self {
        Self::with_status(ComponentStatus::Healthy, None)
    }

    pub fn degraded(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Degraded, Some(message.into()))
    }

    pub fn unhealthy(message: impl Into<String>) -> Self {
        Self::with_status(ComponentStatus::Unhealthy, Some(message.into()))
    }

    /// Degraded while requests wait for capacity
    pub fn from_governor(stats: &GovernorStats) -> Self {
        if stats.queued > 0 {
            Self::degraded(format!(
                "{} requests waiting for capacity ({} active)",
                stats.queued, stats.active
            ))
        } else {
            Self::healthy()
        }
    }

    /// Unhealthy without a worker, degraded once records have been dropped
    pub fn from_sink(stats: &SinkStats) -> Self {
        if !stats.running {
            Self::unhealthy("log sink worker is not running")
        } else if stats.dropped > 0 {
            Self::degraded(format!("{} log records dropped", stats.dropped))
        } else {
            Self::healthy()
        }
    }

    /// Degraded while any dependency breaker is open
    pub fn from_breakers(registry: &BreakerRegistry) -> Self {
        let open = registry.open_breakers();
        if open.is_empty() {
            Self::healthy()
        } else {
            Self::degraded(format!("open circuits: {}", open.join(", ")))
        }
    }
}

/// Overall health response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthResponse {
    pub status: ComponentStatus,
    pub components: HashMap<String, ComponentHealth>,
}

impl HealthResponse {
    /// Worst status among components
    pub fn compute_status(components: &HashMap<String, ComponentHealth>) -> ComponentStatus {
        let mut has_degraded = false;

        for health in components.values() {
            match health.status {
                ComponentStatus::Unhealthy => return ComponentStatus::Unhealthy,
                ComponentStatus::Degraded => has_degraded = true,
                ComponentStatus::Healthy => {}
            }
        }

        if has_degraded {
            ComponentStatus::Degraded
        } else {
            ComponentStatus::Healthy
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadinessResponse {
    pub ready: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/// Component names for health tracking
pub mod components {
    pub const GOVERNOR: &str = "governor";
    pub const TUNER: &str = "tuner";
    pub const LOG_SINK: &str = "log_sink";
    pub const BREAKERS: &str = "breakers";
}

/// Shared registry of component health
#[derive(Debug, Clone)]
pub struct HealthRegistry {
    components: Arc<RwLock<HashMap<String, ComponentHealth>>>,
    ready: Arc<RwLock<bool>>,
}

impl Default for HealthRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self {
            components: Arc::new(RwLock::new(HashMap::new())),
            ready: Arc::new(RwLock::new(false)),
        }
    }

    /// Register a component with initial healthy status
    pub async fn register(&self, name: &str) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), ComponentHealth::healthy());
    }

    pub async fn update(&self, name: &str, health: ComponentHealth) {
        let mut components = self.components.write().await;
        components.insert(name.to_string(), health);
    }

    pub async fn set_healthy(&self, name: &str) {
        self.update(name, ComponentHealth::healthy()).await;
    }

    pub async fn set_degraded(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::degraded(message)).await;
    }

    pub async fn set_unhealthy(&self, name: &str, message: impl Into<String>) {
        self.update(name, ComponentHealth::unhealthy(message)).await;
    }

    pub async fn set_ready(&self, ready: bool) {
        let mut r = self.ready.write().await;
        *r = ready;
    }

    pub async fn health(&self) -> HealthResponse {
        let components = self.components.read().await.clone();
        let status = HealthResponse::compute_status(&components);
        HealthResponse { status, components }
    }

    pub async fn readiness(&self) -> ReadinessResponse {
        let ready = *self.ready.read().await;
        let health = self.health().await;

        if !ready {
            ReadinessResponse {
                ready: false,
                reason: Some("Governance layer not yet initialized".to_string()),
            }
        } else if health.status == ComponentStatus::Unhealthy {
            ReadinessResponse {
                ready: false,
                reason: Some("Critical component unhealthy".to_string()),
            }
        } else {
            ReadinessResponse {
                ready: true,
                reason: None,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::governor::{GovernorConfig, ResourceGovernor};
    use crate::models::Priority;
    use crate::resilience::BreakerConfig;
    use std::time::Duration;

    #[tokio::test]
    async fn test_health_registry_initial_state() {
        let registry = HealthRegistry::new();
        let health = registry.health().await;

        assert_eq!(health.status, ComponentStatus::Healthy);
        assert!(health.components.is_empty());
    }

    #[tokio::test]
    async fn test_degraded_component_degrades_overall() {
        let registry = HealthRegistry::new();
        registry.register(components::GOVERNOR).await;
        registry.register(components::TUNER).await;

        registry.set_degraded(components::TUNER, "stale recommendation").await;

        let health = registry.health().await;
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.status.is_operational());
    }

    #[tokio::test]
    async fn test_readiness_not_ready_initially() {
        let registry = HealthRegistry::new();
        let readiness = registry.readiness().await;

        assert!(!readiness.ready);
        assert!(readiness.reason.is_some());
    }

    #[tokio::test]
    async fn test_readiness_not_ready_when_unhealthy() {
        let registry = HealthRegistry::new();
        registry.register(components::LOG_SINK).await;
        registry.set_ready(true).await;
        assert!(registry.readiness().await.ready);

        registry
            .set_unhealthy(components::LOG_SINK, "worker stopped")
            .await;
        assert!(!registry.readiness().await.ready);
    }

    #[tokio::test]
    async fn test_governor_health_reflects_queue() {
        let governor = ResourceGovernor::new(GovernorConfig {
            memory_limit_mb: 100.0,
            ..Default::default()
        });
        assert_eq!(
            ComponentHealth::from_governor(&governor.stats()).status,
            ComponentStatus::Healthy
        );

        let _held = governor
            .reserve("held", 100.0, 0.0, Priority::Normal, Duration::from_secs(1))
            .await
            .unwrap();
        let waiter = {
            let governor = governor.clone();
            tokio::spawn(async move {
                governor
                    .reserve("waiting", 50.0, 0.0, Priority::Normal, Duration::from_secs(5))
                    .await
                    .map(|_| ())
            })
        };
        while governor.stats().queued == 0 {
            tokio::time::sleep(Duration::from_millis(1)).await;
        }

        let health = ComponentHealth::from_governor(&governor.stats());
        assert_eq!(health.status, ComponentStatus::Degraded);
        waiter.abort();
    }

    #[test]
    fn test_sink_health() {
        let stopped = SinkStats::default();
        assert_eq!(
            ComponentHealth::from_sink(&stopped).status,
            ComponentStatus::Unhealthy
        );

        let lossy = SinkStats {
            running: true,
            dropped: 4,
            ..Default::default()
        };
        assert_eq!(
            ComponentHealth::from_sink(&lossy).status,
            ComponentStatus::Degraded
        );
    }

    #[test]
    fn test_breaker_health() {
        let registry = BreakerRegistry::new(BreakerConfig {
            failure_threshold: 1,
            recovery_timeout: Duration::from_secs(60),
        });
        registry.get_or_create("embedder");
        assert_eq!(
            ComponentHealth::from_breakers(&registry).status,
            ComponentStatus::Healthy
        );

        registry.get_or_create("embedder").record_failure();
        let health = ComponentHealth::from_breakers(&registry);
        assert_eq!(health.status, ComponentStatus::Degraded);
        assert!(health.message.unwrap().contains("embedder"));
    }
}
