//! Agent configuration

use anyhow::{Context, Result};
use governance_lib::{
    logging::{AdaptiveSamplerConfig, SinkConfig},
    resilience::BreakerConfig,
    tuning::{HardwareProfile, ProfilerConfig, TunerConfig},
    GovernorConfig,
};
use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

/// Environment variable naming an optional configuration file
pub const CONFIG_FILE_ENV: &str = "GOVERNOR_CONFIG_FILE";

/// Agent configuration
///
/// Every section falls back to its defaults when absent.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AgentConfig {
    /// Name reported in startup logs
    pub service_name: String,

    /// API server port for health, stats and metrics
    pub api_port: u16,

    /// Derive governor limits from the detected hardware
    pub limits_from_hardware: bool,

    /// Seconds between component health refreshes
    pub health_interval_secs: u64,

    /// Optional JSON lines file receiving sink records
    pub log_file: Option<PathBuf>,

    pub governor: GovernorConfig,
    pub breakers: BreakerConfig,
    pub profiler: ProfilerConfig,
    pub tuner: TunerConfig,
    pub sink: SinkConfig,
    pub sampler: AdaptiveSamplerConfig,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            service_name: "governance-agent".to_string(),
            api_port: 8080,
            limits_from_hardware: false,
            health_interval_secs: 5,
            log_file: None,
            governor: GovernorConfig::default(),
            breakers: BreakerConfig::default(),
            profiler: ProfilerConfig::default(),
            tuner: TunerConfig::default(),
            sink: SinkConfig::default(),
            sampler: AdaptiveSamplerConfig::default(),
        }
    }
}

impl AgentConfig {
    /// Load configuration from the optional config file and environment
    ///
    /// Environment variables use the `GOVERNOR_` prefix and `__` between
    /// nested keys, e.g. `GOVERNOR_GOVERNOR__MEMORY_LIMIT_MB=2048`.
    pub fn load() -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Ok(path) = std::env::var(CONFIG_FILE_ENV) {
            builder = builder.add_source(config::File::with_name(&path));
        }
        let settings = builder
            .add_source(
                config::Environment::with_prefix("GOVERNOR")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("failed to read agent configuration")?;

        Self::from_settings(settings)
    }

    pub fn from_settings(settings: config::Config) -> Result<Self> {
        settings
            .try_deserialize()
            .context("invalid agent configuration")
    }

    /// Governor limits, optionally derived from the host
    pub fn governor_config(&self, hardware: &HardwareProfile) -> GovernorConfig {
        if self.limits_from_hardware {
            GovernorConfig {
                default_timeout: self.governor.default_timeout,
                ..GovernorConfig::for_hardware(hardware)
            }
        } else {
            self.governor.clone()
        }
    }

    pub fn health_interval(&self) -> Duration {
        Duration::from_secs(self.health_interval_secs.max(1))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use config::{File, FileFormat};

    #[test]
    fn test_defaults_when_empty() {
        let settings = config::Config::builder().build().unwrap();
        let config = AgentConfig::from_settings(settings).unwrap();

        assert_eq!(config.api_port, 8080);
        assert_eq!(config.governor.max_concurrent, 10);
        assert_eq!(config.tuner.interval, Duration::from_secs(30));
        assert!(config.log_file.is_none());
    }

    #[test]
    fn test_nested_sections_override_defaults() {
        let json = r#"{
            "api_port": 9100,
            "governor": { "memory_limit_mb": 2048.0, "default_timeout": 1500 },
            "breakers": { "failure_threshold": 3 }
        }"#;
        let settings = config::Config::builder()
            .add_source(File::from_str(json, FileFormat::Json))
            .build()
            .unwrap();
        let config = AgentConfig::from_settings(settings).unwrap();

        assert_eq!(config.api_port, 9100);
        assert_eq!(config.governor.memory_limit_mb, 2048.0);
        assert_eq!(config.governor.default_timeout, Duration::from_millis(1500));
        assert_eq!(config.governor.cpu_limit_percent, 80.0);
        assert_eq!(config.breakers.failure_threshold, 3);
    }

    #[test]
    fn test_limits_from_hardware() {
        let hardware = HardwareProfile::fixed(4, 10.0, 5.0, false);
        let config = AgentConfig {
            limits_from_hardware: true,
            ..Default::default()
        };

        let governor = config.governor_config(&hardware);
        assert_eq!(governor.max_concurrent, 8);
        assert_eq!(governor.memory_limit_mb, 10.0 * 1024.0 * 0.8);
        assert_eq!(governor.default_timeout, Duration::from_secs(30));
    }
}
