//! Host hardware detection and sizing formulas

use crate::models::WorkloadMode;
use serde::{Deserialize, Serialize};
use std::path::Path;
use sysinfo::{MemoryRefreshKind, RefreshKind, System};
use tracing::debug;

const BYTES_PER_GB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Paths whose presence indicates an NVIDIA accelerator
const ACCELERATOR_PATHS: &[&str] = &["/dev/nvidia0", "/proc/driver/nvidia/version"];

/// Snapshot of host resources
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HardwareProfile {
    pub cpu_count: usize,
    pub total_memory_gb: f64,
    pub available_memory_gb: f64,
    pub has_accelerator: bool,
    /// Detected profiles re-probe available memory on refresh
    #[serde(skip)]
    detected: bool,
}

impl HardwareProfile {
    /// Probe the current host
    pub fn detect() -> Self {
        let sys = probe_memory();
        let cpu_count = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let has_accelerator = ACCELERATOR_PATHS.iter().any(|p| Path::new(p).exists());

        let profile = Self {
            cpu_count,
            total_memory_gb: sys.total_memory() as f64 / BYTES_PER_GB,
            available_memory_gb: sys.available_memory() as f64 / BYTES_PER_GB,
            has_accelerator,
            detected: true,
        };
        debug!(
            cpu_count = profile.cpu_count,
            total_memory_gb = profile.total_memory_gb,
            available_memory_gb = profile.available_memory_gb,
            has_accelerator = profile.has_accelerator,
            "Detected hardware profile"
        );
        profile
    }

    /// Build a profile with explicit values; refreshing leaves it unchanged
    pub fn fixed(
        cpu_count: usize,
        total_memory_gb: f64,
        available_memory_gb: f64,
        has_accelerator: bool,
    ) -> Self {
        Self {
            cpu_count,
            total_memory_gb,
            available_memory_gb,
            has_accelerator,
            detected: false,
        }
    }

    /// Re-read available memory from the host
    pub fn refresh_available_memory(&mut self) {
        if !self.detected {
            return;
        }
        let sys = probe_memory();
        self.available_memory_gb = sys.available_memory() as f64 / BYTES_PER_GB;
    }

    /// 0.0 means no pressure, 1.0 means nothing is available
    pub fn memory_pressure(&self) -> f64 {
        if self.total_memory_gb <= 0.0 {
            return 1.0;
        }
        (1.0 - self.available_memory_gb / self.total_memory_gb).clamp(0.0, 1.0)
    }

    /// Three quarters of the cores, at least one
    pub fn recommended_workers(&self) -> usize {
        ((self.cpu_count as f64 * 0.75).floor() as usize).max(1)
    }

    pub fn recommended_batch_size(&self, mode: WorkloadMode) -> usize {
        let budget_mb = self.available_memory_mb() * 0.1;
        let size = match mode {
            WorkloadMode::BulkIngestion => (budget_mb / 1.0).clamp(100.0, 1000.0),
            WorkloadMode::InteractiveQuery => (budget_mb / 2.0).clamp(10.0, 100.0),
            WorkloadMode::Mixed | WorkloadMode::Idle => (budget_mb / 1.5).clamp(50.0, 500.0),
        };
        size.floor() as usize
    }

    pub fn recommended_cache_size(&self, mode: WorkloadMode) -> usize {
        let budget_mb = self.available_memory_mb() * 0.05;
        let size = match mode {
            WorkloadMode::InteractiveQuery => (budget_mb / 0.1).clamp(100.0, 10000.0),
            WorkloadMode::BulkIngestion => (budget_mb / 0.2).clamp(50.0, 1000.0),
            WorkloadMode::Mixed | WorkloadMode::Idle => (budget_mb / 0.15).clamp(100.0, 5000.0),
        };
        size.floor() as usize
    }

    fn available_memory_mb(&self) -> f64 {
        // Negative or NaN readings count as no memory
        if self.available_memory_gb.is_finite() {
            self.available_memory_gb.max(0.0) * 1024.0
        } else {
            0.0
        }
    }
}

fn probe_memory() -> System {
    let mut sys = System::new_with_specifics(
        RefreshKind::new().with_memory(MemoryRefreshKind::everything()),
    );
    sys.refresh_memory();
    sys
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_detect_reports_host() {
        let profile = HardwareProfile::detect();
        assert!(profile.cpu_count >= 1);
        assert!(profile.total_memory_gb > 0.0);
        assert!((0.0..=1.0).contains(&profile.memory_pressure()));
    }

    #[test]
    fn test_recommended_workers() {
        assert_eq!(HardwareProfile::fixed(8, 16.0, 8.0, false).recommended_workers(), 6);
        assert_eq!(HardwareProfile::fixed(1, 16.0, 8.0, false).recommended_workers(), 1);
        assert_eq!(HardwareProfile::fixed(3, 16.0, 8.0, false).recommended_workers(), 2);
    }

    #[test]
    fn test_batch_size_by_mode() {
        // 4 GB available: memory budget is 409.6 MB
        let profile = HardwareProfile::fixed(4, 8.0, 4.0, false);
        assert_eq!(profile.recommended_batch_size(WorkloadMode::BulkIngestion), 409);
        assert_eq!(profile.recommended_batch_size(WorkloadMode::InteractiveQuery), 100);
        assert_eq!(profile.recommended_batch_size(WorkloadMode::Mixed), 273);
        assert_eq!(profile.recommended_batch_size(WorkloadMode::Idle), 273);
    }

    #[test]
    fn test_batch_size_clamped() {
        let tiny = HardwareProfile::fixed(1, 1.0, 0.1, false);
        assert_eq!(tiny.recommended_batch_size(WorkloadMode::BulkIngestion), 100);
        assert_eq!(tiny.recommended_batch_size(WorkloadMode::InteractiveQuery), 10);

        let huge = HardwareProfile::fixed(64, 512.0, 256.0, false);
        assert_eq!(huge.recommended_batch_size(WorkloadMode::BulkIngestion), 1000);
        assert_eq!(huge.recommended_batch_size(WorkloadMode::Mixed), 500);
    }

    #[test]
    fn test_cache_size_by_mode() {
        // 2 GB available: cache budget is 102.4 MB
        let profile = HardwareProfile::fixed(4, 8.0, 2.0, false);
        assert_eq!(profile.recommended_cache_size(WorkloadMode::InteractiveQuery), 1024);
        assert_eq!(profile.recommended_cache_size(WorkloadMode::BulkIngestion), 512);
        assert_eq!(profile.recommended_cache_size(WorkloadMode::Mixed), 682);
    }

    #[test]
    fn test_fixed_profile_ignores_refresh() {
        let mut profile = HardwareProfile::fixed(2, 4.0, 1.0, true);
        profile.refresh_available_memory();
        assert_eq!(profile.available_memory_gb, 1.0);
        assert!((profile.memory_pressure() - 0.75).abs() < 1e-9);
    }
}
