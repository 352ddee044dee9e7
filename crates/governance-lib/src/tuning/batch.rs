//! Multiplicative batch size adjustment

use serde::{Deserialize, Serialize};

/// Compute the next batch size after a batch finished
///
/// Success grows the batch by `increase_factor` up to `max_size`; failure
/// shrinks it by `decrease_factor` down to `min_size`. Results are rounded
/// to the nearest integer.
pub fn next_batch_size(
    current: usize,
    success: bool,
    min_size: usize,
    max_size: usize,
    increase_factor: f64,
    decrease_factor: f64,
) -> usize {
    if success {
        let grown = (current as f64 * increase_factor).round();
        (grown.max(0.0) as usize).min(max_size)
    } else {
        let shrunk = (current as f64 * decrease_factor).round();
        (shrunk.max(0.0) as usize).max(min_size)
    }
}

/// Bounds and factors for [`AdaptiveBatchSizeController`]
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchSizeConfig {
    pub initial_size: usize,
    pub min_size: usize,
    pub max_size: usize,
    pub increase_factor: f64,
    pub decrease_factor: f64,
}

impl Default for BatchSizeConfig {
    fn default() -> Self {
        Self {
            initial_size: 100,
            min_size: 10,
            max_size: 1000,
            increase_factor: 1.5,
            decrease_factor: 0.5,
        }
    }
}

/// Tracks a batch size across successive batches
#[derive(Debug, Clone)]
pub struct AdaptiveBatchSizeController {
    config: BatchSizeConfig,
    current: usize,
}

impl AdaptiveBatchSizeController {
    /// Inverted bounds are normalised so `max_size` is never below `min_size`
    pub fn new(mut config: BatchSizeConfig) -> Self {
        config.max_size = config.max_size.max(config.min_size);
        let current = config.initial_size.clamp(config.min_size, config.max_size);
        Self { config, current }
    }

    pub fn config(&self) -> &BatchSizeConfig {
        &self.config
    }

    pub fn current(&self) -> usize {
        self.current
    }

    /// Record the outcome of a batch and return the size for the next one
    pub fn record(&mut self, success: bool) -> usize {
        self.current = next_batch_size(
            self.current,
            success,
            self.config.min_size,
            self.config.max_size,
            self.config.increase_factor,
            self.config.decrease_factor,
        );
        self.current
    }

    /// Restart from a recommended size, kept within bounds
    pub fn reset_to(&mut self, size: usize) {
        self.current = size.clamp(self.config.min_size, self.config.max_size);
    }
}

impl Default for AdaptiveBatchSizeController {
    fn default() -> Self {
        Self::new(BatchSizeConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_success_grows_batch() {
        assert_eq!(next_batch_size(100, true, 10, 1000, 1.5, 0.5), 150);
    }

    #[test]
    fn test_failure_shrinks_batch() {
        assert_eq!(next_batch_size(100, false, 10, 1000, 1.5, 0.5), 50);
    }

    #[test]
    fn test_bounds_are_respected() {
        assert_eq!(next_batch_size(900, true, 10, 1000, 1.5, 0.5), 1000);
        assert_eq!(next_batch_size(15, false, 10, 1000, 1.5, 0.5), 10);
    }

    #[test]
    fn test_rounds_to_nearest() {
        // 3 * 1.5 = 4.5 rounds away from zero
        assert_eq!(next_batch_size(3, true, 1, 100, 1.5, 0.5), 5);
        assert_eq!(next_batch_size(5, false, 1, 100, 1.5, 0.5), 3);
    }

    #[test]
    fn test_repeated_success_converges_to_max() {
        let mut controller = AdaptiveBatchSizeController::new(BatchSizeConfig {
            initial_size: 900,
            ..Default::default()
        });
        for _ in 0..5 {
            controller.record(true);
        }
        assert_eq!(controller.current(), 1000);
    }

    #[test]
    fn test_repeated_failure_converges_to_min() {
        let mut controller = AdaptiveBatchSizeController::default();
        for _ in 0..10 {
            controller.record(false);
        }
        assert_eq!(controller.current(), 10);

        controller.reset_to(5000);
        assert_eq!(controller.current(), 1000);
    }

    #[test]
    fn test_inverted_bounds_are_normalised() {
        let mut controller = AdaptiveBatchSizeController::new(BatchSizeConfig {
            initial_size: 100,
            min_size: 500,
            max_size: 50,
            ..Default::default()
        });
        assert_eq!(controller.config().max_size, 500);
        assert_eq!(controller.current(), 500);

        assert_eq!(controller.record(true), 500);
        assert_eq!(controller.record(false), 500);
        controller.reset_to(1);
        assert_eq!(controller.current(), 500);
    }
}
