//! Memory estimates and batch-size suggestions.
//!
//! Everything here is a pure function of its inputs.

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::errors::{Result, TrainerError};
use crate::training::TrainingConfig;

const BYTES_PER_PARAM: f64 = 4.0;
const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// Above this per-device footprint activations are recomputed instead of stored
pub const ACTIVATION_CHECKPOINT_THRESHOLD_GB: f64 = 8.0;

/// Fraction of the memory limit a batch may use
const BATCH_MEMORY_FRACTION: f64 = 0.8;

/// Activation bytes per sample, relative to the parameter count
const BYTES_PER_SAMPLE_FACTOR: f64 = 1.5;

/// Suggested training settings for a model on a cluster
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MemoryBudget {
    /// Estimated per-device footprint in GB (2^30 bytes)
    pub estimated_memory_gb: f64,
    pub suggested_batch_size: usize,
    pub activation_checkpointing: bool,
    pub gradient_accumulation: usize,
}

/// Estimate the per-device footprint of a model with `model_size` parameters.
///
/// Parameters take 4 bytes each, optimizer state twice that and activations
/// half of it; the total is split evenly across `num_devices`.
pub fn suggest_config(model_size: u64, num_devices: usize) -> Result<MemoryBudget> {
    if model_size == 0 {
        return Err(TrainerError::Config("model_size must be at least 1".into()));
    }
    if num_devices == 0 {
        return Err(TrainerError::Config("num_devices must be at least 1".into()));
    }

    let param_memory = model_size as f64 * BYTES_PER_PARAM;
    let optimizer_memory = 2.0 * param_memory;
    let activation_memory = 0.5 * param_memory;
    let total = (param_memory + optimizer_memory + activation_memory) / num_devices as f64;

    let budget = budget_for_memory(total / BYTES_PER_GB);
    debug!(
        model_size,
        num_devices,
        memory_gb = budget.estimated_memory_gb,
        batch_size = budget.suggested_batch_size,
        "Memory budget estimated"
    );
    Ok(budget)
}

/// Settings for a known per-device footprint in GB.
pub fn budget_for_memory(memory_gb: f64) -> MemoryBudget {
    // Float to int casts saturate, so a tiny footprint caps at usize::MAX
    let suggested_batch_size = ((32.0 / memory_gb).floor() as usize).max(1);
    let gradient_accumulation = ((memory_gb / 4.0).floor() as usize).max(1);

    MemoryBudget {
        estimated_memory_gb: memory_gb,
        suggested_batch_size,
        activation_checkpointing: memory_gb > ACTIVATION_CHECKPOINT_THRESHOLD_GB,
        gradient_accumulation,
    }
}

/// Largest batch that fits in 80% of `memory_limit_bytes`, at least 1.
pub fn optimize_batch_size(model_size: u64, memory_limit_bytes: u64) -> Result<usize> {
    if model_size == 0 {
        return Err(TrainerError::Config("model_size must be at least 1".into()));
    }

    let available = memory_limit_bytes as f64 * BATCH_MEMORY_FRACTION;
    let per_sample = model_size as f64 * BYTES_PER_SAMPLE_FACTOR;

    Ok(((available / per_sample).floor() as usize).max(1))
}

/// A lower-memory variant of `current` to retry with after running out of memory.
///
/// Halves the batch size, turns on gradient checkpointing and, for optimizers
/// that keep per-parameter moments, stops carrying optimizer state.
pub fn suggest_recovery_config(current: &TrainingConfig) -> TrainingConfig {
    let mut config = current.clone();
    config.batch_size = (current.batch_size / 2).max(1);
    config.gradient_checkpointing = true;
    if current.optimizer.tracks_moments() {
        config.optimizer_no_state = true;
    }
    config
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::optim::OptimizerKind;

    #[test]
    fn test_suggest_config_small_model() {
        // 1M params: 14 MB total
        let budget = suggest_config(1_000_000, 1).unwrap();
        assert!((budget.estimated_memory_gb - 14_000_000.0 / BYTES_PER_GB).abs() < 1e-12);
        assert!(!budget.activation_checkpointing);
        assert_eq!(budget.gradient_accumulation, 1);
        assert!(budget.suggested_batch_size > 32);
    }

    #[test]
    fn test_activation_checkpointing_boundary() {
        assert!(!budget_for_memory(8.0).activation_checkpointing);
        assert!(budget_for_memory(8.0 + 1e-9).activation_checkpointing);

        // 14 bytes per parameter: 613566756 params land just under 8 GB
        assert!(!suggest_config(613_566_756, 1).unwrap().activation_checkpointing);
        assert!(suggest_config(613_566_757, 1).unwrap().activation_checkpointing);
    }

    #[test]
    fn test_budget_formulas() {
        let budget = budget_for_memory(10.0);
        assert_eq!(budget.suggested_batch_size, 3);
        assert_eq!(budget.gradient_accumulation, 2);

        let budget = budget_for_memory(64.0);
        assert_eq!(budget.suggested_batch_size, 1);
        assert_eq!(budget.gradient_accumulation, 16);
    }

    #[test]
    fn test_devices_split_memory() {
        let one = suggest_config(7_000_000_000, 1).unwrap();
        let four = suggest_config(7_000_000_000, 4).unwrap();
        assert!((one.estimated_memory_gb / 4.0 - four.estimated_memory_gb).abs() < 1e-9);
    }

    #[test]
    fn test_zero_inputs_rejected() {
        assert!(matches!(suggest_config(1000, 0), Err(TrainerError::Config(_))));
        assert!(matches!(suggest_config(0, 2), Err(TrainerError::Config(_))));
        assert!(optimize_batch_size(0, 1 << 30).is_err());
    }

    #[test]
    fn test_optimize_batch_size() {
        // 0.8 * 1600 / (1.5 * 100) = 8.53
        assert_eq!(optimize_batch_size(100, 1600).unwrap(), 8);
        assert_eq!(optimize_batch_size(1_000_000_000, 1024).unwrap(), 1);
    }

    #[test]
    fn test_optimize_batch_size_monotone() {
        let mut previous = 0;
        for limit in (0..50).map(|i| i * 250_000_000u64) {
            let batch = optimize_batch_size(10_000_000, limit).unwrap();
            assert!(batch >= 1);
            assert!(batch >= previous);
            previous = batch;
        }
    }

    #[test]
    fn test_recovery_config() {
        let mut config = TrainingConfig::default();
        config.batch_size = 33;
        config.optimizer = OptimizerKind::AdamW;

        let recovery = suggest_recovery_config(&config);
        assert_eq!(recovery.batch_size, 16);
        assert!(recovery.gradient_checkpointing);
        assert!(recovery.optimizer_no_state);
        assert_eq!(recovery.learning_rate, config.learning_rate);
    }

    #[test]
    fn test_recovery_config_floor_and_sgd() {
        let mut config = TrainingConfig::default();
        config.batch_size = 1;
        config.optimizer = OptimizerKind::Sgd;

        let recovery = suggest_recovery_config(&config);
        assert_eq!(recovery.batch_size, 1);
        assert!(!recovery.optimizer_no_state);
    }
}
