use serde::{Deserialize, Serialize};

use crate::errors::{Result, TrainerError};
use crate::optim::OptimizerKind;

use super::model::ModelKind;

/// Gradient norms below this are reported as vanishing
pub const DEFAULT_GRAD_NORM_EPSILON: f64 = 1e-7;

/// Hyper-parameters and run policy for one training job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainingConfig {
    pub model: ModelKind,

    /// Last epoch to run (epochs are 1-based)
    pub epochs: u64,

    pub batch_size: usize,

    pub learning_rate: f32,

    pub optimizer: OptimizerKind,

    /// Save a checkpoint every N epochs; the final epoch is always saved
    pub checkpoint_interval: u64,

    /// Recompute activations in the backward pass instead of storing them
    pub gradient_checkpointing: bool,

    /// Neither persist nor restore optimizer state
    pub optimizer_no_state: bool,

    pub grad_norm_epsilon: f64,

    /// Stop the run at the first epoch with a NaN loss
    pub abort_on_nan: bool,
}

impl Default for TrainingConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::Custom,
            epochs: 10,
            batch_size: 32,
            learning_rate: 1e-3,
            optimizer: OptimizerKind::AdamW,
            checkpoint_interval: 1,
            gradient_checkpointing: false,
            optimizer_no_state: false,
            grad_norm_epsilon: DEFAULT_GRAD_NORM_EPSILON,
            abort_on_nan: true,
        }
    }
}

impl TrainingConfig {
    pub fn validate(&self) -> Result<()> {
        if self.epochs == 0 {
            return Err(TrainerError::Config("training.epochs must be at least 1".into()));
        }
        if self.batch_size == 0 {
            return Err(TrainerError::Config(
                "training.batch_size must be at least 1".into(),
            ));
        }
        if self.checkpoint_interval == 0 {
            return Err(TrainerError::Config(
                "training.checkpoint_interval must be at least 1".into(),
            ));
        }
        if !(self.learning_rate.is_finite() && self.learning_rate > 0.0) {
            return Err(TrainerError::Config(format!(
                "training.learning_rate must be positive, got {}",
                self.learning_rate
            )));
        }
        if !self.grad_norm_epsilon.is_finite() || self.grad_norm_epsilon < 0.0 {
            return Err(TrainerError::Config(
                "training.grad_norm_epsilon must be non-negative".into(),
            ));
        }
        Ok(())
    }
}
