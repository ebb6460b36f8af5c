//! Optimizers over named parameter maps.
//!
//! State is exposed as an [`OptimizerState`] so it can ride along in a
//! checkpoint and be restored on resume.

pub mod adam;
pub mod sgd;

pub use adam::Adam;
pub use sgd::Sgd;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::checkpoint::OptimizerState;
use crate::collective::{ParamMap, Tensor};
use crate::errors::{Result, TrainerError};

/// Supported optimizer algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OptimizerKind {
    Sgd,
    Adam,
    #[serde(rename = "adamw")]
    AdamW,
}

impl OptimizerKind {
    /// Whether the optimizer keeps per-parameter moment estimates, i.e.
    /// memory proportional to the model size on top of the parameters.
    pub fn tracks_moments(&self) -> bool {
        matches!(self, OptimizerKind::Adam | OptimizerKind::AdamW)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            OptimizerKind::Sgd => "sgd",
            OptimizerKind::Adam => "adam",
            OptimizerKind::AdamW => "adamw",
        }
    }
}

impl fmt::Display for OptimizerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OptimizerKind {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "sgd" => Ok(OptimizerKind::Sgd),
            "adam" => Ok(OptimizerKind::Adam),
            "adamw" => Ok(OptimizerKind::AdamW),
            other => Err(TrainerError::Config(format!(
                "Unknown optimizer '{}', expected one of: sgd, adam, adamw",
                other
            ))),
        }
    }
}

/// A parameter update rule.
pub trait Optimizer: Send {
    fn kind(&self) -> OptimizerKind;

    fn learning_rate(&self) -> f32;

    /// Apply one update. Parameters without a gradient are left untouched;
    /// a gradient for an unknown parameter or with a different element count
    /// is an error.
    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()>;

    /// Snapshot of the internal state.
    fn state(&self) -> OptimizerState;

    /// Restore a snapshot produced by [`Optimizer::state`].
    fn load_state(&mut self, state: &OptimizerState) -> Result<()>;
}

/// Construct the optimizer for `kind` with default hyper-parameters.
pub fn build_optimizer(kind: OptimizerKind, learning_rate: f32) -> Box<dyn Optimizer> {
    match kind {
        OptimizerKind::Sgd => Box::new(Sgd::new(learning_rate)),
        OptimizerKind::Adam => Box::new(Adam::new(learning_rate)),
        OptimizerKind::AdamW => Box::new(Adam::adamw(learning_rate)),
    }
}

/// Look up the parameter a gradient belongs to, checking sizes.
pub(crate) fn param_for<'a>(
    params: &'a mut ParamMap,
    name: &str,
    grad: &Tensor,
) -> Result<&'a mut Tensor> {
    let param = params.get_mut(name).ok_or_else(|| {
        TrainerError::Config(format!("Gradient for unknown parameter '{}'", name))
    })?;

    if param.len() != grad.len() {
        return Err(TrainerError::Config(format!(
            "Gradient for '{}' has {} elements, parameter has {}",
            name,
            grad.len(),
            param.len()
        )));
    }

    Ok(param)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_from_str() {
        assert_eq!("SGD".parse::<OptimizerKind>().unwrap(), OptimizerKind::Sgd);
        assert_eq!("adamw".parse::<OptimizerKind>().unwrap(), OptimizerKind::AdamW);
        assert!("lion".parse::<OptimizerKind>().is_err());
    }

    #[test]
    fn test_kind_serde_names() {
        let json = serde_json::to_string(&OptimizerKind::AdamW).unwrap();
        assert_eq!(json, "\"adamw\"");
        let kind: OptimizerKind = serde_json::from_str("\"adam\"").unwrap();
        assert_eq!(kind, OptimizerKind::Adam);
    }

    #[test]
    fn test_tracks_moments() {
        assert!(!OptimizerKind::Sgd.tracks_moments());
        assert!(OptimizerKind::Adam.tracks_moments());
        assert!(OptimizerKind::AdamW.tracks_moments());
    }

    #[test]
    fn test_build_optimizer() {
        for kind in [OptimizerKind::Sgd, OptimizerKind::Adam, OptimizerKind::AdamW] {
            let optimizer = build_optimizer(kind, 0.01);
            assert_eq!(optimizer.kind(), kind);
            assert_eq!(optimizer.learning_rate(), 0.01);
        }
    }

    #[test]
    fn test_unknown_gradient_rejected() {
        let mut params = ParamMap::new();
        params.insert("w".into(), Tensor::from_vec(vec![1.0]));
        let grad = Tensor::from_vec(vec![1.0]);

        assert!(param_for(&mut params, "missing", &grad).is_err());
        assert!(param_for(&mut params, "w", &Tensor::from_vec(vec![1.0, 2.0])).is_err());
        assert!(param_for(&mut params, "w", &grad).is_ok());
    }
}
