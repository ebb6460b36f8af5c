use crate::checkpoint::{OptimizerState, StateValue};
use crate::collective::ParamMap;
use crate::errors::Result;

use super::{param_for, Optimizer, OptimizerKind};

/// Stochastic Gradient Descent (SGD) optimizer.
///
/// Updates parameters using the rule:
/// `param = param - learning_rate * grad`
pub struct Sgd {
    pub learning_rate: f32,
}

impl Sgd {
    pub fn new(learning_rate: f32) -> Self {
        Self { learning_rate }
    }
}

impl Optimizer for Sgd {
    fn kind(&self) -> OptimizerKind {
        OptimizerKind::Sgd
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()> {
        let lr = self.learning_rate;

        for (name, grad) in grads {
            let param = param_for(params, name, grad)?;
            param
                .data
                .iter_mut()
                .zip(&grad.data)
                .for_each(|(p, g)| *p -= lr * g);
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new();
        state.insert(
            "learning_rate".into(),
            StateValue::Scalar(self.learning_rate as f64),
        );
        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        if let Some(StateValue::Scalar(lr)) = state.get("learning_rate") {
            self.learning_rate = *lr as f32;
        }
        Ok(())
    }
}
