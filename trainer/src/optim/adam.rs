use std::collections::BTreeMap;

use crate::checkpoint::{OptimizerState, StateValue};
use crate::collective::{ParamMap, Tensor};
use crate::errors::{Result, TrainerError};

use super::{param_for, Optimizer, OptimizerKind};

/// Adam, or AdamW when built with [`Adam::adamw`].
///
/// ```text
/// m_t = b1 * m_{t-1} + (1 - b1) * g
/// v_t = b2 * v_{t-1} + (1 - b2) * g^2
/// p   = p - lr * (m_hat / (sqrt(v_hat) + eps) + wd * p)    (AdamW)
/// ```
///
/// Plain Adam applies no weight decay. Moments are kept per parameter name,
/// the step count is shared.
pub struct Adam {
    pub learning_rate: f32,
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
    /// Decoupled weight decay, only applied by AdamW
    pub weight_decay: f32,
    kind: OptimizerKind,
    step: u64,
    moments: BTreeMap<String, (Vec<f32>, Vec<f32>)>,
}

impl Adam {
    pub fn new(learning_rate: f32) -> Self {
        Self {
            learning_rate,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
            weight_decay: 0.0,
            kind: OptimizerKind::Adam,
            step: 0,
            moments: BTreeMap::new(),
        }
    }

    pub fn adamw(learning_rate: f32) -> Self {
        Self {
            weight_decay: 0.01,
            kind: OptimizerKind::AdamW,
            ..Self::new(learning_rate)
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }

    pub fn steps_taken(&self) -> u64 {
        self.step
    }
}

impl Optimizer for Adam {
    fn kind(&self) -> OptimizerKind {
        self.kind
    }

    fn learning_rate(&self) -> f32 {
        self.learning_rate
    }

    fn step(&mut self, params: &mut ParamMap, grads: &ParamMap) -> Result<()> {
        self.step += 1;

        let (lr, b1, b2, eps) = (self.learning_rate, self.beta1, self.beta2, self.epsilon);
        let lambda = if self.kind == OptimizerKind::AdamW {
            self.weight_decay
        } else {
            0.0
        };

        let t = self.step.min(i32::MAX as u64) as i32;
        let bias_correction1 = 1.0 - b1.powi(t);
        let bias_correction2 = 1.0 - b2.powi(t);

        for (name, grad) in grads {
            let param = param_for(params, name, grad)?;
            let size = param.len();

            let (m, v) = self
                .moments
                .entry(name.clone())
                .or_insert_with(|| (vec![0.0; size], vec![0.0; size]));

            if m.len() != size || v.len() != size {
                return Err(TrainerError::Checkpoint(format!(
                    "Optimizer moments for '{}' have {} elements, parameter has {}",
                    name,
                    m.len(),
                    size
                )));
            }

            for (((p, g), m), v) in param
                .data
                .iter_mut()
                .zip(&grad.data)
                .zip(m.iter_mut())
                .zip(v.iter_mut())
            {
                *m = b1 * *m + (1.0 - b1) * g;
                *v = b2 * *v + (1.0 - b2) * g * g;

                let m_hat = *m / bias_correction1;
                let v_hat = *v / bias_correction2;

                *p -= lr * (m_hat / (v_hat.sqrt() + eps) + lambda * *p);
            }
        }

        Ok(())
    }

    fn state(&self) -> OptimizerState {
        let mut state = OptimizerState::new();
        state.insert("step".into(), StateValue::Scalar(self.step as f64));
        state.insert(
            "learning_rate".into(),
            StateValue::Scalar(self.learning_rate as f64),
        );

        for (name, (m, v)) in &self.moments {
            state.insert(format!("m.{}", name), StateValue::Tensor(Tensor::from_vec(m.clone())));
            state.insert(format!("v.{}", name), StateValue::Tensor(Tensor::from_vec(v.clone())));
        }

        state
    }

    fn load_state(&mut self, state: &OptimizerState) -> Result<()> {
        let mut moments = BTreeMap::new();
        let mut step = 0;

        for (key, value) in state {
            match (key.as_str(), value) {
                ("step", StateValue::Scalar(s)) => step = *s as u64,
                ("learning_rate", StateValue::Scalar(lr)) => self.learning_rate = *lr as f32,
                (key, StateValue::Tensor(m)) if key.starts_with("m.") => {
                    let name = &key[2..];
                    let v = match state.get(&format!("v.{}", name)) {
                        Some(StateValue::Tensor(v)) if v.len() == m.len() => v.data.clone(),
                        _ => {
                            return Err(TrainerError::Checkpoint(format!(
                                "Optimizer state for '{}' has no matching second moment",
                                name
                            )))
                        }
                    };
                    moments.insert(name.to_string(), (m.data.clone(), v));
                }
                _ => {}
            }
        }

        self.step = step;
        self.moments = moments;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn single(value: f32) -> ParamMap {
        let mut map = ParamMap::new();
        map.insert("w".into(), Tensor::from_vec(vec![value]));
        map
    }

    #[test]
    fn test_adamw_new() {
        let adam = Adam::adamw(0.001);
        assert_eq!(adam.learning_rate, 0.001);
        assert_eq!(adam.beta1, 0.9);
        assert_eq!(adam.weight_decay, 0.01);
        assert_eq!(adam.kind(), OptimizerKind::AdamW);
    }

    #[test]
    fn test_adam_first_step() {
        let mut adam = Adam::new(0.1);
        let mut params = single(1.0);

        adam.step(&mut params, &single(0.1)).unwrap();

        // m_hat = 0.1, v_hat = 0.01 => p = 1.0 - 0.1 * (0.1 / 0.1) = 0.9
        let p = params["w"].data[0];
        assert!((p - 0.9).abs() < 1e-5, "Step 1 failed: p={}", p);
    }

    #[test]
    fn test_adamw_decays_weights() {
        let mut adam = Adam::adamw(0.1).with_weight_decay(0.5);
        let mut params = single(1.0);

        // Zero gradient: only the decay term moves the parameter
        adam.step(&mut params, &single(0.0)).unwrap();
        assert!((params["w"].data[0] - 0.95).abs() < 1e-6);
    }

    #[test]
    fn test_state_roundtrip_continues_identically() {
        let mut a = Adam::new(0.05);
        let mut params_a = single(2.0);
        a.step(&mut params_a, &single(0.3)).unwrap();

        let mut b = Adam::new(0.05);
        b.load_state(&a.state()).unwrap();
        assert_eq!(b.steps_taken(), 1);

        let mut params_b = params_a.clone();
        a.step(&mut params_a, &single(-0.2)).unwrap();
        b.step(&mut params_b, &single(-0.2)).unwrap();
        assert_eq!(params_a, params_b);
    }

    #[test]
    fn test_load_state_rejects_missing_second_moment() {
        let mut state = OptimizerState::new();
        state.insert("m.w".into(), StateValue::Tensor(Tensor::from_vec(vec![0.1])));

        let mut adam = Adam::new(0.1);
        assert!(adam.load_state(&state).is_err());
    }
}
