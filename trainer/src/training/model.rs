use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::collective::{ParamMap, Tensor};
use crate::errors::{Result, TrainerError};

use super::data::Batch;

/// A trainable model over named parameters.
pub trait Model: Send {
    fn parameters(&self) -> ParamMap;

    /// Replace the parameters; names and element counts must match.
    fn load_parameters(&mut self, params: ParamMap) -> Result<()>;

    /// Mean loss over the batch and the gradient of every parameter.
    fn loss_and_grads(&mut self, batch: &Batch) -> Result<(f32, ParamMap)>;

    fn num_parameters(&self) -> u64 {
        self.parameters().values().map(|t| t.len() as u64).sum()
    }
}

/// Model families known to the trainer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelKind {
    Custom,
    Llm,
    Vision,
}

/// Options passed to a model builder
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelOptions {
    pub input_size: usize,
    pub output_size: usize,
}

type ModelBuilder = fn(&ModelOptions) -> Box<dyn Model>;

/// Entry in the model table
pub struct ModelSpec {
    pub kind: ModelKind,
    pub name: &'static str,
    pub description: &'static str,
    /// `None` when the family has no built-in implementation and the caller
    /// must supply its own [`Model`]
    builder: Option<ModelBuilder>,
}

impl ModelSpec {
    pub fn has_builtin(&self) -> bool {
        self.builder.is_some()
    }
}

static MODEL_TABLE: [ModelSpec; 3] = [
    ModelSpec {
        kind: ModelKind::Custom,
        name: "custom",
        description: "Single linear layer with mean squared error loss",
        builder: Some(build_linear),
    },
    ModelSpec {
        kind: ModelKind::Llm,
        name: "llm",
        description: "Language model supplied by the caller",
        builder: None,
    },
    ModelSpec {
        kind: ModelKind::Vision,
        name: "vision",
        description: "Vision model supplied by the caller",
        builder: None,
    },
];

fn build_linear(options: &ModelOptions) -> Box<dyn Model> {
    Box::new(LinearModel::new(options.input_size, options.output_size))
}

impl ModelKind {
    pub fn all() -> &'static [ModelSpec] {
        &MODEL_TABLE
    }

    pub fn spec(&self) -> &'static ModelSpec {
        // Table order follows the enum
        &MODEL_TABLE[*self as usize]
    }

    pub fn as_str(&self) -> &'static str {
        self.spec().name
    }

    /// Instantiate the built-in model for this family.
    pub fn build(&self, options: &ModelOptions) -> Result<Box<dyn Model>> {
        if options.input_size == 0 || options.output_size == 0 {
            return Err(TrainerError::Config(format!(
                "Model dimensions must be non-zero, got {:?}",
                options
            )));
        }
        match self.spec().builder {
            Some(build) => Ok(build(options)),
            None => Err(TrainerError::Config(format!(
                "No built-in '{}' model, supply a Model implementation",
                self
            ))),
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ModelKind {
    type Err = TrainerError;

    fn from_str(s: &str) -> Result<Self> {
        let wanted = s.to_lowercase();
        MODEL_TABLE
            .iter()
            .find(|spec| spec.name == wanted)
            .map(|spec| spec.kind)
            .ok_or_else(|| {
                let names: Vec<&str> = MODEL_TABLE.iter().map(|spec| spec.name).collect();
                TrainerError::Config(format!(
                    "Unknown model type '{}', expected one of: {}",
                    s,
                    names.join(", ")
                ))
            })
    }
}

/// `y = x W^T + b`, trained against mean squared error.
#[derive(Debug, Clone)]
pub struct LinearModel {
    input_size: usize,
    output_size: usize,
    params: ParamMap,
}

impl LinearModel {
    pub const WEIGHT: &'static str = "linear.weight";
    pub const BIAS: &'static str = "linear.bias";

    /// Deterministic small initial weights, zero bias.
    pub fn new(input_size: usize, output_size: usize) -> Self {
        let weight = (0..input_size * output_size)
            .map(|i| (i % 5) as f32 * 0.02 - 0.04)
            .collect();

        let mut params = ParamMap::new();
        params.insert(
            Self::WEIGHT.into(),
            Tensor::new(weight, vec![output_size, input_size]),
        );
        params.insert(Self::BIAS.into(), Tensor::zeros(vec![output_size]));

        Self {
            input_size,
            output_size,
            params,
        }
    }

    fn weight(&self) -> Result<&Tensor> {
        self.param(Self::WEIGHT)
    }

    fn bias(&self) -> Result<&Tensor> {
        self.param(Self::BIAS)
    }

    fn param(&self, name: &str) -> Result<&Tensor> {
        self.params
            .get(name)
            .ok_or_else(|| TrainerError::Config(format!("Missing parameter '{}'", name)))
    }
}

impl Model for LinearModel {
    fn parameters(&self) -> ParamMap {
        self.params.clone()
    }

    fn load_parameters(&mut self, params: ParamMap) -> Result<()> {
        for (name, current) in &self.params {
            match params.get(name) {
                Some(t) if t.len() == current.len() => {}
                Some(t) => {
                    return Err(TrainerError::Config(format!(
                        "Parameter '{}' has {} elements, expected {}",
                        name,
                        t.len(),
                        current.len()
                    )))
                }
                None => {
                    return Err(TrainerError::Config(format!(
                        "Parameter '{}' missing from loaded state",
                        name
                    )))
                }
            }
        }
        if params.len() != self.params.len() {
            return Err(TrainerError::Config(format!(
                "Loaded state has {} parameters, model has {}",
                params.len(),
                self.params.len()
            )));
        }
        self.params = params;
        Ok(())
    }

    fn loss_and_grads(&mut self, batch: &Batch) -> Result<(f32, ParamMap)> {
        let (n_in, n_out) = (self.input_size, self.output_size);
        let samples = batch.samples();

        if batch.inputs.len() != samples * n_in || batch.labels.len() != samples * n_out {
            return Err(TrainerError::Config(format!(
                "Batch shapes {:?} -> {:?} do not fit a {}x{} linear layer",
                batch.inputs.shape, batch.labels.shape, n_in, n_out
            )));
        }

        let weight = &self.weight()?.data;
        let bias = &self.bias()?.data;
        let mut grad_w = vec![0.0f32; n_out * n_in];
        let mut grad_b = vec![0.0f32; n_out];
        let mut loss = 0.0f64;
        let count = (samples * n_out).max(1) as f32;

        for s in 0..samples {
            let x = &batch.inputs.data[s * n_in..(s + 1) * n_in];
            let target = &batch.labels.data[s * n_out..(s + 1) * n_out];

            for o in 0..n_out {
                let row = &weight[o * n_in..(o + 1) * n_in];
                let y: f32 = row.iter().zip(x).map(|(w, x)| w * x).sum::<f32>() + bias[o];
                let diff = y - target[o];
                loss += (diff * diff) as f64;

                let dy = 2.0 * diff / count;
                grad_b[o] += dy;
                for (g, xi) in grad_w[o * n_in..(o + 1) * n_in].iter_mut().zip(x) {
                    *g += dy * xi;
                }
            }
        }

        let mut grads = ParamMap::new();
        grads.insert(Self::WEIGHT.into(), Tensor::new(grad_w, vec![n_out, n_in]));
        grads.insert(Self::BIAS.into(), Tensor::new(grad_b, vec![n_out]));

        Ok(((loss / count as f64) as f32, grads))
    }
}
