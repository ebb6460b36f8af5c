use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::errors::{Result, TrainerError};

/// Named tensors (parameters or gradients).
///
/// A `BTreeMap` so every rank walks the keys in the same order.
pub type ParamMap = BTreeMap<String, Tensor>;

/// Dense f32 tensor used for gradients and model parameters.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Tensor {
    /// Flattened tensor data
    pub data: Vec<f32>,
    /// Shape of the tensor (e.g., [100] for 1D, [10, 10] for 2D)
    pub shape: Vec<usize>,
}

impl Tensor {
    /// Create a new tensor with the given data and shape
    ///
    /// # Panics
    /// Panics if the data length doesn't match the product of the shape dimensions.
    pub fn new(data: Vec<f32>, shape: Vec<usize>) -> Self {
        let expected_len: usize = shape.iter().product();
        assert_eq!(
            data.len(),
            expected_len,
            "Data length {} doesn't match shape product {}",
            data.len(),
            expected_len
        );
        Self { data, shape }
    }

    /// Fallible constructor for data that arrived from outside the process.
    pub fn try_new(data: Vec<f32>, shape: Vec<usize>) -> Result<Self> {
        let expected_len: usize = shape.iter().product();
        if data.len() != expected_len {
            return Err(TrainerError::Collective(format!(
                "Data length {} doesn't match shape {:?}",
                data.len(),
                shape
            )));
        }
        Ok(Self { data, shape })
    }

    /// One-dimensional tensor over `data`.
    pub fn from_vec(data: Vec<f32>) -> Self {
        let len = data.len();
        Self {
            data,
            shape: vec![len],
        }
    }

    pub fn zeros(shape: Vec<usize>) -> Self {
        Self::filled(shape, 0.0)
    }

    pub fn filled(shape: Vec<usize>, value: f32) -> Self {
        let len: usize = shape.iter().product();
        Self {
            data: vec![value; len],
            shape,
        }
    }

    /// Split the flattened data into exactly `n` contiguous chunks.
    ///
    /// Chunk sizes differ by at most one; when the tensor has fewer than `n`
    /// elements the trailing chunks are empty.
    pub fn chunk(&self, n: usize) -> Vec<Tensor> {
        assert!(n > 0, "Number of chunks must be positive");

        let len = self.data.len();
        (0..n)
            .map(|i| {
                let start = i * len / n;
                let end = (i + 1) * len / n;
                Tensor::from_vec(self.data[start..end].to_vec())
            })
            .collect()
    }

    /// Element-wise addition of two tensors
    pub fn add(&self, other: &Tensor) -> Result<Tensor> {
        if self.data.len() != other.data.len() {
            return Err(TrainerError::Collective(format!(
                "Tensor size mismatch: {} vs {}",
                self.data.len(),
                other.data.len()
            )));
        }

        let data = self
            .data
            .iter()
            .zip(&other.data)
            .map(|(a, b)| a + b)
            .collect();

        Ok(Tensor {
            data,
            shape: self.shape.clone(),
        })
    }

    /// Multiply every element by `factor` in place.
    pub fn scale(&mut self, factor: f32) {
        self.data.iter_mut().for_each(|x| *x *= factor);
    }

    /// Concatenate chunks back into a flat tensor
    pub fn concat(tensors: Vec<Tensor>) -> Tensor {
        let data: Vec<f32> = tensors.into_iter().flat_map(|t| t.data).collect();
        Tensor::from_vec(data)
    }

    /// Same data, new shape. Fails if the element count differs.
    pub fn reshape(self, shape: Vec<usize>) -> Result<Tensor> {
        Tensor::try_new(self.data, shape)
    }

    pub fn squared_norm(&self) -> f64 {
        self.data.iter().map(|&x| (x as f64) * (x as f64)).sum()
    }

    pub fn is_finite(&self) -> bool {
        self.data.iter().all(|x| x.is_finite())
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Global L2 norm across every tensor in the map.
pub fn global_norm(tensors: &ParamMap) -> f64 {
    tensors.values().map(Tensor::squared_norm).sum::<f64>().sqrt()
}
