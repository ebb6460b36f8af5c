//! Group-wise affine weight quantization.
//!
//! Each group of [`GROUP_SIZE`] consecutive values gets its own scale and
//! bias (the group minimum). Codes are packed little-endian into `u32` words.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use tracing::debug;

use crate::collective::{ParamMap, Tensor};
use crate::errors::{Result, TrainerError};

pub const GROUP_SIZE: usize = 64;

/// Parameter names containing any of these are kept in full precision
pub const FULL_PRECISION_MARKERS: [&str; 2] = ["bias", "norm"];

/// A tensor stored as `bits`-wide integer codes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuantizedTensor {
    pub bits: u8,
    pub group_size: usize,
    pub shape: Vec<usize>,
    /// Number of encoded values
    pub len: usize,
    pub packed: Vec<u32>,
    pub scales: Vec<f32>,
    pub biases: Vec<f32>,
}

impl QuantizedTensor {
    pub fn quantize(tensor: &Tensor, bits: u8) -> Result<Self> {
        check_bits(bits)?;
        if !tensor.is_finite() {
            return Err(TrainerError::Numerical(
                "Cannot quantize a tensor holding NaN or infinite values".into(),
            ));
        }

        let len = tensor.len();
        let group_size = GROUP_SIZE.min(len.max(1));
        let max_code = (1u32 << bits) - 1;
        let per_word = 32 / bits as usize;

        let groups = len.div_ceil(group_size);
        let mut scales = Vec::with_capacity(groups);
        let mut biases = Vec::with_capacity(groups);
        let mut packed = vec![0u32; len.div_ceil(per_word)];

        for (g, group) in tensor.data.chunks(group_size).enumerate() {
            let min = group.iter().copied().fold(f32::INFINITY, f32::min);
            let max = group.iter().copied().fold(f32::NEG_INFINITY, f32::max);
            let scale = (max - min) / max_code as f32;

            for (j, &x) in group.iter().enumerate() {
                let code = if scale > 0.0 {
                    ((x - min) / scale).round().clamp(0.0, max_code as f32) as u32
                } else {
                    0
                };
                let i = g * group_size + j;
                packed[i / per_word] |= code << ((i % per_word) * bits as usize);
            }

            scales.push(scale);
            biases.push(min);
        }

        Ok(Self {
            bits,
            group_size,
            shape: tensor.shape.clone(),
            len,
            packed,
            scales,
            biases,
        })
    }

    fn code(&self, i: usize) -> u32 {
        let per_word = 32 / self.bits as usize;
        let mask = (1u32 << self.bits) - 1;
        (self.packed[i / per_word] >> ((i % per_word) * self.bits as usize)) & mask
    }

    pub fn dequantize(&self) -> Tensor {
        let data = (0..self.len)
            .map(|i| {
                let g = i / self.group_size;
                self.code(i) as f32 * self.scales[g] + self.biases[g]
            })
            .collect();
        Tensor {
            data,
            shape: self.shape.clone(),
        }
    }

    /// Bytes used by codes, scales and biases
    pub fn storage_bytes(&self) -> usize {
        (self.packed.len() + self.scales.len() + self.biases.len()) * 4
    }
}

/// A parameter after [`quantize_weights`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum QuantizedParam {
    Full(Tensor),
    Quantized(QuantizedTensor),
}

impl QuantizedParam {
    pub fn dequantize(&self) -> Tensor {
        match self {
            QuantizedParam::Full(tensor) => tensor.clone(),
            QuantizedParam::Quantized(q) => q.dequantize(),
        }
    }

    pub fn is_quantized(&self) -> bool {
        matches!(self, QuantizedParam::Quantized(_))
    }
}

fn check_bits(bits: u8) -> Result<()> {
    match bits {
        4 | 8 => Ok(()),
        other => Err(TrainerError::Config(format!(
            "Unsupported quantization width {} bits, expected 4 or 8",
            other
        ))),
    }
}

fn keeps_full_precision(name: &str) -> bool {
    FULL_PRECISION_MARKERS.iter().any(|marker| name.contains(marker))
}

/// Quantize every weight to `bits` (4 or 8), passing bias and normalization
/// parameters through unchanged.
pub fn quantize_weights(
    weights: &ParamMap,
    bits: u8,
) -> Result<BTreeMap<String, QuantizedParam>> {
    check_bits(bits)?;

    let mut out = BTreeMap::new();
    for (name, tensor) in weights {
        let param = if keeps_full_precision(name) {
            QuantizedParam::Full(tensor.clone())
        } else {
            QuantizedParam::Quantized(QuantizedTensor::quantize(tensor, bits)?)
        };
        out.insert(name.clone(), param);
    }

    debug!(
        bits,
        params = out.len(),
        quantized = out.values().filter(|p| p.is_quantized()).count(),
        "Weights quantized"
    );
    Ok(out)
}

/// Inverse of [`quantize_weights`], up to quantization error.
pub fn dequantize_weights(weights: &BTreeMap<String, QuantizedParam>) -> ParamMap {
    weights
        .iter()
        .map(|(name, param)| (name.clone(), param.dequantize()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ramp(len: usize) -> Tensor {
        Tensor::from_vec((0..len).map(|i| (i as f32 * 0.37).sin() * 3.0).collect())
    }

    #[test]
    fn test_invalid_bit_width() {
        let weights = ParamMap::new();
        assert!(matches!(quantize_weights(&weights, 3), Err(TrainerError::Config(_))));
        assert!(matches!(quantize_weights(&weights, 16), Err(TrainerError::Config(_))));
    }

    #[test]
    fn test_bias_and_norm_untouched() {
        let mut weights = ParamMap::new();
        weights.insert("layer.bias".into(), Tensor::from_vec(vec![0.1234567, -9.87654]));
        weights.insert("layer_norm.weight".into(), Tensor::from_vec(vec![1.000001, 0.3]));
        weights.insert("layer.weight".into(), ramp(10));

        let q = quantize_weights(&weights, 8).unwrap();
        assert_eq!(q["layer.bias"], QuantizedParam::Full(weights["layer.bias"].clone()));
        assert_eq!(
            q["layer_norm.weight"].dequantize().data,
            weights["layer_norm.weight"].data
        );
        assert!(q["layer.weight"].is_quantized());
    }

    #[test]
    fn test_reconstruction_error_bounded() {
        for bits in [4u8, 8] {
            let original = ramp(200);
            let q = QuantizedTensor::quantize(&original, bits).unwrap();
            let restored = q.dequantize();

            assert_eq!(restored.shape, original.shape);
            for (i, (a, b)) in original.data.iter().zip(&restored.data).enumerate() {
                let scale = q.scales[i / q.group_size];
                assert!(
                    (a - b).abs() <= scale / 2.0 + 1e-5,
                    "bits={} i={} {} vs {}",
                    bits,
                    i,
                    a,
                    b
                );
            }
        }
    }

    #[test]
    fn test_packing_density() {
        let original = ramp(128);
        let q4 = QuantizedTensor::quantize(&original, 4).unwrap();
        let q8 = QuantizedTensor::quantize(&original, 8).unwrap();
        assert_eq!(q4.packed.len(), 16);
        assert_eq!(q8.packed.len(), 32);
        assert_eq!(q4.scales.len(), 2);
        assert!(q4.storage_bytes() < original.len() * 4);
    }

    #[test]
    fn test_constant_group() {
        let original = Tensor::new(vec![2.5; 6], vec![2, 3]);
        let q = QuantizedTensor::quantize(&original, 4).unwrap();
        assert_eq!(q.scales, vec![0.0]);
        assert_eq!(q.dequantize(), original);
    }

    #[test]
    fn test_short_tensor_uses_single_group() {
        let q = QuantizedTensor::quantize(&Tensor::from_vec(vec![-1.0, 1.0, 0.0]), 8).unwrap();
        assert_eq!(q.group_size, 3);
        let restored = q.dequantize();
        assert!((restored.data[0] + 1.0).abs() < 1e-6);
        assert!((restored.data[1] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_dequantize_weights_keeps_keys() {
        let mut weights = ParamMap::new();
        weights.insert("a.weight".into(), ramp(70));
        weights.insert("a.bias".into(), ramp(4));

        let restored = dequantize_weights(&quantize_weights(&weights, 4).unwrap());
        assert_eq!(
            restored.keys().collect::<Vec<_>>(),
            weights.keys().collect::<Vec<_>>()
        );
    }

    #[test]
    fn test_non_finite_tensor_is_rejected() {
        let mut weights = ParamMap::new();
        weights.insert("a.weight".into(), Tensor::from_vec(vec![0.5, f32::NAN, 1.0]));
        weights.insert("a.bias".into(), Tensor::from_vec(vec![f32::INFINITY]));

        assert!(matches!(
            quantize_weights(&weights, 8),
            Err(TrainerError::Numerical(_))
        ));
    }
}
