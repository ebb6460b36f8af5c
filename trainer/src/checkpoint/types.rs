//! Checkpoint types and structures

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;

use crate::collective::{ParamMap, Tensor};
use crate::errors::Result;

/// File name prefix; the full name is `checkpoint_epoch_<epoch>.ckpt`.
pub const CHECKPOINT_PREFIX: &str = "checkpoint_epoch_";
pub const CHECKPOINT_EXTENSION: &str = "ckpt";

/// What to do when the newest checkpoint can't be decoded
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CorruptCheckpointPolicy {
    /// Log and start from epoch 0
    #[default]
    TreatAsAbsent,
    /// Surface the decode error
    Fail,
}

/// Configuration for checkpoint storage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CheckpointConfig {
    /// Directory for storing checkpoints
    pub checkpoint_dir: PathBuf,

    pub corrupt_policy: CorruptCheckpointPolicy,
}

impl Default for CheckpointConfig {
    fn default() -> Self {
        Self {
            checkpoint_dir: dirs::home_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(".meshtrain")
                .join("checkpoints"),
            corrupt_policy: CorruptCheckpointPolicy::default(),
        }
    }
}

impl CheckpointConfig {
    pub fn in_dir(checkpoint_dir: impl Into<PathBuf>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            ..Default::default()
        }
    }
}

/// One optimizer state entry: a scalar (step count, learning rate) or a
/// per-parameter tensor (moments).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum StateValue {
    Scalar(f64),
    Tensor(Tensor),
}

/// Optimizer state keyed by entry name (e.g. `"m.layer1.weight"`)
pub type OptimizerState = BTreeMap<String, StateValue>;

/// Training state persisted after an epoch completes
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Checkpoint {
    /// Last completed epoch
    pub epoch: u64,

    pub model_state: ParamMap,

    pub optimizer_state: OptimizerState,

    pub metrics: BTreeMap<String, f64>,

    /// Cluster size that produced this checkpoint
    pub world_size: usize,

    /// Unix seconds at save time
    pub timestamp: f64,
}

impl Checkpoint {
    pub fn new(
        epoch: u64,
        model_state: ParamMap,
        optimizer_state: OptimizerState,
        metrics: BTreeMap<String, f64>,
        world_size: usize,
    ) -> Self {
        Self {
            epoch,
            model_state,
            optimizer_state,
            metrics,
            world_size,
            timestamp: std::time::SystemTime::now()
                .duration_since(std::time::UNIX_EPOCH)
                .map(|d| d.as_secs_f64())
                .unwrap_or(0.0),
        }
    }

    /// Serialize checkpoint to CBOR bytes
    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        ciborium::ser::into_writer(self, &mut bytes)?;
        Ok(bytes)
    }

    /// Deserialize checkpoint from CBOR bytes
    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::de::from_reader(bytes)?)
    }

    pub fn file_name(epoch: u64) -> String {
        format!("{}{}.{}", CHECKPOINT_PREFIX, epoch, CHECKPOINT_EXTENSION)
    }

    /// Epoch encoded in a checkpoint file name, `None` for anything else
    /// (temp files, foreign files, non-numeric suffixes).
    pub fn parse_file_name(name: &str) -> Option<u64> {
        let digits = name
            .strip_prefix(CHECKPOINT_PREFIX)?
            .strip_suffix(CHECKPOINT_EXTENSION)?
            .strip_suffix('.')?;

        if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
            return None;
        }
        digits.parse().ok()
    }
}
