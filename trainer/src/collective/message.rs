use serde::{Deserialize, Serialize};

use crate::errors::Result;

use super::tensor::Tensor;

/// Phase of a ring collective
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AllReducePhase {
    /// Reduce-scatter phase: each node sends a chunk to the next node
    /// and accumulates chunks received from the previous node
    ReduceScatter,
    /// All-gather phase: each node forwards its fully reduced chunk
    /// around the ring so all nodes end up with the complete result
    AllGather,
    /// Root-to-all copy along the ring
    Broadcast,
}

/// Message exchanged between ring neighbours.
///
/// `(sequence, key_index, phase, step)` identifies the exact point of the
/// collective the payload belongs to; receivers reject anything else.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TensorMessage {
    /// Collective counter, identical on every rank for the same call
    pub sequence: u64,
    /// Index of the tensor in sorted key order
    pub key_index: u32,
    /// Name of the tensor, so ranks with different key sets can't pair up
    pub key: String,
    pub phase: AllReducePhase,
    /// Step number within the current phase
    pub step: u32,
    /// Rank of the sender
    pub from_rank: u32,
    pub chunk_data: Vec<f32>,
    pub chunk_shape: Vec<usize>,
}

impl TensorMessage {
    pub fn new(
        sequence: u64,
        key_index: u32,
        key: &str,
        phase: AllReducePhase,
        step: u32,
        from_rank: u32,
        chunk: &Tensor,
    ) -> Self {
        Self {
            sequence,
            key_index,
            key: key.to_string(),
            phase,
            step,
            from_rank,
            chunk_data: chunk.data.clone(),
            chunk_shape: chunk.shape.clone(),
        }
    }

    /// Payload as a tensor, validating the shape.
    pub fn into_tensor(self) -> Result<Tensor> {
        Tensor::try_new(self.chunk_data, self.chunk_shape)
    }

    /// Whether this message sits at the given protocol position.
    pub fn matches(
        &self,
        sequence: u64,
        key_index: u32,
        key: &str,
        phase: AllReducePhase,
        step: u32,
    ) -> bool {
        self.sequence == sequence
            && self.key_index == key_index
            && self.key == key
            && self.phase == phase
            && self.step == step
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::ser::into_writer(self, &mut buf)?;
        Ok(buf)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self> {
        Ok(ciborium::de::from_reader(bytes)?)
    }
}
