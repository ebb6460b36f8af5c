//! Checkpoint persistence for training runs
//!
//! One file per completed epoch, named `checkpoint_epoch_<epoch>.ckpt` and
//! encoded as CBOR. Files are written atomically and never overwritten;
//! only rank 0 writes (enforced by the cluster manager).

pub mod store;
pub mod types;

pub use store::CheckpointStore;
pub use types::{
    Checkpoint, CheckpointConfig, CorruptCheckpointPolicy, OptimizerState, StateValue,
};
