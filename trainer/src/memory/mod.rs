//! Memory budgeting: footprint estimates, batch sizing, recovery settings
//! and weight quantization.

pub mod advisor;
pub mod quantize;

pub use advisor::{
    budget_for_memory, optimize_batch_size, suggest_config, suggest_recovery_config,
    MemoryBudget,
};
pub use quantize::{
    dequantize_weights, quantize_weights, QuantizedParam, QuantizedTensor, GROUP_SIZE,
};
