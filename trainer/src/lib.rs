pub mod checkpoint;
pub mod cluster;
pub mod collective;
pub mod config;
pub mod discovery;
pub mod errors;
pub mod hardware;
pub mod memory;
pub mod observability;
pub mod optim;
pub mod training;

pub use checkpoint::{Checkpoint, CheckpointConfig, CheckpointStore, CorruptCheckpointPolicy};
pub use cluster::{ClusterConfig, ClusterManager, ReductionFailurePolicy, ResumePoint, Topology};
pub use collective::{ParamMap, Tensor};
pub use config::{LoggingConfig, TrainerConfig};
pub use discovery::{create_hostfile, discover_devices, ClusterRoster, DeviceInfo, DiscoveryConfig};
pub use errors::{Result, TrainerError};
pub use hardware::{detect_hardware, HardwareProfile};
pub use memory::{
    optimize_batch_size, quantize_weights, suggest_config, suggest_recovery_config, MemoryBudget,
};
pub use training::{
    Dataset, EpochHealth, EpochReport, Model, ModelKind, TrainingConfig, TrainingOrchestrator,
    TrainingSummary,
};
