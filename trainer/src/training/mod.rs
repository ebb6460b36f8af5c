//! Data-parallel training: model and dataset seams, the model table,
//! metrics and the orchestrating loop.

pub mod config;
pub mod data;
pub mod metrics;
pub mod model;
pub mod orchestrator;

pub use config::{TrainingConfig, DEFAULT_GRAD_NORM_EPSILON};
pub use data::{Batch, Dataset, InMemoryDataset};
pub use metrics::{losses_in_sync, MetricsTracker, SYNC_TOLERANCE};
pub use model::{LinearModel, Model, ModelKind, ModelOptions, ModelSpec};
pub use orchestrator::{EpochHealth, EpochReport, TrainingOrchestrator, TrainingSummary};
