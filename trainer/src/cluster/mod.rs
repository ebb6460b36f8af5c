//! Cluster coordination: rank assignment, gradient and parameter
//! reduction, and rank-0 checkpointing.

pub mod config;
pub mod manager;
pub mod topology;

pub use config::{ClusterConfig, ReductionFailurePolicy};
pub use manager::{ClusterManager, ResumePoint};
pub use topology::Topology;
