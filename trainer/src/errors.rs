use std::time::Duration;
use thiserror::Error;

/// Errors that can occur while coordinating a training run.
#[derive(Error, Debug)]
pub enum TrainerError {
    /// IO error occurred (file operations, sockets, etc.)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization/deserialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// Configuration error (invalid bit width, zero sizes, bad config file)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Checkpoint was written by a cluster of a different size
    #[error("Topology mismatch: checkpoint was written with world_size={checkpoint}, current cluster size is {current}")]
    TopologyMismatch { checkpoint: usize, current: usize },

    /// Checkpoint store error (corrupt file, duplicate epoch)
    #[error("Checkpoint error: {0}")]
    Checkpoint(String),

    /// A collective operation failed part-way (protocol violation, closed ring)
    #[error("Collective error: {0}")]
    Collective(String),

    /// A peer did not take part in a collective within the allotted time
    #[error("Rank {rank} unreachable: collective stalled for {timeout:?}")]
    RankUnreachable { rank: usize, timeout: Duration },

    /// Network error (bind failed, connection refused, etc.)
    #[error("Network error: {0}")]
    Network(String),

    /// Numerical failure during a training step (NaN loss)
    #[error("Numerical error: {0}")]
    Numerical(String),
}

impl TrainerError {
    /// Whether a caller may reasonably degrade and continue after this error.
    ///
    /// Configuration and topology errors must surface to the user; IO,
    /// checkpoint and communication failures are candidates for a fallback.
    pub fn is_recoverable(&self) -> bool {
        match self {
            TrainerError::Config(_) | TrainerError::TopologyMismatch { .. } => false,
            TrainerError::Io(_)
            | TrainerError::Serialization(_)
            | TrainerError::Checkpoint(_)
            | TrainerError::Collective(_)
            | TrainerError::RankUnreachable { .. }
            | TrainerError::Network(_)
            | TrainerError::Numerical(_) => true,
        }
    }
}

/// Result type alias for trainer operations.
pub type Result<T> = std::result::Result<T, TrainerError>;

impl From<toml::ser::Error> for TrainerError {
    fn from(e: toml::ser::Error) -> Self {
        TrainerError::Serialization(e.to_string())
    }
}

impl From<toml::de::Error> for TrainerError {
    fn from(e: toml::de::Error) -> Self {
        TrainerError::Serialization(e.to_string())
    }
}

impl From<ciborium::ser::Error<std::io::Error>> for TrainerError {
    fn from(e: ciborium::ser::Error<std::io::Error>) -> Self {
        TrainerError::Serialization(e.to_string())
    }
}

impl From<ciborium::de::Error<std::io::Error>> for TrainerError {
    fn from(e: ciborium::de::Error<std::io::Error>) -> Self {
        TrainerError::Serialization(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = TrainerError::Config("Only 4 and 8 bit quantization supported".to_string());
        assert_eq!(
            err.to_string(),
            "Configuration error: Only 4 and 8 bit quantization supported"
        );
    }

    #[test]
    fn test_topology_mismatch_display() {
        let err = TrainerError::TopologyMismatch {
            checkpoint: 4,
            current: 2,
        };
        let msg = err.to_string();
        assert!(msg.contains("world_size=4"));
        assert!(msg.contains("size is 2"));
    }

    #[test]
    fn test_io_error_conversion() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "file not found");
        let err: TrainerError = io_err.into();
        assert!(err.to_string().contains("IO error"));
    }

    #[test]
    fn test_recoverability() {
        assert!(!TrainerError::Config("x".into()).is_recoverable());
        assert!(!TrainerError::TopologyMismatch {
            checkpoint: 1,
            current: 2
        }
        .is_recoverable());
        assert!(TrainerError::Checkpoint("corrupt".into()).is_recoverable());
        assert!(TrainerError::RankUnreachable {
            rank: 1,
            timeout: Duration::from_secs(1)
        }
        .is_recoverable());
    }

    #[test]
    fn test_result_type_alias() {
        fn returns_result() -> Result<usize> {
            Ok(42)
        }

        assert_eq!(returns_result().unwrap(), 42);
    }
}
