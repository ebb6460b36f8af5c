use serde::{Deserialize, Serialize};

use crate::discovery::ClusterRoster;
use crate::errors::{Result, TrainerError};

/// Environment variables carrying the rank of a launched process
pub const RANK_ENV_VARS: [&str; 2] = ["MESHTRAIN_RANK", "OMPI_COMM_WORLD_RANK"];
pub const WORLD_SIZE_ENV_VARS: [&str; 2] = ["MESHTRAIN_WORLD_SIZE", "OMPI_COMM_WORLD_SIZE"];

/// This process's place in the cluster; fixed for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    pub rank: usize,
    pub size: usize,
}

impl Topology {
    pub fn new(rank: usize, size: usize) -> Result<Self> {
        if size == 0 {
            return Err(TrainerError::Config("Cluster size must be at least 1".into()));
        }
        if rank >= size {
            return Err(TrainerError::Config(format!(
                "Rank {} out of range for cluster size {}",
                rank, size
            )));
        }
        Ok(Self { rank, size })
    }

    pub fn single() -> Self {
        Self { rank: 0, size: 1 }
    }

    /// Topology of the process that ran discovery: it launches the job and
    /// takes rank 0, the roster order assigns the others.
    pub fn from_roster(roster: &ClusterRoster) -> Self {
        Self {
            rank: 0,
            size: roster.len().max(1),
        }
    }

    /// Topology of `rank` in a saved roster; the roster length is the size.
    pub fn for_roster(roster: &ClusterRoster, rank: usize) -> Result<Self> {
        Self::new(rank, roster.len())
    }

    /// Read rank and size set by a launcher (`MESHTRAIN_*` first, then the
    /// Open MPI variables). `Ok(None)` when neither is set.
    pub fn from_env() -> Result<Option<Self>> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Option<Self>> {
        let (rank, size) = match (
            first_set(&lookup, &RANK_ENV_VARS),
            first_set(&lookup, &WORLD_SIZE_ENV_VARS),
        ) {
            (None, None) => return Ok(None),
            (Some(rank), Some(size)) => (rank, size),
            (Some((key, _)), None) | (None, Some((key, _))) => {
                return Err(TrainerError::Config(format!(
                    "{} is set but its rank/size counterpart is not",
                    key
                )))
            }
        };

        let parse = |(key, value): (&str, String)| {
            value.trim().parse::<usize>().map_err(|_| {
                TrainerError::Config(format!("{}={} is not a valid number", key, value))
            })
        };

        Self::new(parse(rank)?, parse(size)?).map(Some)
    }

    pub fn is_root(&self) -> bool {
        self.rank == 0
    }

    pub fn is_distributed(&self) -> bool {
        self.size > 1
    }
}

fn first_set(
    lookup: &impl Fn(&str) -> Option<String>,
    keys: &[&'static str],
) -> Option<(&'static str, String)> {
    keys.iter().find_map(|&key| lookup(key).map(|value| (key, value)))
}
