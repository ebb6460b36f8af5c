//! Per-rank coordinator: collectives over a ring transport plus the
//! checkpoint store.

use std::collections::BTreeMap;
use std::net::IpAddr;
use std::path::PathBuf;
use tracing::{debug, info, warn};

use crate::checkpoint::{Checkpoint, CheckpointStore, OptimizerState};
use crate::collective::{ChannelRing, ParamMap, RingTransport, TcpRing, Tensor, WorkerRing};
use crate::discovery::ClusterRoster;
use crate::errors::{Result, TrainerError};

use super::config::{ClusterConfig, ReductionFailurePolicy};
use super::topology::Topology;

/// Where a run picks up after [`ClusterManager::load_checkpoint`]
#[derive(Debug, Clone, PartialEq)]
pub struct ResumePoint {
    /// Last completed epoch, 0 for a fresh run
    pub epoch: u64,
    pub checkpoint: Option<Checkpoint>,
}

impl ResumePoint {
    pub fn fresh() -> Self {
        Self {
            epoch: 0,
            checkpoint: None,
        }
    }
}

/// Coordinates one rank of a data-parallel job.
///
/// Collectives take `&mut self`: one collective is in flight per manager and
/// every rank must issue the same sequence of them.
pub struct ClusterManager<T: RingTransport = ChannelRing> {
    topology: Topology,
    /// `None` for a single-rank cluster
    ring: Option<WorkerRing<T>>,
    store: CheckpointStore,
    policy: ReductionFailurePolicy,
    degraded_reductions: u64,
}

impl ClusterManager<ChannelRing> {
    /// A cluster of one: collectives return their input, no communication.
    pub fn single_process(config: &ClusterConfig) -> Self {
        Self::assemble(Topology::single(), None, config)
    }

    /// `size` managers joined by an in-process ring, index `i` being rank `i`.
    ///
    /// Each manager is meant to be driven by its own task or thread.
    pub fn in_process_group(size: usize, config: &ClusterConfig) -> Result<Vec<Self>> {
        if size == 0 {
            return Err(TrainerError::Config("Cluster size must be at least 1".into()));
        }
        if size == 1 {
            return Ok(vec![Self::single_process(config)]);
        }
        Ok(ChannelRing::build(size)
            .into_iter()
            .map(|link| Self::with_transport(link, config))
            .collect())
    }
}

impl ClusterManager<TcpRing> {
    /// Join a TCP ring; `peers[i]` is the address of rank `i`.
    ///
    /// A one-rank topology opens no sockets.
    pub async fn connect(
        topology: Topology,
        peers: &[IpAddr],
        config: &ClusterConfig,
    ) -> Result<Self> {
        if peers.len() != topology.size {
            return Err(TrainerError::Config(format!(
                "{} peer addresses for a cluster of {}",
                peers.len(),
                topology.size
            )));
        }
        if !topology.is_distributed() {
            return Ok(Self::assemble(topology, None, config));
        }

        let link = TcpRing::connect(topology.rank, peers, &config.tcp_ring()).await?;
        let ring = WorkerRing::new(link, config.collective_timeout());
        Ok(Self::assemble(topology, Some(ring), config))
    }

    /// Join the ring described by a discovery roster as `rank`.
    ///
    /// Roster order is rank order and the device addresses are the peers.
    pub async fn connect_roster(
        roster: &ClusterRoster,
        rank: usize,
        config: &ClusterConfig,
    ) -> Result<Self> {
        let topology = Topology::for_roster(roster, rank)?;
        info!(
            rank,
            size = topology.size,
            host = %roster.devices()[rank].hostname,
            "Joining cluster from roster"
        );
        Self::connect(topology, &roster.addresses(), config).await
    }
}

impl<T: RingTransport> ClusterManager<T> {
    /// Wrap an already connected transport; rank and size come from it.
    pub fn with_transport(transport: T, config: &ClusterConfig) -> Self {
        let topology = Topology {
            rank: transport.rank(),
            size: transport.size(),
        };
        let ring = WorkerRing::new(transport, config.collective_timeout());
        Self::assemble(topology, Some(ring), config)
    }

    fn assemble(topology: Topology, ring: Option<WorkerRing<T>>, config: &ClusterConfig) -> Self {
        debug!(
            rank = topology.rank,
            size = topology.size,
            checkpoint_dir = %config.checkpoint.checkpoint_dir.display(),
            "Cluster manager ready"
        );
        Self {
            topology,
            ring,
            store: CheckpointStore::new(config.checkpoint.clone()),
            policy: config.reduction_failure_policy,
            degraded_reductions: 0,
        }
    }

    pub fn rank(&self) -> usize {
        self.topology.rank
    }

    pub fn size(&self) -> usize {
        self.topology.size
    }

    pub fn topology(&self) -> Topology {
        self.topology
    }

    pub fn store(&self) -> &CheckpointStore {
        &self.store
    }

    pub fn reduction_failure_policy(&self) -> ReductionFailurePolicy {
        self.policy
    }

    /// Reductions that fell back to local values so far.
    pub fn degraded_reductions(&self) -> u64 {
        self.degraded_reductions
    }

    fn ring(&mut self) -> Result<Option<&mut WorkerRing<T>>> {
        let topology = self.topology;
        if !topology.is_distributed() {
            return Ok(None);
        }
        self.ring.as_mut().map(Some).ok_or_else(|| {
            TrainerError::Collective(format!(
                "Rank {} of {} has no ring transport",
                topology.rank, topology.size
            ))
        })
    }

    /// Average gradients across all ranks.
    ///
    /// A single rank gets its input back untouched. On a communication
    /// failure the reduction failure policy decides between the local
    /// gradients and the error.
    pub async fn all_reduce_grads(&mut self, grads: ParamMap) -> Result<ParamMap> {
        self.reduce_mean("gradients", grads).await
    }

    /// Average parameters across all ranks so replicas stay identical.
    pub async fn synchronize_model(&mut self, params: ParamMap) -> Result<ParamMap> {
        self.reduce_mean("parameters", params).await
    }

    async fn reduce_mean(&mut self, what: &'static str, tensors: ParamMap) -> Result<ParamMap> {
        let Some(ring) = self.ring()? else {
            return Ok(tensors);
        };

        match ring.all_reduce_mean(&tensors).await {
            Ok(reduced) => Ok(reduced),
            Err(e) => match self.policy {
                ReductionFailurePolicy::ContinueLocal => {
                    self.degraded_reductions += 1;
                    warn!(
                        rank = self.topology.rank,
                        what,
                        error = %e,
                        degraded = self.degraded_reductions,
                        "Reduction failed, continuing with local values"
                    );
                    Ok(tensors)
                }
                ReductionFailurePolicy::Abort => {
                    warn!(rank = self.topology.rank, what, error = %e, "Reduction failed");
                    Err(e)
                }
            },
        }
    }

    /// Average scalar metrics across ranks (f32 precision on the wire).
    ///
    /// Follows the reduction failure policy like gradients do.
    pub async fn average_metrics(
        &mut self,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<BTreeMap<String, f64>> {
        if !self.topology.is_distributed() {
            return Ok(metrics.clone());
        }

        let tensors: ParamMap = metrics
            .iter()
            .map(|(name, value)| (name.clone(), Tensor::from_vec(vec![*value as f32])))
            .collect();
        let reduced = self.reduce_mean("metrics", tensors).await?;

        Ok(reduced
            .into_iter()
            .map(|(name, t)| (name, t.data.first().map_or(f64::NAN, |&v| v as f64)))
            .collect())
    }

    /// Replace every rank's tensors with those of `root`. Failures always
    /// propagate.
    pub async fn broadcast_params(&mut self, params: ParamMap, root: usize) -> Result<ParamMap> {
        if root >= self.topology.size {
            return Err(TrainerError::Config(format!(
                "Broadcast root {} out of range for size {}",
                root, self.topology.size
            )));
        }
        match self.ring()? {
            Some(ring) => ring.broadcast(&params, root).await,
            None => Ok(params),
        }
    }

    /// Block until every rank reaches the barrier.
    pub async fn barrier(&mut self) -> Result<()> {
        match self.ring()? {
            Some(ring) => ring.barrier().await,
            None => Ok(()),
        }
    }

    /// Persist training state after `epoch`. Only rank 0 writes; elsewhere
    /// this is a no-op returning `Ok(None)`.
    pub fn save_checkpoint(
        &self,
        params: &ParamMap,
        optimizer_state: &OptimizerState,
        epoch: u64,
        metrics: &BTreeMap<String, f64>,
    ) -> Result<Option<PathBuf>> {
        if !self.topology.is_root() {
            debug!(rank = self.topology.rank, epoch, "Skipping checkpoint on non-root rank");
            return Ok(None);
        }

        let checkpoint = Checkpoint::new(
            epoch,
            params.clone(),
            optimizer_state.clone(),
            metrics.clone(),
            self.topology.size,
        );
        self.store.save(&checkpoint).map(Some)
    }

    /// Find the newest checkpoint.
    ///
    /// No checkpoint (or an unreadable one under the default policy) resumes
    /// from epoch 0. A checkpoint written by a different cluster size is a
    /// [`TrainerError::TopologyMismatch`].
    pub fn load_checkpoint(&self) -> Result<ResumePoint> {
        let Some(checkpoint) = self.store.load_latest()? else {
            info!(rank = self.topology.rank, "No checkpoint found, starting from epoch 0");
            return Ok(ResumePoint::fresh());
        };

        if checkpoint.world_size != self.topology.size {
            return Err(TrainerError::TopologyMismatch {
                checkpoint: checkpoint.world_size,
                current: self.topology.size,
            });
        }

        info!(
            rank = self.topology.rank,
            epoch = checkpoint.epoch,
            "Resuming from checkpoint"
        );
        Ok(ResumePoint {
            epoch: checkpoint.epoch,
            checkpoint: Some(checkpoint),
        })
    }

    /// Stored epochs, ascending.
    pub fn list_checkpoints(&self) -> Result<Vec<u64>> {
        self.store.list_epochs()
    }
}
