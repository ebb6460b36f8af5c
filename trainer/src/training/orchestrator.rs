//! The training loop: batches in, reduced gradients through the optimizer,
//! periodic rank-0 checkpoints out.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Instant;
use tracing::{error, info, warn};

use crate::checkpoint::OptimizerState;
use crate::cluster::ClusterManager;
use crate::collective::{global_norm, ChannelRing, ParamMap, RingTransport, Tensor};
use crate::errors::{Result, TrainerError};
use crate::hardware::ResourceSampler;
use crate::memory::{suggest_config, suggest_recovery_config, MemoryBudget};
use crate::optim::{build_optimizer, Optimizer};

use super::config::TrainingConfig;
use super::data::Dataset;
use super::metrics::{losses_in_sync, MetricsTracker, SYNC_TOLERANCE};
use super::model::Model;

const RESUME_EPOCH_KEY: &str = "resume_epoch";
const BATCH_COUNT_KEY: &str = "batch_count";
const BATCH_MISMATCH_KEY: &str = "batch_count_mismatch";
const PARAM_NORM_KEY: &str = "param_norm";

/// Relative tolerance on the parameter norm; it crosses the wire as f32
const PARAM_NORM_RELATIVE_TOLERANCE: f64 = 1e-5;

/// Outcome of the per-epoch health check
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EpochHealth {
    Healthy,
    /// The loss was NaN on at least one rank
    UnhealthyNanLoss,
    /// Gradient norm below the configured epsilon; a warning only
    VanishingGradients,
}

impl EpochHealth {
    /// Whether training may carry on after this epoch.
    pub fn is_healthy(&self) -> bool {
        !matches!(self, EpochHealth::UnhealthyNanLoss)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EpochReport {
    pub epoch: u64,
    /// Mean loss across batches and ranks
    pub loss: f64,
    /// Mean global norm of the reduced gradients
    pub grad_norm: f64,
    pub batches: usize,
    /// Samples processed by this rank
    pub samples: usize,
    pub samples_per_second: f64,
    /// Resident memory of this process at the end of the epoch
    pub memory_gb: Option<f64>,
    /// Optimizer steps skipped because the reduced gradients were not finite
    pub skipped_steps: usize,
    pub health: EpochHealth,
    /// Parameter norms agreed across ranks after the end-of-epoch sync
    pub replicas_in_sync: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSummary {
    /// Last completed epoch before this run, 0 for a fresh start
    pub resumed_from: u64,
    pub epochs: Vec<EpochReport>,
    /// Epochs checkpointed by this run (rank 0 only)
    pub checkpoints: Vec<u64>,
    pub stopped_early: bool,
    pub degraded_reductions: u64,
}

impl TrainingSummary {
    pub fn last_epoch(&self) -> u64 {
        self.epochs.last().map_or(self.resumed_from, |r| r.epoch)
    }

    pub fn final_loss(&self) -> Option<f64> {
        self.epochs.last().map(|r| r.loss)
    }
}

/// Drives one rank of a data-parallel training run.
pub struct TrainingOrchestrator<T: RingTransport = ChannelRing> {
    config: TrainingConfig,
    cluster: ClusterManager<T>,
    model: Box<dyn Model>,
    dataset: Box<dyn Dataset>,
    optimizer: Box<dyn Optimizer>,
    tracker: MetricsTracker,
    sampler: ResourceSampler,
    memory_budget: MemoryBudget,
}

impl<T: RingTransport> TrainingOrchestrator<T> {
    pub fn new(
        config: TrainingConfig,
        cluster: ClusterManager<T>,
        model: Box<dyn Model>,
        dataset: Box<dyn Dataset>,
    ) -> Result<Self> {
        config.validate()?;
        let optimizer = build_optimizer(config.optimizer, config.learning_rate);

        let parameters = model.num_parameters();
        let memory_budget = suggest_config(parameters.max(1), cluster.size())?;
        info!(
            rank = cluster.rank(),
            parameters,
            devices = cluster.size(),
            memory_gb = memory_budget.estimated_memory_gb,
            suggested_batch_size = memory_budget.suggested_batch_size,
            "Memory budget"
        );
        if memory_budget.activation_checkpointing && !config.gradient_checkpointing {
            warn!(
                memory_gb = memory_budget.estimated_memory_gb,
                "Model is large enough to need gradient checkpointing, which is off"
            );
        }
        if config.batch_size > memory_budget.suggested_batch_size {
            warn!(
                batch_size = config.batch_size,
                suggested = memory_budget.suggested_batch_size,
                "Batch size above the suggested budget"
            );
        }

        Ok(Self {
            config,
            cluster,
            model,
            dataset,
            optimizer,
            tracker: MetricsTracker::new(),
            sampler: ResourceSampler::new(),
            memory_budget,
        })
    }

    /// Replace the optimizer built from the config.
    pub fn with_optimizer(mut self, optimizer: Box<dyn Optimizer>) -> Self {
        self.optimizer = optimizer;
        self
    }

    pub fn config(&self) -> &TrainingConfig {
        &self.config
    }

    pub fn cluster(&self) -> &ClusterManager<T> {
        &self.cluster
    }

    pub fn model(&self) -> &dyn Model {
        self.model.as_ref()
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    /// Footprint estimate made at setup for this model and cluster size
    pub fn memory_budget(&self) -> &MemoryBudget {
        &self.memory_budget
    }

    /// Switch to the lower-memory settings of [`suggest_recovery_config`].
    ///
    /// The dataset is rebatched, and when optimizer state is dropped the
    /// optimizer restarts without moments. Call [`Self::train`] again to
    /// resume from the last checkpoint.
    pub fn apply_recovery(&mut self) -> Result<&TrainingConfig> {
        let recovered = suggest_recovery_config(&self.config);
        self.dataset.rebatch(recovered.batch_size)?;

        if recovered.optimizer_no_state && !self.config.optimizer_no_state {
            self.optimizer = build_optimizer(self.optimizer.kind(), self.optimizer.learning_rate());
        }

        warn!(
            rank = self.cluster.rank(),
            batch_size = recovered.batch_size,
            gradient_checkpointing = recovered.gradient_checkpointing,
            optimizer_no_state = recovered.optimizer_no_state,
            "Applying recovery settings"
        );
        self.config = recovered;
        Ok(&self.config)
    }

    /// Restore the newest checkpoint and align every rank with rank 0.
    ///
    /// Returns the last completed epoch (0 for a fresh run). Every rank must
    /// call this, since alignment is a broadcast.
    pub async fn resume(&mut self) -> Result<u64> {
        let point = self.cluster.load_checkpoint()?;

        if let Some(checkpoint) = point.checkpoint {
            self.model.load_parameters(checkpoint.model_state)?;
            if self.config.optimizer_no_state {
                info!("Optimizer state not restored (optimizer_no_state)");
            } else {
                self.optimizer.load_state(&checkpoint.optimizer_state)?;
            }
        }

        if !self.cluster.topology().is_distributed() {
            return Ok(point.epoch);
        }

        let params = self.cluster.broadcast_params(self.model.parameters(), 0).await?;
        self.model.load_parameters(params)?;

        let mut marker = ParamMap::new();
        marker.insert(
            RESUME_EPOCH_KEY.to_string(),
            Tensor::from_vec(vec![point.epoch as f32]),
        );
        let marker = self.cluster.broadcast_params(marker, 0).await?;
        let epoch = marker
            .get(RESUME_EPOCH_KEY)
            .and_then(|t| t.data.first())
            .map(|&e| e.round() as u64)
            .ok_or_else(|| TrainerError::Collective("Resume epoch missing from broadcast".into()))?;

        if epoch != point.epoch {
            info!(
                rank = self.cluster.rank(),
                local_epoch = point.epoch,
                epoch,
                "Adopting resume epoch from rank 0"
            );
        }
        Ok(epoch)
    }

    /// Run one pass over the dataset.
    pub async fn run_epoch(&mut self, epoch: u64) -> Result<EpochReport> {
        self.tracker.reset();
        let started = Instant::now();
        let rank = self.cluster.rank();

        self.check_batch_counts().await?;
        let distributed = self.cluster.topology().is_distributed();

        let mut samples = 0;
        let mut batches = 0;
        let mut skipped_steps = 0;

        for batch in self.dataset.batches() {
            let (loss, grads) = self.model.loss_and_grads(&batch)?;
            if loss.is_nan() {
                warn!(rank, epoch, batch = batches, "NaN loss");
            }

            // Every rank reduces every batch, whatever its local loss
            let grads = self.cluster.all_reduce_grads(grads).await?;
            let grad_norm = global_norm(&grads);

            if grads.values().all(Tensor::is_finite) {
                let mut params = self.model.parameters();
                self.optimizer.step(&mut params, &grads)?;
                self.model.load_parameters(params)?;
            } else {
                skipped_steps += 1;
                warn!(rank, epoch, batch = batches, "Non-finite gradients, skipping optimizer step");
            }

            self.tracker
                .update([("loss", loss as f64), ("grad_norm", grad_norm)]);
            samples += batch.samples();
            batches += 1;
        }

        let replicas_in_sync = if distributed {
            let params = self.model.parameters();
            let params = self.cluster.synchronize_model(params).await?;
            self.model.load_parameters(params)?;
            self.check_replicas(epoch).await?
        } else {
            true
        };

        let local = self.tracker.epoch_means();
        let reduced = self.cluster.average_metrics(&local).await?;
        let loss = reduced.get("loss").copied().unwrap_or(0.0);
        let grad_norm = reduced.get("grad_norm").copied().unwrap_or(0.0);

        let elapsed = started.elapsed().as_secs_f64();
        let samples_per_second = if elapsed > 0.0 {
            samples as f64 / elapsed
        } else {
            0.0
        };

        let health = if loss.is_nan() {
            EpochHealth::UnhealthyNanLoss
        } else if grad_norm < self.config.grad_norm_epsilon {
            EpochHealth::VanishingGradients
        } else {
            EpochHealth::Healthy
        };

        let report = EpochReport {
            epoch,
            loss,
            grad_norm,
            batches,
            samples,
            samples_per_second,
            memory_gb: self.sampler.process_memory_gb(),
            skipped_steps,
            health,
            replicas_in_sync,
        };

        match health {
            EpochHealth::Healthy => info!(
                rank,
                epoch,
                loss,
                grad_norm,
                samples,
                samples_per_second = format!("{:.1}", samples_per_second),
                "Epoch complete"
            ),
            EpochHealth::VanishingGradients => warn!(
                rank,
                epoch,
                loss,
                grad_norm,
                epsilon = self.config.grad_norm_epsilon,
                "Epoch complete with vanishing gradients"
            ),
            EpochHealth::UnhealthyNanLoss => error!(rank, epoch, "Epoch produced a NaN loss"),
        }

        Ok(report)
    }

    /// Every rank must run exactly as many batches as rank 0 or their
    /// collectives would pair up wrongly. The mismatch flag is reduced so
    /// all ranks fail together.
    async fn check_batch_counts(&mut self) -> Result<()> {
        if !self.cluster.topology().is_distributed() {
            return Ok(());
        }

        let count = self.dataset.batches().count();
        let mut mine = ParamMap::new();
        mine.insert(
            BATCH_COUNT_KEY.to_string(),
            Tensor::from_vec(vec![count as f32]),
        );
        let root = self.cluster.broadcast_params(mine, 0).await?;
        let expected = root
            .get(BATCH_COUNT_KEY)
            .and_then(|t| t.data.first())
            .map(|&c| c.round() as usize)
            .ok_or_else(|| TrainerError::Collective("Batch count missing from broadcast".into()))?;

        let mut flag = BTreeMap::new();
        flag.insert(
            BATCH_MISMATCH_KEY.to_string(),
            if count == expected { 0.0 } else { 1.0 },
        );
        let mismatched = self
            .cluster
            .average_metrics(&flag)
            .await?
            .get(BATCH_MISMATCH_KEY)
            .copied()
            .unwrap_or(0.0);

        if mismatched > 0.0 {
            return Err(TrainerError::Config(format!(
                "Ranks have different batch counts (rank {} has {}, rank 0 has {})",
                self.cluster.rank(),
                count,
                expected
            )));
        }
        Ok(())
    }

    /// Compare this rank's parameter norm with the cluster mean.
    async fn check_replicas(&mut self, epoch: u64) -> Result<bool> {
        let norm = global_norm(&self.model.parameters());
        let mut local = BTreeMap::new();
        local.insert(PARAM_NORM_KEY.to_string(), norm);

        let mean = self
            .cluster
            .average_metrics(&local)
            .await?
            .get(PARAM_NORM_KEY)
            .copied()
            .unwrap_or(f64::NAN);

        let tolerance = SYNC_TOLERANCE.max(norm.abs() * PARAM_NORM_RELATIVE_TOLERANCE);
        let in_sync = losses_in_sync(&[norm, mean], tolerance);
        if !in_sync {
            warn!(
                rank = self.cluster.rank(),
                epoch,
                norm,
                mean,
                "Replica parameters diverged"
            );
        }
        Ok(in_sync)
    }

    fn checkpoint_metrics(report: &EpochReport) -> BTreeMap<String, f64> {
        let mut metrics = BTreeMap::new();
        metrics.insert("loss".to_string(), report.loss);
        metrics.insert("grad_norm".to_string(), report.grad_norm);
        metrics.insert("samples_per_second".to_string(), report.samples_per_second);
        if let Some(memory_gb) = report.memory_gb {
            metrics.insert("memory_gb".to_string(), memory_gb);
        }
        metrics
    }

    fn save(&self, report: &EpochReport) -> Result<Option<u64>> {
        let state = if self.config.optimizer_no_state {
            OptimizerState::new()
        } else {
            self.optimizer.state()
        };

        let saved = self.cluster.save_checkpoint(
            &self.model.parameters(),
            &state,
            report.epoch,
            &Self::checkpoint_metrics(report),
        )?;
        Ok(saved.map(|_| report.epoch))
    }

    /// Resume, then run the remaining epochs up to `config.epochs`.
    pub async fn train(&mut self) -> Result<TrainingSummary> {
        let resumed_from = self.resume().await?;
        let mut summary = TrainingSummary {
            resumed_from,
            epochs: Vec::new(),
            checkpoints: Vec::new(),
            stopped_early: false,
            degraded_reductions: 0,
        };

        info!(
            rank = self.cluster.rank(),
            size = self.cluster.size(),
            first_epoch = resumed_from + 1,
            last_epoch = self.config.epochs,
            optimizer = %self.optimizer.kind(),
            "Starting training"
        );

        for epoch in (resumed_from + 1)..=self.config.epochs {
            let report = self.run_epoch(epoch).await?;
            let healthy = report.health.is_healthy();

            if !healthy && self.config.abort_on_nan {
                summary.epochs.push(report);
                summary.stopped_early = true;
                warn!(epoch, "Stopping training after unhealthy epoch");
                break;
            }

            let due = epoch % self.config.checkpoint_interval == 0 || epoch == self.config.epochs;
            if due && healthy {
                match self.save(&report) {
                    Ok(Some(saved)) => summary.checkpoints.push(saved),
                    Ok(None) => {}
                    Err(e) if e.is_recoverable() => {
                        error!(epoch, error = %e, "Failed to save checkpoint, continuing");
                    }
                    Err(e) => return Err(e),
                }
            }

            summary.epochs.push(report);
        }

        self.cluster.barrier().await?;
        summary.degraded_reductions = self.cluster.degraded_reductions();

        info!(
            rank = self.cluster.rank(),
            epochs = summary.epochs.len(),
            last_epoch = summary.last_epoch(),
            checkpoints = summary.checkpoints.len(),
            stopped_early = summary.stopped_early,
            degraded_reductions = summary.degraded_reductions,
            "Training finished"
        );
        Ok(summary)
    }

    /// [`Self::train`], retried once with [`Self::apply_recovery`] after a
    /// recoverable failure.
    ///
    /// Only a single rank retries; ranks of a cluster could fail at
    /// different points and would not re-enter their collectives together.
    pub async fn train_with_recovery(&mut self) -> Result<TrainingSummary> {
        match self.train().await {
            Err(e) if e.is_recoverable() && !self.cluster.topology().is_distributed() => {
                warn!(error = %e, "Training failed, retrying from the last checkpoint");
                self.apply_recovery()?;
                self.train().await
            }
            other => other,
        }
    }
}
