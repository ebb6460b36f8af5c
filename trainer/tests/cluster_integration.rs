//! Multi-rank cluster tests
//!
//! Ranks run as tokio tasks over the in-process ring and share one
//! checkpoint directory, the way processes on one host share a mount.

use std::collections::BTreeMap;
use std::time::Duration;
use tempfile::TempDir;
use trainer::checkpoint::OptimizerState;
use trainer::optim::OptimizerKind;
use trainer::training::{InMemoryDataset, LinearModel};
use trainer::{
    CheckpointConfig, ClusterConfig, ClusterManager, ParamMap, ReductionFailurePolicy, Tensor,
    TrainerError, TrainingConfig, TrainingOrchestrator, TrainingSummary,
};

fn cluster_config(dir: &TempDir) -> ClusterConfig {
    ClusterConfig {
        collective_timeout_secs: 5,
        checkpoint: CheckpointConfig::in_dir(dir.path()),
        ..Default::default()
    }
}

fn grads(value: f32) -> ParamMap {
    let mut grads = ParamMap::new();
    grads.insert("encoder.weight".into(), Tensor::filled(vec![4, 3], value));
    grads.insert("encoder.bias".into(), Tensor::filled(vec![3], value * 2.0));
    grads
}

#[tokio::test]
async fn test_three_rank_gradient_mean() {
    let dir = TempDir::new().unwrap();
    let managers = ClusterManager::in_process_group(3, &cluster_config(&dir)).unwrap();

    let handles: Vec<_> = managers
        .into_iter()
        .map(|mut manager| {
            tokio::spawn(async move {
                let rank = manager.rank();
                manager.all_reduce_grads(grads(rank as f32 * 3.0)).await
            })
        })
        .collect();

    for handle in handles {
        let reduced = handle.await.unwrap().unwrap();
        assert_eq!(reduced["encoder.weight"].shape, vec![4, 3]);
        assert!(reduced["encoder.weight"].data.iter().all(|&v| (v - 3.0).abs() < 1e-5));
        assert!(reduced["encoder.bias"].data.iter().all(|&v| (v - 6.0).abs() < 1e-5));
    }
}

#[tokio::test]
async fn test_lost_rank_continues_locally() {
    let dir = TempDir::new().unwrap();
    let config = ClusterConfig {
        collective_timeout_secs: 1,
        ..cluster_config(&dir)
    };
    let mut managers = ClusterManager::in_process_group(3, &config).unwrap();
    let _silent = managers.pop();

    let handles: Vec<_> = managers
        .into_iter()
        .map(|mut manager| {
            tokio::spawn(async move {
                let reduced = manager.all_reduce_grads(grads(7.0)).await;
                (reduced, manager.degraded_reductions())
            })
        })
        .collect();

    for handle in handles {
        let (reduced, degraded) = handle.await.unwrap();
        assert_eq!(reduced.unwrap(), grads(7.0));
        assert_eq!(degraded, 1);
    }
}

#[tokio::test]
async fn test_lost_rank_aborts_under_abort_policy() {
    let dir = TempDir::new().unwrap();
    let config = ClusterConfig {
        collective_timeout_secs: 1,
        reduction_failure_policy: ReductionFailurePolicy::Abort,
        ..cluster_config(&dir)
    };
    let mut managers = ClusterManager::in_process_group(2, &config).unwrap();
    let _silent = managers.pop();
    let mut manager = managers.pop().unwrap();

    let result = manager.all_reduce_grads(grads(1.0)).await;
    assert!(matches!(result, Err(TrainerError::RankUnreachable { .. })));
}

#[tokio::test]
async fn test_only_rank_zero_writes_checkpoints() {
    let dir = TempDir::new().unwrap();
    let managers = ClusterManager::in_process_group(4, &cluster_config(&dir)).unwrap();

    let mut metrics = BTreeMap::new();
    metrics.insert("loss".to_string(), 0.25);

    for manager in &managers {
        let written = manager
            .save_checkpoint(&grads(1.0), &OptimizerState::new(), 2, &metrics)
            .unwrap();
        assert_eq!(written.is_some(), manager.rank() == 0);
    }

    assert_eq!(managers[3].list_checkpoints().unwrap(), vec![2]);
    let resume = managers[2].load_checkpoint().unwrap();
    assert_eq!(resume.epoch, 2);
    assert_eq!(resume.checkpoint.unwrap().world_size, 4);
}

#[tokio::test]
async fn test_resume_with_different_cluster_size_fails() {
    let dir = TempDir::new().unwrap();
    let config = cluster_config(&dir);

    let four = ClusterManager::in_process_group(4, &config).unwrap();
    four[0]
        .save_checkpoint(&grads(1.0), &OptimizerState::new(), 5, &BTreeMap::new())
        .unwrap();

    let two = ClusterManager::in_process_group(2, &config).unwrap();
    match two[0].load_checkpoint() {
        Err(TrainerError::TopologyMismatch { checkpoint, current }) => {
            assert_eq!(checkpoint, 4);
            assert_eq!(current, 2);
        }
        other => panic!("expected TopologyMismatch, got {:?}", other),
    }
}

fn training_config(epochs: u64) -> TrainingConfig {
    TrainingConfig {
        epochs,
        batch_size: 4,
        learning_rate: 0.05,
        optimizer: OptimizerKind::Sgd,
        checkpoint_interval: 2,
        ..Default::default()
    }
}

async fn train_group(dir: &TempDir, size: usize, epochs: u64) -> Vec<(TrainingSummary, ParamMap)> {
    let config = training_config(epochs);
    let full = InMemoryDataset::synthetic(64, 2, 0.5, 0.1, config.batch_size).unwrap();
    let managers = ClusterManager::in_process_group(size, &cluster_config(dir)).unwrap();

    let handles: Vec<_> = managers
        .into_iter()
        .map(|manager| {
            let dataset = full.shard(manager.rank(), size).unwrap();
            let config = config.clone();
            tokio::spawn(async move {
                let mut orchestrator = TrainingOrchestrator::new(
                    config,
                    manager,
                    Box::new(LinearModel::new(2, 2)),
                    Box::new(dataset),
                )?;
                let summary = orchestrator.train().await?;
                Ok::<_, TrainerError>((summary, orchestrator.model().parameters()))
            })
        })
        .collect();

    let mut results = Vec::new();
    for handle in handles {
        results.push(handle.await.unwrap().unwrap());
    }
    results
}

#[tokio::test]
async fn test_two_rank_training_keeps_replicas_identical() {
    let dir = TempDir::new().unwrap();
    let results = train_group(&dir, 2, 5).await;

    let (summary0, params0) = &results[0];
    let (summary1, params1) = &results[1];

    assert_eq!(params0, params1, "replicas diverged");
    assert_eq!(summary0.epochs.len(), 5);
    assert_eq!(summary0.epochs[0].samples, 32);
    assert_eq!(summary0.degraded_reductions, 0);

    // Reduced metrics are identical on every rank
    for (a, b) in summary0.epochs.iter().zip(&summary1.epochs) {
        assert_eq!(a.loss, b.loss);
        assert_eq!(a.health, b.health);
        assert!(a.replicas_in_sync && b.replicas_in_sync);
    }

    let first = summary0.epochs[0].loss;
    let last = summary0.final_loss().unwrap();
    assert!(last < first, "loss went from {} to {}", first, last);

    // Interval 2 over 5 epochs, plus the final epoch, written by rank 0 only
    assert_eq!(summary0.checkpoints, vec![2, 4, 5]);
    assert!(summary1.checkpoints.is_empty());
}

#[tokio::test]
async fn test_two_rank_training_resumes() {
    let dir = TempDir::new().unwrap();
    train_group(&dir, 2, 2).await;

    let results = train_group(&dir, 2, 4).await;
    for (summary, _) in &results {
        assert_eq!(summary.resumed_from, 2);
        let epochs: Vec<u64> = summary.epochs.iter().map(|r| r.epoch).collect();
        assert_eq!(epochs, vec![3, 4]);
    }
    assert_eq!(results[0].1, results[1].1);
}

#[tokio::test]
async fn test_barrier_waits_for_every_rank() {
    let dir = TempDir::new().unwrap();
    let managers = ClusterManager::in_process_group(3, &cluster_config(&dir)).unwrap();

    let handles: Vec<_> = managers
        .into_iter()
        .map(|mut manager| {
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(50 * manager.rank() as u64)).await;
                manager.barrier().await
            })
        })
        .collect();

    for handle in handles {
        handle.await.unwrap().unwrap();
    }
}
