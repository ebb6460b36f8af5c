//! meshtrain - Command Line Interface
//!
//! Thin shell over the `trainer` library for data-parallel training across a
//! small cluster of local machines.
//!
//! ## Commands
//!
//! ### Cluster
//! - `detect` - Show this device's hardware profile
//! - `discover` - Find peers on the LAN and optionally write a hostfile or roster
//! - `serve` - Answer discovery queries so a launcher can find this device
//!
//! ### Planning
//! - `suggest` - Estimate memory and suggest training settings for a model
//! - `batch-size` - Largest batch that fits a memory limit
//!
//! ### Training
//! - `train` - Train the built-in model on synthetic data
//! - `checkpoints` - List stored checkpoints
//! - `init-config` - Write the default configuration file

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::net::IpAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use trainer::checkpoint::CheckpointStore;
use trainer::collective::TcpRing;
use trainer::discovery::{ClusterRoster, DiscoveryService, DeviceInfo};
use trainer::observability::{init_production_logging, init_simple_logging};
use trainer::training::{InMemoryDataset, ModelOptions};
use trainer::{
    create_hostfile, detect_hardware, optimize_batch_size, suggest_config, ClusterManager, Dataset,
    Topology, TrainerConfig, TrainingOrchestrator,
};

const BYTES_PER_GB: f64 = (1u64 << 30) as f64;

/// meshtrain - distributed training coordination
#[derive(Parser, Debug)]
#[command(name = "meshtrain")]
#[command(about = "Discover devices, plan memory and coordinate data-parallel training", long_about = None)]
#[command(version)]
struct Cli {
    /// Configuration file (defaults to ~/.meshtrain/config.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Print machine-readable JSON instead of text
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show this device's hardware profile
    Detect,

    /// Find peers on the local network
    Discover {
        /// Listen window in milliseconds (overrides config)
        #[arg(short, long)]
        window_ms: Option<u64>,

        /// Write an MPI-style hostfile to this path
        #[arg(long)]
        hostfile: Option<PathBuf>,

        /// Save the roster as JSON for `train --roster`
        #[arg(long)]
        save_roster: Option<PathBuf>,
    },

    /// Answer discovery queries for a while
    Serve {
        /// How long to stay discoverable, in seconds
        #[arg(short, long, default_value = "60")]
        duration_secs: u64,
    },

    /// Estimate memory use and suggest training settings
    Suggest {
        /// Number of model parameters
        #[arg(short, long)]
        model_size: u64,

        /// Number of devices sharing the model
        #[arg(short, long, default_value = "1")]
        devices: usize,
    },

    /// Largest batch size that fits a memory limit
    BatchSize {
        /// Number of model parameters
        #[arg(short, long)]
        model_size: u64,

        /// Memory available per device in GB
        #[arg(short = 'g', long)]
        memory_gb: f64,
    },

    /// Train the built-in linear model on synthetic data
    Train {
        /// Number of synthetic samples (split across ranks)
        #[arg(long, default_value = "1024")]
        samples: usize,

        /// Input and output width of the model
        #[arg(long, default_value = "8")]
        features: usize,

        /// Comma-separated addresses of every rank, in rank order
        #[arg(long, value_delimiter = ',', conflicts_with = "roster")]
        peers: Vec<IpAddr>,

        /// Roster saved by `discover --save-roster`; its order is rank order
        #[arg(long)]
        roster: Option<PathBuf>,

        /// Log level (trace, debug, info, warn, error)
        #[arg(short, long)]
        log_level: Option<String>,
    },

    /// List stored checkpoints
    Checkpoints {
        /// Checkpoint directory (overrides config)
        #[arg(short, long)]
        dir: Option<PathBuf>,
    },

    /// Write the default configuration file
    InitConfig {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let config_path = match &cli.config {
        Some(path) => path.clone(),
        None => TrainerConfig::default_path()?,
    };

    match cli.command {
        Commands::Detect => {
            // No logging for detect (pure display)
            cmd_detect(cli.json)?;
        }

        Commands::Discover {
            window_ms,
            hostfile,
            save_roster,
        } => {
            let config = TrainerConfig::load_or_default(&config_path)?;
            init_simple_logging(&config.logging.level)?;
            cmd_discover(
                &config,
                window_ms,
                hostfile.as_deref(),
                save_roster.as_deref(),
                cli.json,
            )
            .await?;
        }

        Commands::Serve { duration_secs } => {
            let config = TrainerConfig::load_or_default(&config_path)?;
            init_simple_logging(&config.logging.level)?;
            cmd_serve(&config, Duration::from_secs(duration_secs)).await?;
        }

        Commands::Suggest {
            model_size,
            devices,
        } => {
            cmd_suggest(model_size, devices, cli.json)?;
        }

        Commands::BatchSize {
            model_size,
            memory_gb,
        } => {
            cmd_batch_size(model_size, memory_gb, cli.json)?;
        }

        Commands::Train {
            samples,
            features,
            peers,
            roster,
            log_level,
        } => {
            let config = TrainerConfig::load_or_default(&config_path)?;
            let level = log_level.unwrap_or_else(|| config.logging.level.clone());
            if config.logging.log_to_file {
                // Production logging with file rotation for long runs
                init_production_logging(&level, config.logging.log_dir.clone())?;
            } else {
                init_simple_logging(&level)?;
            }
            let roster = roster
                .map(|path| {
                    ClusterRoster::load(&path)
                        .with_context(|| format!("Failed to load roster {}", path.display()))
                })
                .transpose()?;
            cmd_train(&config, samples, features, peers, roster, cli.json).await?;
        }

        Commands::Checkpoints { dir } => {
            let config = TrainerConfig::load_or_default(&config_path)?;
            cmd_checkpoints(&config, dir, cli.json)?;
        }

        Commands::InitConfig { force } => {
            init_simple_logging("warn")?;
            cmd_init_config(&config_path, force)?;
        }
    }

    Ok(())
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

/// Show the local hardware profile
fn cmd_detect(json: bool) -> Result<()> {
    let profile = detect_hardware();
    if json {
        return print_json(&profile);
    }

    println!("🖥️  Hardware Profile\n");
    println!("   Device: {}", profile.device_type);
    println!("   Memory: {:.1} GB", profile.total_memory_gb);
    println!("   Compute: {:.1} TFLOPS", profile.total_tflops);
    println!("   Bandwidth: {:.0} GB/s", profile.memory_bandwidth_gbps);
    Ok(())
}

/// Run one discovery round
async fn cmd_discover(
    config: &TrainerConfig,
    window_ms: Option<u64>,
    hostfile: Option<&Path>,
    save_roster: Option<&Path>,
    json: bool,
) -> Result<()> {
    let mut discovery = config.discovery.clone();
    if let Some(window_ms) = window_ms {
        discovery.listen_window_ms = window_ms;
    }
    discovery.validate()?;

    if !json {
        println!("🔍 Discovering devices ({} ms)...\n", discovery.listen_window_ms);
    }

    let local = DeviceInfo::local(&detect_hardware());
    let service = DiscoveryService::open(discovery, local).await;
    let report = service.discover().await;
    service.close();

    if let Some(path) = hostfile {
        std::fs::write(path, create_hostfile(&report.roster) + "\n")
            .with_context(|| format!("Failed to write hostfile {}", path.display()))?;
    }
    if let Some(path) = save_roster {
        report
            .roster
            .save(path)
            .with_context(|| format!("Failed to write roster {}", path.display()))?;
    }

    if json {
        return print_json(&report);
    }

    for (rank, device) in report.roster.devices().iter().enumerate() {
        println!(
            "   [{}] {} ({}) - {}, {:.0} GB, {:?}",
            rank, device.hostname, device.address, device.device_type, device.memory_gb, device.status
        );
    }
    println!(
        "\n   {} device(s), {:.0} GB total",
        report.roster.len(),
        report.roster.total_memory_gb()
    );

    if report.local_only {
        println!("\n⚠️  Discovery socket unavailable, only the local device is listed");
    }
    for failure in &report.interface_failures {
        println!(
            "⚠️  Interface {} ({}) failed: {}",
            failure.interface, failure.address, failure.error
        );
    }
    if let Some(path) = hostfile {
        println!("\n✓ Hostfile written to: {}", path.display());
    }
    if let Some(path) = save_roster {
        println!("✓ Roster written to: {}", path.display());
    }
    Ok(())
}

/// Stay discoverable for `duration`
async fn cmd_serve(config: &TrainerConfig, duration: Duration) -> Result<()> {
    config.discovery.validate()?;

    let local = DeviceInfo::local(&detect_hardware());
    println!("📡 Answering discovery queries as {} for {:?}", local.hostname, duration);
    println!("   Press Ctrl+C to stop\n");

    let service = DiscoveryService::open(config.discovery.clone(), local).await;
    tokio::select! {
        result = service.serve(duration) => result?,
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("Received shutdown signal (Ctrl+C)");
        }
    }
    service.close();
    Ok(())
}

fn cmd_suggest(model_size: u64, devices: usize, json: bool) -> Result<()> {
    let budget = suggest_config(model_size, devices)?;
    if json {
        return print_json(&budget);
    }

    println!("🧮 Memory Budget ({} params on {} device(s))\n", model_size, devices);
    println!("   Estimated memory: {:.2} GB per device", budget.estimated_memory_gb);
    println!("   Batch size: {}", budget.suggested_batch_size);
    println!("   Gradient accumulation: {}", budget.gradient_accumulation);
    println!(
        "   Activation checkpointing: {}",
        if budget.activation_checkpointing { "on" } else { "off" }
    );
    Ok(())
}

fn cmd_batch_size(model_size: u64, memory_gb: f64, json: bool) -> Result<()> {
    if !(memory_gb.is_finite() && memory_gb >= 0.0) {
        anyhow::bail!("memory-gb must be a non-negative number");
    }
    let batch_size = optimize_batch_size(model_size, (memory_gb * BYTES_PER_GB) as u64)?;
    if json {
        return print_json(&serde_json::json!({ "batch_size": batch_size }));
    }
    println!("Batch size: {}", batch_size);
    Ok(())
}

/// Rank and size for a run over a saved roster. A launcher's rank is used
/// when set; otherwise this process launched the job and is rank 0.
fn roster_topology(roster: &ClusterRoster) -> Result<Topology> {
    let topology = match Topology::from_env()? {
        Some(launched) if launched.size != roster.len() => anyhow::bail!(
            "Launcher world size {} does not match the {} device(s) in the roster",
            launched.size,
            roster.len()
        ),
        Some(launched) => Topology::for_roster(roster, launched.rank)?,
        None => Topology::from_roster(roster),
    };
    Ok(topology)
}

/// Train the built-in model; multi-rank when a launcher set the topology
/// or a roster lists several devices
async fn cmd_train(
    config: &TrainerConfig,
    samples: usize,
    features: usize,
    peers: Vec<IpAddr>,
    roster: Option<ClusterRoster>,
    json: bool,
) -> Result<()> {
    config.validate()?;

    let topology = match &roster {
        Some(roster) => roster_topology(roster)?,
        None => Topology::from_env()?.unwrap_or_else(Topology::single),
    };
    let peers = if peers.is_empty() && !topology.is_distributed() {
        vec![IpAddr::from([127, 0, 0, 1])]
    } else {
        peers
    };

    let training = &config.training;
    let model = training.model.build(&ModelOptions {
        input_size: features,
        output_size: features,
    })?;
    let dataset = InMemoryDataset::synthetic(samples, features, 0.5, 0.1, training.batch_size)?
        .shard(topology.rank, topology.size)?;

    tracing::info!(
        rank = topology.rank,
        size = topology.size,
        samples = dataset.len(),
        model = %training.model,
        "Preparing training run"
    );

    let cluster = match &roster {
        Some(roster) => {
            ClusterManager::<TcpRing>::connect_roster(roster, topology.rank, &config.cluster)
                .await?
        }
        None => ClusterManager::<TcpRing>::connect(topology, &peers, &config.cluster).await?,
    };
    let mut orchestrator =
        TrainingOrchestrator::new(training.clone(), cluster, model, Box::new(dataset))?;
    let budget = orchestrator.memory_budget().clone();
    let summary = orchestrator.train_with_recovery().await?;

    if json {
        return print_json(&summary);
    }

    println!("\n📈 Training Summary (rank {} of {})\n", topology.rank, topology.size);
    println!("   Resumed from epoch: {}", summary.resumed_from);
    println!(
        "   Memory budget: {:.4} GB per device, suggested batch size {}",
        budget.estimated_memory_gb, budget.suggested_batch_size
    );
    if orchestrator.config().batch_size != training.batch_size {
        println!(
            "   Recovered with batch size {} (configured {})",
            orchestrator.config().batch_size,
            training.batch_size
        );
    }
    for report in &summary.epochs {
        println!(
            "   Epoch {:>3}: loss {:.6}, grad norm {:.3e}, {:.0} samples/s, {:?}",
            report.epoch, report.loss, report.grad_norm, report.samples_per_second, report.health
        );
    }
    if !summary.checkpoints.is_empty() {
        println!("\n   Checkpoints: {:?}", summary.checkpoints);
    }
    if summary.epochs.iter().any(|r| !r.replicas_in_sync) {
        println!("⚠️  Replica parameters diverged in at least one epoch");
    }
    if summary.degraded_reductions > 0 {
        println!("⚠️  {} reduction(s) fell back to local values", summary.degraded_reductions);
    }
    if summary.stopped_early {
        println!("\n✗ Stopped early after an unhealthy epoch");
    }
    Ok(())
}

fn cmd_checkpoints(config: &TrainerConfig, dir: Option<PathBuf>, json: bool) -> Result<()> {
    let mut checkpoint_config = config.cluster.checkpoint.clone();
    if let Some(dir) = dir {
        checkpoint_config.checkpoint_dir = dir;
    }
    let store = CheckpointStore::new(checkpoint_config);
    let epochs = store.list_epochs()?;

    if json {
        return print_json(&epochs);
    }

    println!("💾 Checkpoints in {}\n", store.checkpoint_dir().display());
    if epochs.is_empty() {
        println!("   (none)");
    }
    for epoch in epochs {
        println!("   epoch {:>4}  {}", epoch, store.path_for(epoch).display());
    }
    Ok(())
}

fn cmd_init_config(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!(
            "{} already exists (use --force to overwrite)",
            path.display()
        );
    }

    TrainerConfig::default().save(path)?;
    println!("✓ Generated default configuration at: {}", path.display());
    println!("\nEdit the configuration file and then start training with:");
    println!("  meshtrain --config {} train", path.display());
    Ok(())
}
