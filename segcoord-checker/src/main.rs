//! segcoord Checker
//!
//! - `check`: load a cluster fixture, run one segment check, print the tasks
//! - `simulate`: run observer, controller and a local executor against the
//!   fixture until nothing is left to do

use anyhow::Context;
use clap::{Parser, Subcommand};
use segcoord_checker::{
    BalancerKind, Checker, CheckerConfig, CheckerController, Cluster, ClusterSpec, LocalExecutor,
    SegmentChecker, TargetObserver,
};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::signal;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

#[derive(Parser)]
#[command(name = "segcoord-checker")]
#[command(about = "Reconciles segment placement against the desired target")]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Check interval in milliseconds
    #[arg(long, global = true)]
    check_interval_ms: Option<u64>,

    /// Placement strategy (round_robin, score_based)
    #[arg(long, global = true)]
    balancer: Option<BalancerKind>,

    /// Prometheus exporter port, 0 disables it
    #[arg(long, global = true)]
    metrics_port: Option<u16>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run one check pass and print the tasks as JSON
    Check {
        /// Cluster fixture (JSON)
        #[arg(long)]
        cluster: PathBuf,

        /// Pretty-print the output
        #[arg(long)]
        pretty: bool,
    },

    /// Apply tasks locally until the cluster converges
    Simulate {
        /// Cluster fixture (JSON)
        #[arg(long)]
        cluster: PathBuf,

        /// Give up after this many rounds
        #[arg(long, default_value = "50")]
        max_rounds: u32,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Priority: CLI args > SEGCOORD_* env > config file > defaults
    let config = match &cli.config {
        Some(path) => CheckerConfig::from_file(path)
            .with_context(|| format!("loading config {}", path.display()))?,
        None => CheckerConfig::default(),
    }
    .with_env_overrides()
    .with_overrides(cli.check_interval_ms, cli.balancer, cli.metrics_port);
    config.validate()?;

    let level = if cli.verbose {
        "debug".to_string()
    } else {
        config.log_level.clone()
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level)),
        )
        .with_writer(std::io::stderr)
        .with_target(true)
        .init();

    if config.metrics_port != 0 {
        segcoord_checker::metrics::init_exporter(config.metrics_port)?;
    }

    match cli.command {
        Command::Check { cluster, pretty } => run_check(&config, &cluster, pretty).await,
        Command::Simulate {
            cluster,
            max_rounds,
        } => run_simulate(&config, &cluster, max_rounds).await,
    }
}

async fn load_cluster(config: &CheckerConfig, path: &Path) -> anyhow::Result<(Cluster, bool)> {
    let spec = ClusterSpec::from_file(path)
        .with_context(|| format!("loading cluster {}", path.display()))?;
    let cluster = Cluster::from_spec(&spec, config.target_config())?;
    cluster
        .refresh_targets(spec.promote, &CancellationToken::new())
        .await?;
    Ok((cluster, spec.promote))
}

fn segment_checker(config: &CheckerConfig, cluster: &Cluster) -> SegmentChecker {
    SegmentChecker::new(
        cluster.topology.clone(),
        cluster.dist.clone(),
        cluster.targets.clone(),
        config.balancer.build(cluster.dist.clone()),
    )
}

async fn run_check(config: &CheckerConfig, path: &Path, pretty: bool) -> anyhow::Result<()> {
    let (cluster, _) = load_cluster(config, path).await?;
    let tasks = segment_checker(config, &cluster).check(&CancellationToken::new());

    let out = if pretty {
        serde_json::to_string_pretty(&tasks)?
    } else {
        serde_json::to_string(&tasks)?
    };
    println!("{}", out);
    Ok(())
}

async fn run_simulate(config: &CheckerConfig, path: &Path, max_rounds: u32) -> anyhow::Result<()> {
    let (cluster, promoted) = load_cluster(config, path).await?;
    let cancel = CancellationToken::new();

    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if signal::ctrl_c().await.is_ok() {
                info!("Shutdown signal received");
                cancel.cancel();
            }
        }
    });

    let executor = Arc::new(LocalExecutor::new(
        cluster.topology.clone(),
        cluster.dist.clone(),
        cluster.targets.clone(),
    ));
    if promoted {
        for collection_id in cluster.topology.collections.get_all() {
            let version = cluster.targets.get_collection_target_version(collection_id);
            executor.sync_target_version(collection_id, version);
        }
    }

    let observer = TargetObserver::new(
        cluster.topology.clone(),
        cluster.dist.clone(),
        cluster.targets.clone(),
        config.target_refresh_interval(),
    )
    .with_listener(executor.clone());

    let (tx, mut rx) = mpsc::channel(config.task_channel_capacity);
    let checker: Arc<dyn Checker> = Arc::new(segment_checker(config, &cluster));
    let controller = CheckerController::new(config.check_interval(), tx).with_checker(checker);

    let (applied_tx, mut applied_rx) = watch::channel(0usize);
    let consumer = tokio::spawn({
        let executor = executor.clone();
        async move {
            while let Some(task) = rx.recv().await {
                if let Err(e) = executor.apply(&task) {
                    warn!(%task, error = %e, "Task failed");
                }
                applied_tx.send_modify(|n| *n += 1);
            }
        }
    });

    let mut dispatched_total = 0;
    let mut converged = false;
    let mut rounds = 0;

    while rounds < max_rounds && !cancel.is_cancelled() {
        rounds += 1;

        let observed = observer.observe_once(&cancel).await;
        let Some(dispatched) = controller.check_once(&cancel).await else {
            break;
        };
        dispatched_total += dispatched;
        info!(
            round = rounds,
            dispatched,
            promoted = observed.promoted.len(),
            refresh_failures = observed.failed.len(),
            "Round complete"
        );

        if dispatched == 0 && observed.promoted.is_empty() {
            converged = true;
            break;
        }

        // Let the executor drain this round before looking again
        tokio::select! {
            _ = cancel.cancelled() => break,
            drained = applied_rx.wait_for(|n| *n >= dispatched_total) => {
                drained.map(|_| ())?;
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(config.check_interval()) => {}
        }
    }

    drop(controller);
    consumer.await?;

    if converged {
        info!(rounds, tasks = dispatched_total, "Cluster converged");
    } else {
        warn!(rounds, tasks = dispatched_total, "Stopped before convergence");
    }
    Ok(())
}
