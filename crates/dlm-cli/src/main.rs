//! Lock manager contention simulator
//!
//! The `dlm-sim` binary starts an in-process cluster and runs a randomized
//! workload of concurrent transactions against a small object hierarchy, so
//! that prefix conflicts, multi-host requests and deadlocks all occur. While
//! the workload runs, lock tables are sampled for conflicting holders.
//!
//! # Usage
//!
//! ```bash
//! # 3 hosts, 200 transactions
//! dlm-sim --hosts 3 --txns 200
//!
//! # Abort deadlock victims instead of surrendering
//! dlm-sim --abort-on-deadlock
//!
//! # Use a configuration file
//! dlm-sim --config dlm.toml
//! ```

use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use clap::Parser;
use tokio::task::JoinSet;
use tokio::time::timeout;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use dlm_common::config::DlmConfig;
use dlm_core::{Cluster, LockReply, TxnOptions};
use dlm_test::workload::Workload;

/// Distributed lock manager simulator
#[derive(Parser, Debug)]
#[command(
    name = "dlm-sim",
    author,
    version,
    about = "Runs a contention workload against an in-process lock manager cluster"
)]
struct Args {
    /// Configuration file path
    #[arg(short = 'c', long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Number of hosts (ignored with --config)
    #[arg(long, default_value_t = 3, env = "DLM_HOSTS")]
    hosts: u64,

    /// Number of transactions to run
    #[arg(short = 'n', long, default_value_t = 100)]
    txns: usize,

    /// Lock requests per transaction
    #[arg(long, default_value_t = 4)]
    locks_per_txn: usize,

    /// Tables per database in the object hierarchy
    #[arg(long, default_value_t = 3)]
    tables: usize,

    /// Keys per table in the object hierarchy
    #[arg(long, default_value_t = 4)]
    keys: usize,

    /// Percentage of requests asking for write locks
    #[arg(long, default_value_t = 50)]
    write_pct: u32,

    /// Percentage of requests spanning two hosts
    #[arg(long, default_value_t = 20)]
    multi_host_pct: u32,

    /// Microseconds each transaction holds its locks before ending
    #[arg(long, default_value_t = 200)]
    hold_us: u64,

    /// Abort deadlock victims instead of surrendering
    #[arg(long)]
    abort_on_deadlock: bool,

    /// Give up if the workload makes no progress for this many seconds
    #[arg(long, default_value_t = 30)]
    stall_secs: u64,

    /// Random seed
    #[arg(long, default_value_t = 7)]
    seed: u64,

    /// Enable verbose logging
    #[arg(short = 'v', long)]
    verbose: bool,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info", env = "DLM_LOG_LEVEL")]
    log_level: String,

    /// Print configuration and exit
    #[arg(long)]
    print_config: bool,
}

#[derive(Debug, Default)]
struct Outcome {
    completed: usize,
    aborted: usize,
    deadlocks: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    init_logging(&args);

    let config = load_config(&args)?;

    if args.print_config {
        println!("{}", config.to_toml()?);
        return Ok(());
    }

    run_workload(&args, config).await
}

fn init_logging(args: &Args) {
    let level = if args.verbose {
        "debug"
    } else {
        args.log_level.as_str()
    };

    let filter = EnvFilter::try_new(format!(
        "dlm_sim={level},dlm_core={level},dlm_common={level}"
    ))
    .unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();
}

fn load_config(args: &Args) -> Result<DlmConfig> {
    let mut config = if let Some(path) = &args.config {
        DlmConfig::from_file(path).context("Failed to load config file")?
    } else {
        DlmConfig::with_hosts(1..=args.hosts.max(1))
    };

    if args.abort_on_deadlock {
        config.txn.abort_on_deadlock = true;
    }

    config.validate().context("Invalid configuration")?;
    Ok(config)
}

fn build_workload(args: &Args) -> Workload {
    Workload {
        seed: args.seed,
        txns: args.txns,
        locks_per_txn: args.locks_per_txn,
        tables: args.tables,
        keys: args.keys,
        write_ratio: f64::from(args.write_pct.min(100)) / 100.0,
        multi_host_ratio: f64::from(args.multi_host_pct.min(100)) / 100.0,
        max_hold: Duration::from_micros(args.hold_us),
    }
}

async fn run_workload(args: &Args, config: DlmConfig) -> Result<()> {
    let cluster = Arc::new(Cluster::start(config).context("Failed to start cluster")?);
    let hosts = cluster.hosts();
    let workload = build_workload(args);
    let plan = workload.plan(&hosts).context("Failed to generate workload")?;

    info!("Simulation configuration:");
    info!("  Hosts: {}", hosts.len());
    info!("  Transactions: {}", plan.len());
    info!("  Objects: {}", workload.objects()?.len());
    info!("  Abort on deadlock: {}", cluster.config().txn.abort_on_deadlock);

    let started = Instant::now();
    let mut workers = JoinSet::new();
    for planned in plan {
        let manager = cluster.node(planned.home)?;
        workers.spawn(async move {
            let txn = manager.begin(planned.client, TxnOptions::new());
            let mut reply = None;
            for spec in planned.specs {
                let r = txn.lock(spec).await?;
                let aborted = !r.is_ok();
                reply = Some(r);
                if aborted {
                    break;
                }
            }
            tokio::time::sleep(planned.hold).await;
            manager.end_transaction(&txn).await?;
            Ok::<_, dlm_common::DlmError>(reply)
        });
    }

    let monitor = {
        let cluster = Arc::clone(&cluster);
        tokio::spawn(async move { sample_exclusion(&cluster).await })
    };

    let stall = Duration::from_secs(args.stall_secs);
    let mut outcome = Outcome::default();
    loop {
        let next = match timeout(stall, workers.join_next()).await {
            Ok(Some(joined)) => joined.context("Transaction task panicked")?,
            Ok(None) => break,
            Err(_) => {
                monitor.abort();
                bail!(
                    "no transaction finished for {:?}; {} still running",
                    stall,
                    workers.len()
                );
            }
        };
        match next? {
            Some(LockReply::HaveNone { deadlocks }) => {
                outcome.aborted += 1;
                outcome.deadlocks += deadlocks.len();
            }
            Some(LockReply::Ok { deadlocks }) => {
                outcome.completed += 1;
                outcome.deadlocks += deadlocks.len();
            }
            None => outcome.completed += 1,
        }
    }
    monitor.abort();
    let elapsed = started.elapsed();

    let violations = match monitor.await {
        Ok(found) => found,
        Err(e) if e.is_cancelled() => 0,
        Err(e) => return Err(e).context("Exclusion monitor failed"),
    };

    info!("Workload finished in {:?}", elapsed);
    info!("  Completed: {}", outcome.completed);
    info!("  Aborted: {}", outcome.aborted);
    info!("  Deadlock entries reported: {}", outcome.deadlocks);

    let stats = cluster.stats();
    info!("Transaction statistics:");
    info!("  Started: {}", stats.started.load(Ordering::Relaxed));
    info!("  Ended: {}", stats.ended.load(Ordering::Relaxed));
    info!("  Cycles confirmed: {}", stats.deadlocks.load(Ordering::Relaxed));
    info!("  Surrenders: {}", stats.surrenders.load(Ordering::Relaxed));

    let mut leftover = 0;
    for &host in &hosts {
        let snapshot = cluster.snapshot(host).await?;
        let s = snapshot.stats;
        info!(
            "  {}: grants={} waits={} releases={} upgrades={} cancels={} surrenders={}",
            host, s.grants, s.waits, s.releases, s.upgrades, s.cancels, s.surrenders
        );
        leftover += snapshot.entries.len();
    }

    if leftover > 0 {
        warn!("{} lock entries remain after all transactions ended", leftover);
    }
    if violations > 0 {
        bail!("observed {} conflicting holder pairs", violations);
    }

    match Arc::try_unwrap(cluster) {
        Ok(cluster) => cluster.shutdown().await,
        Err(_) => warn!("Cluster still referenced, skipping shutdown"),
    }
    Ok(())
}

/// Samples every lock table until cancelled and counts conflicting holders.
async fn sample_exclusion(cluster: &Cluster) -> usize {
    let mut violations = 0;
    loop {
        for host in cluster.hosts() {
            match cluster.snapshot(host).await {
                Ok(snapshot) => {
                    for (a, a_oid, b, b_oid) in snapshot.conflicting_holders() {
                        warn!(%host, %a, %a_oid, %b, %b_oid, "conflicting holders");
                        violations += 1;
                    }
                }
                Err(e) => {
                    warn!(%host, error = %e, "snapshot failed");
                    return violations;
                }
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
