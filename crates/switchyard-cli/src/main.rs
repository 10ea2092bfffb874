//! Switchyard CLI - operate watches, the ingestion queue and bandit snapshots

mod pipeline;

use clap::{Parser, Subcommand};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use switchyard_core::bandit::{Arm, Context, PolicyKind, PolicySpec};
use switchyard_core::config::{Config, ConfigSource, EnvConfig, LayeredConfig, SharedConfig};
use switchyard_core::metrics::{self, TracingMetrics};
use switchyard_core::queue::{JobQueue, JobStatus, NewJob};
use switchyard_core::scheduler::{DirectoryConnector, Scheduler, WatchStore};
use switchyard_core::storage::{Database, DatabaseConfig, SnapshotStore};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::pipeline::LogPipeline;

#[derive(Parser)]
#[command(name = "switchyard")]
#[command(author, version, about = "Bandit routing and durable ingestion scheduling", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Database file (overrides [storage] database_path)
    #[arg(long, global = true)]
    db: Option<PathBuf>,

    /// Quiet mode (minimal output)
    #[arg(short, long, global = true)]
    quiet: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Configuration management
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },

    /// Manage discovery watches
    Watch {
        #[command(subcommand)]
        action: WatchAction,
    },

    /// Inspect and operate the ingestion queue
    Queue {
        #[command(subcommand)]
        action: QueueAction,
    },

    /// Poll watches
    Scheduler {
        #[command(subcommand)]
        action: SchedulerAction,
    },

    /// Process queued jobs
    Worker {
        #[command(subcommand)]
        action: WorkerAction,
    },

    /// Bandit policy tools
    Policy {
        #[command(subcommand)]
        action: PolicyAction,
    },

    /// Run health check
    Doctor,
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Get a configuration value
    Get { key: String },
    /// Set a configuration value
    Set { key: String, value: String },
    /// List all configuration values
    List,
    /// Reset configuration to defaults
    Reset,
    /// Show config file path
    Path,
}

#[derive(Subcommand)]
enum WatchAction {
    /// Register a discovery source
    Add {
        tenant: String,
        workspace: String,
        /// Source handle (a directory for the `fs` source)
        handle: String,
        #[arg(short, long, default_value = "fs")]
        source: String,
        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },
    /// List watches
    List {
        #[arg(short, long)]
        tenant: Option<String>,
    },
    /// Stop polling a watch
    Disable { id: i64 },
}

#[derive(Subcommand)]
enum QueueAction {
    /// Enqueue a job by hand
    Enqueue {
        tenant: String,
        workspace: String,
        external_id: String,
        #[arg(short, long, default_value = "manual")]
        source: String,
        #[arg(long)]
        url: Option<String>,
        #[arg(short, long, default_value_t = 0)]
        priority: i64,
        /// JSON metadata
        #[arg(long)]
        meta: Option<String>,
    },
    /// Show job counts for a tenant/workspace
    Stats { tenant: String, workspace: String },
    /// List jobs in claim order
    List {
        tenant: String,
        workspace: String,
        #[arg(short, long)]
        status: Option<String>,
        #[arg(short, long, default_value_t = 20)]
        limit: u32,
    },
    /// Give permanently failed jobs a fresh retry budget
    RequeueFailed { tenant: String, workspace: String },
}

#[derive(Subcommand)]
enum SchedulerAction {
    /// Poll every due watch once
    Tick,
    /// Tick and drain the queue until Ctrl-C
    Run {
        #[arg(short, long)]
        worker: Option<String>,
        /// Poll interval in seconds
        #[arg(short, long)]
        interval: Option<u64>,
    },
}

#[derive(Subcommand)]
enum WorkerAction {
    /// Lease and process a single job
    RunOnce {
        #[arg(short, long)]
        worker: Option<String>,
    },
}

#[derive(Subcommand)]
enum PolicyAction {
    /// Offline run against Bernoulli arms, printing selection shares
    Simulate {
        /// Policy kind (epsilon_greedy, thompson, ucb1, lin_ucb, doubly_robust)
        kind: String,
        #[arg(long, value_delimiter = ',', required = true)]
        arms: Vec<String>,
        #[arg(long, default_value_t = 1000)]
        rounds: u32,
        /// Success probability per arm (default: spread over 0.2..0.8)
        #[arg(long, value_delimiter = ',')]
        rates: Option<Vec<f64>>,
        #[arg(long, default_value_t = 7)]
        seed: u64,
    },
    /// Print stored snapshots for a domain
    Show {
        domain: String,
        #[arg(short, long)]
        tenant: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();

    let directive = if cli.quiet { "switchyard=warn" } else { "switchyard=info" };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    match cli.command {
        Commands::Config { action } => cmd_config(action, cli.quiet),
        Commands::Watch { action } => cmd_watch(cli.db, action, cli.quiet).await,
        Commands::Queue { action } => cmd_queue(cli.db, action, cli.quiet).await,
        Commands::Scheduler { action } => cmd_scheduler(cli.db, action, cli.quiet).await,
        Commands::Worker { action } => cmd_worker(cli.db, action, cli.quiet).await,
        Commands::Policy { action } => cmd_policy(cli.db, action, cli.quiet).await,
        Commands::Doctor => cmd_doctor(cli.db, cli.quiet).await,
    }
}

// ============================================================================
// Shared setup
// ============================================================================

fn database_config(db: Option<PathBuf>, config: &Config) -> DatabaseConfig {
    match db {
        Some(path) => DatabaseConfig::with_path(path),
        None => DatabaseConfig::from_storage(&config.storage),
    }
}

async fn open_db(db: Option<PathBuf>, config: &Config) -> anyhow::Result<Database> {
    Database::new(database_config(db, config)).await
}

/// Environment first, then the config file
fn live_config(config: &Config) -> Arc<dyn ConfigSource> {
    Arc::new(
        LayeredConfig::new()
            .with_layer(Arc::new(EnvConfig::default()))
            .with_layer(Arc::new(SharedConfig::new(config.clone()))),
    )
}

fn build_scheduler(db: &Database, config: &Config) -> anyhow::Result<Scheduler> {
    let queue = JobQueue::with_config(db.pool().clone(), &config.queue)?;
    Ok(Scheduler::new(db, queue)
        .with_config(live_config(config))
        .with_metrics(Arc::new(TracingMetrics))
        .with_connector(Arc::new(DirectoryConnector::new()))
        .with_pipeline(Arc::new(LogPipeline)))
}

fn worker_id(worker: Option<String>) -> String {
    worker.unwrap_or_else(|| format!("cli-{}", &uuid::Uuid::new_v4().simple().to_string()[..8]))
}

// ============================================================================
// Command Implementations
// ============================================================================

fn cmd_config(action: ConfigAction, quiet: bool) -> anyhow::Result<()> {
    match action {
        ConfigAction::Get { key } => {
            let config = Config::load()?;
            let value = config.get(&key)?;
            println!("{}", value);
        }
        ConfigAction::Set { key, value } => {
            let mut config = Config::load()?;
            config.set(&key, &value)?;
            config.save()?;
            if !quiet {
                println!("Set {} = {}", key, value);
            }
        }
        ConfigAction::List => {
            let config = Config::load()?;
            for (key, value) in config.list()? {
                println!("{} = {}", key, value);
            }
        }
        ConfigAction::Reset => {
            Config::reset()?;
            if !quiet {
                println!("Configuration reset to defaults.");
            }
        }
        ConfigAction::Path => {
            let path = Config::config_path()?;
            println!("{}", path.display());
        }
    }
    Ok(())
}

async fn cmd_watch(db: Option<PathBuf>, action: WatchAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = open_db(db, &config).await?;

    match action {
        WatchAction::Add {
            tenant,
            workspace,
            handle,
            source,
            interval,
        } => {
            let scheduler = build_scheduler(&db, &config)?;
            let watch = match interval {
                Some(secs) => {
                    scheduler
                        .add_watch_with_interval(&tenant, &workspace, &source, &handle, secs)
                        .await?
                }
                None => scheduler.add_watch(&tenant, &workspace, &source, &handle).await?,
            };
            if quiet {
                println!("{}", watch.id);
            } else {
                println!("Watch {} registered.", watch.id);
                println!("  Scope: {}/{}", watch.tenant, watch.workspace);
                println!("  Source: {} {}", watch.source_type, watch.handle);
                println!("  Interval: {}s", watch.interval_secs);
            }
        }
        WatchAction::List { tenant } => {
            let watches = WatchStore::new(db.pool().clone())
                .list(tenant.as_deref())
                .await?;
            if watches.is_empty() {
                if !quiet {
                    println!("No watches found.");
                    println!("\nAdd one with: switchyard watch add <tenant> <workspace> <handle>");
                }
            } else {
                for w in watches {
                    let state = if w.enabled { "" } else { " [disabled]" };
                    let polled = w
                        .last_polled_at
                        .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
                        .unwrap_or_else(|| "never".to_string());
                    println!(
                        "  {} - {}/{} {} {} (every {}s, last poll {}){}",
                        w.id, w.tenant, w.workspace, w.source_type, w.handle, w.interval_secs, polled, state
                    );
                }
            }
        }
        WatchAction::Disable { id } => {
            WatchStore::new(db.pool().clone())
                .set_enabled(id, false)
                .await?;
            if !quiet {
                println!("Watch {} disabled.", id);
            }
        }
    }
    Ok(())
}

async fn cmd_queue(db: Option<PathBuf>, action: QueueAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = open_db(db, &config).await?;
    let queue = JobQueue::with_config(db.pool().clone(), &config.queue)?;

    match action {
        QueueAction::Enqueue {
            tenant,
            workspace,
            external_id,
            source,
            url,
            priority,
            meta,
        } => {
            let mut job = NewJob::new(tenant, workspace, source, external_id).with_priority(priority);
            if let Some(url) = url {
                job = job.with_url(url);
            }
            if let Some(meta) = meta {
                job = job.with_metadata(serde_json::from_str(&meta)?);
            }
            let result = queue.enqueue(&job).await?;
            if quiet {
                println!("{}", result.job_id);
            } else if result.inserted {
                println!("Enqueued job {}.", result.job_id);
            } else {
                println!("Job already queued as {}.", result.job_id);
            }
        }
        QueueAction::Stats { tenant, workspace } => {
            let counts = queue.status_counts(&tenant, &workspace).await?;
            println!("Queue {}/{}", tenant, workspace);
            println!("  backlog: {}", counts.pending);
            println!("  running: {}", counts.running);
            println!("  done:    {}", counts.done);
            println!("  failed:  {}", counts.failed);
            if !quiet {
                println!("  total:   {}", counts.total());
            }
        }
        QueueAction::List {
            tenant,
            workspace,
            status,
            limit,
        } => {
            let status = status.map(|s| s.parse::<JobStatus>()).transpose()?;
            let jobs = queue.list(&tenant, &workspace, status, limit).await?;
            if jobs.is_empty() {
                if !quiet {
                    println!("No jobs found.");
                }
            } else {
                for j in jobs {
                    let error = j
                        .last_error
                        .as_deref()
                        .map(|e| format!(" - {}", e))
                        .unwrap_or_default();
                    println!(
                        "  {} [{}] p{} x{} {}{}",
                        j.id, j.status, j.priority, j.attempts, j.external_id, error
                    );
                }
            }
        }
        QueueAction::RequeueFailed { tenant, workspace } => {
            let count = queue.requeue_failed(&tenant, &workspace).await?;
            println!("Requeued {} failed job(s).", count);
        }
    }
    Ok(())
}

async fn cmd_scheduler(db: Option<PathBuf>, action: SchedulerAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = open_db(db, &config).await?;
    let scheduler = build_scheduler(&db, &config)?;

    match action {
        SchedulerAction::Tick => {
            let enqueued = scheduler.tick().await?;
            println!("Enqueued {} new job(s).", enqueued);
        }
        SchedulerAction::Run { worker, interval } => {
            let worker = worker_id(worker);
            let interval = Duration::from_secs(interval.unwrap_or(config.scheduler.poll_interval_secs));
            let cancel = CancellationToken::new();

            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    on_signal.cancel();
                }
            });

            if !quiet {
                println!("Scheduler running as {} (Ctrl-C to stop)...", worker);
            }
            scheduler.run(&worker, interval, cancel).await?;
        }
    }
    Ok(())
}

async fn cmd_worker(db: Option<PathBuf>, action: WorkerAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;
    let db = open_db(db, &config).await?;
    let scheduler = build_scheduler(&db, &config)?;

    match action {
        WorkerAction::RunOnce { worker } => {
            let worker = worker_id(worker);
            match scheduler.worker_run_once(&worker).await? {
                Some(report) => {
                    println!("Job {} ({}) -> {}", report.job_id, report.external_id, report.status);
                    if !quiet {
                        println!("  Attempt: {}", report.attempts);
                        println!("  Elapsed: {}ms", report.elapsed.as_millis());
                    }
                }
                None => println!("No jobs available."),
            }
        }
    }
    Ok(())
}

/// Evenly spread success rates over 0.2..0.8
fn default_rates(n: usize) -> Vec<f64> {
    if n < 2 {
        return vec![0.5; n];
    }
    (0..n)
        .map(|i| 0.2 + 0.6 * i as f64 / (n - 1) as f64)
        .collect()
}

async fn cmd_policy(db: Option<PathBuf>, action: PolicyAction, quiet: bool) -> anyhow::Result<()> {
    let config = Config::load()?;

    match action {
        PolicyAction::Simulate {
            kind,
            arms,
            rounds,
            rates,
            seed,
        } => {
            let kind: PolicyKind = kind.parse()?;
            let arms: Vec<Arm> = arms.into_iter().filter(|a| !a.is_empty()).collect();
            if arms.is_empty() {
                anyhow::bail!("--arms must name at least one arm");
            }
            let rates = rates.unwrap_or_else(|| default_rates(arms.len()));
            if rates.len() != arms.len() {
                anyhow::bail!("--rates has {} values for {} arms", rates.len(), arms.len());
            }
            if rates.iter().any(|r| !(0.0..=1.0).contains(r)) {
                anyhow::bail!("--rates must be probabilities in [0, 1]");
            }

            let live = live_config(&config);
            let spec = PolicySpec::from_config(kind, live.as_ref(), None).with_seed(seed);
            let policy = spec.build(live, metrics::noop())?;
            let context = kind
                .is_contextual()
                .then(|| Context::dense(vec![1.0; spec.dimension]));

            let mut rng = StdRng::seed_from_u64(seed);
            let mut pulls = vec![0u64; arms.len()];
            let mut total_reward = 0.0;
            for _ in 0..rounds {
                let arm = policy.recommend(&arms, context.as_ref())?;
                let idx = arms.iter().position(|a| *a == arm).unwrap_or(0);
                pulls[idx] += 1;
                let reward = if rng.r#gen::<f64>() < rates[idx] { 1.0 } else { 0.0 };
                total_reward += reward;
                policy.update(&arm, reward, context.as_ref())?;
            }

            if !quiet {
                println!("Simulated {} over {} rounds (seed {})", kind, rounds, seed);
                println!("  {:<16} {:>6} {:>8} {:>7}", "arm", "rate", "pulls", "share");
            }
            for (i, arm) in arms.iter().enumerate() {
                let share = if rounds == 0 {
                    0.0
                } else {
                    100.0 * pulls[i] as f64 / rounds as f64
                };
                println!("  {:<16} {:>6.2} {:>8} {:>6.1}%", arm, rates[i], pulls[i], share);
            }
            if !quiet && rounds > 0 {
                println!("  mean reward: {:.3}", total_reward / rounds as f64);
            }
        }
        PolicyAction::Show { domain, tenant } => {
            let db = open_db(db, &config).await?;
            let store = SnapshotStore::new(db.pool().clone());
            let entries: Vec<_> = store
                .list(&domain)
                .await?
                .into_iter()
                .filter(|s| {
                    tenant
                        .as_deref()
                        .is_none_or(|t| s.key.tenant.as_deref() == Some(t))
                })
                .collect();
            if entries.is_empty() {
                anyhow::bail!("No snapshots stored for domain '{}'", domain);
            }
            for entry in entries {
                let Some(snapshot) = store.load(&entry.key).await? else {
                    continue;
                };
                println!(
                    "{} ({}, {} arms, updated {})",
                    entry.key, entry.policy_kind, entry.arm_count, entry.updated_at
                );
                println!("{}", serde_json::to_string_pretty(&snapshot)?);
            }
        }
    }
    Ok(())
}

async fn cmd_doctor(db: Option<PathBuf>, quiet: bool) -> anyhow::Result<()> {
    if !quiet {
        println!("Switchyard Health Check");
        println!("=======================");
        println!();
    }

    let mut all_ok = true;

    let config = match Config::load() {
        Ok(config) => {
            match config.validate() {
                Ok(()) => {
                    if !quiet {
                        println!("[OK] Configuration: Valid");
                    }
                }
                Err(e) => {
                    all_ok = false;
                    println!("[!!] Configuration: {}", e);
                }
            }
            config
        }
        Err(e) => {
            all_ok = false;
            println!("[!!] Configuration: Error - {}", e);
            Config::default()
        }
    };

    if !quiet {
        match Config::config_path() {
            Ok(path) if path.exists() => println!("[OK] Config file: {}", path.display()),
            Ok(path) => println!("[--] Config file: {} (using defaults)", path.display()),
            Err(e) => println!("[!!] Config file: Error - {}", e),
        }
        let live = live_config(&config);
        let enabled = live
            .get_bool(switchyard_core::config::keys::BANDIT_ENABLED)
            .unwrap_or(true);
        println!(
            "[--] Bandit routing: {}",
            if enabled { "enabled" } else { "disabled (kill switch)" }
        );
    }

    match open_db(db, &config).await {
        Ok(db) => match db.health_check().await {
            Ok(()) => {
                if !quiet {
                    println!("[OK] Database: Connected");
                    println!("     Path: {}", db.path().display());
                }
                match db.migration_status().await {
                    Ok(status) if status.needs_migration => {
                        all_ok = false;
                        println!(
                            "[!!] Database: Migrations pending (v{} -> v{})",
                            status.current_version, status.target_version
                        );
                    }
                    Ok(status) => {
                        if !quiet {
                            println!("[OK] Database: Schema v{}", status.current_version);
                        }
                    }
                    Err(e) => {
                        all_ok = false;
                        println!("[!!] Database: Migration check failed - {}", e);
                    }
                }
                if !quiet {
                    match SnapshotStore::new(db.pool().clone()).summary().await {
                        Ok(summary) => println!(
                            "     Snapshots: {} across {} domain(s), {} tenant(s)",
                            summary.snapshot_count, summary.domain_count, summary.tenant_count
                        ),
                        Err(e) => warn!(error = %e, "Failed to summarize snapshots"),
                    }
                    let watches = WatchStore::new(db.pool().clone())
                        .list(None)
                        .await
                        .unwrap_or_default();
                    println!("     Watches: {}", watches.len());
                }
            }
            Err(e) => {
                all_ok = false;
                println!("[!!] Database: Health check failed - {}", e);
            }
        },
        Err(e) => {
            all_ok = false;
            println!("[!!] Database: Failed to open - {}", e);
        }
    }

    if !quiet {
        println!();
        if all_ok {
            println!("All checks passed!");
        } else {
            println!("Some checks failed. See above for details.");
        }
    }
    info!(healthy = all_ok, "Doctor finished");

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_global_flags_after_subcommand() {
        let cli = Cli::try_parse_from([
            "switchyard", "queue", "stats", "t", "w", "--db", "/tmp/x.db", "-q",
        ])
        .unwrap();
        assert!(cli.quiet);
        assert_eq!(cli.db, Some(PathBuf::from("/tmp/x.db")));
        assert!(matches!(
            cli.command,
            Commands::Queue {
                action: QueueAction::Stats { .. }
            }
        ));
    }

    #[test]
    fn test_simulate_arms_are_comma_separated() {
        let cli = Cli::try_parse_from([
            "switchyard", "policy", "simulate", "ucb1", "--arms", "a,b,c", "--rounds", "10",
        ])
        .unwrap();
        let Commands::Policy {
            action: PolicyAction::Simulate { arms, rounds, .. },
        } = cli.command
        else {
            panic!("expected policy simulate");
        };
        assert_eq!(arms, vec!["a", "b", "c"]);
        assert_eq!(rounds, 10);
    }

    #[test]
    fn test_simulate_requires_arms() {
        assert!(Cli::try_parse_from(["switchyard", "policy", "simulate", "ucb1"]).is_err());
    }

    #[test]
    fn test_default_rates_spread() {
        assert_eq!(default_rates(1), vec![0.5]);
        let rates = default_rates(3);
        assert!((rates[0] - 0.2).abs() < 1e-12);
        assert!((rates[1] - 0.5).abs() < 1e-12);
        assert!((rates[2] - 0.8).abs() < 1e-12);
    }

    #[test]
    fn test_explicit_db_wins_over_config() {
        let config = Config::default();
        let db = database_config(Some(PathBuf::from("/tmp/explicit.db")), &config);
        assert_eq!(db.path, PathBuf::from("/tmp/explicit.db"));
    }
}
