use anyhow::{Context, Result, anyhow};
use clap::{Parser, Subcommand, ValueEnum};
use durable_instance_store::{
    CommandKind, FailurePhase, InMemoryStoreConnector, InstanceLockedRetryPolicy, InstanceStore,
    LockOwnerOptions, RegistrationCache, StoreConfig, StoreError,
};
use rand::Rng;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "durable-instance-store")]
#[command(about = "Lease and lock retry tooling for the durable instance store")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run several hosts against one in-memory store and report contention.
    Simulate(SimulateArgs),
    /// Print the effective configuration as JSON.
    Config {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[derive(clap::Args)]
struct SimulateArgs {
    #[arg(long, default_value_t = 3)]
    hosts: usize,
    #[arg(long, default_value_t = 8)]
    instances: usize,
    #[arg(long, default_value_t = 10)]
    rounds: usize,
    #[arg(long, value_enum, default_value_t = RetryPolicyArg::Basic)]
    retry_policy: RetryPolicyArg,
    #[arg(long, default_value_t = 100)]
    retry_delay_ms: u64,
    /// Connection opens that fail with a transient network error.
    #[arg(long, default_value_t = 0)]
    transient_failures: usize,
    #[arg(long)]
    config: Option<PathBuf>,
}

#[derive(Clone, Copy, ValueEnum)]
enum RetryPolicyArg {
    None,
    Basic,
    Aggressive,
}

impl From<RetryPolicyArg> for InstanceLockedRetryPolicy {
    fn from(arg: RetryPolicyArg) -> Self {
        match arg {
            RetryPolicyArg::None => InstanceLockedRetryPolicy::NoRetry,
            RetryPolicyArg::Basic => InstanceLockedRetryPolicy::BasicRetry,
            RetryPolicyArg::Aggressive => InstanceLockedRetryPolicy::AggressiveRetry,
        }
    }
}

#[derive(Debug, Default)]
struct HostReport {
    host: usize,
    surrogate_owner_id: i64,
    loads: u64,
    saves: u64,
    contended: u64,
    failed: u64,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Command::Simulate(args) => simulate(args).await,
        Command::Config { config } => {
            let config = load_config(config.as_deref())?;
            println!("{}", serde_json::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<StoreConfig> {
    let Some(path) = path else {
        return Ok(StoreConfig::default());
    };
    let raw = fs::read_to_string(path)
        .with_context(|| format!("Failed to read config '{}'", path.display()))?;
    StoreConfig::from_json_str(&raw)
        .with_context(|| format!("Invalid config '{}'", path.display()))
}

async fn simulate(args: SimulateArgs) -> Result<()> {
    if args.hosts == 0 || args.instances == 0 {
        return Err(anyhow!("--hosts and --instances must be positive"));
    }

    let retry_delay = Duration::from_millis(args.retry_delay_ms.max(1));
    let config = load_config(args.config.as_deref())?
        .instance_locked_retry(args.retry_policy.into())
        .constant_retry_delay(retry_delay)
        .backoff((retry_delay / 10).max(Duration::from_millis(1)), retry_delay * 10)
        .connection_retry_delay(Duration::from_millis(50));
    config.validate()?;

    let connector = InMemoryStoreConnector::new();
    let instance_ids: Vec<Uuid> = (0..args.instances).map(|_| Uuid::new_v4()).collect();
    for instance_id in &instance_ids {
        connector.seed_instance(*instance_id, true)?;
    }
    for _ in 0..args.transient_failures {
        connector.fail_next_open(StoreError::TransientInfra {
            code: 53,
            phase: FailurePhase::Open,
            message: "network path was not found".to_string(),
        })?;
    }

    let registrations = Arc::new(RegistrationCache::new());
    let mut stores = Vec::with_capacity(args.hosts);
    for host in 0..args.hosts {
        let store = InstanceStore::new(Arc::new(connector.clone()), config.clone())?
            .with_registration_cache(registrations.clone());
        let owner = store
            .create_lock_owner(
                LockOwnerOptions::new()
                    .detect_runnable(true)
                    .host_type("simulation"),
                store.default_timeout(),
            )
            .await
            .with_context(|| format!("host {} could not create a lock owner", host))?;
        info!(host, surrogate_owner_id = owner.surrogate_owner_id, "host started");
        stores.push(Arc::new(store));
    }

    let instance_ids = Arc::new(instance_ids);
    let mut workers = Vec::with_capacity(stores.len());
    for (host, store) in stores.iter().enumerate() {
        let store = store.clone();
        let instance_ids = instance_ids.clone();
        let rounds = args.rounds;
        workers.push(tokio::spawn(async move {
            run_host(host, store, instance_ids, rounds).await
        }));
    }

    let mut reports = Vec::with_capacity(workers.len());
    for worker in workers {
        reports.push(worker.await.context("host worker panicked")?);
    }

    let open_handles: usize = stores.iter().map(|store| store.registry().live_count()).sum();
    for store in &stores {
        store.delete_lock_owner(store.default_timeout()).await?;
    }
    let owners_left = match stores.first() {
        Some(store) => store.owners_exist_in_store(store.default_timeout()).await?,
        None => false,
    };

    for report in &reports {
        println!(
            "host {:>2} (owner {:>2}): loads={} saves={} contended={} failed={}",
            report.host,
            report.surrogate_owner_id,
            report.loads,
            report.saves,
            report.contended,
            report.failed
        );
    }
    println!(
        "store: lease renewals={} recoveries={} detections={} unlocks={}",
        connector.call_count(CommandKind::ExtendLock),
        connector.call_count(CommandKind::RecoverInstanceLocks),
        connector.call_count(CommandKind::DetectRunnableInstances),
        connector.unlocked().len()
    );
    println!(
        "after shutdown: handles open before delete={} owners left in store={}",
        open_handles, owners_left
    );
    Ok(())
}

async fn run_host(
    host: usize,
    store: Arc<InstanceStore>,
    instance_ids: Arc<Vec<Uuid>>,
    rounds: usize,
) -> HostReport {
    let mut report = HostReport {
        host,
        surrogate_owner_id: store
            .owner()
            .map(|owner| owner.surrogate_owner_id)
            .unwrap_or_default(),
        ..HostReport::default()
    };
    let timeout = Duration::from_secs(2);

    for _ in 0..rounds {
        let instance_id = instance_ids[rand::rng().random_range(0..instance_ids.len())];
        let handle = match store.open_instance_handle() {
            Ok(handle) => handle,
            Err(err) => {
                warn!(host, error = %err, "could not open handle");
                report.failed += 1;
                continue;
            }
        };

        let version = match store.load_instance(&handle, instance_id, None, timeout).await {
            Ok(outcome) => outcome.instance_version.unwrap_or_default(),
            Err(err) if err.is_contention() => {
                report.contended += 1;
                continue;
            }
            Err(err) => {
                warn!(host, error = %err, "load failed");
                report.failed += 1;
                continue;
            }
        };
        report.loads += 1;

        match store
            .save_instance(&handle, instance_id, version, true, None, timeout)
            .await
        {
            Ok(_) => report.saves += 1,
            Err(err) => {
                warn!(host, error = %err, "save failed");
                report.failed += 1;
            }
        }
        // Hold the lock briefly so other hosts contend for it.
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(handle);
    }
    report
}
