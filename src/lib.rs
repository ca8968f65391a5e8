//! Fuzzherd: supervise long-running fuzzers for many targets.

#[macro_use]
pub mod target_log;
pub mod archive;
pub mod backup;
pub mod cluster;
pub mod config;
pub mod fuzzer;
pub mod registry;
pub mod scheduler;
pub mod stats;
pub mod storage;
pub mod supervisor;
pub mod target;
pub mod util;
pub mod watcher;

use crate::{
    cluster::{docker::DockerCli, ClusterRuntime},
    config::Config,
    fuzzer::{Context, FuzzerFactory},
    registry::{Registry, RegistryError},
    scheduler::{scheduler, StatsAggregator},
    supervisor::Supervisor,
    target::Target,
    util::{blocking, setup_signal_handler},
};
use anyhow::Context as _;
use std::{
    fs::{create_dir_all, read_to_string},
    path::Path,
    sync::Arc,
    time::Duration,
};
use tokio::sync::{mpsc, watch};

pub type HashMap<K, V> = rustc_hash::FxHashMap<K, V>;
pub type HashSet<K> = rustc_hash::FxHashSet<K>;

/// How often the overall status is logged.
const STATUS_INTERVAL: Duration = Duration::from_secs(60);

pub fn boot(config: Config, targets: Option<&Path>) -> anyhow::Result<()> {
    config.check().context("config error")?;
    let initial = match targets {
        Some(p) => load_targets(p).context("failed to load targets")?,
        None => Vec::new(),
    };
    let rt = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("fuzzherd")
        .build()
        .context("failed to build async runtime")?;
    rt.block_on(run(config, initial))
}

/// Reads a JSON array of targets.
pub fn load_targets(path: &Path) -> anyhow::Result<Vec<Target>> {
    let content = read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let targets = serde_json::from_str(&content).context("malformed targets file")?;
    Ok(targets)
}

async fn run(config: Config, initial: Vec<Target>) -> anyhow::Result<()> {
    let paths = config.paths();
    for dir in paths.all().iter() {
        create_dir_all(dir).with_context(|| format!("failed to create {}", dir.display()))?;
    }

    let runtime: Arc<dyn ClusterRuntime> = Arc::new(DockerCli::new(config.runtime_bin.clone()));
    {
        let runtime = Arc::clone(&runtime);
        blocking(move || runtime.ping())
            .await
            .context("cannot reach cluster runtime")?;
    }
    log::info!("cluster runtime '{}' is up", config.runtime_bin);

    let (event_tx, event_rx) = mpsc::unbounded_channel();
    let (stats_tx, stats_rx) = mpsc::unbounded_channel();
    let registry = Arc::new(Registry::new(event_tx));
    let strategy = config.strategy;
    let interval = config.fuzz_interval();
    let spec = config.supervisor.spec();
    let ctx = Arc::new(Context {
        config,
        runtime,
        stats_tx,
    });
    let factory = Arc::new(FuzzerFactory::new(ctx));

    let mut root = Supervisor::new("root", spec);
    root.add(scheduler(
        strategy,
        Arc::clone(&registry),
        factory,
        event_rx,
        interval,
    ));
    root.add(Arc::new(StatsAggregator::new(Arc::clone(&registry), stats_rx)));

    for t in initial {
        let id = t.unique_id.clone();
        match registry.add(t) {
            Ok(()) => target_info!(id, "registered"),
            Err(e @ RegistryError::AlreadyExists(_)) => log::warn!("{}", e),
            Err(e) => return Err(e.into()),
        }
    }

    let (shutdown_tx, mut shutdown_rx) = watch::channel(false);
    setup_signal_handler(shutdown_tx).context("failed to setup signal handler")?;
    log::info!("fuzzing with {:?} strategy, {} targets", strategy, registry.len());
    let handle = root.serve_background();

    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => break,
            _ = tokio::time::sleep(STATUS_INTERVAL) => {
                let status = registry.status();
                log::info!(
                    "status: {}",
                    serde_json::to_string(&status).unwrap_or_else(|_| format!("{:?}", status))
                );
            }
        }
    }

    log::info!("shutting down...");
    handle.stop().await;
    log::info!("bye");
    Ok(())
}
