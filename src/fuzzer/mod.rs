//! Per-target worker sets.
//!
//! Every target gets its own [`Supervisor`] running a backup service, a stats
//! service, a crash watcher and the [`runner::FuzzerRunner`] driving the fuzz cluster.
//! Which stats service, crash layout and command line are used depends on the [`Engine`].

pub mod command;
pub mod runner;
pub mod setup;

use crate::{
    backup::{BackupService, SyncDirLock},
    cluster::{ClusterRuntime, PortBinding},
    config::Config,
    scheduler::{FactoryError, SupervisorFactory},
    stats::{afl::AflStatsService, gofuzz::GoFuzzStatsService},
    storage::{self, Category},
    supervisor::{ServiceError, Supervisor},
    target::{Language, Target, TargetId, TargetStats},
    watcher::{CrashWatcher, WatchDir},
    HashMap, HashSet,
};
use command::{afl_command, gofuzz_command, GO_FUZZ_HTTP_PORT};
use runner::FuzzerRunner;
use setup::{Environment, IoOptions};
use std::{
    fmt,
    net::{Ipv4Addr, TcpListener},
    path::Path,
    sync::{Arc, Mutex},
};
use tokio::sync::mpsc;

/// Fuzzing engines the cluster can host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Engine {
    Afl,
    GoFuzz,
}

impl Engine {
    pub fn for_language(lang: Language) -> Self {
        match lang {
            Language::C | Language::Cpp => Engine::Afl,
            Language::Go => Engine::GoFuzz,
        }
    }

    pub fn command(self, env: &Environment, io: &IoOptions) -> Result<Vec<String>, ServiceError> {
        let cmd = match self {
            Engine::Afl => afl_command(env, io)?,
            Engine::GoFuzz => gofuzz_command(env)?,
        };
        Ok(cmd)
    }

    /// Whether the engine serves live stats over http.
    pub fn has_stats_endpoint(self) -> bool {
        matches!(self, Engine::GoFuzz)
    }

    /// Directories the engine writes artifacts to, relative to its sync dir.
    pub fn watch_dirs(self, sync_dir: &Path) -> Vec<WatchDir> {
        match self {
            Engine::Afl => vec![
                WatchDir::payloads(sync_dir.join("crashes"), Category::Crash),
                WatchDir::payloads(sync_dir.join("hangs"), Category::Hang),
            ],
            Engine::GoFuzz => vec![WatchDir::with_outputs(
                sync_dir.join("crashers"),
                Category::Crash,
                ".output",
            )],
        }
    }
}

impl fmt::Display for Engine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Engine::Afl => write!(f, "afl"),
            Engine::GoFuzz => write!(f, "go-fuzz"),
        }
    }
}

/// Shared by every worker set.
pub struct Context {
    pub config: Config,
    pub runtime: Arc<dyn ClusterRuntime>,
    pub stats_tx: mpsc::UnboundedSender<TargetStats>,
}

/// Free-list of host ports for engines with a stats endpoint.
#[derive(Debug)]
pub struct PortPool {
    base: u16,
    used: HashSet<u16>,
}

impl PortPool {
    pub fn new(base: u16) -> Self {
        Self {
            base,
            used: HashSet::default(),
        }
    }

    /// Lowest port at or above the base that is neither handed out nor bound.
    pub fn alloc(&mut self) -> Option<u16> {
        for p in self.base..u16::MAX {
            if self.used.contains(&p) {
                continue;
            }
            if TcpListener::bind((Ipv4Addr::UNSPECIFIED, p)).is_ok() {
                self.used.insert(p);
                return Some(p);
            }
        }
        None
    }

    pub fn release(&mut self, port: u16) {
        self.used.remove(&port);
    }
}

/// Builds worker sets for real engines.
pub struct FuzzerFactory {
    ctx: Arc<Context>,
    ports: Mutex<PortPool>,
    leased: Mutex<HashMap<TargetId, u16>>,
}

impl FuzzerFactory {
    pub fn new(ctx: Arc<Context>) -> Self {
        let base = ctx.config.stats_port_base;
        Self {
            ctx,
            ports: Mutex::new(PortPool::new(base)),
            leased: Mutex::new(HashMap::default()),
        }
    }

    fn lease_port(&self, id: &str) -> Result<u16, FactoryError> {
        let mut leased = self.leased.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(p) = leased.get(id) {
            return Ok(*p);
        }
        let port = self
            .ports
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .alloc()
            .ok_or(FactoryError::NoFreePort)?;
        leased.insert(id.to_string(), port);
        Ok(port)
    }
}

impl SupervisorFactory for FuzzerFactory {
    fn build(&self, target: &Target) -> Result<Supervisor, FactoryError> {
        let lang = target
            .language
            .parse::<Language>()
            .map_err(|e| FactoryError::UnsupportedLanguage(e.0))?;
        let engine = Engine::for_language(lang);
        let config = &self.ctx.config;
        let paths = config.paths();
        let id = target.id();
        let sync_dir = paths.sync_dir(id);
        let storage = storage::open(config.storage, &paths, id);

        let port = if engine.has_stats_endpoint() {
            Some(self.lease_port(id)?)
        } else {
            None
        };

        let sync_lock = SyncDirLock::default();
        let mut sup = Supervisor::new(format!("target:{}", id), config.supervisor.spec());
        sup.add(Arc::new(BackupService::new(
            id,
            sync_dir.clone(),
            Arc::clone(&storage),
            config.backup_interval(),
            sync_lock.clone(),
        )));
        match port {
            Some(port) => sup.add(Arc::new(GoFuzzStatsService::new(
                id,
                port,
                self.ctx.stats_tx.clone(),
            ))),
            None => sup.add(Arc::new(AflStatsService::new(
                id,
                sync_dir.join("fuzzer_stats"),
                config.stats_interval(),
                config.wait_timeout(),
                self.ctx.stats_tx.clone(),
            ))),
        }
        sup.add(Arc::new(CrashWatcher::new(
            id,
            &target.revision,
            engine.watch_dirs(&sync_dir),
            Arc::clone(&storage),
            config.watch_interval(),
            config.wait_timeout(),
        )));
        let ports = port
            .map(|host| {
                vec![PortBinding {
                    container: GO_FUZZ_HTTP_PORT,
                    host,
                }]
            })
            .unwrap_or_default();
        sup.add(Arc::new(FuzzerRunner::new(
            target.clone(),
            engine,
            Arc::clone(&self.ctx),
            storage,
            ports,
            sync_lock,
        )));
        target_info!(id, "{} worker set ready", engine);
        Ok(sup)
    }

    fn release(&self, id: &str) {
        let port = self
            .leased
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(id);
        if let Some(port) = port {
            self.ports
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .release(port);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cluster::fake::FakeRuntime;

    fn target(id: &str, lang: &str) -> Target {
        Target {
            name: id.to_string(),
            unique_id: id.to_string(),
            language: lang.to_string(),
            location: String::new(),
            revision: "r1".to_string(),
        }
    }

    fn factory(base: u16) -> FuzzerFactory {
        let (tx, _rx) = mpsc::unbounded_channel();
        let mut config = Config::default();
        config.stats_port_base = base;
        FuzzerFactory::new(Arc::new(Context {
            config,
            runtime: Arc::new(FakeRuntime::new()),
            stats_tx: tx,
        }))
    }

    #[test]
    fn language_dispatch() {
        assert_eq!(Engine::for_language(Language::Cpp), Engine::Afl);
        assert_eq!(Engine::for_language(Language::Go), Engine::GoFuzz);
        let f = factory(28090);
        assert_eq!(f.build(&target("png", "c")).unwrap().len(), 4);
        assert!(matches!(
            f.build(&target("rb", "ruby")),
            Err(FactoryError::UnsupportedLanguage(_))
        ));
    }

    #[test]
    fn ports_are_reused_after_release() {
        let mut pool = PortPool::new(28190);
        let a = pool.alloc().unwrap();
        let b = pool.alloc().unwrap();
        assert_ne!(a, b);
        pool.release(a);
        assert_eq!(pool.alloc().unwrap(), a);
    }

    #[test]
    fn go_targets_lease_one_port() {
        let f = factory(28290);
        f.build(&target("json", "go")).unwrap();
        let port = *f.leased.lock().unwrap().get("json").unwrap();
        f.build(&target("json", "go")).unwrap();
        assert_eq!(f.leased.lock().unwrap().len(), 1);
        f.release("json");
        assert!(f.leased.lock().unwrap().is_empty());
        assert!(!f.ports.lock().unwrap().used.contains(&port));
    }
}
