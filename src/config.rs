use crate::{fuzzer::Engine, supervisor::SupervisorSpec};
use serde::Deserialize;
use std::{
    env,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;

/// Environment variable holding the `key=value:key=value` option string.
pub const OPTIONS_ENV: &str = "FUZZHERD_OPTIONS";

/// How targets share the fuzzing host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Strategy {
    /// One target at a time, rotated every `fuzz_interval`.
    #[serde(alias = "round-robin")]
    Robin,
    /// Every target runs until it is removed.
    Parallel,
}

impl FromStr for Strategy {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "robin" | "round-robin" => Ok(Strategy::Robin),
            "parallel" => Ok(Strategy::Parallel),
            _ => Err(ConfigError::UnsupportedStrategy(s.to_string())),
        }
    }
}

/// Where crashes, outputs and backups are persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StorageKind {
    Local,
}

impl FromStr for StorageKind {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "local" => Ok(StorageKind::Local),
            _ => Err(ConfigError::UnsupportedStorage(s.to_string())),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unsupported fuzz strategy: {0}")]
    UnsupportedStrategy(String),
    #[error("invalid storage solution: {0}")]
    UnsupportedStorage(String),
    #[error("malformed option '{0}', expected key=value")]
    MalformedOption(String),
    #[error("unknown option '{0}'")]
    UnknownOption(String),
    #[error("{name} must be greater than zero")]
    ZeroInterval { name: &'static str },
    #[error("bad work dir: {0}")]
    BadWorkDir(String),
    #[error("failed to read config {path}: {reason}")]
    Load { path: String, reason: String },
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SupervisorSettings {
    /// Window in seconds over which child failures are counted.
    pub failure_decay: u64,
    /// Failures tolerated inside the window before backing off.
    pub failure_threshold: u32,
    /// Seconds to wait after the threshold was exceeded.
    pub failure_backoff: u64,
    /// Seconds a child gets to return after being asked to stop.
    pub timeout: u64,
}

impl Default for SupervisorSettings {
    fn default() -> Self {
        Self {
            failure_decay: 30,
            failure_threshold: 1,
            failure_backoff: 30,
            timeout: 30,
        }
    }
}

impl SupervisorSettings {
    pub fn spec(&self) -> SupervisorSpec {
        SupervisorSpec {
            failure_decay: Duration::from_secs(self.failure_decay),
            failure_threshold: self.failure_threshold,
            failure_backoff: Duration::from_secs(self.failure_backoff),
            timeout: Duration::from_secs(self.timeout),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct BaseImages {
    pub afl: String,
    pub gofuzz: String,
}

impl Default for BaseImages {
    fn default() -> Self {
        Self {
            afl: "fuzzbox_c".to_string(),
            gofuzz: "fuzzbox_go".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Config {
    pub strategy: Strategy,
    pub storage: StorageKind,
    /// Root of `targets/`, `sync/`, `crashes/` and `staging/`.
    pub work_dir: PathBuf,
    /// Length of one round-robin slice, in seconds.
    pub fuzz_interval: u64,
    pub backup_interval: u64,
    pub stats_interval: u64,
    /// Cluster health polling, in milliseconds.
    pub monitor_interval_ms: u64,
    /// Crash directory scanning, in milliseconds.
    pub watch_interval_ms: u64,
    /// Upper bound for waiting on engine-created paths, in seconds.
    pub wait_timeout: u64,
    pub suppress_fuzzer_output: bool,
    /// Container runtime cli.
    pub runtime_bin: String,
    pub stats_port_base: u16,
    pub base_images: BaseImages,
    pub supervisor: SupervisorSettings,
}

impl Default for Config {
    fn default() -> Self {
        let home = env::var("HOME").unwrap_or_else(|_| ".".to_string());
        Self {
            strategy: Strategy::Robin,
            storage: StorageKind::Local,
            work_dir: PathBuf::from(home).join("fuzzherd"),
            fuzz_interval: 7200,
            backup_interval: 600,
            stats_interval: 60,
            monitor_interval_ms: 1000,
            watch_interval_ms: 500,
            wait_timeout: 600,
            suppress_fuzzer_output: false,
            runtime_bin: "docker".to_string(),
            stats_port_base: 8090,
            base_images: BaseImages::default(),
            supervisor: SupervisorSettings::default(),
        }
    }
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        toml::from_str(&content).map_err(|e| ConfigError::Load {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }

    /// Applies a `key=value:key=value` option string on top of the current values.
    pub fn apply_options(&mut self, options: &str) -> Result<(), ConfigError> {
        for (key, val) in parse_options(options)? {
            match &key[..] {
                "strategy" => self.strategy = val.parse()?,
                "storageSolution" => self.storage = val.parse()?,
                "suppressFuzzerOutput" => self.suppress_fuzzer_output = val == "1",
                _ => return Err(ConfigError::UnknownOption(key)),
            }
        }
        Ok(())
    }

    pub fn check(&self) -> Result<(), ConfigError> {
        let intervals = [
            ("fuzz_interval", self.fuzz_interval),
            ("backup_interval", self.backup_interval),
            ("stats_interval", self.stats_interval),
            ("monitor_interval_ms", self.monitor_interval_ms),
            ("watch_interval_ms", self.watch_interval_ms),
            ("wait_timeout", self.wait_timeout),
        ];
        for &(name, val) in intervals.iter() {
            if val == 0 {
                return Err(ConfigError::ZeroInterval { name });
            }
        }
        if self.work_dir.as_os_str().is_empty() || self.work_dir.is_file() {
            return Err(ConfigError::BadWorkDir(self.work_dir.display().to_string()));
        }
        Ok(())
    }

    pub fn paths(&self) -> Paths {
        Paths::new(&self.work_dir)
    }

    pub fn base_image(&self, engine: Engine) -> &str {
        match engine {
            Engine::Afl => &self.base_images.afl,
            Engine::GoFuzz => &self.base_images.gofuzz,
        }
    }

    pub fn fuzz_interval(&self) -> Duration {
        Duration::from_secs(self.fuzz_interval)
    }

    pub fn backup_interval(&self) -> Duration {
        Duration::from_secs(self.backup_interval)
    }

    pub fn stats_interval(&self) -> Duration {
        Duration::from_secs(self.stats_interval)
    }

    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn watch_interval(&self) -> Duration {
        Duration::from_millis(self.watch_interval_ms)
    }

    pub fn wait_timeout(&self) -> Duration {
        Duration::from_secs(self.wait_timeout)
    }
}

/// Host-side directory layout.
#[derive(Debug, Clone)]
pub struct Paths {
    /// Target bundles and their unpacked execution directories.
    pub targets: PathBuf,
    /// Engine output directories, one per target.
    pub sync: PathBuf,
    /// Persisted crashes, outputs and backups.
    pub crashes: PathBuf,
    /// Scratch space for archives in flight.
    pub staging: PathBuf,
}

impl Paths {
    pub fn new(root: &Path) -> Self {
        Self {
            targets: root.join("targets"),
            sync: root.join("sync"),
            crashes: root.join("crashes"),
            staging: root.join("staging"),
        }
    }

    pub fn target_dir(&self, id: &str) -> PathBuf {
        self.targets.join(id)
    }

    pub fn sync_dir(&self, id: &str) -> PathBuf {
        self.sync.join(id)
    }

    pub fn all(&self) -> [&Path; 4] {
        [&self.targets, &self.sync, &self.crashes, &self.staging]
    }
}

pub fn parse_options(options: &str) -> Result<Vec<(String, String)>, ConfigError> {
    let mut ret = Vec::new();
    for item in options.split(':').map(|i| i.trim()) {
        if item.is_empty() {
            continue;
        }
        let mut kv = item.splitn(2, '=');
        match (kv.next(), kv.next()) {
            (Some(k), Some(v)) if !k.is_empty() => ret.push((k.to_string(), v.to_string())),
            _ => return Err(ConfigError::MalformedOption(item.to_string())),
        }
    }
    Ok(ret)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn options_string() {
        let opts = parse_options("strategy=parallel:storageSolution=local:suppressFuzzerOutput=1")
            .unwrap();
        assert_eq!(opts.len(), 3);
        let mut config = Config::default();
        config
            .apply_options("strategy=parallel:suppressFuzzerOutput=1")
            .unwrap();
        assert_eq!(config.strategy, Strategy::Parallel);
        assert!(config.suppress_fuzzer_output);

        assert!(parse_options("strategy").is_err());
        assert!(config.apply_options("strategy=fastest").is_err());
        assert!(config.apply_options("color=blue").is_err());
    }

    #[test]
    fn toml_defaults() {
        let config: Config = toml::from_str(
            r#"
            strategy = "parallel"
            fuzz_interval = 60
            [supervisor]
            failure_threshold = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.strategy, Strategy::Parallel);
        assert_eq!(config.fuzz_interval(), Duration::from_secs(60));
        assert_eq!(config.supervisor.failure_threshold, 5);
        assert_eq!(config.supervisor.failure_decay, 30);
        assert_eq!(config.backup_interval, 600);
        assert_eq!(config.base_images.gofuzz, "fuzzbox_go");
    }

    #[test]
    fn check_rejects_zero_interval() {
        let mut config = Config::default();
        config.stats_interval = 0;
        assert!(matches!(
            config.check(),
            Err(ConfigError::ZeroInterval {
                name: "stats_interval"
            })
        ));
    }

    #[test]
    fn layout() {
        let paths = Paths::new(Path::new("/w"));
        assert_eq!(paths.sync_dir("t1"), PathBuf::from("/w/sync/t1"));
        assert_eq!(paths.target_dir("t1"), PathBuf::from("/w/targets/t1"));
    }
}
