//! Container runtime contract and the fuzz cluster built on top of it.

pub mod docker;
#[cfg(test)]
pub mod fake;

use crate::{
    supervisor::{ServiceError, Stop},
    target_log::OutputSink,
    util::blocking,
};
use std::{fmt, path::PathBuf, sync::Arc, time::Duration};
use thiserror::Error;

pub use docker::DockerCli;

/// Where the target directory is mounted inside a unit.
pub const FUZZER_LOCATION: &str = "/root/fuzzer";
/// Where the sync directory is mounted inside a unit.
pub const FUZZER_OUTPUT_DIR: &str = "/root/fuzz_out";
/// Build steps shipped in every target bundle.
pub const BUILD_STEPS: &str = "/root/fuzzer/build_steps";

const STOP_GRACE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum RuntimeError {
    #[error("failed to run '{cmd}': {reason}")]
    Spawn { cmd: String, reason: String },
    #[error("'{cmd}' failed ({status}): {stderr}")]
    Failed {
        cmd: String,
        status: String,
        stderr: String,
    },
    #[error("unexpected runtime output for '{cmd}': {output}")]
    Parse { cmd: String, output: String },
    #[error("{}", join_errors(.0))]
    Multi(Vec<RuntimeError>),
}

fn join_errors(errs: &[RuntimeError]) -> String {
    errs.iter()
        .map(|e| e.to_string())
        .collect::<Vec<_>>()
        .join("; ")
}

/// Bind mount of a host path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub source: PathBuf,
    pub target: String,
}

/// Container port published on a host port.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortBinding {
    pub container: u16,
    pub host: u16,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UnitSpec {
    pub name: String,
    pub image: String,
    /// Program and its arguments.
    pub entrypoint: Vec<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub ports: Vec<PortBinding>,
    pub auto_remove: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitState {
    pub running: bool,
    pub exit_code: i64,
}

/// Opaque isolated execution units.
pub trait ClusterRuntime: Send + Sync {
    fn ping(&self) -> Result<(), RuntimeError>;

    /// Creates a unit, returns its id.
    fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError>;

    fn start(&self, id: &str) -> Result<(), RuntimeError>;

    fn stop(&self, id: &str, grace: Duration) -> Result<(), RuntimeError>;

    fn remove(&self, id: &str, force: bool) -> Result<(), RuntimeError>;

    fn inspect(&self, id: &str) -> Result<UnitState, RuntimeError>;

    /// Snapshots a unit into `repository`, returns the image id.
    fn commit(&self, id: &str, repository: &str) -> Result<String, RuntimeError>;

    /// Streams the unit's output into the sinks in the background.
    fn follow(&self, id: &str, stdout: OutputSink, stderr: OutputSink) -> Result<(), RuntimeError>;
}

pub fn buildbox_name(target: &str) -> String {
    format!("{}_buildbox", target)
}

pub fn fuzzer_name(target: &str) -> String {
    format!("{}_fuzzer", target)
}

pub fn reproducer_name(target: &str) -> String {
    format!("{}_reproducer", target)
}

pub fn image_repository(target: &str) -> String {
    format!("{}_images", target)
}

/// Everything needed to start a target's fuzzer, produced by the build.
#[derive(Clone)]
pub struct FuzzClusterConfig {
    pub target: String,
    pub image_id: String,
    pub env: Vec<(String, String)>,
    pub target_dir: PathBuf,
    pub sync_dir: PathBuf,
    pub ports: Vec<PortBinding>,
}

impl fmt::Debug for FuzzClusterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FuzzClusterConfig")
            .field("target", &self.target)
            .field("image_id", &self.image_id)
            .field("sync_dir", &self.sync_dir)
            .field("ports", &self.ports)
            .finish()
    }
}

impl FuzzClusterConfig {
    fn mounts(&self) -> Vec<Mount> {
        vec![
            Mount {
                source: self.target_dir.clone(),
                target: FUZZER_LOCATION.to_string(),
            },
            Mount {
                source: self.sync_dir.clone(),
                target: FUZZER_OUTPUT_DIR.to_string(),
            },
        ]
    }

    /// Starts the fuzzer unit running `command` and begins streaming its output.
    pub fn deploy(
        &self,
        rt: &dyn ClusterRuntime,
        command: Vec<String>,
        stdout: OutputSink,
        stderr: OutputSink,
    ) -> Result<FuzzCluster, RuntimeError> {
        let spec = UnitSpec {
            name: fuzzer_name(&self.target),
            image: self.image_id.clone(),
            entrypoint: command,
            env: self.env.clone(),
            mounts: self.mounts(),
            ports: self.ports.clone(),
            auto_remove: true,
        };
        let id = rt.create(&spec)?;
        if let Err(e) = rt.start(&id) {
            let _ = rt.remove(&id, true);
            return Err(e);
        }
        if let Err(e) = rt.follow(&id, stdout, stderr) {
            log::warn!("[target:{}] output will not be streamed: {}", self.target, e);
        }
        Ok(FuzzCluster {
            target: self.target.clone(),
            unit: id,
            image_id: self.image_id.clone(),
            sync_dir: self.sync_dir.clone(),
        })
    }
}

/// A running fuzzer unit.
#[derive(Debug, Clone)]
pub struct FuzzCluster {
    pub target: String,
    pub unit: String,
    pub image_id: String,
    pub sync_dir: PathBuf,
}

impl FuzzCluster {
    pub fn state(&self, rt: &dyn ClusterRuntime) -> Result<UnitState, RuntimeError> {
        rt.inspect(&self.unit)
    }

    /// Stops and force-removes the unit. Both are attempted, failures are collected.
    pub fn kill(&self, rt: &dyn ClusterRuntime) -> Result<(), RuntimeError> {
        let errs = vec![
            rt.stop(&self.unit, STOP_GRACE),
            rt.remove(&self.unit, true),
        ]
        .into_iter()
        .filter_map(|r| r.err())
        .collect::<Vec<_>>();
        if errs.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Multi(errs))
        }
    }
}

/// Inputs of the build phase.
#[derive(Clone)]
pub struct BuildRequest {
    pub target: String,
    pub base_image: String,
    pub env: Vec<(String, String)>,
    pub target_dir: PathBuf,
    pub sync_dir: PathBuf,
    pub ports: Vec<PortBinding>,
    pub suppress_output: bool,
    pub poll: Duration,
}

#[derive(Debug)]
pub enum BuildOutcome {
    Built(FuzzClusterConfig),
    Stopped,
}

/// Runs the target's build steps in a fresh build unit and commits the result.
pub async fn build_fuzzer(
    rt: Arc<dyn ClusterRuntime>,
    req: BuildRequest,
    stop: &mut Stop,
) -> Result<BuildOutcome, ServiceError> {
    let target = req.target.clone();
    let stale = vec![
        buildbox_name(&target),
        fuzzer_name(&target),
        reproducer_name(&target),
    ];
    {
        let rt = Arc::clone(&rt);
        blocking(move || {
            for unit in stale.iter() {
                let _ = rt.stop(unit, STOP_GRACE);
                let _ = rt.remove(unit, true);
            }
            Ok::<_, RuntimeError>(())
        })
        .await?;
    }
    std::fs::create_dir_all(&req.sync_dir)?;

    let spec = UnitSpec {
        name: buildbox_name(&target),
        image: req.base_image.clone(),
        entrypoint: vec![BUILD_STEPS.to_string()],
        env: req.env.clone(),
        mounts: vec![
            Mount {
                source: req.target_dir.clone(),
                target: FUZZER_LOCATION.to_string(),
            },
            Mount {
                source: req.sync_dir.clone(),
                target: FUZZER_OUTPUT_DIR.to_string(),
            },
        ],
        ports: Vec::new(),
        auto_remove: false,
    };
    let suppress = req.suppress_output;
    let id = {
        let rt = Arc::clone(&rt);
        let name = target.clone();
        blocking(move || {
            let id = rt.create(&spec)?;
            rt.start(&id)?;
            let stdout = OutputSink::new(&name, "build", suppress);
            let stderr = OutputSink::new(&name, "build", suppress);
            if let Err(e) = rt.follow(&id, stdout, stderr) {
                log::warn!("[target:{}] build output will not be streamed: {}", name, e);
            }
            Ok::<_, RuntimeError>(id)
        })
        .await?
    };

    let state = loop {
        let state = {
            let rt = Arc::clone(&rt);
            let id = id.clone();
            blocking(move || rt.inspect(&id)).await?
        };
        if !state.running {
            break state;
        }
        if stop.sleep(req.poll).await {
            target_info!(target, "build interrupted, removing build unit");
            let rt = Arc::clone(&rt);
            let id = id.clone();
            let res = blocking(move || {
                let stopped = rt.stop(&id, STOP_GRACE);
                rt.remove(&id, true).and(stopped)
            })
            .await;
            if let Err(e) = res {
                target_warn!(target, "failed to remove build unit: {}", e);
            }
            return Ok(BuildOutcome::Stopped);
        }
    };

    if state.exit_code != 0 {
        let rt = Arc::clone(&rt);
        let _ = blocking(move || rt.remove(&id, true)).await;
        return Err(ServiceError::BuildFailed(state.exit_code));
    }

    let image_id = {
        let rt = Arc::clone(&rt);
        let repo = image_repository(&target);
        blocking(move || {
            let image = rt.commit(&id, &repo)?;
            rt.remove(&id, true)?;
            Ok::<_, RuntimeError>(image)
        })
        .await?
    };
    target_info!(target, "build committed as {}", image_id);

    Ok(BuildOutcome::Built(FuzzClusterConfig {
        target,
        image_id,
        env: req.env,
        target_dir: req.target_dir,
        sync_dir: req.sync_dir,
        ports: req.ports,
    }))
}
