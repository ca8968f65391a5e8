use super::{
    setup::{initial_setup, Environment, ENV_FILE},
    Context, Engine,
};
use crate::{
    backup::SyncDirLock,
    cluster::{build_fuzzer, BuildOutcome, BuildRequest, ClusterRuntime, FuzzCluster, PortBinding},
    storage::StorageHandler,
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::Target,
    target_log::OutputSink,
    util::blocking,
};
use std::sync::{Arc, Mutex};

/// Lifecycle of one target's fuzz cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Init,
    Setup,
    Build,
    Deploy,
    Monitor,
    Stopped,
    Failed,
}

pub struct FuzzerRunner {
    target: Target,
    engine: Engine,
    ctx: Arc<Context>,
    storage: Arc<dyn StorageHandler>,
    ports: Vec<PortBinding>,
    sync_lock: SyncDirLock,
    phase: Mutex<Phase>,
}

impl FuzzerRunner {
    pub fn new(
        target: Target,
        engine: Engine,
        ctx: Arc<Context>,
        storage: Arc<dyn StorageHandler>,
        ports: Vec<PortBinding>,
        sync_lock: SyncDirLock,
    ) -> Self {
        Self {
            target,
            engine,
            ctx,
            storage,
            ports,
            sync_lock,
            phase: Mutex::new(Phase::Init),
        }
    }

    pub fn phase(&self) -> Phase {
        *self.phase.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn enter(&self, phase: Phase) {
        target_debug!(self.target.id(), "runner: {:?}", phase);
        *self.phase.lock().unwrap_or_else(|e| e.into_inner()) = phase;
    }

    fn sinks(&self) -> (OutputSink, OutputSink) {
        let suppress = self.ctx.config.suppress_fuzzer_output;
        (
            OutputSink::new(&self.target.name, "stdout", suppress),
            OutputSink::new(&self.target.name, "stderr", suppress),
        )
    }

    async fn run(&self, stop: &mut Stop) -> Result<Phase, ServiceError> {
        let id = self.target.id().to_string();
        let paths = self.ctx.config.paths();
        let target_dir = paths.target_dir(&id);
        let sync_dir = paths.sync_dir(&id);
        let rt = Arc::clone(&self.ctx.runtime);

        self.enter(Phase::Setup);
        let io = {
            let _setup = self.sync_lock.setup().await;
            let storage = Arc::clone(&self.storage);
            let (target_dir, sync_dir) = (target_dir.clone(), sync_dir.clone());
            blocking(move || initial_setup(&*storage, &target_dir, &sync_dir)).await?
        };
        target_info!(id, "setup done, io options: {}", io);
        let env = Environment::load(&target_dir.join(ENV_FILE))?;
        let command = self.engine.command(&env, &io)?;
        if stop.requested() {
            return Ok(Phase::Stopped);
        }

        self.enter(Phase::Build);
        let req = BuildRequest {
            target: id.clone(),
            base_image: self.ctx.config.base_image(self.engine).to_string(),
            env: env.vars().to_vec(),
            target_dir,
            sync_dir,
            ports: self.ports.clone(),
            suppress_output: self.ctx.config.suppress_fuzzer_output,
            poll: self.ctx.config.monitor_interval(),
        };
        let config = match build_fuzzer(Arc::clone(&rt), req, stop).await? {
            BuildOutcome::Built(c) => c,
            BuildOutcome::Stopped => return Ok(Phase::Stopped),
        };

        self.enter(Phase::Deploy);
        target_info!(id, "deploying: {}", command.join(" "));
        let cluster = {
            let rt = Arc::clone(&rt);
            let (stdout, stderr) = self.sinks();
            blocking(move || config.deploy(&*rt, command, stdout, stderr)).await?
        };

        self.enter(Phase::Monitor);
        let res = self.monitor(&rt, &cluster, stop).await;
        target_info!(id, "spinning down fuzzer");
        let kill = {
            let rt = Arc::clone(&rt);
            blocking(move || cluster.kill(&*rt)).await
        };
        match (&res, kill) {
            (_, Ok(())) => (),
            (Ok(_), Err(e)) => target_error!(id, "failed to spin down fuzzer: {}", e),
            // an exited unit may already be gone
            (Err(_), Err(e)) => target_warn!(id, "cleanup after failure: {}", e),
        }
        res
    }

    /// Polls the deployed unit until a stop request or a failure.
    async fn monitor(
        &self,
        rt: &Arc<dyn ClusterRuntime>,
        cluster: &FuzzCluster,
        stop: &mut Stop,
    ) -> Result<Phase, ServiceError> {
        let interval = self.ctx.config.monitor_interval();
        loop {
            if stop.sleep(interval).await {
                return Ok(Phase::Stopped);
            }
            let state = {
                let rt = Arc::clone(rt);
                let cluster = cluster.clone();
                blocking(move || cluster.state(&*rt)).await?
            };
            if !state.running {
                target_error!(
                    self.target.id(),
                    "fuzz cluster stopped unexpectedly, exit code: {}",
                    state.exit_code
                );
                return Err(ServiceError::UnexpectedExit(Some(state.exit_code)));
            }
        }
    }
}

impl Service for FuzzerRunner {
    fn name(&self) -> String {
        format!("runner:{}", self.target.id())
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move {
            target_info!(self.target.id(), "{} runner starting", self.engine);
            self.enter(Phase::Init);
            match self.run(&mut stop).await {
                Ok(phase) => {
                    self.enter(phase);
                    Ok(())
                }
                Err(e) => {
                    target_error!(self.target.id(), "runner failed: {}", e);
                    self.enter(Phase::Failed);
                    Err(e)
                }
            }
        })
    }
}
