//! Restart tree for long-running worker services.
//!
//! A [`Supervisor`] owns a fixed set of children. Each child runs in its own task and
//! receives its own [`Stop`] token. A child that returns while no stop was requested is
//! restarted, unless it failed more than `failure_threshold` times within `failure_decay`,
//! in which case the supervisor waits `failure_backoff` first. Children that report a
//! permanent error are never restarted.

pub mod failure;

use crate::{archive::ArchiveError, cluster::RuntimeError, storage::StorageError};
use failure::FailureTracker;
use std::{future::Future, pin::Pin, sync::Arc, time::Duration};
use thiserror::Error;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
    time::{sleep_until, timeout_at, Instant},
};

pub type ServeFuture = Pin<Box<dyn Future<Output = Result<(), ServiceError>> + Send>>;

/// A worker the supervisor can run, stop and run again.
pub trait Service: Send + Sync + 'static {
    fn name(&self) -> String;

    /// Runs until the work is done or `stop` fires.
    fn serve(self: Arc<Self>, stop: Stop) -> ServeFuture;
}

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("configuration error: {0}")]
    Config(String),
    #[error("gave up after {0:?} waiting for {1}")]
    WaitTimeout(Duration, String),
    #[error("build failed with exit code {0}")]
    BuildFailed(i64),
    #[error("fuzzer exited unexpectedly with code {0:?}")]
    UnexpectedExit(Option<i64>),
    #[error("service panicked: {0}")]
    Panicked(String),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
    #[error(transparent)]
    Storage(#[from] StorageError),
    #[error(transparent)]
    Archive(#[from] ArchiveError),
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

impl ServiceError {
    /// Errors that a restart cannot fix.
    pub fn is_permanent(&self) -> bool {
        matches!(self, ServiceError::Config(_))
    }
}

impl From<tokio::task::JoinError> for ServiceError {
    fn from(e: tokio::task::JoinError) -> Self {
        ServiceError::Panicked(e.to_string())
    }
}

/// Receiving half of a stop request.
#[derive(Debug, Clone)]
pub struct Stop(watch::Receiver<bool>);

/// Sending half of a stop request.
#[derive(Debug)]
pub struct StopHandle(watch::Sender<bool>);

pub fn stop_pair() -> (StopHandle, Stop) {
    let (tx, rx) = watch::channel(false);
    (StopHandle(tx), Stop(rx))
}

impl StopHandle {
    pub fn stop(&self) {
        let _ = self.0.send(true);
    }
}

impl Stop {
    pub fn requested(&self) -> bool {
        *self.0.borrow()
    }

    /// Resolves once a stop is requested or the handle is gone.
    pub async fn wait(&mut self) {
        while !*self.0.borrow() {
            if self.0.changed().await.is_err() {
                return;
            }
        }
    }

    /// Sleeps for `d`, returns true if interrupted by a stop request.
    pub async fn sleep(&mut self, d: Duration) -> bool {
        tokio::select! {
            _ = self.wait() => true,
            _ = tokio::time::sleep(d) => self.requested(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SupervisorSpec {
    pub failure_decay: Duration,
    pub failure_threshold: u32,
    pub failure_backoff: Duration,
    pub timeout: Duration,
}

impl Default for SupervisorSpec {
    fn default() -> Self {
        Self {
            failure_decay: Duration::from_secs(30),
            failure_threshold: 1,
            failure_backoff: Duration::from_secs(30),
            timeout: Duration::from_secs(30),
        }
    }
}

pub struct Supervisor {
    name: String,
    spec: SupervisorSpec,
    children: Vec<Arc<dyn Service>>,
}

struct Running {
    stop: StopHandle,
    task: JoinHandle<()>,
}

enum Slot {
    Running(Running),
    Restart(Instant),
    Dead,
}

impl Supervisor {
    pub fn new(name: impl Into<String>, spec: SupervisorSpec) -> Self {
        Self {
            name: name.into(),
            spec,
            children: Vec::new(),
        }
    }

    pub fn add(&mut self, child: Arc<dyn Service>) {
        self.children.push(child);
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    /// Starts serving in a background task.
    pub fn serve_background(self) -> SupervisorHandle {
        let name = self.name.clone();
        let (stop_tx, stop_rx) = stop_pair();
        let sup = Arc::new(self);
        let task = tokio::spawn(async move {
            if let Err(e) = sup.run(stop_rx).await {
                log::error!("supervisor {}: {}", sup.name, e);
            }
        });
        SupervisorHandle {
            name,
            stop: stop_tx,
            task,
        }
    }

    async fn run(&self, mut stop: Stop) -> Result<(), ServiceError> {
        let (exit_tx, mut exit_rx) = mpsc::unbounded_channel();
        let mut trackers = vec![
            FailureTracker::new(self.spec.failure_decay, self.spec.failure_threshold);
            self.children.len()
        ];
        let mut slots = (0..self.children.len())
            .map(|i| Slot::Running(self.spawn_child(i, &exit_tx)))
            .collect::<Vec<_>>();
        log::debug!("supervisor {}: {} children started", self.name, slots.len());

        loop {
            let next_restart = slots
                .iter()
                .filter_map(|s| match s {
                    Slot::Restart(at) => Some(*at),
                    _ => None,
                })
                .min();

            tokio::select! {
                _ = stop.wait() => break,
                Some((idx, res)) = exit_rx.recv() => {
                    if stop.requested() {
                        break;
                    }
                    slots[idx] = self.on_exit(idx, res, &mut trackers[idx]);
                }
                _ = sleep_until(next_restart.unwrap_or_else(Instant::now)), if next_restart.is_some() => {
                    let now = Instant::now();
                    for idx in 0..slots.len() {
                        if matches!(slots[idx], Slot::Restart(at) if at <= now) {
                            log::info!("supervisor {}: restarting {}", self.name, self.children[idx].name());
                            slots[idx] = Slot::Running(self.spawn_child(idx, &exit_tx));
                        }
                    }
                }
            }
        }

        self.shutdown(slots).await;
        Ok(())
    }

    fn on_exit(
        &self,
        idx: usize,
        res: Result<(), ServiceError>,
        tracker: &mut FailureTracker,
    ) -> Slot {
        let child = self.children[idx].name();
        match res {
            Err(e) if e.is_permanent() => {
                log::error!(
                    "supervisor {}: {} failed permanently, not restarting: {}",
                    self.name,
                    child,
                    e
                );
                return Slot::Dead;
            }
            Err(e) => log::warn!("supervisor {}: {} failed: {}", self.name, child, e),
            Ok(()) => log::warn!("supervisor {}: {} exited", self.name, child),
        }

        let now = Instant::now();
        if tracker.record(now) {
            log::warn!(
                "supervisor {}: {} failed {} times within {:?}, backing off for {:?}",
                self.name,
                child,
                tracker.count(),
                self.spec.failure_decay,
                self.spec.failure_backoff
            );
            tracker.reset();
            Slot::Restart(now + self.spec.failure_backoff)
        } else {
            Slot::Restart(now)
        }
    }

    fn spawn_child(
        &self,
        idx: usize,
        exit_tx: &mpsc::UnboundedSender<(usize, Result<(), ServiceError>)>,
    ) -> Running {
        let child = Arc::clone(&self.children[idx]);
        let (stop_tx, stop_rx) = stop_pair();
        let exit_tx = exit_tx.clone();
        let task = tokio::spawn(async move {
            let res = match tokio::spawn(child.serve(stop_rx)).await {
                Ok(res) => res,
                Err(e) => Err(ServiceError::from(e)),
            };
            let _ = exit_tx.send((idx, res));
        });
        Running {
            stop: stop_tx,
            task,
        }
    }

    async fn shutdown(&self, slots: Vec<Slot>) {
        let running = slots
            .into_iter()
            .enumerate()
            .filter_map(|(i, s)| match s {
                Slot::Running(r) => Some((i, r)),
                _ => None,
            })
            .collect::<Vec<_>>();
        for (_, r) in running.iter() {
            r.stop.stop();
        }

        let deadline = Instant::now() + self.spec.timeout;
        for (idx, r) in running {
            if timeout_at(deadline, r.task).await.is_err() {
                log::warn!(
                    "supervisor {}: {} did not stop within {:?}, leaving it behind",
                    self.name,
                    self.children[idx].name(),
                    self.spec.timeout
                );
            }
        }
        log::debug!("supervisor {}: stopped", self.name);
    }
}

impl Service for Supervisor {
    fn name(&self) -> String {
        self.name.clone()
    }

    fn serve(self: Arc<Self>, stop: Stop) -> ServeFuture {
        Box::pin(async move { self.run(stop).await })
    }
}

/// Handle of a supervisor serving in the background.
pub struct SupervisorHandle {
    name: String,
    stop: StopHandle,
    task: JoinHandle<()>,
}

impl SupervisorHandle {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Stops every child and waits for the supervisor to wind down.
    pub async fn stop(self) {
        self.stop.stop();
        if let Err(e) = self.task.await {
            log::error!("supervisor {}: {}", self.name, e);
        }
    }
}
