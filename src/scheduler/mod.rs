//! Deciding which targets fuzz when.
//!
//! Both strategies run as one long-lived [`Service`] under the root supervisor.
//! Their event receiver and the handles of the per-target supervisors they started
//! live behind a mutex owned by the service, so a restarted scheduler picks up
//! where the failed one left off.

pub mod aggregator;
pub mod parallel;
pub mod round_robin;

#[cfg(test)]
pub(crate) mod fake;

use crate::{
    config::Strategy,
    registry::{Registry, SchedEvent},
    supervisor::{Service, Supervisor, SupervisorHandle},
    target::{Target, TargetId},
};
use std::{sync::Arc, time::Duration};
use thiserror::Error;
use tokio::sync::mpsc;

pub use aggregator::StatsAggregator;
pub use parallel::Parallel;
pub use round_robin::RoundRobin;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FactoryError {
    #[error("unsupported language: {0}")]
    UnsupportedLanguage(String),
    #[error("no free stats port")]
    NoFreePort,
}

/// Builds the worker set of one target.
pub trait SupervisorFactory: Send + Sync {
    fn build(&self, target: &Target) -> Result<Supervisor, FactoryError>;

    /// Returns resources leased by `build` once the target stopped.
    fn release(&self, id: &str);
}

/// Per-target supervisor started by a scheduler.
pub(crate) struct Active {
    pub id: TargetId,
    handle: SupervisorHandle,
}

impl Active {
    /// Builds and starts the worker set, `None` when the target cannot run.
    pub fn start(factory: &dyn SupervisorFactory, target: &Target) -> Option<Self> {
        match factory.build(target) {
            Ok(sup) => {
                target_info!(target.id(), "fuzzing new target");
                Some(Active {
                    id: target.unique_id.clone(),
                    handle: sup.serve_background(),
                })
            }
            Err(e) => {
                target_error!(target.id(), "cannot fuzz target: {}", e);
                None
            }
        }
    }

    /// Stops the worker set and waits for it to wind down.
    pub async fn halt(self, factory: &dyn SupervisorFactory) {
        target_info!(self.id, "killing target");
        self.handle.stop().await;
        factory.release(&self.id);
    }
}

pub fn scheduler(
    strategy: Strategy,
    registry: Arc<Registry>,
    factory: Arc<dyn SupervisorFactory>,
    events: mpsc::UnboundedReceiver<SchedEvent>,
    interval: Duration,
) -> Arc<dyn Service> {
    match strategy {
        Strategy::Robin => Arc::new(RoundRobin::new(registry, factory, events, interval)),
        Strategy::Parallel => Arc::new(Parallel::new(registry, factory, events)),
    }
}
