//! Every registered target fuzzes continuously until it is removed.

use super::{Active, SupervisorFactory};
use crate::{
    registry::{Registry, SchedEvent},
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::{Target, TargetId},
    HashMap,
};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

struct State {
    events: mpsc::UnboundedReceiver<SchedEvent>,
    running: HashMap<TargetId, Active>,
}

pub struct Parallel {
    registry: Arc<Registry>,
    factory: Arc<dyn SupervisorFactory>,
    state: Mutex<State>,
}

impl Parallel {
    pub fn new(
        registry: Arc<Registry>,
        factory: Arc<dyn SupervisorFactory>,
        events: mpsc::UnboundedReceiver<SchedEvent>,
    ) -> Self {
        Self {
            registry,
            factory,
            state: Mutex::new(State {
                events,
                running: HashMap::default(),
            }),
        }
    }

    fn start(&self, st: &mut State, target: &Target) {
        if st.running.contains_key(target.id()) {
            return;
        }
        if let Some(active) = Active::start(&*self.factory, target) {
            st.running.insert(active.id.clone(), active);
        }
    }

    async fn halt(&self, st: &mut State, id: &str) {
        match st.running.remove(id) {
            Some(active) => active.halt(&*self.factory).await,
            None => log::info!("scheduler: can't stop target {}, not running", id),
        }
        if st.running.is_empty() {
            log::info!("scheduler: waiting for targets...");
        }
    }

    /// Brings the running set in line with the registry after a restart.
    async fn reconcile(&self, st: &mut State) {
        let registered = self.registry.list();
        let stale = st
            .running
            .keys()
            .filter(|id| !registered.iter().any(|t| t.id() == id.as_str()))
            .cloned()
            .collect::<Vec<_>>();
        for id in stale {
            self.halt(st, &id).await;
        }
        for t in registered.iter() {
            self.start(st, t);
        }
    }

    async fn shutdown(&self, st: &mut State) {
        let tasks = st
            .running
            .drain()
            .map(|(_, active)| {
                let factory = Arc::clone(&self.factory);
                tokio::spawn(async move { active.halt(&*factory).await })
            })
            .collect::<Vec<_>>();
        for t in tasks {
            if let Err(e) = t.await {
                log::error!("scheduler: {}", e);
            }
        }
    }

    async fn run(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        log::info!("scheduler: parallel");
        self.reconcile(st).await;

        loop {
            let ev = tokio::select! {
                _ = stop.wait() => break,
                ev = st.events.recv() => ev,
            };
            match ev {
                Some(SchedEvent::Added(t)) => self.start(st, &t),
                Some(SchedEvent::Removed(id)) | Some(SchedEvent::Interrupt(id)) => {
                    self.halt(st, &id).await
                }
                None => {
                    log::warn!("scheduler: registry is gone");
                    stop.wait().await;
                    break;
                }
            }
        }

        self.shutdown(st).await;
        log::info!("scheduler: stopped");
        Ok(())
    }
}

impl Service for Parallel {
    fn name(&self) -> String {
        "scheduler:parallel".to_string()
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.run(&mut stop).await })
    }
}
