//! One target at a time, each for a fixed slice.
//!
//! The target that waited longest goes next. When a slice ends and the same
//! target would be picked again (it is the only one), its workers keep running
//! and only the slice timer restarts. The outgoing target's supervisor is
//! always stopped before the next one starts.

use super::{Active, SupervisorFactory};
use crate::{
    registry::{Registry, SchedEvent},
    supervisor::{ServeFuture, Service, ServiceError, Stop},
    target::TargetId,
};
use std::{sync::Arc, time::Duration};
use tokio::{
    sync::{mpsc, Mutex},
    time::{sleep_until, Instant},
};

/// Pause after a target could not be started.
const UNSTARTABLE_IDLE: Duration = Duration::from_secs(1);

struct Slice {
    active: Active,
    deadline: Instant,
}

struct State {
    events: mpsc::UnboundedReceiver<SchedEvent>,
    current: Option<Slice>,
    /// Last target that ran, excluded from the next pick.
    last: Option<TargetId>,
}

pub struct RoundRobin {
    registry: Arc<Registry>,
    factory: Arc<dyn SupervisorFactory>,
    interval: Duration,
    state: Mutex<State>,
}

enum Wake {
    Stop,
    Event(Option<SchedEvent>),
    Deadline,
}

impl RoundRobin {
    pub fn new(
        registry: Arc<Registry>,
        factory: Arc<dyn SupervisorFactory>,
        events: mpsc::UnboundedReceiver<SchedEvent>,
        interval: Duration,
    ) -> Self {
        Self {
            registry,
            factory,
            interval,
            state: Mutex::new(State {
                events,
                current: None,
                last: None,
            }),
        }
    }

    async fn end_slice(&self, st: &mut State) {
        if let Some(slice) = st.current.take() {
            slice.active.halt(&*self.factory).await;
        }
    }

    /// Starts the next target if nothing runs. Returns false while idle.
    async fn fill(&self, st: &mut State, stop: &mut Stop) -> bool {
        if st.current.is_some() {
            return true;
        }
        let target = match self.registry.next_target(st.last.as_deref()) {
            Some(t) => t,
            None => return false,
        };
        st.last = Some(target.unique_id.clone());
        match Active::start(&*self.factory, &target) {
            Some(active) => {
                st.current = Some(Slice {
                    active,
                    deadline: Instant::now() + self.interval,
                });
                true
            }
            None => {
                self.registry.touch(target.id());
                stop.sleep(UNSTARTABLE_IDLE).await;
                false
            }
        }
    }

    async fn run(&self, stop: &mut Stop) -> Result<(), ServiceError> {
        let mut guard = self.state.lock().await;
        let st = &mut *guard;
        log::info!("scheduler: round-robin, {:?} per target", self.interval);

        loop {
            if stop.requested() {
                break;
            }
            let busy = self.fill(st, stop).await;
            if !busy && !self.registry.is_empty() {
                continue;
            }

            let deadline = st.current.as_ref().map(|s| s.deadline);
            let wake = tokio::select! {
                _ = stop.wait() => Wake::Stop,
                ev = st.events.recv() => Wake::Event(ev),
                _ = sleep_until(deadline.unwrap_or_else(Instant::now)), if deadline.is_some() => Wake::Deadline,
            };

            match wake {
                Wake::Stop => break,
                Wake::Event(None) => {
                    log::warn!("scheduler: registry is gone");
                    stop.wait().await;
                    break;
                }
                Wake::Event(Some(ev)) => self.on_event(st, ev).await,
                Wake::Deadline => self.on_deadline(st).await,
            }
        }

        self.end_slice(st).await;
        log::info!("scheduler: stopped");
        Ok(())
    }

    async fn on_event(&self, st: &mut State, ev: SchedEvent) {
        let current = st.current.as_ref().map(|s| s.active.id.clone());
        match ev {
            SchedEvent::Added(t) => log::debug!("scheduler: target {} queued", t.id()),
            SchedEvent::Removed(id) if current.as_deref() == Some(id.as_str()) => {
                target_info!(id, "target removed, picking new target");
                self.end_slice(st).await;
            }
            SchedEvent::Interrupt(id) if current.as_deref() == Some(id.as_str()) => {
                target_info!(id, "slice interrupted, picking new target");
                self.end_slice(st).await;
            }
            // interrupts for targets not running are no-ops
            SchedEvent::Removed(_) | SchedEvent::Interrupt(_) => (),
        }
    }

    async fn on_deadline(&self, st: &mut State) {
        let id = match st.current.as_ref() {
            Some(s) => s.active.id.clone(),
            None => return,
        };
        self.registry.touch(&id);
        let next = self.registry.next_target(Some(&id));
        if next.as_ref().map(|t| t.id()) == Some(id.as_str()) {
            target_info!(id, "only target, extending slice");
            if let Some(s) = st.current.as_mut() {
                s.deadline = Instant::now() + self.interval;
            }
            return;
        }
        target_info!(id, "cycle finished, picking new target");
        self.end_slice(st).await;
    }
}

impl Service for RoundRobin {
    fn name(&self) -> String {
        "scheduler:robin".to_string()
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move { self.run(&mut stop).await })
    }
}
