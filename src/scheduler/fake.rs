//! Worker sets that only record their lifetime.

use super::{FactoryError, SupervisorFactory};
use crate::{
    supervisor::{ServeFuture, Service, Stop, Supervisor, SupervisorSpec},
    target::Target,
    HashMap,
};
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
    time::Duration,
};

#[derive(Default)]
pub struct Probe {
    active: AtomicUsize,
    max_active: AtomicUsize,
    starts: Mutex<HashMap<String, usize>>,
    released: Mutex<Vec<String>>,
}

impl Probe {
    pub fn active(&self) -> usize {
        self.active.load(Ordering::SeqCst)
    }

    pub fn max_active(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }

    pub fn starts(&self, id: &str) -> usize {
        self.starts.lock().unwrap().get(id).copied().unwrap_or(0)
    }

    pub fn released(&self) -> Vec<String> {
        self.released.lock().unwrap().clone()
    }
}

struct Worker {
    id: String,
    probe: Arc<Probe>,
}

impl Service for Worker {
    fn name(&self) -> String {
        format!("worker:{}", self.id)
    }

    fn serve(self: Arc<Self>, mut stop: Stop) -> ServeFuture {
        Box::pin(async move {
            let now = self.probe.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.probe.max_active.fetch_max(now, Ordering::SeqCst);
            *self
                .probe
                .starts
                .lock()
                .unwrap()
                .entry(self.id.clone())
                .or_default() += 1;
            stop.wait().await;
            self.probe.active.fetch_sub(1, Ordering::SeqCst);
            Ok(())
        })
    }
}

/// Accepts every language except `ruby`.
pub struct FakeFactory {
    pub probe: Arc<Probe>,
}

impl FakeFactory {
    pub fn new() -> Self {
        Self {
            probe: Arc::new(Probe::default()),
        }
    }
}

impl SupervisorFactory for FakeFactory {
    fn build(&self, target: &Target) -> Result<Supervisor, FactoryError> {
        if target.language == "ruby" {
            return Err(FactoryError::UnsupportedLanguage(target.language.clone()));
        }
        let spec = SupervisorSpec {
            timeout: Duration::from_secs(5),
            ..SupervisorSpec::default()
        };
        let mut sup = Supervisor::new(format!("target:{}", target.id()), spec);
        sup.add(Arc::new(Worker {
            id: target.unique_id.clone(),
            probe: Arc::clone(&self.probe),
        }));
        Ok(sup)
    }

    fn release(&self, id: &str) {
        self.probe.released.lock().unwrap().push(id.to_string());
    }
}

pub fn target(id: &str, language: &str) -> Target {
    Target {
        name: id.to_string(),
        unique_id: id.to_string(),
        language: language.to_string(),
        location: format!("https://example.org/{}.git", id),
        revision: "r1".to_string(),
    }
}
