//! In-memory set of registered targets.
//!
//! Targets, their latest stats and their round-robin timestamps live behind one
//! lock so the three maps always share the same membership.

use crate::{
    target::{Target, TargetId, TargetStats},
    HashMap,
};
use serde::Serialize;
use std::{
    sync::RwLock,
    time::{SystemTime, UNIX_EPOCH},
};
use thiserror::Error;
use tokio::sync::mpsc;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum RegistryError {
    #[error("target '{0}' already exists")]
    AlreadyExists(TargetId),
    #[error("target '{0}' not found")]
    NotFound(TargetId),
}

/// Events delivered to the scheduler loop.
#[derive(Debug, Clone, PartialEq)]
pub enum SchedEvent {
    Added(Target),
    Removed(TargetId),
    Interrupt(TargetId),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum State {
    Idle,
    Fuzzing,
}

/// Aggregated view over all registered targets.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Status {
    pub state: State,
    pub targets: usize,
    pub tests_per_second: f64,
    pub bugs_found: u64,
}

#[derive(Default)]
struct Inner {
    targets: HashMap<TargetId, Target>,
    stats: HashMap<TargetId, TargetStats>,
    timer: HashMap<TargetId, u64>,
}

pub struct Registry {
    inner: RwLock<Inner>,
    events: mpsc::UnboundedSender<SchedEvent>,
}

impl Registry {
    pub fn new(events: mpsc::UnboundedSender<SchedEvent>) -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
            events,
        }
    }

    pub fn add(&self, target: Target) -> Result<(), RegistryError> {
        let mut inner = self.write();
        let id = target.unique_id.clone();
        if inner.targets.contains_key(&id) {
            return Err(RegistryError::AlreadyExists(id));
        }
        inner.stats.insert(id.clone(), TargetStats::empty(&id));
        inner.timer.insert(id.clone(), 0);
        inner.targets.insert(id, target.clone());
        self.notify(SchedEvent::Added(target));
        Ok(())
    }

    pub fn remove(&self, id: &str) -> Result<Target, RegistryError> {
        let mut inner = self.write();
        let target = inner
            .targets
            .remove(id)
            .ok_or_else(|| RegistryError::NotFound(id.to_string()))?;
        inner.stats.remove(id);
        inner.timer.remove(id);
        self.notify(SchedEvent::Removed(id.to_string()));
        Ok(target)
    }

    /// Asks the scheduler to end the target's current slice.
    pub fn interrupt(&self, id: &str) -> Result<(), RegistryError> {
        if !self.read().targets.contains_key(id) {
            return Err(RegistryError::NotFound(id.to_string()));
        }
        self.notify(SchedEvent::Interrupt(id.to_string()));
        Ok(())
    }

    /// Point-in-time copy of every registered target.
    pub fn list(&self) -> Vec<Target> {
        self.read().targets.values().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Target> {
        self.read().targets.get(id).cloned()
    }

    pub fn stats(&self, id: &str) -> Option<TargetStats> {
        self.read().stats.get(id).cloned()
    }

    pub fn len(&self) -> usize {
        self.read().targets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Picks the target that waited longest, see [`next_target`].
    pub fn next_target(&self, current: Option<&str>) -> Option<Target> {
        let inner = self.read();
        let id = next_target(&inner.timer, current)?;
        inner.targets.get(&id).cloned()
    }

    /// Marks the end of a target's slice.
    pub fn touch(&self, id: &str) {
        let mut inner = self.write();
        if let Some(t) = inner.timer.get_mut(id) {
            *t = unix_now();
        }
    }

    /// Replaces the stats of a still-registered target. Returns false when the
    /// target is gone.
    pub fn update_stats(&self, stats: TargetStats) -> bool {
        let mut inner = self.write();
        match inner.stats.get_mut(&stats.id) {
            Some(s) => {
                *s = stats;
                true
            }
            None => false,
        }
    }

    pub fn status(&self) -> Status {
        let inner = self.read();
        let (tests_per_second, bugs_found) = inner
            .stats
            .values()
            .fold((0.0, 0), |(t, b), s| (t + s.tests_per_second, b + s.bugs_found));
        Status {
            state: if inner.targets.is_empty() {
                State::Idle
            } else {
                State::Fuzzing
            },
            targets: inner.targets.len(),
            tests_per_second,
            bugs_found,
        }
    }

    fn notify(&self, ev: SchedEvent) {
        if self.events.send(ev).is_err() {
            log::warn!("registry: scheduler is gone, event dropped");
        }
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, Inner> {
        self.inner.read().unwrap_or_else(|e| e.into_inner())
    }

    fn write(&self) -> std::sync::RwLockWriteGuard<'_, Inner> {
        self.inner.write().unwrap_or_else(|e| e.into_inner())
    }

    #[cfg(test)]
    fn consistent(&self) -> bool {
        let inner = self.read();
        inner.targets.len() == inner.stats.len()
            && inner.targets.len() == inner.timer.len()
            && inner
                .targets
                .keys()
                .all(|k| inner.stats.contains_key(k) && inner.timer.contains_key(k))
    }

    #[cfg(test)]
    fn set_timer(&self, id: &str, t: u64) {
        self.write().timer.insert(id.to_string(), t);
    }
}

/// Round-robin choice: nothing for no targets, the sole target when there is
/// one, otherwise the oldest timestamp excluding `current`. Ties are unordered.
pub fn next_target(timer: &HashMap<TargetId, u64>, current: Option<&str>) -> Option<TargetId> {
    match timer.len() {
        0 => None,
        1 => timer.keys().next().cloned(),
        _ => timer
            .iter()
            .filter(|(id, _)| Some(id.as_str()) != current)
            .min_by_key(|(_, t)| **t)
            .map(|(id, _)| id.clone()),
    }
}

pub fn unix_now() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}
