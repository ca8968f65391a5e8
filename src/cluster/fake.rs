//! In-memory runtime for tests.

use super::{ClusterRuntime, RuntimeError, UnitSpec, UnitState};
use crate::{target_log::OutputSink, HashMap};
use std::{sync::Mutex, time::Duration};

#[derive(Default)]
struct Unit {
    spec: UnitSpec,
    running: bool,
    exit_code: i64,
    inspections: u32,
}

#[derive(Default)]
struct Inner {
    units: HashMap<String, Unit>,
    specs: HashMap<String, UnitSpec>,
    calls: Vec<(String, &'static str)>,
    commits: usize,
    build_exit: i64,
    build_duration: u32,
    fail_stop: bool,
    fail_remove: bool,
    fail_create: bool,
    fail_inspect: bool,
}

pub struct FakeRuntime {
    inner: Mutex<Inner>,
}

impl Default for FakeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeRuntime {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
        }
    }

    pub fn set_build_exit(&self, code: i64) {
        self.inner.lock().unwrap().build_exit = code;
    }

    /// Number of inspections a build unit reports running.
    pub fn set_build_duration(&self, polls: u32) {
        self.inner.lock().unwrap().build_duration = polls;
    }

    pub fn fail_stop(&self, fail: bool) {
        self.inner.lock().unwrap().fail_stop = fail;
    }

    pub fn fail_remove(&self, fail: bool) {
        self.inner.lock().unwrap().fail_remove = fail;
    }

    pub fn fail_create(&self, fail: bool) {
        self.inner.lock().unwrap().fail_create = fail;
    }

    pub fn fail_inspect(&self, fail: bool) {
        self.inner.lock().unwrap().fail_inspect = fail;
    }

    /// Makes a running unit exit with `code`.
    pub fn exit(&self, id: &str, code: i64) {
        if let Some(u) = self.inner.lock().unwrap().units.get_mut(id) {
            u.running = false;
            u.exit_code = code;
        }
    }

    pub fn exists(&self, id: &str) -> bool {
        self.inner.lock().unwrap().units.contains_key(id)
    }

    pub fn running(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .units
            .get(id)
            .map(|u| u.running)
            .unwrap_or(false)
    }

    pub fn removed(&self, id: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .any(|(u, op)| u == id && *op == "remove")
    }

    pub fn spec(&self, id: &str) -> Option<UnitSpec> {
        self.inner.lock().unwrap().specs.get(id).cloned()
    }

    pub fn commits(&self) -> usize {
        self.inner.lock().unwrap().commits
    }

    pub fn calls_for(&self, id: &str) -> Vec<&'static str> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(u, _)| u == id)
            .map(|(_, op)| *op)
            .collect()
    }

    fn failed(cmd: &str) -> RuntimeError {
        RuntimeError::Failed {
            cmd: cmd.to_string(),
            status: "exit status: 1".to_string(),
            stderr: "injected".to_string(),
        }
    }
}

impl ClusterRuntime for FakeRuntime {
    fn ping(&self) -> Result<(), RuntimeError> {
        Ok(())
    }

    fn create(&self, spec: &UnitSpec) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((spec.name.clone(), "create"));
        if inner.fail_create {
            return Err(Self::failed("create"));
        }
        inner.specs.insert(spec.name.clone(), spec.clone());
        inner.units.insert(
            spec.name.clone(),
            Unit {
                spec: spec.clone(),
                ..Unit::default()
            },
        );
        Ok(spec.name.clone())
    }

    fn start(&self, id: &str) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((id.to_string(), "start"));
        match inner.units.get_mut(id) {
            Some(u) => {
                u.running = true;
                Ok(())
            }
            None => Err(Self::failed("start")),
        }
    }

    fn stop(&self, id: &str, _grace: Duration) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((id.to_string(), "stop"));
        if inner.fail_stop {
            return Err(Self::failed("stop"));
        }
        if let Some(u) = inner.units.get_mut(id) {
            u.running = false;
        }
        Ok(())
    }

    fn remove(&self, id: &str, _force: bool) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((id.to_string(), "remove"));
        if inner.fail_remove {
            return Err(Self::failed("remove"));
        }
        inner.units.remove(id);
        Ok(())
    }

    fn inspect(&self, id: &str) -> Result<UnitState, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_inspect {
            return Err(Self::failed("inspect"));
        }
        let (build_exit, build_duration) = (inner.build_exit, inner.build_duration);
        let u = inner
            .units
            .get_mut(id)
            .ok_or_else(|| Self::failed("inspect"))?;
        if u.spec.name.ends_with("_buildbox") && u.running {
            u.inspections += 1;
            if u.inspections > build_duration {
                u.running = false;
                u.exit_code = build_exit;
            }
        }
        Ok(UnitState {
            running: u.running,
            exit_code: u.exit_code,
        })
    }

    fn commit(&self, id: &str, repository: &str) -> Result<String, RuntimeError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push((id.to_string(), "commit"));
        inner.commits += 1;
        Ok(format!("sha256:{}", repository))
    }

    fn follow(&self, id: &str, _stdout: OutputSink, _stderr: OutputSink) -> Result<(), RuntimeError> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .push((id.to_string(), "follow"));
        Ok(())
    }
}
