//! In-process fakes for the agent's external collaborators.
//!
//! Used by this crate's tests and by downstream end-to-end tests that
//! drive a whole control plane without real processes.
use crate::{
    artifacts::{ArtifactFetcher, FetchError},
    runtime::{ProcessHandle, ProcessRuntime, ProcessState, RuntimeError, StartedUnit},
};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::{collections::HashMap, path::PathBuf};
use tiller_core::kinds::{ProbeSpec, WorkloadUnit};
use tiller_core::ResourceExt;

#[derive(Clone)]
struct FakeProcess {
    unit_name: String,
    state: ProcessState,
    liveness_ok: bool,
    readiness_ok: bool,
    /// whether the process honors the graceful-stop signal by exiting
    exits_on_signal: bool,
}

/// A scriptable [`ProcessRuntime`]
#[derive(Default)]
pub struct FakeRuntime {
    inner: Mutex<FakeRuntimeInner>,
}

#[derive(Default)]
struct FakeRuntimeInner {
    next_id: u64,
    processes: HashMap<u64, FakeProcess>,
    start_failures: u32,
    starts: u32,
    kills: u32,
}

impl FakeRuntime {
    /// Make the next `n` start calls fail
    pub fn fail_next_starts(&self, n: u32) {
        self.inner.lock().start_failures = n;
    }

    /// Total successful starts so far
    pub fn starts(&self) -> u32 {
        self.inner.lock().starts
    }

    /// Total force-kills so far
    pub fn kills(&self) -> u32 {
        self.inner.lock().kills
    }

    /// Handle of the running process for a unit name, if any
    pub fn handle_of(&self, unit_name: &str) -> Option<ProcessHandle> {
        self.inner
            .lock()
            .processes
            .iter()
            .find(|(_, p)| p.unit_name == unit_name && p.state == ProcessState::Running)
            .map(|(id, _)| ProcessHandle { id: *id })
    }

    /// Script the readiness probe outcome for a unit's process
    pub fn set_readiness(&self, unit_name: &str, ok: bool) {
        let mut inner = self.inner.lock();
        for process in inner.processes.values_mut() {
            if process.unit_name == unit_name {
                process.readiness_ok = ok;
            }
        }
    }

    /// Script the liveness probe outcome for a unit's process
    pub fn set_liveness(&self, unit_name: &str, ok: bool) {
        let mut inner = self.inner.lock();
        for process in inner.processes.values_mut() {
            if process.unit_name == unit_name {
                process.liveness_ok = ok;
            }
        }
    }

    /// Make a unit's process exit with the given code
    pub fn exit(&self, unit_name: &str, code: i32) {
        let mut inner = self.inner.lock();
        for process in inner.processes.values_mut() {
            if process.unit_name == unit_name {
                process.state = ProcessState::Exited(code);
            }
        }
    }

    /// Whether processes honor the graceful-stop signal by exiting
    pub fn set_honors_stop_signal(&self, unit_name: &str, honors: bool) {
        let mut inner = self.inner.lock();
        for process in inner.processes.values_mut() {
            if process.unit_name == unit_name {
                process.exits_on_signal = honors;
            }
        }
    }
}

#[async_trait]
impl ProcessRuntime for FakeRuntime {
    async fn start(&self, unit: &WorkloadUnit, _artifacts: &[PathBuf]) -> Result<StartedUnit, RuntimeError> {
        let mut inner = self.inner.lock();
        if inner.start_failures > 0 {
            inner.start_failures -= 1;
            return Err(RuntimeError("injected start failure".into()));
        }
        inner.next_id += 1;
        inner.starts += 1;
        let id = inner.next_id;
        inner.processes.insert(id, FakeProcess {
            unit_name: unit.name_any(),
            state: ProcessState::Running,
            liveness_ok: true,
            readiness_ok: true,
            exits_on_signal: true,
        });
        Ok(StartedUnit {
            handle: ProcessHandle { id },
            unit_ip: format!("10.1.0.{id}"),
        })
    }

    async fn signal_stop(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        if let Some(process) = inner.processes.get_mut(&handle.id) {
            if process.exits_on_signal {
                process.state = ProcessState::Exited(0);
            }
        }
        Ok(())
    }

    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError> {
        let mut inner = self.inner.lock();
        inner.kills += 1;
        if let Some(process) = inner.processes.get_mut(&handle.id) {
            if process.state == ProcessState::Running {
                process.state = ProcessState::Exited(137);
            }
        }
        Ok(())
    }

    async fn state(&self, handle: &ProcessHandle) -> Result<ProcessState, RuntimeError> {
        self.inner
            .lock()
            .processes
            .get(&handle.id)
            .map(|p| p.state)
            .ok_or_else(|| RuntimeError("unknown handle".into()))
    }

    async fn probe(&self, handle: &ProcessHandle, probe: &ProbeSpec) -> Result<bool, RuntimeError> {
        let inner = self.inner.lock();
        let process = inner
            .processes
            .get(&handle.id)
            .ok_or_else(|| RuntimeError("unknown handle".into()))?;
        Ok(match probe.action.as_str() {
            "liveness" => process.liveness_ok,
            "readiness" => process.readiness_ok,
            _ => true,
        })
    }
}

/// A scriptable [`ArtifactFetcher`]
#[derive(Default)]
pub struct FakeFetcher {
    inner: Mutex<HashMap<String, FetchScript>>,
}

#[derive(Default)]
struct FetchScript {
    remaining_failures: u32,
    calls: u32,
}

impl FakeFetcher {
    /// Make the next `n` fetches of `reference` fail
    pub fn fail_times(&self, reference: &str, n: u32) {
        self.inner.lock().entry(reference.to_string()).or_default().remaining_failures = n;
    }

    /// How often `reference` has been fetched
    pub fn calls(&self, reference: &str) -> u32 {
        self.inner.lock().get(reference).map(|s| s.calls).unwrap_or(0)
    }
}

#[async_trait]
impl ArtifactFetcher for FakeFetcher {
    async fn fetch(&self, reference: &str) -> Result<PathBuf, FetchError> {
        let mut inner = self.inner.lock();
        let script = inner.entry(reference.to_string()).or_default();
        script.calls += 1;
        if script.remaining_failures > 0 {
            script.remaining_failures -= 1;
            return Err(FetchError {
                reference: reference.to_string(),
                message: "injected fetch failure".into(),
            });
        }
        Ok(PathBuf::from(format!("/var/lib/tiller/artifacts/{}", reference.replace([':', '/'], "_"))))
    }
}
