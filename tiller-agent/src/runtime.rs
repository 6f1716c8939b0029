//! The process runtime seam.
//!
//! Starting, stopping and probing actual processes (or containers) is an
//! external collaborator; the agent only drives this interface. A fake
//! implementation for tests lives in [`crate::testing`].
use async_trait::async_trait;
use std::path::PathBuf;
use thiserror::Error;
use tiller_core::kinds::{ProbeSpec, WorkloadUnit};

/// A failure reported by the process runtime
#[derive(Debug, Error, Clone)]
#[error("runtime: {0}")]
pub struct RuntimeError(pub String);

/// Opaque handle on one started unit's process group
#[derive(Clone, Debug, Eq, PartialEq, Hash)]
pub struct ProcessHandle {
    /// Runtime-assigned identifier
    pub id: u64,
}

/// Observed state of a started unit's processes
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProcessState {
    /// All processes are alive
    Running,
    /// The unit's processes have exited; zero means success
    Exited(i32),
}

/// What a successful start hands back to the agent
#[derive(Clone, Debug)]
pub struct StartedUnit {
    /// Handle for later stop/probe/state calls
    pub handle: ProcessHandle,
    /// Address the unit is reachable at; reported on status for the
    /// endpoint controller
    pub unit_ip: String,
}

/// Drives local processes for one node.
///
/// All calls are bounded: implementations must enforce their own timeouts
/// so the agent's loops never block indefinitely.
#[async_trait]
pub trait ProcessRuntime: Send + Sync + 'static {
    /// Start the unit's processes from fetched artifacts
    async fn start(&self, unit: &WorkloadUnit, artifacts: &[PathBuf]) -> Result<StartedUnit, RuntimeError>;

    /// Deliver the graceful-stop signal; processes may keep running until
    /// they exit or are killed
    async fn signal_stop(&self, handle: &ProcessHandle) -> Result<(), RuntimeError>;

    /// Force-terminate immediately
    async fn kill(&self, handle: &ProcessHandle) -> Result<(), RuntimeError>;

    /// Current process state
    async fn state(&self, handle: &ProcessHandle) -> Result<ProcessState, RuntimeError>;

    /// Run a probe; `Ok(true)` means the probe passed
    async fn probe(&self, handle: &ProcessHandle, probe: &ProbeSpec) -> Result<bool, RuntimeError>;
}
