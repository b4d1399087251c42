//! Execution backend interface and implementations.
//!
//! A backend launches, stops and samples one isolated execution unit per
//! bot. Two production variants exist - a bare OS process group and a
//! hardened container - selected per bot at creation time. Everything
//! above this module goes through the [`ExecutionBackend`] trait and never
//! branches on the variant.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use botplane_id::{BotId, UnitId};
use chrono::{DateTime, Utc};
use thiserror::Error;

pub mod container;
pub mod mock;
pub mod process;

pub use container::ContainerBackend;
pub use mock::MockBackend;
pub use process::ProcessBackend;

/// Errors from backend operations.
#[derive(Debug, Error)]
pub enum BackendError {
    /// The workload image is not available to the runtime.
    #[error("image missing: {0}")]
    ImageMissing(String),

    /// The host cannot grant the requested resource limits.
    #[error("resource limit exceeded: {0}")]
    ResourceLimitExceeded(String),

    /// Launching the unit failed at the OS level.
    #[error("launch I/O error: {0}")]
    Launch(#[from] std::io::Error),

    /// The runtime API rejected a request.
    #[error("runtime API error {status}: {message}")]
    Api { status: u16, message: String },

    /// The runtime cannot be reached at all.
    #[error("runtime unavailable: {0}")]
    Unavailable(String),
}

/// Everything a backend needs to launch one bot.
///
/// `token` is the decrypted secret; it lives only for the duration of the
/// launch call and is handed to the unit via its environment.
#[derive(Debug, Clone)]
pub struct LaunchSpec {
    pub bot_id: BotId,
    pub code_dir: PathBuf,
    pub entrypoint: String,
    pub token: String,
    /// Remaining hosting time; the container variant derives its hard
    /// deadline from this.
    pub remaining_seconds: i64,
    /// CPU quota in milli-cores.
    pub cpu_limit_millis: u64,
    /// Memory limit in bytes.
    pub memory_limit_bytes: u64,
}

/// Live handle to a launched unit.
///
/// Installed in the orchestrator registry before `launch` returns, so the
/// watchers always find the handle and the stderr location ready.
#[derive(Debug, Clone)]
pub struct ExecutionUnit {
    pub unit_id: UnitId,
    pub bot_id: BotId,
    /// Backend-specific identifier: pid for processes, container id for
    /// containers.
    pub runtime_ref: String,
    /// File the unit's stderr is appended to; the LogWatcher tails this.
    pub stderr_path: PathBuf,
    pub started_at: DateTime<Utc>,
}

/// One resource sample of a running unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct UnitStats {
    pub cpu_percent: f64,
    pub memory_mb: f64,
    pub alive: bool,
}

impl UnitStats {
    /// The sample for a unit that no longer exists (not an error).
    pub fn gone() -> Self {
        Self {
            cpu_percent: 0.0,
            memory_mb: 0.0,
            alive: false,
        }
    }
}

/// Launches, stops and observes isolated execution units.
#[async_trait]
pub trait ExecutionBackend: Send + Sync {
    /// Launch a unit for the given spec.
    async fn launch(&self, spec: &LaunchSpec) -> Result<ExecutionUnit, BackendError>;

    /// Stop the unit: graceful signal, grace wait, forced kill.
    ///
    /// Returns `true` when something was actually running.
    async fn stop(&self, unit: &ExecutionUnit, grace: Duration) -> Result<bool, BackendError>;

    /// Sample CPU/memory/liveness. A vanished unit yields zeros.
    async fn stats(&self, unit: &ExecutionUnit) -> Result<UnitStats, BackendError>;

    /// Non-blocking exit probe: `Some(code)` once the unit has terminated.
    async fn poll_exit(&self, unit: &ExecutionUnit) -> Result<Option<i32>, BackendError>;
}
