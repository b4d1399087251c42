//! Error taxonomy for orchestrator operations.

use thiserror::Error;

use crate::backend::BackendError;
use crate::store::StoreError;

/// Typed failures returned by orchestrator operations.
///
/// User-facing operations surface these to the command layer; background
/// loops log them and keep going. Notification failures never appear here.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    /// Bot or owner does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// The caller does not own the bot.
    #[error("permission denied")]
    PermissionDenied,

    /// No time or no power left at start time.
    #[error("resources exhausted: no time or power remaining")]
    ResourceExhausted,

    /// Start refused while the bot is asleep; a top-up or recovery is
    /// required first.
    #[error("bot is in sleep mode: {reason}")]
    Sleeping { reason: String },

    /// Adding time would exceed the plan cap, or the owner is at their
    /// bot limit.
    #[error("plan limit exceeded: {0}")]
    PlanLimitExceeded(String),

    /// The daily or per-bot recovery allowance is already spent.
    #[error("recovery unavailable: {0}")]
    RecoveryUnavailable(String),

    /// A start raced another start for the same bot.
    #[error("bot already running")]
    AlreadyRunning,

    /// The execution backend failed to launch the unit.
    #[error("launch failed: {0}")]
    Launch(#[source] BackendError),

    /// The backend cannot be reached for stats or stop.
    #[error("execution backend unavailable: {0}")]
    BackendUnavailable(String),

    /// State store failure.
    #[error("storage error: {0}")]
    Storage(#[from] StoreError),
}
