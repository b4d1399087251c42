//! Domain records for bots and owners.
//!
//! These mirror the persisted rows in the state store. The live execution
//! handle is deliberately absent: it exists only inside the orchestrator's
//! registry and is never written to disk, so a daemon restart always begins
//! from "no units running".

use botplane_id::{BotId, OwnerId};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;

use crate::plan::Plan;

/// Lifecycle status of a bot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BotStatus {
    Stopped,
    Running,
}

impl BotStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Stopped => "stopped",
            Self::Running => "running",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "stopped" => Some(Self::Stopped),
            "running" => Some(Self::Running),
            _ => None,
        }
    }
}

/// Which execution backend a bot was created for.
///
/// Chosen once at creation; everything downstream goes through the
/// `ExecutionBackend` trait and never branches on the kind again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Process,
    Container,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Process => "process",
            Self::Container => "container",
        }
    }

    pub fn from_str_opt(s: &str) -> Option<Self> {
        match s {
            "process" => Some(Self::Process),
            "container" => Some(Self::Container),
            _ => None,
        }
    }
}

/// A hosted workload.
#[derive(Debug, Clone)]
pub struct Bot {
    pub id: BotId,
    pub owner: OwnerId,
    pub name: String,

    /// Directory holding the bot's code, owned by the ingestion pipeline.
    pub code_dir: String,
    /// Entrypoint file inside `code_dir`.
    pub entrypoint: String,
    /// Opaque ciphertext; decrypted only transiently at launch.
    pub token: String,
    pub backend: BackendKind,

    pub status: BotStatus,
    pub sleep_mode: bool,
    pub sleep_reason: Option<String>,

    // Resource ledger
    pub total_seconds: i64,
    pub remaining_seconds: i64,
    pub power_max: f64,
    pub power_remaining: f64,

    // Restart bookkeeping
    pub restart_count: u32,
    pub last_restart_at: Option<DateTime<Utc>>,
    pub auto_recovery_used: bool,

    /// Last time drain was applied.
    pub last_checked: DateTime<Utc>,
    /// Low-time warning already sent for the current depletion cycle.
    pub warned_low: bool,

    pub created_at: DateTime<Utc>,
}

/// An account hosting bots.
#[derive(Debug, Clone)]
pub struct Owner {
    pub id: OwnerId,
    pub plan: Plan,
    /// UTC date of the owner's last free recovery; gates one per day
    /// across all of the owner's bots.
    pub last_recovery_date: Option<NaiveDate>,
    pub created_at: DateTime<Utc>,
}

impl Owner {
    /// Whether the daily recovery gate is open on `today`.
    pub fn can_recover(&self, today: NaiveDate) -> bool {
        self.last_recovery_date != Some(today)
    }
}

/// Read-only snapshot returned by `get_status`.
#[derive(Debug, Clone, Serialize)]
pub struct BotSnapshot {
    pub id: BotId,
    pub name: String,
    pub status: BotStatus,
    pub sleep_mode: bool,
    pub sleep_reason: Option<String>,
    pub total_seconds: i64,
    pub remaining_seconds: i64,
    pub power_max: f64,
    pub power_remaining: f64,
    pub restart_count: u32,
    pub auto_recovery_used: bool,
    /// Live CPU sample when the bot has a running unit.
    pub cpu_percent: Option<f64>,
    /// Live RSS sample when the bot has a running unit.
    pub memory_mb: Option<f64>,
}
