//! Resource ledger: pure transitions over a bot's time and power budget.
//!
//! Time drains one second per elapsed wall-clock second while the bot runs.
//! Power drains proportionally to CPU usage:
//!
//! ```text
//! power_drop = (cpu_percent / 100) * elapsed_seconds * drain_factor
//! ```
//!
//! where the factor shrinks for idle workloads. Both resources clamp at
//! zero and never exceed their stored maxima. No I/O happens here; the
//! enforcement loop and restart policy call into this module and persist
//! the results themselves.

use thiserror::Error;

use crate::model::Bot;
use crate::plan::PlanLimits;

/// Multiplier converting `cpu% * seconds` into a power deduction.
pub const BASE_DRAIN_FACTOR: f64 = 0.02;
/// CPU percent below which a workload counts as idle.
pub const IDLE_CPU_THRESHOLD: f64 = 2.0;
/// Drain reduction applied to idle workloads.
pub const IDLE_DRAIN_MULTIPLIER: f64 = 0.2;
/// Remaining time at or below which the one-shot low warning fires.
pub const LOW_TIME_THRESHOLD_SECS: i64 = 600;
/// Time granted by a free recovery.
pub const RECOVERY_TIME_GRANT_SECS: i64 = 3600;
/// Power granted by a free recovery.
pub const RECOVERY_POWER_GRANT: f64 = 20.0;

/// Adding this much time would push `total_seconds` past the plan cap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("total time would exceed the plan cap")]
pub struct PlanCapExceeded;

/// Computes post-drain `(remaining_seconds, power_remaining)` values.
pub fn drain(
    remaining_seconds: i64,
    power_remaining: f64,
    elapsed_seconds: i64,
    cpu_percent: f64,
) -> (i64, f64) {
    let mut factor = BASE_DRAIN_FACTOR;
    if cpu_percent < IDLE_CPU_THRESHOLD {
        factor *= IDLE_DRAIN_MULTIPLIER;
    }
    let power_drop = (cpu_percent / 100.0) * elapsed_seconds as f64 * factor;

    let new_remaining = (remaining_seconds - elapsed_seconds).max(0);
    let new_power = (power_remaining - power_drop).max(0.0);
    (new_remaining, new_power)
}

impl Bot {
    /// Applies elapsed-time and CPU drain to the ledger in place.
    pub fn apply_drain(&mut self, elapsed_seconds: i64, cpu_percent: f64) {
        let (remaining, power) = drain(
            self.remaining_seconds,
            self.power_remaining,
            elapsed_seconds,
            cpu_percent,
        );
        self.remaining_seconds = remaining;
        self.power_remaining = power;
    }

    /// Adds hosting time plus a proportional power credit.
    ///
    /// The credit is the fraction of the plan maximum being added, in power
    /// points, capped by `power_max`. Returns the credited power. Clears the
    /// low-time warning latch so the next depletion cycle warns again.
    pub fn add_time(&mut self, seconds: i64, limits: &PlanLimits) -> Result<f64, PlanCapExceeded> {
        if self.total_seconds + seconds > limits.max_total_seconds {
            return Err(PlanCapExceeded);
        }
        let credit = ((seconds as f64 / limits.max_total_seconds as f64) * 100.0).min(100.0);
        self.total_seconds += seconds;
        self.remaining_seconds += seconds;
        self.power_remaining = (self.power_remaining + credit).min(self.power_max);
        self.warned_low = false;
        Ok(credit)
    }

    /// Adds power points, capped at `power_max`. Returns the new level.
    pub fn add_power(&mut self, pct: f64) -> f64 {
        self.power_remaining = (self.power_remaining + pct).min(self.power_max);
        self.power_remaining
    }

    /// Either resource has run out.
    pub fn is_depleted(&self) -> bool {
        self.remaining_seconds == 0 || self.power_remaining <= 0.0
    }

    /// Remaining time is positive but inside the warning threshold.
    pub fn is_low(&self) -> bool {
        self.remaining_seconds > 0 && self.remaining_seconds <= LOW_TIME_THRESHOLD_SECS
    }

    /// Replaces the ledger with the small free-recovery envelope.
    ///
    /// Recovery is a fresh start, not a top-up: the bot gets one hour and
    /// 20% power, and a later `add_time` can grow the ledger back toward
    /// the plan cap.
    pub fn apply_recovery_grant(&mut self) {
        self.total_seconds = RECOVERY_TIME_GRANT_SECS;
        self.remaining_seconds = RECOVERY_TIME_GRANT_SECS;
        self.power_max = RECOVERY_POWER_GRANT;
        self.power_remaining = RECOVERY_POWER_GRANT;
        self.warned_low = false;
    }
}
