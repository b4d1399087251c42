//! Restart policy: what to do when a unit exits unexpectedly.
//!
//! The decision is pure and ordered; the orchestrator executes it. Rules,
//! first match wins:
//!
//! 1. too many restarts since the last successful start -> quarantine
//! 2. inside the cooldown window -> skip silently
//! 3. depleted but a free recovery is available -> recover and relaunch
//! 4. depleted or already asleep -> sleep
//! 5. otherwise -> charge the restart cost and relaunch after a short delay
//!
//! The restart counter is a lifetime count reset only by a successful
//! start, not a sliding time window; a quarantined bot is released by the
//! next successful manual start.

use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::model::Bot;

/// Restarts tolerated before the circuit breaker trips.
pub const ANTI_LOOP_LIMIT: u32 = 5;
/// Minimum spacing between automatic restarts.
pub const RESTART_COOLDOWN: Duration = Duration::from_secs(60);
/// Power charged per automatic restart.
pub const RESTART_POWER_COST: f64 = 2.0;
/// Hosting time charged per automatic restart.
pub const RESTART_TIME_COST_SECS: i64 = 60;
/// Delay before the relaunch attempt, to soften tight crash loops.
pub const RESTART_RETRY_DELAY: Duration = Duration::from_secs(3);

/// Sleep reason recorded when the circuit breaker trips.
pub const REASON_ANTI_LOOP: &str = "anti_loop";
/// Sleep reason recorded when an exited bot has no resources left.
pub const REASON_NO_RESOURCES: &str = "expired_or_no_power";

/// Outcome of evaluating an unexpected exit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestartDecision {
    /// Circuit breaker: sleep with [`REASON_ANTI_LOOP`], no relaunch.
    Quarantine,
    /// Exit landed inside the cooldown window: log it, stay stopped.
    SkipCooldown,
    /// Depleted, but the owner's daily gate and the bot's one-shot flag
    /// are both open: grant recovery and relaunch at no cost.
    FreeRecovery,
    /// Depleted (or already asleep) with no recovery available: sleep
    /// with [`REASON_NO_RESOURCES`].
    Sleep,
    /// Healthy enough to retry: charge the restart cost and relaunch.
    ChargedRestart,
}

/// Restart policy parameters.
#[derive(Debug, Clone)]
pub struct RestartPolicy {
    pub anti_loop_limit: u32,
    pub cooldown: Duration,
    pub power_cost: f64,
    pub time_cost_secs: i64,
    pub retry_delay: Duration,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self {
            anti_loop_limit: ANTI_LOOP_LIMIT,
            cooldown: RESTART_COOLDOWN,
            power_cost: RESTART_POWER_COST,
            time_cost_secs: RESTART_TIME_COST_SECS,
            retry_delay: RESTART_RETRY_DELAY,
        }
    }
}

impl RestartPolicy {
    /// Evaluate an unexpected exit against the bot's current state.
    ///
    /// `owner_can_recover` is the owner-level daily gate, already resolved
    /// by the caller against today's UTC date.
    pub fn decide(
        &self,
        bot: &Bot,
        owner_can_recover: bool,
        now: DateTime<Utc>,
    ) -> RestartDecision {
        if bot.restart_count >= self.anti_loop_limit {
            return RestartDecision::Quarantine;
        }

        if let Some(last) = bot.last_restart_at {
            let since = (now - last).num_seconds();
            if since >= 0 && (since as u64) < self.cooldown.as_secs() {
                return RestartDecision::SkipCooldown;
            }
        }

        if bot.is_depleted() && owner_can_recover && !bot.auto_recovery_used {
            return RestartDecision::FreeRecovery;
        }

        if bot.is_depleted() || bot.sleep_mode {
            return RestartDecision::Sleep;
        }

        RestartDecision::ChargedRestart
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{BackendKind, BotStatus};
    use botplane_id::{BotId, OwnerId};
    use chrono::TimeZone;
    use rstest::rstest;

    fn healthy_bot() -> Bot {
        Bot {
            id: BotId::new(),
            owner: OwnerId::new(),
            name: "t".to_string(),
            code_dir: "/tmp/t".to_string(),
            entrypoint: "main.py".to_string(),
            token: "tok".to_string(),
            backend: BackendKind::Process,
            status: BotStatus::Stopped,
            sleep_mode: false,
            sleep_reason: None,
            total_seconds: 86_400,
            remaining_seconds: 80_000,
            power_max: 30.0,
            power_remaining: 20.0,
            restart_count: 0,
            last_restart_at: None,
            auto_recovery_used: false,
            last_checked: Utc::now(),
            warned_low: false,
            created_at: Utc::now(),
        }
    }

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(1_700_000_000 + secs, 0).unwrap()
    }

    #[test]
    fn healthy_exit_charges_and_retries() {
        let policy = RestartPolicy::default();
        let bot = healthy_bot();
        assert_eq!(
            policy.decide(&bot, true, at(0)),
            RestartDecision::ChargedRestart
        );
    }

    #[test]
    fn anti_loop_trips_at_limit() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.restart_count = ANTI_LOOP_LIMIT;
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::Quarantine);

        bot.restart_count = ANTI_LOOP_LIMIT - 1;
        assert_ne!(policy.decide(&bot, true, at(0)), RestartDecision::Quarantine);
    }

    #[test]
    fn anti_loop_outranks_every_other_rule() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.restart_count = ANTI_LOOP_LIMIT;
        bot.remaining_seconds = 0; // also depleted
        bot.last_restart_at = Some(at(-5)); // also inside cooldown
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::Quarantine);
    }

    #[rstest]
    #[case(10, RestartDecision::SkipCooldown)]
    #[case(59, RestartDecision::SkipCooldown)]
    #[case(61, RestartDecision::ChargedRestart)]
    fn cooldown_window(#[case] seconds_since: i64, #[case] expected: RestartDecision) {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.last_restart_at = Some(at(0));
        assert_eq!(policy.decide(&bot, true, at(seconds_since)), expected);
    }

    #[test]
    fn depleted_with_open_gates_gets_free_recovery() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.remaining_seconds = 0;
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::FreeRecovery);
    }

    #[test]
    fn recovery_needs_both_gates() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.power_remaining = 0.0;

        // Owner already recovered today
        assert_eq!(policy.decide(&bot, false, at(0)), RestartDecision::Sleep);

        // Bot already used its one-shot flag, even though the daily gate
        // is open
        bot.auto_recovery_used = true;
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::Sleep);
    }

    #[test]
    fn sleeping_bot_stays_asleep() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.sleep_mode = true;
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::Sleep);
    }

    #[test]
    fn cooldown_checked_before_recovery() {
        let policy = RestartPolicy::default();
        let mut bot = healthy_bot();
        bot.remaining_seconds = 0;
        bot.last_restart_at = Some(at(-10));
        assert_eq!(policy.decide(&bot, true, at(0)), RestartDecision::SkipCooldown);
    }
}
