//! Enforcement loop: periodic drain and depletion across the fleet.
//!
//! Every tick walks the bots currently marked running, applies elapsed
//! wall-clock and CPU drain to each ledger, fires the one-shot low-time
//! warning, and puts depleted bots to sleep. This is the only place
//! depletion is enforced proactively - a bot whose process never exits
//! still gets stopped here once its ledger empties.
//!
//! One bot's failure (stats, persistence) never aborts the tick for the
//! rest of the fleet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{debug, error, info};

use crate::error::OrchestratorError;
use crate::model::{Bot, BotStatus};
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// Default period between enforcement ticks.
pub const ENFORCE_INTERVAL: Duration = Duration::from_secs(30);

/// Sleep reason recorded when the enforcement loop depletes a bot.
pub const REASON_EXPIRED: &str = "expired";

/// The fleet-wide enforcement scheduler.
pub struct Enforcer {
    store: Arc<Store>,
    orchestrator: Arc<Orchestrator>,
    notifier: Arc<dyn Notifier>,
    interval: Duration,
}

impl Enforcer {
    pub fn new(
        store: Arc<Store>,
        orchestrator: Arc<Orchestrator>,
        notifier: Arc<dyn Notifier>,
        interval: Duration,
    ) -> Self {
        Self {
            store,
            orchestrator,
            notifier,
            interval,
        }
    }

    /// Run the enforcement loop until shutdown.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        info!(
            interval_secs = self.interval.as_secs(),
            "Starting enforcement loop"
        );
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick(Utc::now()).await;
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Enforcement loop shutting down");
                        break;
                    }
                }
            }
        }
    }

    /// One enforcement pass over every running bot.
    pub async fn tick(&self, now: DateTime<Utc>) {
        let running = match self.store.list_running() {
            Ok(bots) => bots,
            Err(e) => {
                error!(error = %e, "Could not list running bots");
                return;
            }
        };

        debug!(count = running.len(), "Enforcement tick");
        for bot in running {
            let id = bot.id;
            if let Err(e) = self.enforce_bot(bot, now).await {
                error!(bot_id = %id, error = %e, "Enforcement failed for bot");
            }
        }
    }

    async fn enforce_bot(&self, stale: Bot, now: DateTime<Utc>) -> Result<(), OrchestratorError> {
        let id = stale.id;

        // Sample before taking the bot lock; a stats call can block on
        // backend I/O and must not hold up other writers meanwhile.
        let cpu_percent = self
            .orchestrator
            .unit_stats(id)
            .await
            .map(|s| s.cpu_percent)
            .unwrap_or(0.0);

        let depleted = {
            let _guard = self.orchestrator.lock_bot(id).await;

            // Re-read under the lock; a restart charge or top-up may have
            // landed while we sampled.
            let Some(mut bot) = self.store.get_bot(id)? else {
                return Ok(());
            };
            if bot.status != BotStatus::Running {
                return Ok(());
            }

            let elapsed = (now - bot.last_checked).num_seconds();
            if elapsed <= 0 {
                return Ok(());
            }

            bot.apply_drain(elapsed, cpu_percent);
            self.store
                .update_resources(id, bot.remaining_seconds, bot.power_remaining, now)?;
            debug!(
                bot_id = %id,
                elapsed,
                cpu_percent,
                remaining = bot.remaining_seconds,
                power = bot.power_remaining,
                "Drain applied"
            );

            if bot.is_low() && !bot.warned_low {
                self.notifier
                    .notify(
                        bot.owner,
                        &format!(
                            "Bot {} will stop in {}. Add time to avoid sleep mode.",
                            bot.name,
                            human_duration(bot.remaining_seconds)
                        ),
                    )
                    .await;
                self.store.set_warned_low(id, true)?;
            }

            bot.is_depleted()
        };

        if depleted {
            // force_sleep re-acquires the bot lock itself.
            self.orchestrator.force_sleep(id, REASON_EXPIRED).await?;
            if let Some(bot) = self.store.get_bot(id)? {
                self.notifier
                    .notify(
                        bot.owner,
                        &format!("Bot {} ran out of time or power and went to sleep.", bot.name),
                    )
                    .await;
            }
        }

        Ok(())
    }
}

/// Render a second count as `1d 2h 3m 4s`, omitting leading zero parts.
pub fn human_duration(total_seconds: i64) -> String {
    let total = total_seconds.max(0);
    let days = total / 86_400;
    let hours = (total % 86_400) / 3_600;
    let minutes = (total % 3_600) / 60;
    let seconds = total % 60;

    let mut parts = Vec::new();
    if days > 0 {
        parts.push(format!("{days}d"));
    }
    if hours > 0 {
        parts.push(format!("{hours}h"));
    }
    if minutes > 0 {
        parts.push(format!("{minutes}m"));
    }
    parts.push(format!("{seconds}s"));
    parts.join(" ")
}
