//! Bot orchestrator: the façade composing storage, backends, watchers,
//! restart policy and notifications.
//!
//! The orchestrator owns the only global mutable structure - the registry
//! of live execution units - and a per-bot lock table. Every mutating
//! operation (user commands, the enforcement tick, the restart policy
//! path) serializes on the bot's lock, so ledger updates apply in
//! wall-clock order and a duplicate start observes the in-flight launch as
//! a conflict instead of double-launching.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use botplane_id::{BotId, OwnerId};
use chrono::Utc;
use tokio::sync::{watch, Mutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::backend::{
    BackendError, ExecutionBackend, ExecutionUnit, LaunchSpec, UnitStats,
};
use crate::error::OrchestratorError;
use crate::model::{BackendKind, Bot, BotSnapshot, BotStatus};
use crate::notify::Notifier;
use crate::plan::Plan;
use crate::policy::{RestartDecision, RestartPolicy, REASON_ANTI_LOOP, REASON_NO_RESOURCES};
use crate::secrets::SecretStore;
use crate::store::Store;
use crate::watcher::{run_log_watcher, spawn_exit_watcher, WatcherConfig};

/// CPU quota granted to every unit, in milli-cores.
pub const UNIT_CPU_LIMIT_MILLIS: u64 = 500;
/// Memory limit granted to every unit.
pub const UNIT_MEMORY_LIMIT_BYTES: u64 = 512 * 1024 * 1024;

/// Everything ingestion hands over for a new bot.
#[derive(Debug, Clone)]
pub struct CreateBot {
    pub owner: OwnerId,
    pub plan: Plan,
    pub name: String,
    pub code_dir: PathBuf,
    pub entrypoint: String,
    /// Already-encrypted token; decrypted only at launch.
    pub token: String,
    /// Backend override; the daemon default applies when absent.
    pub backend: Option<BackendKind>,
}

/// The execution backends available to this daemon.
pub struct BackendSet {
    pub process: Arc<dyn ExecutionBackend>,
    pub container: Arc<dyn ExecutionBackend>,
}

impl BackendSet {
    fn get(&self, kind: BackendKind) -> Arc<dyn ExecutionBackend> {
        match kind {
            BackendKind::Process => Arc::clone(&self.process),
            BackendKind::Container => Arc::clone(&self.container),
        }
    }

    /// One backend serving both kinds (tests, single-backend hosts).
    pub fn uniform(backend: Arc<dyn ExecutionBackend>) -> Self {
        Self {
            process: Arc::clone(&backend),
            container: backend,
        }
    }
}

/// A live unit plus the stop signal for its watcher tasks.
struct UnitEntry {
    unit: ExecutionUnit,
    stop_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

/// The orchestrator façade.
pub struct Orchestrator {
    store: Arc<Store>,
    backends: BackendSet,
    notifier: Arc<dyn Notifier>,
    secrets: Arc<dyn SecretStore>,
    policy: RestartPolicy,
    watcher_config: WatcherConfig,
    default_backend: BackendKind,
    stop_grace: Duration,

    /// bot id -> live unit. Only touched through the synchronized API.
    units: Mutex<HashMap<BotId, UnitEntry>>,
    /// Per-bot serialization locks.
    bot_locks: Mutex<HashMap<BotId, Arc<Mutex<()>>>>,
}

impl Orchestrator {
    pub fn new(
        store: Arc<Store>,
        backends: BackendSet,
        notifier: Arc<dyn Notifier>,
        secrets: Arc<dyn SecretStore>,
        default_backend: BackendKind,
        stop_grace: Duration,
    ) -> Self {
        Self {
            store,
            backends,
            notifier,
            secrets,
            policy: RestartPolicy::default(),
            watcher_config: WatcherConfig::default(),
            default_backend,
            stop_grace,
            units: Mutex::new(HashMap::new()),
            bot_locks: Mutex::new(HashMap::new()),
        }
    }

    /// Override watcher timing (tests).
    pub fn with_watcher_config(mut self, config: WatcherConfig) -> Self {
        self.watcher_config = config;
        self
    }

    /// Override restart policy parameters (tests).
    pub fn with_policy(mut self, policy: RestartPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub(crate) async fn lock_bot(&self, id: BotId) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.bot_locks.lock().await;
            Arc::clone(locks.entry(id).or_insert_with(|| Arc::new(Mutex::new(()))))
        };
        lock.lock_owned().await
    }

    fn load_bot(&self, id: BotId) -> Result<Bot, OrchestratorError> {
        self.store
            .get_bot(id)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("bot {id}")))
    }

    fn load_owned_bot(&self, id: BotId, caller: OwnerId) -> Result<Bot, OrchestratorError> {
        let bot = self.load_bot(id)?;
        if bot.owner != caller {
            return Err(OrchestratorError::PermissionDenied);
        }
        Ok(bot)
    }

    // -------------------------------------------------------------------------
    // Control surface
    // -------------------------------------------------------------------------

    /// Register a new bot; the ledger starts at the plan's full envelope.
    pub async fn create(self: &Arc<Self>, req: CreateBot) -> Result<Bot, OrchestratorError> {
        self.store.ensure_owner(req.owner, req.plan)?;

        let limits = req.plan.limits();
        let existing = self.store.count_owner_bots(req.owner)?;
        if existing >= limits.max_bots {
            return Err(OrchestratorError::PlanLimitExceeded(format!(
                "plan allows {} bots",
                limits.max_bots
            )));
        }

        let now = Utc::now();
        let bot = Bot {
            id: BotId::new(),
            owner: req.owner,
            name: req.name,
            code_dir: req.code_dir.display().to_string(),
            entrypoint: req.entrypoint,
            token: req.token,
            backend: req.backend.unwrap_or(self.default_backend),
            status: BotStatus::Stopped,
            sleep_mode: false,
            sleep_reason: None,
            total_seconds: limits.max_total_seconds,
            remaining_seconds: limits.max_total_seconds,
            power_max: limits.max_power,
            power_remaining: limits.max_power,
            restart_count: 0,
            last_restart_at: None,
            auto_recovery_used: false,
            last_checked: now,
            warned_low: false,
            created_at: now,
        };
        self.store.create_bot(&bot)?;

        info!(bot_id = %bot.id, owner = %bot.owner, plan = %req.plan, "Bot created");
        Ok(bot)
    }

    /// Start a bot on behalf of its owner.
    pub async fn start(
        self: &Arc<Self>,
        id: BotId,
        caller: OwnerId,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let bot = self.load_owned_bot(id, caller)?;
        self.launch_locked(&bot).await?;
        Ok(())
    }

    /// Stop a bot on behalf of its owner. Returns whether a unit was
    /// actually running.
    pub async fn stop(
        self: &Arc<Self>,
        id: BotId,
        caller: OwnerId,
    ) -> Result<bool, OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let bot = self.load_owned_bot(id, caller)?;
        let was_running = self.halt_locked(&bot).await?;
        self.store.update_status(id, BotStatus::Stopped)?;
        info!(bot_id = %id, was_running, "Bot stopped");
        Ok(was_running)
    }

    /// Delete a bot permanently: stop its unit, drop its rows and logs.
    pub async fn delete(self: &Arc<Self>, id: BotId, caller: OwnerId) -> Result<(), OrchestratorError> {
        {
            let _guard = self.lock_bot(id).await;
            let bot = self.load_owned_bot(id, caller)?;
            if let Err(e) = self.halt_locked(&bot).await {
                warn!(bot_id = %id, error = %e, "Error stopping unit during delete");
            }
            self.store.delete_bot(id)?;
        }
        self.bot_locks.lock().await.remove(&id);
        info!(bot_id = %id, "Bot deleted");
        Ok(())
    }

    /// Add hosting time (plus the proportional power credit). A sleeping
    /// bot is woken and a start is attempted. Returns the new remaining
    /// seconds.
    pub async fn add_time(
        self: &Arc<Self>,
        id: BotId,
        caller: OwnerId,
        seconds: i64,
    ) -> Result<i64, OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let mut bot = self.load_owned_bot(id, caller)?;
        let owner = self
            .store
            .get_owner(bot.owner)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("owner {}", bot.owner)))?;

        let limits = owner.plan.limits();
        bot.add_time(seconds, &limits).map_err(|_| {
            OrchestratorError::PlanLimitExceeded(format!(
                "plan caps total time at {}s",
                limits.max_total_seconds
            ))
        })?;
        bot.last_checked = Utc::now();
        self.store.save_ledger(&bot)?;

        info!(bot_id = %id, seconds, remaining = bot.remaining_seconds, "Time added");

        if bot.sleep_mode {
            self.store.clear_sleep(id)?;
            bot.sleep_mode = false;
            bot.sleep_reason = None;
            match self.launch_locked(&bot).await {
                Ok(()) => {
                    self.notifier
                        .notify(bot.owner, &format!("Bot {} woke up and restarted.", bot.name))
                        .await;
                }
                Err(e) => {
                    warn!(bot_id = %id, error = %e, "Wake-up start failed after top-up");
                    self.notifier
                        .notify(
                            bot.owner,
                            &format!("Time added to bot {}, but starting it failed.", bot.name),
                        )
                        .await;
                }
            }
        }

        Ok(bot.remaining_seconds)
    }

    /// Add power points, capped by the ledger's `power_max`. Returns the
    /// new level.
    pub async fn add_power(
        self: &Arc<Self>,
        id: BotId,
        caller: OwnerId,
        pct: f64,
    ) -> Result<f64, OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let mut bot = self.load_owned_bot(id, caller)?;
        let new_power = bot.add_power(pct);
        self.store.save_ledger(&bot)?;
        info!(bot_id = %id, pct, new_power, "Power added");
        Ok(new_power)
    }

    /// Manual recovery of a sleeping bot: consumes the owner's daily
    /// allowance and the bot's one-shot flag, applies the recovery grant
    /// and starts the bot.
    pub async fn recover(self: &Arc<Self>, id: BotId, caller: OwnerId) -> Result<(), OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let mut bot = self.load_owned_bot(id, caller)?;
        let owner = self
            .store
            .get_owner(bot.owner)?
            .ok_or_else(|| OrchestratorError::NotFound(format!("owner {}", bot.owner)))?;

        if !bot.sleep_mode {
            return Err(OrchestratorError::RecoveryUnavailable(
                "bot is not asleep".to_string(),
            ));
        }
        let today = Utc::now().date_naive();
        if !owner.can_recover(today) {
            return Err(OrchestratorError::RecoveryUnavailable(
                "daily recovery already used".to_string(),
            ));
        }
        if bot.auto_recovery_used {
            return Err(OrchestratorError::RecoveryUnavailable(
                "recovery already used for this bot".to_string(),
            ));
        }

        self.store.use_recovery(owner.id, today)?;
        self.store.mark_auto_recovery_used(id)?;
        bot.apply_recovery_grant();
        bot.last_checked = Utc::now();
        self.store.save_ledger(&bot)?;
        self.store.clear_sleep(id)?;
        bot.sleep_mode = false;
        bot.sleep_reason = None;

        info!(bot_id = %id, "Manual recovery granted");
        self.launch_locked(&bot).await?;
        self.notifier
            .notify(bot.owner, &format!("Bot {} recovered and restarted.", bot.name))
            .await;
        Ok(())
    }

    /// Read-only status snapshot, with a live resource sample when a unit
    /// is running.
    pub async fn get_status(
        self: &Arc<Self>,
        id: BotId,
        caller: OwnerId,
    ) -> Result<BotSnapshot, OrchestratorError> {
        let bot = self.load_owned_bot(id, caller)?;
        let stats = self.unit_stats(id).await;
        Ok(BotSnapshot {
            id: bot.id,
            name: bot.name,
            status: bot.status,
            sleep_mode: bot.sleep_mode,
            sleep_reason: bot.sleep_reason,
            total_seconds: bot.total_seconds,
            remaining_seconds: bot.remaining_seconds,
            power_max: bot.power_max,
            power_remaining: bot.power_remaining,
            restart_count: bot.restart_count,
            auto_recovery_used: bot.auto_recovery_used,
            cpu_percent: stats.map(|s| s.cpu_percent),
            memory_mb: stats.map(|s| s.memory_mb),
        })
    }

    // -------------------------------------------------------------------------
    // Enforcement hooks
    // -------------------------------------------------------------------------

    /// Whether a live unit is registered for the bot.
    pub async fn has_unit(&self, id: BotId) -> bool {
        self.units.lock().await.contains_key(&id)
    }

    /// Live stats for the bot's unit, if one is registered. Backend
    /// failures surface as `None`; the enforcement loop treats that as an
    /// idle sample.
    pub async fn unit_stats(&self, id: BotId) -> Option<UnitStats> {
        let (unit, backend) = {
            let units = self.units.lock().await;
            let entry = units.get(&id)?;
            let bot = self.store.get_bot(id).ok().flatten()?;
            (entry.unit.clone(), self.backends.get(bot.backend))
        };
        match backend.stats(&unit).await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(bot_id = %id, error = %e, "Stats sample failed");
                None
            }
        }
    }

    /// Force a bot into sleep mode, stopping its unit. Used by the
    /// enforcement loop on depletion.
    pub async fn force_sleep(
        self: &Arc<Self>,
        id: BotId,
        reason: &str,
    ) -> Result<(), OrchestratorError> {
        let _guard = self.lock_bot(id).await;
        let bot = self.load_bot(id)?;
        if let Err(e) = self.halt_locked(&bot).await {
            warn!(bot_id = %id, error = %e, "Error stopping unit for sleep");
        }
        self.store.set_sleep_mode(id, reason)?;
        info!(bot_id = %id, reason, "Bot put to sleep");
        Ok(())
    }

    /// Stop every live unit; called on daemon shutdown.
    pub async fn shutdown_all(self: &Arc<Self>) {
        let ids: Vec<BotId> = self.units.lock().await.keys().copied().collect();
        info!(count = ids.len(), "Stopping all units for shutdown");
        for id in ids {
            let _guard = self.lock_bot(id).await;
            match self.load_bot(id) {
                Ok(bot) => {
                    if let Err(e) = self.halt_locked(&bot).await {
                        warn!(bot_id = %id, error = %e, "Error stopping unit at shutdown");
                    }
                    if let Err(e) = self.store.update_status(id, BotStatus::Stopped) {
                        warn!(bot_id = %id, error = %e, "Error persisting stop at shutdown");
                    }
                }
                Err(e) => warn!(bot_id = %id, error = %e, "Unknown bot at shutdown"),
            }
        }
    }

    // -------------------------------------------------------------------------
    // Exit handling (called by the exit watcher)
    // -------------------------------------------------------------------------

    /// React to a unit's termination.
    ///
    /// Ignores exits of units the registry no longer tracks - those were
    /// user- or enforcement-initiated stops, not crashes.
    pub async fn handle_exit(self: &Arc<Self>, unit: &ExecutionUnit, code: i32) {
        let guard = self.lock_bot(unit.bot_id).await;
        let id = unit.bot_id;

        {
            let mut units = self.units.lock().await;
            let registered = units
                .get(&id)
                .map(|entry| entry.unit.unit_id == unit.unit_id)
                .unwrap_or(false);
            if !registered {
                debug!(bot_id = %id, "Exit for unregistered unit, ignoring");
                return;
            }
            if let Some(entry) = units.remove(&id) {
                let _ = entry.stop_tx.send(true);
            }
        }

        if let Err(e) = self
            .store
            .add_error_log(id, &format!("process exited with code {code}"))
        {
            warn!(bot_id = %id, error = %e, "Could not record exit");
        }
        if let Err(e) = self.store.update_status(id, BotStatus::Stopped) {
            error!(bot_id = %id, error = %e, "Could not persist stop after exit");
            return;
        }

        if code == 0 {
            info!(bot_id = %id, "Unit exited cleanly");
            return;
        }

        let bot = match self.load_bot(id) {
            Ok(bot) => bot,
            Err(e) => {
                warn!(bot_id = %id, error = %e, "Exited bot no longer exists");
                return;
            }
        };
        let owner = match self.store.get_owner(bot.owner) {
            Ok(Some(owner)) => owner,
            Ok(None) | Err(_) => {
                warn!(bot_id = %id, "Owner missing, skipping restart policy");
                return;
            }
        };

        let now = Utc::now();
        let decision = self
            .policy
            .decide(&bot, owner.can_recover(now.date_naive()), now);
        info!(bot_id = %id, code, ?decision, "Restart policy decision");

        match decision {
            RestartDecision::Quarantine => {
                if let Err(e) = self.store.set_sleep_mode(id, REASON_ANTI_LOOP) {
                    error!(bot_id = %id, error = %e, "Could not quarantine bot");
                    return;
                }
                let _ = self
                    .store
                    .add_error_log(id, "[restart] auto-restart disabled: too many restarts");
                self.notifier
                    .notify(
                        bot.owner,
                        &format!("Bot {} was stopped: it kept crashing and restarting.", bot.name),
                    )
                    .await;
            }
            RestartDecision::SkipCooldown => {
                let _ = self
                    .store
                    .add_error_log(id, "[restart] skipped: inside cooldown window");
            }
            RestartDecision::FreeRecovery => {
                self.execute_free_recovery(bot, now).await;
            }
            RestartDecision::Sleep => {
                if let Err(e) = self.store.set_sleep_mode(id, REASON_NO_RESOURCES) {
                    error!(bot_id = %id, error = %e, "Could not sleep depleted bot");
                    return;
                }
                self.notifier
                    .notify(
                        bot.owner,
                        &format!("Bot {} ran out of time or power and went to sleep.", bot.name),
                    )
                    .await;
            }
            RestartDecision::ChargedRestart => {
                let remaining = (bot.remaining_seconds - self.policy.time_cost_secs).max(0);
                let power = (bot.power_remaining - self.policy.power_cost).max(0.0);
                if let Err(e) = self.store.update_resources(id, remaining, power, now) {
                    error!(bot_id = %id, error = %e, "Could not charge restart cost");
                    return;
                }
                if let Err(e) = self.store.increment_restart(id, now) {
                    error!(bot_id = %id, error = %e, "Could not record restart");
                    return;
                }
                let _ = self
                    .store
                    .add_error_log(id, &format!("[restart] auto-restarting after exit code {code}"));

                // Release the lock for the retry delay so the enforcement
                // tick and user commands are not held up.
                drop(guard);
                let delay = self.policy.retry_delay;
                let orchestrator = Arc::clone(self);
                tokio::spawn(async move {
                    tokio::time::sleep(delay).await;
                    orchestrator.relaunch_after_charge(id).await;
                });
            }
        }
    }

    /// Grant the free recovery and relaunch at no cost. A launch failure
    /// leaves the bot stopped (not sleeping) with the grant applied.
    async fn execute_free_recovery(self: &Arc<Self>, mut bot: Bot, now: chrono::DateTime<Utc>) {
        let id = bot.id;
        if let Err(e) = self.store.use_recovery(bot.owner, now.date_naive()) {
            error!(bot_id = %id, error = %e, "Could not consume daily recovery");
            return;
        }
        if let Err(e) = self.store.mark_auto_recovery_used(id) {
            error!(bot_id = %id, error = %e, "Could not mark recovery used");
            return;
        }
        bot.apply_recovery_grant();
        bot.last_checked = now;
        if let Err(e) = self.store.save_ledger(&bot) {
            error!(bot_id = %id, error = %e, "Could not persist recovery grant");
            return;
        }
        let _ = self
            .store
            .add_error_log(id, "[restart] free auto-recovery used");

        match self.launch_locked(&bot).await {
            Ok(()) => {
                self.notifier
                    .notify(
                        bot.owner,
                        &format!("Bot {} was restored with the free daily recovery.", bot.name),
                    )
                    .await;
            }
            Err(e) => {
                warn!(bot_id = %id, error = %e, "Launch failed after free recovery");
                let _ = self
                    .store
                    .add_error_log(id, &format!("[restart] recovery launch failed: {e}"));
            }
        }
    }

    /// The delayed relaunch after a charged restart. Re-validates under
    /// the lock: a user may have started, slept or deleted the bot during
    /// the delay.
    async fn relaunch_after_charge(self: &Arc<Self>, id: BotId) {
        let _guard = self.lock_bot(id).await;
        let bot = match self.load_bot(id) {
            Ok(bot) => bot,
            Err(_) => return,
        };
        if bot.status == BotStatus::Running || bot.sleep_mode {
            debug!(bot_id = %id, "Relaunch superseded");
            return;
        }
        match self.launch_locked(&bot).await {
            Ok(()) => {
                self.notifier
                    .notify(bot.owner, &format!("Bot {} was restarted automatically.", bot.name))
                    .await;
            }
            Err(e) => {
                warn!(bot_id = %id, error = %e, "Automatic restart failed");
                let _ = self
                    .store
                    .add_error_log(id, &format!("[restart] auto-restart failed: {e}"));
            }
        }
    }

    // -------------------------------------------------------------------------
    // Launch / halt internals (per-bot lock must be held)
    // -------------------------------------------------------------------------

    /// Launch the bot's unit and install watchers. Resets the restart
    /// counter: any successful start closes a crash streak.
    async fn launch_locked(self: &Arc<Self>, bot: &Bot) -> Result<(), OrchestratorError> {
        if self.units.lock().await.contains_key(&bot.id) {
            return Err(OrchestratorError::AlreadyRunning);
        }
        if bot.sleep_mode {
            return Err(OrchestratorError::Sleeping {
                reason: bot
                    .sleep_reason
                    .clone()
                    .unwrap_or_else(|| "unknown".to_string()),
            });
        }
        if bot.remaining_seconds <= 0 || bot.power_remaining <= 0.0 {
            return Err(OrchestratorError::ResourceExhausted);
        }

        let token = self
            .secrets
            .decrypt(&bot.token)
            .map_err(|e| OrchestratorError::Launch(BackendError::Unavailable(e.to_string())))?;

        let spec = LaunchSpec {
            bot_id: bot.id,
            code_dir: PathBuf::from(&bot.code_dir),
            entrypoint: bot.entrypoint.clone(),
            token,
            remaining_seconds: bot.remaining_seconds,
            cpu_limit_millis: UNIT_CPU_LIMIT_MILLIS,
            memory_limit_bytes: UNIT_MEMORY_LIMIT_BYTES,
        };

        let backend = self.backends.get(bot.backend);
        let unit = backend
            .launch(&spec)
            .await
            .map_err(OrchestratorError::Launch)?;

        let now = Utc::now();
        self.store.update_status(bot.id, BotStatus::Running)?;
        self.store
            .update_resources(bot.id, bot.remaining_seconds, bot.power_remaining, now)?;
        self.store.reset_restart_count(bot.id)?;

        let (stop_tx, stop_rx) = watch::channel(false);
        let log_task = tokio::spawn(run_log_watcher(
            Arc::clone(&backend),
            unit.clone(),
            bot.owner,
            bot.name.clone(),
            Arc::clone(&self.store),
            Arc::clone(&self.notifier),
            self.watcher_config.clone(),
            stop_rx.clone(),
        ));
        let exit_task = spawn_exit_watcher(
            backend,
            unit.clone(),
            Arc::clone(self),
            self.watcher_config.clone(),
            stop_rx,
        );

        self.units.lock().await.insert(
            bot.id,
            UnitEntry {
                unit: unit.clone(),
                stop_tx,
                tasks: vec![log_task, exit_task],
            },
        );

        info!(bot_id = %bot.id, unit_id = %unit.unit_id, backend = bot.backend.as_str(), "Bot started");
        Ok(())
    }

    /// Cancel watchers and terminate the bot's unit, if any. Returns
    /// whether something was actually running.
    async fn halt_locked(&self, bot: &Bot) -> Result<bool, OrchestratorError> {
        let entry = self.units.lock().await.remove(&bot.id);
        let Some(entry) = entry else {
            return Ok(false);
        };

        let _ = entry.stop_tx.send(true);

        let backend = self.backends.get(bot.backend);
        let was_running = backend
            .stop(&entry.unit, self.stop_grace)
            .await
            .map_err(|e| OrchestratorError::BackendUnavailable(e.to_string()))?;

        // Watchers observe the stop signal (or the dead unit) and finish
        // on their own; joining them here under the bot lock could
        // deadlock against an in-flight handle_exit.
        drop(entry.tasks);

        Ok(was_running)
    }
}
