//! Integration tests for the bot lifecycle and enforcement flow.
//!
//! Drives the orchestrator and enforcer against the mock backend and an
//! in-memory store: create -> start -> drain -> low warning -> depletion
//! sleep, plus top-ups, recovery and deletion.

use std::sync::Arc;
use std::time::Duration;

use botplane_hostd::backend::MockBackend;
use botplane_hostd::enforcer::{Enforcer, REASON_EXPIRED};
use botplane_hostd::notify::RecordingNotifier;
use botplane_hostd::secrets::PlainSecretStore;
use botplane_hostd::watcher::WatcherConfig;
use botplane_hostd::{
    BackendSet, BackendKind, BotStatus, CreateBot, Orchestrator, OrchestratorError, Plan, Store,
};
use botplane_id::OwnerId;
use chrono::{Duration as ChronoDuration, Utc};

struct TestHost {
    orchestrator: Arc<Orchestrator>,
    enforcer: Enforcer,
    store: Arc<Store>,
    backend: Arc<MockBackend>,
    notifier: Arc<RecordingNotifier>,
    owner: OwnerId,
    _dir: tempfile::TempDir,
}

fn test_host() -> TestHost {
    let store = Arc::new(Store::open_in_memory().expect("store"));
    let backend = Arc::new(MockBackend::new());
    let notifier = Arc::new(RecordingNotifier::new());
    let dir = tempfile::tempdir().expect("tempdir");

    let orchestrator = Arc::new(
        Orchestrator::new(
            Arc::clone(&store),
            BackendSet::uniform(backend.clone()),
            notifier.clone(),
            Arc::new(PlainSecretStore),
            BackendKind::Process,
            Duration::from_secs(1),
        )
        .with_watcher_config(WatcherConfig {
            log_poll: Duration::from_millis(20),
            exit_poll: Duration::from_millis(20),
            exit_settle: Duration::from_millis(1),
        }),
    );

    let enforcer = Enforcer::new(
        Arc::clone(&store),
        Arc::clone(&orchestrator),
        notifier.clone(),
        Duration::from_secs(30),
    );

    TestHost {
        orchestrator,
        enforcer,
        store,
        backend,
        notifier,
        owner: OwnerId::new(),
        _dir: dir,
    }
}

impl TestHost {
    fn create_request(&self, name: &str) -> CreateBot {
        CreateBot {
            owner: self.owner,
            plan: Plan::Free,
            name: name.to_string(),
            code_dir: self._dir.path().join(name),
            entrypoint: "main.py".to_string(),
            token: "tok".to_string(),
            backend: None,
        }
    }
}

#[tokio::test]
async fn create_initializes_ledger_from_plan() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    assert_eq!(bot.total_seconds, 86_400);
    assert_eq!(bot.remaining_seconds, 86_400);
    assert_eq!(bot.power_max, 30.0);
    assert_eq!(bot.power_remaining, 30.0);
    assert_eq!(bot.status, BotStatus::Stopped);
    assert!(!bot.sleep_mode);

    let stored = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(stored.remaining_seconds, 86_400);
}

#[tokio::test]
async fn create_enforces_plan_bot_limit() {
    let host = test_host();
    for i in 0..3 {
        host.orchestrator
            .create(host.create_request(&format!("bot{i}")))
            .await
            .unwrap();
    }

    let err = host
        .orchestrator
        .create(host.create_request("one-too-many"))
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PlanLimitExceeded(_)));
}

#[tokio::test]
async fn start_and_stop_roundtrip() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    host.orchestrator.start(bot.id, host.owner).await.unwrap();
    assert!(host.orchestrator.has_unit(bot.id).await);
    assert_eq!(host.backend.launch_count(), 1);
    assert_eq!(
        host.store.get_bot(bot.id).unwrap().unwrap().status,
        BotStatus::Running
    );

    let was_running = host.orchestrator.stop(bot.id, host.owner).await.unwrap();
    assert!(was_running);
    assert!(!host.orchestrator.has_unit(bot.id).await);
    assert_eq!(host.backend.live_units(), 0);
    assert_eq!(
        host.store.get_bot(bot.id).unwrap().unwrap().status,
        BotStatus::Stopped
    );
}

#[tokio::test]
async fn duplicate_start_is_a_conflict() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    host.orchestrator.start(bot.id, host.owner).await.unwrap();
    let err = host
        .orchestrator
        .start(bot.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::AlreadyRunning));
    // No second unit was launched
    assert_eq!(host.backend.launch_count(), 1);
}

#[tokio::test]
async fn start_refuses_foreign_caller() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    let err = host
        .orchestrator
        .start(bot.id, OwnerId::new())
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PermissionDenied));
}

#[tokio::test]
async fn start_refuses_depleted_and_sleeping() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    host.store
        .update_resources(bot.id, 0, 30.0, Utc::now())
        .unwrap();
    let err = host
        .orchestrator
        .start(bot.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::ResourceExhausted));

    host.store
        .update_resources(bot.id, 100, 30.0, Utc::now())
        .unwrap();
    host.store.set_sleep_mode(bot.id, "expired").unwrap();
    let err = host
        .orchestrator
        .start(bot.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::Sleeping { .. }));
}

#[tokio::test]
async fn enforcement_drains_time_and_power() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();
    host.orchestrator.start(bot.id, host.owner).await.unwrap();

    // Pin the drain watermark, then tick exactly 600s later at 50% CPU.
    let base = Utc::now();
    host.store
        .update_resources(bot.id, 86_400, 30.0, base)
        .unwrap();
    let unit = host.backend.unit_for(bot.id).unwrap();
    host.backend.set_stats(&unit, 50.0, 64.0);

    host.enforcer.tick(base + ChronoDuration::seconds(600)).await;

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(after.remaining_seconds, 85_800);
    assert!((after.power_remaining - 24.0).abs() < 1e-9);

    // A zero-CPU tick drains time but no power.
    host.backend.set_stats(&unit, 0.0, 64.0);
    host.enforcer
        .tick(base + ChronoDuration::seconds(1200))
        .await;

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(after.remaining_seconds, 85_200);
    assert!((after.power_remaining - 24.0).abs() < 1e-9);
    assert_eq!(after.status, BotStatus::Running);
}

#[tokio::test]
async fn enforcement_warns_once_on_low_time() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();
    host.orchestrator.start(bot.id, host.owner).await.unwrap();

    let base = Utc::now();
    host.store.update_resources(bot.id, 700, 30.0, base).unwrap();

    host.enforcer.tick(base + ChronoDuration::seconds(200)).await;

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(after.remaining_seconds, 500);
    assert!(after.warned_low);
    let warnings: Vec<_> = host
        .notifier
        .messages()
        .into_iter()
        .filter(|(_, m)| m.contains("will stop in"))
        .collect();
    assert_eq!(warnings.len(), 1);

    // Next tick must not warn again.
    host.enforcer.tick(base + ChronoDuration::seconds(300)).await;
    let warnings: Vec<_> = host
        .notifier
        .messages()
        .into_iter()
        .filter(|(_, m)| m.contains("will stop in"))
        .collect();
    assert_eq!(warnings.len(), 1);
}

#[tokio::test]
async fn enforcement_sleeps_depleted_bot() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();
    host.orchestrator.start(bot.id, host.owner).await.unwrap();

    let base = Utc::now();
    host.store.update_resources(bot.id, 60, 30.0, base).unwrap();

    host.enforcer.tick(base + ChronoDuration::seconds(120)).await;

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(after.remaining_seconds, 0);
    assert!(after.sleep_mode);
    assert_eq!(after.sleep_reason.as_deref(), Some(REASON_EXPIRED));
    assert_eq!(after.status, BotStatus::Stopped);
    assert!(!host.orchestrator.has_unit(bot.id).await);
    assert_eq!(host.backend.live_units(), 0);
    assert!(host
        .notifier
        .messages()
        .iter()
        .any(|(_, m)| m.contains("went to sleep")));

    // Depletion is idempotent: another tick changes nothing.
    host.enforcer.tick(base + ChronoDuration::seconds(240)).await;
    let again = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(again.remaining_seconds, 0);
    assert!(again.sleep_mode);
}

#[tokio::test]
async fn add_time_wakes_sleeping_bot() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    // Deplete and sleep the bot.
    host.store.update_resources(bot.id, 0, 0.0, Utc::now()).unwrap();
    host.store.set_sleep_mode(bot.id, REASON_EXPIRED).unwrap();

    // The plan cap counts total_seconds, so shrink total first to leave
    // headroom for the top-up.
    let mut stale = host.store.get_bot(bot.id).unwrap().unwrap();
    stale.total_seconds = 10_000;
    stale.remaining_seconds = 0;
    stale.power_remaining = 0.0;
    host.store.save_ledger(&stale).unwrap();

    let remaining = host
        .orchestrator
        .add_time(bot.id, host.owner, 3_600)
        .await
        .unwrap();
    assert_eq!(remaining, 3_600);

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert!(!after.sleep_mode);
    assert_eq!(after.status, BotStatus::Running);
    assert!(host.orchestrator.has_unit(bot.id).await);
    // Proportional credit: 3600/86400 of the free plan in power points
    assert!((after.power_remaining - 3600.0 / 86_400.0 * 100.0).abs() < 1e-6);
}

#[tokio::test]
async fn add_time_rejects_plan_cap() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    // Ledger is already at the free plan cap.
    let err = host
        .orchestrator
        .add_time(bot.id, host.owner, 1)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::PlanLimitExceeded(_)));
    assert_eq!(
        host.store.get_bot(bot.id).unwrap().unwrap().total_seconds,
        86_400
    );
}

#[tokio::test]
async fn add_power_caps_at_ledger_max() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();
    host.store
        .update_resources(bot.id, 86_400, 10.0, Utc::now())
        .unwrap();

    let power = host
        .orchestrator
        .add_power(bot.id, host.owner, 50.0)
        .await
        .unwrap();
    assert_eq!(power, 30.0);
}

#[tokio::test]
async fn manual_recovery_grants_and_restarts() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    host.store.update_resources(bot.id, 0, 0.0, Utc::now()).unwrap();
    host.store.set_sleep_mode(bot.id, REASON_EXPIRED).unwrap();

    host.orchestrator.recover(bot.id, host.owner).await.unwrap();

    let after = host.store.get_bot(bot.id).unwrap().unwrap();
    assert_eq!(after.total_seconds, 3_600);
    assert_eq!(after.remaining_seconds, 3_600);
    assert_eq!(after.power_max, 20.0);
    assert_eq!(after.power_remaining, 20.0);
    assert!(after.auto_recovery_used);
    assert!(!after.sleep_mode);
    assert_eq!(after.status, BotStatus::Running);

    let owner = host.store.get_owner(host.owner).unwrap().unwrap();
    assert_eq!(owner.last_recovery_date, Some(Utc::now().date_naive()));
}

#[tokio::test]
async fn recovery_gates_are_enforced() {
    let host = test_host();
    let bot_a = host
        .orchestrator
        .create(host.create_request("a"))
        .await
        .unwrap();
    let bot_b = host
        .orchestrator
        .create(host.create_request("b"))
        .await
        .unwrap();

    // A bot that is not asleep cannot be recovered.
    let err = host
        .orchestrator
        .recover(bot_a.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RecoveryUnavailable(_)));

    // Recover bot A; the owner's daily gate then blocks bot B.
    host.store
        .update_resources(bot_a.id, 0, 0.0, Utc::now())
        .unwrap();
    host.store.set_sleep_mode(bot_a.id, REASON_EXPIRED).unwrap();
    host.orchestrator.recover(bot_a.id, host.owner).await.unwrap();

    host.store
        .update_resources(bot_b.id, 0, 0.0, Utc::now())
        .unwrap();
    host.store.set_sleep_mode(bot_b.id, REASON_EXPIRED).unwrap();
    let err = host
        .orchestrator
        .recover(bot_b.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::RecoveryUnavailable(_)));
}

#[tokio::test]
async fn get_status_includes_live_sample() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();

    let snapshot = host
        .orchestrator
        .get_status(bot.id, host.owner)
        .await
        .unwrap();
    assert_eq!(snapshot.status, BotStatus::Stopped);
    assert!(snapshot.cpu_percent.is_none());

    host.orchestrator.start(bot.id, host.owner).await.unwrap();
    let unit = host.backend.unit_for(bot.id).unwrap();
    host.backend.set_stats(&unit, 37.5, 100.0);

    let snapshot = host
        .orchestrator
        .get_status(bot.id, host.owner)
        .await
        .unwrap();
    assert_eq!(snapshot.status, BotStatus::Running);
    assert_eq!(snapshot.cpu_percent, Some(37.5));
    assert_eq!(snapshot.memory_mb, Some(100.0));
}

#[tokio::test]
async fn delete_stops_unit_and_discards_state() {
    let host = test_host();
    let bot = host
        .orchestrator
        .create(host.create_request("echo"))
        .await
        .unwrap();
    host.orchestrator.start(bot.id, host.owner).await.unwrap();
    host.store.add_error_log(bot.id, "some error").unwrap();

    host.orchestrator.delete(bot.id, host.owner).await.unwrap();

    assert!(host.store.get_bot(bot.id).unwrap().is_none());
    assert!(host.store.recent_errors(bot.id, 5).unwrap().is_empty());
    assert_eq!(host.backend.live_units(), 0);

    let err = host
        .orchestrator
        .start(bot.id, host.owner)
        .await
        .unwrap_err();
    assert!(matches!(err, OrchestratorError::NotFound(_)));
}
