//! Per-unit background watchers.
//!
//! Every launched unit gets two bot-scoped tasks, owned by the
//! orchestrator's registry entry and cancelled through its `watch` channel:
//!
//! - the **log watcher** tails the unit's stderr file from the byte offset
//!   of the previous read, filters noise, and forwards real errors to the
//!   owner;
//! - the **exit watcher** polls unit liveness and hands the exit code to
//!   the orchestrator's restart policy path, then ceases.
//!
//! Both terminate on their own once the unit is gone, so a cancelled stop
//! never leaves a watcher spinning.

use std::io::{Read, Seek, SeekFrom};
use std::sync::Arc;
use std::time::Duration;

use botplane_id::OwnerId;
use tokio::sync::watch;
use tracing::{debug, warn};

use crate::backend::{ExecutionBackend, ExecutionUnit};
use crate::notify::Notifier;
use crate::orchestrator::Orchestrator;
use crate::store::Store;

/// How often the log watcher re-reads the stderr file.
pub const LOG_POLL_INTERVAL: Duration = Duration::from_secs(2);
/// How often the exit watcher probes unit liveness.
pub const EXIT_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Pause between observing an exit and evaluating restart policy.
pub const EXIT_SETTLE_DELAY: Duration = Duration::from_secs(2);
/// Byte budget for the error payload forwarded to the owner.
pub const NOTIFY_BYTE_BUDGET: usize = 500;

/// Watcher timing knobs; tests shrink these.
#[derive(Debug, Clone)]
pub struct WatcherConfig {
    pub log_poll: Duration,
    pub exit_poll: Duration,
    pub exit_settle: Duration,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            log_poll: LOG_POLL_INTERVAL,
            exit_poll: EXIT_POLL_INTERVAL,
            exit_settle: EXIT_SETTLE_DELAY,
        }
    }
}

/// Whether a stderr line should reach the owner.
///
/// Known error markers match outright; anything that carries none of the
/// known benign markers is suspicious by default (closed-world filtering).
pub fn is_real_error(line: &str) -> bool {
    let upper = line.to_uppercase();
    if ["ERROR", "CRITICAL", "TRACEBACK", "EXCEPTION"]
        .iter()
        .any(|m| upper.contains(m))
    {
        return true;
    }
    !["INFO", "DEBUG", "HTTP REQUEST"]
        .iter()
        .any(|m| upper.contains(m))
}

/// Truncates to at most `budget` bytes without splitting a character.
pub fn truncate_to_budget(s: &str, budget: usize) -> &str {
    if s.len() <= budget {
        return s;
    }
    let mut end = budget;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    &s[..end]
}

/// Tail the unit's stderr and forward real errors to the owner.
#[allow(clippy::too_many_arguments)]
pub async fn run_log_watcher(
    backend: Arc<dyn ExecutionBackend>,
    unit: ExecutionUnit,
    owner: OwnerId,
    bot_name: String,
    store: Arc<Store>,
    notifier: Arc<dyn Notifier>,
    config: WatcherConfig,
    mut stop: watch::Receiver<bool>,
) {
    // Start past whatever a previous run left in the file.
    let mut offset = std::fs::metadata(&unit.stderr_path)
        .map(|m| m.len())
        .unwrap_or(0);

    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    break;
                }
            }
            _ = tokio::time::sleep(config.log_poll) => {}
        }

        match read_from_offset(&unit.stderr_path, &mut offset) {
            Ok(Some(chunk)) => {
                let errors: Vec<&str> = chunk
                    .lines()
                    .filter(|l| !l.trim().is_empty() && is_real_error(l))
                    .collect();

                if !errors.is_empty() {
                    let batch = errors.join("\n");
                    if let Err(e) = store.add_error_log(unit.bot_id, &batch) {
                        warn!(bot_id = %unit.bot_id, error = %e, "Could not persist error batch");
                    }
                    let payload = truncate_to_budget(&batch, NOTIFY_BYTE_BUDGET);
                    notifier
                        .notify(owner, &format!("Error in bot {bot_name}:\n{payload}"))
                        .await;
                }
            }
            Ok(None) => {}
            Err(e) => {
                warn!(bot_id = %unit.bot_id, error = %e, "Could not read stderr log");
            }
        }

        // Stop tailing once the unit is gone; the exit watcher handles
        // the aftermath.
        match backend.stats(&unit).await {
            Ok(stats) if !stats.alive => break,
            Ok(_) => {}
            Err(e) => {
                warn!(bot_id = %unit.bot_id, error = %e, "Stats failed in log watcher");
            }
        }
    }

    debug!(bot_id = %unit.bot_id, unit_id = %unit.unit_id, "Log watcher finished");
}

/// Spawn the exit watcher as a background task.
///
/// The spawn lives here, outside the module that defines `handle_exit`, so
/// the compiler can resolve the watcher future's `Send` bound without
/// recursing into that method's opaque return type within its own defining
/// scope.
pub fn spawn_exit_watcher(
    backend: Arc<dyn ExecutionBackend>,
    unit: ExecutionUnit,
    orchestrator: Arc<Orchestrator>,
    config: WatcherConfig,
    stop: watch::Receiver<bool>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(run_exit_watcher(backend, unit, orchestrator, config, stop))
}

/// Watch the unit until it terminates, then hand off to restart policy.
pub async fn run_exit_watcher(
    backend: Arc<dyn ExecutionBackend>,
    unit: ExecutionUnit,
    orchestrator: Arc<Orchestrator>,
    config: WatcherConfig,
    mut stop: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = stop.changed() => {
                if *stop.borrow() {
                    debug!(bot_id = %unit.bot_id, "Exit watcher cancelled");
                    return;
                }
            }
            _ = tokio::time::sleep(config.exit_poll) => {}
        }

        match backend.poll_exit(&unit).await {
            Ok(Some(code)) => {
                debug!(bot_id = %unit.bot_id, code, "Unit terminated");
                tokio::time::sleep(config.exit_settle).await;
                orchestrator.handle_exit(&unit, code).await;
                return;
            }
            Ok(None) => {}
            Err(e) => {
                warn!(bot_id = %unit.bot_id, error = %e, "Exit poll failed");
            }
        }
    }
}

/// Reads bytes appended since `offset`, advancing it. `None` when nothing
/// new arrived.
fn read_from_offset(
    path: &std::path::Path,
    offset: &mut u64,
) -> std::io::Result<Option<String>> {
    let len = match std::fs::metadata(path) {
        Ok(m) => m.len(),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(e),
    };
    if len <= *offset {
        // A truncated file restarts the tail.
        if len < *offset {
            *offset = len;
        }
        return Ok(None);
    }

    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(*offset))?;
    let mut buf = String::new();
    file.read_to_string(&mut buf)?;
    *offset = len;
    Ok(Some(buf))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{LaunchSpec, MockBackend};
    use crate::notify::RecordingNotifier;
    use botplane_id::BotId;
    use rstest::rstest;

    #[rstest]
    #[case("2024-01-01 ERROR something broke", true)]
    #[case("CRITICAL: db unreachable", true)]
    #[case("Traceback (most recent call last):", true)]
    #[case("unhandled exception in handler", true)]
    #[case("2024-01-01 INFO started", false)]
    #[case("DEBUG polling", false)]
    #[case("HTTP Request: GET /updates", false)]
    // Unknown output is suspicious by default
    #[case("segfault at 0x0", true)]
    #[case("some random print", true)]
    fn classification(#[case] line: &str, #[case] real: bool) {
        assert_eq!(is_real_error(line), real);
    }

    #[test]
    fn truncation_respects_char_boundaries() {
        let s = "aaaa\u{00e9}"; // 4 + 2 bytes
        assert_eq!(truncate_to_budget(s, 5), "aaaa");
        assert_eq!(truncate_to_budget(s, 6), s);
        assert_eq!(truncate_to_budget("short", 500), "short");
    }

    #[test]
    fn offset_reader_tails_appends() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stderr.log");
        std::fs::write(&path, "old line\n").unwrap();

        let mut offset = std::fs::metadata(&path).unwrap().len();
        assert!(read_from_offset(&path, &mut offset).unwrap().is_none());

        use std::io::Write;
        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        writeln!(f, "new line").unwrap();
        drop(f);

        let chunk = read_from_offset(&path, &mut offset).unwrap().unwrap();
        assert_eq!(chunk, "new line\n");
        assert!(read_from_offset(&path, &mut offset).unwrap().is_none());
    }

    #[tokio::test]
    async fn log_watcher_forwards_batched_errors() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::new());
        let owner = OwnerId::new();

        let spec = LaunchSpec {
            bot_id: BotId::new(),
            code_dir: dir.path().to_path_buf(),
            entrypoint: "main.py".to_string(),
            token: "tok".to_string(),
            remaining_seconds: 3600,
            cpu_limit_millis: 500,
            memory_limit_bytes: 512 * 1024 * 1024,
        };
        let unit = backend.launch(&spec).await.unwrap();

        let (stop_tx, stop_rx) = watch::channel(false);
        let config = WatcherConfig {
            log_poll: Duration::from_millis(20),
            exit_poll: Duration::from_millis(20),
            exit_settle: Duration::from_millis(1),
        };
        let handle = tokio::spawn(run_log_watcher(
            backend.clone() as Arc<dyn ExecutionBackend>,
            unit.clone(),
            owner,
            "echo".to_string(),
            store.clone(),
            notifier.clone(),
            config,
            stop_rx,
        ));

        // Mixed batch: two real errors, two benign lines
        {
            use std::io::Write;
            let mut f = std::fs::OpenOptions::new()
                .append(true)
                .open(&unit.stderr_path)
                .unwrap();
            writeln!(f, "INFO starting up").unwrap();
            writeln!(f, "ERROR boom").unwrap();
            writeln!(f, "Traceback (most recent call last):").unwrap();
            writeln!(f, "DEBUG retrying").unwrap();
        }

        for _ in 0..100 {
            if notifier.count() > 0 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let messages = notifier.messages();
        assert_eq!(messages.len(), 1, "one batched notification");
        assert!(messages[0].1.contains("ERROR boom"));
        assert!(messages[0].1.contains("Traceback"));
        assert!(!messages[0].1.contains("INFO starting up"));

        let logs = store.recent_errors(unit.bot_id, 5).unwrap();
        assert_eq!(logs.len(), 1);
        assert!(logs[0].0.contains("ERROR boom"));

        let _ = stop_tx.send(true);
        let _ = handle.await;
    }

    #[tokio::test]
    async fn log_watcher_exits_when_unit_dies() {
        let dir = tempfile::tempdir().unwrap();
        let backend = Arc::new(MockBackend::new());
        let store = Arc::new(Store::open_in_memory().unwrap());
        let notifier = Arc::new(RecordingNotifier::new());

        let spec = LaunchSpec {
            bot_id: BotId::new(),
            code_dir: dir.path().to_path_buf(),
            entrypoint: "main.py".to_string(),
            token: "tok".to_string(),
            remaining_seconds: 3600,
            cpu_limit_millis: 500,
            memory_limit_bytes: 512 * 1024 * 1024,
        };
        let unit = backend.launch(&spec).await.unwrap();
        backend.set_exited(&unit, 1);

        let (_stop_tx, stop_rx) = watch::channel(false);
        let config = WatcherConfig {
            log_poll: Duration::from_millis(10),
            exit_poll: Duration::from_millis(10),
            exit_settle: Duration::from_millis(1),
        };
        let handle = tokio::spawn(run_log_watcher(
            backend.clone() as Arc<dyn ExecutionBackend>,
            unit,
            OwnerId::new(),
            "echo".to_string(),
            store,
            notifier,
            config,
            stop_rx,
        ));

        // Terminates on its own without a stop signal
        tokio::time::timeout(Duration::from_secs(2), handle)
            .await
            .expect("watcher should exit once the unit is dead")
            .unwrap();
    }
}
