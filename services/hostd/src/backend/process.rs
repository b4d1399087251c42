//! Bare-process execution backend.
//!
//! Each bot runs as an OS process in its own process group (session), with
//! working directory and environment scoped to the bot's code folder and
//! stdout/stderr appended to `logs/` inside it. Stopping signals the whole
//! group: SIGTERM first, SIGKILL after the grace period. Stats are sampled
//! from `/proc`, returning zeros once the pid is gone.

use std::collections::HashMap;
use std::fs::OpenOptions;
use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use botplane_id::UnitId;
use chrono::Utc;
use tokio::process::{Child, Command};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{BackendError, ExecutionBackend, ExecutionUnit, LaunchSpec, UnitStats};

/// Window over which a CPU sample is taken.
const CPU_SAMPLE_WINDOW: Duration = Duration::from_millis(100);

/// Backend that runs bots as supervised OS process groups.
pub struct ProcessBackend {
    /// Children by unit id. The `Child` must be retained to reap exits.
    children: Mutex<HashMap<UnitId, Child>>,
}

impl ProcessBackend {
    pub fn new() -> Self {
        Self {
            children: Mutex::new(HashMap::new()),
        }
    }

    /// Command line for an entrypoint: scripts go through their
    /// interpreter, anything else is executed directly.
    fn build_command(spec: &LaunchSpec) -> Command {
        let mut cmd = if spec.entrypoint.ends_with(".py") {
            let mut c = Command::new("python3");
            c.arg(&spec.entrypoint);
            c
        } else {
            Command::new(Path::new(".").join(&spec.entrypoint))
        };
        cmd.current_dir(&spec.code_dir);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        cmd.env("BOT_TOKEN", &spec.token);
        cmd.env("BOT_ID", spec.bot_id.to_string());
        cmd
    }
}

impl Default for ProcessBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for ProcessBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ExecutionUnit, BackendError> {
        let logs_dir = spec.code_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;

        let stdout_path = logs_dir.join("stdout.log");
        let stderr_path = logs_dir.join("stderr.log");
        let stdout = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stdout_path)?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&stderr_path)?;

        let mut cmd = Self::build_command(spec);
        cmd.stdin(Stdio::null())
            .stdout(Stdio::from(stdout))
            .stderr(Stdio::from(stderr));

        // New session so stop() can signal the whole group
        unsafe {
            cmd.pre_exec(|| {
                if libc::setsid() == -1 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        let child = cmd.spawn().map_err(|e| {
            // EAGAIN / ENOMEM from fork mean the host is out of pids or
            // memory, not that the workload is broken.
            if matches!(
                e.kind(),
                std::io::ErrorKind::WouldBlock | std::io::ErrorKind::OutOfMemory
            ) {
                BackendError::ResourceLimitExceeded(e.to_string())
            } else {
                BackendError::Launch(e)
            }
        })?;
        let pid = child.id().ok_or_else(|| {
            BackendError::Launch(std::io::Error::other("process exited before tracking"))
        })?;

        let unit = ExecutionUnit {
            unit_id: UnitId::new(),
            bot_id: spec.bot_id,
            runtime_ref: pid.to_string(),
            stderr_path,
            started_at: Utc::now(),
        };

        self.children.lock().await.insert(unit.unit_id, child);

        info!(
            bot_id = %spec.bot_id,
            unit_id = %unit.unit_id,
            pid,
            "Process group launched"
        );

        Ok(unit)
    }

    async fn stop(&self, unit: &ExecutionUnit, grace: Duration) -> Result<bool, BackendError> {
        let mut child = match self.children.lock().await.remove(&unit.unit_id) {
            Some(child) => child,
            None => {
                debug!(unit_id = %unit.unit_id, "Stop for untracked unit");
                return Ok(false);
            }
        };

        if child.try_wait()?.is_some() {
            return Ok(false);
        }

        let pid = unit
            .runtime_ref
            .parse::<i32>()
            .map_err(|_| BackendError::Unavailable(format!("bad pid '{}'", unit.runtime_ref)))?;

        signal_group(pid, libc::SIGTERM);

        match tokio::time::timeout(grace, child.wait()).await {
            Ok(status) => {
                status?;
            }
            Err(_) => {
                warn!(unit_id = %unit.unit_id, pid, "Grace expired, killing process group");
                signal_group(pid, libc::SIGKILL);
                child.wait().await?;
            }
        }

        info!(bot_id = %unit.bot_id, unit_id = %unit.unit_id, "Process group stopped");
        Ok(true)
    }

    async fn stats(&self, unit: &ExecutionUnit) -> Result<UnitStats, BackendError> {
        let Ok(pid) = unit.runtime_ref.parse::<i32>() else {
            return Ok(UnitStats::gone());
        };

        let Some(first) = read_cpu_ticks(pid) else {
            return Ok(UnitStats::gone());
        };
        tokio::time::sleep(CPU_SAMPLE_WINDOW).await;
        let Some(second) = read_cpu_ticks(pid) else {
            return Ok(UnitStats::gone());
        };

        let hertz = clock_ticks_per_sec();
        let delta_secs = (second.saturating_sub(first)) as f64 / hertz;
        let cpu_percent =
            (delta_secs / CPU_SAMPLE_WINDOW.as_secs_f64() * 100.0).clamp(0.0, 100.0);

        Ok(UnitStats {
            cpu_percent,
            memory_mb: read_rss_mb(pid).unwrap_or(0.0),
            alive: true,
        })
    }

    async fn poll_exit(&self, unit: &ExecutionUnit) -> Result<Option<i32>, BackendError> {
        let mut children = self.children.lock().await;
        let Some(child) = children.get_mut(&unit.unit_id) else {
            // Unit already reaped elsewhere; report an unknown failure code.
            return Ok(Some(-1));
        };

        match child.try_wait()? {
            Some(status) => {
                children.remove(&unit.unit_id);
                Ok(Some(exit_code(status)))
            }
            None => Ok(None),
        }
    }
}

/// Best-effort signal to a process group; missing groups are not an error.
fn signal_group(pid: i32, signal: i32) {
    unsafe {
        let pgid = libc::getpgid(pid);
        if pgid > 0 {
            libc::killpg(pgid, signal);
        } else {
            libc::kill(pid, signal);
        }
    }
}

fn exit_code(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    status
        .code()
        .or_else(|| status.signal().map(|sig| 128 + sig))
        .unwrap_or(-1)
}

fn clock_ticks_per_sec() -> f64 {
    let ticks = unsafe { libc::sysconf(libc::_SC_CLK_TCK) };
    if ticks > 0 {
        ticks as f64
    } else {
        100.0
    }
}

/// Cumulative utime+stime ticks from `/proc/<pid>/stat`, `None` once the
/// pid is gone.
fn read_cpu_ticks(pid: i32) -> Option<u64> {
    let stat = std::fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The comm field may contain spaces; fields are stable after the
    // closing paren. utime and stime are fields 14 and 15 overall,
    // i.e. indices 11 and 12 after ')'.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

/// Resident set size in MB from `/proc/<pid>/statm`.
fn read_rss_mb(pid: i32) -> Option<f64> {
    let statm = std::fs::read_to_string(format!("/proc/{pid}/statm")).ok()?;
    let rss_pages: u64 = statm.split_whitespace().nth(1)?.parse().ok()?;
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
        return None;
    }
    Some((rss_pages * page_size as u64) as f64 / 1024.0 / 1024.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use botplane_id::BotId;

    fn spec_for(dir: &Path, entrypoint: &str) -> LaunchSpec {
        LaunchSpec {
            bot_id: BotId::new(),
            code_dir: dir.to_path_buf(),
            entrypoint: entrypoint.to_string(),
            token: "tok".to_string(),
            remaining_seconds: 3600,
            cpu_limit_millis: 500,
            memory_limit_bytes: 512 * 1024 * 1024,
        }
    }

    fn write_script(dir: &Path, name: &str, body: &str) {
        use std::os::unix::fs::PermissionsExt;
        let path = dir.join(name);
        std::fs::write(&path, body).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    }

    #[tokio::test]
    async fn launch_and_stop_script() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "run.sh", "#!/bin/sh\nsleep 60\n");
        let backend = ProcessBackend::new();

        let unit = backend
            .launch(&spec_for(dir.path(), "run.sh"))
            .await
            .unwrap();
        assert!(unit.stderr_path.exists());

        let stats = backend.stats(&unit).await.unwrap();
        assert!(stats.alive);

        let was_running = backend
            .stop(&unit, Duration::from_secs(2))
            .await
            .unwrap();
        assert!(was_running);

        // A second stop is a no-op
        let was_running = backend
            .stop(&unit, Duration::from_secs(1))
            .await
            .unwrap();
        assert!(!was_running);
    }

    #[tokio::test]
    async fn poll_exit_reports_code() {
        let dir = tempfile::tempdir().unwrap();
        write_script(dir.path(), "crash.sh", "#!/bin/sh\nexit 7\n");
        let backend = ProcessBackend::new();

        let unit = backend
            .launch(&spec_for(dir.path(), "crash.sh"))
            .await
            .unwrap();

        let mut code = None;
        for _ in 0..50 {
            if let Some(c) = backend.poll_exit(&unit).await.unwrap() {
                code = Some(c);
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(code, Some(7));
    }

    #[tokio::test]
    async fn stats_for_vanished_pid_are_zero() {
        let backend = ProcessBackend::new();
        let unit = ExecutionUnit {
            unit_id: UnitId::new(),
            bot_id: BotId::new(),
            runtime_ref: "999999999".to_string(),
            stderr_path: std::path::PathBuf::from("/nonexistent"),
            started_at: Utc::now(),
        };

        let stats = backend.stats(&unit).await.unwrap();
        assert_eq!(stats, UnitStats::gone());
    }

    #[tokio::test]
    async fn launch_missing_entrypoint_fails() {
        let dir = tempfile::tempdir().unwrap();
        let backend = ProcessBackend::new();
        let result = backend.launch(&spec_for(dir.path(), "missing.sh")).await;
        assert!(matches!(result, Err(BackendError::Launch(_))));
    }

    #[test]
    fn proc_stat_parsing_handles_spaced_comm() {
        // Not a real pid read, but the field math must survive "(a b)".
        let line = "1234 (a b) S 1 1234 1234 0 -1 4194304 100 0 0 0 55 45 0 0 20 0 1 0 100 1000 50";
        let rest = line.rsplit_once(')').unwrap().1;
        let fields: Vec<&str> = rest.split_whitespace().collect();
        assert_eq!(fields[11], "55");
        assert_eq!(fields[12], "45");
    }
}
