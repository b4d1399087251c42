//! Scripted backend for tests and development.
//!
//! Launches succeed instantly (optionally failing on demand), stats and
//! exit codes are set by the test, and nothing touches a real runtime.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use botplane_id::UnitId;
use chrono::Utc;
use tracing::debug;

use super::{BackendError, ExecutionBackend, ExecutionUnit, LaunchSpec, UnitStats};

/// In-memory backend with scripted behavior.
pub struct MockBackend {
    fail_launches: AtomicBool,
    launch_count: Mutex<u32>,
    /// Live units and their scripted state.
    units: Mutex<HashMap<UnitId, MockUnit>>,
}

struct MockUnit {
    unit: ExecutionUnit,
    stats: UnitStats,
    exit_code: Option<i32>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self {
            fail_launches: AtomicBool::new(false),
            launch_count: Mutex::new(0),
            units: Mutex::new(HashMap::new()),
        }
    }

    /// A backend whose launches all fail.
    pub fn failing() -> Self {
        let backend = Self::new();
        backend.fail_launches.store(true, Ordering::SeqCst);
        backend
    }

    pub fn set_fail_launches(&self, fail: bool) {
        self.fail_launches.store(fail, Ordering::SeqCst);
    }

    pub fn launch_count(&self) -> u32 {
        *self.launch_count.lock().expect("mock lock")
    }

    pub fn live_units(&self) -> usize {
        self.units.lock().expect("mock lock").len()
    }

    /// The live unit launched for a bot, if any.
    pub fn unit_for(&self, bot_id: botplane_id::BotId) -> Option<ExecutionUnit> {
        self.units
            .lock()
            .expect("mock lock")
            .values()
            .find(|u| u.unit.bot_id == bot_id)
            .map(|u| u.unit.clone())
    }

    /// Script the next stats sample for a unit.
    pub fn set_stats(&self, unit: &ExecutionUnit, cpu_percent: f64, memory_mb: f64) {
        if let Some(u) = self.units.lock().expect("mock lock").get_mut(&unit.unit_id) {
            u.stats = UnitStats {
                cpu_percent,
                memory_mb,
                alive: true,
            };
        }
    }

    /// Simulate the unit dying with the given exit code.
    pub fn set_exited(&self, unit: &ExecutionUnit, code: i32) {
        if let Some(u) = self.units.lock().expect("mock lock").get_mut(&unit.unit_id) {
            u.exit_code = Some(code);
            u.stats.alive = false;
        }
    }
}

impl Default for MockBackend {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ExecutionBackend for MockBackend {
    async fn launch(&self, spec: &LaunchSpec) -> Result<ExecutionUnit, BackendError> {
        *self.launch_count.lock().expect("mock lock") += 1;

        if self.fail_launches.load(Ordering::SeqCst) {
            return Err(BackendError::Unavailable(
                "mock backend configured to fail".to_string(),
            ));
        }

        let logs_dir = spec.code_dir.join("logs");
        std::fs::create_dir_all(&logs_dir)?;
        let stderr_path = logs_dir.join("stderr.log");
        if !stderr_path.exists() {
            std::fs::write(&stderr_path, b"")?;
        }

        let unit = ExecutionUnit {
            unit_id: UnitId::new(),
            bot_id: spec.bot_id,
            runtime_ref: format!("mock-{}", spec.bot_id),
            stderr_path,
            started_at: Utc::now(),
        };

        self.units.lock().expect("mock lock").insert(
            unit.unit_id,
            MockUnit {
                unit: unit.clone(),
                stats: UnitStats {
                    cpu_percent: 0.0,
                    memory_mb: 0.0,
                    alive: true,
                },
                exit_code: None,
            },
        );

        debug!(bot_id = %spec.bot_id, unit_id = %unit.unit_id, "[MOCK] launched");
        Ok(unit)
    }

    async fn stop(&self, unit: &ExecutionUnit, _grace: Duration) -> Result<bool, BackendError> {
        let removed = self
            .units
            .lock()
            .expect("mock lock")
            .remove(&unit.unit_id)
            .is_some();
        debug!(unit_id = %unit.unit_id, removed, "[MOCK] stopped");
        Ok(removed)
    }

    async fn stats(&self, unit: &ExecutionUnit) -> Result<UnitStats, BackendError> {
        Ok(self
            .units
            .lock()
            .expect("mock lock")
            .get(&unit.unit_id)
            .map(|u| u.stats)
            .unwrap_or_else(UnitStats::gone))
    }

    async fn poll_exit(&self, unit: &ExecutionUnit) -> Result<Option<i32>, BackendError> {
        let mut units = self.units.lock().expect("mock lock");
        match units.get(&unit.unit_id) {
            Some(u) => match u.exit_code {
                Some(code) => {
                    units.remove(&unit.unit_id);
                    Ok(Some(code))
                }
                None => Ok(None),
            },
            None => Ok(Some(-1)),
        }
    }
}
