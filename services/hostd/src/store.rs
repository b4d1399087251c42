//! SQLite-based state store for the host daemon.
//!
//! Durable storage for owners, bots and their error logs. Every mutation
//! is an atomic single-row UPDATE; nothing here assumes multi-row
//! transactional consistency beyond per-bot scope. Execution handles are
//! never persisted, so `reset_running_on_boot` reconciles rows left
//! `running` by a previous daemon process.

use std::path::Path;
use std::sync::Mutex;

use botplane_id::{BotId, OwnerId};
use chrono::{DateTime, NaiveDate, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use thiserror::Error;
use tracing::debug;

use crate::model::{BackendKind, Bot, BotStatus, Owner};
use crate::plan::Plan;

/// Errors from state store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("SQLite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("invalid stored state: {0}")]
    Invalid(String),

    #[error("store lock poisoned")]
    Poisoned,
}

/// SQLite state store.
///
/// The connection is guarded by a mutex; operations are short single-row
/// statements, so contention stays negligible next to the per-bot
/// serialization the orchestrator already applies.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Open or create a store at the given path.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;

        // WAL for concurrent readers alongside the writer
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;

        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    /// Open an in-memory store (for testing).
    pub fn open_in_memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    fn init_schema(&self) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS owners (
                owner_id TEXT PRIMARY KEY,
                plan TEXT NOT NULL DEFAULT 'free',
                last_recovery_date TEXT,
                created_at INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS bots (
                bot_id TEXT PRIMARY KEY,
                owner_id TEXT NOT NULL,
                name TEXT NOT NULL,
                code_dir TEXT NOT NULL,
                entrypoint TEXT NOT NULL,
                token TEXT NOT NULL,
                backend TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'stopped',
                sleep_mode INTEGER NOT NULL DEFAULT 0,
                sleep_reason TEXT,
                total_seconds INTEGER NOT NULL,
                remaining_seconds INTEGER NOT NULL,
                power_max REAL NOT NULL,
                power_remaining REAL NOT NULL,
                restart_count INTEGER NOT NULL DEFAULT 0,
                last_restart_at INTEGER,
                auto_recovery_used INTEGER NOT NULL DEFAULT 0,
                last_checked INTEGER NOT NULL,
                warned_low INTEGER NOT NULL DEFAULT 0,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(owner_id) REFERENCES owners(owner_id)
            );

            CREATE INDEX IF NOT EXISTS idx_bots_owner ON bots(owner_id);
            CREATE INDEX IF NOT EXISTS idx_bots_status ON bots(status);

            CREATE TABLE IF NOT EXISTS error_logs (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                bot_id TEXT NOT NULL,
                entry TEXT NOT NULL,
                created_at INTEGER NOT NULL,
                FOREIGN KEY(bot_id) REFERENCES bots(bot_id)
            );

            CREATE INDEX IF NOT EXISTS idx_error_logs_bot ON error_logs(bot_id);
            "#,
        )?;
        Ok(())
    }

    fn lock(&self) -> Result<std::sync::MutexGuard<'_, Connection>, StoreError> {
        self.conn.lock().map_err(|_| StoreError::Poisoned)
    }

    // -------------------------------------------------------------------------
    // Owners
    // -------------------------------------------------------------------------

    /// Insert the owner row if it does not exist yet.
    pub fn ensure_owner(&self, id: OwnerId, plan: Plan) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT OR IGNORE INTO owners (owner_id, plan, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), plan.as_str(), Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn get_owner(&self, id: OwnerId) -> Result<Option<Owner>, StoreError> {
        let conn = self.lock()?;
        let row = conn
            .query_row(
                "SELECT owner_id, plan, last_recovery_date, created_at
                 FROM owners WHERE owner_id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, i64>(3)?,
                    ))
                },
            )
            .optional()?;

        let Some((owner_id, plan, recovery, created_at)) = row else {
            return Ok(None);
        };

        Ok(Some(Owner {
            id: OwnerId::parse(&owner_id)
                .map_err(|e| StoreError::Invalid(format!("owner_id: {e}")))?,
            plan: Plan::from_str_opt(&plan)
                .ok_or_else(|| StoreError::Invalid(format!("unknown plan '{plan}'")))?,
            last_recovery_date: recovery
                .map(|d| {
                    d.parse::<NaiveDate>()
                        .map_err(|e| StoreError::Invalid(format!("last_recovery_date: {e}")))
                })
                .transpose()?,
            created_at: timestamp(created_at)?,
        }))
    }

    /// Record that the owner spent their free recovery on `date`.
    pub fn use_recovery(&self, id: OwnerId, date: NaiveDate) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE owners SET last_recovery_date = ?1 WHERE owner_id = ?2",
            params![date.to_string(), id.to_string()],
        )?;
        Ok(())
    }

    // -------------------------------------------------------------------------
    // Bots
    // -------------------------------------------------------------------------

    pub fn create_bot(&self, bot: &Bot) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO bots (
                bot_id, owner_id, name, code_dir, entrypoint, token, backend,
                status, sleep_mode, sleep_reason,
                total_seconds, remaining_seconds, power_max, power_remaining,
                restart_count, last_restart_at, auto_recovery_used,
                last_checked, warned_low, created_at
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10,
                      ?11, ?12, ?13, ?14, ?15, ?16, ?17, ?18, ?19, ?20)",
            params![
                bot.id.to_string(),
                bot.owner.to_string(),
                bot.name,
                bot.code_dir,
                bot.entrypoint,
                bot.token,
                bot.backend.as_str(),
                bot.status.as_str(),
                bot.sleep_mode as i64,
                bot.sleep_reason,
                bot.total_seconds,
                bot.remaining_seconds,
                bot.power_max,
                bot.power_remaining,
                bot.restart_count as i64,
                bot.last_restart_at.map(|t| t.timestamp()),
                bot.auto_recovery_used as i64,
                bot.last_checked.timestamp(),
                bot.warned_low as i64,
                bot.created_at.timestamp(),
            ],
        )?;
        debug!(bot_id = %bot.id, "Bot row created");
        Ok(())
    }

    pub fn get_bot(&self, id: BotId) -> Result<Option<Bot>, StoreError> {
        let conn = self.lock()?;
        let bot = conn
            .query_row(
                &format!("SELECT {BOT_COLUMNS} FROM bots WHERE bot_id = ?1"),
                params![id.to_string()],
                bot_from_row,
            )
            .optional()?;
        bot.map(decode_bot).transpose()
    }

    pub fn list_owner_bots(&self, owner: OwnerId) -> Result<Vec<Bot>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE owner_id = ?1 ORDER BY created_at"
        ))?;
        let rows = stmt.query_map(params![owner.to_string()], bot_from_row)?;
        rows.map(|r| decode_bot(r?)).collect()
    }

    pub fn count_owner_bots(&self, owner: OwnerId) -> Result<u32, StoreError> {
        let conn = self.lock()?;
        let count: i64 = conn.query_row(
            "SELECT COUNT(*) FROM bots WHERE owner_id = ?1",
            params![owner.to_string()],
            |row| row.get(0),
        )?;
        Ok(count as u32)
    }

    /// All bots currently marked running; the enforcement loop scans these.
    pub fn list_running(&self) -> Result<Vec<Bot>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(&format!(
            "SELECT {BOT_COLUMNS} FROM bots WHERE status = 'running'"
        ))?;
        let rows = stmt.query_map([], bot_from_row)?;
        rows.map(|r| decode_bot(r?)).collect()
    }

    pub fn update_status(&self, id: BotId, status: BotStatus) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET status = ?1 WHERE bot_id = ?2",
            params![status.as_str(), id.to_string()],
        )?;
        Ok(())
    }

    /// Persist post-drain resources and the drain watermark.
    pub fn update_resources(
        &self,
        id: BotId,
        remaining_seconds: i64,
        power_remaining: f64,
        last_checked: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET remaining_seconds = ?1, power_remaining = ?2, last_checked = ?3
             WHERE bot_id = ?4",
            params![
                remaining_seconds,
                power_remaining,
                last_checked.timestamp(),
                id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Persist the full ledger after a top-up or recovery grant.
    pub fn save_ledger(&self, bot: &Bot) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET total_seconds = ?1, remaining_seconds = ?2,
                power_max = ?3, power_remaining = ?4, warned_low = ?5, last_checked = ?6
             WHERE bot_id = ?7",
            params![
                bot.total_seconds,
                bot.remaining_seconds,
                bot.power_max,
                bot.power_remaining,
                bot.warned_low as i64,
                bot.last_checked.timestamp(),
                bot.id.to_string()
            ],
        )?;
        Ok(())
    }

    /// Enter sleep: also forces the row to `stopped`.
    pub fn set_sleep_mode(&self, id: BotId, reason: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET sleep_mode = 1, sleep_reason = ?1, status = 'stopped'
             WHERE bot_id = ?2",
            params![reason, id.to_string()],
        )?;
        Ok(())
    }

    pub fn clear_sleep(&self, id: BotId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET sleep_mode = 0, sleep_reason = NULL WHERE bot_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn set_warned_low(&self, id: BotId, warned: bool) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET warned_low = ?1 WHERE bot_id = ?2",
            params![warned as i64, id.to_string()],
        )?;
        Ok(())
    }

    pub fn mark_auto_recovery_used(&self, id: BotId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET auto_recovery_used = 1 WHERE bot_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn increment_restart(&self, id: BotId, at: DateTime<Utc>) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET restart_count = restart_count + 1, last_restart_at = ?1
             WHERE bot_id = ?2",
            params![at.timestamp(), id.to_string()],
        )?;
        Ok(())
    }

    pub fn reset_restart_count(&self, id: BotId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "UPDATE bots SET restart_count = 0 WHERE bot_id = ?1",
            params![id.to_string()],
        )?;
        Ok(())
    }

    pub fn delete_bot(&self, id: BotId) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "DELETE FROM error_logs WHERE bot_id = ?1",
            params![id.to_string()],
        )?;
        conn.execute("DELETE FROM bots WHERE bot_id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// Mark rows left `running` by a previous daemon process as stopped.
    ///
    /// Execution handles live only in memory, so after a restart none of
    /// those units are tracked anymore. Returns the number of rows fixed.
    pub fn reset_running_on_boot(&self) -> Result<usize, StoreError> {
        let conn = self.lock()?;
        let fixed = conn.execute("UPDATE bots SET status = 'stopped' WHERE status = 'running'", [])?;
        Ok(fixed)
    }

    // -------------------------------------------------------------------------
    // Error logs
    // -------------------------------------------------------------------------

    pub fn add_error_log(&self, id: BotId, entry: &str) -> Result<(), StoreError> {
        let conn = self.lock()?;
        conn.execute(
            "INSERT INTO error_logs (bot_id, entry, created_at) VALUES (?1, ?2, ?3)",
            params![id.to_string(), entry, Utc::now().timestamp()],
        )?;
        Ok(())
    }

    pub fn recent_errors(
        &self,
        id: BotId,
        limit: u32,
    ) -> Result<Vec<(String, DateTime<Utc>)>, StoreError> {
        let conn = self.lock()?;
        let mut stmt = conn.prepare(
            "SELECT entry, created_at FROM error_logs
             WHERE bot_id = ?1 ORDER BY created_at DESC, id DESC LIMIT ?2",
        )?;
        let rows = stmt.query_map(params![id.to_string(), limit], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        rows.map(|r| {
            let (entry, ts) = r?;
            Ok((entry, timestamp(ts)?))
        })
        .collect()
    }
}

const BOT_COLUMNS: &str = "bot_id, owner_id, name, code_dir, entrypoint, token, backend, \
    status, sleep_mode, sleep_reason, total_seconds, remaining_seconds, power_max, \
    power_remaining, restart_count, last_restart_at, auto_recovery_used, last_checked, \
    warned_low, created_at";

/// Raw row tuple read before typed decoding.
type RawBot = (
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    String,
    bool,
    Option<String>,
    i64,
    i64,
    f64,
    f64,
    i64,
    Option<i64>,
    bool,
    i64,
    bool,
    i64,
);

fn bot_from_row(row: &Row<'_>) -> rusqlite::Result<RawBot> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
        row.get(15)?,
        row.get(16)?,
        row.get(17)?,
        row.get(18)?,
        row.get(19)?,
    ))
}

fn decode_bot(raw: RawBot) -> Result<Bot, StoreError> {
    let (
        bot_id,
        owner_id,
        name,
        code_dir,
        entrypoint,
        token,
        backend,
        status,
        sleep_mode,
        sleep_reason,
        total_seconds,
        remaining_seconds,
        power_max,
        power_remaining,
        restart_count,
        last_restart_at,
        auto_recovery_used,
        last_checked,
        warned_low,
        created_at,
    ) = raw;

    Ok(Bot {
        id: BotId::parse(&bot_id).map_err(|e| StoreError::Invalid(format!("bot_id: {e}")))?,
        owner: OwnerId::parse(&owner_id)
            .map_err(|e| StoreError::Invalid(format!("owner_id: {e}")))?,
        name,
        code_dir,
        entrypoint,
        token,
        backend: BackendKind::from_str_opt(&backend)
            .ok_or_else(|| StoreError::Invalid(format!("unknown backend '{backend}'")))?,
        status: BotStatus::from_str_opt(&status)
            .ok_or_else(|| StoreError::Invalid(format!("unknown status '{status}'")))?,
        sleep_mode,
        sleep_reason,
        total_seconds,
        remaining_seconds,
        power_max,
        power_remaining,
        restart_count: restart_count as u32,
        last_restart_at: last_restart_at.map(timestamp).transpose()?,
        auto_recovery_used,
        last_checked: timestamp(last_checked)?,
        warned_low,
        created_at: timestamp(created_at)?,
    })
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| StoreError::Invalid(format!("timestamp out of range: {secs}")))
}
