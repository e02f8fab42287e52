//! Embedded SQLite store.
//!
//! Holds the local job cache, per-user sessions, the persistent timer
//! queue, and the append-only message log. One connection, serialized
//! behind an async mutex; every statement is short.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use tokio::sync::Mutex;

use subpilot_core::jobs::{Job, JobStatus, SessionState, TimerType};
use subpilot_core::redact::redact_codes;

const SCHEMA: &str = "
CREATE TABLE IF NOT EXISTS jobs (
    id                TEXT PRIMARY KEY,
    user_npub         TEXT NOT NULL,
    service_id        TEXT NOT NULL,
    action            TEXT NOT NULL,
    trigger           TEXT NOT NULL,
    status            TEXT NOT NULL,
    billing_date      TEXT,
    access_end_date   TEXT,
    outreach_count    INTEGER NOT NULL DEFAULT 0,
    next_outreach_at  TEXT,
    amount_sats       INTEGER,
    invoice_id        TEXT,
    plan_id           TEXT,
    plan_display_name TEXT,
    created_at        TEXT NOT NULL,
    updated_at        TEXT NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_jobs_user ON jobs(user_npub);

CREATE TABLE IF NOT EXISTS sessions (
    user_npub    TEXT PRIMARY KEY,
    state        TEXT NOT NULL,
    job_id       TEXT,
    otp_attempts INTEGER NOT NULL DEFAULT 0,
    updated_at   TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS timers (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    timer_type TEXT NOT NULL,
    target_id  TEXT NOT NULL,
    fire_at    INTEGER NOT NULL,
    fired      INTEGER NOT NULL DEFAULT 0,
    payload    TEXT
);
CREATE INDEX IF NOT EXISTS idx_timers_due ON timers(fired, fire_at);

CREATE TABLE IF NOT EXISTS message_log (
    id         INTEGER PRIMARY KEY AUTOINCREMENT,
    user_npub  TEXT NOT NULL,
    direction  TEXT NOT NULL,
    content    TEXT NOT NULL,
    created_at TEXT NOT NULL
);
";

/// A per-user session row. Absence of a row means the user is idle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionRow {
    pub user_npub: String,
    pub state: SessionState,
    pub job_id: Option<String>,
    pub otp_attempts: u32,
}

/// A logged DM.
#[derive(Debug, Clone)]
pub struct LoggedMessage {
    pub direction: String,
    pub content: String,
}

/// A timer due for firing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DueTimer {
    pub timer_type: TimerType,
    pub target_id: String,
}

/// Handle to the orchestrator store. Cheap to clone.
#[derive(Clone)]
pub struct Db {
    conn: Arc<Mutex<Connection>>,
}

impl Db {
    /// Open (and migrate) the store at `path`.
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Open an in-memory store (tests).
    pub fn open_in_memory() -> anyhow::Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    // --- jobs ---

    /// Insert or replace a job row.
    pub async fn upsert_job(&self, job: &Job) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT OR REPLACE INTO jobs (id, user_npub, service_id, action, trigger, status,
                 billing_date, access_end_date, outreach_count, next_outreach_at, amount_sats,
                 invoice_id, plan_id, plan_display_name, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15, ?16)",
            params![
                job.id,
                job.user_npub,
                job.service_id,
                job.action.as_str(),
                job.trigger.as_str(),
                job.status.as_str(),
                job.billing_date,
                job.access_end_date,
                job.outreach_count,
                job.next_outreach_at,
                job.amount_sats,
                job.invoice_id,
                job.plan_id,
                job.plan_display_name,
                job.created_at,
                job.updated_at,
            ],
        )?;
        Ok(())
    }

    /// Fetch a job by id.
    pub async fn get_job(&self, job_id: &str) -> anyhow::Result<Option<Job>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row("SELECT * FROM jobs WHERE id = ?1", params![job_id], job_from_row)
            .optional()?;
        Ok(row)
    }

    /// All jobs for one user, oldest first.
    pub async fn jobs_for_user(&self, user_npub: &str) -> anyhow::Result<Vec<Job>> {
        let conn = self.conn.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM jobs WHERE user_npub = ?1 ORDER BY created_at")?;
        let rows = stmt
            .query_map(params![user_npub], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    /// Apply exactly one status transition.
    pub async fn update_job_status(&self, job_id: &str, status: JobStatus) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![job_id, status.as_str(), now_iso()],
        )?;
        Ok(())
    }

    /// Record billing fields once an invoice exists.
    pub async fn set_job_invoice(
        &self,
        job_id: &str,
        invoice_id: &str,
        amount_sats: u64,
        access_end_date: Option<&str>,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET invoice_id = ?2, amount_sats = ?3,
                 access_end_date = COALESCE(?4, access_end_date), updated_at = ?5
             WHERE id = ?1",
            params![job_id, invoice_id, amount_sats, access_end_date, now_iso()],
        )?;
        Ok(())
    }

    /// Record an outreach round.
    pub async fn set_job_outreach(
        &self,
        job_id: &str,
        outreach_count: u32,
        next_outreach_at: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "UPDATE jobs SET outreach_count = ?2, next_outreach_at = ?3, updated_at = ?4
             WHERE id = ?1",
            params![job_id, outreach_count, next_outreach_at, now_iso()],
        )?;
        Ok(())
    }

    /// Delete terminal jobs last touched at or before `cutoff`. Returns the
    /// number deleted.
    pub async fn delete_terminal_jobs_before(
        &self,
        cutoff: DateTime<Utc>,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n = conn.execute(
            "DELETE FROM jobs WHERE updated_at <= ?1 AND status IN
                 ('completed_paid', 'completed_reneged', 'completed',
                  'user_skip', 'implied_skip', 'user_abandon', 'failed')",
            params![cutoff.to_rfc3339_opts(SecondsFormat::Secs, true)],
        )?;
        Ok(n)
    }

    // --- sessions ---

    /// Create or update the session row for a user.
    pub async fn upsert_session(
        &self,
        user_npub: &str,
        state: SessionState,
        job_id: Option<&str>,
        otp_attempts: u32,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO sessions (user_npub, state, job_id, otp_attempts, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5)
             ON CONFLICT(user_npub) DO UPDATE SET
                 state = excluded.state,
                 job_id = excluded.job_id,
                 otp_attempts = excluded.otp_attempts,
                 updated_at = excluded.updated_at",
            params![user_npub, state.as_str(), job_id, otp_attempts, now_iso()],
        )?;
        Ok(())
    }

    /// Fetch a session by user.
    pub async fn get_session(&self, user_npub: &str) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT user_npub, state, job_id, otp_attempts FROM sessions WHERE user_npub = ?1",
                params![user_npub],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Fetch a session by the job it is driving.
    pub async fn get_session_by_job(&self, job_id: &str) -> anyhow::Result<Option<SessionRow>> {
        let conn = self.conn.lock().await;
        let row = conn
            .query_row(
                "SELECT user_npub, state, job_id, otp_attempts FROM sessions WHERE job_id = ?1",
                params![job_id],
                session_from_row,
            )
            .optional()?;
        Ok(row)
    }

    /// Delete the session row for a user (back to idle).
    pub async fn delete_session(&self, user_npub: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute("DELETE FROM sessions WHERE user_npub = ?1", params![user_npub])?;
        Ok(())
    }

    // --- timers ---

    /// Schedule a timer, superseding any unfired timer with the same
    /// `(type, target)` key.
    pub async fn schedule_timer(
        &self,
        timer_type: TimerType,
        target_id: &str,
        fire_at: i64,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM timers WHERE timer_type = ?1 AND target_id = ?2 AND fired = 0",
            params![timer_type.as_str(), target_id],
        )?;
        conn.execute(
            "INSERT INTO timers (timer_type, target_id, fire_at, fired) VALUES (?1, ?2, ?3, 0)",
            params![timer_type.as_str(), target_id, fire_at],
        )?;
        Ok(())
    }

    /// Cancel the unfired timer with this key, if any.
    pub async fn cancel_timer(&self, timer_type: TimerType, target_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM timers WHERE timer_type = ?1 AND target_id = ?2 AND fired = 0",
            params![timer_type.as_str(), target_id],
        )?;
        Ok(())
    }

    /// Cancel every unfired timer keyed to `target_id`, across all types.
    pub async fn cancel_timers_for(&self, target_id: &str) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "DELETE FROM timers WHERE target_id = ?1 AND fired = 0",
            params![target_id],
        )?;
        Ok(())
    }

    /// Pop every timer due at `now`: marks them fired and returns them.
    pub async fn due_timers(&self, now: i64) -> anyhow::Result<Vec<DueTimer>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT id, timer_type, target_id FROM timers
             WHERE fired = 0 AND fire_at <= ?1 ORDER BY fire_at",
        )?;
        let due = stmt
            .query_map(params![now], |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, String>(1)?,
                    row.get::<_, String>(2)?,
                ))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        drop(stmt);

        let mut out = Vec::with_capacity(due.len());
        for (id, timer_type, target_id) in due {
            conn.execute("UPDATE timers SET fired = 1 WHERE id = ?1", params![id])?;
            out.push(DueTimer {
                timer_type: timer_type.parse()?,
                target_id,
            });
        }
        Ok(out)
    }

    /// Number of unfired timers with this key (tests and invariants).
    pub async fn unfired_timer_count(
        &self,
        timer_type: Option<TimerType>,
        target_id: &str,
    ) -> anyhow::Result<usize> {
        let conn = self.conn.lock().await;
        let n: i64 = match timer_type {
            Some(t) => conn.query_row(
                "SELECT COUNT(*) FROM timers WHERE timer_type = ?1 AND target_id = ?2 AND fired = 0",
                params![t.as_str(), target_id],
                |row| row.get(0),
            )?,
            None => conn.query_row(
                "SELECT COUNT(*) FROM timers WHERE target_id = ?1 AND fired = 0",
                params![target_id],
                |row| row.get(0),
            )?,
        };
        Ok(n as usize)
    }

    // --- message log ---

    /// Append a DM to the log. Anything that looks like a one-time code is
    /// masked before the write.
    pub async fn log_message(
        &self,
        user_npub: &str,
        direction: &str,
        content: &str,
    ) -> anyhow::Result<()> {
        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO message_log (user_npub, direction, content, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![user_npub, direction, redact_codes(content), now_iso()],
        )?;
        Ok(())
    }

    /// All logged DMs for a user, oldest first.
    pub async fn messages_for(&self, user_npub: &str) -> anyhow::Result<Vec<LoggedMessage>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT direction, content FROM message_log WHERE user_npub = ?1 ORDER BY id",
        )?;
        let rows = stmt
            .query_map(params![user_npub], |row| {
                Ok(LoggedMessage {
                    direction: row.get(0)?,
                    content: row.get(1)?,
                })
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true)
}

fn job_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        user_npub: row.get("user_npub")?,
        service_id: row.get("service_id")?,
        action: parse_field(row, "action")?,
        trigger: parse_field(row, "trigger")?,
        status: parse_field(row, "status")?,
        billing_date: row.get("billing_date")?,
        access_end_date: row.get("access_end_date")?,
        outreach_count: row.get("outreach_count")?,
        next_outreach_at: row.get("next_outreach_at")?,
        amount_sats: row.get("amount_sats")?,
        invoice_id: row.get("invoice_id")?,
        plan_id: row.get("plan_id")?,
        plan_display_name: row.get("plan_display_name")?,
        created_at: row.get("created_at")?,
        updated_at: row.get("updated_at")?,
    })
}

fn session_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
    Ok(SessionRow {
        user_npub: row.get(0)?,
        state: {
            let raw: String = row.get(1)?;
            raw.parse().map_err(|err| {
                rusqlite::Error::FromSqlConversionFailure(
                    1,
                    rusqlite::types::Type::Text,
                    Box::new(err),
                )
            })?
        },
        job_id: row.get(2)?,
        otp_attempts: row.get(3)?,
    })
}

fn parse_field<T>(row: &rusqlite::Row<'_>, field: &str) -> rusqlite::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    let raw: String = row.get(field)?;
    raw.parse().map_err(|err: T::Err| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(err))
    })
}
