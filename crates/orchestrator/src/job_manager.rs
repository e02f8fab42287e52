//! Job lifecycle: polling, claiming, outreach cadence, the dispatch gate,
//! timer routing, reconciliation, and cleanup.
//!
//! The dispatch gate bounds how many jobs run on the worker at once. Both
//! `request_dispatch` and `on_job_complete` mutate the `(active, queue)`
//! pair under one lock, and the dispatch HTTP call happens under that lock
//! too: it completes in well under a second, and unlocking first would open
//! a window where two completions overshoot the worker pool.

use std::collections::{HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, NaiveDate, Utc};
use tokio::sync::Mutex as AsyncMutex;

use subpilot_core::config::Config;
use subpilot_core::jobs::{Action, Job, JobStatus, TimerType};

use crate::db::{Db, DueTimer};
use crate::messages;
use crate::session::{Dispatch, SessionEngine};
use crate::timers::Timers;
use crate::transport::Outbox;
use crate::upstream::{TerminalStatus, UpstreamApi};

/// The slice of configuration the manager needs.
#[derive(Debug, Clone)]
pub struct JobManagerConfig {
    pub max_concurrent_agent_jobs: usize,
    pub outreach_interval: Duration,
    pub last_chance_lead: Duration,
    pub terminal_retention: Duration,
}

impl From<&Config> for JobManagerConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            max_concurrent_agent_jobs: cfg.max_concurrent_agent_jobs,
            outreach_interval: cfg.outreach_interval,
            last_chance_lead: cfg.last_chance_lead,
            terminal_retention: cfg.terminal_retention,
        }
    }
}

#[derive(Default)]
struct DispatchGate {
    active: HashSet<String>,
    queue: VecDeque<String>,
}

/// Owns the process-wide work queue and the dispatch gate.
pub struct JobManager {
    db: Db,
    timers: Timers,
    upstream: Arc<dyn UpstreamApi>,
    session: Arc<SessionEngine>,
    outbox: Outbox,
    cfg: JobManagerConfig,
    gate: AsyncMutex<DispatchGate>,
    immediate: std::sync::Mutex<HashSet<String>>,
}

impl JobManager {
    pub fn new(
        db: Db,
        timers: Timers,
        upstream: Arc<dyn UpstreamApi>,
        session: Arc<SessionEngine>,
        outbox: Outbox,
        cfg: JobManagerConfig,
    ) -> Self {
        Self {
            db,
            timers,
            upstream,
            session,
            outbox,
            cfg,
            gate: AsyncMutex::new(DispatchGate::default()),
            immediate: std::sync::Mutex::new(HashSet::new()),
        }
    }

    // --- polling & claiming ---

    /// One poll round: fetch pending jobs, claim them, cache the claimed
    /// ones locally and send their first outreach. Returns the claimed ids.
    pub async fn poll_and_claim(&self) -> anyhow::Result<Vec<String>> {
        let pending = self.upstream.pending_jobs().await?;
        if pending.is_empty() {
            return Ok(Vec::new());
        }

        let ids: Vec<String> = pending.iter().map(|job| job.id.clone()).collect();
        let outcome = self.upstream.claim_jobs(&ids).await?;
        if !outcome.blocked.is_empty() {
            tracing::debug!(blocked = outcome.blocked.len(), "claim blocked some jobs");
        }

        for job in &pending {
            if !outcome.claimed.contains(&job.id) {
                continue;
            }
            // Claim is idempotent upstream; only a first claim lands here.
            // A job we already cached keeps its local progress.
            if self.db.get_job(&job.id).await?.is_none() {
                let mut cached = job.clone();
                cached.status = JobStatus::Dispatched;
                self.db.upsert_job(&cached).await?;
                self.send_outreach(&job.id).await?;
            }
        }
        Ok(outcome.claimed)
    }

    /// Mark a job for immediate dispatch: the next outreach attempt skips
    /// the DM and dispatches as if the user had already consented.
    pub fn mark_immediate(&self, job_id: &str) {
        self.immediate
            .lock()
            .expect("immediate set poisoned")
            .insert(job_id.to_string());
    }

    fn take_immediate(&self, job_id: &str) -> bool {
        self.immediate
            .lock()
            .expect("immediate set poisoned")
            .remove(job_id)
    }

    // --- outreach ---

    /// Send (or reschedule) outreach for a job, honoring the guards: drop
    /// terminal jobs, reschedule around a busy user, block on debt, and
    /// short-circuit to dispatch for immediate jobs.
    pub async fn send_outreach(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::debug!(job = %job_id, "outreach for unknown job, dropping");
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if self.take_immediate(job_id) {
            tracing::info!(job = %job_id, "immediate job, dispatching without outreach");
            self.request_dispatch(&job.user_npub, job_id).await?;
            return Ok(());
        }

        // Never DM over a live flow; check again after one interval.
        if self.session.is_busy(&job.user_npub).await? {
            self.timers
                .schedule_delay(TimerType::Outreach, job_id, self.cfg.outreach_interval)
                .await?;
            return Ok(());
        }

        let debt_sats = match self.upstream.get_user(&job.user_npub).await {
            Ok(Some(user)) => user.debt_sats,
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(job = %job_id, "debt lookup failed, deferring outreach: {err:#}");
                self.timers
                    .schedule_delay(TimerType::Outreach, job_id, self.cfg.outreach_interval)
                    .await?;
                return Ok(());
            }
        };
        if debt_sats > 0 {
            self.outbox
                .send_dm(&job.user_npub, &messages::debt_block(debt_sats))
                .await;
            return Ok(());
        }

        let dm = match (job.outreach_count, job.action, job.billing_date.as_deref()) {
            (0, Action::Cancel, Some(date)) => messages::outreach_cancel(&job.service_id, date),
            (0, Action::Cancel, None) => messages::outreach_cancel_no_date(&job.service_id),
            (0, Action::Resume, _) => messages::outreach_resume(&job.service_id),
            (_, action, _) => messages::outreach_followup(&job.service_id, action),
        };
        self.outbox.send_dm(&job.user_npub, &dm).await;

        let next_at = Utc::now() + chrono::Duration::seconds(self.cfg.outreach_interval.as_secs() as i64);
        self.db
            .set_job_outreach(
                job_id,
                job.outreach_count + 1,
                &next_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            )
            .await?;
        self.db
            .update_job_status(job_id, JobStatus::OutreachSent)
            .await?;
        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::OutreachSent)
            .await
        {
            tracing::warn!(job = %job_id, "upstream outreach_sent update failed: {err:#}");
        }

        self.timers
            .schedule_delay(TimerType::Outreach, job_id, self.cfg.outreach_interval)
            .await?;

        if let Some(billing) = job.billing_date.as_deref().and_then(parse_billing_date) {
            let billing_ts = billing.timestamp();
            let lead = self.cfg.last_chance_lead.as_secs() as i64;
            self.timers
                .schedule_at(TimerType::LastChance, job_id, billing_ts - lead)
                .await?;
            self.timers
                .schedule_at(TimerType::ImpliedSkip, job_id, billing_ts)
                .await?;
        }
        Ok(())
    }

    /// Find the job outreach is (or should be) waiting on for this user.
    pub async fn get_active_job_for_user(&self, user_npub: &str) -> anyhow::Result<Option<Job>> {
        let jobs = self.db.jobs_for_user(user_npub).await?;
        Ok(jobs.into_iter().find(|job| job.status.is_outreach_eligible()))
    }

    // --- user actions on outreach ---

    /// User declined this cycle.
    pub async fn handle_skip(&self, user_npub: &str, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::UserSkip)
            .await
        {
            tracing::error!(job = %job_id, "upstream user_skip update failed: {err:#}");
        }
        self.db.update_job_status(job_id, JobStatus::UserSkip).await?;
        self.timers.cancel_all(job_id).await?;
        self.outbox
            .send_dm(user_npub, &messages::skip_ack(&job.service_id))
            .await;
        Ok(())
    }

    /// User asked to be reminded later.
    pub async fn handle_snooze(&self, user_npub: &str, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::Snoozed)
            .await
        {
            tracing::error!(job = %job_id, "upstream snoozed update failed: {err:#}");
        }
        self.db.update_job_status(job_id, JobStatus::Snoozed).await?;

        let next_at = Utc::now() + chrono::Duration::seconds(self.cfg.outreach_interval.as_secs() as i64);
        self.db
            .set_job_outreach(
                job_id,
                job.outreach_count,
                &next_at.to_rfc3339_opts(chrono::SecondsFormat::Secs, true),
            )
            .await?;
        self.timers.cancel(TimerType::Outreach, job_id).await?;
        self.timers
            .schedule_delay(TimerType::Outreach, job_id, self.cfg.outreach_interval)
            .await?;

        let hours = self.cfg.outreach_interval.as_secs() / 3600;
        self.outbox
            .send_dm(user_npub, &messages::snooze_ack(hours))
            .await;
        Ok(())
    }

    // --- dispatch gate ---

    /// Number of free worker slots right now.
    pub async fn slots_available(&self) -> usize {
        let gate = self.gate.lock().await;
        self.cfg.max_concurrent_agent_jobs.saturating_sub(gate.active.len())
    }

    /// Dispatch a consenting user's job, or queue it when the worker pool
    /// is full. The HTTP dispatch happens under the gate lock.
    pub async fn request_dispatch(&self, user_npub: &str, job_id: &str) -> anyhow::Result<()> {
        let mut gate = self.gate.lock().await;

        if gate.active.contains(job_id) || gate.queue.contains(&job_id.to_string()) {
            tracing::warn!(job = %job_id, "dispatch requested for already tracked job");
            return Ok(());
        }

        if gate.active.len() < self.cfg.max_concurrent_agent_jobs {
            gate.active.insert(job_id.to_string());
            let started = self
                .session
                .handle_yes(user_npub, job_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(job = %job_id, "dispatch failed: {err:#}");
                    Dispatch::NotStarted
                });
            if started == Dispatch::NotStarted {
                gate.active.remove(job_id);
                self.dispatch_next_locked(&mut gate).await;
            }
        } else {
            gate.queue.push_back(job_id.to_string());
            let position = gate.queue.len();
            self.outbox
                .send_dm(user_npub, &messages::queued_eta(position))
                .await;
        }
        Ok(())
    }

    /// Release a finished job's slot and dispatch the next queued job
    /// atomically.
    pub async fn on_job_complete(&self, job_id: &str) {
        let mut gate = self.gate.lock().await;
        gate.active.remove(job_id);
        if gate.active.len() < self.cfg.max_concurrent_agent_jobs {
            self.dispatch_next_locked(&mut gate).await;
        }
    }

    /// Try to dispatch the head of the queue. Returns whether a job
    /// started.
    pub async fn try_dispatch_next(&self) -> bool {
        let mut gate = self.gate.lock().await;
        if gate.active.len() >= self.cfg.max_concurrent_agent_jobs {
            return false;
        }
        self.dispatch_next_locked(&mut gate).await
    }

    // Pops queued jobs until one dispatches. Jobs whose local row vanished
    // (raced with reconciliation) are skipped.
    async fn dispatch_next_locked(&self, gate: &mut DispatchGate) -> bool {
        while let Some(job_id) = gate.queue.pop_front() {
            let job = match self.db.get_job(&job_id).await {
                Ok(Some(job)) => job,
                Ok(None) => {
                    tracing::debug!(job = %job_id, "queued job vanished, skipping");
                    continue;
                }
                Err(err) => {
                    tracing::error!(job = %job_id, "queued job lookup failed: {err:#}");
                    continue;
                }
            };
            gate.active.insert(job_id.clone());
            let started = self
                .session
                .handle_yes(&job.user_npub, &job_id)
                .await
                .unwrap_or_else(|err| {
                    tracing::error!(job = %job_id, "queued dispatch failed: {err:#}");
                    Dispatch::NotStarted
                });
            if started == Dispatch::Started {
                return true;
            }
            gate.active.remove(&job_id);
        }
        false
    }

    // --- timers ---

    /// Route a fired timer to its handler. Every handler is idempotent:
    /// firing against a terminal job is a no-op.
    pub async fn handle_timer(&self, timer: &DueTimer) -> anyhow::Result<()> {
        match timer.timer_type {
            TimerType::Outreach => self.send_outreach(&timer.target_id).await,
            TimerType::LastChance => self.handle_last_chance(&timer.target_id).await,
            TimerType::ImpliedSkip => self.handle_implied_skip(&timer.target_id).await,
            TimerType::OtpTimeout => self.session.handle_otp_timeout(&timer.target_id).await,
            TimerType::PaymentExpiry => {
                self.session.handle_payment_expired(&timer.target_id).await
            }
        }
    }

    /// Nudge shortly before the billing date. Skipped for terminal jobs,
    /// busy users, and billing dates already in the past.
    pub async fn handle_last_chance(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }
        let Some(billing) = job.billing_date.as_deref().and_then(parse_billing_date) else {
            return Ok(());
        };
        let days_left = (billing - Utc::now()).num_days();
        if days_left < 0 {
            return Ok(());
        }
        if self.session.is_busy(&job.user_npub).await? {
            return Ok(());
        }
        self.outbox
            .send_dm(
                &job.user_npub,
                &messages::last_chance(&job.service_id, days_left.max(1)),
            )
            .await;
        Ok(())
    }

    /// The billing date passed with no engagement: terminal, silently.
    pub async fn handle_implied_skip(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(job) = self.db.get_job(job_id).await? else {
            return Ok(());
        };
        if job.status.is_terminal() {
            return Ok(());
        }

        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::ImpliedSkip)
            .await
        {
            tracing::error!(job = %job_id, "upstream implied_skip update failed: {err:#}");
        }
        self.db
            .update_job_status(job_id, JobStatus::ImpliedSkip)
            .await?;
        self.timers.cancel_all(job_id).await?;
        Ok(())
    }

    // --- reconciliation & cleanup ---

    /// Pull the coordinator's terminal statuses and apply them locally.
    pub async fn reconcile_tick(&self) -> anyhow::Result<usize> {
        let terminal = self.upstream.terminal_statuses().await?;
        self.reconcile_terminal_jobs(&terminal).await
    }

    /// Apply authoritative terminal statuses: overwrite the local status,
    /// cancel every timer, purge the dispatch structures, and delete any
    /// session driving the job. No DM is sent; operator actions are silent.
    pub async fn reconcile_terminal_jobs(
        &self,
        terminal: &[TerminalStatus],
    ) -> anyhow::Result<usize> {
        let mut applied = 0;
        for report in terminal {
            if !report.status.is_terminal() {
                tracing::warn!(job = %report.id, status = %report.status, "non-terminal status in reconcile feed");
                continue;
            }
            let Some(local) = self.db.get_job(&report.id).await? else {
                continue;
            };
            if local.status.is_terminal() {
                continue;
            }

            tracing::info!(
                job = %report.id,
                from = %local.status,
                to = %report.status,
                "reconciling terminal status"
            );
            self.db.update_job_status(&report.id, report.status).await?;
            self.timers.cancel_all(&report.id).await?;

            {
                let mut gate = self.gate.lock().await;
                gate.active.remove(&report.id);
                gate.queue.retain(|id| id != &report.id);
            }

            if self.db.get_session_by_job(&report.id).await?.is_some() {
                self.db.delete_session(&local.user_npub).await?;
            }
            applied += 1;
        }
        Ok(applied)
    }

    /// Delete terminal jobs older than the retention window. Returns the
    /// number deleted.
    pub async fn cleanup_terminal_jobs(&self) -> anyhow::Result<usize> {
        let cutoff = Utc::now()
            - chrono::Duration::seconds(self.cfg.terminal_retention.as_secs() as i64);
        self.db.delete_terminal_jobs_before(cutoff).await
    }
}

// Accepts a bare date (`2026-03-15`) or a full timestamp.
fn parse_billing_date(raw: &str) -> Option<DateTime<Utc>> {
    if let Ok(dt) = DateTime::parse_from_rfc3339(raw) {
        return Some(dt.with_timezone(&Utc));
    }
    if let Ok(date) = NaiveDate::parse_from_str(raw, "%Y-%m-%d") {
        return Some(date.and_hms_opt(0, 0, 0)?.and_utc());
    }
    // `2026-02-18T10:00:00` without an offset.
    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S") {
        return Some(dt.and_utc());
    }
    tracing::warn!("unparseable billing date: {raw:?}");
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn billing_date_formats() {
        assert!(parse_billing_date("2026-03-15").is_some());
        assert!(parse_billing_date("2026-03-15T12:30:00Z").is_some());
        assert!(parse_billing_date("2026-03-15T12:30:00+02:00").is_some());
        assert!(parse_billing_date("2026-03-15T12:30:00").is_some());
        assert!(parse_billing_date("soon").is_none());
    }
}
