//! Per-user conversation state machine.
//!
//! One session per user max, moving through IDLE, OTP_CONFIRM, EXECUTING,
//! AWAITING_OTP, AWAITING_CREDENTIAL and INVOICE_SENT. Four event sources
//! feed it: classified user DMs, worker callbacks, timer fires, and upstream
//! pushes. Every handler serializes on a per-user advisory lock so those
//! sources cannot interleave within one user.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};

use subpilot_core::config::Config;
use subpilot_core::jobs::{Action, Job, JobStatus, SessionState, TimerType, Trigger};

use crate::agent_client::{ExecuteRequest, WorkerApi};
use crate::db::{Db, SessionRow};
use crate::messages;
use crate::timers::Timers;
use crate::transport::Outbox;
use crate::upstream::{CredentialOpener, UpstreamApi};

/// Whether a dispatch attempt actually started a worker job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    /// The worker accepted the job and the OTP timeout is armed.
    Started,
    /// Nothing is running (missing credentials, upstream veto, worker
    /// refusal). Any session created along the way was cleaned up.
    NotStarted,
}

/// Result payload reported by the worker when a job finishes.
#[derive(Debug, Clone, Deserialize)]
pub struct JobResult {
    pub job_id: String,
    pub success: bool,
    #[serde(default)]
    pub access_end_date: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_code: Option<String>,
    #[serde(default)]
    pub duration_seconds: u64,
    #[serde(default)]
    pub stats: Option<serde_json::Value>,
}

/// The slice of configuration the state machine needs.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub otp_timeout: Duration,
    pub payment_expiry: Duration,
    pub action_price_sats: u64,
    pub base_url: String,
}

impl From<&Config> for SessionConfig {
    fn from(cfg: &Config) -> Self {
        Self {
            otp_timeout: cfg.otp_timeout,
            payment_expiry: cfg.payment_expiry,
            action_price_sats: cfg.action_price_sats,
            base_url: cfg.base_url.clone(),
        }
    }
}

/// Per-user advisory locks, created on demand with a bounded cache.
///
/// A process-wide lock would serialize DMs from unrelated users; this costs
/// one map lookup per event instead.
struct UserLocks {
    inner: std::sync::Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
}

const LOCK_CACHE_HIGH_WATER: usize = 512;

impl UserLocks {
    fn new() -> Self {
        Self {
            inner: std::sync::Mutex::new(HashMap::new()),
        }
    }

    async fn lock(&self, user_npub: &str) -> OwnedMutexGuard<()> {
        let entry = {
            let mut map = self.inner.lock().expect("user lock map poisoned");
            if map.len() > LOCK_CACHE_HIGH_WATER {
                map.retain(|_, lock| Arc::strong_count(lock) > 1);
            }
            map.entry(user_npub.to_string())
                .or_insert_with(|| Arc::new(AsyncMutex::new(())))
                .clone()
        };
        entry.lock_owned().await
    }
}

/// The conversation state machine.
pub struct SessionEngine {
    db: Db,
    timers: Timers,
    upstream: Arc<dyn UpstreamApi>,
    worker: Arc<dyn WorkerApi>,
    opener: Arc<dyn CredentialOpener>,
    outbox: Outbox,
    cfg: SessionConfig,
    locks: UserLocks,
    // Which named credential each user is currently being asked for.
    // In-memory only, like the worker-side future it pairs with.
    pending_credentials: AsyncMutex<HashMap<String, String>>,
}

impl SessionEngine {
    pub fn new(
        db: Db,
        timers: Timers,
        upstream: Arc<dyn UpstreamApi>,
        worker: Arc<dyn WorkerApi>,
        opener: Arc<dyn CredentialOpener>,
        outbox: Outbox,
        cfg: SessionConfig,
    ) -> Self {
        Self {
            db,
            timers,
            upstream,
            worker,
            opener,
            outbox,
            cfg,
            locks: UserLocks::new(),
            pending_credentials: AsyncMutex::new(HashMap::new()),
        }
    }

    /// Current state for a user; `Idle` when no session row exists.
    pub async fn state_of(&self, user_npub: &str) -> anyhow::Result<SessionState> {
        Ok(self
            .db
            .get_session(user_npub)
            .await?
            .map(|row| row.state)
            .unwrap_or(SessionState::Idle))
    }

    /// Whether the user has a live (non-idle) session.
    pub async fn is_busy(&self, user_npub: &str) -> anyhow::Result<bool> {
        Ok(self.state_of(user_npub).await? != SessionState::Idle)
    }

    /// The job the user's session is driving, if any.
    pub async fn current_job(&self, user_npub: &str) -> anyhow::Result<Option<Job>> {
        let Some(row) = self.db.get_session(user_npub).await? else {
            return Ok(None);
        };
        let Some(job_id) = row.job_id else {
            return Ok(None);
        };
        self.db.get_job(&job_id).await
    }

    /// User consented to the outreach. Fetch and unseal credentials, move
    /// the job to `active` locally and upstream, dispatch to the worker, arm
    /// the OTP timeout.
    pub async fn handle_yes(&self, user_npub: &str, job_id: &str) -> anyhow::Result<Dispatch> {
        let _guard = self.locks.lock(user_npub).await;
        tracing::info!(user = %short(user_npub), job = %short(job_id), "handle_yes");

        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::error!(job = %short(job_id), "handle_yes: job not in local store");
            self.outbox.send_dm(user_npub, &messages::error_generic()).await;
            return Ok(Dispatch::NotStarted);
        };

        let sealed = match self.upstream.get_credentials(user_npub, &job.service_id).await {
            Ok(Some(sealed)) => sealed,
            Ok(None) => {
                self.outbox
                    .send_dm(
                        user_npub,
                        &messages::no_credentials(&job.service_id, &self.cfg.base_url),
                    )
                    .await;
                return Ok(Dispatch::NotStarted);
            }
            Err(err) => {
                tracing::error!(job = %short(job_id), "credential fetch failed: {err:#}");
                self.outbox.send_dm(user_npub, &messages::error_generic()).await;
                return Ok(Dispatch::NotStarted);
            }
        };
        let mut creds = match self.opener.open(&sealed) {
            Ok(creds) => creds,
            Err(err) => {
                tracing::error!(job = %short(job_id), "credential unseal failed: {err:#}");
                self.outbox.send_dm(user_npub, &messages::error_generic()).await;
                return Ok(Dispatch::NotStarted);
            }
        };

        self.db
            .upsert_session(user_npub, SessionState::Executing, Some(job_id), 0)
            .await?;
        self.outbox
            .send_dm(user_npub, &messages::executing(&job.service_id, job.action))
            .await;

        // The coordinator may have reconciled the job terminal in the
        // meantime; its veto is authoritative.
        if let Err(err) = self.upstream.update_job_status(job_id, JobStatus::Active).await {
            tracing::error!(job = %short(job_id), "upstream refused active transition: {err:#}");
            self.outbox.send_dm(user_npub, &messages::error_generic()).await;
            self.db.delete_session(user_npub).await?;
            scrub_credentials(&mut creds);
            return Ok(Dispatch::NotStarted);
        }
        self.db.update_job_status(job_id, JobStatus::Active).await?;

        let dispatched = self.dispatch_to_worker(&job, &mut creds, user_npub).await;
        if !dispatched {
            self.fail_job(user_npub, &job, Some("agent rejected the job"), None)
                .await?;
            return Ok(Dispatch::NotStarted);
        }

        self.timers
            .schedule_delay(TimerType::OtpTimeout, job_id, self.cfg.otp_timeout)
            .await?;
        Ok(Dispatch::Started)
    }

    /// Operator dispatch from the CLI: no outreach, no consent, no billing.
    pub async fn handle_cli_dispatch(
        &self,
        user_npub: &str,
        service: &str,
        action: Action,
        mut credentials: HashMap<String, String>,
        plan_id: Option<String>,
        plan_display_name: Option<String>,
        job_id: &str,
    ) -> anyhow::Result<Dispatch> {
        let _guard = self.locks.lock(user_npub).await;
        tracing::info!(user = %short(user_npub), job = %job_id, "cli dispatch");

        self.db
            .upsert_session(user_npub, SessionState::Executing, Some(job_id), 0)
            .await?;

        let now = chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Secs, true);
        let job = Job {
            id: job_id.to_string(),
            user_npub: user_npub.to_string(),
            service_id: service.to_string(),
            action,
            trigger: Trigger::Cli,
            status: JobStatus::Active,
            billing_date: None,
            access_end_date: None,
            outreach_count: 0,
            next_outreach_at: None,
            amount_sats: None,
            invoice_id: None,
            plan_id,
            plan_display_name,
            created_at: now.clone(),
            updated_at: now,
        };
        self.db.upsert_job(&job).await?;

        let dispatched = self.dispatch_to_worker(&job, &mut credentials, user_npub).await;
        if !dispatched {
            tracing::error!(job = %job_id, "agent rejected cli job");
            self.db.update_job_status(job_id, JobStatus::Failed).await?;
            self.db.delete_session(user_npub).await?;
            return Ok(Dispatch::NotStarted);
        }

        self.timers
            .schedule_delay(TimerType::OtpTimeout, job_id, self.cfg.otp_timeout)
            .await?;
        Ok(Dispatch::Started)
    }

    /// Worker callback: the automation hit a verification-code page.
    pub async fn handle_otp_needed(
        &self,
        job_id: &str,
        service: &str,
        prompt: Option<&str>,
    ) -> anyhow::Result<()> {
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "otp_needed: no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;
        let Some(session) = self.reload(&user_npub, job_id).await? else {
            return Ok(());
        };

        self.db
            .upsert_session(
                &user_npub,
                SessionState::AwaitingOtp,
                Some(job_id),
                session.otp_attempts,
            )
            .await?;
        self.outbox
            .send_dm(&user_npub, &messages::otp_needed(service, prompt))
            .await;

        self.timers.cancel(TimerType::OtpTimeout, job_id).await?;
        self.timers
            .schedule_delay(TimerType::OtpTimeout, job_id, self.cfg.otp_timeout)
            .await?;
        Ok(())
    }

    /// User forwarded a one-time code. Relay it to the worker.
    ///
    /// The inbound DM was already logged (redacted) by the transport
    /// adapter; it is not logged again here.
    pub async fn handle_otp_input(&self, user_npub: &str, code: &str) -> anyhow::Result<()> {
        let _guard = self.locks.lock(user_npub).await;
        let Some(session) = self.db.get_session(user_npub).await? else {
            tracing::warn!(user = %short(user_npub), "otp_input without session");
            return Ok(());
        };
        if session.state != SessionState::AwaitingOtp {
            tracing::warn!(user = %short(user_npub), state = %session.state, "otp_input in wrong state");
            return Ok(());
        }
        let Some(job_id) = session.job_id else {
            return Ok(());
        };

        self.worker.relay_otp(&job_id, code).await?;

        self.db
            .upsert_session(
                user_npub,
                SessionState::Executing,
                Some(job_id.as_str()),
                session.otp_attempts + 1,
            )
            .await?;
        self.timers.cancel(TimerType::OtpTimeout, &job_id).await?;
        self.outbox.send_dm(user_npub, &messages::otp_received()).await;
        Ok(())
    }

    /// Worker callback: the automation needs a credential that was not in
    /// the dispatched map.
    pub async fn handle_credential_needed(
        &self,
        job_id: &str,
        service: &str,
        credential_name: &str,
    ) -> anyhow::Result<()> {
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "credential_needed: no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;
        let Some(session) = self.reload(&user_npub, job_id).await? else {
            return Ok(());
        };

        self.pending_credentials
            .lock()
            .await
            .insert(user_npub.clone(), credential_name.to_string());

        self.db
            .upsert_session(
                &user_npub,
                SessionState::AwaitingCredential,
                Some(job_id),
                session.otp_attempts,
            )
            .await?;
        self.outbox
            .send_dm(&user_npub, &messages::credential_needed(service, credential_name))
            .await;

        self.timers.cancel(TimerType::OtpTimeout, job_id).await?;
        self.timers
            .schedule_delay(TimerType::OtpTimeout, job_id, self.cfg.otp_timeout)
            .await?;
        Ok(())
    }

    /// User supplied the requested credential. Relay under the remembered
    /// name.
    pub async fn handle_credential_input(
        &self,
        user_npub: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let _guard = self.locks.lock(user_npub).await;
        let Some(session) = self.db.get_session(user_npub).await? else {
            tracing::warn!(user = %short(user_npub), "credential_input without session");
            return Ok(());
        };
        if session.state != SessionState::AwaitingCredential {
            tracing::warn!(user = %short(user_npub), state = %session.state, "credential_input in wrong state");
            return Ok(());
        }
        let Some(job_id) = session.job_id else {
            return Ok(());
        };

        let credential_name = self
            .pending_credentials
            .lock()
            .await
            .remove(user_npub)
            .unwrap_or_else(|| "unknown".to_string());

        self.worker
            .relay_credential(&job_id, &credential_name, value)
            .await?;

        self.db
            .upsert_session(
                user_npub,
                SessionState::Executing,
                Some(job_id.as_str()),
                session.otp_attempts,
            )
            .await?;
        self.timers.cancel(TimerType::OtpTimeout, &job_id).await?;
        self.outbox
            .send_dm(user_npub, &messages::credential_received())
            .await;
        Ok(())
    }

    /// Worker callback: the job finished.
    pub async fn handle_result(&self, result: &JobResult) -> anyhow::Result<()> {
        let job_id = result.job_id.as_str();
        tracing::info!(
            job = %short(job_id),
            success = result.success,
            duration = result.duration_seconds,
            "handle_result"
        );
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "result for job with no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;

        self.timers.cancel(TimerType::OtpTimeout, job_id).await?;
        self.pending_credentials.lock().await.remove(&user_npub);

        let Some(job) = self.db.get_job(job_id).await? else {
            tracing::error!(job = %short(job_id), "result for unknown job");
            self.db.delete_session(&user_npub).await?;
            return Ok(());
        };

        if result.success {
            let success_dm = match job.action {
                Action::Cancel => messages::action_success_cancel(
                    &job.service_id,
                    result.access_end_date.as_deref(),
                ),
                Action::Resume => messages::action_success_resume(&job.service_id),
            };
            self.outbox.send_dm(&user_npub, &success_dm).await;

            if job.is_cli() {
                self.db.update_job_status(job_id, JobStatus::Completed).await?;
                self.timers.cancel_all(job_id).await?;
                self.db.delete_session(&user_npub).await?;
            } else {
                match self
                    .upstream
                    .create_invoice(
                        job_id,
                        self.cfg.action_price_sats,
                        &user_npub,
                        result.access_end_date.as_deref(),
                    )
                    .await
                {
                    Ok(invoice) => {
                        self.db
                            .set_job_invoice(
                                job_id,
                                &invoice.invoice_id,
                                invoice.amount_sats,
                                result.access_end_date.as_deref(),
                            )
                            .await?;
                        for part in messages::invoice(invoice.amount_sats, &invoice.bolt11) {
                            self.outbox.send_dm(&user_npub, &part).await;
                        }
                        self.db
                            .upsert_session(
                                &user_npub,
                                SessionState::InvoiceSent,
                                Some(job_id),
                                session.otp_attempts,
                            )
                            .await?;
                        self.timers
                            .schedule_delay(
                                TimerType::PaymentExpiry,
                                job_id,
                                self.cfg.payment_expiry,
                            )
                            .await?;
                    }
                    Err(err) => {
                        tracing::error!(job = %short(job_id), "invoice creation failed: {err:#}");
                        self.outbox
                            .send_operator_dm(&messages::operator_job_failed(
                                job_id,
                                &job.service_id,
                                Some(&format!("invoice creation failed: {err}")),
                            ))
                            .await;
                        self.outbox.send_operator_dm(&user_npub).await;
                        self.timers.cancel_all(job_id).await?;
                        self.db.delete_session(&user_npub).await?;
                    }
                }
            }
        } else {
            self.fail_job(
                &user_npub,
                &job,
                result.error.as_deref(),
                result.error_code.as_deref(),
            )
            .await?;
        }

        // Advisory telemetry; never on the user-visible path.
        if !job.is_cli() {
            let upstream = self.upstream.clone();
            let mut payload = serde_json::json!({
                "success": result.success,
                "duration_seconds": result.duration_seconds,
                "error_code": result.error_code,
                "error_message": result.error,
            });
            if let (Some(obj), Some(serde_json::Value::Object(stats))) =
                (payload.as_object_mut(), result.stats.clone())
            {
                obj.extend(stats);
            }
            let job_id = job_id.to_string();
            tokio::spawn(async move {
                if let Err(err) = upstream.write_action_log(&job_id, payload).await {
                    tracing::warn!(job = %short(&job_id), "action log write failed: {err:#}");
                }
            });
        }
        Ok(())
    }

    /// Upstream push: the invoice was paid.
    pub async fn handle_payment_received(
        &self,
        job_id: &str,
        amount_sats: u64,
    ) -> anyhow::Result<()> {
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "payment_received: no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;

        self.timers.cancel_all(job_id).await?;
        self.db
            .update_job_status(job_id, JobStatus::CompletedPaid)
            .await?;
        self.outbox
            .send_dm(&user_npub, &messages::payment_received(amount_sats))
            .await;
        self.db.delete_session(&user_npub).await?;
        Ok(())
    }

    /// Timer fire or upstream push: the invoice expired unpaid.
    pub async fn handle_payment_expired(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "payment_expired: no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;

        self.timers.cancel_all(job_id).await?;
        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::CompletedReneged)
            .await
        {
            tracing::error!(job = %short(job_id), "upstream reneged update failed: {err:#}");
        }
        self.db
            .update_job_status(job_id, JobStatus::CompletedReneged)
            .await?;

        let service_id = self
            .db
            .get_job(job_id)
            .await?
            .map(|job| job.service_id)
            .unwrap_or_else(|| "unknown".to_string());

        // Fetch the debt total fresh; it just grew by this invoice.
        let debt_sats = match self.upstream.get_user(&user_npub).await {
            Ok(Some(user)) => user.debt_sats,
            Ok(None) => 0,
            Err(err) => {
                tracing::warn!(user = %short(&user_npub), "debt lookup failed: {err:#}");
                0
            }
        };
        self.outbox
            .send_dm(&user_npub, &messages::payment_expired(&service_id, debt_sats))
            .await;
        self.db.delete_session(&user_npub).await?;
        Ok(())
    }

    /// Timer fire: the user never sent the code or credential.
    pub async fn handle_otp_timeout(&self, job_id: &str) -> anyhow::Result<()> {
        let Some(session) = self.db.get_session_by_job(job_id).await? else {
            tracing::warn!(job = %short(job_id), "otp_timeout: no session");
            return Ok(());
        };
        let user_npub = session.user_npub;
        let _guard = self.locks.lock(&user_npub).await;
        let Some(session) = self.reload(&user_npub, job_id).await? else {
            return Ok(());
        };
        if !matches!(
            session.state,
            SessionState::AwaitingOtp | SessionState::AwaitingCredential
        ) {
            tracing::warn!(
                user = %short(&user_npub),
                state = %session.state,
                "otp_timeout fired outside a waiting state"
            );
            return Ok(());
        }

        if let Err(err) = self.worker.abort(job_id).await {
            tracing::warn!(job = %short(job_id), "abort on otp timeout failed: {err:#}");
        }
        if let Err(err) = self
            .upstream
            .update_job_status(job_id, JobStatus::UserAbandon)
            .await
        {
            tracing::error!(job = %short(job_id), "upstream abandon update failed: {err:#}");
        }
        self.db.update_job_status(job_id, JobStatus::UserAbandon).await?;
        self.timers.cancel_all(job_id).await?;

        let minutes = (self.cfg.otp_timeout.as_secs() / 60).max(1);
        self.outbox
            .send_dm(&user_npub, &messages::otp_timeout(minutes))
            .await;
        self.pending_credentials.lock().await.remove(&user_npub);
        self.db.delete_session(&user_npub).await?;
        Ok(())
    }

    /// Force-close a session (user sent 'cancel', or reconciliation).
    /// Aborts the worker if a job is running and clears every timer keyed
    /// to the job. Idempotent.
    pub async fn cancel_session(&self, user_npub: &str) -> anyhow::Result<()> {
        let _guard = self.locks.lock(user_npub).await;
        let Some(session) = self.db.get_session(user_npub).await? else {
            return Ok(());
        };

        if let Some(job_id) = &session.job_id {
            if session.state.has_running_job() {
                if let Err(err) = self.worker.abort(job_id).await {
                    tracing::warn!(job = %short(job_id), "abort on cancel failed: {err:#}");
                }
            }
            self.timers.cancel_all(job_id).await?;
        }
        self.pending_credentials.lock().await.remove(user_npub);
        self.db.delete_session(user_npub).await?;
        Ok(())
    }

    // Re-read the session under the user lock; the first (unlocked) lookup
    // only identified the user.
    async fn reload(&self, user_npub: &str, job_id: &str) -> anyhow::Result<Option<SessionRow>> {
        let session = self.db.get_session(user_npub).await?;
        Ok(session.filter(|row| row.job_id.as_deref() == Some(job_id)))
    }

    async fn dispatch_to_worker(
        &self,
        job: &Job,
        credentials: &mut HashMap<String, String>,
        user_npub: &str,
    ) -> bool {
        // The worker only ever sees the bounded subset it needs, under its
        // own key names.
        let mut agent_creds = HashMap::new();
        for (from, to) in [("email", "email"), ("password", "pass"), ("pass", "pass")] {
            if let Some(value) = credentials.get(from) {
                agent_creds.entry(to.to_string()).or_insert_with(|| value.clone());
            }
        }

        let req = ExecuteRequest {
            job_id: job.id.clone(),
            service: job.service_id.clone(),
            action: job.action.as_str().to_string(),
            credentials: agent_creds,
            plan_id: job.plan_id.clone(),
            plan_display_name: job.plan_display_name.clone(),
            user_npub: Some(user_npub.to_string()),
        };
        let accepted = match self.worker.execute(&req).await {
            Ok(accepted) => accepted,
            Err(err) => {
                tracing::error!(job = %short(&job.id), "agent dispatch failed: {err:#}");
                false
            }
        };
        scrub_credentials(credentials);
        accepted
    }

    async fn fail_job(
        &self,
        user_npub: &str,
        job: &Job,
        error: Option<&str>,
        error_code: Option<&str>,
    ) -> anyhow::Result<()> {
        if let Some(error) = error {
            tracing::error!(
                job = %short(&job.id),
                service = %job.service_id,
                action = %job.action,
                "job failed: {error}"
            );
        }

        if !job.is_cli() {
            if let Err(err) = self
                .upstream
                .update_job_status(&job.id, JobStatus::Failed)
                .await
            {
                tracing::error!(job = %short(&job.id), "upstream failed update failed: {err:#}");
            }
        }
        self.db.update_job_status(&job.id, JobStatus::Failed).await?;
        self.timers.cancel_all(&job.id).await?;

        let dm = if error_code == Some("credential_invalid") {
            messages::action_failed_credentials(&job.service_id, job.action)
        } else {
            messages::action_failed(&job.service_id, job.action)
        };
        self.outbox.send_dm(user_npub, &dm).await;

        if !job.is_cli() {
            self.outbox
                .send_operator_dm(&messages::operator_job_failed(
                    &job.id,
                    &job.service_id,
                    error,
                ))
                .await;
            // Bare npub in its own bubble so the operator can copy it.
            self.outbox.send_operator_dm(user_npub).await;
        }

        self.db.delete_session(user_npub).await?;
        Ok(())
    }
}

/// Overwrite every credential value with zero bytes, then clear the map.
fn scrub_credentials(credentials: &mut HashMap<String, String>) {
    for value in credentials.values_mut() {
        let len = value.len();
        value.clear();
        value.push_str(&"\0".repeat(len));
    }
    credentials.clear();
}

fn short(id: &str) -> &str {
    &id[..id.len().min(12)]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scrub_clears_the_map() {
        let mut creds = HashMap::from([
            ("email".to_string(), "a@b.example".to_string()),
            ("pass".to_string(), "hunter2".to_string()),
        ]);
        scrub_credentials(&mut creds);
        assert!(creds.is_empty());
    }

    #[test]
    fn short_ids_do_not_panic() {
        assert_eq!(short("ab"), "ab");
        assert_eq!(short("0123456789abcdef"), "0123456789ab");
    }
}
