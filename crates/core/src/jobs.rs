//! Core job and session model.
//!
//! A job is the unit of work: one cancel/resume action for one user on one
//! streaming service. The upstream coordinator owns the authoritative job
//! table; orchestrators cache claimed jobs locally and reconcile terminal
//! statuses periodically.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

/// What the automation should do with the subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Action {
    /// Cancel the subscription.
    Cancel,
    /// Resume (reactivate) the subscription.
    Resume,
}

impl Action {
    /// Stable wire/storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Action::Cancel => "cancel",
            Action::Resume => "resume",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "cancel" => Ok(Action::Cancel),
            "resume" => Ok(Action::Resume),
            other => Err(UnknownVariant::new("action", other)),
        }
    }
}

/// How the job entered the system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trigger {
    /// Proactive outreach ahead of a billing date.
    Outreach,
    /// Requested by the user from the web account page.
    UserInitiated,
    /// Dispatched by the operator from the command line.
    Cli,
}

impl Trigger {
    /// Stable wire/storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            Trigger::Outreach => "outreach",
            Trigger::UserInitiated => "user_initiated",
            Trigger::Cli => "cli",
        }
    }
}

impl fmt::Display for Trigger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Trigger {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "outreach" => Ok(Trigger::Outreach),
            "user_initiated" => Ok(Trigger::UserInitiated),
            "cli" => Ok(Trigger::Cli),
            other => Err(UnknownVariant::new("trigger", other)),
        }
    }
}

/// Job lifecycle status.
///
/// Terminal statuses are absorbing: the upstream coordinator rejects any
/// further transition, and local handlers treat a terminal job as a no-op.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    /// Created upstream, not yet claimed by an orchestrator.
    Pending,
    /// Claimed by this orchestrator, outreach not yet sent.
    Dispatched,
    /// Outreach DM sent, waiting for the user.
    OutreachSent,
    /// User asked to be reminded later.
    Snoozed,
    /// Automation is running (or billing is in flight).
    Active,
    /// Finished and paid.
    CompletedPaid,
    /// Finished but the invoice expired unpaid.
    CompletedReneged,
    /// Finished CLI-dispatched job (no upstream row, never billed).
    Completed,
    /// User declined this cycle.
    UserSkip,
    /// Billing date passed without user engagement.
    ImpliedSkip,
    /// User stopped responding mid-flow (OTP/credential timeout).
    UserAbandon,
    /// Automation failed.
    Failed,
}

impl JobStatus {
    /// Stable wire/storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Dispatched => "dispatched",
            JobStatus::OutreachSent => "outreach_sent",
            JobStatus::Snoozed => "snoozed",
            JobStatus::Active => "active",
            JobStatus::CompletedPaid => "completed_paid",
            JobStatus::CompletedReneged => "completed_reneged",
            JobStatus::Completed => "completed",
            JobStatus::UserSkip => "user_skip",
            JobStatus::ImpliedSkip => "implied_skip",
            JobStatus::UserAbandon => "user_abandon",
            JobStatus::Failed => "failed",
        }
    }

    /// Whether this status is absorbing (no further transitions accepted).
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            JobStatus::CompletedPaid
                | JobStatus::CompletedReneged
                | JobStatus::Completed
                | JobStatus::UserSkip
                | JobStatus::ImpliedSkip
                | JobStatus::UserAbandon
                | JobStatus::Failed
        )
    }

    /// Whether outreach may still be sent for a job in this status.
    pub fn is_outreach_eligible(self) -> bool {
        matches!(
            self,
            JobStatus::Dispatched | JobStatus::OutreachSent | JobStatus::Snoozed
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "dispatched" => Ok(JobStatus::Dispatched),
            "outreach_sent" => Ok(JobStatus::OutreachSent),
            "snoozed" => Ok(JobStatus::Snoozed),
            "active" => Ok(JobStatus::Active),
            "completed_paid" => Ok(JobStatus::CompletedPaid),
            "completed_reneged" => Ok(JobStatus::CompletedReneged),
            "completed" => Ok(JobStatus::Completed),
            "user_skip" => Ok(JobStatus::UserSkip),
            "implied_skip" => Ok(JobStatus::ImpliedSkip),
            "user_abandon" => Ok(JobStatus::UserAbandon),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownVariant::new("job status", other)),
        }
    }
}

/// Per-user conversation state.
///
/// Absence of a session row means `Idle`. `OtpConfirm` exists in the data
/// model for a pre-dispatch OTP-availability confirmation but the current
/// surface goes straight from consent to `Executing` (the OTP warning lives
/// in the outreach copy instead).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SessionState {
    /// No conversation in progress.
    Idle,
    /// Waiting for the user to confirm OTP availability.
    OtpConfirm,
    /// Automation running on a worker.
    Executing,
    /// Waiting for the user to forward a one-time code.
    AwaitingOtp,
    /// Waiting for the user to supply a named credential.
    AwaitingCredential,
    /// Invoice delivered, waiting for payment.
    InvoiceSent,
}

impl SessionState {
    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            SessionState::Idle => "IDLE",
            SessionState::OtpConfirm => "OTP_CONFIRM",
            SessionState::Executing => "EXECUTING",
            SessionState::AwaitingOtp => "AWAITING_OTP",
            SessionState::AwaitingCredential => "AWAITING_CREDENTIAL",
            SessionState::InvoiceSent => "INVOICE_SENT",
        }
    }

    /// Whether a worker job may be running in this state.
    pub fn has_running_job(self) -> bool {
        matches!(
            self,
            SessionState::Executing
                | SessionState::AwaitingOtp
                | SessionState::AwaitingCredential
        )
    }
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for SessionState {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "IDLE" => Ok(SessionState::Idle),
            "OTP_CONFIRM" => Ok(SessionState::OtpConfirm),
            "EXECUTING" => Ok(SessionState::Executing),
            "AWAITING_OTP" => Ok(SessionState::AwaitingOtp),
            "AWAITING_CREDENTIAL" => Ok(SessionState::AwaitingCredential),
            "INVOICE_SENT" => Ok(SessionState::InvoiceSent),
            other => Err(UnknownVariant::new("session state", other)),
        }
    }
}

/// Persistent timer class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TimerType {
    /// Next outreach (or followup) for a claimed job.
    Outreach,
    /// Reminder shortly before the billing date.
    LastChance,
    /// Billing date passed with no engagement.
    ImpliedSkip,
    /// User went quiet while the automation waits for input.
    OtpTimeout,
    /// Invoice expired unpaid.
    PaymentExpiry,
}

impl TimerType {
    /// Stable storage name.
    pub fn as_str(self) -> &'static str {
        match self {
            TimerType::Outreach => "OUTREACH",
            TimerType::LastChance => "LAST_CHANCE",
            TimerType::ImpliedSkip => "IMPLIED_SKIP",
            TimerType::OtpTimeout => "OTP_TIMEOUT",
            TimerType::PaymentExpiry => "PAYMENT_EXPIRY",
        }
    }
}

impl fmt::Display for TimerType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TimerType {
    type Err = UnknownVariant;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "OUTREACH" => Ok(TimerType::Outreach),
            "LAST_CHANCE" => Ok(TimerType::LastChance),
            "IMPLIED_SKIP" => Ok(TimerType::ImpliedSkip),
            "OTP_TIMEOUT" => Ok(TimerType::OtpTimeout),
            "PAYMENT_EXPIRY" => Ok(TimerType::PaymentExpiry),
            other => Err(UnknownVariant::new("timer type", other)),
        }
    }
}

/// A job record as cached locally and exchanged with the upstream
/// coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Job {
    /// Globally unique id (uuid-v4, or `cli-<epoch>` for operator jobs).
    pub id: String,
    /// Target user (64-hex public key).
    pub user_npub: String,
    /// Streaming service identifier (e.g. `netflix`).
    pub service_id: String,
    /// Cancel or resume.
    pub action: Action,
    /// How the job entered the system.
    pub trigger: Trigger,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Expected next charge date (ISO-8601), when known.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub billing_date: Option<String>,
    /// Actual end of access after a successful cancel.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub access_end_date: Option<String>,
    /// Number of outreach DMs sent so far.
    #[serde(default)]
    pub outreach_count: u32,
    /// When the next outreach is due (ISO-8601), if scheduled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_outreach_at: Option<String>,
    /// Invoice amount, once billed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub amount_sats: Option<u64>,
    /// Upstream invoice id, once billed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    /// Plan to restore on resume (e.g. `netflix_premium`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    /// Human-readable plan name for resume DMs.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub plan_display_name: Option<String>,
    /// Creation timestamp (ISO-8601).
    pub created_at: String,
    /// Last update timestamp (ISO-8601).
    pub updated_at: String,
}

impl Job {
    /// Whether this is an operator-dispatched job with no upstream row.
    pub fn is_cli(&self) -> bool {
        self.id.starts_with("cli-")
    }
}

/// Error for parsing a closed-set string field.
#[derive(Debug, Clone, thiserror::Error)]
#[error("unknown {kind}: {value:?}")]
pub struct UnknownVariant {
    kind: &'static str,
    value: String,
}

impl UnknownVariant {
    fn new(kind: &'static str, value: &str) -> Self {
        Self {
            kind,
            value: value.to_string(),
        }
    }
}
