//! Shared test harness: in-memory store plus fakes for the upstream
//! coordinator, the agent worker, and the messaging transport.
#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use subpilot_core::jobs::{Action, Job, JobStatus, Trigger};
use subpilot_orchestrator::agent_client::{ExecuteRequest, WorkerApi};
use subpilot_orchestrator::db::Db;
use subpilot_orchestrator::inbound::InboundRouter;
use subpilot_orchestrator::job_manager::{JobManager, JobManagerConfig};
use subpilot_orchestrator::session::{SessionConfig, SessionEngine};
use subpilot_orchestrator::timers::Timers;
use subpilot_orchestrator::transport::{Messenger, Outbox};
use subpilot_orchestrator::upstream::{
    ClaimOutcome, CredentialOpener, InvoiceData, SealedCredentials, TerminalStatus, UpstreamApi,
    UpstreamError, UserRecord,
};

pub const ALICE: &str = "npub1alice";
pub const BOB: &str = "npub1bob";
pub const OPERATOR: &str = "npub1operator";

// --- fakes ---

#[derive(Default)]
pub struct FakeUpstream {
    pub pending: Mutex<Vec<Job>>,
    pub claim: Mutex<Option<ClaimOutcome>>,
    pub users: Mutex<HashMap<String, UserRecord>>,
    pub credentials: Mutex<HashMap<(String, String), SealedCredentials>>,
    pub reject_status_for: Mutex<HashSet<String>>,
    pub status_updates: Mutex<Vec<(String, JobStatus)>>,
    pub invoices: Mutex<Vec<(String, u64)>>,
    pub action_logs: Mutex<Vec<(String, serde_json::Value)>>,
    pub terminal: Mutex<Vec<TerminalStatus>>,
}

impl FakeUpstream {
    pub fn add_credentials(&self, npub: &str, service: &str, email: &str, password: &str) {
        let mut sealed = SealedCredentials::new();
        sealed.insert("email".to_string(), email.to_string());
        sealed.insert("password".to_string(), password.to_string());
        self.credentials
            .lock()
            .unwrap()
            .insert((npub.to_string(), service.to_string()), sealed);
    }

    pub fn set_debt(&self, npub: &str, debt_sats: u64) {
        self.users
            .lock()
            .unwrap()
            .insert(npub.to_string(), UserRecord { debt_sats });
    }

    pub fn recorded_status(&self, job_id: &str) -> Vec<JobStatus> {
        self.status_updates
            .lock()
            .unwrap()
            .iter()
            .filter(|(id, _)| id == job_id)
            .map(|(_, status)| *status)
            .collect()
    }
}

#[async_trait]
impl UpstreamApi for FakeUpstream {
    async fn pending_jobs(&self) -> Result<Vec<Job>, UpstreamError> {
        Ok(self.pending.lock().unwrap().clone())
    }

    async fn claim_jobs(&self, job_ids: &[String]) -> Result<ClaimOutcome, UpstreamError> {
        if let Some(outcome) = self.claim.lock().unwrap().clone() {
            return Ok(outcome);
        }
        Ok(ClaimOutcome {
            claimed: job_ids.to_vec(),
            blocked: Vec::new(),
        })
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), UpstreamError> {
        if self.reject_status_for.lock().unwrap().contains(job_id) {
            return Err(UpstreamError::Rejected {
                status: 409,
                body: "terminal".to_string(),
            });
        }
        self.status_updates
            .lock()
            .unwrap()
            .push((job_id.to_string(), status));
        Ok(())
    }

    async fn get_user(&self, npub: &str) -> Result<Option<UserRecord>, UpstreamError> {
        Ok(Some(
            self.users.lock().unwrap().get(npub).cloned().unwrap_or_default(),
        ))
    }

    async fn get_credentials(
        &self,
        npub: &str,
        service: &str,
    ) -> Result<Option<SealedCredentials>, UpstreamError> {
        Ok(self
            .credentials
            .lock()
            .unwrap()
            .get(&(npub.to_string(), service.to_string()))
            .cloned())
    }

    async fn create_invoice(
        &self,
        job_id: &str,
        amount_sats: u64,
        _user_npub: &str,
        _access_end_date: Option<&str>,
    ) -> Result<InvoiceData, UpstreamError> {
        self.invoices
            .lock()
            .unwrap()
            .push((job_id.to_string(), amount_sats));
        Ok(InvoiceData {
            invoice_id: format!("inv-{job_id}"),
            amount_sats,
            bolt11: "lnbc30u1fakeinvoice".to_string(),
        })
    }

    async fn write_action_log(
        &self,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), UpstreamError> {
        self.action_logs
            .lock()
            .unwrap()
            .push((job_id.to_string(), payload));
        Ok(())
    }

    async fn terminal_statuses(&self) -> Result<Vec<TerminalStatus>, UpstreamError> {
        Ok(self.terminal.lock().unwrap().clone())
    }
}

pub struct FakeWorker {
    pub accept: AtomicBool,
    pub execute_delay: Mutex<Duration>,
    pub executes: Mutex<Vec<ExecuteRequest>>,
    pub otps: Mutex<Vec<(String, String)>>,
    pub credentials: Mutex<Vec<(String, String, String)>>,
    pub aborts: Mutex<Vec<String>>,
}

impl Default for FakeWorker {
    fn default() -> Self {
        Self {
            accept: AtomicBool::new(true),
            execute_delay: Mutex::new(Duration::ZERO),
            executes: Mutex::new(Vec::new()),
            otps: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            aborts: Mutex::new(Vec::new()),
        }
    }
}

impl FakeWorker {
    pub fn executed_job_ids(&self) -> Vec<String> {
        self.executes
            .lock()
            .unwrap()
            .iter()
            .map(|req| req.job_id.clone())
            .collect()
    }
}

#[async_trait]
impl WorkerApi for FakeWorker {
    async fn execute(&self, req: &ExecuteRequest) -> anyhow::Result<bool> {
        let delay = *self.execute_delay.lock().unwrap();
        if delay > Duration::ZERO {
            tokio::time::sleep(delay).await;
        }
        self.executes.lock().unwrap().push(req.clone());
        Ok(self.accept.load(Ordering::SeqCst))
    }

    async fn relay_otp(&self, job_id: &str, code: &str) -> anyhow::Result<()> {
        self.otps
            .lock()
            .unwrap()
            .push((job_id.to_string(), code.to_string()));
        Ok(())
    }

    async fn relay_credential(
        &self,
        job_id: &str,
        credential_name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        self.credentials.lock().unwrap().push((
            job_id.to_string(),
            credential_name.to_string(),
            value.to_string(),
        ));
        Ok(())
    }

    async fn abort(&self, job_id: &str) -> anyhow::Result<()> {
        self.aborts.lock().unwrap().push(job_id.to_string());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingMessenger {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl RecordingMessenger {
    pub fn to(&self, npub: &str) -> Vec<String> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|(to, _)| to == npub)
            .map(|(_, text)| text.clone())
            .collect()
    }

    pub fn last_to(&self, npub: &str) -> String {
        self.to(npub).last().cloned().unwrap_or_default()
    }
}

#[async_trait]
impl Messenger for RecordingMessenger {
    async fn send_dm(&self, npub: &str, text: &str) -> anyhow::Result<()> {
        self.sent
            .lock()
            .unwrap()
            .push((npub.to_string(), text.to_string()));
        Ok(())
    }
}

// Test credentials are stored unsealed.
struct PassthroughOpener;

impl CredentialOpener for PassthroughOpener {
    fn open(&self, sealed: &SealedCredentials) -> anyhow::Result<HashMap<String, String>> {
        Ok(sealed.clone())
    }
}

// --- harness ---

pub struct Harness {
    pub db: Db,
    pub timers: Timers,
    pub upstream: Arc<FakeUpstream>,
    pub worker: Arc<FakeWorker>,
    pub messenger: Arc<RecordingMessenger>,
    pub session: Arc<SessionEngine>,
    pub manager: Arc<JobManager>,
    pub inbound: InboundRouter,
}

pub fn harness() -> Harness {
    harness_with_slots(2)
}

pub fn harness_with_slots(max_concurrent_agent_jobs: usize) -> Harness {
    let db = Db::open_in_memory().unwrap();
    let timers = Timers::new(db.clone());
    let upstream = Arc::new(FakeUpstream::default());
    let worker = Arc::new(FakeWorker::default());
    let messenger = Arc::new(RecordingMessenger::default());
    let outbox = Outbox::new(
        db.clone(),
        messenger.clone(),
        Some(OPERATOR.to_string()),
    );

    let session = Arc::new(SessionEngine::new(
        db.clone(),
        timers.clone(),
        upstream.clone(),
        worker.clone(),
        Arc::new(PassthroughOpener),
        outbox.clone(),
        SessionConfig {
            otp_timeout: Duration::from_secs(900),
            payment_expiry: Duration::from_secs(86_400),
            action_price_sats: 3000,
            base_url: "https://subpilot.example".to_string(),
        },
    ));
    let manager = Arc::new(JobManager::new(
        db.clone(),
        timers.clone(),
        upstream.clone(),
        session.clone(),
        outbox.clone(),
        JobManagerConfig {
            max_concurrent_agent_jobs,
            outreach_interval: Duration::from_secs(172_800),
            last_chance_lead: Duration::from_secs(3 * 86_400),
            terminal_retention: Duration::ZERO,
        },
    ));
    let inbound = InboundRouter::new(session.clone(), manager.clone(), outbox, None);

    Harness {
        db,
        timers,
        upstream,
        worker,
        messenger,
        session,
        manager,
        inbound,
    }
}

pub fn make_job(job_id: &str, user_npub: &str) -> Job {
    Job {
        id: job_id.to_string(),
        user_npub: user_npub.to_string(),
        service_id: "netflix".to_string(),
        action: Action::Cancel,
        trigger: Trigger::Outreach,
        status: JobStatus::Dispatched,
        billing_date: None,
        access_end_date: None,
        outreach_count: 0,
        next_outreach_at: None,
        amount_sats: None,
        invoice_id: None,
        plan_id: None,
        plan_display_name: None,
        created_at: "2026-02-18T10:00:00Z".to_string(),
        updated_at: "2026-02-18T10:00:00Z".to_string(),
    }
}
