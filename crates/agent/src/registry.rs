//! Active-job registry.
//!
//! Tracks the jobs currently running on this agent, the one-shot slots
//! their drivers block on while waiting for a user-supplied code or
//! credential, and the cooperative abort flag each driver polls. The pool
//! bound and the duplicate check live here, under one mutex.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde::Serialize;
use tokio::sync::oneshot;

/// Why `/execute` refused a job.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum AdmitError {
    #[error("job {0} already running")]
    Duplicate(String),
    #[error("at capacity ({active}/{max})")]
    AtCapacity { active: usize, max: usize },
    #[error("shutting down")]
    Draining,
}

struct ActiveJob {
    service: String,
    action: String,
    started_at: Instant,
    abort: Arc<AtomicBool>,
    otp_slot: Option<oneshot::Sender<String>>,
    credential_slot: Option<oneshot::Sender<String>>,
}

/// Health-endpoint view of one running job.
#[derive(Debug, Clone, Serialize)]
pub struct JobInfo {
    pub job_id: String,
    pub service: String,
    pub action: String,
    pub elapsed_seconds: u64,
}

/// The process-wide registry of running jobs.
pub struct JobRegistry {
    max_jobs: usize,
    draining: AtomicBool,
    jobs: Mutex<HashMap<String, ActiveJob>>,
}

impl JobRegistry {
    pub fn new(max_jobs: usize) -> Self {
        Self {
            max_jobs,
            draining: AtomicBool::new(false),
            jobs: Mutex::new(HashMap::new()),
        }
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }

    /// Stop admitting new jobs (graceful shutdown).
    pub fn start_draining(&self) {
        self.draining.store(true, Ordering::SeqCst);
    }

    /// Admit a job if there is a free slot. Returns its abort flag.
    pub fn admit(
        &self,
        job_id: &str,
        service: &str,
        action: &str,
    ) -> Result<Arc<AtomicBool>, AdmitError> {
        if self.draining.load(Ordering::SeqCst) {
            return Err(AdmitError::Draining);
        }
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        if jobs.contains_key(job_id) {
            return Err(AdmitError::Duplicate(job_id.to_string()));
        }
        if jobs.len() >= self.max_jobs {
            return Err(AdmitError::AtCapacity {
                active: jobs.len(),
                max: self.max_jobs,
            });
        }
        let abort = Arc::new(AtomicBool::new(false));
        jobs.insert(
            job_id.to_string(),
            ActiveJob {
                service: service.to_string(),
                action: action.to_string(),
                started_at: Instant::now(),
                abort: abort.clone(),
                otp_slot: None,
                credential_slot: None,
            },
        );
        Ok(abort)
    }

    /// Drop a finished job. Any armed slot is dropped with it, waking the
    /// driver with "no value".
    pub fn remove(&self, job_id: &str) {
        self.jobs.lock().expect("registry poisoned").remove(job_id);
    }

    pub fn active_count(&self) -> usize {
        self.jobs.lock().expect("registry poisoned").len()
    }

    pub fn snapshot(&self) -> Vec<JobInfo> {
        let jobs = self.jobs.lock().expect("registry poisoned");
        jobs.iter()
            .map(|(job_id, job)| JobInfo {
                job_id: job_id.clone(),
                service: job.service.clone(),
                action: job.action.clone(),
                elapsed_seconds: job.started_at.elapsed().as_secs(),
            })
            .collect()
    }

    /// Arm the OTP slot for a job and hand back the receiving end the
    /// driver blocks on. `None` when the job is gone.
    pub fn arm_otp_slot(&self, job_id: &str) -> Option<oneshot::Receiver<String>> {
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        let job = jobs.get_mut(job_id)?;
        let (tx, rx) = oneshot::channel();
        job.otp_slot = Some(tx);
        Some(rx)
    }

    /// Arm the credential slot for a job.
    pub fn arm_credential_slot(&self, job_id: &str) -> Option<oneshot::Receiver<String>> {
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        let job = jobs.get_mut(job_id)?;
        let (tx, rx) = oneshot::channel();
        job.credential_slot = Some(tx);
        Some(rx)
    }

    /// Deliver a code to a waiting driver. The code is never stored.
    /// `None` when the job is unknown, `Some(false)` when nothing waits.
    pub fn fulfil_otp(&self, job_id: &str, code: String) -> Option<bool> {
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        let job = jobs.get_mut(job_id)?;
        match job.otp_slot.take() {
            Some(slot) => Some(slot.send(code).is_ok()),
            None => Some(false),
        }
    }

    /// Deliver a credential value to a waiting driver.
    pub fn fulfil_credential(&self, job_id: &str, value: String) -> Option<bool> {
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        let job = jobs.get_mut(job_id)?;
        match job.credential_slot.take() {
            Some(slot) => Some(slot.send(value).is_ok()),
            None => Some(false),
        }
    }

    /// Request cancellation: flip the abort flag and drop any armed slots
    /// so a blocked driver wakes immediately. `false` when unknown.
    pub fn abort(&self, job_id: &str) -> bool {
        let mut jobs = self.jobs.lock().expect("registry poisoned");
        let Some(job) = jobs.get_mut(job_id) else {
            return false;
        };
        job.abort.store(true, Ordering::SeqCst);
        job.otp_slot = None;
        job.credential_slot = None;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn admits_up_to_capacity() {
        let reg = JobRegistry::new(2);
        reg.admit("a", "netflix", "cancel").unwrap();
        reg.admit("b", "hulu", "cancel").unwrap();
        assert_eq!(
            reg.admit("c", "max", "cancel").unwrap_err(),
            AdmitError::AtCapacity { active: 2, max: 2 }
        );
        reg.remove("a");
        reg.admit("c", "max", "cancel").unwrap();
    }

    #[test]
    fn rejects_duplicates() {
        let reg = JobRegistry::new(2);
        reg.admit("a", "netflix", "cancel").unwrap();
        assert_eq!(
            reg.admit("a", "netflix", "cancel").unwrap_err(),
            AdmitError::Duplicate("a".to_string())
        );
    }

    #[test]
    fn draining_rejects_everything() {
        let reg = JobRegistry::new(2);
        reg.start_draining();
        assert_eq!(
            reg.admit("a", "netflix", "cancel").unwrap_err(),
            AdmitError::Draining
        );
    }

    #[tokio::test]
    async fn otp_slot_round_trip() {
        let reg = JobRegistry::new(1);
        reg.admit("a", "netflix", "cancel").unwrap();

        // Nothing waiting yet.
        assert_eq!(reg.fulfil_otp("a", "123456".to_string()), Some(false));
        assert_eq!(reg.fulfil_otp("nope", "123456".to_string()), None);

        let rx = reg.arm_otp_slot("a").unwrap();
        assert_eq!(reg.fulfil_otp("a", "123456".to_string()), Some(true));
        assert_eq!(rx.await.unwrap(), "123456");

        // The slot is one-shot.
        assert_eq!(reg.fulfil_otp("a", "654321".to_string()), Some(false));
    }

    #[tokio::test]
    async fn abort_wakes_a_blocked_slot() {
        let reg = JobRegistry::new(1);
        let flag = reg.admit("a", "netflix", "cancel").unwrap();
        let rx = reg.arm_otp_slot("a").unwrap();

        assert!(reg.abort("a"));
        assert!(flag.load(Ordering::SeqCst));
        assert!(rx.await.is_err());
    }

    #[test]
    fn snapshot_lists_running_jobs() {
        let reg = JobRegistry::new(2);
        reg.admit("a", "netflix", "cancel").unwrap();
        let snap = reg.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].job_id, "a");
        assert_eq!(snap[0].service, "netflix");
    }
}
