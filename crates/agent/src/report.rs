//! Orchestrator callbacks and the ask-and-wait challenge bridge.
//!
//! The browser driver is synchronous and lives on a blocking thread, but
//! OTP and credential waits are asynchronous and can take minutes. The
//! bridge arms a one-shot slot on the active job, posts the challenge
//! callback to the orchestrator from the runtime, and blocks the driver
//! thread on the slot with a deadline. The agent's own HTTP handlers
//! fulfil the slot when the orchestrator relays the user's reply.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use subpilot_core::signing::{Signer, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use crate::registry::JobRegistry;

/// Result payload for `POST /callback/result`.
#[derive(Debug, Clone, Serialize)]
pub struct ResultReport {
    pub job_id: String,
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub access_end_date: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_code: Option<String>,
    pub duration_seconds: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<serde_json::Value>,
}

/// Signed HTTP client for the orchestrator's callback endpoints.
pub struct Callbacks {
    http: reqwest::Client,
    base: String,
    signer: Signer,
}

impl Callbacks {
    pub fn new(http: reqwest::Client, orchestrator_url: &str, signer: Signer) -> Self {
        Self {
            http,
            base: orchestrator_url.trim_end_matches('/').to_string(),
            signer,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> anyhow::Result<()> {
        let body_bytes = serde_json::to_vec(body)?;
        let headers = self.signer.headers("POST", path, &body_bytes);
        let res = self
            .http
            .post(format!("{}{}", self.base, path))
            .header(TIMESTAMP_HEADER, headers.timestamp)
            .header(NONCE_HEADER, headers.nonce)
            .header(SIGNATURE_HEADER, headers.signature)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .body(body_bytes)
            .send()
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("orchestrator {path} rejected: http {status}: {body}");
        }
        Ok(())
    }

    pub async fn otp_needed(
        &self,
        job_id: &str,
        service: &str,
        prompt: Option<&str>,
    ) -> anyhow::Result<()> {
        self.post(
            "/callback/otp-needed",
            &serde_json::json!({"job_id": job_id, "service": service, "prompt": prompt}),
        )
        .await
    }

    pub async fn credential_needed(
        &self,
        job_id: &str,
        service: &str,
        credential_name: &str,
    ) -> anyhow::Result<()> {
        self.post(
            "/callback/credential-needed",
            &serde_json::json!({
                "job_id": job_id,
                "service": service,
                "credential_name": credential_name,
            }),
        )
        .await
    }

    /// Report a finished job. Errors are logged, never propagated: a
    /// reporting failure must not take down a driver thread.
    pub async fn report_result(&self, report: &ResultReport) {
        match self.post("/callback/result", report).await {
            Ok(()) => {
                tracing::info!(job = %report.job_id, success = report.success, "result reported");
            }
            Err(err) => {
                tracing::error!(job = %report.job_id, "result report failed: {err:#}");
            }
        }
    }
}

/// Blocking source of user-supplied challenge values, called from the
/// driver thread.
pub trait ChallengeSource: Send + Sync {
    /// Ask the user for a one-time code. `None` on timeout or abort.
    fn request_otp(&self, job_id: &str, service: &str) -> Option<String>;

    /// Ask the user for a named credential. `None` on timeout or abort.
    fn request_credential(&self, job_id: &str, service: &str, name: &str) -> Option<String>;
}

/// The production bridge between driver threads and the orchestrator.
pub struct Bridge {
    registry: Arc<JobRegistry>,
    callbacks: Arc<Callbacks>,
    handle: tokio::runtime::Handle,
    wait_timeout: Duration,
}

impl Bridge {
    pub fn new(
        registry: Arc<JobRegistry>,
        callbacks: Arc<Callbacks>,
        handle: tokio::runtime::Handle,
        wait_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            callbacks,
            handle,
            wait_timeout,
        }
    }

    fn wait_for_slot(
        &self,
        what: &str,
        job_id: &str,
        rx: tokio::sync::oneshot::Receiver<String>,
    ) -> Option<String> {
        let timeout = self.wait_timeout;
        let outcome = self
            .handle
            .block_on(async move { tokio::time::timeout(timeout, rx).await });
        match outcome {
            Ok(Ok(value)) => Some(value),
            Ok(Err(_)) => {
                tracing::info!(job = %job_id, "{what} slot dropped (abort or job gone)");
                None
            }
            Err(_) => {
                tracing::warn!(job = %job_id, "{what} wait timed out");
                None
            }
        }
    }
}

impl ChallengeSource for Bridge {
    fn request_otp(&self, job_id: &str, service: &str) -> Option<String> {
        let rx = self.registry.arm_otp_slot(job_id)?;
        if let Err(err) = self
            .handle
            .block_on(self.callbacks.otp_needed(job_id, service, None))
        {
            tracing::error!(job = %job_id, "otp callback failed: {err:#}");
            return None;
        }
        self.wait_for_slot("otp", job_id, rx)
    }

    fn request_credential(&self, job_id: &str, service: &str, name: &str) -> Option<String> {
        let rx = self.registry.arm_credential_slot(job_id)?;
        if let Err(err) = self
            .handle
            .block_on(self.callbacks.credential_needed(job_id, service, name))
        {
            tracing::error!(job = %job_id, "credential callback failed: {err:#}");
            return None;
        }
        self.wait_for_slot("credential", job_id, rx)
    }
}
