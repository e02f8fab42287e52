//! RPC client for the automation agent.
//!
//! Same signing scheme as the upstream client. `/execute` is the only call
//! with interesting failure modes: a 409 means the worker is at capacity or
//! already runs this job, and the dispatch simply did not start.

use std::collections::HashMap;

use async_trait::async_trait;
use serde::Serialize;

use subpilot_core::signing::{Signer, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// A dispatch request for one job.
#[derive(Debug, Clone, Serialize)]
pub struct ExecuteRequest {
    pub job_id: String,
    pub service: String,
    pub action: String,
    pub credentials: HashMap<String, String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub plan_display_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_npub: Option<String>,
}

/// The worker operations the orchestrator consumes.
#[async_trait]
pub trait WorkerApi: Send + Sync {
    /// Dispatch a job. `Ok(false)` means the worker refused (capacity or
    /// duplicate); `Err` is a transport fault.
    async fn execute(&self, req: &ExecuteRequest) -> anyhow::Result<bool>;

    /// Relay a user-supplied one-time code to a running job.
    async fn relay_otp(&self, job_id: &str, code: &str) -> anyhow::Result<()>;

    /// Relay a user-supplied named credential to a running job.
    async fn relay_credential(
        &self,
        job_id: &str,
        credential_name: &str,
        value: &str,
    ) -> anyhow::Result<()>;

    /// Cancel a running job. Does not wait for the driver to unwind.
    async fn abort(&self, job_id: &str) -> anyhow::Result<()>;
}

/// HTTP implementation with request signing.
pub struct HttpWorker {
    http: reqwest::Client,
    base: String,
    signer: Signer,
}

impl HttpWorker {
    pub fn new(http: reqwest::Client, base_url: &str, signer: Signer) -> Self {
        Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            signer,
        }
    }

    async fn post(&self, path: &str, body: &impl Serialize) -> anyhow::Result<reqwest::Response> {
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
        Ok(res)
    }
}

#[derive(Debug, Serialize)]
struct JobRef<'a> {
    job_id: &'a str,
}

#[derive(Debug, Serialize)]
struct OtpRelay<'a> {
    job_id: &'a str,
    code: &'a str,
}

#[derive(Debug, Serialize)]
struct CredentialRelay<'a> {
    job_id: &'a str,
    credential_name: &'a str,
    value: &'a str,
}

#[async_trait]
impl WorkerApi for HttpWorker {
    async fn execute(&self, req: &ExecuteRequest) -> anyhow::Result<bool> {
        let res = self.post("/execute", req).await?;
        match res.status() {
            s if s.is_success() => Ok(true),
            reqwest::StatusCode::CONFLICT => Ok(false),
            s => {
                let body = res.text().await.unwrap_or_default();
                anyhow::bail!("agent /execute failed: http {s}: {body}")
            }
        }
    }

    async fn relay_otp(&self, job_id: &str, code: &str) -> anyhow::Result<()> {
        let res = self.post("/otp", &OtpRelay { job_id, code }).await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("agent /otp failed: http {status}: {body}");
        }
        Ok(())
    }

    async fn relay_credential(
        &self,
        job_id: &str,
        credential_name: &str,
        value: &str,
    ) -> anyhow::Result<()> {
        let res = self
            .post(
                "/credential",
                &CredentialRelay {
                    job_id,
                    credential_name,
                    value,
                },
            )
            .await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("agent /credential failed: http {status}: {body}");
        }
        Ok(())
    }

    async fn abort(&self, job_id: &str) -> anyhow::Result<()> {
        let res = self.post("/abort", &JobRef { job_id }).await?;
        if !res.status().is_success() {
            let status = res.status();
            let body = res.text().await.unwrap_or_default();
            anyhow::bail!("agent /abort failed: http {status}: {body}");
        }
        Ok(())
    }
}
