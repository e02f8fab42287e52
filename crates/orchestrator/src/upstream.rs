//! Upstream coordinator RPC.
//!
//! JSON over HTTPS with signed requests. The coordinator owns the
//! authoritative job table; a 4xx from it is authoritative and the local
//! action aborts, anything else is a transport fault to be retried by the
//! caller's cadence.

use std::collections::HashMap;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as B64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use subpilot_core::jobs::{Job, JobStatus};
use subpilot_core::signing::{Signer, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

/// Why an upstream call failed.
#[derive(Debug, thiserror::Error)]
pub enum UpstreamError {
    /// 4xx from the coordinator. Authoritative; the local action aborts.
    #[error("upstream rejected ({status}): {body}")]
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Response body, for the operator log.
        body: String,
    },
    /// Anything else (connect failure, 5xx, bad payload).
    #[error("upstream transport error: {0:#}")]
    Transport(anyhow::Error),
}

impl UpstreamError {
    fn from_reqwest(err: reqwest::Error) -> Self {
        UpstreamError::Transport(err.into())
    }
}

/// Outcome of a claim RPC.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimOutcome {
    /// Jobs now owned by this orchestrator.
    pub claimed: Vec<String>,
    /// Jobs the coordinator refused (already claimed, on hold).
    pub blocked: Vec<String>,
}

/// Upstream view of a user.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct UserRecord {
    /// Outstanding unpaid balance.
    #[serde(default)]
    pub debt_sats: u64,
}

/// An invoice created by the coordinator.
#[derive(Debug, Clone, Deserialize)]
pub struct InvoiceData {
    pub invoice_id: String,
    pub amount_sats: u64,
    pub bolt11: String,
}

/// A terminal status reported by the coordinator for reconciliation.
#[derive(Debug, Clone, Deserialize)]
pub struct TerminalStatus {
    pub id: String,
    pub status: JobStatus,
}

/// Credentials as they arrive from the coordinator: sealed blobs keyed by
/// credential name.
pub type SealedCredentials = HashMap<String, String>;

/// Unseals credential blobs into usable values.
///
/// The sealing cryptography itself lives outside this repository; this seam
/// lets deployments plug their unsealing in while tests use plain values.
pub trait CredentialOpener: Send + Sync {
    /// Unseal every blob in the map.
    fn open(&self, sealed: &SealedCredentials) -> anyhow::Result<HashMap<String, String>>;
}

/// Opener for blobs that are only transport-encoded (base64), not sealed.
pub struct PlainOpener;

impl CredentialOpener for PlainOpener {
    fn open(&self, sealed: &SealedCredentials) -> anyhow::Result<HashMap<String, String>> {
        let mut out = HashMap::with_capacity(sealed.len());
        for (name, blob) in sealed {
            let bytes = B64.decode(blob.as_bytes())?;
            out.insert(name.clone(), String::from_utf8(bytes)?);
        }
        Ok(out)
    }
}

/// The coordinator operations the orchestrator consumes.
#[async_trait]
pub trait UpstreamApi: Send + Sync {
    /// Pending jobs assigned to this orchestrator.
    async fn pending_jobs(&self) -> Result<Vec<Job>, UpstreamError>;

    /// Claim a batch of pending jobs. Idempotent: already-claimed ids come
    /// back in `blocked`.
    async fn claim_jobs(&self, job_ids: &[String]) -> Result<ClaimOutcome, UpstreamError>;

    /// Apply one status transition to the authoritative row.
    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), UpstreamError>;

    /// Look up a user. `None` when the coordinator does not know them.
    async fn get_user(&self, npub: &str) -> Result<Option<UserRecord>, UpstreamError>;

    /// Fetch sealed credentials for a user/service pair, if stored.
    async fn get_credentials(
        &self,
        npub: &str,
        service: &str,
    ) -> Result<Option<SealedCredentials>, UpstreamError>;

    /// Create an invoice for a finished job.
    async fn create_invoice(
        &self,
        job_id: &str,
        amount_sats: u64,
        user_npub: &str,
        access_end_date: Option<&str>,
    ) -> Result<InvoiceData, UpstreamError>;

    /// Attach an action log to a job. Callers treat this as advisory.
    async fn write_action_log(
        &self,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), UpstreamError>;

    /// Recently terminal jobs, for reconciliation.
    async fn terminal_statuses(&self) -> Result<Vec<TerminalStatus>, UpstreamError>;
}

/// HTTPS implementation with request signing.
pub struct HttpUpstream {
    http: reqwest::Client,
    base: String,
    signer: Signer,
}

impl HttpUpstream {
    pub fn new(http: reqwest::Client, base_url: &str, signer: Signer) -> Self {
        Self {
            http,
            base: base_url.trim_end_matches('/').to_string(),
            signer,
        }
    }

    async fn request<T: serde::de::DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&impl Serialize>,
    ) -> Result<T, UpstreamError> {
        let body_bytes = match body {
            Some(body) => serde_json::to_vec(body)
                .map_err(|err| UpstreamError::Transport(err.into()))?,
            None => Vec::new(),
        };
        let headers = self.signer.headers(method.as_str(), path, &body_bytes);

        let mut req = self
            .http
            .request(method, format!("{}{}", self.base, path))
            .header(TIMESTAMP_HEADER, headers.timestamp)
            .header(NONCE_HEADER, headers.nonce)
            .header(SIGNATURE_HEADER, headers.signature);
        if body.is_some() {
            req = req
                .header(reqwest::header::CONTENT_TYPE, "application/json")
                .body(body_bytes);
        }

        let res = req.send().await.map_err(UpstreamError::from_reqwest)?;
        let status = res.status();
        if status.is_client_error() {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Rejected {
                status: status.as_u16(),
                body,
            });
        }
        if !status.is_success() {
            let body = res.text().await.unwrap_or_default();
            return Err(UpstreamError::Transport(anyhow::anyhow!(
                "http {status}: {body}"
            )));
        }
        res.json().await.map_err(UpstreamError::from_reqwest)
    }
}

#[derive(Debug, Deserialize)]
struct JobsBody {
    jobs: Vec<Job>,
}

#[derive(Debug, Serialize)]
struct ClaimRequest<'a> {
    job_ids: &'a [String],
}

#[derive(Debug, Deserialize)]
struct ClaimBody {
    #[serde(default)]
    claimed: Vec<ClaimedJob>,
    #[serde(default)]
    blocked: Vec<String>,
}

#[derive(Debug, Deserialize)]
struct ClaimedJob {
    id: String,
}

#[derive(Debug, Serialize)]
struct StatusRequest<'a> {
    status: &'a str,
}

#[derive(Debug, Deserialize)]
struct UserBody {
    user: Option<UserRecord>,
}

#[derive(Debug, Deserialize)]
struct CredentialsBody {
    credentials: Option<SealedCredentials>,
}

#[derive(Debug, Serialize)]
struct InvoiceRequest<'a> {
    amount_sats: u64,
    user_npub: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    access_end_date: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TerminalBody {
    jobs: Vec<TerminalStatus>,
}

#[derive(Debug, Deserialize)]
struct Ack {
    #[serde(default)]
    #[allow(dead_code)]
    ok: bool,
}

#[async_trait]
impl UpstreamApi for HttpUpstream {
    async fn pending_jobs(&self) -> Result<Vec<Job>, UpstreamError> {
        let body: JobsBody = self
            .request(reqwest::Method::GET, "/api/jobs/pending", None::<&()>)
            .await?;
        Ok(body.jobs)
    }

    async fn claim_jobs(&self, job_ids: &[String]) -> Result<ClaimOutcome, UpstreamError> {
        let body: ClaimBody = self
            .request(
                reqwest::Method::POST,
                "/api/jobs/claim",
                Some(&ClaimRequest { job_ids }),
            )
            .await?;
        Ok(ClaimOutcome {
            claimed: body.claimed.into_iter().map(|j| j.id).collect(),
            blocked: body.blocked,
        })
    }

    async fn update_job_status(
        &self,
        job_id: &str,
        status: JobStatus,
    ) -> Result<(), UpstreamError> {
        let _: Ack = self
            .request(
                reqwest::Method::PATCH,
                &format!("/api/jobs/{job_id}/status"),
                Some(&StatusRequest {
                    status: status.as_str(),
                }),
            )
            .await?;
        Ok(())
    }

    async fn get_user(&self, npub: &str) -> Result<Option<UserRecord>, UpstreamError> {
        match self
            .request::<UserBody>(
                reqwest::Method::GET,
                &format!("/api/users/{npub}"),
                None::<&()>,
            )
            .await
        {
            Ok(body) => Ok(body.user),
            Err(UpstreamError::Rejected { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn get_credentials(
        &self,
        npub: &str,
        service: &str,
    ) -> Result<Option<SealedCredentials>, UpstreamError> {
        match self
            .request::<CredentialsBody>(
                reqwest::Method::GET,
                &format!("/api/credentials/{npub}/{service}"),
                None::<&()>,
            )
            .await
        {
            Ok(body) => Ok(body.credentials),
            Err(UpstreamError::Rejected { status: 404, .. }) => Ok(None),
            Err(err) => Err(err),
        }
    }

    async fn create_invoice(
        &self,
        job_id: &str,
        amount_sats: u64,
        user_npub: &str,
        access_end_date: Option<&str>,
    ) -> Result<InvoiceData, UpstreamError> {
        self.request(
            reqwest::Method::POST,
            &format!("/api/jobs/{job_id}/invoice"),
            Some(&InvoiceRequest {
                amount_sats,
                user_npub,
                access_end_date,
            }),
        )
        .await
    }

    async fn write_action_log(
        &self,
        job_id: &str,
        payload: serde_json::Value,
    ) -> Result<(), UpstreamError> {
        let _: Ack = self
            .request(
                reqwest::Method::POST,
                &format!("/api/jobs/{job_id}/action_log"),
                Some(&payload),
            )
            .await?;
        Ok(())
    }

    async fn terminal_statuses(&self) -> Result<Vec<TerminalStatus>, UpstreamError> {
        let body: TerminalBody = self
            .request(reqwest::Method::GET, "/api/jobs/terminal", None::<&()>)
            .await?;
        Ok(body.jobs)
    }
}
