//! Agent HTTP control plane.
//!
//! `/execute` admits a job into the bounded pool and returns immediately;
//! the browser driver runs on a blocking thread and the result is always
//! reported back to the orchestrator, whatever happens to the driver.
//! `/otp` and `/credential` fulfil the one-shot slots a driver blocks on.
//! Nothing here stores a code or credential beyond handing it over.

use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Instant;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use subpilot_core::signing::{Verifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use crate::executor::{ExecutionResult, JobSpec};
use crate::registry::{AdmitError, JobRegistry};
use crate::report::{Callbacks, ResultReport};

/// Runs one job to completion on the calling (blocking) thread.
///
/// The production implementation wraps [`crate::executor::Executor`];
/// tests substitute scripted runners.
pub trait Runner: Send + Sync + 'static {
    fn run(
        &self,
        spec: &JobSpec,
        credentials: HashMap<String, String>,
        abort: &AtomicBool,
    ) -> ExecutionResult;
}

/// Shared state for the agent control plane.
#[derive(Clone)]
pub struct AgentState {
    pub registry: Arc<JobRegistry>,
    pub callbacks: Arc<Callbacks>,
    pub runner: Arc<dyn Runner>,
    pub verifier: Arc<Verifier>,
}

/// Build the router.
pub fn router(state: AgentState) -> Router {
    Router::new()
        .route("/execute", post(execute))
        .route("/otp", post(otp))
        .route("/credential", post(credential))
        .route("/abort", post(abort))
        .layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .route("/health", get(health))
        .with_state(state)
}

async fn verify_signature(
    State(state): State<AgentState>,
    req: Request,
    next: Next,
) -> Response {
    let (parts, body) = req.into_parts();
    let bytes = match axum::body::to_bytes(body, 1 << 20).await {
        Ok(bytes) => bytes,
        Err(_) => return error_response(StatusCode::BAD_REQUEST, "unreadable body"),
    };

    let header = |name: &str| {
        parts
            .headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string()
    };
    if let Err(err) = state.verifier.verify(
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        &header(TIMESTAMP_HEADER),
        &header(NONCE_HEADER),
        &header(SIGNATURE_HEADER),
    ) {
        tracing::warn!(path = %parts.uri.path(), "rejected request: {err}");
        return error_response(StatusCode::UNAUTHORIZED, "bad signature");
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

#[derive(Debug, Deserialize)]
struct ExecuteBody {
    job_id: String,
    service: String,
    action: String,
    credentials: HashMap<String, String>,
    #[serde(default)]
    plan_id: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    plan_display_name: Option<String>,
    #[serde(default)]
    #[allow(dead_code)]
    user_npub: Option<String>,
}

async fn execute(State(state): State<AgentState>, Json(body): Json<ExecuteBody>) -> Response {
    if body.job_id.is_empty() || body.service.is_empty() || body.action.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "missing job_id, service, or action");
    }

    let abort = match state
        .registry
        .admit(&body.job_id, &body.service, &body.action)
    {
        Ok(abort) => abort,
        Err(err @ (AdmitError::Duplicate(_) | AdmitError::AtCapacity { .. })) => {
            tracing::warn!(job = %body.job_id, "rejected: {err}");
            return error_response(StatusCode::CONFLICT, &err.to_string());
        }
        Err(err @ AdmitError::Draining) => {
            return error_response(StatusCode::SERVICE_UNAVAILABLE, &err.to_string());
        }
    };

    // Tier from plan id: `netflix_premium` -> `premium`.
    let plan_tier = body
        .plan_id
        .as_deref()
        .and_then(|plan| plan.strip_prefix(&format!("{}_", body.service)))
        .unwrap_or_default()
        .to_string();

    let spec = JobSpec {
        job_id: body.job_id.clone(),
        service: body.service.clone(),
        action: body.action.clone(),
        plan_tier,
    };
    tracing::info!(
        job = %spec.job_id,
        service = %spec.service,
        action = %spec.action,
        active = state.registry.active_count(),
        max = state.registry.max_jobs(),
        "job accepted"
    );

    let registry = state.registry.clone();
    let callbacks = state.callbacks.clone();
    let runner = state.runner.clone();
    let credentials = body.credentials;
    tokio::spawn(async move {
        let started = Instant::now();
        let run_spec = spec.clone();
        let run_abort = abort.clone();
        let outcome = tokio::task::spawn_blocking(move || {
            runner.run(&run_spec, credentials, &run_abort)
        })
        .await;

        let report = match outcome {
            Ok(result) => ResultReport {
                job_id: spec.job_id.clone(),
                success: result.success,
                access_end_date: result.billing_end_date,
                error: result.error,
                error_code: result.error_code,
                duration_seconds: result.duration.as_secs(),
                stats: Some(json!({
                    "step_count": result.step_count,
                    "inference_count": result.inference_count,
                })),
            },
            Err(err) => {
                tracing::error!(job = %spec.job_id, "driver panicked: {err}");
                ResultReport {
                    job_id: spec.job_id.clone(),
                    success: false,
                    access_end_date: None,
                    error: Some(format!("driver crashed: {err}")),
                    error_code: None,
                    duration_seconds: started.elapsed().as_secs(),
                    stats: None,
                }
            }
        };

        callbacks.report_result(&report).await;
        registry.remove(&spec.job_id);
        tracing::info!(
            job = %spec.job_id,
            active = registry.active_count(),
            "slot freed"
        );
    });

    (StatusCode::OK, Json(json!({"ok": true, "job_id": body.job_id}))).into_response()
}

#[derive(Debug, Deserialize)]
struct OtpBody {
    job_id: String,
    code: String,
}

async fn otp(State(state): State<AgentState>, Json(body): Json<OtpBody>) -> Response {
    match state.registry.fulfil_otp(&body.job_id, body.code) {
        None => {
            tracing::warn!(job = %body.job_id, "otp for unknown job");
            error_response(StatusCode::NOT_FOUND, "no active job with that id")
        }
        Some(false) => {
            tracing::warn!(job = %body.job_id, "otp arrived but nothing is waiting");
            ok_response()
        }
        Some(true) => {
            tracing::info!(job = %body.job_id, "otp delivered");
            ok_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct CredentialBody {
    job_id: String,
    credential_name: String,
    value: String,
}

async fn credential(State(state): State<AgentState>, Json(body): Json<CredentialBody>) -> Response {
    match state.registry.fulfil_credential(&body.job_id, body.value) {
        None => {
            tracing::warn!(job = %body.job_id, "credential for unknown job");
            error_response(StatusCode::NOT_FOUND, "no active job with that id")
        }
        Some(false) => {
            tracing::warn!(
                job = %body.job_id,
                name = %body.credential_name,
                "credential arrived but nothing is waiting"
            );
            ok_response()
        }
        Some(true) => {
            tracing::info!(job = %body.job_id, name = %body.credential_name, "credential delivered");
            ok_response()
        }
    }
}

#[derive(Debug, Deserialize)]
struct AbortBody {
    job_id: String,
}

async fn abort(State(state): State<AgentState>, Json(body): Json<AbortBody>) -> Response {
    if state.registry.abort(&body.job_id) {
        tracing::info!(job = %body.job_id, "abort requested");
        ok_response()
    } else {
        tracing::warn!(job = %body.job_id, "abort for unknown job");
        error_response(StatusCode::NOT_FOUND, "no active job with that id")
    }
}

async fn health(State(state): State<AgentState>) -> Response {
    let active = state.registry.snapshot();
    (
        StatusCode::OK,
        Json(json!({
            "ok": true,
            "version": env!("CARGO_PKG_VERSION"),
            "max_jobs": state.registry.max_jobs(),
            "active_job_count": active.len(),
            "slots_available": state.registry.max_jobs().saturating_sub(active.len()),
            "active_jobs": active,
        })),
    )
        .into_response()
}

fn ok_response() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}
