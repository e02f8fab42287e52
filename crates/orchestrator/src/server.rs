//! Orchestrator HTTP plane.
//!
//! Three surfaces, all JSON and all signed:
//! - `/callback/*`: the agent reporting challenge prompts and results
//! - `/inbound/dm`: the transport bridge delivering decrypted messages
//! - `/admin/dispatch`: operator CLI dispatch
//!
//! Signature verification buffers the body once, checks the three signing
//! headers, and passes the bytes on to the handler.

use std::str::FromStr;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Request, State};
use axum::http::StatusCode;
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::json;

use subpilot_core::jobs::Action;
use subpilot_core::signing::{Verifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use crate::inbound::InboundRouter;
use crate::job_manager::JobManager;
use crate::session::{Dispatch, JobResult, SessionEngine};

/// Shared state for the orchestrator HTTP plane.
#[derive(Clone)]
pub struct AppState {
    pub session: Arc<SessionEngine>,
    pub manager: Arc<JobManager>,
    pub inbound: Arc<InboundRouter>,
    pub verifier: Arc<Verifier>,
}

/// Build the router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/callback/otp-needed", post(otp_needed))
        .route("/callback/credential-needed", post(credential_needed))
        .route("/callback/result", post(result))
        .route("/inbound/dm", post(inbound_dm))
        .route("/admin/dispatch", post(admin_dispatch))
        .layer(middleware::from_fn_with_state(state.clone(), verify_signature))
        .with_state(state)
}

async fn verify_signature(
    State(state): State<AppState>,
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
    let timestamp = header(TIMESTAMP_HEADER);
    let nonce = header(NONCE_HEADER);
    let signature = header(SIGNATURE_HEADER);

    if let Err(err) = state.verifier.verify(
        parts.method.as_str(),
        parts.uri.path(),
        &bytes,
        &timestamp,
        &nonce,
        &signature,
    ) {
        tracing::warn!(path = %parts.uri.path(), "rejected request: {err}");
        return error_response(StatusCode::UNAUTHORIZED, "bad signature");
    }

    let req = Request::from_parts(parts, Body::from(bytes));
    next.run(req).await
}

#[derive(Debug, Deserialize)]
struct OtpNeededBody {
    job_id: String,
    service: String,
    #[serde(default)]
    prompt: Option<String>,
}

async fn otp_needed(
    State(state): State<AppState>,
    Json(body): Json<OtpNeededBody>,
) -> Response {
    match state
        .session
        .handle_otp_needed(&body.job_id, &body.service, body.prompt.as_deref())
        .await
    {
        Ok(()) => ok_response(),
        Err(err) => internal_error("otp-needed", err),
    }
}

#[derive(Debug, Deserialize)]
struct CredentialNeededBody {
    job_id: String,
    service: String,
    credential_name: String,
}

async fn credential_needed(
    State(state): State<AppState>,
    Json(body): Json<CredentialNeededBody>,
) -> Response {
    match state
        .session
        .handle_credential_needed(&body.job_id, &body.service, &body.credential_name)
        .await
    {
        Ok(()) => ok_response(),
        Err(err) => internal_error("credential-needed", err),
    }
}

async fn result(State(state): State<AppState>, Json(body): Json<JobResult>) -> Response {
    let job_id = body.job_id.clone();
    let res = state.session.handle_result(&body).await;
    // Free the worker slot whatever the session decided; the gate must not
    // leak on a handler error.
    state.manager.on_job_complete(&job_id).await;
    match res {
        Ok(()) => ok_response(),
        Err(err) => internal_error("result", err),
    }
}

#[derive(Debug, Deserialize)]
struct InboundDmBody {
    sender_npub: String,
    text: String,
}

async fn inbound_dm(State(state): State<AppState>, Json(body): Json<InboundDmBody>) -> Response {
    match state
        .inbound
        .handle_message(&body.sender_npub, &body.text)
        .await
    {
        Ok(()) => ok_response(),
        Err(err) => internal_error("inbound", err),
    }
}

#[derive(Debug, Deserialize)]
struct AdminDispatchBody {
    user_npub: String,
    service: String,
    action: String,
    credentials: std::collections::HashMap<String, String>,
    #[serde(default)]
    plan_id: Option<String>,
    #[serde(default)]
    plan_display_name: Option<String>,
}

async fn admin_dispatch(
    State(state): State<AppState>,
    Json(body): Json<AdminDispatchBody>,
) -> Response {
    let action = match Action::from_str(&body.action) {
        Ok(action) => action,
        Err(err) => return error_response(StatusCode::BAD_REQUEST, &err.to_string()),
    };
    let job_id = format!("cli-{}", chrono::Utc::now().timestamp());

    match state
        .session
        .handle_cli_dispatch(
            &body.user_npub,
            &body.service,
            action,
            body.credentials,
            body.plan_id,
            body.plan_display_name,
            &job_id,
        )
        .await
    {
        Ok(Dispatch::Started) => {
            (StatusCode::OK, Json(json!({"ok": true, "job_id": job_id}))).into_response()
        }
        Ok(Dispatch::NotStarted) => error_response(
            StatusCode::CONFLICT,
            "agent rejected the job (capacity or duplicate)",
        ),
        Err(err) => internal_error("admin dispatch", err),
    }
}

fn ok_response() -> Response {
    (StatusCode::OK, Json(json!({"ok": true}))).into_response()
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({"error": message}))).into_response()
}

fn internal_error(what: &str, err: anyhow::Error) -> Response {
    tracing::error!("{what} handler failed: {err:#}");
    error_response(StatusCode::INTERNAL_SERVER_ERROR, "internal error")
}
