//! The orchestrator HTTP plane: worker callbacks, inbound bridge, admin
//! dispatch, and request authentication.

mod common;

use std::sync::Arc;

use axum::body::Body;
use axum::http::{Request, StatusCode};
use common::*;
use serde_json::{json, Value};
use tower::ServiceExt;

use subpilot_core::jobs::{JobStatus, SessionState};
use subpilot_core::signing::{Signer, Verifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};
use subpilot_orchestrator::server::{router, AppState};

const SECRET: &str = "test-secret";

fn app_state(h: &Harness) -> AppState {
    AppState {
        session: h.session.clone(),
        manager: h.manager.clone(),
        inbound: Arc::new(subpilot_orchestrator::inbound::InboundRouter::new(
            h.session.clone(),
            h.manager.clone(),
            subpilot_orchestrator::transport::Outbox::new(
                h.db.clone(),
                h.messenger.clone(),
                Some(OPERATOR.to_string()),
            ),
            None,
        )),
        verifier: Arc::new(Verifier::new(SECRET)),
    }
}

async fn signed_post(state: AppState, path: &str, body: Value) -> (StatusCode, Value) {
    let bytes = serde_json::to_vec(&body).unwrap();
    let headers = Signer::new(SECRET).headers("POST", path, &bytes);
    let req = Request::builder()
        .method("POST")
        .uri(path)
        .header("content-type", "application/json")
        .header(TIMESTAMP_HEADER, headers.timestamp)
        .header(NONCE_HEADER, headers.nonce)
        .header(SIGNATURE_HEADER, headers.signature)
        .body(Body::from(bytes))
        .unwrap();
    let res = router(state).oneshot(req).await.unwrap();
    let status = res.status();
    let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
    (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
}

#[tokio::test]
async fn otp_needed_callback_transitions_the_session() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::Executing, Some("job-1"), 0)
        .await
        .unwrap();

    let (status, body) = signed_post(
        app_state(&h),
        "/callback/otp-needed",
        json!({"job_id": "job-1", "service": "netflix", "prompt": "check your email"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    let session = h.db.get_session(ALICE).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::AwaitingOtp);
}

#[tokio::test]
async fn result_callback_runs_the_session_and_frees_the_gate() {
    let h = harness_with_slots(1);
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.upstream.add_credentials(ALICE, "netflix", "a@b.example", "hunter2");
    h.manager.request_dispatch(ALICE, "job-1").await.unwrap();
    assert_eq!(h.manager.slots_available().await, 0);

    let (status, _) = signed_post(
        app_state(&h),
        "/callback/result",
        json!({
            "job_id": "job-1",
            "success": true,
            "access_end_date": "2026-03-15",
            "duration_seconds": 200,
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(h.manager.slots_available().await, 1);
    let session = h.db.get_session(ALICE).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::InvoiceSent);
}

#[tokio::test]
async fn inbound_bridge_routes_user_messages() {
    let h = harness();
    let mut job = make_job("job-1", ALICE);
    job.status = JobStatus::OutreachSent;
    h.db.upsert_job(&job).await.unwrap();

    let (status, _) = signed_post(
        app_state(&h),
        "/inbound/dm",
        json!({"sender_npub": ALICE, "text": "skip"}),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(
        h.db.get_job("job-1").await.unwrap().unwrap().status,
        JobStatus::UserSkip
    );
}

#[tokio::test]
async fn admin_dispatch_runs_a_cli_job() {
    let h = harness();

    let (status, body) = signed_post(
        app_state(&h),
        "/admin/dispatch",
        json!({
            "user_npub": ALICE,
            "service": "netflix",
            "action": "cancel",
            "credentials": {"email": "a@b.example", "pass": "hunter2"},
        }),
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    let job_id = body["job_id"].as_str().unwrap().to_string();
    assert!(job_id.starts_with("cli-"));
    assert_eq!(h.worker.executed_job_ids(), vec![job_id]);
}

#[tokio::test]
async fn admin_dispatch_rejects_unknown_actions() {
    let h = harness();
    let (status, _) = signed_post(
        app_state(&h),
        "/admin/dispatch",
        json!({
            "user_npub": ALICE,
            "service": "netflix",
            "action": "pause",
            "credentials": {},
        }),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn unsigned_callbacks_are_rejected() {
    let h = harness();
    let req = Request::builder()
        .method("POST")
        .uri("/callback/result")
        .header("content-type", "application/json")
        .body(Body::from(
            serde_json::to_vec(&json!({"job_id": "job-1", "success": true, "duration_seconds": 1}))
                .unwrap(),
        ))
        .unwrap();
    let res = router(app_state(&h)).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}

#[tokio::test]
async fn tampered_bodies_are_rejected() {
    let h = harness();
    let real = serde_json::to_vec(&json!({"job_id": "job-1", "success": true})).unwrap();
    let headers = Signer::new(SECRET).headers("POST", "/callback/result", &real);
    let forged = serde_json::to_vec(&json!({"job_id": "job-2", "success": true})).unwrap();
    let req = Request::builder()
        .method("POST")
        .uri("/callback/result")
        .header("content-type", "application/json")
        .header(TIMESTAMP_HEADER, headers.timestamp)
        .header(NONCE_HEADER, headers.nonce)
        .header(SIGNATURE_HEADER, headers.signature)
        .body(Body::from(forged))
        .unwrap();
    let res = router(app_state(&h)).oneshot(req).await.unwrap();
    assert_eq!(res.status(), StatusCode::UNAUTHORIZED);
}
