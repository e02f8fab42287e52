//! Inbound DM routing and full conversation flows.

mod common;

use common::*;

use subpilot_core::jobs::{JobStatus, SessionState};
use subpilot_orchestrator::inbound::InboundRouter;
use subpilot_orchestrator::session::JobResult;

#[tokio::test]
async fn yes_dispatches_the_outreach_job() {
    let h = harness();
    let mut job = make_job("job-1", ALICE);
    job.status = JobStatus::OutreachSent;
    h.db.upsert_job(&job).await.unwrap();
    h.upstream.add_credentials(ALICE, "netflix", "a@b.example", "hunter2");

    h.inbound.handle_user_message(ALICE, "yes").await.unwrap();

    assert_eq!(h.worker.executed_job_ids(), vec!["job-1".to_string()]);
}

#[tokio::test]
async fn skip_and_snooze_keywords_route() {
    let h = harness();
    let mut job = make_job("job-1", ALICE);
    job.status = JobStatus::OutreachSent;
    h.db.upsert_job(&job).await.unwrap();

    h.inbound.handle_user_message(ALICE, "snooze").await.unwrap();
    assert_eq!(
        h.db.get_job("job-1").await.unwrap().unwrap().status,
        JobStatus::Snoozed
    );

    h.inbound.handle_user_message(ALICE, "skip").await.unwrap();
    assert_eq!(
        h.db.get_job("job-1").await.unwrap().unwrap().status,
        JobStatus::UserSkip
    );
}

#[tokio::test]
async fn otp_digits_are_relayed_and_logged_redacted() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::AwaitingOtp, Some("job-1"), 0)
        .await
        .unwrap();

    h.inbound.handle_user_message(ALICE, "123456").await.unwrap();

    // The live relay carries the real code.
    assert_eq!(
        *h.worker.otps.lock().unwrap(),
        vec![("job-1".to_string(), "123456".to_string())]
    );
    // The log does not.
    let log = h.db.messages_for(ALICE).await.unwrap();
    let inbound: Vec<_> = log.iter().filter(|m| m.direction == "in").collect();
    assert_eq!(inbound.len(), 1);
    assert!(!inbound[0].content.contains("123456"));
}

#[tokio::test]
async fn dashed_code_is_normalized() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::AwaitingOtp, Some("job-1"), 0)
        .await
        .unwrap();

    h.inbound.handle_user_message(ALICE, "123-456").await.unwrap();
    assert_eq!(
        *h.worker.otps.lock().unwrap(),
        vec![("job-1".to_string(), "123456".to_string())]
    );
}

#[tokio::test]
async fn credential_reply_routes_while_awaiting() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::Executing, Some("job-1"), 0)
        .await
        .unwrap();
    h.session
        .handle_credential_needed("job-1", "netflix", "cvv")
        .await
        .unwrap();

    h.inbound.handle_user_message(ALICE, "321").await.unwrap();

    assert_eq!(
        *h.worker.credentials.lock().unwrap(),
        vec![("job-1".to_string(), "cvv".to_string(), "321".to_string())]
    );
}

#[tokio::test]
async fn cancel_mid_flow_closes_the_session() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::AwaitingOtp, Some("job-1"), 0)
        .await
        .unwrap();

    h.inbound.handle_user_message(ALICE, "cancel").await.unwrap();

    assert!(h.db.get_session(ALICE).await.unwrap().is_none());
    assert_eq!(*h.worker.aborts.lock().unwrap(), vec!["job-1".to_string()]);
    assert!(h.messenger.last_to(ALICE).contains("Cancelled"));
}

#[tokio::test]
async fn idle_user_with_nothing_pending_gets_a_gentle_reply() {
    let h = harness();
    h.inbound.handle_user_message(ALICE, "yes").await.unwrap();
    assert!(h.messenger.last_to(ALICE).contains("nothing"));

    h.inbound.handle_user_message(ALICE, "what is this").await.unwrap();
    assert!(h.messenger.last_to(ALICE).contains("streaming"));
}

#[tokio::test]
async fn push_messages_route_by_sender() {
    let h = harness();
    h.db.upsert_job(&make_job("job-1", ALICE)).await.unwrap();
    h.db.upsert_session(ALICE, SessionState::InvoiceSent, Some("job-1"), 0)
        .await
        .unwrap();

    let router = InboundRouter::new(
        h.session.clone(),
        h.manager.clone(),
        subpilot_orchestrator::transport::Outbox::new(
            h.db.clone(),
            h.messenger.clone(),
            Some(OPERATOR.to_string()),
        ),
        Some("npub1coordinator".to_string()),
    );

    router
        .handle_message(
            "npub1coordinator",
            r#"{"type": "job_payment_received", "data": {"job_id": "job-1", "amount_sats": 3000}}"#,
        )
        .await
        .unwrap();

    assert_eq!(
        h.db.get_job("job-1").await.unwrap().unwrap().status,
        JobStatus::CompletedPaid
    );
    assert!(h.db.get_session(ALICE).await.unwrap().is_none());
}

// The end-to-end happy path: claim, outreach, consent, OTP round trip,
// result, invoice, payment.
#[tokio::test]
async fn happy_cancel_flow() {
    let h = harness();
    let mut job = make_job("j1", ALICE);
    job.status = JobStatus::Pending;
    job.billing_date = Some("2026-03-15".to_string());
    h.upstream.pending.lock().unwrap().push(job);
    h.upstream.add_credentials(ALICE, "netflix", "a@b.example", "hunter2");

    // Claim and outreach.
    h.manager.poll_and_claim().await.unwrap();
    assert!(h.messenger.last_to(ALICE).contains("2026-03-15"));

    // Consent.
    h.inbound.handle_user_message(ALICE, "yes").await.unwrap();
    assert_eq!(h.worker.executed_job_ids(), vec!["j1".to_string()]);

    // Mid-flow OTP.
    h.session
        .handle_otp_needed("j1", "netflix", None)
        .await
        .unwrap();
    h.inbound.handle_user_message(ALICE, "123456").await.unwrap();
    let session = h.db.get_session(ALICE).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::Executing);
    assert_eq!(session.otp_attempts, 1);

    // Worker reports success; invoice goes out.
    h.session
        .handle_result(&JobResult {
            job_id: "j1".to_string(),
            success: true,
            access_end_date: Some("2026-03-15".to_string()),
            error: None,
            error_code: None,
            duration_seconds: 240,
            stats: None,
        })
        .await
        .unwrap();
    h.manager.on_job_complete("j1").await;

    let session = h.db.get_session(ALICE).await.unwrap().unwrap();
    assert_eq!(session.state, SessionState::InvoiceSent);

    // Payment arrives.
    h.session.handle_payment_received("j1", 3000).await.unwrap();

    let job = h.db.get_job("j1").await.unwrap().unwrap();
    assert_eq!(job.status, JobStatus::CompletedPaid);
    assert!(h.db.get_session(ALICE).await.unwrap().is_none());
    // Every timer for the job is gone.
    assert_eq!(h.db.unfired_timer_count(None, "j1").await.unwrap(), 0);
    // The status trail reached upstream in order.
    assert_eq!(
        h.upstream.recorded_status("j1"),
        vec![JobStatus::OutreachSent, JobStatus::Active]
    );
}
