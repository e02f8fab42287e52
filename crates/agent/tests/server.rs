//! Control-plane behavior: admission, slot accounting, challenge relays,
//! abort, health, and request authentication.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use axum::body::Body;
use axum::http::{Request, StatusCode};
use serde_json::{json, Value};
use tower::ServiceExt;

use subpilot_core::signing::{Signer, Verifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use subpilot_agent::executor::{ExecutionResult, JobSpec};
use subpilot_agent::registry::JobRegistry;
use subpilot_agent::report::Callbacks;
use subpilot_agent::server::{router, AgentState, Runner};

const SECRET: &str = "test-secret";

// Holds the slot briefly, honoring the abort flag.
struct SlowRunner {
    hold: Duration,
}

impl Runner for SlowRunner {
    fn run(
        &self,
        _spec: &JobSpec,
        _credentials: HashMap<String, String>,
        abort: &AtomicBool,
    ) -> ExecutionResult {
        let started = Instant::now();
        while started.elapsed() < self.hold && !abort.load(Ordering::SeqCst) {
            std::thread::sleep(Duration::from_millis(5));
        }
        ExecutionResult {
            success: !abort.load(Ordering::SeqCst),
            billing_end_date: None,
            error: abort.load(Ordering::SeqCst).then(|| "job aborted".to_string()),
            error_code: abort.load(Ordering::SeqCst).then(|| "aborted".to_string()),
            step_count: 1,
            inference_count: 1,
            duration: started.elapsed(),
        }
    }
}

struct Rig {
    state: AgentState,
}

impl Rig {
    fn new(max_jobs: usize, hold: Duration) -> Self {
        let registry = Arc::new(JobRegistry::new(max_jobs));
        // Points at a closed port; result reports fail and are logged.
        let callbacks = Arc::new(Callbacks::new(
            reqwest::Client::new(),
            "http://127.0.0.1:1",
            Signer::new(SECRET),
        ));
        Self {
            state: AgentState {
                registry,
                callbacks,
                runner: Arc::new(SlowRunner { hold }),
                verifier: Arc::new(Verifier::new(SECRET)),
            },
        }
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
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
        self.send(req).await
    }

    async fn send(&self, req: Request<Body>) -> (StatusCode, Value) {
        let res = router(self.state.clone()).oneshot(req).await.unwrap();
        let status = res.status();
        let bytes = axum::body::to_bytes(res.into_body(), 1 << 20).await.unwrap();
        let value = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, value)
    }

    async fn wait_for_drain(&self) {
        let deadline = Instant::now() + Duration::from_secs(2);
        while self.state.registry.active_count() > 0 {
            assert!(Instant::now() < deadline, "jobs never drained");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
    }
}

fn execute_body(job_id: &str) -> Value {
    json!({
        "job_id": job_id,
        "service": "netflix",
        "action": "cancel",
        "credentials": {"email": "a@b.example", "pass": "hunter2"},
    })
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn execute_accepts_and_frees_the_slot() {
    let rig = Rig::new(2, Duration::from_millis(20));

    let (status, body) = rig.post("/execute", execute_body("j1")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["job_id"], "j1");
    assert_eq!(rig.state.registry.active_count(), 1);

    rig.wait_for_drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn duplicate_and_capacity_are_conflicts() {
    let rig = Rig::new(1, Duration::from_millis(200));

    let (status, _) = rig.post("/execute", execute_body("j1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = rig.post("/execute", execute_body("j1")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("already running"));

    let (status, body) = rig.post("/execute", execute_body("j2")).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert!(body["error"].as_str().unwrap().contains("capacity"));

    rig.state.registry.abort("j1");
    rig.wait_for_drain().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn missing_fields_are_rejected() {
    let rig = Rig::new(1, Duration::ZERO);
    let (status, _) = rig
        .post(
            "/execute",
            json!({"job_id": "", "service": "netflix", "action": "cancel", "credentials": {}}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
}

#[tokio::test]
async fn otp_for_unknown_job_is_404() {
    let rig = Rig::new(1, Duration::ZERO);
    let (status, _) = rig
        .post("/otp", json!({"job_id": "ghost", "code": "123456"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn otp_fulfils_an_armed_slot() {
    let rig = Rig::new(1, Duration::ZERO);
    rig.state.registry.admit("j1", "netflix", "cancel").unwrap();
    let rx = rig.state.registry.arm_otp_slot("j1").unwrap();

    let (status, _) = rig
        .post("/otp", json!({"job_id": "j1", "code": "123456"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rx.await.unwrap(), "123456");
}

#[tokio::test]
async fn credential_fulfils_an_armed_slot() {
    let rig = Rig::new(1, Duration::ZERO);
    rig.state.registry.admit("j1", "netflix", "resume").unwrap();
    let rx = rig.state.registry.arm_credential_slot("j1").unwrap();

    let (status, _) = rig
        .post(
            "/credential",
            json!({"job_id": "j1", "credential_name": "cvv", "value": "321"}),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(rx.await.unwrap(), "321");
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn abort_cancels_a_running_job() {
    let rig = Rig::new(1, Duration::from_secs(10));

    let (status, _) = rig.post("/execute", execute_body("j1")).await;
    assert_eq!(status, StatusCode::OK);

    let (status, _) = rig.post("/abort", json!({"job_id": "j1"})).await;
    assert_eq!(status, StatusCode::OK);

    // The driver notices the flag and the slot frees well before the hold.
    rig.wait_for_drain().await;
}

#[tokio::test]
async fn abort_for_unknown_job_is_404() {
    let rig = Rig::new(1, Duration::ZERO);
    let (status, _) = rig.post("/abort", json!({"job_id": "ghost"})).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn health_reports_slots_and_jobs() {
    let rig = Rig::new(3, Duration::ZERO);
    rig.state.registry.admit("j1", "netflix", "cancel").unwrap();

    let req = Request::builder()
        .method("GET")
        .uri("/health")
        .body(Body::empty())
        .unwrap();
    let (status, body) = rig.send(req).await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ok"], true);
    assert_eq!(body["max_jobs"], 3);
    assert_eq!(body["active_job_count"], 1);
    assert_eq!(body["slots_available"], 2);
    assert_eq!(body["active_jobs"][0]["job_id"], "j1");
}

#[tokio::test]
async fn unsigned_requests_are_rejected() {
    let rig = Rig::new(1, Duration::ZERO);
    let req = Request::builder()
        .method("POST")
        .uri("/execute")
        .header("content-type", "application/json")
        .body(Body::from(serde_json::to_vec(&execute_body("j1")).unwrap()))
        .unwrap();
    let (status, _) = rig.send(req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(rig.state.registry.active_count(), 0);
}

#[tokio::test]
async fn draining_rejects_new_work() {
    let rig = Rig::new(1, Duration::ZERO);
    rig.state.registry.start_draining();
    let (status, _) = rig.post("/execute", execute_body("j1")).await;
    assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
}
