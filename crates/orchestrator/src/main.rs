use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use subpilot_core::config::{config_dir, Config};
use subpilot_core::signing::{Signer, Verifier, NONCE_HEADER, SIGNATURE_HEADER, TIMESTAMP_HEADER};

use subpilot_orchestrator::agent_client::HttpWorker;
use subpilot_orchestrator::db::Db;
use subpilot_orchestrator::inbound::InboundRouter;
use subpilot_orchestrator::job_manager::{JobManager, JobManagerConfig};
use subpilot_orchestrator::server::{self, AppState};
use subpilot_orchestrator::session::{SessionConfig, SessionEngine};
use subpilot_orchestrator::timers::{self, Timers};
use subpilot_orchestrator::transport::{LogMessenger, Outbox};
use subpilot_orchestrator::upstream::{HttpUpstream, PlainOpener};

#[derive(Debug, Parser)]
#[command(name = "subpilot-orchestrator", version, about = "subpilot job orchestrator")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Dispatch a job directly to the agent through a running orchestrator,
    /// bypassing outreach and billing.
    Dispatch {
        /// Target user (64-hex public key).
        user_npub: String,
        /// Service id (e.g. `netflix`).
        service: String,
        /// `cancel` or `resume`.
        action: String,
        /// Login email.
        #[arg(long)]
        email: String,
        /// Login password.
        #[arg(long)]
        password: String,
        /// Plan id for resume (e.g. `netflix_premium`).
        #[arg(long)]
        plan_id: Option<String>,
        /// Display name of the plan for DMs.
        #[arg(long)]
        plan_display_name: Option<String>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let cfg = Config::load("orchestrator")?;

    match cli.command {
        Some(Command::Dispatch {
            user_npub,
            service,
            action,
            email,
            password,
            plan_id,
            plan_display_name,
        }) => {
            dispatch_via_daemon(
                &cfg,
                &user_npub,
                &service,
                &action,
                &email,
                &password,
                plan_id,
                plan_display_name,
            )
            .await
        }
        None => run_daemon(cfg).await,
    }
}

#[allow(clippy::too_many_arguments)]
async fn dispatch_via_daemon(
    cfg: &Config,
    user_npub: &str,
    service: &str,
    action: &str,
    email: &str,
    password: &str,
    plan_id: Option<String>,
    plan_display_name: Option<String>,
) -> anyhow::Result<()> {
    let body = serde_json::json!({
        "user_npub": user_npub,
        "service": service,
        "action": action,
        "credentials": {"email": email, "pass": password},
        "plan_id": plan_id,
        "plan_display_name": plan_display_name,
    });
    let body_bytes = serde_json::to_vec(&body)?;

    let signer = Signer::new(cfg.hmac_secret.clone());
    let headers = signer.headers("POST", "/admin/dispatch", &body_bytes);

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(30))
        .build()?;
    let res = http
        .post(format!(
            "{}/admin/dispatch",
            cfg.orchestrator_url.trim_end_matches('/')
        ))
        .header(TIMESTAMP_HEADER, headers.timestamp)
        .header(NONCE_HEADER, headers.nonce)
        .header(SIGNATURE_HEADER, headers.signature)
        .header(reqwest::header::CONTENT_TYPE, "application/json")
        .body(body_bytes)
        .send()
        .await?;

    let status = res.status();
    let text = res.text().await.unwrap_or_default();
    if !status.is_success() {
        anyhow::bail!("dispatch failed: http {status}: {text}");
    }
    println!("{text}");
    Ok(())
}

async fn run_daemon(cfg: Config) -> anyhow::Result<()> {
    let db_path = cfg
        .db_path
        .clone()
        .map(PathBuf::from)
        .unwrap_or_else(|| config_dir().join("orchestrator.db"));
    let db = Db::open(&db_path)?;
    tracing::info!("store open at {}", db_path.display());

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(60))
        .build()?;
    let signer = Signer::new(cfg.hmac_secret.clone());

    let upstream = Arc::new(HttpUpstream::new(http.clone(), &cfg.upstream_url, signer.clone()));
    let worker = Arc::new(HttpWorker::new(http, &cfg.agent_url, signer));
    let timers = Timers::new(db.clone());
    let outbox = Outbox::new(db.clone(), Arc::new(LogMessenger), cfg.operator_npub.clone());

    let session = Arc::new(SessionEngine::new(
        db.clone(),
        timers.clone(),
        upstream.clone(),
        worker,
        Arc::new(PlainOpener),
        outbox.clone(),
        SessionConfig::from(&cfg),
    ));
    let manager = Arc::new(JobManager::new(
        db.clone(),
        timers,
        upstream,
        session.clone(),
        outbox.clone(),
        JobManagerConfig::from(&cfg),
    ));
    let inbound = Arc::new(InboundRouter::new(
        session.clone(),
        manager.clone(),
        outbox,
        cfg.push_npub.clone(),
    ));

    // Timer fan-out: one tick task scans the store, one router task runs
    // the handlers so a slow handler cannot stall the scan.
    let (timer_tx, mut timer_rx) = tokio::sync::mpsc::channel(64);
    let tick_task = tokio::spawn(timers::run_tick(db.clone(), timer_tx, Duration::from_secs(1)));
    let timer_manager = manager.clone();
    let timer_task = tokio::spawn(async move {
        while let Some(timer) = timer_rx.recv().await {
            if let Err(err) = timer_manager.handle_timer(&timer).await {
                tracing::error!(
                    timer = %timer.timer_type,
                    target = %timer.target_id,
                    "timer handler failed: {err:#}"
                );
            }
        }
    });

    let poll_manager = manager.clone();
    let poll_interval = cfg.poll_interval;
    let poll_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(poll_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match poll_manager.poll_and_claim().await {
                Ok(claimed) if !claimed.is_empty() => {
                    tracing::info!(count = claimed.len(), "claimed jobs");
                }
                Ok(_) => {}
                Err(err) => tracing::warn!("poll failed: {err:#}"),
            }
        }
    });

    let reconcile_manager = manager.clone();
    let reconcile_interval = cfg.reconcile_interval;
    let reconcile_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(reconcile_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match reconcile_manager.reconcile_tick().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "reconciled terminal jobs"),
                Err(err) => tracing::warn!("reconcile failed: {err:#}"),
            }
        }
    });

    let cleanup_manager = manager.clone();
    let cleanup_interval = cfg.cleanup_interval;
    let cleanup_task = tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        loop {
            interval.tick().await;
            match cleanup_manager.cleanup_terminal_jobs().await {
                Ok(0) => {}
                Ok(n) => tracing::info!(count = n, "cleaned up terminal jobs"),
                Err(err) => tracing::warn!("cleanup failed: {err:#}"),
            }
        }
    });

    let state = AppState {
        session,
        manager,
        inbound,
        verifier: Arc::new(Verifier::new(cfg.hmac_secret.clone())),
    };
    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.orchestrator_bind).await?;
    tracing::info!(
        "orchestrator {} listening on {}",
        env!("CARGO_PKG_VERSION"),
        cfg.orchestrator_bind
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("shutting down");
    for task in [tick_task, timer_task, poll_task, reconcile_task, cleanup_task] {
        task.abort();
    }
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        let _ = tokio::signal::ctrl_c().await;
    };
    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(_) => std::future::pending::<()>().await,
        }
    };
    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
