use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use subpilot_core::config::Config;
use subpilot_core::signing::{Signer, Verifier};

use subpilot_agent::browser::{BrowserConfig, SystemBrowser};
use subpilot_agent::executor::{ExecutionResult, Executor, JobSpec};
use subpilot_agent::input::{GuiLock, HelperInput};
use subpilot_agent::registry::JobRegistry;
use subpilot_agent::report::{Bridge, Callbacks};
use subpilot_agent::server::{self, AgentState, Runner};
use subpilot_agent::vision::VisionClient;

#[derive(Debug, Parser)]
#[command(name = "subpilot-agent", version, about = "subpilot browser automation agent")]
struct Cli {}

// Production runner: the vision executor with the orchestrator bridge.
struct VisionRunner {
    executor: Executor,
    bridge: Arc<Bridge>,
}

impl Runner for VisionRunner {
    fn run(
        &self,
        spec: &JobSpec,
        credentials: HashMap<String, String>,
        abort: &AtomicBool,
    ) -> ExecutionResult {
        self.executor.run(spec, credentials, self.bridge.as_ref(), abort)
    }
}

const DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_env("LOG_LEVEL").unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();
    let _cli = Cli::parse();

    let cfg = Config::load("agent")?;
    if cfg.vision_url.is_empty() {
        tracing::warn!("VLM_URL not set; jobs will fail until configured");
    }

    let http = reqwest::Client::builder()
        .timeout(Duration::from_secs(90))
        .build()?;
    let handle = tokio::runtime::Handle::current();

    let registry = Arc::new(JobRegistry::new(cfg.max_concurrent_agent_jobs));
    let callbacks = Arc::new(Callbacks::new(
        http.clone(),
        &cfg.orchestrator_url,
        Signer::new(cfg.hmac_secret.clone()),
    ));
    let bridge = Arc::new(Bridge::new(
        registry.clone(),
        callbacks.clone(),
        handle.clone(),
        cfg.otp_timeout,
    ));

    let input = Arc::new(HelperInput::from_env());
    let vision = Arc::new(VisionClient::new(
        http,
        handle,
        &cfg.vision_url,
        &cfg.vision_key,
        &cfg.vision_model,
    ));
    let browser = Arc::new(SystemBrowser::new(BrowserConfig::from_env(), input.clone()));
    let executor = Executor::new(
        vision,
        browser,
        input,
        Arc::new(GuiLock::new()),
        cfg.settle_delay,
        cfg.max_steps,
    );

    let state = AgentState {
        registry: registry.clone(),
        callbacks,
        runner: Arc::new(VisionRunner { executor, bridge }),
        verifier: Arc::new(Verifier::new(cfg.hmac_secret.clone())),
    };

    let app = server::router(state);
    let listener = tokio::net::TcpListener::bind(&cfg.agent_bind).await?;
    tracing::info!(
        "agent {} listening on {} (max_jobs={}, vlm={})",
        env!("CARGO_PKG_VERSION"),
        cfg.agent_bind,
        cfg.max_concurrent_agent_jobs,
        if cfg.vision_url.is_empty() { "(not set)" } else { cfg.vision_model.as_str() },
    );

    // On signal: stop admitting, keep serving so challenge replies still
    // reach blocked drivers, wait for active jobs, then cancel stragglers.
    let drain_registry = registry.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            tracing::info!("shutdown signal received, draining");
            drain_registry.start_draining();

            let deadline = tokio::time::Instant::now() + DRAIN_TIMEOUT;
            while drain_registry.active_count() > 0 && tokio::time::Instant::now() < deadline {
                tokio::time::sleep(Duration::from_millis(500)).await;
            }
            for job in drain_registry.snapshot() {
                tracing::warn!(job = %job.job_id, "still running at deadline, cancelling");
                drain_registry.abort(&job.job_id);
            }
        })
        .await?;

    tracing::info!("agent stopped");
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
