//! Layered environment configuration.
//!
//! Every component reads `~/.subpilot/shared.env`, then overlays its own
//! `<component>.env`, then the process environment. Values already present
//! in the process environment always win.

use std::path::PathBuf;
use std::time::Duration;

/// Runtime configuration shared by the orchestrator and the agent.
///
/// Fields a component does not use are simply ignored by it; the loader is
/// shared so both sides agree on key names and defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Upstream coordinator base URL.
    pub upstream_url: String,
    /// Shared symmetric secret for request signing.
    pub hmac_secret: String,
    /// Orchestrator callback-server bind address.
    pub orchestrator_bind: String,
    /// Orchestrator base URL as seen from the agent.
    pub orchestrator_url: String,
    /// Agent control-plane bind address.
    pub agent_bind: String,
    /// Agent base URL as seen from the orchestrator.
    pub agent_url: String,
    /// Maximum concurrent browser jobs on the worker.
    pub max_concurrent_agent_jobs: usize,
    /// Price of one successful action, in sats.
    pub action_price_sats: u64,
    /// How long to wait for a user-supplied OTP or credential.
    pub otp_timeout: Duration,
    /// How long an invoice stays payable.
    pub payment_expiry: Duration,
    /// Gap between outreach followups.
    pub outreach_interval: Duration,
    /// How far before the billing date the last-chance nudge fires.
    pub last_chance_lead: Duration,
    /// Upstream poll cadence.
    pub poll_interval: Duration,
    /// Terminal-status reconciliation cadence.
    pub reconcile_interval: Duration,
    /// Local cleanup cadence.
    pub cleanup_interval: Duration,
    /// How long terminal jobs are kept locally before deletion.
    pub terminal_retention: Duration,
    /// Vision model endpoint (OpenAI-compatible).
    pub vision_url: String,
    /// Vision model API key.
    pub vision_key: String,
    /// Vision model name.
    pub vision_model: String,
    /// Delay after each browser action before the next screenshot.
    pub settle_delay: Duration,
    /// Hard bound on vision iterations per job.
    pub max_steps: u32,
    /// Public web base URL, used in user-facing copy.
    pub base_url: String,
    /// Operator public key (64-hex), when configured.
    pub operator_npub: Option<String>,
    /// Coordinator push-channel sender key (64-hex), when configured.
    pub push_npub: Option<String>,
    /// Orchestrator SQLite path; defaults next to the env files.
    pub db_path: Option<String>,
    /// Messaging relays, comma-separated as configured.
    pub relays: Vec<String>,
    /// Messaging identity key material (opaque to this crate).
    pub identity_key: Option<String>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            upstream_url: "http://127.0.0.1:8420".to_string(),
            hmac_secret: String::new(),
            orchestrator_bind: "0.0.0.0:8422".to_string(),
            orchestrator_url: "http://127.0.0.1:8422".to_string(),
            agent_bind: "0.0.0.0:8421".to_string(),
            agent_url: "http://127.0.0.1:8421".to_string(),
            max_concurrent_agent_jobs: 3,
            action_price_sats: 3000,
            otp_timeout: Duration::from_secs(900),
            payment_expiry: Duration::from_secs(86_400),
            outreach_interval: Duration::from_secs(172_800),
            last_chance_lead: Duration::from_secs(3 * 86_400),
            poll_interval: Duration::from_secs(30),
            reconcile_interval: Duration::from_secs(300),
            cleanup_interval: Duration::from_secs(3600),
            terminal_retention: Duration::from_secs(7 * 86_400),
            vision_url: String::new(),
            vision_key: String::new(),
            vision_model: "qwen3-vl-32b".to_string(),
            settle_delay: Duration::from_millis(2500),
            max_steps: 60,
            base_url: "https://subpilot.example".to_string(),
            operator_npub: None,
            push_npub: None,
            db_path: None,
            relays: Vec::new(),
            identity_key: None,
        }
    }
}

impl Config {
    /// Load configuration for the named component (`orchestrator`, `agent`).
    ///
    /// Reads the shared env file, overlays the component env file, then
    /// reads the process environment. Missing files are fine; a missing
    /// `HMAC_SECRET` is not.
    pub fn load(component: &str) -> anyhow::Result<Self> {
        let dir = config_dir();
        let shared = dir.join("shared.env");
        if shared.exists() {
            dotenvy::from_path(&shared).ok();
        }
        let component_env = dir.join(format!("{component}.env"));
        if component_env.exists() {
            dotenvy::from_path_override(&component_env).ok();
        }
        Self::from_env()
    }

    /// Build configuration from the current process environment only.
    pub fn from_env() -> anyhow::Result<Self> {
        let defaults = Self::default();
        let cfg = Self {
            upstream_url: env_string("UPSTREAM_URL", &defaults.upstream_url),
            hmac_secret: env_string("HMAC_SECRET", ""),
            orchestrator_bind: env_string("ORCHESTRATOR_BIND", &defaults.orchestrator_bind),
            orchestrator_url: env_string("ORCHESTRATOR_URL", &defaults.orchestrator_url),
            agent_bind: env_string("AGENT_BIND", &defaults.agent_bind),
            agent_url: env_string("AGENT_URL", &defaults.agent_url),
            max_concurrent_agent_jobs: env_parse(
                "MAX_CONCURRENT_AGENT_JOBS",
                defaults.max_concurrent_agent_jobs,
            )?,
            action_price_sats: env_parse("ACTION_PRICE_SATS", defaults.action_price_sats)?,
            otp_timeout: env_seconds("OTP_TIMEOUT_SECONDS", defaults.otp_timeout)?,
            payment_expiry: env_seconds("PAYMENT_EXPIRY_SECONDS", defaults.payment_expiry)?,
            outreach_interval: env_seconds(
                "OUTREACH_INTERVAL_SECONDS",
                defaults.outreach_interval,
            )?,
            last_chance_lead: env_seconds(
                "LAST_CHANCE_LEAD_SECONDS",
                defaults.last_chance_lead,
            )?,
            poll_interval: env_seconds("POLL_INTERVAL_SECONDS", defaults.poll_interval)?,
            reconcile_interval: env_seconds(
                "RECONCILE_INTERVAL_SECONDS",
                defaults.reconcile_interval,
            )?,
            cleanup_interval: env_seconds("CLEANUP_INTERVAL_SECONDS", defaults.cleanup_interval)?,
            terminal_retention: env_seconds(
                "TERMINAL_RETENTION_SECONDS",
                defaults.terminal_retention,
            )?,
            vision_url: env_string("VLM_URL", ""),
            vision_key: env_string("VLM_KEY", ""),
            vision_model: env_string("VLM_MODEL", &defaults.vision_model),
            settle_delay: Duration::from_millis(env_parse(
                "AGENT_SETTLE_DELAY_MS",
                defaults.settle_delay.as_millis() as u64,
            )?),
            max_steps: env_parse("AGENT_MAX_STEPS", defaults.max_steps)?,
            base_url: env_string("BASE_URL", &defaults.base_url),
            operator_npub: std::env::var("OPERATOR_NPUB").ok().filter(|v| !v.is_empty()),
            push_npub: std::env::var("UPSTREAM_PUSH_NPUB").ok().filter(|v| !v.is_empty()),
            db_path: std::env::var("ORCHESTRATOR_DB").ok().filter(|v| !v.is_empty()),
            relays: env_string("NOSTR_RELAYS", "")
                .split(',')
                .map(str::trim)
                .filter(|r| !r.is_empty())
                .map(str::to_string)
                .collect(),
            identity_key: std::env::var("NOSTR_NSEC").ok().filter(|v| !v.is_empty()),
        };

        if cfg.hmac_secret.is_empty() {
            anyhow::bail!("HMAC_SECRET is not set");
        }
        if cfg.max_concurrent_agent_jobs == 0 {
            anyhow::bail!("MAX_CONCURRENT_AGENT_JOBS must be >= 1");
        }
        Ok(cfg)
    }
}

/// The shared configuration/state directory (`$SUBPILOT_DIR` or
/// `~/.subpilot`).
pub fn config_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os("SUBPILOT_DIR") {
        return PathBuf::from(dir);
    }
    let home = std::env::var_os("HOME").unwrap_or_default();
    PathBuf::from(home).join(".subpilot")
}

fn env_string(key: &str, default: &str) -> String {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v.trim().to_string(),
        _ => default.to_string(),
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T> {
    match std::env::var(key) {
        Ok(v) if !v.trim().is_empty() => v
            .trim()
            .parse()
            .map_err(|_| anyhow::anyhow!("invalid {key}: {v:?}")),
        _ => Ok(default),
    }
}

fn env_seconds(key: &str, default: Duration) -> anyhow::Result<Duration> {
    Ok(Duration::from_secs(env_parse(key, default.as_secs())?))
}
