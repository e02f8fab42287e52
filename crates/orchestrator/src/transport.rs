//! Messaging transport seam.
//!
//! The encrypted relay transport (key handling, NIP encryption, relay
//! pools) lives outside this repository. The orchestrator only needs two
//! things from it: deliver a DM to an npub, and hand inbound plaintext to
//! the router. `Outbox` wraps delivery with the persistent message log;
//! everything written to the log passes through code redaction first.

use std::sync::Arc;

use async_trait::async_trait;

use crate::db::Db;

/// Delivers plaintext DMs over the encrypted transport.
#[async_trait]
pub trait Messenger: Send + Sync {
    async fn send_dm(&self, npub: &str, text: &str) -> anyhow::Result<()>;
}

/// Messenger for development and tests without a relay connection: logs the
/// outbound DM and drops it.
pub struct LogMessenger;

#[async_trait]
impl Messenger for LogMessenger {
    async fn send_dm(&self, npub: &str, text: &str) -> anyhow::Result<()> {
        tracing::info!(npub = %&npub[..npub.len().min(16)], "outbound dm: {text}");
        Ok(())
    }
}

/// Outbound DM path: log (redacted), then deliver.
///
/// Delivery failures are logged and swallowed; a flaky relay must not wedge
/// a session transition that already happened.
#[derive(Clone)]
pub struct Outbox {
    db: Db,
    messenger: Arc<dyn Messenger>,
    operator_npub: Option<String>,
}

impl Outbox {
    pub fn new(db: Db, messenger: Arc<dyn Messenger>, operator_npub: Option<String>) -> Self {
        Self {
            db,
            messenger,
            operator_npub,
        }
    }

    /// Send a DM to a user.
    pub async fn send_dm(&self, npub: &str, text: &str) {
        if let Err(err) = self.db.log_message(npub, "out", text).await {
            tracing::warn!("failed to log outbound dm: {err:#}");
        }
        if let Err(err) = self.messenger.send_dm(npub, text).await {
            tracing::error!(npub = %&npub[..npub.len().min(16)], "failed to send dm: {err:#}");
        }
    }

    /// Send a DM to the operator, if one is configured.
    pub async fn send_operator_dm(&self, text: &str) {
        let Some(operator) = &self.operator_npub else {
            tracing::warn!("no operator configured, dropping operator dm: {text}");
            return;
        };
        let operator = operator.clone();
        self.send_dm(&operator, text).await;
    }

    /// Record an inbound DM in the message log (redacted).
    pub async fn record_inbound(&self, npub: &str, text: &str) {
        if let Err(err) = self.db.log_message(npub, "in", text).await {
            tracing::warn!("failed to log inbound dm: {err:#}");
        }
    }
}
