//! Upstream push notifications.
//!
//! The coordinator pushes `{type, data}` JSON over the encrypted channel.
//! Pushes are advisory: anything missed here is recovered by the periodic
//! reconciliation pull.

use serde::Deserialize;

use crate::job_manager::JobManager;
use crate::session::SessionEngine;

#[derive(Debug, Deserialize)]
struct PushEnvelope {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    data: serde_json::Value,
}

#[derive(Debug, Deserialize)]
struct PaymentReceived {
    job_id: String,
    #[serde(default)]
    amount_sats: u64,
}

#[derive(Debug, Deserialize)]
struct JobRef {
    job_id: String,
}

/// Handle one push payload. Non-JSON and unknown types are ignored.
pub async fn handle_push(
    session: &SessionEngine,
    manager: &JobManager,
    raw: &str,
) -> anyhow::Result<()> {
    let envelope: PushEnvelope = match serde_json::from_str(raw) {
        Ok(envelope) => envelope,
        Err(_) => {
            tracing::debug!("ignoring non-JSON push: {:.80}", raw);
            return Ok(());
        }
    };

    match envelope.kind.as_str() {
        "job_payment_received" => {
            let data: PaymentReceived = serde_json::from_value(envelope.data)?;
            session
                .handle_payment_received(&data.job_id, data.amount_sats)
                .await
        }
        "job_payment_expired" => {
            let data: JobRef = serde_json::from_value(envelope.data)?;
            session.handle_payment_expired(&data.job_id).await
        }
        "job_immediate" => {
            let data: JobRef = serde_json::from_value(envelope.data)?;
            manager.mark_immediate(&data.job_id);
            manager.send_outreach(&data.job_id).await
        }
        // The audio product line and invite flow belong to other processes.
        "audio_payment_received" | "invite_ready" => {
            tracing::debug!(kind = %envelope.kind, "push type handled elsewhere");
            Ok(())
        }
        other => {
            tracing::debug!(kind = %other, "unknown push type");
            Ok(())
        }
    }
}
