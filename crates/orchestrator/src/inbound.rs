//! Inbound DM routing.
//!
//! The transport bridge decrypts relay traffic and hands plaintext here.
//! Messages from the coordinator's push key go to the push handler; user
//! messages are routed by session state first (a user mid-challenge is
//! answering the challenge, whatever they type), then by keyword.

use std::sync::Arc;

use subpilot_core::jobs::SessionState;
use subpilot_core::redact::looks_like_otp;

use crate::job_manager::JobManager;
use crate::messages;
use crate::push;
use crate::session::SessionEngine;
use crate::transport::Outbox;

/// Routes decrypted inbound messages.
pub struct InboundRouter {
    session: Arc<SessionEngine>,
    manager: Arc<JobManager>,
    outbox: Outbox,
    push_npub: Option<String>,
}

impl InboundRouter {
    pub fn new(
        session: Arc<SessionEngine>,
        manager: Arc<JobManager>,
        outbox: Outbox,
        push_npub: Option<String>,
    ) -> Self {
        Self {
            session,
            manager,
            outbox,
            push_npub,
        }
    }

    /// Handle one decrypted message from the transport.
    pub async fn handle_message(&self, sender_npub: &str, text: &str) -> anyhow::Result<()> {
        if self.push_npub.as_deref() == Some(sender_npub) {
            return push::handle_push(&self.session, &self.manager, text).await;
        }
        self.handle_user_message(sender_npub, text).await
    }

    /// Handle one DM from a user.
    pub async fn handle_user_message(&self, user_npub: &str, text: &str) -> anyhow::Result<()> {
        // Log first (redacted), so the forensic trail survives whatever the
        // router decides.
        self.outbox.record_inbound(user_npub, text).await;

        let state = self.session.state_of(user_npub).await?;
        match state {
            SessionState::AwaitingOtp if looks_like_otp(text) => {
                let code: String = text.chars().filter(char::is_ascii_digit).collect();
                return self.session.handle_otp_input(user_npub, &code).await;
            }
            SessionState::AwaitingCredential if !is_command(text) => {
                return self
                    .session
                    .handle_credential_input(user_npub, text.trim())
                    .await;
            }
            _ => {}
        }

        match text.trim().to_lowercase().as_str() {
            "yes" | "y" => match self.manager.get_active_job_for_user(user_npub).await? {
                Some(job) => self.manager.request_dispatch(user_npub, &job.id).await?,
                None => self.outbox.send_dm(user_npub, &messages::nothing_active()).await,
            },
            "no" | "skip" => match self.manager.get_active_job_for_user(user_npub).await? {
                Some(job) => self.manager.handle_skip(user_npub, &job.id).await?,
                None => self.outbox.send_dm(user_npub, &messages::nothing_active()).await,
            },
            "snooze" | "later" => match self.manager.get_active_job_for_user(user_npub).await? {
                Some(job) => self.manager.handle_snooze(user_npub, &job.id).await?,
                None => self.outbox.send_dm(user_npub, &messages::nothing_active()).await,
            },
            "cancel" | "stop" => {
                if state != SessionState::Idle {
                    self.session.cancel_session(user_npub).await?;
                    self.outbox
                        .send_dm(user_npub, &messages::session_cancelled())
                        .await;
                } else {
                    self.outbox.send_dm(user_npub, &messages::nothing_active()).await;
                }
            }
            _ => {
                self.outbox.send_dm(user_npub, &messages::help()).await;
            }
        }
        Ok(())
    }
}

// A credential reply can be almost anything, but bare control words still
// mean what they say.
fn is_command(text: &str) -> bool {
    matches!(
        text.trim().to_lowercase().as_str(),
        "cancel" | "stop" | "help"
    )
}
