#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Shared types for the `subpilot` components (job model, configuration,
//! request signing, message redaction).

/// Job, session, and timer model shared by the orchestrator and the agent.
pub mod jobs;

/// Layered environment configuration.
pub mod config;

/// HMAC request signing and verification for inter-component RPC.
pub mod signing;

/// One-time-code redaction for message logging.
pub mod redact;

pub use jobs::{Action, Job, JobStatus, SessionState, TimerType, Trigger};
