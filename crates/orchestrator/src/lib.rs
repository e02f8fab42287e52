#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Orchestrator for `subpilot`: claims jobs from the upstream coordinator,
//! drives per-user conversations over the messaging transport, dispatches
//! browser automations to agent workers, and bills on success.

pub mod agent_client;
pub mod db;
pub mod inbound;
pub mod job_manager;
pub mod messages;
pub mod push;
pub mod server;
pub mod session;
pub mod timers;
pub mod transport;
pub mod upstream;
