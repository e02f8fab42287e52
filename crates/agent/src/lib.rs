#![forbid(unsafe_code)]
#![deny(unreachable_pub)]

//! Automation agent for `subpilot`: accepts browser jobs over HTTP, runs a
//! bounded pool of vision-driven browser sessions, relays interactive
//! challenges back to the orchestrator, and reports results.

pub mod browser;
pub mod executor;
pub mod input;
pub mod registry;
pub mod report;
pub mod server;
pub mod stuck;
pub mod vision;
