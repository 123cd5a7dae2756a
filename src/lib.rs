//! taskbroker: runs one orchestrated job at a time.
//!
//! A job is brokered in four steps: its start is reported to the
//! orchestrator, input artifacts are staged into a workspace, the payload
//! runs there, and outputs are published before the terminal status goes
//! out. See [`broker::Broker`].

pub mod artifacts;
pub mod broker;
pub mod config;
pub mod error;
pub mod observability;
pub mod orchestrator;
