//! In-process UI automation agent and remote-control protocol.
//!
//! Client-rendered UI toolkits hide their structure from DOM-based
//! automation. This crate embeds an agent inside the host application that
//! exposes the live UI through the host's accessibility and inspection
//! facilities: drivers (test scripts, AI agents, editor tooling) connect
//! over a local WebSocket, query the indexed tree with selectors, issue
//! synthetic input, and observe errors, logs and frame timings.
//!
//! The host toolkit is abstracted behind [`bridge::HostBridge`]; one
//! adapter is written per toolkit. Everything else is toolkit-agnostic:
//!
//! - [`indexer`] snapshots the accessibility tree, enriches it from the
//!   element tree, and bridges accessibility-reactivation gaps with a
//!   short-TTL cache.
//! - [`selector`] parses and evaluates the query language
//!   (`Button[text="Save"]`, `#submit_btn`, `Column > Text`).
//! - [`actions`] turns resolved targets into paced pointer sequences,
//!   accessibility actions, and text-channel keyboard simulation.
//! - [`observe`] buffers captured errors, log lines and frame timings.
//! - [`server`] speaks the framed JSON protocol over WebSocket, with
//!   bearer-token auth and gzip compression of large payloads.
//!
//! Embedding is three calls:
//!
//! ```ignore
//! let bridge: Arc<dyn HostBridge> = Arc::new(MyToolkitAdapter::new());
//! let mut agent = Agent::init(bridge, |cfg| cfg.auth_token("s3cret"));
//! agent.start()?;
//! ```

pub mod actions;
pub mod agent;
pub mod bridge;
pub mod config;
pub mod error;
pub mod indexer;
pub mod observe;
pub mod prelude;
pub mod recording;
pub mod registry;
pub mod selector;
pub mod server;

#[cfg(test)]
pub(crate) mod testutil;

pub use agent::Agent;
pub use config::AgentConfig;
pub use error::AgentError;
