//! Agent configuration.
//!
//! Constructed host-side with the closure-builder pattern:
//!
//! ```ignore
//! let agent = Agent::init(bridge, |cfg| cfg.port(9001).auth_token("s3cret"));
//! ```
//!
//! Two environment variables interact with the configuration at start time:
//! `FAP_AGENT_HOST` overrides the bind interface (unresolvable values warn
//! and fall back to loopback) and `FAP_AGENT_ENABLED` set to a falsy value
//! is a kill switch that disables the server regardless of configuration.

use std::time::Duration;

use crate::actions::ActionTimings;
use crate::bridge::InputAction;
use crate::indexer::{CACHE_CAP, CACHE_TTL};
use crate::observe::{DEFAULT_BUFFER_CAP, DEFAULT_ERROR_CAP};

/// Bind-interface override.
pub const ENV_HOST: &str = "FAP_AGENT_HOST";
/// Kill switch: `0`, `false`, `no` or `off` disables the server outright;
/// any other value force-enables it.
pub const ENV_ENABLED: &str = "FAP_AGENT_ENABLED";

pub const DEFAULT_PORT: u16 = 9001;

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Whether the server starts at all. Defaults to debug builds only;
    /// production deployments must opt in explicitly.
    pub enabled: bool,
    pub port: u16,
    /// Shared bearer token; `None` accepts every local connection.
    pub auth_token: Option<String>,
    /// Input action fired for `\n` on single-line fields.
    pub input_action: InputAction,
    pub timings: ActionTimings,
    pub cache_ttl: Duration,
    pub cache_cap: usize,
    pub error_buffer_cap: usize,
    pub log_buffer_cap: usize,
    pub timing_buffer_cap: usize,
    /// Pixel ratio passed to screenshot capture.
    pub screenshot_pixel_ratio: f64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            enabled: cfg!(debug_assertions),
            port: DEFAULT_PORT,
            auth_token: None,
            input_action: InputAction::Done,
            timings: ActionTimings::default(),
            cache_ttl: CACHE_TTL,
            cache_cap: CACHE_CAP,
            error_buffer_cap: DEFAULT_ERROR_CAP,
            log_buffer_cap: DEFAULT_BUFFER_CAP,
            timing_buffer_cap: DEFAULT_BUFFER_CAP,
            screenshot_pixel_ratio: 1.0,
        }
    }
}

impl AgentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Force the server on, release builds included.
    pub fn enable(&mut self) -> &mut Self {
        self.enabled = true;
        self
    }

    pub fn disable(&mut self) -> &mut Self {
        self.enabled = false;
        self
    }

    pub fn port(&mut self, port: u16) -> &mut Self {
        self.port = port;
        self
    }

    /// Require `Authorization: Bearer <token>` on the handshake.
    pub fn auth_token(&mut self, token: &str) -> &mut Self {
        self.auth_token = Some(token.to_string());
        self
    }

    pub fn input_action(&mut self, action: InputAction) -> &mut Self {
        self.input_action = action;
        self
    }

    pub fn long_press_hold(&mut self, hold: Duration) -> &mut Self {
        self.timings.long_press_hold = hold;
        self
    }

    pub fn drag_duration(&mut self, duration: Duration) -> &mut Self {
        self.timings.drag_duration = duration;
        self
    }

    pub fn cache_ttl(&mut self, ttl: Duration) -> &mut Self {
        self.cache_ttl = ttl;
        self
    }

    pub fn screenshot_pixel_ratio(&mut self, ratio: f64) -> &mut Self {
        self.screenshot_pixel_ratio = ratio;
        self
    }

    /// The effective on/off decision once the kill switch is consulted.
    pub fn effectively_enabled(&self) -> bool {
        match std::env::var(ENV_ENABLED) {
            Ok(value) => is_truthy(&value),
            Err(_) => self.enabled,
        }
    }

    /// The configured bind host: the env override when set, else loopback.
    /// Resolution failures are handled (with a warning) at bind time.
    pub fn bind_host(&self) -> String {
        std::env::var(ENV_HOST).unwrap_or_else(|_| "127.0.0.1".to_string())
    }
}

/// Kill-switch value parsing: `0`, `false`, `no` and `off` disable.
fn is_truthy(value: &str) -> bool {
    !matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "0" | "false" | "no" | "off"
    )
}
