//! The agent prelude — a single import for embedding hosts.
//!
//! ```rust
//! use fap_agent::prelude::*;
//! ```

// Entry points
pub use crate::agent::Agent;
pub use crate::config::AgentConfig;
pub use crate::error::AgentError;

// The port an adapter implements, and its vocabulary
pub use crate::bridge::{
    ActionPayload, ActionSet, BridgeElement, BridgeNode, HostBridge, InputAction, NodeFlags,
    PointerEvent, PointerKind, PointerPhase, TextChannelCall,
};
pub use crate::bridge::{ErrorSource, FrameTiming, HostError, RouteEvent};

// Widget capability registration
pub use crate::registry::{CapabilityRegistry, TextEditorCapability};

// Geometry, re-exported from the accessibility schema the bridge speaks
pub use accesskit::{Action, Affine, Point, Rect, Vec2};
