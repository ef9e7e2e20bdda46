//! The widget capability registry.
//!
//! The host adapter registers, at agent init, a small table mapping widget
//! type names to typed extractors — "this type exposes a text editor; here
//! is how to read and write it". The action executor consults the table by
//! type name when an element declares no accessibility text action; unknown
//! types decline gracefully instead of attempting speculative access.

use rustc_hash::FxHashMap;

use crate::error::AgentError;

pub type TextReader = Box<dyn Fn(u64) -> Result<String, AgentError> + Send + Sync>;
pub type TextWriter = Box<dyn Fn(u64, &str) -> Result<(), AgentError> + Send + Sync>;

/// How to read and write the text controller of one widget type. The
/// functions receive the accessibility-node id of the target element.
pub struct TextEditorCapability {
    pub read: Option<TextReader>,
    pub write: TextWriter,
}

/// Capability table keyed by widget runtime type name.
#[derive(Default)]
pub struct CapabilityRegistry {
    text_editors: FxHashMap<String, TextEditorCapability>,
}

impl CapabilityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Declare that `type_name` exposes a text editor.
    pub fn register_text_editor(&mut self, type_name: &str, capability: TextEditorCapability) {
        self.text_editors.insert(type_name.to_string(), capability);
    }

    /// The text-editor capability for a widget type, if one was registered.
    pub fn text_editor(&self, type_name: &str) -> Option<&TextEditorCapability> {
        self.text_editors.get(type_name)
    }
}
