//! The host bridge port.
//!
//! Everything the agent needs from the embedding UI toolkit is expressed as
//! the [`HostBridge`] trait: accessibility and element tree traversal,
//! synthetic input dispatch, screenshot rendering, and the subscription
//! hooks that feed the observability buffers. One adapter is written per
//! host toolkit; the core never talks to the toolkit directly.
//!
//! Thread safety: the RPC server runs on a background runtime while the
//! host's UI loop owns the real trees, so adapters must be `Send + Sync`
//! and internally marshal onto the UI thread where their toolkit requires
//! it (the same arrangement the AccessKit platform adapters use).

use accesskit::{Action, Affine, Point, Rect, Vec2};

use crate::error::AgentError;

// ============================================================================
// Action sets
// ============================================================================

/// Actions the serializer knows how to name on the wire.
///
/// Kept in traversal-friendly order; iteration over a set yields this order.
pub(crate) const NAMED_ACTIONS: &[(Action, &str)] = &[
    (Action::Click, "tap"),
    (Action::Focus, "focus"),
    (Action::ScrollUp, "scrollUp"),
    (Action::ScrollDown, "scrollDown"),
    (Action::ScrollLeft, "scrollLeft"),
    (Action::ScrollRight, "scrollRight"),
    (Action::SetValue, "setText"),
    (Action::SetTextSelection, "setSelection"),
    (Action::Increment, "increment"),
    (Action::Decrement, "decrement"),
];

/// A compact bitset over [`accesskit::Action`].
///
/// Host nodes declare which actions they support; the indexer derives
/// interactability from this and the executor checks it before invoking
/// accessibility fallbacks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ActionSet(u32);

impl ActionSet {
    pub const EMPTY: ActionSet = ActionSet(0);

    #[inline]
    pub fn insert(&mut self, action: Action) -> &mut Self {
        self.0 |= 1 << (action as u32);
        self
    }

    #[inline]
    pub fn contains(&self, action: Action) -> bool {
        self.0 & (1 << (action as u32)) != 0
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.0 == 0
    }

    /// The wire names of the contained actions, in declaration order.
    pub fn names(&self) -> Vec<&'static str> {
        NAMED_ACTIONS
            .iter()
            .filter(|(action, _)| self.contains(*action))
            .map(|(_, name)| *name)
            .collect()
    }
}

impl FromIterator<Action> for ActionSet {
    fn from_iter<I: IntoIterator<Item = Action>>(iter: I) -> Self {
        let mut set = ActionSet::EMPTY;
        for action in iter {
            set.insert(action);
        }
        set
    }
}

// ============================================================================
// Tree records
// ============================================================================

/// Boolean state of an accessibility node, flattened out of the host's
/// flag bitset. Only the flags the core consumes are carried.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NodeFlags {
    pub is_button: bool,
    pub is_text_field: bool,
    pub is_invisible: bool,
    pub is_focusable: bool,
    /// Text fields that accept literal newlines instead of an input action.
    pub is_multiline: bool,
}

/// One accessibility node as reported by the host.
///
/// `rect` is in the node's local coordinate space; traversal supplies the
/// composed local-to-global transform alongside.
#[derive(Debug, Clone)]
pub struct BridgeNode {
    /// Host identifier, stable within a frame only.
    pub node_id: u64,
    pub rect: Rect,
    pub label: Option<String>,
    pub value: Option<String>,
    pub hint: Option<String>,
    pub tooltip: Option<String>,
    pub actions: ActionSet,
    pub flags: NodeFlags,
}

/// One element-tree entry as reported by the host.
///
/// The element tree is consulted only to enrich accessibility nodes with
/// the widget runtime type, the developer-assigned key, and any custom
/// metadata attached via the host-side annotation wrapper.
#[derive(Debug, Clone)]
pub struct BridgeElement {
    pub type_name: String,
    /// Developer key, still in the toolkit's textual wrapper (`[<'…'>]`);
    /// the indexer unwraps it.
    pub key: Option<String>,
    /// Back-reference to the accessibility node this element produced.
    pub node_id: Option<u64>,
    /// Custom key/value pairs from annotation wrappers, if any.
    pub metadata: Vec<(String, String)>,
}

// ============================================================================
// Input dispatch
// ============================================================================

/// Device kind of a synthetic pointer event. Long-press handlers commonly
/// inspect this, so the executor picks touch for holds and mouse otherwise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerKind {
    Touch,
    Mouse,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PointerPhase {
    Hover,
    Down,
    Move,
    Up,
}

/// A low-level pointer event routed through the host's gesture subsystem.
#[derive(Debug, Clone, Copy)]
pub struct PointerEvent {
    pub kind: PointerKind,
    pub phase: PointerPhase,
    pub position: Point,
    pub pointer_id: u64,
    /// Button mask; bit 0 is the primary button.
    pub buttons: u32,
    /// Movement since the previous event of this pointer.
    pub delta: Vec2,
}

/// Payload accompanying an accessibility action invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum ActionPayload {
    None,
    SetText(String),
    SetSelection { base: usize, extent: usize },
}

/// An incoming call on the host's text-input channel, simulating what the
/// platform keyboard would send. Injection is only valid while the host has
/// an active input connection.
#[derive(Debug, Clone, PartialEq)]
pub enum TextChannelCall {
    /// Replace the editing state wholesale: full text plus caret.
    SetEditingState {
        text: String,
        selection_base: i64,
        selection_extent: i64,
    },
    /// Fire the field's input action (what the enter key does).
    PerformAction(InputAction),
}

/// The input actions a text field can be configured with.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum InputAction {
    #[default]
    Done,
    Next,
    Search,
    Send,
    /// Multi-line fields: insert a literal newline instead.
    Newline,
}

impl InputAction {
    /// The host channel's identifier for this action.
    pub fn channel_name(&self) -> &'static str {
        match self {
            InputAction::Done => "done",
            InputAction::Next => "next",
            InputAction::Search => "search",
            InputAction::Send => "send",
            InputAction::Newline => "newline",
        }
    }
}

// ============================================================================
// Observability events
// ============================================================================

/// Where a captured error came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorSource {
    /// The host framework's error handler (build/layout/paint exceptions).
    Framework,
    /// An unhandled error escaping an async task.
    AsyncTask,
}

/// An error reported by the host's error handler.
#[derive(Debug, Clone)]
pub struct HostError {
    pub source: ErrorSource,
    pub message: String,
    pub stack: Option<String>,
}

/// One frame's timing as reported by the host's frame-timing callback.
#[derive(Debug, Clone, Copy)]
pub struct FrameTiming {
    pub build_micros: u64,
    pub raster_micros: u64,
    pub total_micros: u64,
}

/// A navigation event from the host's route observer.
#[derive(Debug, Clone)]
pub enum RouteEvent {
    Pushed(String),
    Popped,
    Replaced(String),
}

pub type ErrorCallback = Box<dyn Fn(HostError) + Send>;
pub type LogCallback = Box<dyn Fn(String) + Send>;
pub type FrameTimingCallback = Box<dyn Fn(FrameTiming) + Send>;
pub type RouteCallback = Box<dyn Fn(RouteEvent) + Send>;
/// Raw pointer-up reports used by gesture recording.
pub type PointerUpCallback = Box<dyn Fn(Point) + Send>;

// ============================================================================
// The port
// ============================================================================

/// The complete set of host capabilities the core consumes.
///
/// Traversals are pre-order. `traverse_accessibility` visits every visible
/// node from every root view, composing transforms along the way; invisible
/// nodes are skipped but their descendants still visited, mirroring the
/// host's own semantics. `depth` lets the caller rebuild parent chains with
/// a stack, so adapters never hand out tree references.
pub trait HostBridge: Send + Sync {
    /// Visit `(node, composed_transform, depth)` for each visible node.
    fn traverse_accessibility(&self, visitor: &mut dyn FnMut(&BridgeNode, Affine, usize));

    /// Visit `(element, depth)` for each element in the element tree.
    fn traverse_elements(&self, visitor: &mut dyn FnMut(&BridgeElement, usize));

    /// Invoke a host accessibility action on a node.
    ///
    /// Fails with [`AgentError::ActionNotSupported`] when the node does not
    /// declare the action.
    fn perform_accessibility_action(
        &self,
        node_id: u64,
        action: Action,
        payload: &ActionPayload,
    ) -> Result<(), AgentError>;

    /// Deliver a pointer event through the host's gesture subsystem.
    /// Dispatch itself never fails; a miss simply has no visible effect.
    fn dispatch_pointer(&self, event: PointerEvent);

    /// Deliver an incoming text-input-channel call. Returning `Ok` means the
    /// host has acknowledged the editing state; callers rely on this for
    /// ordering between consecutive updates.
    fn inject_text_channel(&self, call: &TextChannelCall) -> Result<(), AgentError>;

    /// Render the topmost repaint boundary to PNG bytes.
    fn capture_image(&self, pixel_ratio: f64) -> Result<Vec<u8>, AgentError>;

    /// Reference-counted accessibility activation. Hosts keep the subsystem
    /// dormant until a driver is present; the server calls this on the first
    /// accepted connection.
    fn ensure_accessibility_active(&self);
    fn release_accessibility(&self);

    // Subscription hooks, attached once at agent init.
    fn register_frame_timings(&self, callback: FrameTimingCallback);
    fn register_error_handler(&self, callback: ErrorCallback);
    fn register_log_handler(&self, callback: LogCallback);
    fn register_route_observer(&self, callback: RouteCallback);
    fn register_pointer_observer(&self, callback: PointerUpCallback);
}
