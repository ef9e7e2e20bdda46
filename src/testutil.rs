//! Scripted host bridge for tests.
//!
//! `FakeBridge` plays the role of a host adapter: a flat list of node and
//! element specs (pre-order, depth-tagged) is traversed on demand, and
//! every dispatch the agent performs is recorded for assertions. `set_empty`
//! simulates the host dropping its accessibility tree.

use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::sync::Mutex;

use accesskit::{Action, Affine, Point, Rect};

use crate::bridge::{
    ActionPayload, ActionSet, BridgeElement, BridgeNode, ErrorCallback, FrameTiming,
    FrameTimingCallback, HostBridge, HostError, LogCallback, NodeFlags, PointerEvent,
    PointerUpCallback, RouteCallback, RouteEvent, TextChannelCall,
};
use crate::error::AgentError;

/// Builder for one scripted accessibility node.
pub(crate) struct NodeSpec {
    node: BridgeNode,
    transform: Affine,
    depth: usize,
}

impl NodeSpec {
    pub(crate) fn new(node_id: u64, depth: usize) -> Self {
        Self {
            node: BridgeNode {
                node_id,
                rect: Rect::new(0.0, 0.0, 100.0, 40.0),
                label: None,
                value: None,
                hint: None,
                tooltip: None,
                actions: ActionSet::EMPTY,
                flags: NodeFlags::default(),
            },
            transform: Affine::IDENTITY,
            depth,
        }
    }

    pub(crate) fn rect(mut self, x0: f64, y0: f64, x1: f64, y1: f64) -> Self {
        self.node.rect = Rect::new(x0, y0, x1, y1);
        self
    }

    pub(crate) fn transform(mut self, transform: Affine) -> Self {
        self.transform = transform;
        self
    }

    pub(crate) fn label(mut self, label: &str) -> Self {
        self.node.label = Some(label.to_string());
        self
    }

    pub(crate) fn hint(mut self, hint: &str) -> Self {
        self.node.hint = Some(hint.to_string());
        self
    }

    pub(crate) fn action(mut self, action: Action) -> Self {
        self.node.actions.insert(action);
        self
    }

    pub(crate) fn button(mut self) -> Self {
        self.node.flags.is_button = true;
        self
    }

    pub(crate) fn text_field(mut self) -> Self {
        self.node.flags.is_text_field = true;
        self
    }

    pub(crate) fn invisible(mut self) -> Self {
        self.node.flags.is_invisible = true;
        self
    }
}

struct ElementSpec {
    element: BridgeElement,
    depth: usize,
}

#[derive(Default)]
struct Subscriptions {
    errors: Option<ErrorCallback>,
    logs: Option<LogCallback>,
    timings: Option<FrameTimingCallback>,
    routes: Option<RouteCallback>,
    pointer_ups: Option<PointerUpCallback>,
}

/// A scripted [`HostBridge`].
pub(crate) struct FakeBridge {
    nodes: Vec<NodeSpec>,
    elements: Vec<ElementSpec>,
    empty: AtomicBool,
    fail_text_channel: AtomicBool,
    capture: Option<Vec<u8>>,
    active_count: AtomicI32,
    pointer_log: Mutex<Vec<PointerEvent>>,
    action_log: Mutex<Vec<(u64, Action, ActionPayload)>>,
    text_log: Mutex<Vec<TextChannelCall>>,
    /// Values written through the set-text action, reflected by traversal
    /// like a real host field would be.
    value_overrides: Mutex<std::collections::HashMap<u64, String>>,
    subscriptions: Mutex<Subscriptions>,
}

impl FakeBridge {
    pub(crate) fn new() -> Self {
        Self {
            nodes: Vec::new(),
            elements: Vec::new(),
            empty: AtomicBool::new(false),
            fail_text_channel: AtomicBool::new(false),
            capture: Some(b"\x89PNG\r\n\x1a\nfakepixels".to_vec()),
            active_count: AtomicI32::new(0),
            pointer_log: Mutex::new(Vec::new()),
            action_log: Mutex::new(Vec::new()),
            text_log: Mutex::new(Vec::new()),
            value_overrides: Mutex::new(std::collections::HashMap::new()),
            subscriptions: Mutex::new(Subscriptions::default()),
        }
    }

    pub(crate) fn node(mut self, spec: NodeSpec) -> Self {
        self.nodes.push(spec);
        self
    }

    pub(crate) fn element(
        self,
        type_name: &str,
        key: Option<&str>,
        node_id: Option<u64>,
        depth: usize,
    ) -> Self {
        self.element_with(type_name, key, node_id, depth, &[])
    }

    pub(crate) fn element_with(
        mut self,
        type_name: &str,
        key: Option<&str>,
        node_id: Option<u64>,
        depth: usize,
        metadata: &[(&str, &str)],
    ) -> Self {
        self.elements.push(ElementSpec {
            element: BridgeElement {
                type_name: type_name.to_string(),
                key: key.map(str::to_string),
                node_id,
                metadata: metadata
                    .iter()
                    .map(|(k, v)| (k.to_string(), v.to_string()))
                    .collect(),
            },
            depth,
        });
        self
    }

    pub(crate) fn without_capture(mut self) -> Self {
        self.capture = None;
        self
    }

    /// Simulate the host dropping (or restoring) its accessibility tree.
    pub(crate) fn set_empty(&self, empty: bool) {
        self.empty.store(empty, Ordering::SeqCst);
    }

    pub(crate) fn set_text_channel_fails(&self, fails: bool) {
        self.fail_text_channel.store(fails, Ordering::SeqCst);
    }

    pub(crate) fn active_count(&self) -> i32 {
        self.active_count.load(Ordering::SeqCst)
    }

    pub(crate) fn pointer_events(&self) -> Vec<PointerEvent> {
        self.pointer_log.lock().unwrap().clone()
    }

    pub(crate) fn performed_actions(&self) -> Vec<(u64, Action, ActionPayload)> {
        self.action_log.lock().unwrap().clone()
    }

    pub(crate) fn text_calls(&self) -> Vec<TextChannelCall> {
        self.text_log.lock().unwrap().clone()
    }

    // -- host-side event injection -------------------------------------------

    pub(crate) fn emit_error(&self, error: HostError) {
        if let Some(cb) = &self.subscriptions.lock().unwrap().errors {
            cb(error);
        }
    }

    pub(crate) fn emit_log(&self, line: &str) {
        if let Some(cb) = &self.subscriptions.lock().unwrap().logs {
            cb(line.to_string());
        }
    }

    pub(crate) fn emit_timing(&self, timing: FrameTiming) {
        if let Some(cb) = &self.subscriptions.lock().unwrap().timings {
            cb(timing);
        }
    }

    pub(crate) fn emit_route(&self, event: RouteEvent) {
        if let Some(cb) = &self.subscriptions.lock().unwrap().routes {
            cb(event);
        }
    }

    pub(crate) fn emit_pointer_up(&self, position: Point) {
        if let Some(cb) = &self.subscriptions.lock().unwrap().pointer_ups {
            cb(position);
        }
    }
}

impl HostBridge for FakeBridge {
    fn traverse_accessibility(&self, visitor: &mut dyn FnMut(&BridgeNode, Affine, usize)) {
        if self.empty.load(Ordering::SeqCst) {
            return;
        }
        // Compose transforms down the depth-tagged pre-order list.
        let overrides = self.value_overrides.lock().unwrap().clone();
        let mut stack: Vec<(usize, Affine)> = Vec::new();
        for spec in &self.nodes {
            while stack.last().is_some_and(|&(d, _)| d >= spec.depth) {
                stack.pop();
            }
            let parent = stack.last().map(|&(_, t)| t).unwrap_or(Affine::IDENTITY);
            let composed = parent * spec.transform;
            match overrides.get(&spec.node.node_id) {
                Some(value) => {
                    let mut node = spec.node.clone();
                    node.value = Some(value.clone());
                    visitor(&node, composed, spec.depth);
                }
                None => visitor(&spec.node, composed, spec.depth),
            }
            stack.push((spec.depth, composed));
        }
    }

    fn traverse_elements(&self, visitor: &mut dyn FnMut(&BridgeElement, usize)) {
        if self.empty.load(Ordering::SeqCst) {
            return;
        }
        for spec in &self.elements {
            visitor(&spec.element, spec.depth);
        }
    }

    fn perform_accessibility_action(
        &self,
        node_id: u64,
        action: Action,
        payload: &ActionPayload,
    ) -> Result<(), AgentError> {
        let declared = self
            .nodes
            .iter()
            .find(|spec| spec.node.node_id == node_id)
            .map(|spec| spec.node.actions.contains(action))
            .unwrap_or(false);
        if !declared {
            return Err(AgentError::ActionNotSupported(action));
        }
        if let ActionPayload::SetText(text) = payload {
            self.value_overrides
                .lock()
                .unwrap()
                .insert(node_id, text.clone());
        }
        self.action_log
            .lock()
            .unwrap()
            .push((node_id, action, payload.clone()));
        Ok(())
    }

    fn dispatch_pointer(&self, event: PointerEvent) {
        self.pointer_log.lock().unwrap().push(event);
    }

    fn inject_text_channel(&self, call: &TextChannelCall) -> Result<(), AgentError> {
        if self.fail_text_channel.load(Ordering::SeqCst) {
            return Err(AgentError::WidgetAccess(
                "no active text input connection".to_string(),
            ));
        }
        self.text_log.lock().unwrap().push(call.clone());
        Ok(())
    }

    fn capture_image(&self, _pixel_ratio: f64) -> Result<Vec<u8>, AgentError> {
        self.capture.clone().ok_or_else(|| {
            AgentError::CaptureUnavailable("no repaint boundary".to_string())
        })
    }

    fn ensure_accessibility_active(&self) {
        self.active_count.fetch_add(1, Ordering::SeqCst);
    }

    fn release_accessibility(&self) {
        self.active_count.fetch_sub(1, Ordering::SeqCst);
    }

    fn register_frame_timings(&self, callback: FrameTimingCallback) {
        self.subscriptions.lock().unwrap().timings = Some(callback);
    }

    fn register_error_handler(&self, callback: ErrorCallback) {
        self.subscriptions.lock().unwrap().errors = Some(callback);
    }

    fn register_log_handler(&self, callback: LogCallback) {
        self.subscriptions.lock().unwrap().logs = Some(callback);
    }

    fn register_route_observer(&self, callback: RouteCallback) {
        self.subscriptions.lock().unwrap().routes = Some(callback);
    }

    fn register_pointer_observer(&self, callback: PointerUpCallback) {
        self.subscriptions.lock().unwrap().pointer_ups = Some(callback);
    }
}
