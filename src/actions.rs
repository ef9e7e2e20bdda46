//! The action executor.
//!
//! Translates resolved targets into synthetic input: paced pointer
//! sequences for taps, holds and drags; accessibility actions for text;
//! text-channel keyboard simulation as the last resort. Tap-like gestures
//! carry an accessibility fallback so hit-test-tricky targets (off-by-pixel
//! rects, overlay interception, non-visual buttons) still activate.
//!
//! Timing pauses are the only suspension points; callers pass target data
//! by value, so nothing borrows the indexed snapshot across an await.

use std::time::Duration;

use accesskit::{Action, Point, Rect, Vec2};
use serde::Serialize;
use tokio::time::sleep;
use tracing::{debug, warn};

use crate::bridge::{
    ActionPayload, ActionSet, HostBridge, InputAction, NodeFlags, PointerEvent, PointerKind,
    PointerPhase, TextChannelCall,
};
use crate::error::AgentError;
use crate::indexer::IndexedElement;
use crate::registry::CapabilityRegistry;

/// `accesskit::Rect` has no `center()` in this version; geometric midpoint.
trait RectExt {
    fn center(&self) -> Point;
}

impl RectExt for Rect {
    fn center(&self) -> Point {
        Point::new((self.x0 + self.x1) / 2.0, (self.y0 + self.y1) / 2.0)
    }
}

/// Synthetic pointer id; one pointer is enough for sequential gestures.
const POINTER_ID: u64 = 1;

/// Primary-button mask while pressed.
const PRIMARY_BUTTON: u32 = 1;

/// Pacing configuration with the protocol's default timings.
#[derive(Debug, Clone)]
pub struct ActionTimings {
    /// Hover settling before the press.
    pub tap_settle: Duration,
    /// Down-to-up hold for a tap.
    pub tap_hold: Duration,
    /// Gap between the two taps of a double tap.
    pub double_tap_gap: Duration,
    pub long_press_hold: Duration,
    pub drag_duration: Duration,
    pub drag_steps: u32,
}

impl Default for ActionTimings {
    fn default() -> Self {
        Self {
            tap_settle: Duration::from_millis(50),
            tap_hold: Duration::from_millis(100),
            double_tap_gap: Duration::from_millis(100),
            long_press_hold: Duration::from_millis(800),
            drag_duration: Duration::from_millis(300),
            drag_steps: 20,
        }
    }
}

/// The element data an action needs, detached from the snapshot so no
/// indexed state is held across suspension points.
#[derive(Debug, Clone)]
pub struct ResolvedTarget {
    pub fap_id: String,
    pub node_id: u64,
    pub rect: Rect,
    pub actions: ActionSet,
    pub flags: NodeFlags,
    pub type_name: Option<String>,
    pub is_interactable: bool,
}

impl From<&IndexedElement> for ResolvedTarget {
    fn from(elem: &IndexedElement) -> Self {
        Self {
            fap_id: elem.fap_id.clone(),
            node_id: elem.node_id,
            rect: elem.global_rect,
            actions: elem.actions,
            flags: elem.flags,
            type_name: elem.type_name.clone(),
            is_interactable: elem.is_interactable(),
        }
    }
}

/// Diagnostics returned from tap-like gestures.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct TapReport {
    pub center: WirePoint,
}

#[derive(Debug, Clone, Copy, Serialize)]
pub struct WirePoint {
    pub x: f64,
    pub y: f64,
}

impl From<Point> for WirePoint {
    fn from(p: Point) -> Self {
        Self { x: p.x, y: p.y }
    }
}

/// Which path a text write took.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TextPath {
    Accessibility,
    Registry,
    Keyboard,
}

/// The executor. Stateless apart from its timing configuration; every call
/// receives the bridge and a detached target.
pub struct ActionExecutor {
    timings: ActionTimings,
}

impl ActionExecutor {
    pub fn new(timings: ActionTimings) -> Self {
        Self { timings }
    }

    fn ensure_interactable(&self, target: &ResolvedTarget) -> Result<(), AgentError> {
        if target.is_interactable {
            Ok(())
        } else {
            Err(AgentError::ElementNotInteractable(target.fap_id.clone()))
        }
    }

    fn pointer(
        &self,
        kind: PointerKind,
        phase: PointerPhase,
        position: Point,
        delta: Vec2,
    ) -> PointerEvent {
        let buttons = match phase {
            PointerPhase::Down | PointerPhase::Move => PRIMARY_BUTTON,
            PointerPhase::Hover | PointerPhase::Up => 0,
        };
        PointerEvent {
            kind,
            phase,
            position,
            pointer_id: POINTER_ID,
            buttons,
            delta,
        }
    }

    /// The tap pointer sequence: hover, settle, down, hold, up.
    async fn tap_sequence(&self, bridge: &dyn HostBridge, center: Point) {
        bridge.dispatch_pointer(self.pointer(
            PointerKind::Mouse,
            PointerPhase::Hover,
            center,
            Vec2::new(0.0, 0.0),
        ));
        sleep(self.timings.tap_settle).await;
        bridge.dispatch_pointer(self.pointer(
            PointerKind::Mouse,
            PointerPhase::Down,
            center,
            Vec2::new(0.0, 0.0),
        ));
        sleep(self.timings.tap_hold).await;
        bridge.dispatch_pointer(self.pointer(
            PointerKind::Mouse,
            PointerPhase::Up,
            center,
            Vec2::new(0.0, 0.0),
        ));
    }

    /// Tap the target's center. When the node declares the tap action it is
    /// also invoked after the pointer sequence, guaranteeing activation
    /// when the synthetic pointer misses the widget's hit test.
    pub async fn tap(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
    ) -> Result<TapReport, AgentError> {
        self.ensure_interactable(target)?;
        let center = target.rect.center();
        self.tap_sequence(bridge, center).await;
        if target.actions.contains(Action::Click) {
            if let Err(err) =
                bridge.perform_accessibility_action(target.node_id, Action::Click, &ActionPayload::None)
            {
                // The pointer sequence already went out; the fallback is
                // best-effort diagnostics, not a failure.
                warn!(target = %target.fap_id, %err, "accessibility tap fallback failed");
            }
        }
        debug!(target = %target.fap_id, x = center.x, y = center.y, "tapped");
        Ok(TapReport {
            center: center.into(),
        })
    }

    /// Tap at a raw coordinate: same sequence, no accessibility fallback.
    pub async fn tap_at(&self, bridge: &dyn HostBridge, position: Point) -> TapReport {
        self.tap_sequence(bridge, position).await;
        TapReport {
            center: position.into(),
        }
    }

    /// Two pointer tap sequences separated by the configured gap.
    pub async fn double_tap(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
    ) -> Result<TapReport, AgentError> {
        self.ensure_interactable(target)?;
        let center = target.rect.center();
        self.tap_sequence(bridge, center).await;
        sleep(self.timings.double_tap_gap).await;
        self.tap_sequence(bridge, center).await;
        Ok(TapReport {
            center: center.into(),
        })
    }

    /// Touch-kind press held for the configured duration. Touch because
    /// many long-press handlers inspect the pointer device kind.
    pub async fn long_press(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        hold: Option<Duration>,
    ) -> Result<TapReport, AgentError> {
        self.ensure_interactable(target)?;
        let center = target.rect.center();
        bridge.dispatch_pointer(self.pointer(
            PointerKind::Touch,
            PointerPhase::Down,
            center,
            Vec2::new(0.0, 0.0),
        ));
        sleep(hold.unwrap_or(self.timings.long_press_hold)).await;
        bridge.dispatch_pointer(self.pointer(
            PointerKind::Touch,
            PointerPhase::Up,
            center,
            Vec2::new(0.0, 0.0),
        ));
        Ok(TapReport {
            center: center.into(),
        })
    }

    /// Mouse down at `from`, interpolated moves, up at `to`. Each move's
    /// `delta` is the per-step vector.
    pub async fn drag(
        &self,
        bridge: &dyn HostBridge,
        from: Point,
        to: Point,
        duration: Option<Duration>,
    ) {
        let duration = duration.unwrap_or(self.timings.drag_duration);
        let steps = self.timings.drag_steps.max(1);
        let step_delta = Vec2::new(
            (to.x - from.x) / steps as f64,
            (to.y - from.y) / steps as f64,
        );
        let step_pause = duration / steps;

        bridge.dispatch_pointer(self.pointer(
            PointerKind::Mouse,
            PointerPhase::Down,
            from,
            Vec2::new(0.0, 0.0),
        ));
        for i in 1..=steps {
            sleep(step_pause).await;
            let position = Point::new(
                from.x + step_delta.x * i as f64,
                from.y + step_delta.y * i as f64,
            );
            bridge.dispatch_pointer(self.pointer(
                PointerKind::Mouse,
                PointerPhase::Move,
                position,
                step_delta,
            ));
        }
        bridge.dispatch_pointer(self.pointer(PointerKind::Mouse, PointerPhase::Up, to, Vec2::new(0.0, 0.0)));
    }

    /// Drag the target's center by a literal vector.
    pub async fn drag_by(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        dx: f64,
        dy: f64,
        duration: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.ensure_interactable(target)?;
        let from = target.rect.center();
        let to = Point::new(from.x + dx, from.y + dy);
        self.drag(bridge, from, to, duration).await;
        Ok(())
    }

    /// Drag center-to-center between two targets.
    pub async fn drag_to(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        destination: &ResolvedTarget,
        duration: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.ensure_interactable(target)?;
        self.drag(
            bridge,
            target.rect.center(),
            destination.rect.center(),
            duration,
        )
        .await;
        Ok(())
    }

    /// Scroll the target's content. Positive `dy` scrolls content downward,
    /// so the synthetic drag is emitted with the inverse vector. A zero
    /// delta emits no pointer events at all.
    pub async fn scroll(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        dx: f64,
        dy: f64,
        duration: Option<Duration>,
    ) -> Result<(), AgentError> {
        self.ensure_interactable(target)?;
        if dx == 0.0 && dy == 0.0 {
            return Ok(());
        }
        let from = target.rect.center();
        let to = Point::new(from.x - dx, from.y - dy);
        self.drag(bridge, from, to, duration).await;
        Ok(())
    }

    /// Write text into the target.
    ///
    /// Fallback chain: accessibility `set_text` → registered widget
    /// capability (by type name) → keyboard simulation on the text channel.
    /// `newline_as_action` controls whether `\n` fires the field's input
    /// action (single-line fields) or stays literal.
    pub async fn write_text(
        &self,
        bridge: &dyn HostBridge,
        registry: &CapabilityRegistry,
        target: &ResolvedTarget,
        text: &str,
        newline_as_action: bool,
        input_action: InputAction,
    ) -> Result<TextPath, AgentError> {
        self.ensure_interactable(target)?;

        if target.actions.contains(Action::SetValue) {
            bridge.perform_accessibility_action(
                target.node_id,
                Action::SetValue,
                &ActionPayload::SetText(text.to_string()),
            )?;
            return Ok(TextPath::Accessibility);
        }

        if let Some(capability) = target
            .type_name
            .as_deref()
            .and_then(|name| registry.text_editor(name))
        {
            (capability.write)(target.node_id, text)?;
            return Ok(TextPath::Registry);
        }

        self.keyboard_simulate(bridge, target, text, newline_as_action, input_action)?;
        Ok(TextPath::Keyboard)
    }

    /// Character-by-character editing-state updates. Each injection returns
    /// only after the host acknowledged the previous state, so consecutive
    /// updates stay ordered. Starts from a clear (empty) state.
    fn keyboard_simulate(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        text: &str,
        newline_as_action: bool,
        input_action: InputAction,
    ) -> Result<(), AgentError> {
        let mut buffer = String::new();
        bridge.inject_text_channel(&TextChannelCall::SetEditingState {
            text: String::new(),
            selection_base: 0,
            selection_extent: 0,
        })?;
        for c in text.chars() {
            if c == '\n' && newline_as_action && !target.flags.is_multiline {
                bridge.inject_text_channel(&TextChannelCall::PerformAction(input_action))?;
                continue;
            }
            buffer.push(c);
            let caret = buffer.chars().count() as i64;
            bridge.inject_text_channel(&TextChannelCall::SetEditingState {
                text: buffer.clone(),
                selection_base: caret,
                selection_extent: caret,
            })?;
        }
        Ok(())
    }

    /// Place the caret / selection. Accessibility `set_selection` when
    /// declared, otherwise an editing-state update with the element's
    /// current text.
    pub async fn set_selection(
        &self,
        bridge: &dyn HostBridge,
        target: &ResolvedTarget,
        current_text: Option<&str>,
        base: usize,
        extent: usize,
    ) -> Result<(), AgentError> {
        self.ensure_interactable(target)?;
        if target.actions.contains(Action::SetTextSelection) {
            return bridge.perform_accessibility_action(
                target.node_id,
                Action::SetTextSelection,
                &ActionPayload::SetSelection { base, extent },
            );
        }
        bridge.inject_text_channel(&TextChannelCall::SetEditingState {
            text: current_text.unwrap_or_default().to_string(),
            selection_base: base as i64,
            selection_extent: extent as i64,
        })
    }
}
