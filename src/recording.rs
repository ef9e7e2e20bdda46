//! Gesture recording.
//!
//! While recording is active the server turns every raw pointer-up the
//! host reports into a `recording.event` notification: the position is
//! correlated to the topmost indexed element containing it, and a stable
//! selector is generated so the recorded script replays against future
//! snapshots (where `fap_id`s will differ).

use accesskit::Point;
use serde::Serialize;

use crate::indexer::IndexedElement;
use crate::selector::{Segment, Selector};

/// One recorded gesture, broadcast as the `recording.event` payload.
#[derive(Debug, Clone, Serialize)]
pub struct RecordedEvent {
    /// Gesture kind; raw pointer-ups are reported as taps.
    pub action: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub selector: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
    pub x: f64,
    pub y: f64,
}

/// On/off state plus event construction. The server owns one behind a
/// mutex; the pointer observer feeds it.
#[derive(Debug, Default)]
pub struct Recorder {
    active: bool,
}

impl Recorder {
    pub fn start(&mut self) {
        self.active = true;
    }

    pub fn stop(&mut self) {
        self.active = false;
    }

    pub fn is_active(&self) -> bool {
        self.active
    }

    /// Build the event for a pointer-up at `position` against the current
    /// snapshot. The selector is omitted when no element contains the
    /// position; drivers fall back to the coordinates.
    pub fn event_at(
        &self,
        elements: &[IndexedElement],
        position: Point,
        timestamp: u64,
    ) -> RecordedEvent {
        let selector = topmost_at(elements, position)
            .map(|index| stable_selector(&elements[index]).to_string());
        RecordedEvent {
            action: "tap",
            selector,
            timestamp,
            x: position.x,
            y: position.y,
        }
    }
}

/// The topmost element containing a position: the last hit in traversal
/// order, since later siblings and descendants paint above.
pub fn topmost_at(elements: &[IndexedElement], position: Point) -> Option<usize> {
    elements
        .iter()
        .rposition(|elem| elem.global_rect.contains(position))
}

/// A selector for an element that stays valid across snapshots.
///
/// Preference order: developer key, then type plus visible text, then type
/// alone, then bare text.
pub fn stable_selector(elem: &IndexedElement) -> Selector {
    let mut segment = Segment::default();
    if let Some(key) = &elem.key {
        segment.literals.push(("key".to_string(), key.clone()));
    } else {
        let text = elem
            .label
            .as_deref()
            .or(elem.value.as_deref())
            .or(elem.hint.as_deref());
        segment.type_name = elem.type_name.clone();
        if let Some(text) = text {
            segment.literals.push(("text".to_string(), text.to_string()));
        }
    }
    Selector {
        segments: vec![segment],
    }
}
