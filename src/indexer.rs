//! The tree indexer.
//!
//! On demand the indexer snapshots the host's accessibility tree into a
//! flat vector of [`IndexedElement`]s: short per-snapshot `fap_id`s, global
//! rects composed through the ancestor transform chain, and enrichment
//! (widget type, developer key, custom metadata) joined in from one walk of
//! the element tree.
//!
//! A short-TTL resilience cache bridges accessibility reactivation: hosts
//! drop their semantics tree when no driver is connected, so the first
//! snapshot after a reconnect can be empty for a frame or two. While the
//! previous snapshot is fresh it is served in place of an empty one — never
//! in place of a live, non-empty one.

use std::collections::BTreeMap;
use std::time::{Duration, Instant};

use accesskit::{Affine, Rect};
use rustc_hash::{FxHashMap, FxHashSet};
use serde::Serialize;
use tracing::{debug, warn};

use crate::bridge::{ActionSet, HostBridge, NodeFlags};
use crate::selector::Selector;

/// Cached snapshots older than this are discarded rather than served.
pub const CACHE_TTL: Duration = Duration::from_secs(5);

/// Upper bound on cached elements; snapshots are truncated to the
/// most-recently-traversed prefix beyond it.
pub const CACHE_CAP: usize = 10_000;

/// Tolerance for global-rect composition, in each coordinate.
#[cfg(test)]
pub(crate) const RECT_EPSILON: f64 = 1e-6;

// ============================================================================
// Indexed elements
// ============================================================================

/// One element of a snapshot: an accessibility node joined with its
/// element-tree enrichment and derived capabilities.
///
/// `fap_id` is unique within the snapshot but **not** stable across
/// snapshots; drivers re-resolve selectors instead of caching ids.
#[derive(Debug, Clone)]
pub struct IndexedElement {
    pub fap_id: String,
    /// Host accessibility-node handle, valid until the next snapshot.
    pub node_id: u64,
    /// Accessibility rect composed through the ancestor transform chain,
    /// in the coordinate system the host's gesture dispatch uses.
    pub global_rect: Rect,
    /// Widget runtime type, from the element tree.
    pub type_name: Option<String>,
    /// Developer-assigned key, unwrapped to the plain string.
    pub key: Option<String>,
    pub label: Option<String>,
    pub value: Option<String>,
    pub hint: Option<String>,
    pub tooltip: Option<String>,
    pub actions: ActionSet,
    pub flags: NodeFlags,
    /// Custom key/value pairs from host-side annotation wrappers.
    pub metadata: BTreeMap<String, String>,
    /// Set on elements served from the resilience cache: their node
    /// handles may be stale.
    pub is_placeholder: bool,
    pub placeholder_reason: Option<String>,
    /// Index of the parent element within the same snapshot.
    pub parent: Option<usize>,
}

impl IndexedElement {
    /// An element is interactable when it declares at least one actionable
    /// capability and is not invisible.
    pub fn is_interactable(&self) -> bool {
        !self.flags.is_invisible && !self.actions.is_empty()
    }

    /// The compact wire form of this element.
    pub fn serialize(&self) -> SerializedElement {
        SerializedElement {
            id: self.fap_id.clone(),
            type_name: self.type_name.clone(),
            key: self.key.clone(),
            label: self.label.clone(),
            value: self.value.clone(),
            hint: self.hint.clone(),
            rect: WireRect {
                x: self.global_rect.x0,
                y: self.global_rect.y0,
                w: self.global_rect.width(),
                h: self.global_rect.height(),
            },
            actions: self.actions.names(),
            metadata: self.metadata.clone(),
            is_placeholder: self.is_placeholder,
            placeholder_reason: self.placeholder_reason.clone(),
            is_interactable: self.is_interactable(),
        }
    }
}

/// Wire rect: origin plus size, not corner pair.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct WireRect {
    pub x: f64,
    pub y: f64,
    pub w: f64,
    pub h: f64,
}

/// The serialized element shape drivers consume.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SerializedElement {
    pub id: String,
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub label: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<String>,
    pub rect: WireRect,
    pub actions: Vec<&'static str>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
    pub is_placeholder: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub placeholder_reason: Option<String>,
    pub is_interactable: bool,
}

/// The result of one snapshot request.
#[derive(Debug, Clone)]
pub struct TreeSnapshot {
    pub elements: Vec<IndexedElement>,
    /// True when the resilience cache was served instead of a live tree.
    pub cached: bool,
    pub cache_age: Option<Duration>,
}

/// Incremental change set between two serialized snapshots.
#[derive(Debug, Clone, Serialize)]
pub struct TreeDiff {
    pub added: Vec<SerializedElement>,
    /// `fap_id`s present before but absent now.
    pub removed: Vec<String>,
    /// Elements present in both whose serialized form changed.
    pub updated: Vec<SerializedElement>,
}

// ============================================================================
// Element-tree enrichment
// ============================================================================

/// Per-node enrichment joined in from the element tree.
#[derive(Debug, Clone, Default)]
struct Enrichment {
    type_name: Option<String>,
    key: Option<String>,
    metadata: BTreeMap<String, String>,
}

/// Strip the toolkit's textual value-key wrapper: `[<'submit_btn'>]` →
/// `submit_btn`. Non-wrapped keys pass through unchanged.
fn unwrap_value_key(raw: &str) -> String {
    let inner = raw
        .strip_prefix("[<")
        .and_then(|s| s.strip_suffix(">]"))
        .unwrap_or(raw);
    let inner = inner
        .strip_prefix('\'')
        .and_then(|s| s.strip_suffix('\''))
        .unwrap_or(inner);
    inner.to_string()
}

/// One element-tree walk producing `node_id → enrichment`.
///
/// The key rule: take the correlated element's own key; when it has none,
/// walk ancestor elements until one has a key (developer keys usually sit
/// on a wrapper above the node-producing widget). Metadata merges
/// ancestors outermost-first so the nearest annotation wins. When several
/// elements correlate to one node the deepest wins, giving the concrete
/// widget type rather than its wrappers.
fn collect_enrichment(bridge: &dyn HostBridge) -> FxHashMap<u64, Enrichment> {
    struct StackEntry {
        depth: usize,
        key: Option<String>,
        metadata: Vec<(String, String)>,
    }

    let mut map: FxHashMap<u64, Enrichment> = FxHashMap::default();
    let mut stack: Vec<StackEntry> = Vec::new();

    bridge.traverse_elements(&mut |element, depth| {
        while stack.last().is_some_and(|top| top.depth >= depth) {
            stack.pop();
        }

        let own_key = element.key.as_deref().map(unwrap_value_key);
        if let Some(node_id) = element.node_id {
            let key = own_key.clone().or_else(|| {
                stack.iter().rev().find_map(|entry| entry.key.clone())
            });
            let mut metadata = BTreeMap::new();
            for entry in &stack {
                for (k, v) in &entry.metadata {
                    metadata.insert(k.clone(), v.clone());
                }
            }
            for (k, v) in &element.metadata {
                metadata.insert(k.clone(), v.clone());
            }
            let type_name = if element.type_name.is_empty() {
                None
            } else {
                Some(element.type_name.clone())
            };
            map.insert(
                node_id,
                Enrichment {
                    type_name,
                    key,
                    metadata,
                },
            );
        }

        stack.push(StackEntry {
            depth,
            key: own_key,
            metadata: element.metadata.clone(),
        });
    });

    map
}

// ============================================================================
// The indexer
// ============================================================================

struct CachedSnapshot {
    elements: Vec<IndexedElement>,
    cached_at: Instant,
}

/// Owns the snapshot pipeline, the resilience cache, and the diff baseline.
///
/// Exclusive owner of indexed state; every other component reads through
/// this API and nothing holds an element reference across a suspension
/// point.
pub struct TreeIndexer {
    cache: Option<CachedSnapshot>,
    cache_ttl: Duration,
    cache_cap: usize,
    /// Baseline for `diff_response`: the last serialized tree handed out.
    previous: Vec<SerializedElement>,
    /// Whether the last snapshot request was answered from the cache.
    pub last_response_was_cached: bool,
}

impl Default for TreeIndexer {
    fn default() -> Self {
        Self::new(CACHE_TTL, CACHE_CAP)
    }
}

impl TreeIndexer {
    pub fn new(cache_ttl: Duration, cache_cap: usize) -> Self {
        Self {
            cache: None,
            cache_ttl,
            cache_cap,
            previous: Vec::new(),
            last_response_was_cached: false,
        }
    }

    /// Produce a fresh snapshot, falling back to the resilience cache when
    /// the live tree is empty and the cache is still fresh.
    pub fn snapshot(&mut self, bridge: &dyn HostBridge) -> TreeSnapshot {
        let elements = self.walk(bridge);

        if !elements.is_empty() {
            debug!(elements = elements.len(), "indexed live tree");
            let mut cached = elements.clone();
            cached.truncate(self.cache_cap);
            self.cache = Some(CachedSnapshot {
                elements: cached,
                cached_at: Instant::now(),
            });
            self.last_response_was_cached = false;
            return TreeSnapshot {
                elements,
                cached: false,
                cache_age: None,
            };
        }

        if let Some(cache) = &self.cache {
            let age = cache.cached_at.elapsed();
            if age <= self.cache_ttl && !cache.elements.is_empty() {
                warn!(
                    age_ms = age.as_millis() as u64,
                    elements = cache.elements.len(),
                    "live tree empty, serving resilience cache"
                );
                let elements = cache
                    .elements
                    .iter()
                    .cloned()
                    .map(|mut elem| {
                        elem.is_placeholder = true;
                        elem.placeholder_reason = Some("cached".to_string());
                        elem
                    })
                    .collect();
                self.last_response_was_cached = true;
                return TreeSnapshot {
                    elements,
                    cached: true,
                    cache_age: Some(age),
                };
            }
        }

        self.last_response_was_cached = false;
        TreeSnapshot {
            elements: Vec::new(),
            cached: false,
            cache_age: None,
        }
    }

    /// Snapshot, then evaluate a selector over it. Matches are returned as
    /// indices into the snapshot, in traversal order.
    pub fn find(&mut self, bridge: &dyn HostBridge, selector: &Selector) -> (TreeSnapshot, Vec<usize>) {
        let snapshot = self.snapshot(bridge);
        let matches = selector.evaluate(&snapshot.elements);
        (snapshot, matches)
    }

    /// Snapshot and serialize, updating the diff baseline.
    pub fn serialized_snapshot(&mut self, bridge: &dyn HostBridge) -> (TreeSnapshot, Vec<SerializedElement>) {
        let snapshot = self.snapshot(bridge);
        let serialized: Vec<SerializedElement> =
            snapshot.elements.iter().map(IndexedElement::serialize).collect();
        self.previous = serialized.clone();
        (snapshot, serialized)
    }

    /// Snapshot and diff against the previous serialized tree.
    pub fn diff_response(&mut self, bridge: &dyn HostBridge) -> TreeDiff {
        let previous = std::mem::take(&mut self.previous);
        let (_, current) = self.serialized_snapshot(bridge);
        diff(&previous, &current)
    }

    /// One pre-order accessibility walk, with enrichment joined in.
    fn walk(&self, bridge: &dyn HostBridge) -> Vec<IndexedElement> {
        let enrichment = collect_enrichment(bridge);

        let mut elements: Vec<IndexedElement> = Vec::new();
        // (depth, element index) chain of emitted ancestors.
        let mut parents: Vec<(usize, usize)> = Vec::new();

        bridge.traverse_accessibility(&mut |node, transform, depth| {
            while parents.last().is_some_and(|&(d, _)| d >= depth) {
                parents.pop();
            }
            // Invisible nodes are traversed for their descendants but not
            // emitted; their children re-parent to the nearest emitted
            // ancestor.
            if node.flags.is_invisible {
                return;
            }

            let parent = parents.last().map(|&(_, index)| index);
            let index = elements.len();
            let enriched = enrichment.get(&node.node_id);

            elements.push(IndexedElement {
                fap_id: format!("e{index}"),
                node_id: node.node_id,
                global_rect: compose_rect(transform, node.rect),
                type_name: enriched.and_then(|e| e.type_name.clone()),
                key: enriched.and_then(|e| e.key.clone()),
                label: node.label.clone(),
                value: node.value.clone(),
                hint: node.hint.clone(),
                tooltip: node.tooltip.clone(),
                actions: node.actions,
                flags: node.flags,
                metadata: enriched.map(|e| e.metadata.clone()).unwrap_or_default(),
                is_placeholder: false,
                placeholder_reason: None,
                parent,
            });
            parents.push((depth, index));
        });

        elements
    }
}

/// The composed ancestor transform applied to a local rect, as the
/// axis-aligned bounding box.
fn compose_rect(transform: Affine, rect: Rect) -> Rect {
    transform.transform_rect_bbox(rect)
}

/// Compare two serialized snapshots keyed by `fap_id`.
///
/// Applying `{added, removed, updated}` to `previous` reproduces `current`
/// exactly; only dirty elements appear.
pub fn diff(previous: &[SerializedElement], current: &[SerializedElement]) -> TreeDiff {
    let prev_by_id: FxHashMap<&str, &SerializedElement> = previous
        .iter()
        .map(|elem| (elem.id.as_str(), elem))
        .collect();
    let cur_ids: FxHashSet<&str> = current.iter().map(|elem| elem.id.as_str()).collect();

    let mut added = Vec::new();
    let mut updated = Vec::new();
    for elem in current {
        match prev_by_id.get(elem.id.as_str()) {
            None => added.push(elem.clone()),
            Some(prev) if *prev != elem => updated.push(elem.clone()),
            Some(_) => {}
        }
    }
    let removed = previous
        .iter()
        .filter(|elem| !cur_ids.contains(elem.id.as_str()))
        .map(|elem| elem.id.clone())
        .collect();

    TreeDiff {
        added,
        removed,
        updated,
    }
}

// ============================================================================
// Test fixtures
// ============================================================================

#[cfg(test)]
pub(crate) mod testfixtures {
    use super::*;
    use accesskit::Action;

    /// A minimal indexed element for matcher tests.
    pub(crate) fn elem(
        node_id: u64,
        fap_id: &str,
        type_name: Option<&str>,
        label: Option<&str>,
        parent: Option<usize>,
    ) -> IndexedElement {
        let mut actions = ActionSet::EMPTY;
        actions.insert(Action::Click);
        IndexedElement {
            fap_id: fap_id.to_string(),
            node_id,
            global_rect: Rect::new(0.0, 0.0, 100.0, 40.0),
            type_name: type_name.map(str::to_string),
            key: None,
            label: label.map(str::to_string),
            value: None,
            hint: None,
            tooltip: None,
            actions,
            flags: NodeFlags::default(),
            metadata: BTreeMap::new(),
            is_placeholder: false,
            placeholder_reason: None,
            parent,
        }
    }

    pub(crate) fn elem_with(
        node_id: u64,
        fap_id: &str,
        type_name: Option<&str>,
        label: Option<&str>,
        parent: Option<usize>,
        metadata: &[(&str, &str)],
    ) -> IndexedElement {
        let mut e = elem(node_id, fap_id, type_name, label, parent);
        e.metadata = metadata
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        e
    }
}
