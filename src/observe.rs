//! Observability buffers.
//!
//! Three bounded ring buffers — captured errors, host log lines, and frame
//! timings — plus the route observer's current-route state. The host's
//! subscription callbacks are the single writers (they run on the UI
//! thread); RPC handlers read snapshots. Entries are immutable once
//! recorded and consumption never fails.

use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::bridge::{ErrorSource, FrameTiming, HostError, RouteEvent};

/// Default capacity for the log and frame-timing buffers.
pub const DEFAULT_BUFFER_CAP: usize = 256;
/// Errors are rarer and heavier (stacks), so the default cap is smaller.
pub const DEFAULT_ERROR_CAP: usize = 128;

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

// ============================================================================
// Entries
// ============================================================================

/// A captured framework or unhandled-async error.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorEntry {
    /// `"framework"` or `"async"`.
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,
    /// Milliseconds since the Unix epoch.
    pub timestamp: u64,
}

/// One intercepted host log line.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LogEntry {
    pub message: String,
    pub timestamp: u64,
}

/// One frame's timing tuple.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FrameTimingEntry {
    pub build_microseconds: u64,
    pub raster_microseconds: u64,
    pub total_microseconds: u64,
    pub timestamp: u64,
}

// ============================================================================
// Ring buffer
// ============================================================================

/// Fixed-capacity FIFO; pushing past the cap evicts the oldest entry.
#[derive(Debug)]
pub struct RingBuffer<T> {
    entries: VecDeque<T>,
    cap: usize,
}

impl<T: Clone> RingBuffer<T> {
    pub fn new(cap: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(cap.min(64)),
            cap,
        }
    }

    pub fn push(&mut self, entry: T) {
        if self.entries.len() == self.cap {
            self.entries.pop_front();
        }
        self.entries.push_back(entry);
    }

    pub fn snapshot(&self) -> Vec<T> {
        self.entries.iter().cloned().collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

// ============================================================================
// Route observer state
// ============================================================================

/// Stack of route names mirroring the host navigator. Pop restores the
/// previous route. Advisory only: some host navigation APIs bypass the
/// observer, so the current route may be stale.
#[derive(Debug, Default)]
struct RouteStack {
    routes: Vec<String>,
}

impl RouteStack {
    fn apply(&mut self, event: RouteEvent) {
        match event {
            RouteEvent::Pushed(name) => self.routes.push(name),
            RouteEvent::Popped => {
                self.routes.pop();
            }
            RouteEvent::Replaced(name) => {
                self.routes.pop();
                self.routes.push(name);
            }
        }
    }

    fn current(&self) -> Option<&str> {
        self.routes.last().map(String::as_str)
    }
}

// ============================================================================
// The center
// ============================================================================

/// Owns all three buffers and the route state. Shared as `Arc`: the
/// bridge's subscription callbacks write, RPC handlers read.
pub struct ObservabilityCenter {
    errors: Mutex<RingBuffer<ErrorEntry>>,
    logs: Mutex<RingBuffer<LogEntry>>,
    timings: Mutex<RingBuffer<FrameTimingEntry>>,
    route: Mutex<RouteStack>,
}

impl Default for ObservabilityCenter {
    fn default() -> Self {
        Self::new(DEFAULT_ERROR_CAP, DEFAULT_BUFFER_CAP, DEFAULT_BUFFER_CAP)
    }
}

impl ObservabilityCenter {
    pub fn new(error_cap: usize, log_cap: usize, timing_cap: usize) -> Self {
        Self {
            errors: Mutex::new(RingBuffer::new(error_cap)),
            logs: Mutex::new(RingBuffer::new(log_cap)),
            timings: Mutex::new(RingBuffer::new(timing_cap)),
            route: Mutex::new(RouteStack::default()),
        }
    }

    // -- writers (bridge callbacks) ------------------------------------------

    pub fn record_error(&self, error: HostError) {
        let entry = ErrorEntry {
            code: match error.source {
                ErrorSource::Framework => "framework",
                ErrorSource::AsyncTask => "async",
            },
            message: error.message,
            stack: error.stack,
            timestamp: now_millis(),
        };
        self.errors.lock().unwrap().push(entry);
    }

    pub fn record_log(&self, message: String) {
        let entry = LogEntry {
            message,
            timestamp: now_millis(),
        };
        self.logs.lock().unwrap().push(entry);
    }

    pub fn record_timing(&self, timing: FrameTiming) {
        let entry = FrameTimingEntry {
            build_microseconds: timing.build_micros,
            raster_microseconds: timing.raster_micros,
            total_microseconds: timing.total_micros,
            timestamp: now_millis(),
        };
        self.timings.lock().unwrap().push(entry);
    }

    pub fn record_route(&self, event: RouteEvent) {
        self.route.lock().unwrap().apply(event);
    }

    // -- readers (RPC handlers) ----------------------------------------------

    /// Captured errors, optionally only those at or after `since`
    /// (milliseconds since the Unix epoch).
    pub fn errors(&self, since: Option<u64>) -> Vec<ErrorEntry> {
        let all = self.errors.lock().unwrap().snapshot();
        match since {
            Some(since) => all.into_iter().filter(|e| e.timestamp >= since).collect(),
            None => all,
        }
    }

    pub fn logs(&self) -> Vec<LogEntry> {
        self.logs.lock().unwrap().snapshot()
    }

    pub fn frame_timings(&self) -> Vec<FrameTimingEntry> {
        self.timings.lock().unwrap().snapshot()
    }

    pub fn current_route(&self) -> Option<String> {
        self.route.lock().unwrap().current().map(str::to_string)
    }

    pub fn clear_errors(&self) {
        self.errors.lock().unwrap().clear();
    }

    pub fn clear_logs(&self) {
        self.logs.lock().unwrap().clear();
    }
}
