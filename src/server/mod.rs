//! The RPC server.
//!
//! Accepts authenticated WebSocket connections on the loopback interface,
//! frames bidirectional JSON messages, dispatches methods to the indexer /
//! executor / observability buffers, and broadcasts recording
//! notifications. Connection lifecycle drives lazy accessibility
//! activation: the first accepted connection ensures the host's subsystem
//! is active, the last disconnect releases it.
//!
//! Handlers never hold the indexer lock across a suspension point: targets
//! are resolved and detached synchronously, then the paced pointer work
//! runs against the detached data.

pub mod protocol;

use std::sync::{Arc, Mutex};
use std::time::Duration;

use accesskit::Point;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use futures::{SinkExt, StreamExt};
use rustc_hash::FxHashMap;
use serde_json::{json, Value};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::actions::{ActionExecutor, ResolvedTarget};
use crate::bridge::HostBridge;
use crate::config::AgentConfig;
use crate::error::AgentError;
use crate::indexer::{SerializedElement, TreeIndexer};
use crate::observe::{now_millis, ObservabilityCenter};
use crate::recording::Recorder;
use crate::registry::CapabilityRegistry;
use crate::selector::Selector;

/// Everything the server and its handlers share. Built once by the agent
/// context; connections and the recording loop hold it behind an `Arc`.
pub(crate) struct AgentState {
    pub(crate) config: AgentConfig,
    pub(crate) bridge: Arc<dyn HostBridge>,
    pub(crate) indexer: Mutex<TreeIndexer>,
    pub(crate) executor: ActionExecutor,
    pub(crate) registry: CapabilityRegistry,
    pub(crate) observe: Arc<ObservabilityCenter>,
    pub(crate) recorder: Mutex<Recorder>,
    connections: Mutex<ConnectionSet>,
}

#[derive(Default)]
struct ConnectionSet {
    next_id: u64,
    senders: FxHashMap<u64, mpsc::UnboundedSender<Message>>,
}

impl AgentState {
    pub(crate) fn new(
        config: AgentConfig,
        bridge: Arc<dyn HostBridge>,
        registry: CapabilityRegistry,
        observe: Arc<ObservabilityCenter>,
    ) -> Self {
        Self {
            indexer: Mutex::new(TreeIndexer::new(config.cache_ttl, config.cache_cap)),
            executor: ActionExecutor::new(config.timings.clone()),
            config,
            bridge,
            registry,
            observe,
            recorder: Mutex::new(Recorder::default()),
            connections: Mutex::new(ConnectionSet::default()),
        }
    }

    /// Track a connection. The accessibility subsystem is activated on the
    /// 0 → 1 transition only, so reconnect storms cannot over-ensure.
    fn register_connection(&self, sender: mpsc::UnboundedSender<Message>) -> u64 {
        let mut conns = self.connections.lock().unwrap();
        let id = conns.next_id;
        conns.next_id += 1;
        let was_empty = conns.senders.is_empty();
        conns.senders.insert(id, sender);
        if was_empty {
            self.bridge.ensure_accessibility_active();
        }
        id
    }

    /// Untrack a connection; the release is gated on the live count
    /// reaching zero, protecting the host refcount from double release.
    fn unregister_connection(&self, id: u64) {
        let mut conns = self.connections.lock().unwrap();
        if conns.senders.remove(&id).is_some() && conns.senders.is_empty() {
            self.bridge.release_accessibility();
        }
    }

    pub(crate) fn connection_count(&self) -> usize {
        self.connections.lock().unwrap().senders.len()
    }

    /// Send a frame to every live connection, enumerating a snapshot of
    /// the sender set.
    fn broadcast(&self, frame: String) {
        let senders: Vec<mpsc::UnboundedSender<Message>> = self
            .connections
            .lock()
            .unwrap()
            .senders
            .values()
            .cloned()
            .collect();
        for sender in senders {
            let _ = sender.send(Message::Text(frame.clone().into()));
        }
    }
}

// ============================================================================
// Serving
// ============================================================================

/// Accept loop plus the recording broadcast task. The listener arrives as
/// a pre-bound std socket so the agent can report its address before the
/// runtime spins up.
pub(crate) async fn serve(
    state: Arc<AgentState>,
    listener: std::net::TcpListener,
    pointer_rx: mpsc::UnboundedReceiver<Point>,
) {
    let listener = match tokio::net::TcpListener::from_std(listener) {
        Ok(listener) => listener,
        Err(err) => {
            error!(%err, "failed to adopt server socket");
            return;
        }
    };

    tokio::spawn(recording_loop(state.clone(), pointer_rx));

    loop {
        match listener.accept().await {
            Ok((stream, peer)) => {
                tokio::spawn(handle_connection(state.clone(), stream, peer));
            }
            Err(err) => {
                warn!(%err, "accept failed");
            }
        }
    }
}

/// Turn raw pointer-ups into `recording.event` notifications while
/// recording is active.
async fn recording_loop(state: Arc<AgentState>, mut pointer_rx: mpsc::UnboundedReceiver<Point>) {
    while let Some(position) = pointer_rx.recv().await {
        if !state.recorder.lock().unwrap().is_active() {
            continue;
        }
        let snapshot = state
            .indexer
            .lock()
            .unwrap()
            .snapshot(state.bridge.as_ref());
        let event = state.recorder.lock().unwrap().event_at(
            &snapshot.elements,
            position,
            now_millis(),
        );
        let params = serde_json::to_value(&event).unwrap_or(Value::Null);
        state.broadcast(protocol::notification_frame("recording.event", params));
    }
}

async fn handle_connection(
    state: Arc<AgentState>,
    stream: TcpStream,
    peer: std::net::SocketAddr,
) {
    let auth_token = state.config.auth_token.clone();
    let auth_check = move |request: &Request, response: Response| -> Result<Response, ErrorResponse> {
        let Some(token) = &auth_token else {
            return Ok(response);
        };
        let expected = format!("Bearer {token}");
        let supplied = request
            .headers()
            .get("authorization")
            .and_then(|value| value.to_str().ok());
        if supplied == Some(expected.as_str()) {
            Ok(response)
        } else {
            warn!(%peer, "rejected handshake: missing or invalid bearer token");
            let mut reject = ErrorResponse::new(None);
            *reject.status_mut() =
                tokio_tungstenite::tungstenite::http::StatusCode::UNAUTHORIZED;
            Err(reject)
        }
    };

    let ws = match tokio_tungstenite::accept_hdr_async(stream, auth_check).await {
        Ok(ws) => ws,
        Err(err) => {
            debug!(%peer, %err, "handshake failed");
            return;
        }
    };

    let (mut sink, mut stream) = ws.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = state.register_connection(tx.clone());
    info!(%peer, conn_id, "driver connected");

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sink.send(message).await.is_err() {
                break;
            }
        }
    });

    while let Some(message) = stream.next().await {
        match message {
            Ok(Message::Text(text)) => {
                if let Some(reply) = handle_frame(&state, text.as_str()).await {
                    let _ = tx.send(Message::Text(reply.into()));
                }
            }
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    state.unregister_connection(conn_id);
    info!(%peer, conn_id, "driver disconnected");
    writer.abort();
}

/// One incoming text frame → at most one outgoing frame. Notifications and
/// client-side responses produce nothing.
pub(crate) async fn handle_frame(state: &Arc<AgentState>, text: &str) -> Option<String> {
    let request = match protocol::parse_frame(text) {
        Ok(Some(request)) => request,
        Ok(None) => return None,
        Err(err) => return Some(protocol::error_frame(None, &err)),
    };

    let result = dispatch(state, &request.method, &request.params).await;
    match (request.id, result) {
        (Some(id), Ok(value)) => Some(protocol::response_frame(&id, value)),
        (Some(id), Err(err)) => {
            debug!(method = %request.method, %err, "request failed");
            Some(protocol::error_frame(Some(&id), &err))
        }
        (None, _) => None,
    }
}

// ============================================================================
// Method dispatch
// ============================================================================

/// Resolve the `selector` parameter to the first matching element,
/// detached from the snapshot. The indexer lock is released before any
/// suspension point.
fn resolve_target(
    state: &AgentState,
    params: &Value,
) -> Result<(ResolvedTarget, SerializedElement), AgentError> {
    let selector_str =
        protocol::opt_str(params, "selector").ok_or(AgentError::SelectorRequired)?;
    resolve_selector(state, selector_str)
}

fn resolve_selector(
    state: &AgentState,
    selector_str: &str,
) -> Result<(ResolvedTarget, SerializedElement), AgentError> {
    let selector = Selector::parse(selector_str)?;
    let mut indexer = state.indexer.lock().unwrap();
    let (snapshot, matches) = indexer.find(state.bridge.as_ref(), &selector);
    let index = matches
        .first()
        .copied()
        .ok_or_else(|| AgentError::ElementNotFound(selector_str.to_string()))?;
    let elem = &snapshot.elements[index];
    Ok((ResolvedTarget::from(elem), elem.serialize()))
}

fn duration_param(params: &Value) -> Option<Duration> {
    protocol::opt_f64(params, "durationMs").map(|ms| Duration::from_millis(ms.max(0.0) as u64))
}

async fn dispatch(
    state: &Arc<AgentState>,
    method: &str,
    params: &Value,
) -> Result<Value, AgentError> {
    match method {
        "ping" => Ok(json!("pong")),

        "getTree" => {
            let (snapshot, elements) = state
                .indexer
                .lock()
                .unwrap()
                .serialized_snapshot(state.bridge.as_ref());
            let mut result = json!({
                "elements": elements,
                "cached": snapshot.cached,
            });
            if let Some(age) = snapshot.cache_age {
                result["cacheAgeSeconds"] = json!(age.as_secs_f64());
            }
            Ok(result)
        }

        "getTreeDiff" => {
            let diff = state
                .indexer
                .lock()
                .unwrap()
                .diff_response(state.bridge.as_ref());
            serde_json::to_value(diff).map_err(|e| AgentError::Inspection(e.to_string()))
        }

        "getRoute" => Ok(state
            .observe
            .current_route()
            .map(Value::String)
            .unwrap_or(Value::Null)),

        "tap" => {
            let (target, element) = resolve_target(state, params)?;
            let report = state.executor.tap(state.bridge.as_ref(), &target).await?;
            Ok(json!({
                "status": "tapped",
                "element": element,
                "debug": report,
            }))
        }

        "tapAt" => {
            let x = protocol::require_f64(params, "x")?;
            let y = protocol::require_f64(params, "y")?;
            let report = state
                .executor
                .tap_at(state.bridge.as_ref(), Point::new(x, y))
                .await;
            Ok(json!({ "status": "tapped", "center": report.center }))
        }

        "doubleTap" => {
            let (target, element) = resolve_target(state, params)?;
            state
                .executor
                .double_tap(state.bridge.as_ref(), &target)
                .await?;
            Ok(json!({ "status": "tapped", "element": element }))
        }

        "longPress" => {
            let (target, element) = resolve_target(state, params)?;
            state
                .executor
                .long_press(state.bridge.as_ref(), &target, duration_param(params))
                .await?;
            Ok(json!({ "status": "pressed", "element": element }))
        }

        "drag" => {
            let (target, _) = resolve_target(state, params)?;
            if let Some(target_selector) = protocol::opt_str(params, "targetSelector") {
                let (destination, _) = resolve_selector(state, target_selector)?;
                state
                    .executor
                    .drag_to(
                        state.bridge.as_ref(),
                        &target,
                        &destination,
                        duration_param(params),
                    )
                    .await?;
            } else {
                let dx = protocol::require_f64(params, "dx")?;
                let dy = protocol::require_f64(params, "dy")?;
                state
                    .executor
                    .drag_by(state.bridge.as_ref(), &target, dx, dy, duration_param(params))
                    .await?;
            }
            Ok(json!({ "status": "dragged" }))
        }

        "scroll" => {
            let (target, _) = resolve_target(state, params)?;
            let dx = protocol::require_f64(params, "dx")?;
            let dy = protocol::require_f64(params, "dy")?;
            state
                .executor
                .scroll(state.bridge.as_ref(), &target, dx, dy, duration_param(params))
                .await?;
            Ok(json!({ "status": "scrolled" }))
        }

        "enterText" => {
            let text = protocol::require_str(params, "text")?.to_string();
            let (target, _) = resolve_target(state, params)?;
            state
                .executor
                .write_text(
                    state.bridge.as_ref(),
                    &state.registry,
                    &target,
                    &text,
                    true,
                    state.config.input_action,
                )
                .await?;
            Ok(json!({ "status": "ok", "text": text }))
        }

        "setText" => {
            let text = protocol::require_str(params, "text")?.to_string();
            let (target, _) = resolve_target(state, params)?;
            state
                .executor
                .write_text(
                    state.bridge.as_ref(),
                    &state.registry,
                    &target,
                    &text,
                    false,
                    state.config.input_action,
                )
                .await?;
            Ok(json!({ "status": "ok", "text": text }))
        }

        "setSelection" => {
            let base = protocol::require_u64(params, "base")? as usize;
            let extent = protocol::require_u64(params, "extent")? as usize;
            let (target, element) = resolve_target(state, params)?;
            state
                .executor
                .set_selection(
                    state.bridge.as_ref(),
                    &target,
                    element.value.as_deref(),
                    base,
                    extent,
                )
                .await?;
            Ok(json!({ "status": "ok", "base": base, "extent": extent }))
        }

        "getErrors" => {
            let since = protocol::opt_u64(params, "since");
            serde_json::to_value(state.observe.errors(since))
                .map_err(|e| AgentError::Inspection(e.to_string()))
        }

        "getLogs" => serde_json::to_value(state.observe.logs())
            .map_err(|e| AgentError::Inspection(e.to_string())),

        "getPerformanceMetrics" => serde_json::to_value(state.observe.frame_timings())
            .map_err(|e| AgentError::Inspection(e.to_string())),

        "captureScreenshot" => {
            let png = state
                .bridge
                .capture_image(state.config.screenshot_pixel_ratio)?;
            Ok(json!({ "base64": BASE64.encode(png) }))
        }

        "startRecording" => {
            state.recorder.lock().unwrap().start();
            Ok(json!({ "status": "recording" }))
        }

        "stopRecording" => {
            state.recorder.lock().unwrap().stop();
            Ok(json!({ "status": "stopped" }))
        }

        "clearErrors" => {
            state.observe.clear_errors();
            Ok(json!({ "status": "cleared" }))
        }

        "clearLogs" => {
            state.observe.clear_logs();
            Ok(json!({ "status": "cleared" }))
        }

        _ => Err(AgentError::UnknownMethod(method.to_string())),
    }
}
