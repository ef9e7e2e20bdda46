//! The agent context.
//!
//! The agent is the process-wide entry point the host application embeds:
//! an explicit context struct with init/start/shutdown, no hidden module
//! state. `init` attaches the bridge's subscription hooks to the
//! observability buffers and the recording channel; `start` binds the
//! server socket and spins up the background runtime; `shutdown` tears it
//! down without blocking the host.
//!
//! ```ignore
//! let mut agent = Agent::init(bridge, |cfg| cfg.port(9001).auth_token("s3cret"));
//! if let Some(addr) = agent.start()? {
//!     println!("agent listening on {addr}");
//! }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;

use accesskit::Point;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::bridge::HostBridge;
use crate::config::AgentConfig;
use crate::observe::ObservabilityCenter;
use crate::registry::CapabilityRegistry;
use crate::server::{self, AgentState};

pub struct Agent {
    state: Arc<AgentState>,
    /// Raw pointer-up stream, handed to the server at start.
    pointer_rx: Option<mpsc::UnboundedReceiver<Point>>,
    runtime: Option<tokio::runtime::Runtime>,
    local_addr: Option<SocketAddr>,
}

impl Agent {
    /// Build the agent and attach every subscription hook, with an empty
    /// capability registry.
    pub fn init(
        bridge: Arc<dyn HostBridge>,
        configure: impl FnOnce(&mut AgentConfig) -> &mut AgentConfig,
    ) -> Agent {
        Self::init_with_registry(bridge, CapabilityRegistry::new(), configure)
    }

    /// Build the agent with host-registered widget capabilities.
    pub fn init_with_registry(
        bridge: Arc<dyn HostBridge>,
        registry: CapabilityRegistry,
        configure: impl FnOnce(&mut AgentConfig) -> &mut AgentConfig,
    ) -> Agent {
        let mut config = AgentConfig::new();
        configure(&mut config);

        let observe = Arc::new(ObservabilityCenter::new(
            config.error_buffer_cap,
            config.log_buffer_cap,
            config.timing_buffer_cap,
        ));

        // One-shot subscription hooks; the buffers are the single writers'
        // destination for the lifetime of the process.
        let sink = observe.clone();
        bridge.register_error_handler(Box::new(move |error| sink.record_error(error)));
        let sink = observe.clone();
        bridge.register_log_handler(Box::new(move |line| sink.record_log(line)));
        let sink = observe.clone();
        bridge.register_frame_timings(Box::new(move |timing| sink.record_timing(timing)));
        let sink = observe.clone();
        bridge.register_route_observer(Box::new(move |event| sink.record_route(event)));

        let (pointer_tx, pointer_rx) = mpsc::unbounded_channel();
        bridge.register_pointer_observer(Box::new(move |position| {
            let _ = pointer_tx.send(position);
        }));

        Agent {
            state: Arc::new(AgentState::new(config, bridge, registry, observe)),
            pointer_rx: Some(pointer_rx),
            runtime: None,
            local_addr: None,
        }
    }

    /// Bind the server socket and start serving on a background runtime.
    ///
    /// Returns `Ok(None)` when the server is disabled (release-build
    /// default or the `FAP_AGENT_ENABLED` kill switch); the host
    /// application continues unaffected. The bind interface comes from
    /// `FAP_AGENT_HOST`; unresolvable values fall back to loopback with a
    /// warning.
    pub fn start(&mut self) -> std::io::Result<Option<SocketAddr>> {
        if self.runtime.is_some() {
            return Ok(self.local_addr);
        }
        if !self.state.config.effectively_enabled() {
            info!("agent server disabled");
            return Ok(None);
        }

        let host = self.state.config.bind_host();
        let port = self.state.config.port;
        let listener = match std::net::TcpListener::bind((host.as_str(), port)) {
            Ok(listener) => listener,
            Err(err) if host != "127.0.0.1" => {
                warn!(%host, %err, "bind host unusable, falling back to loopback");
                std::net::TcpListener::bind(("127.0.0.1", port))?
            }
            Err(err) => return Err(err),
        };
        listener.set_nonblocking(true)?;
        let addr = listener.local_addr()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_all()
            .build()?;
        let pointer_rx = self
            .pointer_rx
            .take()
            .unwrap_or_else(|| mpsc::unbounded_channel().1);
        runtime.spawn(server::serve(self.state.clone(), listener, pointer_rx));

        info!(%addr, "agent server listening");
        self.runtime = Some(runtime);
        self.local_addr = Some(addr);
        Ok(Some(addr))
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.runtime.is_some()
    }

    /// Stop serving. Non-blocking: in-flight handlers are abandoned with
    /// the runtime, which is what drivers expect on agent teardown.
    pub fn shutdown(&mut self) {
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
        self.local_addr = None;
    }
}

impl Drop for Agent {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::{ErrorSource, FrameTiming, HostError, RouteEvent};
    use crate::testutil::{FakeBridge, NodeSpec};
    use accesskit::Action;
    use futures::{SinkExt, StreamExt};
    use serde_json::{json, Value};
    use std::time::Duration;
    use tokio_tungstenite::tungstenite::client::IntoClientRequest;
    use tokio_tungstenite::tungstenite::Message;

    fn app_bridge() -> Arc<FakeBridge> {
        Arc::new(
            FakeBridge::new()
                .node(NodeSpec::new(1, 0).rect(0.0, 0.0, 400.0, 600.0))
                .node(
                    NodeSpec::new(2, 1)
                        .rect(10.0, 20.0, 110.0, 60.0)
                        .label("Submit")
                        .action(Action::Click)
                        .button(),
                )
                .element("Scaffold", None, Some(1), 0)
                .element("SubmitButton", Some("[<'submit_btn'>]"), None, 1)
                .element("Button", None, Some(2), 2),
        )
    }

    fn started_agent(bridge: Arc<FakeBridge>, token: Option<&str>) -> (Agent, SocketAddr) {
        let token = token.map(str::to_string);
        let mut agent = Agent::init(bridge, |cfg| {
            // Ephemeral port keeps parallel tests off each other's toes.
            let cfg = cfg.enable().port(0);
            if let Some(token) = &token {
                cfg.auth_token(token);
            }
            cfg
        });
        let addr = agent.start().unwrap().unwrap();
        (agent, addr)
    }

    type Client = tokio_tungstenite::WebSocketStream<
        tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
    >;

    async fn connect(addr: SocketAddr, token: Option<&str>) -> Client {
        let mut request = format!("ws://{addr}").into_client_request().unwrap();
        if let Some(token) = token {
            request.headers_mut().insert(
                "Authorization",
                format!("Bearer {token}").parse().unwrap(),
            );
        }
        let (ws, _) = tokio_tungstenite::connect_async(request).await.unwrap();
        ws
    }

    async fn request(client: &mut Client, frame: Value) -> Value {
        client
            .send(Message::Text(frame.to_string().into()))
            .await
            .unwrap();
        loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => return serde_json::from_str(text.as_str()).unwrap(),
                _ => continue,
            }
        }
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    #[tokio::test]
    async fn ws_round_trip_ping() {
        let (agent, addr) = started_agent(app_bridge(), None);
        let mut client = connect(addr, None).await;
        let reply = request(&mut client, json!({ "id": 1, "method": "ping" })).await;
        assert_eq!(reply["result"], "pong");
        drop(client);
        drop(agent);
    }

    #[tokio::test]
    async fn ws_tap_by_key_end_to_end() {
        let bridge = app_bridge();
        let (agent, addr) = started_agent(bridge.clone(), None);
        let mut client = connect(addr, None).await;
        let reply = request(
            &mut client,
            json!({ "id": 1, "method": "tap", "params": { "selector": "#submit_btn" } }),
        )
        .await;
        assert_eq!(reply["result"]["status"], "tapped");
        assert_eq!(reply["result"]["element"]["key"], "submit_btn");

        // Host saw the pointer sequence plus the accessibility tap.
        let events = bridge.pointer_events();
        assert_eq!(events.len(), 3);
        assert_eq!(bridge.performed_actions().len(), 1);
        drop(agent);
    }

    #[tokio::test]
    async fn unauthorized_handshake_closes_before_framing() {
        let (agent, addr) = started_agent(app_bridge(), Some("s3cret"));

        // No token at all.
        let request_no_auth = format!("ws://{addr}").into_client_request().unwrap();
        let err = tokio_tungstenite::connect_async(request_no_auth)
            .await
            .unwrap_err();
        match err {
            tokio_tungstenite::tungstenite::Error::Http(response) => {
                assert_eq!(response.status(), 401);
            }
            other => panic!("expected HTTP rejection, got {other:?}"),
        }

        // Wrong token.
        let mut bad = format!("ws://{addr}").into_client_request().unwrap();
        bad.headers_mut()
            .insert("Authorization", "Bearer nope".parse().unwrap());
        assert!(tokio_tungstenite::connect_async(bad).await.is_err());

        // Right token frames normally.
        let mut client = connect(addr, Some("s3cret")).await;
        let reply = request(&mut client, json!({ "id": 1, "method": "ping" })).await;
        assert_eq!(reply["result"], "pong");
        drop(agent);
    }

    #[tokio::test]
    async fn accessibility_activation_tracks_connection_count() {
        let bridge = app_bridge();
        let (agent, addr) = started_agent(bridge.clone(), None);
        assert_eq!(bridge.active_count(), 0);

        let b = bridge.clone();
        let mut first = connect(addr, None).await;
        wait_until(move || b.active_count() == 1).await;

        // A second driver does not re-ensure.
        let mut second = connect(addr, None).await;
        let reply = request(&mut second, json!({ "id": 1, "method": "ping" })).await;
        assert_eq!(reply["result"], "pong");
        assert_eq!(bridge.active_count(), 1);

        first.close(None).await.unwrap();
        let b = bridge.clone();
        wait_until(move || b.active_count() == 1).await;
        second.close(None).await.unwrap();
        let b = bridge.clone();
        wait_until(move || b.active_count() == 0).await;
        drop(agent);
    }

    #[tokio::test]
    async fn recording_broadcasts_pointer_ups() {
        let bridge = app_bridge();
        let (agent, addr) = started_agent(bridge.clone(), None);
        let mut client = connect(addr, None).await;

        let reply = request(&mut client, json!({ "id": 1, "method": "startRecording" })).await;
        assert_eq!(reply["result"]["status"], "recording");

        // The host reports a raw pointer-up on the submit button's center.
        bridge.emit_pointer_up(accesskit::Point::new(60.0, 40.0));

        let notification = loop {
            match client.next().await.unwrap().unwrap() {
                Message::Text(text) => {
                    let frame: Value = serde_json::from_str(text.as_str()).unwrap();
                    if frame["method"] == "recording.event" {
                        break frame;
                    }
                }
                _ => continue,
            }
        };
        assert_eq!(notification["params"]["action"], "tap");
        assert_eq!(notification["params"]["selector"], "#submit_btn");
        assert_eq!(notification["params"]["x"], 60.0);
        drop(agent);
    }

    #[tokio::test]
    async fn pointer_ups_ignored_while_not_recording() {
        let bridge = app_bridge();
        let (agent, addr) = started_agent(bridge.clone(), None);
        let mut client = connect(addr, None).await;

        bridge.emit_pointer_up(accesskit::Point::new(60.0, 40.0));
        // A follow-up request must come straight back with no notification
        // in between.
        let reply = request(&mut client, json!({ "id": 1, "method": "ping" })).await;
        assert_eq!(reply["result"], "pong");
        drop(agent);
    }

    #[tokio::test]
    async fn observability_flows_host_to_driver() {
        let bridge = app_bridge();
        let (agent, addr) = started_agent(bridge.clone(), None);
        let mut client = connect(addr, None).await;

        bridge.emit_error(HostError {
            source: ErrorSource::Framework,
            message: "layout overflow".into(),
            stack: Some("#0 layout".into()),
        });
        bridge.emit_log("hello from host");
        bridge.emit_timing(FrameTiming {
            build_micros: 500,
            raster_micros: 700,
            total_micros: 1200,
        });
        bridge.emit_route(RouteEvent::Pushed("/checkout".into()));

        let reply = request(&mut client, json!({ "id": 1, "method": "getErrors" })).await;
        assert_eq!(reply["result"][0]["message"], "layout overflow");

        let reply = request(&mut client, json!({ "id": 2, "method": "getLogs" })).await;
        assert_eq!(reply["result"][0]["message"], "hello from host");

        let reply = request(
            &mut client,
            json!({ "id": 3, "method": "getPerformanceMetrics" }),
        )
        .await;
        assert_eq!(reply["result"][0]["buildMicroseconds"], 500);

        let reply = request(&mut client, json!({ "id": 4, "method": "getRoute" })).await;
        assert_eq!(reply["result"], "/checkout");
        drop(agent);
    }

    #[tokio::test]
    async fn disabled_agent_does_not_bind() {
        let mut agent = Agent::init(app_bridge(), |cfg| cfg.disable());
        assert_eq!(agent.start().unwrap(), None);
        assert!(!agent.is_running());
    }

    #[tokio::test]
    async fn start_is_idempotent_and_shutdown_clears() {
        let (mut agent, addr) = started_agent(app_bridge(), None);
        assert_eq!(agent.start().unwrap(), Some(addr));
        agent.shutdown();
        assert!(!agent.is_running());
        assert_eq!(agent.local_addr(), None);
    }
}
