//! Connection handlers for the Parley server.
//!
//! This module wires the hub to its backends, serves the HTTP routes and runs
//! one task per WebSocket connection.

use crate::api;
use crate::config::Config;
use crate::metrics::{self, ConnectionMetricsGuard};
use crate::redis_store::{RedisBus, RedisStore};
use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use futures_util::{SinkExt, StreamExt};
use parley_core::{
    Hub, MembershipStore, MemoryBus, MemoryMembershipStore, MemoryMessageStore,
    MemorySessionStore, MessageStore, PubSub, SessionStore,
};
use parley_protocol::{codec, ClientEvent, ServerEvent};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

/// Shared server state.
pub struct AppState {
    /// The per-instance hub.
    pub hub: Arc<Hub>,
    /// Server configuration.
    pub config: Config,
    connections: AtomicUsize,
}

impl AppState {
    /// Create app state around a started or unstarted hub.
    #[must_use]
    pub fn new(hub: Arc<Hub>, config: Config) -> Self {
        Self {
            hub,
            config,
            connections: AtomicUsize::new(0),
        }
    }

    /// Current number of open connections.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }
}

/// Holds a connection slot until dropped.
struct ConnectionSlot {
    state: Arc<AppState>,
}

impl ConnectionSlot {
    fn acquire(state: &Arc<AppState>) -> Option<Self> {
        let max = state.config.limits.max_connections;
        state
            .connections
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < max).then_some(n + 1)
            })
            .ok()
            .map(|_| Self {
                state: Arc::clone(state),
            })
    }
}

impl Drop for ConnectionSlot {
    fn drop(&mut self) {
        self.state.connections.fetch_sub(1, Ordering::AcqRel);
    }
}

struct Backends {
    messages: Arc<dyn MessageStore>,
    membership: Arc<dyn MembershipStore>,
    sessions: Arc<dyn SessionStore>,
    bus: Arc<dyn PubSub>,
}

async fn connect_backends(config: &Config) -> Result<Backends> {
    match &config.relay.redis_url {
        Some(url) => {
            let store = Arc::new(
                RedisStore::connect(
                    url,
                    config.store.message_ttl_secs,
                    config.store.session_ttl_secs,
                )
                .await
                .context("Failed to connect Redis store")?,
            );
            let bus = Arc::new(
                RedisBus::connect(url)
                    .await
                    .context("Failed to connect Redis bus")?,
            );
            info!("Using Redis for storage and relay");
            Ok(Backends {
                messages: store.clone(),
                membership: store.clone(),
                sessions: store,
                bus,
            })
        }
        None => {
            warn!("No relay.redis_url configured; running single-instance in memory");
            Ok(Backends {
                messages: Arc::new(MemoryMessageStore::new()),
                membership: Arc::new(MemoryMembershipStore::new()),
                sessions: Arc::new(MemorySessionStore::with_ttl(Duration::from_secs(
                    config.store.session_ttl_secs,
                ))),
                bus: Arc::new(MemoryBus::new()),
            })
        }
    }
}

/// Build the HTTP router.
pub fn app(state: Arc<AppState>) -> Router {
    let ws_path = state.config.transport.websocket_path.clone();
    Router::new()
        .route(&ws_path, get(ws_handler))
        .route("/health", get(health_handler))
        .route("/api/online", get(api::online))
        .route("/api/users/:user_id/devices", get(api::user_devices))
        .route("/api/rooms/:room_id/members", get(api::room_members))
        .route("/api/messages/:message_id", get(api::message))
        .with_state(state)
}

/// Run the HTTP/WebSocket server until a shutdown signal arrives.
///
/// # Errors
///
/// Returns an error if the backends or the listener cannot be set up.
pub async fn run_server(config: Config) -> Result<()> {
    let backends = connect_backends(&config).await?;
    let instance_id = Uuid::new_v4().to_string();
    let hub = Arc::new(
        Hub::new(
            config.hub_config(instance_id),
            backends.messages,
            backends.membership,
            backends.bus,
        )
        .with_session_store(backends.sessions),
    );
    hub.start().context("Failed to start relay")?;

    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {:#}", e);
        }
    }

    let addr = config.bind_addr()?;
    let state = Arc::new(AppState::new(Arc::clone(&hub), config));
    let ws_path = state.config.transport.websocket_path.clone();
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;

    info!(instance = %hub.instance_id(), "Parley server listening on {}", addr);
    info!("WebSocket endpoint: ws://{}{}", addr, ws_path);

    axum::serve(listener, app(state))
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    hub.shutdown();
    info!("Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(error) = tokio::signal::ctrl_c().await {
        warn!(?error, "Failed to listen for shutdown signal");
    }
    info!("Shutdown signal received");
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    axum::Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "instance": state.hub.instance_id(),
        "relayConnected": state.hub.is_relay_connected(),
        "connections": state.connection_count(),
        "timestamp": parley_protocol::now_millis() / 1000,
    }))
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<Arc<AppState>>) -> Response {
    let Some(slot) = ConnectionSlot::acquire(&state) else {
        metrics::record_rejection();
        warn!(
            limit = state.config.limits.max_connections,
            "Connection limit reached"
        );
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    };

    ws.max_message_size(state.config.limits.max_message_size)
        .on_upgrade(move |socket| handle_websocket(socket, state, slot))
        .into_response()
}

/// Queue an event for this connection only.
fn reply(outbound: &mpsc::Sender<Arc<ServerEvent>>, event: ServerEvent) {
    if outbound.try_send(Arc::new(event)).is_err() {
        debug!("Reply dropped; outbound channel full or closed");
    }
}

/// Handle a WebSocket connection.
async fn handle_websocket(socket: WebSocket, state: Arc<AppState>, _slot: ConnectionSlot) {
    let _metrics_guard = ConnectionMetricsGuard::new();
    let session_id = Uuid::new_v4().to_string();
    let limits = &state.config.limits;
    let heartbeat = &state.config.heartbeat;

    debug!(session = %session_id, "WebSocket connected");

    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<Arc<ServerEvent>>(limits.outbound_capacity.max(1));
    let (mut sender, mut receiver) = socket.split();

    let period = Duration::from_millis(heartbeat.interval_ms.max(1));
    let idle_timeout = Duration::from_millis(heartbeat.timeout_ms);
    let mut ping = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
    let mut last_seen = Instant::now();

    let reason = loop {
        tokio::select! {
            Some(event) = outbound_rx.recv() => {
                match codec::encode_event(&event) {
                    Ok(text) => {
                        metrics::record_frame(text.len(), "outbound");
                        if sender.send(Message::Text(text)).await.is_err() {
                            break "send failed";
                        }
                    }
                    Err(e) => {
                        error!(session = %session_id, error = %e, "Failed to encode event");
                        metrics::record_error("encode");
                    }
                }
            }

            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(text.len(), "inbound");
                        if text.len() > limits.max_message_size {
                            reply(&outbound_tx, ServerEvent::error("Message too large"));
                            continue;
                        }
                        let start = Instant::now();
                        handle_event(&state, &session_id, &outbound_tx, &text);
                        metrics::record_latency(start.elapsed().as_secs_f64());
                    }
                    Some(Ok(Message::Binary(data))) => {
                        last_seen = Instant::now();
                        metrics::record_frame(data.len(), "inbound");
                        reply(&outbound_tx, ServerEvent::error("Binary frames are not supported"));
                    }
                    Some(Ok(Message::Ping(data))) => {
                        last_seen = Instant::now();
                        if sender.send(Message::Pong(data)).await.is_err() {
                            break "send failed";
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        last_seen = Instant::now();
                    }
                    Some(Ok(Message::Close(_))) => break "client close",
                    Some(Err(e)) => {
                        warn!(session = %session_id, error = %e, "WebSocket error");
                        metrics::record_error("websocket");
                        break "transport error";
                    }
                    None => break "transport close",
                }
            }

            _ = ping.tick() => {
                if last_seen.elapsed() > idle_timeout {
                    break "ping timeout";
                }
                if sender.send(Message::Ping(Vec::new())).await.is_err() {
                    break "send failed";
                }
            }
        }
    };

    state.hub.disconnect(&session_id, reason);
    debug!(session = %session_id, reason, "WebSocket disconnected");
}

/// Handle one client event frame.
fn handle_event(
    state: &AppState,
    session_id: &str,
    outbound: &mpsc::Sender<Arc<ServerEvent>>,
    text: &str,
) {
    let event = match codec::decode_client_event(text) {
        Ok(event) => event,
        Err(e) => {
            debug!(session = %session_id, error = %e, "Undecodable client frame");
            metrics::record_error("decode");
            reply(outbound, ServerEvent::error(format!("Invalid event: {e}")));
            return;
        }
    };

    let name = event.name();
    metrics::record_client_event(name);
    let hub = &state.hub;

    let result = match event {
        ClientEvent::Join(payload) => hub.join(session_id, payload, outbound.clone()).map(|_| None),
        ClientEvent::JoinRoom(room) => hub.join_room(session_id, &room.room_id).map(Some),
        ClientEvent::LeaveRoom(room) => hub.leave_room(session_id, &room.room_id).map(Some),
        ClientEvent::Message(send) => hub.send_message(session_id, send).map(|_| None),
        ClientEvent::Typing(room) => {
            hub.typing(session_id, &room.room_id, true);
            Ok(None)
        }
        ClientEvent::StopTyping(room) => {
            hub.typing(session_id, &room.room_id, false);
            Ok(None)
        }
    };

    match result {
        Ok(Some(confirmation)) => reply(outbound, confirmation),
        Ok(None) => {}
        Err(e) => {
            debug!(session = %session_id, event = name, error = %e, "Client event rejected");
            metrics::record_error("client_event");
            reply(outbound, ServerEvent::error(e.to_string()));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn state(max_connections: usize) -> Arc<AppState> {
        let mut config = Config::default();
        config.limits.max_connections = max_connections;
        let hub = Hub::new(
            config.hub_config("test".into()),
            Arc::new(MemoryMessageStore::new()),
            Arc::new(MemoryMembershipStore::new()),
            Arc::new(MemoryBus::new()),
        );
        Arc::new(AppState::new(Arc::new(hub), config))
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<ServerEvent>>) -> Vec<&'static str> {
        let mut names = Vec::new();
        while let Ok(event) = rx.try_recv() {
            names.push(event.name());
        }
        names
    }

    #[test]
    fn test_connection_slots_respect_limit() {
        let state = state(2);
        let a = ConnectionSlot::acquire(&state).unwrap();
        let _b = ConnectionSlot::acquire(&state).unwrap();
        assert!(ConnectionSlot::acquire(&state).is_none());
        assert_eq!(state.connection_count(), 2);

        drop(a);
        assert_eq!(state.connection_count(), 1);
        assert!(ConnectionSlot::acquire(&state).is_some());
    }

    #[tokio::test]
    async fn test_join_then_room_flow() {
        let state = state(10);
        let (tx, mut rx) = mpsc::channel(16);

        handle_event(&state, "s-1", &tx, r#"{"event":"join","data":{"userName":"alice"}}"#);
        assert_eq!(drain(&mut rx), vec!["joined", "user_status"]);

        handle_event(&state, "s-1", &tx, r#"{"event":"join_room","data":{"roomId":"general"}}"#);
        assert_eq!(drain(&mut rx), vec!["user_joined_room", "room_joined"]);

        handle_event(
            &state,
            "s-1",
            &tx,
            r#"{"event":"message","data":{"content":"hi","roomId":"general"}}"#,
        );
        assert_eq!(drain(&mut rx), vec!["message"]);
    }

    #[tokio::test]
    async fn test_errors_go_to_the_sender() {
        let state = state(10);
        let (tx, mut rx) = mpsc::channel(16);

        handle_event(&state, "s-1", &tx, "not json");
        assert_eq!(drain(&mut rx), vec!["error"]);

        // joining a room before joining as a user
        handle_event(&state, "s-1", &tx, r#"{"event":"join_room","data":{"roomId":"general"}}"#);
        assert_eq!(drain(&mut rx), vec!["error"]);

        handle_event(&state, "s-1", &tx, r#"{"event":"join","data":{"userName":""}}"#);
        assert_eq!(drain(&mut rx), vec!["error"]);
    }
}
