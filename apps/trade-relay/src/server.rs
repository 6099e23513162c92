use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{Context, Result};
use async_trait::async_trait;
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::{header, HeaderMap, StatusCode},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use bytes::Bytes;
use futures_util::{stream::SplitSink, SinkExt, StreamExt};
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ServerConfig;
use crate::relay::{ClientSink, ConnectionId, Relay, SinkError};
use crate::upstream::RedisFeed;
use crate::{STOCK_TRADE_PATH, STOCK_TRADE_TOPIC};

pub struct AppState {
    relay: Relay,
    allowed_hosts: Vec<String>,
    metrics: PrometheusHandle,
}

impl AppState {
    pub fn new(relay: Relay, allowed_hosts: Vec<String>, metrics: PrometheusHandle) -> Self {
        Self {
            relay,
            allowed_hosts,
            metrics,
        }
    }

    pub fn relay(&self) -> &Relay {
        &self.relay
    }

    /// An empty allow-list admits every host.
    fn host_allowed(&self, host: Option<&str>) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        match host {
            Some(host) => self.allowed_hosts.iter().any(|allowed| allowed == host),
            None => false,
        }
    }
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", get(health_handler))
        .route("/debug/stats", get(stats_handler))
        .route("/metrics", get(metrics_handler))
        .route(STOCK_TRADE_PATH, get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: ServerConfig, metrics: PrometheusHandle) -> Result<()> {
    let feed = RedisFeed::open(&config.redis_url)?;
    let relay = Relay::new(STOCK_TRADE_TOPIC, Arc::new(feed), config.relay.clone());
    let state = Arc::new(AppState::new(
        relay.clone(),
        config.allowed_hosts.clone(),
        metrics,
    ));

    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;
    info!(
        listen_addr = %config.listen_addr,
        path = STOCK_TRADE_PATH,
        topic = STOCK_TRADE_TOPIC,
        "trade-relay listening"
    );

    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .context("server shutdown with error")?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; stopping upstream feed"
    );
    relay.shutdown().await;
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}

async fn health_handler() -> impl IntoResponse {
    Json(json!({ "status": "ok" }))
}

async fn stats_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.relay.stats_snapshot())
}

async fn metrics_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        state.metrics.render(),
    )
}

async fn ws_handler(
    State(state): State<Arc<AppState>>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let host = headers
        .get(header::HOST)
        .and_then(|value| value.to_str().ok());
    if !state.host_allowed(host) {
        counter!("trade_relay_connections_rejected_total", 1);
        warn!(remote = %remote, host = ?host, "rejected stream request from unlisted host");
        return StatusCode::UNAUTHORIZED.into_response();
    }

    let relay = state.relay.clone();
    ws.on_failed_upgrade(move |err| {
        warn!(remote = %remote, error = %err, "websocket upgrade failed");
    })
    .on_upgrade(move |socket| serve_connection(socket, relay, remote))
    .into_response()
}

/// Own one client connection: register it, drain inbound frames until the
/// peer goes away, then deregister. Inbound data is ignored.
pub async fn serve_connection(socket: WebSocket, relay: Relay, remote: SocketAddr) {
    let (ws_tx, mut ws_rx) = socket.split();
    let client = Arc::new(WsClient::new(ws_tx));
    let registration = relay.attach(client.clone());
    info!(
        connection_id = %registration.id(),
        remote = %remote,
        first = registration.was_first(),
        "stream client connected"
    );

    while let Some(message) = ws_rx.next().await {
        match message {
            Ok(Message::Close(frame)) => {
                debug!(
                    connection_id = %registration.id(),
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
            Ok(_) => continue,
            Err(err) => {
                debug!(
                    connection_id = %registration.id(),
                    error = %err,
                    "error receiving from client"
                );
                break;
            }
        }
    }

    let id = registration.id();
    drop(registration);
    client.close().await;
    info!(connection_id = %id, remote = %remote, "stream client disconnected");
}

/// Text frame for UTF-8 payloads, binary otherwise.
pub fn outbound_frame(payload: Bytes) -> Message {
    match String::from_utf8(payload.to_vec()) {
        Ok(text) => Message::Text(text),
        Err(err) => Message::Binary(err.into_bytes()),
    }
}

pub struct WsClient {
    id: ConnectionId,
    sink: tokio::sync::Mutex<SplitSink<WebSocket, Message>>,
    closed: AtomicBool,
}

impl WsClient {
    fn new(sink: SplitSink<WebSocket, Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sink: tokio::sync::Mutex::new(sink),
            closed: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl ClientSink for WsClient {
    fn id(&self) -> ConnectionId {
        self.id
    }

    async fn send(&self, payload: Bytes) -> Result<(), SinkError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let mut sink = self.sink.lock().await;
        sink.send(outbound_frame(payload))
            .await
            .map_err(|err| SinkError::Transport(err.to_string()))
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let mut sink = self.sink.lock().await;
        let _ = sink.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use feed_bus::LocalFeed;
    use metrics_exporter_prometheus::PrometheusBuilder;

    fn state_with_hosts(hosts: &[&str]) -> AppState {
        let relay = Relay::new(
            STOCK_TRADE_TOPIC,
            Arc::new(LocalFeed::new()),
            Default::default(),
        );
        let metrics = PrometheusBuilder::new().build_recorder().handle();
        AppState::new(relay, hosts.iter().map(|h| h.to_string()).collect(), metrics)
    }

    #[test_timeout::timeout(5)]
    fn utf8_payloads_go_out_as_text() {
        match outbound_frame(Bytes::from_static(b"[{\"id\":\"BIZ1\"}]")) {
            Message::Text(text) => assert_eq!(text, "[{\"id\":\"BIZ1\"}]"),
            other => panic!("expected text frame, got {other:?}"),
        }
        match outbound_frame(Bytes::from_static(&[0xff, 0x00, 0x10])) {
            Message::Binary(data) => assert_eq!(data, vec![0xff, 0x00, 0x10]),
            other => panic!("expected binary frame, got {other:?}"),
        }
    }

    #[test_timeout::timeout(5)]
    fn host_allow_list() {
        let open = state_with_hosts(&[]);
        assert!(open.host_allowed(None));
        assert!(open.host_allowed(Some("anything:1")));

        let locked = state_with_hosts(&["relay.local:9090"]);
        assert!(locked.host_allowed(Some("relay.local:9090")));
        assert!(!locked.host_allowed(Some("evil.example")));
        assert!(!locked.host_allowed(None));
    }
}
