//! `RelayServer`: Axum HTTP + WebSocket server.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::Router;
use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{Query, State};
use axum::http::{StatusCode, header};
use axum::middleware;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use metrics::counter;
use metrics_exporter_prometheus::PrometheusHandle;
use serde_json::json;
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::config::ServerConfig;
use crate::health::{self, HealthResponse};
use crate::http::firmware::FirmwareLocator;
use crate::http::ingress::{IngressLimiter, cors_layer, limit_requests};
use crate::metrics::FIRMWARE_LOOKUPS_TOTAL;
use crate::shutdown::ShutdownCoordinator;
use crate::websocket::admission::{self, ConnectParams};
use crate::websocket::heartbeat::run_liveness_monitor;
use crate::websocket::registry::HubRegistry;
use crate::websocket::session;

/// Errors starting the server.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The listen address could not be bound.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// Requested address.
        addr: String,
        /// Underlying error.
        source: std::io::Error,
    },
    /// Other socket error.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Shared state accessible from Axum handlers.
#[derive(Clone)]
pub struct AppState {
    /// Connection registry.
    pub hub: Arc<HubRegistry>,
    /// Server configuration.
    pub config: Arc<ServerConfig>,
    /// Shutdown coordinator.
    pub shutdown: Arc<ShutdownCoordinator>,
    /// When the server started.
    pub start_time: Instant,
    /// Prometheus handle; `/metrics` is 404 without one.
    pub metrics: Option<PrometheusHandle>,
    /// Firmware lookup; `/firmware/latest` is 404 without one.
    pub firmware: Option<Arc<FirmwareLocator>>,
}

/// The relay hub server.
pub struct RelayServer {
    config: Arc<ServerConfig>,
    hub: Arc<HubRegistry>,
    shutdown: Arc<ShutdownCoordinator>,
    ingress: Arc<IngressLimiter>,
    start_time: Instant,
    metrics: Option<PrometheusHandle>,
    firmware: Option<Arc<FirmwareLocator>>,
}

impl RelayServer {
    /// Create a new server with an empty registry.
    pub fn new(config: ServerConfig) -> Self {
        let hub = Arc::new(HubRegistry::new(config.hub_limits()));
        let ingress = Arc::new(IngressLimiter::new(
            config.http_rate_limit_max,
            config.http_rate_limit_window(),
        ));
        Self {
            config: Arc::new(config),
            hub,
            shutdown: Arc::new(ShutdownCoordinator::new()),
            ingress,
            start_time: Instant::now(),
            metrics: None,
            firmware: None,
        }
    }

    /// Serve `/metrics` from `handle`.
    #[must_use]
    pub fn with_metrics(mut self, handle: PrometheusHandle) -> Self {
        self.metrics = Some(handle);
        self
    }

    /// Serve `/firmware/latest` from `locator`.
    #[must_use]
    pub fn with_firmware(mut self, locator: FirmwareLocator) -> Self {
        self.firmware = Some(Arc::new(locator));
        self
    }

    /// Build the Axum router with all routes.
    pub fn router(&self) -> Router {
        let state = AppState {
            hub: self.hub.clone(),
            config: self.config.clone(),
            shutdown: self.shutdown.clone(),
            start_time: self.start_time,
            metrics: self.metrics.clone(),
            firmware: self.firmware.clone(),
        };

        let http = Router::new()
            .route("/health", get(health_handler))
            .route("/metrics", get(metrics_handler))
            .route("/firmware/latest", get(firmware_handler))
            .route_layer(middleware::from_fn_with_state(
                self.ingress.clone(),
                limit_requests,
            ));

        Router::new()
            .route("/ws", get(ws_handler))
            .merge(http)
            .layer(cors_layer(&self.config.cors_origins))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Bind, start serving, and start the liveness monitor.
    ///
    /// Returns the bound address and the server task. The task finishes
    /// after [`ShutdownCoordinator::shutdown`] once every connection has been
    /// drained.
    pub async fn listen(&self) -> Result<(SocketAddr, JoinHandle<()>), ServerError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind { addr, source })?;
        let local_addr = listener.local_addr()?;

        let token = self.shutdown.token();
        let monitor = tokio::spawn(run_liveness_monitor(
            self.hub.clone(),
            self.config.heartbeat_interval(),
            token.clone(),
        ));

        let app = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        let hub = self.hub.clone();
        let grace = self.config.close_grace();
        let drained = async move {
            token.cancelled().await;
            info!("shutdown requested, draining connections");
            hub.drain(grace).await;
        };

        let handle = tokio::spawn(async move {
            if let Err(error) = axum::serve(listener, app)
                .with_graceful_shutdown(drained)
                .await
            {
                error!(%error, "server terminated with error");
            }
            let _ = monitor.await;
            info!("server stopped");
        });

        info!(%local_addr, "relay hub listening");
        Ok((local_addr, handle))
    }

    /// Get the connection registry.
    pub fn hub(&self) -> &Arc<HubRegistry> {
        &self.hub
    }

    /// Get the shutdown coordinator.
    pub fn shutdown(&self) -> &Arc<ShutdownCoordinator> {
        &self.shutdown
    }

    /// Get the server configuration.
    pub fn config(&self) -> &ServerConfig {
        &self.config
    }
}

/// GET /ws: admit and upgrade.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<ConnectParams>,
    State(state): State<AppState>,
) -> Response {
    if state.shutdown.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "server shutting down").into_response();
    }

    let ws = ws
        .max_message_size(state.config.max_message_size)
        .max_frame_size(state.config.max_message_size);
    let grace = state.config.close_grace();

    match admission::admit(&params) {
        Ok(role) => ws
            .on_upgrade(move |socket| session::run_session(socket, role, state.hub, grace))
            .into_response(),
        Err(error) => ws
            .on_upgrade(move |socket| session::reject(socket, error, grace))
            .into_response(),
    }
}

/// GET /health
async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(health::health_check(
        state.start_time,
        state.hub.connection_count(),
        state.hub.device_count(),
        state.hub.product_count(),
    ))
}

/// GET /metrics
async fn metrics_handler(State(state): State<AppState>) -> Response {
    match state.metrics {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            crate::metrics::render(&handle),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

/// GET /firmware/latest
async fn firmware_handler(State(state): State<AppState>) -> Response {
    let Some(locator) = state.firmware else {
        counter!(FIRMWARE_LOOKUPS_TOTAL, "outcome" => "unconfigured").increment(1);
        return (
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "firmware lookup not configured" })),
        )
            .into_response();
    };

    match locator.latest().await {
        Ok(release) => {
            counter!(FIRMWARE_LOOKUPS_TOTAL, "outcome" => "found").increment(1);
            Json(release).into_response()
        }
        Err(error) => {
            let status = error.status();
            if status == StatusCode::NOT_FOUND {
                counter!(FIRMWARE_LOOKUPS_TOTAL, "outcome" => "empty").increment(1);
            } else {
                counter!(FIRMWARE_LOOKUPS_TOTAL, "outcome" => "error").increment(1);
                warn!(%error, "firmware lookup failed");
            }
            (status, Json(json!({ "error": error.to_string() }))).into_response()
        }
    }
}
