//! HTTP routes for the Hestate server.
//!
//! # Endpoints
//!
//! - `GET /health` - Health check with database and realtime status
//! - `GET /socket` - WebSocket connection to the realtime hub
//!
//! Domain route groups are merged into [`app_routes`] by the caller before
//! [`crate::server::build_app`] mounts the fallback and middleware.
//!
//! # Example
//!
//! ```rust,no_run
//! use hestate_server::config::Config;
//! use hestate_server::database::DbStatus;
//! use hestate_server::routes::{app_routes, AppState};
//! use tokio::sync::watch;
//!
//! let config = Config::from_env().expect("failed to load config");
//! let (_status_tx, status_rx) = watch::channel(DbStatus::Connected);
//! let state = AppState::new(config, status_rx);
//! let router: axum::Router = app_routes().with_state(state);
//! ```

use std::sync::Arc;
use std::time::Instant;

use axum::extract::ws::rejection::WebSocketUpgradeRejection;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::header::ORIGIN;
use axum::http::HeaderMap;
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::watch;
use tracing::{debug, info, trace, warn};

use crate::boundary::HandlerResult;
use crate::config::Config;
use crate::database::DbStatus;
use crate::error::AppError;
use crate::realtime::{RealtimeHub, RealtimeMessage};

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    /// Server configuration.
    pub config: Arc<Config>,

    /// Realtime hub, absent when realtime setup failed.
    pub realtime: Option<RealtimeHub>,

    /// Database connection status.
    pub database: watch::Receiver<DbStatus>,

    /// Server start time, for uptime.
    pub start_time: Instant,
}

impl AppState {
    /// Creates state without a realtime hub.
    #[must_use]
    pub fn new(config: Config, database: watch::Receiver<DbStatus>) -> Self {
        Self {
            config: Arc::new(config),
            realtime: None,
            database,
            start_time: Instant::now(),
        }
    }

    /// Attaches a realtime hub.
    #[must_use]
    pub fn with_realtime(mut self, hub: RealtimeHub) -> Self {
        self.realtime = Some(hub);
        self
    }
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("config", &self.config)
            .field("realtime", &self.realtime.is_some())
            .field("database", &*self.database.borrow())
            .field("start_time", &self.start_time)
            .finish()
    }
}

/// Routes served by the platform itself.
pub fn app_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(get_health))
        .route("/socket", get(get_socket))
}

// ============================================================================
// GET /socket - Realtime WebSocket
// ============================================================================

/// GET /socket - Upgrade to a realtime WebSocket.
///
/// # Responses
///
/// - `101 Switching Protocols` - Connected to the realtime hub
/// - `400 Bad Request` - Not a WebSocket upgrade request
/// - `401 Unauthorized` - `Origin` header does not match the client origin
/// - `503 Service Unavailable` - Realtime setup failed at startup
async fn get_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    ws: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> HandlerResult<Response> {
    if let Some(origin) = headers.get(ORIGIN) {
        if origin.as_bytes() != state.config.client_origin().as_bytes() {
            return Err(AppError::not_authorized("Origin not allowed").into());
        }
    }

    let hub = state
        .realtime
        .clone()
        .ok_or_else(|| AppError::server_unavailable("Realtime service is unavailable"))?;

    let ws = ws.map_err(|rejection| AppError::bad_request(rejection.body_text()))?;

    info!("Realtime client connecting");
    Ok(ws.on_upgrade(move |socket| handle_socket(socket, hub)))
}

/// Handles an established WebSocket connection.
///
/// Forwards hub messages to the client and emits well-formed client
/// messages to the hub.
async fn handle_socket(socket: WebSocket, hub: RealtimeHub) {
    let (mut sender, mut receiver) = socket.split();
    let mut messages = hub.subscribe();

    info!(connections = hub.connection_count(), "Realtime client connected");

    let forward_task = tokio::spawn(async move {
        loop {
            match messages.recv().await {
                Ok(message) => match serde_json::to_string(&message) {
                    Ok(json) => {
                        if let Err(err) = sender.send(Message::Text(json.into())).await {
                            debug!(error = %err, "Failed to send realtime message");
                            break;
                        }
                    }
                    Err(err) => warn!(error = %err, "Failed to serialize realtime message"),
                },
                Err(RecvError::Lagged(count)) => {
                    warn!(skipped = count, "Realtime client lagged, skipped messages");
                }
                Err(RecvError::Closed) => break,
            }
        }
    });

    while let Some(frame) = receiver.next().await {
        match frame {
            Ok(Message::Text(text)) => match serde_json::from_str::<RealtimeMessage>(text.as_str()) {
                Ok(message) => {
                    hub.emit(message);
                }
                Err(err) => debug!(error = %err, "Ignoring malformed realtime message"),
            },
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(data)) => trace!(data_len = data.len(), "Received ping"),
            Ok(_) => {}
            Err(err) => {
                debug!(error = %err, "WebSocket error");
                break;
            }
        }
    }

    forward_task.abort();
    info!("Realtime client disconnected");
}

// ============================================================================
// GET /health - Health Check
// ============================================================================

/// Response body for the health check endpoint.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HealthResponse {
    /// `ok` while the database is connected, `degraded` otherwise.
    pub status: String,

    /// Database connection status.
    pub database: DbStatus,

    /// Realtime connections on this process, `null` if realtime is down.
    pub realtime_connections: Option<usize>,

    /// Server uptime in seconds.
    pub uptime_seconds: u64,
}

/// GET /health - Health check endpoint.
///
/// Always responds `200`; degradation is reported in the body.
async fn get_health(State(state): State<AppState>) -> Json<HealthResponse> {
    let database = *state.database.borrow();
    let status = match database {
        DbStatus::Connected => "ok",
        DbStatus::Disconnected => "degraded",
    };

    Json(HealthResponse {
        status: status.to_string(),
        database,
        realtime_connections: state.realtime.as_ref().map(RealtimeHub::connection_count),
        uptime_seconds: state.start_time.elapsed().as_secs(),
    })
}

// ============================================================================
// Tests
// ============================================================================
