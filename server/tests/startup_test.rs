//! End-to-end tests against a running server.
//!
//! The server is started through [`Application::start`] on port 0 with a
//! scripted database connector and an unreachable Redis, then exercised over
//! real HTTP with reqwest.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use axum::routing::get;
use axum::Router;
use reqwest::StatusCode;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;

use hestate_server::app::Application;
use hestate_server::boundary::HandlerResult;
use hestate_server::config::{Config, ConfigError};
use hestate_server::database::{Connector, DatabaseError, ReconnectPolicy};
use hestate_server::error::{AppError, ServerError};
use hestate_server::routes::AppState;

const CLIENT_ORIGIN: &str = "http://localhost:3000";

/// Database connector with a fixed outcome.
struct StubConnector {
    outcome: Result<(), DatabaseError>,
    connects: AtomicUsize,
}

#[async_trait]
impl Connector for StubConnector {
    async fn connect(&self) -> Result<(), DatabaseError> {
        self.connects.fetch_add(1, Ordering::SeqCst);
        self.outcome.clone()
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        self.outcome.clone()
    }
}

fn healthy() -> Arc<StubConnector> {
    Arc::new(StubConnector {
        outcome: Ok(()),
        connects: AtomicUsize::new(0),
    })
}

fn unreachable_database() -> Arc<StubConnector> {
    Arc::new(StubConnector {
        outcome: Err(DatabaseError::Connection("connection refused".to_string())),
        connects: AtomicUsize::new(0),
    })
}

fn env_vars() -> HashMap<&'static str, String> {
    HashMap::from([
        ("CLIENT_BASE_URL", CLIENT_ORIGIN.to_string()),
        ("MONGODB_URL", "mongodb://localhost:27017/hestate".to_string()),
        ("NODE_ENV", "development".to_string()),
        ("JWT_TOKEN", "jwt".to_string()),
        ("FIRST_SECRET_KEY", "first".to_string()),
        ("SECOND_SECRET_KEY", "second".to_string()),
        ("REDIS_HOST", "redis://127.0.0.1:1".to_string()),
        ("PORT", "0".to_string()),
    ])
}

fn test_config() -> Config {
    let vars = env_vars();
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

async fn listing() -> HandlerResult<&'static str> {
    Err(AppError::not_found("Listing not found").into())
}

fn domain_routes() -> Router<AppState> {
    Router::new().route("/api/v1/listings/{id}", get(listing))
}

/// A running server and the means to stop it.
struct TestServer {
    addr: SocketAddr,
    shutdown: oneshot::Sender<()>,
    handle: JoinHandle<Result<(), ServerError>>,
}

impl TestServer {
    async fn start() -> Self {
        let app = Application::start(
            test_config(),
            healthy(),
            ReconnectPolicy::default(),
            domain_routes(),
        )
        .await
        .unwrap();

        let port = app.local_addr().port();
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let (shutdown, signal) = oneshot::channel();
        let handle = tokio::spawn(app.run_until(async move {
            let _ = signal.await;
        }));

        Self {
            addr,
            shutdown,
            handle,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    async fn stop(self) {
        self.shutdown.send(()).unwrap();
        self.handle.await.unwrap().unwrap();
    }
}

// ============================================================================
// Running server
// ============================================================================

#[tokio::test]
async fn health_reports_database_and_disabled_realtime() {
    let server = TestServer::start().await;

    let response = reqwest::get(server.url("/health")).await.unwrap();
    assert_eq!(response.status(), StatusCode::OK);

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["status"], "ok");
    assert_eq!(json["database"], "connected");
    assert!(json["realtimeConnections"].is_null());

    server.stop().await;
}

#[tokio::test]
async fn domain_route_errors_are_structured() {
    let server = TestServer::start().await;

    let response = reqwest::get(server.url("/api/v1/listings/42")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(
        json,
        serde_json::json!({"status": "error", "statusCode": 404, "message": "Listing not found"})
    );

    server.stop().await;
}

#[tokio::test]
async fn unmatched_path_reports_original_query() {
    let server = TestServer::start().await;

    let response = reqwest::get(server.url("/api/v2/ghost?x=1&x=2")).await.unwrap();
    assert_eq!(response.status(), StatusCode::NOT_FOUND);

    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json, serde_json::json!({"message": "/api/v2/ghost?x=1&x=2 not found"}));

    server.stop().await;
}

#[tokio::test]
async fn socket_is_unavailable_without_redis() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .get(server.url("/socket"))
        .header("Origin", CLIENT_ORIGIN)
        .header("Connection", "Upgrade")
        .header("Upgrade", "websocket")
        .header("Sec-WebSocket-Version", "13")
        .header("Sec-WebSocket-Key", "dGhlIHNhbXBsZSBub25jZQ==")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    let json: serde_json::Value = response.json().await.unwrap();
    assert_eq!(json["statusCode"], 503);

    server.stop().await;
}

#[tokio::test]
async fn preflight_allows_client_origin() {
    let server = TestServer::start().await;

    let response = reqwest::Client::new()
        .request(reqwest::Method::OPTIONS, server.url("/api/v1/listings/42"))
        .header("Origin", CLIENT_ORIGIN)
        .header("Access-Control-Request-Method", "DELETE")
        .send()
        .await
        .unwrap();

    assert_eq!(response.status(), StatusCode::OK);
    assert_eq!(
        response.headers()["access-control-allow-origin"],
        CLIENT_ORIGIN
    );
    assert_eq!(response.headers()["access-control-allow-credentials"], "true");

    server.stop().await;
}

#[tokio::test]
async fn responses_carry_security_headers() {
    let server = TestServer::start().await;

    let response = reqwest::get(server.url("/health")).await.unwrap();
    let headers = response.headers();
    assert_eq!(headers["x-content-type-options"], "nosniff");
    assert_eq!(headers["x-frame-options"], "SAMEORIGIN");
    assert!(headers.contains_key("content-security-policy"));

    server.stop().await;
}

// ============================================================================
// Startup failures
// ============================================================================

#[tokio::test]
async fn first_database_failure_exits_without_opening_a_port() {
    // Held for the whole test: a bind attempt would surface as a Bind error.
    let occupied = TcpListener::bind("0.0.0.0:0").await.unwrap();

    let mut config = test_config();
    config.port = occupied.local_addr().unwrap().port();

    let database = unreachable_database();
    let err = Application::start(
        config,
        database.clone(),
        ReconnectPolicy::default(),
        domain_routes(),
    )
    .await
    .unwrap_err();

    assert!(matches!(err, ServerError::Database(_)), "got {err:?}");
    assert_eq!(err.exit_code(), 1);
    assert_eq!(database.connects.load(Ordering::SeqCst), 1, "first failure is not retried");
}

#[test]
fn missing_configuration_fails_before_construction() {
    let mut vars = env_vars();
    vars.remove("REDIS_HOST");

    let err = Config::from_lookup(|key| vars.get(key).cloned()).unwrap_err();
    assert_eq!(err, ConfigError::MissingEnvVar("REDIS_HOST".to_string()));

    let err = ServerError::from(err);
    assert_eq!(err.exit_code(), 1);
}
