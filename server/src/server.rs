//! Router assembly.
//!
//! [`build_app`] takes the fully registered routes and mounts, in order:
//!
//! 1. the not-found fallback, after every route
//! 2. the panic boundary, closest to the handlers
//! 3. the standard middleware stack, outermost last
//!
//! A request therefore passes through tracing, session, parameter pollution
//! guard, security headers, CORS, compression and the body limit before it
//! reaches a handler.
//!
//! Failures are logged once, by the boundary; the trace layer only records
//! request spans and responses.

use axum::extract::DefaultBodyLimit;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::Router;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::compression::CompressionLayer;
use tower_http::trace::TraceLayer;

use crate::boundary::{handle_panic, not_found};
use crate::error::ServerError;
use crate::routes::AppState;
use crate::security::{cors_layer, parameter_pollution_guard, security_headers};
use crate::session::{session_layer, SessionConfig};

/// Maximum accepted request body size (50 MiB).
pub const MAX_BODY_SIZE: usize = 50 * 1024 * 1024;

/// Builds the application router around `routes`.
///
/// # Errors
///
/// Returns `ServerError` if the CORS origin or the session keys cannot be
/// built from the configuration.
pub fn build_app(state: AppState, routes: Router<AppState>) -> Result<Router, ServerError> {
    let cors = cors_layer(&state.config)?;
    let session = SessionConfig::from_config(&state.config)?;

    Ok(routes
        .fallback(not_found)
        .with_state(state)
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(DefaultBodyLimit::max(MAX_BODY_SIZE))
        .layer(CompressionLayer::new())
        .layer(cors)
        .layer(from_fn(security_headers))
        .layer(from_fn(parameter_pollution_guard))
        .layer(from_fn_with_state(session, session_layer))
        .layer(TraceLayer::new_for_http().on_failure(())))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request, StatusCode};
    use axum::response::Response;
    use axum::routing::get;
    use tokio::sync::watch;
    use tower::ServiceExt;

    use crate::config::Config;
    use crate::database::DbStatus;
    use crate::routes::app_routes;

    fn test_state() -> AppState {
        let config = Config {
            client_base_url: "https://app.hestate.example".to_string(),
            mongodb_url: "mongodb://localhost:27017/hestate".to_string(),
            node_env: "production".to_string(),
            jwt_token: "jwt".to_string(),
            first_secret_key: "first".to_string(),
            second_secret_key: "second".to_string(),
            redis_host: "redis://localhost:6379".to_string(),
            port: 0,
        };
        let (_tx, rx) = watch::channel(DbStatus::Connected);
        AppState::new(config, rx)
    }

    async fn explode() -> &'static str {
        panic!("handler blew up")
    }

    fn app() -> Router {
        let routes = app_routes().route("/explode", get(explode));
        build_app(test_state(), routes).unwrap()
    }

    async fn request(uri: &str) -> Response {
        app()
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn registered_routes_are_served() {
        let response = request("/health").await;
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn unmatched_route_gets_fallback_with_original_query() {
        let response = request("/api/v2/ghost?x=1&x=2").await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            body_json(response).await,
            serde_json::json!({"message": "/api/v2/ghost?x=1&x=2 not found"})
        );
    }

    #[tokio::test]
    async fn panic_becomes_opaque_500() {
        let response = request("/explode").await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let json = body_json(response).await;
        assert_eq!(json, serde_json::json!({"message": "Internal Server Error"}));
    }

    #[tokio::test]
    async fn fallback_responses_carry_security_headers() {
        let response = request("/nowhere").await;
        assert_eq!(response.headers()["x-content-type-options"], "nosniff");
        assert!(response.headers().get(header::SET_COOKIE).is_none());
    }

    #[test]
    fn empty_session_secret_fails_assembly() {
        let mut state = test_state();
        let mut config = (*state.config).clone();
        config.first_secret_key.clear();
        state.config = std::sync::Arc::new(config);

        let err = build_app(state, app_routes()).unwrap_err();
        assert!(matches!(err, ServerError::Session(_)));
    }
}
