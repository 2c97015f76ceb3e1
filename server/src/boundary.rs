//! Request error boundary and not-found fallback.
//!
//! Every failure raised while handling a request ends up here, either as a
//! [`HandlerError`] returned from a handler or as a panic caught by
//! [`handle_panic`]. The boundary logs the failure first and then builds the
//! response:
//!
//! - known failures ([`AppError`]) get their status code and the serialized
//!   `{status, statusCode, message}` body
//! - anything else gets a generic `500` with no internal detail
//!
//! Requests that match no route never reach the boundary; [`not_found`]
//! answers them directly.
//!
//! # Example
//!
//! ```rust
//! use axum::{routing::get, Router};
//! use hestate_server::boundary::HandlerResult;
//! use hestate_server::error::AppError;
//!
//! async fn get_user() -> HandlerResult<String> {
//!     Err(AppError::not_found("User not found").into())
//! }
//!
//! let app: Router = Router::new().route("/user", get(get_user));
//! ```

use std::any::Any;

use axum::extract::OriginalUri;
use axum::http::uri::PathAndQuery;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde::{Deserialize, Serialize};

use crate::error::AppError;
use crate::log_error;
use crate::logging::Logger;

const LOG: Logger = Logger::new("Server");

/// Message sent for failures outside the taxonomy.
pub const INTERNAL_ERROR_MESSAGE: &str = "Internal Server Error";

/// Body used for unknown failures and route misses.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MessageBody {
    /// Human-readable message.
    pub message: String,
}

/// Any failure returned by a route handler.
///
/// Converts from every error type through `?`, so handlers never forward
/// failures by hand. Whether the failure is known is decided by type: it is
/// known exactly when the wrapped error is an [`AppError`].
#[derive(Debug)]
pub struct HandlerError(anyhow::Error);

/// Result type for route handlers.
pub type HandlerResult<T> = Result<T, HandlerError>;

impl HandlerError {
    /// Returns the taxonomy error, if this failure is one.
    #[must_use]
    pub fn known(&self) -> Option<&AppError> {
        self.0.downcast_ref::<AppError>()
    }

    /// Returns `true` if this failure is a taxonomy member.
    #[must_use]
    pub fn is_known(&self) -> bool {
        self.known().is_some()
    }

    /// Unwraps the underlying error.
    #[must_use]
    pub fn into_inner(self) -> anyhow::Error {
        self.0
    }
}

impl<E> From<E> for HandlerError
where
    E: Into<anyhow::Error>,
{
    fn from(err: E) -> Self {
        Self(err.into())
    }
}

impl IntoResponse for HandlerError {
    fn into_response(self) -> Response {
        // Logged before the response exists so the failure is recorded even if
        // writing the response fails later.
        match self.known() {
            Some(err) => {
                log_error!(
                    LOG,
                    status_code = err.status_code().as_u16(),
                    kind = %err.kind(),
                    details = %format!("{:#}", self.0),
                    "Request failed"
                );
                known_response(err)
            }
            None => {
                log_error!(LOG, details = ?self.0, "Unhandled request failure");
                internal_error_response()
            }
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        HandlerError::from(self).into_response()
    }
}

/// Builds the structured response for a known failure.
fn known_response(err: &AppError) -> Response {
    (err.status_code(), Json(err.serialize())).into_response()
}

/// Builds the opaque response for an unknown failure.
pub fn internal_error_response() -> Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(MessageBody {
            message: INTERNAL_ERROR_MESSAGE.to_string(),
        }),
    )
        .into_response()
}

/// Converts a caught handler panic into a response.
///
/// Used with `tower_http::catch_panic::CatchPanicLayer::custom`. Panics are
/// never taxonomy members, so they always get the opaque `500`.
pub fn handle_panic(payload: Box<dyn Any + Send + 'static>) -> Response {
    let details = if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else {
        "unknown panic payload".to_string()
    };

    log_error!(LOG, details = %details, "Request handler panicked");
    internal_error_response()
}

/// Fallback for requests that match no route.
///
/// Responds `404` with `{"message": "<path> not found"}`, where the path is
/// the original request path and query string, unmodified.
pub async fn not_found(OriginalUri(uri): OriginalUri) -> Response {
    let path = uri
        .path_and_query()
        .map_or_else(|| uri.path(), PathAndQuery::as_str);

    (
        StatusCode::NOT_FOUND,
        Json(MessageBody {
            message: format!("{path} not found"),
        }),
    )
        .into_response()
}
