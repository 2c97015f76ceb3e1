//! Error types for the Hestate server.
//!
//! This module defines the closed taxonomy of request-level failures and the
//! top-level bootstrap error.
//!
//! # Error Types
//!
//! - [`AppError`] - Known request failures, each mapped to one HTTP status code
//! - [`ErrorResponse`] - The JSON body produced for an [`AppError`]
//! - [`ServerError`] - Fatal startup failures that terminate the process
//!
//! # Example
//!
//! ```rust
//! use hestate_server::error::AppError;
//!
//! let err = AppError::bad_request("Invalid email");
//! let body = err.serialize();
//!
//! assert_eq!(body.status, "error");
//! assert_eq!(body.status_code, 400);
//! assert_eq!(body.message, "Invalid email");
//! ```

use std::fmt;

use axum::http::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error as ThisError;

use crate::config::ConfigError;
use crate::database::DatabaseError;

/// Status label carried by every serialized [`AppError`].
pub const ERROR_STATUS: &str = "error";

/// The kind of a known request failure.
///
/// Each kind has a fixed HTTP status code. The set is closed: adding a kind
/// means adding a variant here and in [`AppError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Malformed or invalid client input.
    BadRequest,
    /// Requested resource is absent.
    NotFound,
    /// Missing or invalid credentials.
    NotAuthorized,
    /// Payload exceeds the size limit.
    FileTooLarge,
    /// An upstream or internal dependency failed.
    ServerUnavailable,
    /// Request body failed schema or shape validation.
    Validation,
}

impl ErrorKind {
    /// Every kind, in declaration order.
    pub const ALL: [ErrorKind; 6] = [
        Self::BadRequest,
        Self::NotFound,
        Self::NotAuthorized,
        Self::FileTooLarge,
        Self::ServerUnavailable,
        Self::Validation,
    ];

    /// Returns the HTTP status code for this kind.
    #[must_use]
    pub const fn status_code(self) -> StatusCode {
        match self {
            Self::BadRequest | Self::Validation => StatusCode::BAD_REQUEST,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::NotAuthorized => StatusCode::UNAUTHORIZED,
            Self::FileTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::ServerUnavailable => StatusCode::SERVICE_UNAVAILABLE,
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::BadRequest => "bad request",
            Self::NotFound => "not found",
            Self::NotAuthorized => "not authorized",
            Self::FileTooLarge => "file too large",
            Self::ServerUnavailable => "server unavailable",
            Self::Validation => "validation error",
        };
        f.write_str(name)
    }
}

/// A known request failure.
///
/// Route handlers return this (usually through `?`) when they detect a
/// failure the client should see. The error boundary recognises it by type
/// and answers with [`AppError::serialize`] as the body.
///
/// The message is stored verbatim: it is never trimmed, and an empty message
/// is kept as is.
#[derive(ThisError, Debug, Clone, PartialEq, Eq)]
pub enum AppError {
    /// Malformed or invalid client input (400).
    #[error("bad request: {0}")]
    BadRequest(String),

    /// Requested resource is absent (404).
    #[error("not found: {0}")]
    NotFound(String),

    /// Missing or invalid credentials (401).
    #[error("not authorized: {0}")]
    NotAuthorized(String),

    /// Payload exceeds the size limit (413).
    #[error("file too large: {0}")]
    FileTooLarge(String),

    /// An upstream or internal dependency failed (503).
    #[error("server unavailable: {0}")]
    ServerUnavailable(String),

    /// Request body failed schema or shape validation (400).
    #[error("validation error: {0}")]
    Validation(String),
}

impl AppError {
    /// Creates a new bad request error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use hestate_server::error::AppError;
    ///
    /// let err = AppError::bad_request("Invalid email");
    /// assert!(matches!(err, AppError::BadRequest(_)));
    /// ```
    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::BadRequest(message.into())
    }

    /// Creates a new not found error.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self::NotFound(message.into())
    }

    /// Creates a new not authorized error.
    pub fn not_authorized(message: impl Into<String>) -> Self {
        Self::NotAuthorized(message.into())
    }

    /// Creates a new file too large error.
    pub fn file_too_large(message: impl Into<String>) -> Self {
        Self::FileTooLarge(message.into())
    }

    /// Creates a new server unavailable error.
    pub fn server_unavailable(message: impl Into<String>) -> Self {
        Self::ServerUnavailable(message.into())
    }

    /// Creates a new validation error.
    ///
    /// # Example
    ///
    /// ```rust
    /// use hestate_server::error::AppError;
    ///
    /// let err = AppError::validation("\"email\" is required");
    /// assert_eq!(err.status_code().as_u16(), 400);
    /// ```
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    /// Returns the kind of this error.
    #[must_use]
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::BadRequest(_) => ErrorKind::BadRequest,
            Self::NotFound(_) => ErrorKind::NotFound,
            Self::NotAuthorized(_) => ErrorKind::NotAuthorized,
            Self::FileTooLarge(_) => ErrorKind::FileTooLarge,
            Self::ServerUnavailable(_) => ErrorKind::ServerUnavailable,
            Self::Validation(_) => ErrorKind::Validation,
        }
    }

    /// Returns the HTTP status code for this error.
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        self.kind().status_code()
    }

    /// Returns the status label. Always [`ERROR_STATUS`].
    #[must_use]
    pub fn status(&self) -> &'static str {
        ERROR_STATUS
    }

    /// Returns the message given at construction.
    #[must_use]
    pub fn message(&self) -> &str {
        match self {
            Self::BadRequest(message)
            | Self::NotFound(message)
            | Self::NotAuthorized(message)
            | Self::FileTooLarge(message)
            | Self::ServerUnavailable(message)
            | Self::Validation(message) => message,
        }
    }

    /// Projects this error into its wire representation.
    ///
    /// Pure: calling it any number of times yields equal results.
    #[must_use]
    pub fn serialize(&self) -> ErrorResponse {
        ErrorResponse {
            status: self.status().to_string(),
            status_code: self.status_code().as_u16(),
            message: self.message().to_string(),
        }
    }
}

/// JSON body sent to the client for an [`AppError`].
///
/// Serialized as `{"status": ..., "statusCode": ..., "message": ...}`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorResponse {
    /// Status label, always `"error"`.
    pub status: String,

    /// HTTP status code of the error kind.
    pub status_code: u16,

    /// Human-readable description of the failure.
    pub message: String,
}

/// Fatal errors raised while bootstrapping the server.
///
/// Any of these terminates the process with [`ServerError::exit_code`].
#[derive(ThisError, Debug)]
pub enum ServerError {
    /// Configuration could not be loaded or validated.
    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    /// The first database connection attempt failed.
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// Session signing keys could not be prepared.
    #[error("session setup failed: {0}")]
    Session(#[from] crate::session::SessionError),

    /// The HTTP listener could not be bound.
    #[error("failed to bind to {address}: {source}")]
    Bind {
        /// The address that was requested.
        address: String,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP server stopped with an I/O error.
    #[error("server error: {0}")]
    Serve(#[source] std::io::Error),
}

impl ServerError {
    /// Process exit code for this failure.
    #[must_use]
    pub fn exit_code(&self) -> u8 {
        1
    }
}

/// A specialized Result type for bootstrap operations.
pub type Result<T> = std::result::Result<T, ServerError>;
