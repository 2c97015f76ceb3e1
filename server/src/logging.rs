//! Structured logging for the Hestate server.
//!
//! [`init_logging`] installs the process-wide JSON subscriber. [`Logger`] is a
//! small per-component handle so that every event carries a `component`
//! field (`Server`, `Database`, `Realtime`, ...).

use std::fmt;

use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt as tracing_fmt, EnvFilter};

/// Default filter when `RUST_LOG` is not set.
const DEFAULT_FILTER: &str = "info,tower_http=debug,axum::rejection=trace";

/// Initialize structured logging with tracing.
///
/// Configures JSON-formatted output with:
/// - Environment-based log level filtering via RUST_LOG
/// - Default log level of `info`
/// - Target and level information
pub fn init_logging() {
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let json_layer = tracing_fmt::layer()
        .json()
        .with_target(true)
        .with_level(true)
        .with_file(false)
        .with_line_number(false);

    tracing_subscriber::registry()
        .with(env_filter)
        .with(json_layer)
        .init();
}

/// A named logger for one server component.
///
/// Every event carries a `component` field. The
/// [`log_info!`](crate::log_info), [`log_warn!`](crate::log_warn) and
/// [`log_error!`](crate::log_error) macros also keep the calling module as the
/// event target, so `RUST_LOG=hestate_server::database=debug` selects one
/// component. The methods log with this module as the target.
///
/// # Example
///
/// ```rust
/// use hestate_server::logging::Logger;
/// use hestate_server::{log_error, log_info};
///
/// const LOG: Logger = Logger::new("Database");
///
/// log_info!(LOG, "Connected to DB");
/// log_error!(LOG, details = "connection refused", "Connection Error");
///
/// LOG.info("Connected to DB");
/// LOG.error("Connection Error", "connection refused");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Logger {
    component: &'static str,
}

impl Logger {
    /// Creates a logger for the given component.
    #[must_use]
    pub const fn new(component: &'static str) -> Self {
        Self { component }
    }

    /// Returns the component name.
    #[must_use]
    pub const fn component(&self) -> &'static str {
        self.component
    }

    /// Emits an informational event.
    ///
    /// The event target is this module; filter on `component` instead.
    pub fn info(&self, message: &str) {
        tracing::info!(component = self.component, "{message}");
    }

    /// Emits an error event with details.
    pub fn error(&self, message: &str, details: impl fmt::Display) {
        tracing::error!(component = self.component, details = %details, "{message}");
    }
}

/// Emits an INFO event tagged with the logger's component.
#[macro_export]
macro_rules! log_info {
    ($log:expr, $($arg:tt)+) => {
        ::tracing::info!(component = $log.component(), $($arg)+)
    };
}

/// Emits a WARN event tagged with the logger's component.
#[macro_export]
macro_rules! log_warn {
    ($log:expr, $($arg:tt)+) => {
        ::tracing::warn!(component = $log.component(), $($arg)+)
    };
}

/// Emits an ERROR event tagged with the logger's component.
#[macro_export]
macro_rules! log_error {
    ($log:expr, $($arg:tt)+) => {
        ::tracing::error!(component = $log.component(), $($arg)+)
    };
}
