//! Hestate Server - Main entry point.
//!
//! This binary starts the Hestate HTTP server with:
//! - Structured JSON logging
//! - A supervised MongoDB connection
//! - Realtime fan-out through Redis
//! - Graceful shutdown handling (SIGTERM/SIGINT)
//!
//! # Configuration
//!
//! See [`hestate_server::config`] for environment variable configuration.
//!
//! # Example
//!
//! ```bash
//! CLIENT_BASE_URL=http://localhost:3000 \
//! MONGODB_URL=mongodb://localhost:27017/hestate \
//! NODE_ENV=development \
//! JWT_TOKEN=dev-jwt \
//! FIRST_SECRET_KEY=dev-first \
//! SECOND_SECRET_KEY=dev-second \
//! REDIS_HOST=redis://localhost:6379 \
//! cargo run --bin hestate-server
//! ```

use std::process::ExitCode;
use std::sync::Arc;

use axum::Router;
use tokio::signal;
use tracing::{error, info};

use hestate_server::app::Application;
use hestate_server::config::{Config, REQUIRED_VARS};
use hestate_server::database::{MongoConnector, ReconnectPolicy};
use hestate_server::error::ServerError;
use hestate_server::logging::init_logging;

#[tokio::main]
async fn main() -> ExitCode {
    init_logging();

    let config = match Config::from_env() {
        Ok(config) => config,
        Err(err) => {
            error!(error = %err, "Failed to load configuration");
            eprintln!("Error: {err}");
            eprintln!();
            eprintln!("Required environment variables:");
            for var in REQUIRED_VARS {
                eprintln!("  {var}");
            }
            eprintln!();
            eprintln!("Optional environment variables:");
            eprintln!("  PORT      - HTTP server port (default: 4000)");
            eprintln!("  RUST_LOG  - Log level filter (default: info)");
            return ExitCode::from(ServerError::from(err).exit_code());
        }
    };

    info!(
        port = config.port,
        environment = %config.node_env,
        "Hestate server starting"
    );

    match run(config).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!(error = %err, "Server failed");
            ExitCode::from(err.exit_code())
        }
    }
}

async fn run(config: Config) -> Result<(), ServerError> {
    let connector = Arc::new(MongoConnector::new(config.mongodb_url.clone()));

    let app =
        Application::start(config, connector, ReconnectPolicy::default(), Router::new()).await?;
    app.run_until(shutdown_signal()).await
}

/// Creates a future that resolves when a shutdown signal is received.
///
/// Listens for:
/// - SIGTERM (container orchestrator shutdown)
/// - SIGINT (Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = signal::ctrl_c().await {
            error!(error = %err, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(err) => {
                error!(error = %err, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received SIGINT (Ctrl+C), initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
