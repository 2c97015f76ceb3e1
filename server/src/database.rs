//! Database connection management.
//!
//! The server talks to MongoDB through a [`Connector`]. Connection handling
//! follows one asymmetric rule:
//!
//! - the very first connection attempt is fatal: [`connect_database`] returns
//!   the error and the caller terminates the process
//! - once connected, a background supervisor pings the database and, when it
//!   stops answering, reconnects with exponential backoff until it succeeds,
//!   however long that takes
//!
//! The current [`DbStatus`] is published through a `tokio::sync::watch`
//! channel so the health endpoint can report it.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use mongodb::bson::doc;
use mongodb::options::ClientOptions;
use mongodb::Client;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;

use crate::logging::Logger;
use crate::{log_error, log_info, log_warn};

const LOG: Logger = Logger::new("Database");

/// Interval between liveness pings once connected (10 seconds).
const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Base delay for reconnect backoff (500ms).
const DEFAULT_BASE_BACKOFF: Duration = Duration::from_millis(500);

/// Maximum delay cap for reconnect backoff (30 seconds).
const DEFAULT_MAX_BACKOFF: Duration = Duration::from_secs(30);

/// Maximum jitter added to each backoff delay (250ms).
const MAX_JITTER_MS: u64 = 250;

/// How long the driver may search for a usable server per attempt (5 seconds).
const SERVER_SELECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Errors raised while connecting to or talking with the database.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DatabaseError {
    /// The connection string could not be parsed.
    #[error("invalid connection string: {0}")]
    InvalidUrl(String),

    /// The database could not be reached.
    #[error("connection failed: {0}")]
    Connection(String),

    /// An operation was attempted before a connection was established.
    #[error("not connected")]
    NotConnected,
}

/// Connection state as seen by the supervisor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbStatus {
    /// The last connect or ping succeeded.
    Connected,
    /// The database stopped answering; a reconnect loop is running.
    Disconnected,
}

/// A database that can be connected to and pinged for liveness.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    /// Establishes (or re-establishes) the connection.
    async fn connect(&self) -> Result<(), DatabaseError>;

    /// Checks that the current connection is alive.
    async fn ping(&self) -> Result<(), DatabaseError>;
}

/// MongoDB connector backed by the official driver.
pub struct MongoConnector {
    url: String,
    client: RwLock<Option<Client>>,
}

impl MongoConnector {
    /// Creates a connector for the given connection string. Nothing is
    /// contacted until [`Connector::connect`] is called.
    #[must_use]
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            client: RwLock::new(None),
        }
    }

    /// Returns a handle to the current client, if connected.
    pub async fn client(&self) -> Option<Client> {
        self.client.read().await.clone()
    }
}

impl std::fmt::Debug for MongoConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MongoConnector")
            .field("url", &"<redacted>")
            .finish_non_exhaustive()
    }
}

async fn ping_client(client: &Client) -> Result<(), DatabaseError> {
    client
        .database("admin")
        .run_command(doc! { "ping": 1 })
        .await
        .map(|_| ())
        .map_err(|e| DatabaseError::Connection(e.to_string()))
}

#[async_trait]
impl Connector for MongoConnector {
    async fn connect(&self) -> Result<(), DatabaseError> {
        let mut options = ClientOptions::parse(self.url.as_str())
            .await
            .map_err(|e| DatabaseError::InvalidUrl(e.to_string()))?;
        options.server_selection_timeout = Some(SERVER_SELECTION_TIMEOUT);
        options.app_name = Some("hestate-server".to_string());

        let client =
            Client::with_options(options).map_err(|e| DatabaseError::Connection(e.to_string()))?;
        ping_client(&client).await?;

        *self.client.write().await = Some(client);
        Ok(())
    }

    async fn ping(&self) -> Result<(), DatabaseError> {
        let client = self.client().await.ok_or(DatabaseError::NotConnected)?;
        ping_client(&client).await
    }
}

/// Timing of the liveness check and the reconnect loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    /// Interval between liveness pings.
    pub heartbeat_interval: Duration,
    /// Delay before the first reconnect retry.
    pub base_backoff: Duration,
    /// Upper bound for any single retry delay.
    pub max_backoff: Duration,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            base_backoff: DEFAULT_BASE_BACKOFF,
            max_backoff: DEFAULT_MAX_BACKOFF,
        }
    }
}

/// A live database connection and its supervisor task.
#[derive(Debug)]
pub struct DatabaseHandle {
    status: watch::Receiver<DbStatus>,
    supervisor: JoinHandle<()>,
}

impl DatabaseHandle {
    /// Returns a receiver that observes connection status changes.
    #[must_use]
    pub fn status(&self) -> watch::Receiver<DbStatus> {
        self.status.clone()
    }

    /// Returns the current connection status.
    #[must_use]
    pub fn current_status(&self) -> DbStatus {
        *self.status.borrow()
    }

    /// Stops the supervisor task.
    pub fn shutdown(self) {
        self.supervisor.abort();
    }
}

/// Connects to the database and starts the reconnect-on-disconnect loop.
///
/// # Errors
///
/// Returns the connector's error if the first attempt fails. The attempt is
/// not retried; the caller is expected to exit.
pub async fn connect_database(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
) -> Result<DatabaseHandle, DatabaseError> {
    if let Err(err) = connector.connect().await {
        log_error!(LOG, details = %err, "Connection Error");
        return Err(err);
    }
    log_info!(LOG, "Connected to DB");

    let (status_tx, status_rx) = watch::channel(DbStatus::Connected);
    let supervisor = tokio::spawn(supervise(connector, policy, status_tx));

    Ok(DatabaseHandle {
        status: status_rx,
        supervisor,
    })
}

/// Pings on every heartbeat and reconnects whenever a ping fails.
async fn supervise(
    connector: Arc<dyn Connector>,
    policy: ReconnectPolicy,
    status: watch::Sender<DbStatus>,
) {
    loop {
        sleep(policy.heartbeat_interval).await;

        if let Err(err) = connector.ping().await {
            log_warn!(LOG, details = %err, "Database disconnected");
            status.send_replace(DbStatus::Disconnected);

            let attempts = reconnect(connector.as_ref(), &policy).await;

            status.send_replace(DbStatus::Connected);
            log_info!(LOG, attempts, "Connected to DB");
        }
    }
}

/// Retries `connect` until it succeeds. Returns the number of attempts made.
async fn reconnect(connector: &dyn Connector, policy: &ReconnectPolicy) -> u32 {
    let mut attempt: u32 = 0;

    loop {
        match connector.connect().await {
            Ok(()) => return attempt + 1,
            Err(err) => {
                let delay = backoff_delay(policy, attempt);
                log_warn!(
                    LOG,
                    attempt = attempt + 1,
                    delay_ms = delay.as_millis() as u64,
                    error = %err,
                    "Reconnect failed, retrying"
                );
                sleep(delay).await;
                attempt = attempt.saturating_add(1);
            }
        }
    }
}

/// Calculates the backoff delay for a given retry attempt.
///
/// `delay = min(2^attempt * base + random(0, 250ms), max)`
fn backoff_delay(policy: &ReconnectPolicy, attempt: u32) -> Duration {
    let base_ms = u64::try_from(policy.base_backoff.as_millis()).unwrap_or(u64::MAX);
    let max_ms = u64::try_from(policy.max_backoff.as_millis()).unwrap_or(u64::MAX);
    let exponential_ms = base_ms.saturating_mul(2u64.saturating_pow(attempt));
    let jitter_ms = rand::rng().random_range(0..=MAX_JITTER_MS);
    Duration::from_millis(exponential_ms.saturating_add(jitter_ms).min(max_ms))
}
