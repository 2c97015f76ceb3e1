//! Server bootstrap.
//!
//! [`Application::start`] brings the server up in a fixed order:
//!
//! 1. connect to the database; failure is fatal and nothing is bound
//! 2. connect the realtime adapter; failure only disables `/socket`
//! 3. assemble the router
//! 4. bind the listener
//!
//! [`Application::run_until`] then serves until the shutdown future resolves.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use tokio::net::TcpListener;

use crate::config::Config;
use crate::database::{connect_database, Connector, DatabaseHandle, ReconnectPolicy};
use crate::error::ServerError;
use crate::logging::Logger;
use crate::realtime::{RealtimeHub, RealtimeTasks, RedisAdapter};
use crate::routes::{app_routes, AppState};
use crate::server::build_app;
use crate::{log_error, log_info};

const LOG: Logger = Logger::new("Server");

/// A bound, ready-to-serve server.
#[derive(Debug)]
pub struct Application {
    listener: TcpListener,
    router: Router,
    local_addr: SocketAddr,
    database: DatabaseHandle,
    realtime: Option<RealtimeTasks>,
}

impl Application {
    /// Starts every server component and binds the listener.
    ///
    /// `routes` holds the domain route groups; they are merged with the
    /// platform routes before the fallback is mounted.
    ///
    /// # Errors
    ///
    /// Returns `ServerError` if the first database connection fails, the
    /// router cannot be assembled, or the port cannot be bound.
    pub async fn start(
        config: Config,
        connector: Arc<dyn Connector>,
        policy: ReconnectPolicy,
        routes: Router<AppState>,
    ) -> Result<Self, ServerError> {
        let database = connect_database(connector, policy).await?;

        let (hub, realtime) = match RedisAdapter::connect(&config.redis_host).await {
            Ok(adapter) => {
                let hub = RealtimeHub::new();
                let tasks = adapter.spawn(&hub);
                (Some(hub), Some(tasks))
            }
            Err(err) => {
                log_error!(LOG, details = %err, "Realtime setup failed");
                (None, None)
            }
        };

        let address = SocketAddr::from(([0, 0, 0, 0], config.port));

        let mut state = AppState::new(config, database.status());
        if let Some(hub) = hub {
            state = state.with_realtime(hub);
        }
        let router = build_app(state, app_routes().merge(routes))?;

        let listener = TcpListener::bind(address)
            .await
            .map_err(|source| ServerError::Bind {
                address: address.to_string(),
                source,
            })?;
        let local_addr = listener.local_addr().map_err(ServerError::Serve)?;

        log_info!(LOG, "Server has started with process {}", std::process::id());
        log_info!(LOG, "Server running on {}", local_addr.port());

        Ok(Self {
            listener,
            router,
            local_addr,
            database,
            realtime,
        })
    }

    /// The address the listener is bound to.
    #[must_use]
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Serves requests until `shutdown` resolves, then stops background
    /// tasks.
    ///
    /// In-flight requests are allowed to finish.
    ///
    /// # Errors
    ///
    /// Returns `ServerError::Serve` if the server stops with an I/O error.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), ServerError>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let result = axum::serve(self.listener, self.router)
            .with_graceful_shutdown(shutdown)
            .await
            .map_err(ServerError::Serve);

        if let Some(tasks) = &self.realtime {
            tasks.abort();
        }
        self.database.shutdown();

        log_info!(LOG, "Server shutdown complete");
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;

    use crate::database::DatabaseError;

    struct FixedConnector(Result<(), DatabaseError>);

    #[async_trait]
    impl Connector for FixedConnector {
        async fn connect(&self) -> Result<(), DatabaseError> {
            self.0.clone()
        }

        async fn ping(&self) -> Result<(), DatabaseError> {
            self.0.clone()
        }
    }

    fn test_config() -> Config {
        Config {
            client_base_url: "http://localhost:3000".to_string(),
            mongodb_url: "mongodb://localhost:27017/hestate".to_string(),
            node_env: "development".to_string(),
            jwt_token: "jwt".to_string(),
            first_secret_key: "first".to_string(),
            second_secret_key: "second".to_string(),
            redis_host: "redis://127.0.0.1:1".to_string(),
            port: 0,
        }
    }

    #[tokio::test]
    async fn database_failure_aborts_start() {
        let connector = Arc::new(FixedConnector(Err(DatabaseError::Connection(
            "connection refused".to_string(),
        ))));

        let err = Application::start(test_config(), connector, ReconnectPolicy::default(), Router::new())
            .await
            .unwrap_err();

        assert!(matches!(err, ServerError::Database(_)));
        assert_eq!(err.exit_code(), 1);
    }

    #[tokio::test]
    async fn realtime_failure_does_not_abort_start() {
        let connector = Arc::new(FixedConnector(Ok(())));

        let app = Application::start(test_config(), connector, ReconnectPolicy::default(), Router::new())
            .await
            .unwrap();

        assert_ne!(app.local_addr().port(), 0);
        app.run_until(async {}).await.unwrap();
    }

    #[tokio::test]
    async fn silent_redis_does_not_block_start() {
        let redis = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let redis_addr = redis.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = redis.accept().await {
                held.push(socket);
            }
        });

        let mut config = test_config();
        config.redis_host = format!("redis://{redis_addr}");

        let app = tokio::time::timeout(
            std::time::Duration::from_secs(15),
            Application::start(config, Arc::new(FixedConnector(Ok(()))), ReconnectPolicy::default(), Router::new()),
        )
        .await
        .expect("start waited on redis forever")
        .unwrap();

        assert_ne!(app.local_addr().port(), 0);
        app.run_until(async {}).await.unwrap();
        peer.abort();
    }

    #[tokio::test]
    async fn occupied_port_is_a_bind_error() {
        let taken = TcpListener::bind("0.0.0.0:0").await.unwrap();
        let mut config = test_config();
        config.port = taken.local_addr().unwrap().port();

        let err = Application::start(
            config,
            Arc::new(FixedConnector(Ok(()))),
            ReconnectPolicy::default(),
            Router::new(),
        )
        .await
        .unwrap_err();

        assert!(matches!(err, ServerError::Bind { .. }));
    }
}
