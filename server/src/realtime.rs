//! Realtime message fan-out.
//!
//! [`RealtimeHub`] delivers messages to every WebSocket connection on this
//! process through a tokio broadcast channel. When a [`RedisAdapter`] is
//! attached, every locally emitted message is also published to Redis, and
//! messages published by other server processes are delivered locally, so
//! all connections across all processes see the same stream.
//!
//! Each process tags what it publishes with its node id and ignores its own
//! messages when they come back from Redis.
//!
//! Outbound messages wait in a bounded queue for the publisher task. When
//! Redis stalls and the queue fills up, further messages are only delivered
//! locally.
//!
//! # Example
//!
//! ```rust
//! use hestate_server::realtime::{RealtimeHub, RealtimeMessage};
//! use serde_json::json;
//!
//! let hub = RealtimeHub::new();
//! let mut rx = hub.subscribe();
//!
//! hub.emit(RealtimeMessage::new("listing:created", json!({"id": "65f0c3"})));
//! assert_eq!(rx.try_recv().unwrap().event, "listing:created");
//! ```

use std::pin::pin;
use std::sync::{Arc, OnceLock};
use std::time::Duration;

use futures_util::StreamExt;
use redis::aio::{MultiplexedConnection, PubSub};
use redis::{AsyncCommands, AsyncConnectionConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::broadcast::{self, Receiver, Sender};
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::mpsc::{self, Receiver as QueueReceiver, Sender as QueueSender};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::logging::Logger;
use crate::{log_error, log_info, log_warn};

const LOG: Logger = Logger::new("Realtime");

/// Redis channel shared by every server process.
pub const FANOUT_CHANNEL: &str = "hestate:realtime";

/// Default capacity for the local broadcast channel.
///
/// Connections that fall further behind than this skip the oldest messages.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1000;

/// Capacity of the queue between [`RealtimeHub::emit`] and the Redis
/// publisher.
pub const OUTBOUND_QUEUE_CAPACITY: usize = 1024;

/// Deadline for opening the Redis connections and for each Redis reply.
pub const REDIS_TIMEOUT: Duration = Duration::from_secs(5);

/// A named realtime event with an opaque JSON payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RealtimeMessage {
    /// Event name, e.g. `listing:created`.
    pub event: String,

    /// Event payload. Missing payloads decode as `null`.
    #[serde(default)]
    pub data: Value,
}

impl RealtimeMessage {
    /// Creates a message.
    #[must_use]
    pub fn new(event: impl Into<String>, data: Value) -> Self {
        Self {
            event: event.into(),
            data,
        }
    }
}

/// A message as published to Redis, tagged with the emitting node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    /// Node id of the process that emitted the message.
    pub origin: Uuid,

    /// The message itself.
    pub message: RealtimeMessage,
}

/// Errors raised while setting up the Redis adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RealtimeError {
    /// The Redis URL could not be parsed.
    #[error("invalid redis url: {0}")]
    InvalidUrl(String),

    /// The publish or subscribe connection could not be opened.
    #[error("redis connection failed: {0}")]
    Connection(String),

    /// Subscribing to the fan-out channel failed.
    #[error("redis subscribe failed: {0}")]
    Subscribe(String),
}

/// Process-local realtime hub.
///
/// Cloning is cheap; all clones share the same channel and adapter.
#[derive(Debug, Clone)]
pub struct RealtimeHub {
    sender: Sender<RealtimeMessage>,
    node_id: Uuid,
    outbound: Arc<OnceLock<QueueSender<Envelope>>>,
}

impl RealtimeHub {
    /// Creates a hub with [`DEFAULT_CHANNEL_CAPACITY`].
    #[must_use]
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CHANNEL_CAPACITY)
    }

    /// Creates a hub with a custom channel capacity.
    ///
    /// # Panics
    ///
    /// Panics if capacity is 0.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        let node_id = Uuid::new_v4();
        debug!(capacity, %node_id, "Created realtime hub");
        Self {
            sender,
            node_id,
            outbound: Arc::new(OnceLock::new()),
        }
    }

    /// Identifier of this process in the fan-out.
    #[must_use]
    pub fn node_id(&self) -> Uuid {
        self.node_id
    }

    /// Subscribes a new connection.
    #[must_use]
    pub fn subscribe(&self) -> Receiver<RealtimeMessage> {
        self.sender.subscribe()
    }

    /// Number of connections currently subscribed on this process.
    #[must_use]
    pub fn connection_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Returns `true` once a Redis adapter has been attached.
    #[must_use]
    pub fn is_distributed(&self) -> bool {
        self.outbound.get().is_some()
    }

    /// Emits a message to every connection on every process.
    ///
    /// Returns the number of local connections that received it. Local
    /// delivery never waits on Redis.
    pub fn emit(&self, message: RealtimeMessage) -> usize {
        if let Some(outbound) = self.outbound.get() {
            let envelope = Envelope {
                origin: self.node_id,
                message: message.clone(),
            };
            match outbound.try_send(envelope) {
                Ok(()) => {}
                Err(TrySendError::Full(dropped)) => log_warn!(
                    LOG,
                    event = %dropped.message.event,
                    "Realtime publish queue full, message delivered locally only"
                ),
                Err(TrySendError::Closed(_)) => {
                    debug!("Realtime publisher stopped, message delivered locally only");
                }
            }
        }
        self.deliver_local(message)
    }

    /// Delivers a message to the connections on this process only.
    pub fn deliver_local(&self, message: RealtimeMessage) -> usize {
        trace!(event = %message.event, "Delivering realtime message");
        // An error only means nobody is subscribed right now.
        self.sender.send(message).unwrap_or(0)
    }

    /// Delivers a message received from Redis, unless this process sent it.
    ///
    /// Returns `None` for the process's own messages.
    pub fn accept_remote(&self, envelope: Envelope) -> Option<usize> {
        if envelope.origin == self.node_id {
            return None;
        }
        Some(self.deliver_local(envelope.message))
    }

    fn attach(&self, outbound: QueueSender<Envelope>) -> bool {
        self.outbound.set(outbound).is_ok()
    }
}

impl Default for RealtimeHub {
    fn default() -> Self {
        Self::new()
    }
}

/// Redis pub/sub adapter with open publish and subscribe connections.
pub struct RedisAdapter {
    publisher: MultiplexedConnection,
    subscriber: PubSub,
}

impl std::fmt::Debug for RedisAdapter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedisAdapter").finish_non_exhaustive()
    }
}

impl RedisAdapter {
    /// Opens both connections and subscribes to [`FANOUT_CHANNEL`], giving up
    /// after [`REDIS_TIMEOUT`].
    ///
    /// # Errors
    ///
    /// Returns `RealtimeError` if the URL is invalid, either connection fails
    /// or times out, or the subscription is refused.
    pub async fn connect(url: &str) -> Result<Self, RealtimeError> {
        Self::connect_with_timeout(url, REDIS_TIMEOUT).await
    }

    /// Like [`connect`](Self::connect) with a custom deadline.
    ///
    /// The two connections are opened concurrently; the adapter is only
    /// returned once both are ready. The deadline also bounds every later
    /// reply on the publish connection.
    ///
    /// # Errors
    ///
    /// Returns `RealtimeError` if the URL is invalid, either connection fails
    /// or misses the deadline, or the subscription is refused.
    pub async fn connect_with_timeout(url: &str, deadline: Duration) -> Result<Self, RealtimeError> {
        let client =
            redis::Client::open(url).map_err(|e| RealtimeError::InvalidUrl(e.to_string()))?;

        let config = AsyncConnectionConfig::new()
            .set_connection_timeout(deadline)
            .set_response_timeout(deadline);

        let publisher = async {
            client
                .get_multiplexed_async_connection_with_config(&config)
                .await
                .map_err(|e| RealtimeError::Connection(e.to_string()))
        };
        let subscriber = async {
            let mut pubsub = client
                .get_async_pubsub()
                .await
                .map_err(|e| RealtimeError::Connection(e.to_string()))?;
            pubsub
                .subscribe(FANOUT_CHANNEL)
                .await
                .map_err(|e| RealtimeError::Subscribe(e.to_string()))?;
            Ok::<_, RealtimeError>(pubsub)
        };

        let (publisher, subscriber) = timeout(deadline, async {
            tokio::try_join!(publisher, subscriber)
        })
        .await
        .map_err(|_| {
            RealtimeError::Connection(format!("no reply from redis within {deadline:?}"))
        })??;

        log_info!(LOG, "Connected to Redis");
        Ok(Self {
            publisher,
            subscriber,
        })
    }

    /// Attaches the adapter to `hub` and starts the publish and subscribe
    /// tasks.
    pub fn spawn(self, hub: &RealtimeHub) -> RealtimeTasks {
        let (outbound_tx, outbound_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        if !hub.attach(outbound_tx) {
            log_warn!(LOG, node = %hub.node_id(), "Realtime hub already has an adapter");
        }

        RealtimeTasks {
            publisher: tokio::spawn(publish_loop(self.publisher, outbound_rx)),
            subscriber: tokio::spawn(subscribe_loop(self.subscriber, hub.clone())),
        }
    }
}

/// Background tasks started by [`RedisAdapter::spawn`].
#[derive(Debug)]
pub struct RealtimeTasks {
    publisher: JoinHandle<()>,
    subscriber: JoinHandle<()>,
}

impl RealtimeTasks {
    /// Stops both tasks.
    pub fn abort(&self) {
        self.publisher.abort();
        self.subscriber.abort();
    }
}

async fn publish_loop(mut conn: MultiplexedConnection, mut outbound: QueueReceiver<Envelope>) {
    while let Some(envelope) = outbound.recv().await {
        let payload = match serde_json::to_string(&envelope) {
            Ok(payload) => payload,
            Err(err) => {
                log_error!(LOG, details = %err, "Failed to serialize realtime message");
                continue;
            }
        };

        let published: redis::RedisResult<()> = conn.publish(FANOUT_CHANNEL, payload).await;
        if let Err(err) = published {
            log_warn!(LOG, details = %err, "Failed to publish realtime message");
        }
    }
}

async fn subscribe_loop(subscriber: PubSub, hub: RealtimeHub) {
    let mut messages = pin!(subscriber.into_on_message());

    while let Some(msg) = messages.next().await {
        let payload: String = match msg.get_payload() {
            Ok(payload) => payload,
            Err(err) => {
                log_warn!(LOG, details = %err, "Unreadable realtime payload");
                continue;
            }
        };

        match serde_json::from_str::<Envelope>(&payload) {
            Ok(envelope) => {
                hub.accept_remote(envelope);
            }
            Err(err) => debug!(error = %err, "Ignoring foreign message on realtime channel"),
        }
    }

    log_warn!(LOG, details = "redis connection closed", "Realtime subscription ended");
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tokio::sync::broadcast::error::TryRecvError;

    fn message(event: &str) -> RealtimeMessage {
        RealtimeMessage::new(event, json!({"id": 1}))
    }

    #[test]
    fn emit_reaches_every_local_subscriber() {
        let hub = RealtimeHub::new();
        let mut first = hub.subscribe();
        let mut second = hub.subscribe();

        assert_eq!(hub.emit(message("listing:created")), 2);
        assert_eq!(first.try_recv().unwrap(), message("listing:created"));
        assert_eq!(second.try_recv().unwrap(), message("listing:created"));
    }

    #[test]
    fn emit_without_subscribers_is_not_an_error() {
        let hub = RealtimeHub::new();
        assert_eq!(hub.emit(message("noop")), 0);
    }

    #[test]
    fn connection_count_follows_subscribers() {
        let hub = RealtimeHub::new();
        assert_eq!(hub.connection_count(), 0);

        let rx = hub.subscribe();
        let clone = hub.clone();
        let _rx2 = clone.subscribe();
        assert_eq!(hub.connection_count(), 2);

        drop(rx);
        assert_eq!(hub.connection_count(), 1);
    }

    #[test]
    fn attached_hub_forwards_tagged_envelopes() {
        let hub = RealtimeHub::new();
        let (tx, mut rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        assert!(hub.attach(tx));
        assert!(hub.is_distributed());

        hub.emit(message("chat:message"));

        let envelope = rx.try_recv().unwrap();
        assert_eq!(envelope.origin, hub.node_id());
        assert_eq!(envelope.message, message("chat:message"));
    }

    #[test]
    fn second_attach_is_refused() {
        let hub = RealtimeHub::new();
        let (first, _first_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        let (second, _second_rx) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);

        assert!(hub.attach(first));
        assert!(!hub.clone().attach(second));
    }

    #[test]
    fn own_envelopes_are_skipped() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe();

        let own = Envelope {
            origin: hub.node_id(),
            message: message("echo"),
        };
        assert_eq!(hub.accept_remote(own), None);
        assert_eq!(rx.try_recv(), Err(TryRecvError::Empty));
    }

    #[test]
    fn foreign_envelopes_are_delivered_locally() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe();
        let (tx, mut outbound) = mpsc::channel(OUTBOUND_QUEUE_CAPACITY);
        hub.attach(tx);

        let foreign = Envelope {
            origin: Uuid::new_v4(),
            message: message("listing:updated"),
        };
        assert_eq!(hub.accept_remote(foreign), Some(1));
        assert_eq!(rx.try_recv().unwrap(), message("listing:updated"));
        // Remote messages are not published again.
        assert!(outbound.try_recv().is_err());
    }

    #[test]
    fn message_without_data_decodes_as_null() {
        let msg: RealtimeMessage = serde_json::from_str(r#"{"event":"ping"}"#).unwrap();
        assert_eq!(msg.data, Value::Null);
    }

    #[tokio::test]
    async fn connect_rejects_invalid_url() {
        let err = RedisAdapter::connect("not a url").await.unwrap_err();
        assert!(matches!(err, RealtimeError::InvalidUrl(_)));
    }

    #[test]
    fn full_publish_queue_drops_instead_of_growing() {
        let hub = RealtimeHub::new();
        let mut rx = hub.subscribe();
        let (tx, mut outbound) = mpsc::channel(2);
        hub.attach(tx);

        for i in 0..5 {
            assert_eq!(hub.emit(message(&format!("bid:{i}"))), 1);
        }

        // Every message still reaches local connections.
        for i in 0..5 {
            assert_eq!(rx.try_recv().unwrap().event, format!("bid:{i}"));
        }

        // Only the first two were queued for Redis.
        assert_eq!(outbound.try_recv().unwrap().message.event, "bid:0");
        assert_eq!(outbound.try_recv().unwrap().message.event, "bid:1");
        assert!(outbound.try_recv().is_err());
    }

    #[tokio::test]
    async fn connect_fails_when_redis_is_unreachable() {
        let err = RedisAdapter::connect("redis://127.0.0.1:1").await.unwrap_err();
        assert!(matches!(err, RealtimeError::Connection(_)));
    }

    #[tokio::test]
    async fn connect_gives_up_on_silent_peer() {
        // Accepts connections and never answers.
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let peer = tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((socket, _)) = listener.accept().await {
                held.push(socket);
            }
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            RedisAdapter::connect_with_timeout(&format!("redis://{addr}"), Duration::from_millis(200)),
        )
        .await
        .expect("connect ignored its deadline");

        assert!(matches!(result, Err(RealtimeError::Connection(_))));
        peer.abort();
    }
}
