//! Topic subscription multiplexer.
//!
//! One broker connection, any number of downstream sessions, at most one
//! broker-side subscription per topic.
//!
//! ```text
//!   adapters ──subscribe──▶ SubscriptionRegistry ──spawns──▶ Subscription (1 per topic)
//!                                                              ▲        │
//!   BrokerConnection ──watch(LinkStatus)───────────────────────┘        │
//!        │                                                      try_deliver
//!        └── BrokerLink ──callback──▶ Subscription              ▼
//!                                                           ClientSession
//! ```

use std::sync::{Arc, Mutex};

use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, info, warn};

use crate::broker::{BrokerClient, BrokerError, lock};

pub mod backoff;
pub mod connection;
pub mod registry;
pub mod session;
pub mod subscription;

pub use backoff::{BackoffSequence, RetryPolicy};
pub use connection::{BrokerConnection, ConnectionState};
pub use registry::SubscriptionRegistry;
pub use session::{ClientSession, Delivery, SessionId};
pub use subscription::{SubscriptionState, TopicStats};

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MuxError {
    #[error("invalid topic '{0}'")]
    InvalidTopic(String),

    #[error("multiplexer is shutting down")]
    ShuttingDown,

    #[error("subscribe to '{topic}' failed")]
    SubscribeFailed {
        topic: String,
        #[source]
        source: BrokerError,
    },

    #[error("broker unreachable after {attempts} attempts: {last}")]
    RetriesExhausted { attempts: u32, last: BrokerError },

    #[error(transparent)]
    Broker(#[from] BrokerError),
}

#[derive(Debug, Clone)]
pub struct MuxSettings {
    pub address: String,
    pub retry: RetryPolicy,
    /// Per-session mailbox size.
    pub mailbox_capacity: usize,
    /// Per-topic queue between the broker callback and fan-out.
    pub event_buffer: usize,
}

impl Default for MuxSettings {
    fn default() -> Self {
        Self {
            address: "ws://127.0.0.1:8080".to_string(),
            retry: RetryPolicy::default(),
            mailbox_capacity: 64,
            event_buffer: 256,
        }
    }
}

pub struct Multiplexer {
    connection: Arc<BrokerConnection>,
    registry: Arc<SubscriptionRegistry>,
    mailbox_capacity: usize,
    subscriptions: CancellationToken,
    connection_shutdown: CancellationToken,
    tracker: TaskTracker,
    connection_task: Mutex<Option<JoinHandle<()>>>,
    failure: watch::Receiver<Option<MuxError>>,
}

impl Multiplexer {
    /// Build the multiplexer and start connecting. Must be called inside a
    /// tokio runtime.
    pub fn start(client: Arc<dyn BrokerClient>, settings: MuxSettings) -> Self {
        let connection = Arc::new(BrokerConnection::new(
            client,
            &settings.address,
            settings.retry.clone(),
        ));
        let subscriptions = CancellationToken::new();
        let connection_shutdown = CancellationToken::new();
        let tracker = TaskTracker::new();

        let registry = Arc::new(SubscriptionRegistry::new(
            connection.watch(),
            subscriptions.clone(),
            tracker.clone(),
            settings.event_buffer,
        ));

        let (failure_tx, failure) = watch::channel(None);
        let task = tokio::spawn({
            let connection = Arc::clone(&connection);
            let shutdown = connection_shutdown.clone();
            async move {
                if let Err(e) = connection.run(shutdown).await {
                    failure_tx.send_replace(Some(e));
                }
            }
        });

        info!(address = %settings.address, "multiplexer started");
        Self {
            connection,
            registry,
            mailbox_capacity: settings.mailbox_capacity,
            subscriptions,
            connection_shutdown,
            tracker,
            connection_task: Mutex::new(Some(task)),
            failure,
        }
    }

    /// Attach a new session to `topic`.
    ///
    /// Never waits on the broker; delivery begins once the topic's broker
    /// subscription is active.
    pub fn subscribe(&self, topic: &str) -> Result<ClientSession, MuxError> {
        if topic.trim().is_empty() {
            return Err(MuxError::InvalidTopic(topic.to_string()));
        }
        if let Some(err) = self.failure.borrow().clone() {
            return Err(err);
        }
        self.registry.attach(topic, self.mailbox_capacity)
    }

    pub fn status(&self) -> ConnectionState {
        self.connection.state()
    }

    pub fn registry(&self) -> &SubscriptionRegistry {
        &self.registry
    }

    pub async fn stats(&self) -> Vec<TopicStats> {
        self.registry.stats().await
    }

    /// Resolves with the fatal error once the connection gives up. Pending
    /// forever otherwise.
    pub async fn closed(&self) -> MuxError {
        let mut failure = self.failure.clone();
        let err = match failure.wait_for(Option::is_some).await {
            Ok(guard) => guard.clone(),
            Err(_) => None,
        };
        match err {
            Some(err) => err,
            None => std::future::pending().await,
        }
    }

    /// Stop every subscription, then the connection. Idempotent.
    pub async fn shutdown(&self) {
        debug!("shutting down subscriptions");
        self.subscriptions.cancel();
        self.tracker.close();
        self.tracker.wait().await;

        debug!("shutting down broker connection");
        self.connection_shutdown.cancel();
        let task = lock(&self.connection_task).take();
        if let Some(task) = task {
            if let Err(e) = task.await {
                warn!(error = %e, "connection task ended abnormally");
            }
        }
        info!("multiplexer stopped");
    }
}

#[cfg(test)]
mod tests;
