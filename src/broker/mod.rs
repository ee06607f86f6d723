//! Broker client interface.
//!
//! The gateway never talks to the broker directly; it goes through the
//! narrow set of traits defined here:
//!
//! - `BrokerClient` opens a physical connection (`BrokerLink`).
//! - `BrokerLink` subscribes topics and reports asynchronous disconnects.
//! - `TopicHandle` is the broker-side subscription for a single topic.
//!
//! Implementations:
//! - `WsBrokerClient`: JSON pub/sub protocol over a WebSocket
//! - `MockBroker`: in-memory broker for tests

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;

pub mod message;
pub mod mock;
pub mod websocket;

pub use message::BrokerMessage;
pub use mock::MockBroker;
pub use websocket::WsBrokerClient;

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// Errors surfaced by a broker client.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("connection failed: {0}")]
    Connect(String),

    #[error("connection attempt timed out after {0:?}")]
    Timeout(Duration),

    #[error("subscribe to '{topic}' rejected: {reason}")]
    Subscribe { topic: String, reason: String },

    #[error("unsubscribe from '{topic}' failed: {reason}")]
    Unsubscribe { topic: String, reason: String },

    #[error("disconnected: {0}")]
    Disconnected(String),

    #[error("protocol error: {0}")]
    Protocol(String),
}

/// Invoked by the link for every inbound message on a subscribed topic.
///
/// Callbacks run on the link's reader task and must not block.
pub type MessageCallback = Arc<dyn Fn(BrokerMessage) + Send + Sync>;

/// Invoked once when the link is lost.
pub type DisconnectHandler = Box<dyn FnOnce(BrokerError) + Send>;

/// Opens physical connections to the broker.
#[async_trait]
pub trait BrokerClient: Send + Sync {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerLink>>;
}

/// A live connection to the broker.
#[async_trait]
pub trait BrokerLink: Send + Sync {
    /// Subscribe `topic`, routing every inbound message to `on_message`.
    async fn subscribe_topic(
        &self,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn TopicHandle>>;

    /// Register a handler for the loss of this link.
    ///
    /// If the link is already lost the handler runs immediately.
    fn on_disconnect(&self, handler: DisconnectHandler);
}

/// Broker-side subscription for a single topic.
#[async_trait]
pub trait TopicHandle: Send + Sync {
    /// Stop delivery for this topic. Calling it twice is a no-op.
    async fn unsubscribe(&mut self) -> Result<()>;
}

/// Tracks whether a link is lost and fans the loss out to registered handlers.
#[derive(Default)]
pub struct DisconnectNotifier {
    state: Mutex<NotifierState>,
}

#[derive(Default)]
struct NotifierState {
    lost: Option<BrokerError>,
    handlers: Vec<DisconnectHandler>,
}

impl DisconnectNotifier {
    pub fn register(&self, handler: DisconnectHandler) {
        let mut state = lock(&self.state);
        match state.lost.clone() {
            Some(reason) => {
                drop(state);
                handler(reason);
            }
            None => state.handlers.push(handler),
        }
    }

    /// Mark the link lost. Only the first call runs the handlers.
    pub fn notify(&self, reason: BrokerError) {
        let handlers = {
            let mut state = lock(&self.state);
            if state.lost.is_some() {
                return;
            }
            state.lost = Some(reason.clone());
            std::mem::take(&mut state.handlers)
        };
        for handler in handlers {
            handler(reason.clone());
        }
    }

    pub fn is_lost(&self) -> bool {
        lock(&self.state).lost.is_some()
    }
}

/// Lock a mutex, recovering the guard if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
