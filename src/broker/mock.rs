//! Mock broker implementation for testing.
//!
//! Records every connect, subscribe and unsubscribe call so tests can assert
//! on exactly what the multiplexer asked of the broker, and lets tests inject
//! connect failures, topic rejections and dropped connections.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::watch;

use super::{
    BrokerClient, BrokerError, BrokerLink, BrokerMessage, DisconnectHandler, DisconnectNotifier,
    MessageCallback, Result, TopicHandle, lock,
};

/// In-memory broker for tests.
pub struct MockBroker {
    state: Arc<Mutex<MockState>>,
    hold: watch::Sender<bool>,
}

#[derive(Default)]
struct MockState {
    connects: usize,
    failing_connects: usize,
    subscribe_delay: Option<Duration>,
    rejected: HashSet<String>,
    subscribes: HashMap<String, usize>,
    unsubscribes: HashMap<String, usize>,
    current: Option<Arc<MockLinkShared>>,
}

impl Default for MockBroker {
    fn default() -> Self {
        let (hold, _) = watch::channel(false);
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            hold,
        }
    }
}

impl MockBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` connect attempts fail.
    pub fn fail_next_connects(&self, n: usize) {
        lock(&self.state).failing_connects = n;
    }

    /// While held, connect attempts wait instead of completing.
    pub fn hold_connects(&self, held: bool) {
        self.hold.send_replace(held);
    }

    /// Reject every subscribe for `topic`.
    pub fn reject_topic(&self, topic: &str) {
        lock(&self.state).rejected.insert(topic.to_string());
    }

    pub fn allow_topic(&self, topic: &str) {
        lock(&self.state).rejected.remove(topic);
    }

    /// Delay every subscribe call, widening race windows in tests.
    pub fn set_subscribe_delay(&self, delay: Duration) {
        lock(&self.state).subscribe_delay = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        lock(&self.state).connects
    }

    pub fn subscribe_count(&self, topic: &str) -> usize {
        lock(&self.state).subscribes.get(topic).copied().unwrap_or(0)
    }

    pub fn unsubscribe_count(&self, topic: &str) -> usize {
        lock(&self.state).unsubscribes.get(topic).copied().unwrap_or(0)
    }

    pub fn is_connected(&self) -> bool {
        lock(&self.state)
            .current
            .as_ref()
            .is_some_and(|link| !link.notifier.is_lost())
    }

    /// Whether the live link currently routes `topic`.
    pub fn has_route(&self, topic: &str) -> bool {
        self.live_link().is_some_and(|link| {
            let routes = lock(&link.routes);
            routes.contains_key(topic)
        })
    }

    /// Publish on the live link. Returns whether a subscriber received it.
    pub fn publish(&self, topic: &str, payload: impl Into<Bytes>) -> bool {
        let Some(link) = self.live_link() else {
            return false;
        };
        let callback = lock(&link.routes).get(topic).cloned();
        match callback {
            Some(callback) => {
                callback(BrokerMessage::new(payload));
                true
            }
            None => false,
        }
    }

    /// Simulate the broker dropping the connection.
    pub fn drop_connection(&self) {
        let link = lock(&self.state).current.take();
        if let Some(link) = link {
            lock(&link.routes).clear();
            link.notifier
                .notify(BrokerError::Disconnected("mock connection dropped".to_string()));
        }
    }

    fn live_link(&self) -> Option<Arc<MockLinkShared>> {
        lock(&self.state)
            .current
            .clone()
            .filter(|link| !link.notifier.is_lost())
    }
}

#[async_trait]
impl BrokerClient for MockBroker {
    async fn connect(&self, address: &str) -> Result<Arc<dyn BrokerLink>> {
        let mut hold = self.hold.subscribe();
        // The sender lives in self, so this only returns once released.
        let _ = hold.wait_for(|held| !*held).await;

        let mut state = lock(&self.state);
        state.connects += 1;
        if state.failing_connects > 0 {
            state.failing_connects -= 1;
            return Err(BrokerError::Connect(format!("mock refused {address}")));
        }

        let shared = Arc::new(MockLinkShared::default());
        state.current = Some(Arc::clone(&shared));
        Ok(Arc::new(MockLink {
            shared,
            state: Arc::clone(&self.state),
        }))
    }
}

#[derive(Default)]
struct MockLinkShared {
    routes: Mutex<HashMap<String, MessageCallback>>,
    notifier: DisconnectNotifier,
}

struct MockLink {
    shared: Arc<MockLinkShared>,
    state: Arc<Mutex<MockState>>,
}

#[async_trait]
impl BrokerLink for MockLink {
    async fn subscribe_topic(
        &self,
        topic: &str,
        on_message: MessageCallback,
    ) -> Result<Box<dyn TopicHandle>> {
        let delay = {
            let mut state = lock(&self.state);
            *state.subscribes.entry(topic.to_string()).or_default() += 1;
            state.subscribe_delay
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        if self.shared.notifier.is_lost() {
            return Err(BrokerError::Disconnected("mock link lost".to_string()));
        }
        if lock(&self.state).rejected.contains(topic) {
            return Err(BrokerError::Subscribe {
                topic: topic.to_string(),
                reason: "permission denied".to_string(),
            });
        }

        lock(&self.shared.routes).insert(topic.to_string(), on_message);
        Ok(Box::new(MockTopicHandle {
            topic: topic.to_string(),
            shared: Arc::clone(&self.shared),
            state: Arc::clone(&self.state),
            active: true,
        }))
    }

    fn on_disconnect(&self, handler: DisconnectHandler) {
        self.shared.notifier.register(handler);
    }
}

struct MockTopicHandle {
    topic: String,
    shared: Arc<MockLinkShared>,
    state: Arc<Mutex<MockState>>,
    active: bool,
}

#[async_trait]
impl TopicHandle for MockTopicHandle {
    async fn unsubscribe(&mut self) -> Result<()> {
        if !self.active {
            return Ok(());
        }
        self.active = false;
        lock(&self.shared.routes).remove(&self.topic);
        *lock(&self.state)
            .unsubscribes
            .entry(self.topic.clone())
            .or_default() += 1;
        Ok(())
    }
}
