//! Per-topic subscription actor.
//!
//! Each topic with at least one attached session gets one `Subscription`
//! running as its own task. The task is the only code that touches the
//! topic's client set and broker handle, so the hot path takes no locks.
//!
//! Events, handled one at a time:
//! - `ClientJoined` / `ClientLeft` from the registry and the sessions
//! - connectivity changes from the broker connection
//! - broker messages from the link callback
//!
//! Broker messages carry the segment they were subscribed under. A segment
//! ends whenever the broker-side subscription does, so anything still queued
//! from an older segment is discarded instead of delivered.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use serde::Serialize;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use super::MuxError;
use super::connection::LinkStatus;
use super::registry::SubscriptionRegistry;
use super::session::{Delivery, SessionId, SessionSink};
use crate::broker::{BrokerError, BrokerLink, BrokerMessage, MessageCallback, TopicHandle};

/// Events consumed by a subscription's loop.
#[derive(Debug)]
pub(crate) enum Control {
    ClientJoined(SessionSink),
    ClientLeft(SessionId),
    Stats(oneshot::Sender<TopicStats>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionState {
    Subscribing,
    Active,
    Suspended,
    Closed,
}

/// Point-in-time view of one topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TopicStats {
    pub topic: String,
    pub state: SubscriptionState,
    pub clients: usize,
    pub delivered: u64,
    /// Messages dropped because a session's mailbox was full.
    pub dropped: u64,
    /// Messages dropped before fan-out because the event queue was full.
    pub overflowed: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Stop,
}

pub(crate) struct Subscription {
    id: u64,
    topic: String,
    state: SubscriptionState,
    clients: HashMap<SessionId, SessionSink>,
    handle: Option<Box<dyn TopicHandle>>,
    segment: u64,
    epoch: u64,
    delivered: u64,
    dropped: u64,
    overflowed: Arc<AtomicU64>,
    attached: Arc<AtomicUsize>,
    registry: Arc<SubscriptionRegistry>,
    control: mpsc::UnboundedReceiver<Control>,
    link: watch::Receiver<LinkStatus>,
    messages_tx: mpsc::Sender<(u64, BrokerMessage)>,
    messages: mpsc::Receiver<(u64, BrokerMessage)>,
}

impl Subscription {
    pub(crate) fn new(
        id: u64,
        topic: &str,
        control: mpsc::UnboundedReceiver<Control>,
        link: watch::Receiver<LinkStatus>,
        registry: Arc<SubscriptionRegistry>,
        attached: Arc<AtomicUsize>,
        event_buffer: usize,
    ) -> Self {
        let (messages_tx, messages) = mpsc::channel(event_buffer.max(1));
        Self {
            id,
            topic: topic.to_string(),
            state: SubscriptionState::Subscribing,
            clients: HashMap::new(),
            handle: None,
            segment: 0,
            epoch: 0,
            delivered: 0,
            dropped: 0,
            overflowed: Arc::new(AtomicU64::new(0)),
            attached,
            registry,
            control,
            link,
            messages_tx,
            messages,
        }
    }

    pub(crate) async fn run(mut self, shutdown: CancellationToken) {
        debug!(topic = %self.topic, id = self.id, "subscription started");

        let status = self.link.borrow_and_update().clone();
        if let Some(link) = status.link {
            self.epoch = status.epoch;
            if self.subscribe(link).await == Flow::Stop {
                return;
            }
        }

        loop {
            let flow = tokio::select! {
                biased;
                _ = shutdown.cancelled() => {
                    self.shutdown().await;
                    Flow::Stop
                }
                ctl = self.control.recv() => match ctl {
                    Some(Control::ClientJoined(sink)) => {
                        self.join(sink);
                        Flow::Continue
                    }
                    Some(Control::ClientLeft(id)) => self.leave(id).await,
                    Some(Control::Stats(reply)) => {
                        // The caller may have stopped waiting.
                        let _ = reply.send(self.stats());
                        Flow::Continue
                    }
                    // Unreachable while registered; nobody can reach us otherwise.
                    None => {
                        self.shutdown().await;
                        Flow::Stop
                    }
                },
                changed = self.link.changed() => match changed {
                    Ok(()) => {
                        let status = self.link.borrow_and_update().clone();
                        self.on_link_change(status).await
                    }
                    Err(_) => {
                        self.shutdown().await;
                        Flow::Stop
                    }
                },
                Some((segment, msg)) = self.messages.recv() => {
                    self.fan_out(segment, msg);
                    Flow::Continue
                }
            };
            if flow == Flow::Stop {
                break;
            }
        }

        debug!(topic = %self.topic, id = self.id, "subscription stopped");
    }

    fn join(&mut self, sink: SessionSink) {
        debug!(topic = %self.topic, session = %sink.id(), "client joined");
        self.clients.insert(sink.id(), sink);
    }

    async fn leave(&mut self, id: SessionId) -> Flow {
        if self.clients.remove(&id).is_none() {
            return Flow::Continue;
        }
        self.attached.fetch_sub(1, Ordering::AcqRel);
        debug!(topic = %self.topic, session = %id, remaining = self.clients.len(), "client left");

        if self.clients.is_empty() {
            self.teardown().await
        } else {
            Flow::Continue
        }
    }

    /// Last client is gone: release the broker subscription and deregister.
    async fn teardown(&mut self) -> Flow {
        self.release_handle().await;

        if self.registry.remove_if_empty(&self.topic, self.id) {
            self.state = SubscriptionState::Closed;
            info!(topic = %self.topic, "subscription closed");
            return Flow::Stop;
        }

        // A session attached while we were unsubscribing; carry on for it.
        debug!(topic = %self.topic, "client attached during teardown, resubscribing");
        let status = self.link.borrow_and_update().clone();
        match status.link {
            Some(link) => {
                self.epoch = status.epoch;
                self.subscribe(link).await
            }
            None => {
                self.state = SubscriptionState::Suspended;
                Flow::Continue
            }
        }
    }

    async fn on_link_change(&mut self, status: LinkStatus) -> Flow {
        match status.link {
            Some(link) if status.epoch != self.epoch => {
                self.epoch = status.epoch;
                // Any handle we hold belongs to a connection that no longer exists.
                self.handle = None;
                self.subscribe(link).await
            }
            Some(_) => Flow::Continue,
            None => {
                if self.state != SubscriptionState::Suspended {
                    info!(topic = %self.topic, "broker connection lost, suspending");
                }
                self.handle = None;
                self.segment += 1;
                self.state = SubscriptionState::Suspended;
                Flow::Continue
            }
        }
    }

    async fn subscribe(&mut self, link: Arc<dyn BrokerLink>) -> Flow {
        self.state = SubscriptionState::Subscribing;
        self.segment += 1;

        let segment = self.segment;
        let tx = self.messages_tx.clone();
        let overflowed = Arc::clone(&self.overflowed);
        let topic = self.topic.clone();
        let callback: MessageCallback = Arc::new(move |msg| {
            if let Err(TrySendError::Full(_)) = tx.try_send((segment, msg)) {
                overflowed.fetch_add(1, Ordering::Relaxed);
                trace!(%topic, "event queue full, message dropped");
            }
        });

        match link.subscribe_topic(&self.topic, callback).await {
            Ok(handle) => {
                self.handle = Some(handle);
                self.state = SubscriptionState::Active;
                info!(topic = %self.topic, clients = self.clients.len(), "subscribed");
                Flow::Continue
            }
            Err(BrokerError::Disconnected(reason)) => {
                // Not the topic's fault; the reconnect will bring us back.
                debug!(topic = %self.topic, %reason, "link lost while subscribing");
                self.state = SubscriptionState::Suspended;
                Flow::Continue
            }
            Err(e) => {
                error!(topic = %self.topic, error = %e, "subscribe failed, closing subscription");
                self.close_sessions(MuxError::SubscribeFailed {
                    topic: self.topic.clone(),
                    source: e,
                });
                Flow::Stop
            }
        }
    }

    fn fan_out(&mut self, segment: u64, msg: BrokerMessage) {
        if segment != self.segment || self.state != SubscriptionState::Active {
            trace!(topic = %self.topic, "ignoring message from a previous subscription");
            return;
        }
        if self.clients.is_empty() {
            // Teardown only happens on ClientLeft.
            trace!(topic = %self.topic, "ignoring message with no clients attached");
            return;
        }

        let msg = Arc::new(msg);
        for sink in self.clients.values() {
            match sink.try_deliver(&msg) {
                Delivery::Delivered => self.delivered += 1,
                Delivery::Dropped => {
                    self.dropped += 1;
                    trace!(topic = %self.topic, session = %sink.id(), "mailbox full, message dropped");
                }
            }
        }
    }

    fn stats(&self) -> TopicStats {
        TopicStats {
            topic: self.topic.clone(),
            state: self.state,
            clients: self.clients.len(),
            delivered: self.delivered,
            dropped: self.dropped,
            overflowed: self.overflowed.load(Ordering::Relaxed),
        }
    }

    async fn release_handle(&mut self) {
        self.segment += 1;
        if let Some(mut handle) = self.handle.take() {
            if let Err(e) = handle.unsubscribe().await {
                warn!(topic = %self.topic, error = %e, "broker unsubscribe failed");
            }
        }
    }

    /// Deregister and end every session, including joins still in flight.
    fn close_sessions(&mut self, err: MuxError) {
        self.registry.evict(&self.topic, self.id);

        // Joins are only sent while registered, so after the eviction this
        // drains every session that will ever be handed to us.
        while let Ok(ctl) = self.control.try_recv() {
            match ctl {
                Control::ClientJoined(sink) => {
                    self.clients.insert(sink.id(), sink);
                }
                Control::Stats(reply) => {
                    // The caller may have stopped waiting.
                    let _ = reply.send(self.stats());
                }
                Control::ClientLeft(_) => {}
            }
        }

        for (_, sink) in self.clients.drain() {
            sink.fail(err.clone());
        }
        self.state = SubscriptionState::Closed;
    }

    async fn shutdown(&mut self) {
        self.release_handle().await;
        self.close_sessions(MuxError::ShuttingDown);
        debug!(topic = %self.topic, "subscription shut down");
    }
}
