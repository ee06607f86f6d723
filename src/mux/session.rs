//! Consumer-facing sessions.
//!
//! A session is split in two halves:
//! - `ClientSession`, owned by the adapter: drains the mailbox, closes.
//! - `SessionSink`, owned by the topic's subscription: the only writer.
//!
//! Closing never touches the subscription's client set directly; it sends a
//! `ClientLeft` event and lets the subscription remove the sink.

use std::pin::Pin;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use std::task::{Context, Poll};

use futures::Stream;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use uuid::Uuid;

use super::MuxError;
use super::subscription::Control;
use crate::broker::BrokerMessage;

pub type SessionId = Uuid;

/// Outcome of a single non-blocking delivery attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Delivered,
    Dropped,
}

#[derive(Debug, Default)]
struct SessionShared {
    closed: AtomicBool,
    dropped: AtomicU64,
    error: OnceLock<MuxError>,
}

/// A downstream consumer attached to one topic.
///
/// Dropping the session closes it.
#[derive(Debug)]
pub struct ClientSession {
    id: SessionId,
    topic: String,
    mailbox: mpsc::Receiver<Arc<BrokerMessage>>,
    shared: Arc<SessionShared>,
    control: mpsc::UnboundedSender<Control>,
}

/// The subscription's half of a session.
#[derive(Debug)]
pub(crate) struct SessionSink {
    id: SessionId,
    sender: mpsc::Sender<Arc<BrokerMessage>>,
    shared: Arc<SessionShared>,
}

/// Create both halves of a session for `topic`.
pub(crate) fn pair(
    topic: &str,
    capacity: usize,
    control: mpsc::UnboundedSender<Control>,
) -> (ClientSession, SessionSink) {
    let id = Uuid::new_v4();
    let (sender, mailbox) = mpsc::channel(capacity.max(1));
    let shared = Arc::new(SessionShared::default());
    let session = ClientSession {
        id,
        topic: topic.to_string(),
        mailbox,
        shared: Arc::clone(&shared),
        control,
    };
    (session, SessionSink { id, sender, shared })
}

impl ClientSession {
    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }

    /// Messages dropped because the mailbox was full.
    pub fn dropped(&self) -> u64 {
        self.shared.dropped.load(Ordering::Relaxed)
    }

    /// Why the session ended, if it ended abnormally.
    pub fn error(&self) -> Option<&MuxError> {
        self.shared.error.get()
    }

    /// Next message, or `None` once the session is closed or errored.
    pub async fn recv(&mut self) -> Option<Arc<BrokerMessage>> {
        if self.is_closed() {
            return None;
        }
        self.mailbox.recv().await
    }

    /// Detach from the topic. Idempotent.
    pub fn close(&self) {
        if !self.shared.closed.swap(true, Ordering::AcqRel) {
            // The subscription may already be gone; nothing left to tell it.
            let _ = self.control.send(Control::ClientLeft(self.id));
        }
    }
}

impl Drop for ClientSession {
    fn drop(&mut self) {
        self.close();
    }
}

impl Stream for ClientSession {
    type Item = Arc<BrokerMessage>;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        if self.is_closed() {
            return Poll::Ready(None);
        }
        self.mailbox.poll_recv(cx)
    }
}

impl SessionSink {
    pub(crate) fn id(&self) -> SessionId {
        self.id
    }

    /// Enqueue without waiting. A full mailbox drops the message for this
    /// session only.
    pub(crate) fn try_deliver(&self, msg: &Arc<BrokerMessage>) -> Delivery {
        match self.sender.try_send(Arc::clone(msg)) {
            Ok(()) => Delivery::Delivered,
            Err(TrySendError::Full(_)) => {
                self.shared.dropped.fetch_add(1, Ordering::Relaxed);
                Delivery::Dropped
            }
            // Adapter is gone; its ClientLeft is already queued.
            Err(TrySendError::Closed(_)) => Delivery::Dropped,
        }
    }

    /// End the session's stream with `err`.
    pub(crate) fn fail(self, err: MuxError) {
        // First failure wins.
        let _ = self.shared.error.set(err);
    }
}
