//! Topic → subscription map.
//!
//! The registry lock is held only for map lookups and for handing a new
//! session to its subscription. It is never held across an await or a
//! broker call, so one slow topic cannot stall attaches on another.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use tokio::sync::{mpsc, oneshot, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use super::MuxError;
use super::connection::LinkStatus;
use super::session::{self, ClientSession};
use super::subscription::{Control, Subscription, TopicStats};
use crate::broker::lock;

struct Entry {
    id: u64,
    control: mpsc::UnboundedSender<Control>,
    attached: Arc<AtomicUsize>,
}

pub struct SubscriptionRegistry {
    entries: Mutex<HashMap<String, Entry>>,
    next_id: AtomicU64,
    link: watch::Receiver<LinkStatus>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
    event_buffer: usize,
}

impl SubscriptionRegistry {
    pub(crate) fn new(
        link: watch::Receiver<LinkStatus>,
        shutdown: CancellationToken,
        tracker: TaskTracker,
        event_buffer: usize,
    ) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            link,
            shutdown,
            tracker,
            event_buffer,
        }
    }

    /// Attach a new session to `topic`, creating the subscription if none
    /// is live.
    pub(crate) fn attach(
        self: &Arc<Self>,
        topic: &str,
        capacity: usize,
    ) -> Result<ClientSession, MuxError> {
        let mut entries = lock(&self.entries);
        if self.shutdown.is_cancelled() {
            return Err(MuxError::ShuttingDown);
        }

        let stale = entries
            .get(topic)
            .is_some_and(|entry| entry.control.is_closed());
        if stale {
            entries.remove(topic);
        }

        let entry = entries
            .entry(topic.to_string())
            .or_insert_with(|| self.spawn_subscription(topic));

        let (session, sink) = session::pair(topic, capacity, entry.control.clone());
        entry.attached.fetch_add(1, Ordering::AcqRel);
        if entry.control.send(Control::ClientJoined(sink)).is_err() {
            // The task stopped between the staleness check and here.
            entry.attached.fetch_sub(1, Ordering::AcqRel);
            entries.remove(topic);
            return Err(MuxError::ShuttingDown);
        }

        debug!(topic, session = %session.id(), "session attached");
        Ok(session)
    }

    fn spawn_subscription(self: &Arc<Self>, topic: &str) -> Entry {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (control, control_rx) = mpsc::unbounded_channel();
        let attached = Arc::new(AtomicUsize::new(0));

        let subscription = Subscription::new(
            id,
            topic,
            control_rx,
            self.link.clone(),
            Arc::clone(self),
            Arc::clone(&attached),
            self.event_buffer,
        );
        self.tracker.spawn(subscription.run(self.shutdown.child_token()));
        debug!(topic, id, "subscription created");

        Entry {
            id,
            control,
            attached,
        }
    }

    /// Remove `topic` if subscription `id` still owns it and nobody is
    /// attached. Returns `true` when the subscription may stop.
    pub(crate) fn remove_if_empty(&self, topic: &str, id: u64) -> bool {
        let mut entries = lock(&self.entries);
        match entries.get(topic) {
            Some(entry) if entry.id == id => {
                if entry.attached.load(Ordering::Acquire) > 0 {
                    return false;
                }
                entries.remove(topic);
                true
            }
            // Absent or already replaced: nothing can reach `id` any more.
            _ => true,
        }
    }

    /// Remove `topic` unconditionally if `id` still owns it.
    pub(crate) fn evict(&self, topic: &str, id: u64) {
        let mut entries = lock(&self.entries);
        if entries.get(topic).is_some_and(|entry| entry.id == id) {
            entries.remove(topic);
        }
    }

    pub fn contains(&self, topic: &str) -> bool {
        lock(&self.entries).contains_key(topic)
    }

    pub fn len(&self) -> usize {
        lock(&self.entries).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn topics(&self) -> Vec<String> {
        let mut topics: Vec<String> = lock(&self.entries).keys().cloned().collect();
        topics.sort();
        topics
    }

    /// Ask every live subscription for its counters.
    pub async fn stats(&self) -> Vec<TopicStats> {
        let pending: Vec<oneshot::Receiver<TopicStats>> = {
            let entries = lock(&self.entries);
            entries
                .values()
                .filter_map(|entry| {
                    let (tx, rx) = oneshot::channel();
                    entry.control.send(Control::Stats(tx)).ok().map(|_| rx)
                })
                .collect()
        };

        let mut stats = Vec::with_capacity(pending.len());
        for rx in pending {
            // A subscription that stops before answering simply drops out.
            if let Ok(s) = rx.await {
                stats.push(s);
            }
        }
        stats.sort_by(|a, b| a.topic.cmp(&b.topic));
        stats
    }
}
