//! Per-topic fan-out of committed mutations to live sessions.
//!
//! Every session owns one unbounded queue; the hub keeps, per topic, the list
//! of session queues subscribed to it. Publishing pushes the event into each
//! queue except the originating session's, so a session observes the events of
//! one conversation in exactly the order they were published.

use chat_proto::{EventFrame, ServerEvent, Topic};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc::{unbounded_channel, UnboundedReceiver, UnboundedSender};
use tracing::trace;
use uuid::Uuid;

/// One event addressed to the subscribers of a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Delivery {
    pub topic: Topic,
    pub seq: Option<u64>,
    /// Session that produced the mutation; it is skipped on delivery.
    pub origin: Option<Uuid>,
    pub event: ServerEvent,
}

impl Delivery {
    pub fn frame(&self) -> EventFrame {
        EventFrame {
            seq: self.seq,
            event: self.event.clone(),
        }
    }
}

/// Outbound port for committed mutations.
pub trait Broadcaster: Send + Sync {
    fn publish(&self, delivery: Delivery);
}

/// Broadcaster used when no realtime transport is attached.
#[derive(Debug, Clone, Copy, Default)]
pub struct NullBroadcaster;

impl Broadcaster for NullBroadcaster {
    fn publish(&self, _delivery: Delivery) {}
}

pub type SessionQueue = UnboundedReceiver<Arc<Delivery>>;

struct Subscriber {
    session_id: Uuid,
    tx: UnboundedSender<Arc<Delivery>>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FanoutStats {
    pub published: u64,
    pub delivered: u64,
    pub dropped: u64,
    pub topics: usize,
}

/// In-process fan-out hub keyed by [`Topic`].
#[derive(Default)]
pub struct Hub {
    topics: Mutex<HashMap<Topic, Vec<Subscriber>>>,
    published: AtomicU64,
    delivered: AtomicU64,
    dropped: AtomicU64,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create the queue a session drains its deliveries from.
    pub fn session_queue() -> (UnboundedSender<Arc<Delivery>>, SessionQueue) {
        unbounded_channel()
    }

    /// Subscribe a session queue to a topic. Returns false if it already was.
    pub fn subscribe(
        &self,
        topic: Topic,
        session_id: Uuid,
        tx: UnboundedSender<Arc<Delivery>>,
    ) -> bool {
        let mut topics = self.topics.lock();
        let subs = topics.entry(topic).or_default();
        if subs.iter().any(|s| s.session_id == session_id) {
            return false;
        }
        subs.push(Subscriber { session_id, tx });
        true
    }

    pub fn unsubscribe(&self, topic: &Topic, session_id: Uuid) -> bool {
        let mut topics = self.topics.lock();
        let Some(subs) = topics.get_mut(topic) else {
            return false;
        };
        let before = subs.len();
        subs.retain(|s| s.session_id != session_id);
        let removed = subs.len() != before;
        if subs.is_empty() {
            topics.remove(topic);
        }
        removed
    }

    /// Drop every subscription held by a session.
    pub fn unsubscribe_all(&self, session_id: Uuid) {
        let mut topics = self.topics.lock();
        topics.retain(|_, subs| {
            subs.retain(|s| s.session_id != session_id);
            !subs.is_empty()
        });
    }

    pub fn subscriptions(&self, session_id: Uuid) -> Vec<Topic> {
        let topics = self.topics.lock();
        let mut out: Vec<Topic> = topics
            .iter()
            .filter(|(_, subs)| subs.iter().any(|s| s.session_id == session_id))
            .map(|(t, _)| t.clone())
            .collect();
        out.sort();
        out
    }

    pub fn subscriber_count(&self, topic: &Topic) -> usize {
        self.topics.lock().get(topic).map_or(0, Vec::len)
    }

    pub fn stats(&self) -> FanoutStats {
        FanoutStats {
            published: self.published.load(Ordering::Relaxed),
            delivered: self.delivered.load(Ordering::Relaxed),
            dropped: self.dropped.load(Ordering::Relaxed),
            topics: self.topics.lock().len(),
        }
    }
}

impl Broadcaster for Hub {
    fn publish(&self, delivery: Delivery) {
        self.published.fetch_add(1, Ordering::Relaxed);
        let delivery = Arc::new(delivery);
        let mut topics = self.topics.lock();
        let Some(subs) = topics.get_mut(&delivery.topic) else {
            trace!(topic = ?delivery.topic, "no subscribers");
            return;
        };
        subs.retain(|s| {
            if Some(s.session_id) == delivery.origin {
                return true;
            }
            if s.tx.send(delivery.clone()).is_ok() {
                self.delivered.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                // session went away without unsubscribing
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        });
        if subs.is_empty() {
            topics.remove(&delivery.topic);
        }
    }
}
