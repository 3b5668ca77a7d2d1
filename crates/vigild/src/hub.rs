//! Topic-based broadcast hub.
//!
//! Publishers hand a message to every live subscription of a topic and move
//! on; each subscription owns a bounded queue, and when it is full the oldest
//! queued message is dropped and counted. A stalled consumer therefore costs
//! its own backlog, never the publisher's or anyone else's.
//!
//! Topics carry a monotonic sequence number so subscribers can observe drops
//! (gaps) while relying on per-topic ordering.

use bytes::Bytes;
use parking_lot::{Mutex, RwLock};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Notify;

/// What a subscriber wants to see on a mixed frame/event topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interest {
    Frames,
    Events,
    Both,
}

impl Interest {
    fn wants(self, message: &Message) -> bool {
        match (self, message) {
            (Interest::Both, _) => true,
            (Interest::Frames, Message::Frame(_)) => true,
            (Interest::Events, Message::Event(_)) => true,
            _ => false,
        }
    }
}

/// A published payload. Frames stay in their wire encoding; events are JSON.
#[derive(Clone)]
pub enum Message {
    Frame(Bytes),
    Event(Arc<serde_json::Value>),
}

/// One delivered message with its topic sequence number.
#[derive(Clone)]
pub struct Envelope {
    pub seq: u64,
    pub message: Message,
}

struct SubscriberState {
    interest: Interest,
    capacity: usize,
    queue: Mutex<VecDeque<Envelope>>,
    notify: Notify,
    dropped: AtomicU64,
    closed: AtomicBool,
}

struct Topic {
    seq: AtomicU64,
    subscribers: Mutex<Vec<Arc<SubscriberState>>>,
}

/// Topic-keyed broadcaster.
pub struct Hub {
    default_capacity: usize,
    topics: RwLock<HashMap<String, Arc<Topic>>>,
}

impl Hub {
    pub fn new(default_capacity: usize) -> Self {
        Self {
            default_capacity: default_capacity.max(1),
            topics: RwLock::new(HashMap::new()),
        }
    }

    fn topic(&self, name: &str) -> Arc<Topic> {
        if let Some(topic) = self.topics.read().get(name) {
            return topic.clone();
        }
        self.topics
            .write()
            .entry(name.to_string())
            .or_insert_with(|| {
                Arc::new(Topic {
                    seq: AtomicU64::new(0),
                    subscribers: Mutex::new(Vec::new()),
                })
            })
            .clone()
    }

    /// Subscribe to a topic with the given interest filter.
    pub fn subscribe(&self, topic: &str, interest: Interest) -> Subscription {
        let topic_arc = self.topic(topic);
        let state = Arc::new(SubscriberState {
            interest,
            capacity: self.default_capacity,
            queue: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            dropped: AtomicU64::new(0),
            closed: AtomicBool::new(false),
        });
        topic_arc.subscribers.lock().push(state.clone());
        tracing::debug!(topic, ?interest, "hub: subscribed");
        Subscription { state }
    }

    /// Live subscriptions on a topic (used to skip frame encoding when
    /// nobody is watching).
    pub fn subscriber_count(&self, topic: &str) -> usize {
        match self.topics.read().get(topic) {
            Some(t) => t
                .subscribers
                .lock()
                .iter()
                .filter(|s| !s.closed.load(Ordering::Acquire))
                .count(),
            None => 0,
        }
    }

    pub fn publish_frame(&self, topic: &str, frame: Bytes) {
        self.publish(topic, Message::Frame(frame));
    }

    pub fn publish_event(&self, topic: &str, event: serde_json::Value) {
        self.publish(topic, Message::Event(Arc::new(event)));
    }

    /// Deliver to every live subscription; never blocks the caller.
    fn publish(&self, topic: &str, message: Message) {
        let topic_arc = self.topic(topic);
        let seq = topic_arc.seq.fetch_add(1, Ordering::AcqRel);

        let mut subscribers = topic_arc.subscribers.lock();
        subscribers.retain(|s| !s.closed.load(Ordering::Acquire));

        for sub in subscribers.iter() {
            if !sub.interest.wants(&message) {
                continue;
            }
            {
                let mut queue = sub.queue.lock();
                if queue.len() >= sub.capacity {
                    queue.pop_front();
                    sub.dropped.fetch_add(1, Ordering::Relaxed);
                }
                queue.push_back(Envelope {
                    seq,
                    message: message.clone(),
                });
            }
            sub.notify.notify_one();
        }
    }
}

/// A live subscription handle. Dropping it (or calling [`cancel`]) detaches
/// it from the topic; the hub reclaims the slot on the next publish.
///
/// [`cancel`]: Subscription::cancel
pub struct Subscription {
    state: Arc<SubscriberState>,
}

impl Subscription {
    /// Wait for the next queued message.
    pub async fn recv(&self) -> Envelope {
        loop {
            if let Some(envelope) = self.state.queue.lock().pop_front() {
                return envelope;
            }
            self.state.notify.notified().await;
        }
    }

    /// Messages dropped from this subscription's queue so far.
    pub fn dropped(&self) -> u64 {
        self.state.dropped.load(Ordering::Relaxed)
    }

    /// Detach from the topic. Safe to call any number of times.
    pub fn cancel(&self) {
        self.state.closed.store(true, Ordering::Release);
        self.state.notify.notify_one();
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio::time::timeout;

    fn event(n: u64) -> serde_json::Value {
        serde_json::json!({ "n": n })
    }

    async fn recv_soon(sub: &Subscription) -> Envelope {
        timeout(Duration::from_secs(1), sub.recv()).await.expect("recv timed out")
    }

    fn event_n(envelope: &Envelope) -> u64 {
        match &envelope.message {
            Message::Event(v) => v["n"].as_u64().unwrap(),
            Message::Frame(_) => panic!("expected event"),
        }
    }

    #[tokio::test]
    async fn test_broadcast_reaches_all_subscribers() {
        let hub = Hub::new(8);
        let a = hub.subscribe("camera:1", Interest::Both);
        let b = hub.subscribe("camera:1", Interest::Both);

        hub.publish_event("camera:1", event(1));
        assert_eq!(event_n(&recv_soon(&a).await), 1);
        assert_eq!(event_n(&recv_soon(&b).await), 1);
    }

    #[tokio::test]
    async fn test_topics_are_isolated() {
        let hub = Hub::new(8);
        let a = hub.subscribe("camera:1", Interest::Both);
        hub.publish_event("camera:2", event(9));
        hub.publish_event("camera:1", event(1));
        assert_eq!(event_n(&recv_soon(&a).await), 1);
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops_oldest_only_for_itself() {
        let hub = Hub::new(4);
        let slow = hub.subscribe("camera:1", Interest::Both);
        let fast = hub.subscribe("camera:1", Interest::Both);

        for n in 0..10 {
            hub.publish_event("camera:1", event(n));
            // Fast reader keeps up.
            assert_eq!(event_n(&recv_soon(&fast).await), n);
        }

        // Slow reader never read: it holds the newest 4, dropped 6.
        assert_eq!(slow.dropped(), 6);
        assert_eq!(fast.dropped(), 0);
        let first = recv_soon(&slow).await;
        assert_eq!(event_n(&first), 6);
    }

    #[tokio::test]
    async fn test_sequence_has_gaps_but_preserves_order() {
        let hub = Hub::new(2);
        let sub = hub.subscribe("camera:1", Interest::Both);
        for n in 0..5 {
            hub.publish_event("camera:1", event(n));
        }

        let first = recv_soon(&sub).await;
        let second = recv_soon(&sub).await;
        assert_eq!(first.seq, 3);
        assert_eq!(second.seq, 4);
        assert!(second.seq > first.seq);
    }

    #[tokio::test]
    async fn test_interest_filters_messages() {
        let hub = Hub::new(8);
        let frames_only = hub.subscribe("camera:1", Interest::Frames);
        let events_only = hub.subscribe("camera:1", Interest::Events);

        hub.publish_event("camera:1", event(1));
        hub.publish_frame("camera:1", Bytes::from_static(b"jpeg"));

        match recv_soon(&frames_only).await.message {
            Message::Frame(bytes) => assert_eq!(&bytes[..], b"jpeg"),
            Message::Event(_) => panic!("frames-only subscriber got an event"),
        }
        assert_eq!(event_n(&recv_soon(&events_only).await), 1);
    }

    #[tokio::test]
    async fn test_cancel_is_idempotent_and_detaches() {
        let hub = Hub::new(8);
        let sub = hub.subscribe("camera:1", Interest::Both);
        sub.cancel();
        sub.cancel();
        assert_eq!(hub.subscriber_count("camera:1"), 0);

        // Next publish reclaims the slot without delivering.
        hub.publish_event("camera:1", event(1));
        drop(sub);
        hub.publish_event("camera:1", event(2));
        assert_eq!(hub.subscriber_count("camera:1"), 0);
    }

    #[tokio::test]
    async fn test_publish_without_subscribers_is_fine() {
        let hub = Hub::new(8);
        hub.publish_event("room:1", event(1));
        hub.publish_frame("room:1", Bytes::from_static(b"x"));

        // Sequence kept counting while nobody listened.
        let sub = hub.subscribe("room:1", Interest::Both);
        hub.publish_event("room:1", event(2));
        assert_eq!(recv_soon(&sub).await.seq, 2);
    }
}
