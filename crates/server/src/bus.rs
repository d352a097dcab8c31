// crates/server/src/bus.rs
//! In-process topic-keyed publish/subscribe fabric.
//!
//! Per-subscriber queues are bounded at 256 events; a full queue drops its
//! OLDEST event and bumps that subscriber's drop counter, so publishers
//! never block on slow consumers. Each topic carries at most 5 subscribers;
//! a sixth subscription evicts (closes) the oldest handle. Events published
//! to one topic reach every live subscriber in publish order.
//!
//! The bus emits no heartbeats; keep-alives belong to the transport layer.

use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::Notify;

/// Topic carrying cross-session events for the dashboard stream.
pub const GLOBAL_TOPIC: &str = "dashboard";

/// Per-subscriber queue capacity.
const QUEUE_CAPACITY: usize = 256;
/// Max concurrent subscribers on one topic.
const MAX_SUBSCRIBERS_PER_TOPIC: usize = 5;

/// Structured events flowing through the bus.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RemoteEvent {
    NewMessage {
        session_id: String,
        role: String,
        preview: String,
        timestamp: String,
    },
    ToolUse {
        session_id: String,
        tool_name: String,
        summary: String,
        timestamp: String,
    },
    SessionStarted {
        session_id: String,
    },
    NeedsInput {
        session_id: String,
        slug: Option<String>,
        last_message_preview: String,
        idle_seconds: u64,
    },
}

impl RemoteEvent {
    /// SSE event name for this variant.
    pub fn event_name(&self) -> &'static str {
        match self {
            RemoteEvent::NewMessage { .. } => "new_message",
            RemoteEvent::ToolUse { .. } => "tool_use",
            RemoteEvent::SessionStarted { .. } => "session_started",
            RemoteEvent::NeedsInput { .. } => "needs_input",
        }
    }

    pub fn session_id(&self) -> &str {
        match self {
            RemoteEvent::NewMessage { session_id, .. }
            | RemoteEvent::ToolUse { session_id, .. }
            | RemoteEvent::SessionStarted { session_id }
            | RemoteEvent::NeedsInput { session_id, .. } => session_id,
        }
    }
}

#[derive(Default)]
struct QueueState {
    events: VecDeque<RemoteEvent>,
    closed: bool,
    dropped: u64,
}

struct SubscriberQueue {
    state: Mutex<QueueState>,
    notify: Notify,
}

impl SubscriberQueue {
    fn new() -> Self {
        Self {
            state: Mutex::new(QueueState::default()),
            notify: Notify::new(),
        }
    }

    fn push(&self, event: RemoteEvent) {
        {
            let mut state = self.state.lock().expect("bus queue lock");
            if state.closed {
                return;
            }
            if state.events.len() == QUEUE_CAPACITY {
                state.events.pop_front();
                state.dropped += 1;
            }
            state.events.push_back(event);
        }
        self.notify.notify_one();
    }

    fn close(&self) {
        self.state.lock().expect("bus queue lock").closed = true;
        self.notify.notify_one();
    }
}

struct SubscriberSlot {
    id: u64,
    queue: Arc<SubscriberQueue>,
}

struct BusState {
    topics: Mutex<HashMap<String, Vec<SubscriberSlot>>>,
    next_id: AtomicU64,
}

/// Cloneable handle to the process-wide bus.
#[derive(Clone)]
pub struct EventBus {
    state: Arc<BusState>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            state: Arc::new(BusState {
                topics: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
            }),
        }
    }

    /// Subscribe to a topic. If the topic already has the maximum number of
    /// subscribers, the OLDEST one is force-closed to make room.
    pub fn subscribe(&self, topic: &str) -> Subscription {
        let id = self.state.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(SubscriberQueue::new());

        let mut topics = self.state.topics.lock().expect("bus topics lock");
        let slots = topics.entry(topic.to_string()).or_default();
        if slots.len() >= MAX_SUBSCRIBERS_PER_TOPIC {
            let evicted = slots.remove(0);
            evicted.queue.close();
            tracing::debug!(topic, evicted = evicted.id, "evicted oldest subscriber at cap");
        }
        slots.push(SubscriberSlot {
            id,
            queue: queue.clone(),
        });

        Subscription {
            topic: topic.to_string(),
            id,
            queue,
            bus: self.state.clone(),
        }
    }

    /// Publish an event to every subscriber of a topic. Never blocks.
    pub fn publish(&self, topic: &str, event: RemoteEvent) {
        let topics = self.state.topics.lock().expect("bus topics lock");
        if let Some(slots) = topics.get(topic) {
            for slot in slots {
                slot.queue.push(event.clone());
            }
        }
    }

    /// Current live subscriber count for a topic.
    pub fn subscriber_count(&self, topic: &str) -> usize {
        self.state
            .topics
            .lock()
            .expect("bus topics lock")
            .get(topic)
            .map(|slots| slots.len())
            .unwrap_or(0)
    }
}

fn detach(bus: &BusState, topic: &str, id: u64) {
    let mut topics = bus.topics.lock().expect("bus topics lock");
    if let Some(slots) = topics.get_mut(topic) {
        slots.retain(|slot| slot.id != id);
        if slots.is_empty() {
            topics.remove(topic);
        }
    }
}

/// A live subscription handle. Dropping it unsubscribes.
pub struct Subscription {
    topic: String,
    id: u64,
    queue: Arc<SubscriberQueue>,
    bus: Arc<BusState>,
}

impl Subscription {
    /// Wait for the next event. Returns `None` once the handle has been
    /// closed (evicted or unsubscribed) and its queue is drained.
    pub async fn recv(&mut self) -> Option<RemoteEvent> {
        loop {
            {
                let mut state = self.queue.state.lock().expect("bus queue lock");
                if let Some(event) = state.events.pop_front() {
                    return Some(event);
                }
                if state.closed {
                    return None;
                }
            }
            self.queue.notify.notified().await;
        }
    }

    /// Non-blocking receive.
    pub fn try_recv(&mut self) -> Option<RemoteEvent> {
        self.queue
            .state
            .lock()
            .expect("bus queue lock")
            .events
            .pop_front()
    }

    /// Events dropped from this subscriber's queue due to overflow.
    pub fn dropped(&self) -> u64 {
        self.queue.state.lock().expect("bus queue lock").dropped
    }

    pub fn is_closed(&self) -> bool {
        self.queue.state.lock().expect("bus queue lock").closed
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Explicit unsubscribe; idempotent (Drop performs the same detach).
    pub fn unsubscribe(&self) {
        self.queue.close();
        detach(&self.bus, &self.topic, self.id);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.unsubscribe();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn msg(n: u64) -> RemoteEvent {
        RemoteEvent::NewMessage {
            session_id: "A".into(),
            role: "user".into(),
            preview: format!("event {n}"),
            timestamp: "2026-02-06T06:46:54.000Z".into(),
        }
    }

    #[tokio::test]
    async fn delivery_in_publish_order() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("A");
        for n in 0..10 {
            bus.publish("A", msg(n));
        }
        for n in 0..10 {
            assert_eq!(sub.recv().await, Some(msg(n)));
        }
    }

    #[tokio::test]
    async fn topics_are_isolated() {
        let bus = EventBus::new();
        let mut sub_a = bus.subscribe("A");
        let _sub_b = bus.subscribe("B");

        bus.publish("B", msg(1));
        bus.publish("A", msg(2));
        assert_eq!(sub_a.recv().await, Some(msg(2)));
        assert!(sub_a.try_recv().is_none());
    }

    #[tokio::test]
    async fn overflow_drops_oldest_and_counts() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("A");
        for n in 0..(QUEUE_CAPACITY as u64 + 10) {
            bus.publish("A", msg(n));
        }

        assert_eq!(sub.dropped(), 10);
        // The first event still present is number 10: drops never reorder,
        // the survivors are a suffix of the publish sequence (P6).
        assert_eq!(sub.recv().await, Some(msg(10)));
        let mut last = 10u64;
        while let Some(event) = sub.try_recv() {
            let RemoteEvent::NewMessage { preview, .. } = &event else {
                panic!("unexpected event");
            };
            let n: u64 = preview.strip_prefix("event ").unwrap().parse().unwrap();
            assert_eq!(n, last + 1, "drop must preserve order");
            last = n;
        }
        assert_eq!(last, QUEUE_CAPACITY as u64 + 9);
    }

    #[tokio::test]
    async fn subscriber_cap_evicts_oldest() {
        let bus = EventBus::new();
        let mut first = bus.subscribe("A");
        let _rest: Vec<_> = (0..4).map(|_| bus.subscribe("A")).collect();
        assert_eq!(bus.subscriber_count("A"), 5);

        // Sixth subscriber evicts the first (P7: never more than 5).
        let _sixth = bus.subscribe("A");
        assert_eq!(bus.subscriber_count("A"), 5);
        assert!(first.is_closed());
        assert_eq!(first.recv().await, None);
    }

    #[tokio::test]
    async fn unsubscribe_is_idempotent() {
        let bus = EventBus::new();
        let sub = bus.subscribe("A");
        sub.unsubscribe();
        sub.unsubscribe();
        assert_eq!(bus.subscriber_count("A"), 0);
        drop(sub);
        assert_eq!(bus.subscriber_count("A"), 0);
    }

    #[tokio::test]
    async fn drop_unsubscribes() {
        let bus = EventBus::new();
        {
            let _sub = bus.subscribe("A");
            assert_eq!(bus.subscriber_count("A"), 1);
        }
        assert_eq!(bus.subscriber_count("A"), 0);
    }

    #[tokio::test]
    async fn publish_to_topic_without_subscribers_is_noop() {
        let bus = EventBus::new();
        bus.publish("nobody-home", msg(1));
    }

    #[tokio::test]
    async fn recv_wakes_on_publish() {
        let bus = EventBus::new();
        let mut sub = bus.subscribe("A");

        let publisher = {
            let bus = bus.clone();
            tokio::spawn(async move {
                tokio::time::sleep(std::time::Duration::from_millis(10)).await;
                bus.publish("A", msg(7));
            })
        };

        assert_eq!(sub.recv().await, Some(msg(7)));
        publisher.await.unwrap();
    }

    #[test]
    fn event_names_match_variants() {
        assert_eq!(msg(0).event_name(), "new_message");
        assert_eq!(
            RemoteEvent::SessionStarted {
                session_id: "A".into()
            }
            .event_name(),
            "session_started"
        );
    }
}
