//! Event bus adapter.
//!
//! `EventBus` is the trait every worker programs against; `InProcessBus`
//! is the concrete implementation used by this crate, playing the role
//! the source system's NATS JetStream adapter plays: per-subject durable
//! queues, a short-lived dedup window keyed by idempotency key, batched
//! pull with a fetch timeout, and ack-after-apply. A durable backend
//! (e.g. `async-nats`) can implement `EventBus` without touching callers
//! that hold `Arc<dyn EventBus>`; today's workers hold the concrete
//! `Arc<InProcessBus>` and use its inherent methods directly, since only
//! one implementation exists.
//!
//! Grounded in this crate's `broadcast`/`mpsc` channel idioms
//! (`scrapers/binance_price_feed.rs`) and in the source system's
//! `events/bus.py` (`InMemoryEventBus`) and `events/jetstream_bus.py`
//! (pull-subscribe-per-stream-group, `fetch(batch, timeout)`).

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::events::{default_stream_specs, dlq_subject_for_event, subject_for_event, Event};

/// Policy fields mirrored from the JetStream stream config the source
/// system builds (`events/jetstream.py::_stream_config`); carried even
/// though the in-process bus only uses `duplicate_window` today, so a
/// durable adapter can be swapped in without a policy redesign.
#[derive(Debug, Clone)]
pub struct StreamPolicy {
    pub max_age_seconds: u64,
    pub duplicate_window: Duration,
}

impl StreamPolicy {
    pub fn from_retention_hours(retention_hours: u64) -> Self {
        Self {
            max_age_seconds: retention_hours * 3600,
            duplicate_window: Duration::from_secs(120),
        }
    }
}

/// Bus abstraction every worker programs against. `InProcessBus` is the
/// only implementation today; a durable adapter (`async-nats`) would
/// implement this trait instead of replacing call sites.
pub trait EventBus {
    /// Publish an event, routing by subject. Returns `false` if the event
    /// was a duplicate within the dedup window.
    fn publish(&self, event: Event) -> bool;

    /// Create a durable pull-consumer bound to a set of subject filters.
    fn subscribe(&self, durable_name: &str, subjects: Vec<String>, queue_capacity: usize) -> DurableConsumer;
}

struct Queue {
    subjects: Vec<String>,
    items: VecDeque<Event>,
    notify: Arc<Notify>,
    dropped: u64,
    capacity: usize,
}

/// A durable pull-consumer handle. `fetch` drains up to `batch` items,
/// waiting up to `timeout` for at least one to arrive.
pub struct DurableConsumer {
    name: String,
    queue: Arc<Mutex<Queue>>,
}

impl DurableConsumer {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn num_pending(&self) -> usize {
        self.queue.lock().items.len()
    }

    pub async fn fetch(&self, batch: usize, timeout: Duration) -> Vec<Event> {
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut q = self.queue.lock();
                if !q.items.is_empty() {
                    let n = batch.min(q.items.len());
                    return q.items.drain(..n).collect();
                }
            }
            let now = Instant::now();
            if now >= deadline {
                return Vec::new();
            }
            let notify = self.queue.lock().notify.clone();
            let wait = tokio::time::sleep(deadline - now);
            tokio::select! {
                _ = notify.notified() => {}
                _ = wait => { return Vec::new(); }
            }
        }
    }
}

struct DedupEntry {
    seen_at: Instant,
}

/// In-process bus: per-consumer bounded queues fed by subject routing,
/// plus a short-lived idempotency-key dedup window shared across all
/// consumers (mirrors JetStream's server-side duplicate detection).
pub struct InProcessBus {
    policy: StreamPolicy,
    consumers: Mutex<Vec<Arc<Mutex<Queue>>>>,
    dedup: Mutex<HashMap<String, DedupEntry>>,
    published: std::sync::atomic::AtomicU64,
    deduped: std::sync::atomic::AtomicU64,
}

impl InProcessBus {
    pub fn new(policy: StreamPolicy) -> Arc<Self> {
        Arc::new(Self {
            policy,
            consumers: Mutex::new(Vec::new()),
            dedup: Mutex::new(HashMap::new()),
            published: std::sync::atomic::AtomicU64::new(0),
            deduped: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// Streams this bus currently understands, mirrored from
    /// `default_stream_specs()` for documentation/inspection purposes.
    pub fn stream_specs(&self) -> Vec<crate::events::JetStreamStreamSpec> {
        default_stream_specs()
    }

    fn prune_dedup(&self, dedup: &mut HashMap<String, DedupEntry>) {
        let window = self.policy.duplicate_window;
        let now = Instant::now();
        dedup.retain(|_, entry| now.duration_since(entry.seen_at) < window);
    }

    /// Publish an event to every durable consumer subscribed to its
    /// subject. Returns `false` if the event was a duplicate within the
    /// dedup window (in which case it is not delivered again).
    pub fn publish(&self, event: Event) -> bool {
        let subject = subject_for_event(event.event_type());
        {
            let mut dedup = self.dedup.lock();
            self.prune_dedup(&mut dedup);
            let key = event.idempotency_key().to_string();
            if dedup.contains_key(&key) {
                self.deduped.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                return false;
            }
            dedup.insert(
                key,
                DedupEntry {
                    seen_at: Instant::now(),
                },
            );
        }

        self.published
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);

        for consumer in self.consumers.lock().iter() {
            let mut q = consumer.lock();
            if q.subjects.iter().any(|s| subject_matches(s, subject)) {
                if q.items.len() >= q.capacity {
                    q.dropped += 1;
                } else {
                    q.items.push_back(event.clone());
                }
                q.notify.notify_waiters();
            }
        }
        true
    }

    /// Publish to a consumer's dead-letter subject. The event's own type
    /// still determines routing (`dlq.<subject>`), but delivery here is
    /// always best-effort and never deduped against the main stream.
    pub fn publish_dlq(&self, _dlq_subject: &str, event: Event) {
        self.published
            .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        for consumer in self.consumers.lock().iter() {
            let mut q = consumer.lock();
            if q.subjects.iter().any(|s| s == "dlq.>") {
                if q.items.len() >= q.capacity {
                    q.dropped += 1;
                } else {
                    q.items.push_back(event.clone());
                }
                q.notify.notify_waiters();
            }
        }
    }

    /// Create a durable pull-consumer bound to a set of subject filters
    /// (e.g. `market.>` style prefixes are expressed by passing the exact
    /// subjects that should match, since this in-process bus has no
    /// wildcard subject space of its own beyond simple prefix matching).
    pub fn pull_subscribe(
        &self,
        durable_name: impl Into<String>,
        subjects: Vec<String>,
        queue_capacity: usize,
    ) -> DurableConsumer {
        let queue = Arc::new(Mutex::new(Queue {
            subjects,
            items: VecDeque::new(),
            notify: Arc::new(Notify::new()),
            dropped: 0,
            capacity: queue_capacity,
        }));
        self.consumers.lock().push(queue.clone());
        DurableConsumer {
            name: durable_name.into(),
            queue,
        }
    }

    /// Standard three durable consumers the persistence projector and
    /// other whole-stream readers use, grounded in
    /// `events/jetstream_bus.py::subscribe_persistence_consumers`.
    pub fn subscribe_persistence_consumers(
        self: &Arc<Self>,
        durable_prefix: &str,
        queue_capacity: usize,
    ) -> [DurableConsumer; 3] {
        [
            self.pull_subscribe(
                format!("{durable_prefix}_market"),
                vec!["market.>".to_string()],
                queue_capacity,
            ),
            self.pull_subscribe(
                format!("{durable_prefix}_strategy"),
                vec!["strategy.>".to_string()],
                queue_capacity,
            ),
            self.pull_subscribe(
                format!("{durable_prefix}_execution"),
                vec!["execution.>".to_string()],
                queue_capacity,
            ),
        ]
    }

    pub fn metrics(&self) -> BusMetrics {
        BusMetrics {
            published: self.published.load(std::sync::atomic::Ordering::Relaxed),
            deduped: self.deduped.load(std::sync::atomic::Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BusMetrics {
    pub published: u64,
    pub deduped: u64,
}

impl EventBus for InProcessBus {
    fn publish(&self, event: Event) -> bool {
        InProcessBus::publish(self, event)
    }

    fn subscribe(&self, durable_name: &str, subjects: Vec<String>, queue_capacity: usize) -> DurableConsumer {
        self.pull_subscribe(durable_name.to_string(), subjects, queue_capacity)
    }
}

/// `market.>` style prefix matching: a filter ending in `.>` matches any
/// subject sharing its prefix; `dlq.>` matches any dlq subject; otherwise
/// exact match.
fn subject_matches(filter: &str, subject: &str) -> bool {
    if let Some(prefix) = filter.strip_suffix(".>") {
        subject.starts_with(prefix) && subject[prefix.len()..].starts_with('.')
    } else {
        filter == subject
    }
}

/// Derive the DLQ subject an event should be republished to on apply
/// failure, matching `dlq_subject_for_event`.
pub fn dlq_subject_for(event: &Event) -> String {
    dlq_subject_for_event(event.event_type())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{Envelope, EventType, SpotTickPayload};

    fn sample_event(ts: i64, seq: i64) -> Event {
        let payload = SpotTickPayload {
            ts,
            product_id: "BTC-USD".to_string(),
            price: 50000.0,
            best_bid: None,
            best_ask: None,
            bid_qty: None,
            ask_qty: None,
            sequence_num: Some(seq),
        };
        Event::SpotTick(Envelope::new(EventType::SpotTick, ts, "test", payload).unwrap())
    }

    #[test]
    fn subject_matching_supports_prefix_wildcards() {
        assert!(subject_matches("market.>", "market.spot_ticks"));
        assert!(!subject_matches("market.>", "strategy.edge_snapshots"));
        assert!(subject_matches("market.spot_ticks", "market.spot_ticks"));
    }

    #[tokio::test]
    async fn publish_routes_to_matching_consumer_and_dedups() {
        let bus = InProcessBus::new(StreamPolicy::from_retention_hours(168));
        let consumer = bus.pull_subscribe("test_market", vec!["market.>".to_string()], 16);

        assert!(bus.publish(sample_event(100, 1)));
        assert!(!bus.publish(sample_event(100, 1)));

        let batch = consumer.fetch(10, Duration::from_millis(50)).await;
        assert_eq!(batch.len(), 1);
        assert_eq!(bus.metrics().deduped, 1);
    }

    #[tokio::test]
    async fn non_matching_consumer_never_receives() {
        let bus = InProcessBus::new(StreamPolicy::from_retention_hours(168));
        let consumer = bus.pull_subscribe("test_strategy", vec!["strategy.>".to_string()], 16);
        bus.publish(sample_event(100, 1));
        let batch = consumer.fetch(10, Duration::from_millis(30)).await;
        assert!(batch.is_empty());
    }
}
