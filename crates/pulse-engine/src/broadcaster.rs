//! Event fan-out with backpressure-by-eviction.
//!
//! A single publisher task drains a bounded inbox and offers each frame to
//! every matching subscription without blocking: a full buffer gets one
//! short grace wait, then the subscriber pays for its own slowness: its
//! oldest frames are discarded behind an in-band lag marker, and repeat
//! offenders are evicted. Healthy subscribers are lossless and receive
//! frames in publish order; per-operation order is total because there is
//! exactly one publisher task.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use pulse_types::{Event, OperationState, PushFrame, StreamMarker};
use tokio::sync::{Notify, mpsc};
use tracing::{debug, warn};
use uuid::Uuid;

/// How long the publisher waits for a full buffer to drain before
/// discarding frames for that subscriber.
const PUBLISH_GRACE: Duration = Duration::from_millis(50);

/// Lag incidents within [`LAG_WINDOW`] that trigger eviction.
const LAG_EVICTION_THRESHOLD: usize = 3;

/// Rolling window over which lag incidents are counted.
const LAG_WINDOW: Duration = Duration::from_secs(30);

/// Depth of the publisher inbox shared by all publishers.
const INBOX_DEPTH: usize = 1024;

/// Which frames a subscription wants to see.
///
/// A closed set rather than an arbitrary predicate: subscribers select by
/// operation, not by string-matching event payloads.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum EventFilter {
    /// Every operation's frames.
    All,
    /// Only frames belonging to one operation.
    Operation(String),
}

impl EventFilter {
    pub fn matches(&self, event: &Event) -> bool {
        self.matches_operation(Some(&event.operation_id))
    }

    /// Whether frames belonging to `operation_id` pass this filter.
    pub(crate) fn matches_operation_id(&self, operation_id: &str) -> bool {
        self.matches_operation(Some(operation_id))
    }

    fn matches_operation(&self, operation_id: Option<&str>) -> bool {
        match self {
            Self::All => true,
            Self::Operation(id) => operation_id == Some(id.as_str()),
        }
    }
}

/// What travels through the publisher inbox: a frame plus the operation it
/// belongs to, for filter matching.
struct Outbound {
    operation_id: Option<String>,
    frame: PushFrame,
}

struct SubscriptionQueue {
    frames: VecDeque<PushFrame>,
    /// Timestamps of recent lag incidents, pruned to [`LAG_WINDOW`].
    lag_incidents: VecDeque<Instant>,
}

struct SubscriptionShared {
    id: Uuid,
    filter: EventFilter,
    capacity: usize,
    queue: Mutex<SubscriptionQueue>,
    data_ready: Notify,
    space_free: Notify,
    closed: AtomicBool,
}

impl SubscriptionShared {
    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Non-blocking offer. `false` means the buffer is full.
    fn offer(&self, frame: PushFrame) -> bool {
        if self.is_closed() {
            // A closed sink swallows frames silently; the entry is swept
            // from the list on the next publish pass.
            return true;
        }
        let mut queue = self.queue.lock().expect("subscription queue lock");
        if queue.frames.len() >= self.capacity {
            return false;
        }
        queue.frames.push_back(frame);
        drop(queue);
        self.data_ready.notify_one();
        true
    }

    /// Records one lag incident: discards the oldest frames, refreshes the
    /// front lag marker, and keeps the incoming frame. Returns the number
    /// of incidents inside the rolling window.
    ///
    /// The queue may momentarily hold `capacity + 1` entries; the marker
    /// rides in front of a full buffer rather than displacing live data.
    fn lag(&self, frame: PushFrame) -> usize {
        let mut queue = self.queue.lock().expect("subscription queue lock");

        let mut dropped: u64 = 0;
        // Re-absorb an unconsumed front marker so markers never stack.
        if let Some(PushFrame::Marker(StreamMarker::Lagged { dropped: prior })) =
            queue.frames.front()
        {
            dropped += *prior;
            queue.frames.pop_front();
        }
        while queue.frames.len() >= self.capacity {
            queue.frames.pop_front();
            dropped += 1;
        }
        queue.frames.push_back(frame);
        queue
            .frames
            .push_front(PushFrame::Marker(StreamMarker::Lagged { dropped }));

        let now = Instant::now();
        queue.lag_incidents.push_back(now);
        while queue
            .lag_incidents
            .front()
            .is_some_and(|at| now.duration_since(*at) > LAG_WINDOW)
        {
            queue.lag_incidents.pop_front();
        }
        let incidents = queue.lag_incidents.len();
        drop(queue);
        self.data_ready.notify_one();
        incidents
    }

    /// Closes the sink with a terminal eviction marker.
    fn evict(&self, reason: &str) {
        let mut queue = self.queue.lock().expect("subscription queue lock");
        queue.frames.push_back(PushFrame::Marker(StreamMarker::Evicted {
            reason: reason.to_string(),
        }));
        drop(queue);
        self.closed.store(true, Ordering::Release);
        self.data_ready.notify_one();
    }
}

/// A subscriber's handle on its bounded delivery buffer.
///
/// Dropping the subscription detaches it; the broadcaster sweeps the
/// entry on its next publish pass.
pub struct Subscription {
    shared: Arc<SubscriptionShared>,
}

impl Subscription {
    pub fn id(&self) -> Uuid {
        self.shared.id
    }

    /// Next frame in publish order, or `None` once the sink is closed and
    /// drained. Lag and eviction surface as in-band [`StreamMarker`]s
    /// before the stream ends.
    pub async fn recv(&mut self) -> Option<PushFrame> {
        loop {
            let notified = self.shared.data_ready.notified();
            {
                let mut queue = self.shared.queue.lock().expect("subscription queue lock");
                if let Some(frame) = queue.frames.pop_front() {
                    drop(queue);
                    self.shared.space_free.notify_one();
                    return Some(frame);
                }
                if self.shared.is_closed() {
                    return None;
                }
            }
            notified.await;
        }
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.shared.closed.store(true, Ordering::Release);
    }
}

struct BroadcasterShared {
    subscriptions: Mutex<Vec<Arc<SubscriptionShared>>>,
    buffer_depth: usize,
}

/// Cloneable handle to the fan-out. See the module docs for the delivery
/// and backpressure contract.
#[derive(Clone)]
pub struct Broadcaster {
    inbox: mpsc::Sender<Outbound>,
    shared: Arc<BroadcasterShared>,
}

impl Broadcaster {
    /// Spawns the publisher task. Must be called within a tokio runtime.
    pub fn new(subscriber_buffer_depth: usize) -> Self {
        let (inbox, outbox) = mpsc::channel(INBOX_DEPTH);
        let shared = Arc::new(BroadcasterShared {
            subscriptions: Mutex::new(Vec::new()),
            buffer_depth: subscriber_buffer_depth.max(1),
        });
        tokio::spawn(publisher_loop(outbox, Arc::clone(&shared)));
        Self { inbox, shared }
    }

    /// Queues an event for fan-out. Never fails upward; suspends only when
    /// the publisher inbox is full, which is itself bounded by the
    /// publisher's per-event grace budget.
    pub async fn publish(&self, event: Event) {
        let outbound = Outbound {
            operation_id: Some(event.operation_id.clone()),
            frame: PushFrame::Event(event),
        };
        if self.inbox.send(outbound).await.is_err() {
            debug!("publisher task gone; event dropped");
        }
    }

    /// Queues a full-state milestone snapshot for fan-out.
    pub async fn publish_snapshot(&self, state: OperationState) {
        let outbound = Outbound {
            operation_id: Some(state.id.clone()),
            frame: PushFrame::snapshot(state),
        };
        if self.inbox.send(outbound).await.is_err() {
            debug!("publisher task gone; snapshot dropped");
        }
    }

    pub fn subscribe(&self, filter: EventFilter) -> Subscription {
        self.subscribe_seeded(filter, Vec::new())
    }

    /// Attaches a subscription whose buffer is pre-loaded with `seed`
    /// frames (state snapshots for late joiners).
    pub fn subscribe_seeded(&self, filter: EventFilter, seed: Vec<PushFrame>) -> Subscription {
        let shared = Arc::new(SubscriptionShared {
            id: Uuid::new_v4(),
            filter,
            capacity: self.shared.buffer_depth,
            queue: Mutex::new(SubscriptionQueue {
                frames: seed.into(),
                lag_incidents: VecDeque::new(),
            }),
            data_ready: Notify::new(),
            space_free: Notify::new(),
            closed: AtomicBool::new(false),
        });
        self.shared
            .subscriptions
            .lock()
            .expect("subscription list lock")
            .push(Arc::clone(&shared));
        Subscription { shared }
    }

    /// Live (non-closed) subscription count.
    pub fn subscriber_count(&self) -> usize {
        self.shared
            .subscriptions
            .lock()
            .expect("subscription list lock")
            .iter()
            .filter(|s| !s.is_closed())
            .count()
    }
}

async fn publisher_loop(mut outbox: mpsc::Receiver<Outbound>, shared: Arc<BroadcasterShared>) {
    while let Some(outbound) = outbox.recv().await {
        deliver(&shared, outbound).await;
    }
}

async fn deliver(shared: &BroadcasterShared, outbound: Outbound) {
    // Sweep detached sinks and snapshot the matching targets, then deliver
    // outside the lock: the grace wait must not stall subscribe calls.
    let targets: Vec<Arc<SubscriptionShared>> = {
        let mut subscriptions = shared
            .subscriptions
            .lock()
            .expect("subscription list lock");
        subscriptions.retain(|s| !s.is_closed());
        subscriptions
            .iter()
            .filter(|s| {
                s.filter
                    .matches_operation(outbound.operation_id.as_deref())
            })
            .map(Arc::clone)
            .collect()
    };

    for subscription in targets {
        if subscription.offer(outbound.frame.clone()) {
            continue;
        }

        // One bounded grace wait to tolerate a brief hiccup.
        let _ = tokio::time::timeout(PUBLISH_GRACE, subscription.space_free.notified()).await;
        if subscription.offer(outbound.frame.clone()) {
            continue;
        }

        let incidents = subscription.lag(outbound.frame.clone());
        warn!(
            subscriber = %subscription.id,
            incidents,
            "slow subscriber; discarded oldest frames"
        );
        if incidents >= LAG_EVICTION_THRESHOLD {
            warn!(subscriber = %subscription.id, "evicting subscriber: lag threshold exceeded");
            subscription.evict("lag threshold exceeded");
        }
    }
}
