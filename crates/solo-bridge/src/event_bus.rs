use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use crate::protocol::{ActivityEntry, DaemonEvent, EventKind};

/// Default capacity of the activity ring buffer.
pub const ACTIVITY_CAPACITY: usize = 256;

struct BusInner {
    /// Wildcard subscribers — receive every event.
    wildcard: Vec<flume::Sender<DaemonEvent>>,
    /// Dispatch table keyed by event kind.
    by_kind: HashMap<EventKind, Vec<flume::Sender<DaemonEvent>>>,
    /// Bounded activity log; oldest entries evicted past capacity.
    activity: VecDeque<ActivityEntry>,
    capacity: usize,
}

/// Synchronous in-process publish/subscribe bus with a bounded activity
/// ring buffer.
///
/// Events are delivered in emission order on the publishing thread; a
/// disconnected subscriber is pruned and never breaks delivery to the
/// others. Cheaply clonable (wraps its internals in an `Arc`).
#[derive(Clone)]
pub struct EventBus {
    inner: Arc<Mutex<BusInner>>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::with_capacity(ACTIVITY_CAPACITY)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: Arc::new(Mutex::new(BusInner {
                wildcard: Vec::new(),
                by_kind: HashMap::new(),
                activity: VecDeque::with_capacity(capacity),
                capacity,
            })),
        }
    }

    /// Register a wildcard subscriber that receives every published event.
    pub fn subscribe(&self) -> flume::Receiver<DaemonEvent> {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.inner.lock().expect("EventBus lock poisoned");
        inner.wildcard.push(tx);
        rx
    }

    /// Register a subscriber for a single event kind.
    pub fn subscribe_kind(&self, kind: EventKind) -> flume::Receiver<DaemonEvent> {
        let (tx, rx) = flume::unbounded();
        let mut inner = self.inner.lock().expect("EventBus lock poisoned");
        inner.by_kind.entry(kind).or_default().push(tx);
        rx
    }

    /// Publish an event to kind-specific and wildcard subscribers, and
    /// append the derived activity entry to the ring buffer.
    pub fn publish(&self, event: DaemonEvent) {
        let entry = ActivityEntry::from_event(&event);
        tracing::debug!(kind = ?entry.kind, status = ?entry.status, "{}", entry.message);

        let mut inner = self.inner.lock().expect("EventBus lock poisoned");
        if inner.activity.len() >= inner.capacity {
            inner.activity.pop_front();
        }
        inner.activity.push_back(entry);

        let kind = event.kind();
        if let Some(senders) = inner.by_kind.get_mut(&kind) {
            senders.retain(|tx| tx.send(event.clone()).is_ok());
        }
        inner.wildcard.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// Most recent activity entries, newest last, capped at `limit`.
    pub fn recent_activity(&self, limit: usize) -> Vec<ActivityEntry> {
        let inner = self.inner.lock().expect("EventBus lock poisoned");
        let skip = inner.activity.len().saturating_sub(limit);
        inner.activity.iter().skip(skip).cloned().collect()
    }

    /// Number of currently active subscribers (wildcard + keyed).
    pub fn subscriber_count(&self) -> usize {
        let inner = self.inner.lock().expect("EventBus lock poisoned");
        inner.wildcard.len() + inner.by_kind.values().map(Vec::len).sum::<usize>()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
