//! The pipeline-scoped event bus.

use super::{Event, EventMask, EventSink};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Default number of pending events before the bus starts warning.
pub const DEFAULT_BUS_CAPACITY: usize = 1024;

#[derive(Debug, Default)]
struct Queue {
    events: VecDeque<Event>,
    flushing: bool,
    next_seqnum: u64,
    over_capacity: bool,
}

/// Counters for bus traffic.
#[derive(Debug, Default)]
pub struct BusStats {
    posted: AtomicU64,
    dropped: AtomicU64,
    high_water: AtomicU64,
}

impl BusStats {
    /// Events accepted by the bus.
    #[must_use]
    pub fn posted(&self) -> u64 {
        self.posted.load(Ordering::Relaxed)
    }

    /// Events discarded because the bus was flushing or they were filtered out.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Largest number of pending events observed.
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water.load(Ordering::Relaxed)
    }

    /// Converts stats to a JSON object.
    #[must_use]
    pub fn to_dict(&self) -> serde_json::Value {
        serde_json::json!({
            "posted": self.posted(),
            "dropped": self.dropped(),
            "high_water": self.high_water(),
        })
    }
}

/// An ordered, blocking-pollable channel of pipeline events.
///
/// Any thread may [`post`](Self::post); the control thread consumes with
/// [`poll`](Self::poll) or [`poll_filtered`](Self::poll_filtered). Events are
/// delivered in posting order and each is consumed once. Posting never blocks:
/// `capacity` is a soft limit that only produces a warning, so a slow reader
/// can never stall a streaming thread.
pub struct EventBus {
    name: String,
    capacity: usize,
    queue: Mutex<Queue>,
    available: Condvar,
    taps: RwLock<Vec<Arc<dyn EventSink>>>,
    stats: BusStats,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("pending", &self.pending())
            .finish_non_exhaustive()
    }
}

impl EventBus {
    /// Creates a bus with the default capacity.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self::with_capacity(name, DEFAULT_BUS_CAPACITY)
    }

    /// Creates a bus with a given soft capacity.
    #[must_use]
    pub fn with_capacity(name: impl Into<String>, capacity: usize) -> Self {
        Self {
            name: name.into(),
            capacity: capacity.max(1),
            queue: Mutex::new(Queue {
                events: VecDeque::with_capacity(capacity.clamp(1, 64)),
                ..Queue::default()
            }),
            available: Condvar::new(),
            taps: RwLock::new(Vec::new()),
            stats: BusStats::default(),
        }
    }

    /// Name of the owning pipeline.
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Traffic counters.
    #[must_use]
    pub fn stats(&self) -> &BusStats {
        &self.stats
    }

    /// Attaches a tap that sees every accepted event.
    pub fn add_sink(&self, sink: Arc<dyn EventSink>) {
        self.taps.write().push(sink);
    }

    /// Posts an event. Returns false if the bus is flushing and the event was dropped.
    pub fn post(&self, mut event: Event) -> bool {
        let mut queue = self.queue.lock();
        if queue.flushing {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
            trace!(bus = %self.name, event = %event, "bus flushing, dropping event");
            return false;
        }

        queue.next_seqnum += 1;
        event.seqnum = queue.next_seqnum;

        // taps run under the queue lock so they observe posting order
        for tap in self.taps.read().iter() {
            tap.try_emit(&event);
        }

        queue.events.push_back(event);
        let pending = queue.events.len();
        self.stats.posted.fetch_add(1, Ordering::Relaxed);
        self.stats
            .high_water
            .fetch_max(pending as u64, Ordering::Relaxed);

        if pending > self.capacity && !queue.over_capacity {
            queue.over_capacity = true;
            warn!(bus = %self.name, pending, capacity = self.capacity, "event bus is not being drained");
        } else if pending <= self.capacity {
            queue.over_capacity = false;
        }

        drop(queue);
        self.available.notify_all();
        true
    }

    /// Blocks until an event is available, the timeout elapses, or the bus flushes.
    ///
    /// `None` as timeout waits forever.
    #[must_use]
    pub fn poll(&self, timeout: Option<Duration>) -> Option<Event> {
        self.poll_filtered(timeout, EventMask::ALL)
    }

    /// Like [`poll`](Self::poll), but discards events whose kind is not in `mask`.
    #[must_use]
    pub fn poll_filtered(&self, timeout: Option<Duration>, mask: EventMask) -> Option<Event> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut queue = self.queue.lock();

        loop {
            while let Some(event) = queue.events.pop_front() {
                if mask.contains(event.kind()) {
                    return Some(event);
                }
                self.stats.dropped.fetch_add(1, Ordering::Relaxed);
                trace!(bus = %self.name, event = %event, "discarding filtered event");
            }

            if queue.flushing {
                return None;
            }

            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut queue, deadline).timed_out() {
                        // one last look, an event may have raced the timeout
                        return Self::pop_matching(&mut queue, mask, &self.stats);
                    }
                }
                None => self.available.wait(&mut queue),
            }
        }
    }

    /// Pops the next event without waiting.
    #[must_use]
    pub fn pop(&self) -> Option<Event> {
        self.queue.lock().events.pop_front()
    }

    fn pop_matching(queue: &mut Queue, mask: EventMask, stats: &BusStats) -> Option<Event> {
        while let Some(event) = queue.events.pop_front() {
            if mask.contains(event.kind()) {
                return Some(event);
            }
            stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        None
    }

    /// Enables or disables flushing.
    ///
    /// While flushing, pending events are discarded, posts are dropped, and
    /// blocked pollers return `None`.
    pub fn set_flushing(&self, flushing: bool) {
        let mut queue = self.queue.lock();
        queue.flushing = flushing;
        if flushing {
            let discarded = queue.events.len() as u64;
            queue.events.clear();
            self.stats.dropped.fetch_add(discarded, Ordering::Relaxed);
        }
        drop(queue);
        self.available.notify_all();
    }

    /// Returns true while the bus is flushing.
    #[must_use]
    pub fn is_flushing(&self) -> bool {
        self.queue.lock().flushing
    }

    /// Number of events waiting to be polled.
    #[must_use]
    pub fn pending(&self) -> usize {
        self.queue.lock().events.len()
    }
}
