//! Bounded request priority queue.
//!
//! Requests dequeue in descending priority order; equal priorities dequeue
//! in arrival order (a monotonic sequence number is the timestamp
//! tie-break). A full queue refuses new work, except that a strictly
//! higher-priority arrival may displace the lowest-priority queued item,
//! which keeps an urgent request from starving behind bulk work.

use std::collections::BinaryHeap;
use std::time::Instant;

use crate::error::ServerError;
use crate::request::ViewWindowRequest;

/// Priority assigned to channel-creation requests.
pub const PRIORITY_NEW_CHANNEL: u8 = 100;

/// Priority assigned to metadata-only requests.
pub const PRIORITY_METADATA: u8 = 90;

/// Priority assigned to small-region requests.
pub const PRIORITY_SMALL_REGION: u8 = 80;

/// Priority assigned to everything else.
pub const PRIORITY_DEFAULT: u8 = 50;

/// Region area below which a request counts as small.
const SMALL_REGION_AREA: u64 = 10_000;

/// Derive the server-assigned priority for a request.
pub fn derive_priority(request: &ViewWindowRequest) -> u8 {
    if request.wants_new_channel() {
        PRIORITY_NEW_CHANNEL
    } else if request.metadata_only {
        PRIORITY_METADATA
    } else if request.region_area().is_some_and(|area| area < SMALL_REGION_AREA) {
        PRIORITY_SMALL_REGION
    } else {
        PRIORITY_DEFAULT
    }
}

/// One queued request with its ordering keys.
#[derive(Debug, Clone)]
pub struct QueuedRequest {
    pub request: ViewWindowRequest,
    pub priority: u8,
    pub enqueued_at: Instant,
    seq: u64,
}

impl PartialEq for QueuedRequest {
    fn eq(&self, other: &Self) -> bool {
        self.priority == other.priority && self.seq == other.seq
    }
}

impl Eq for QueuedRequest {}

impl PartialOrd for QueuedRequest {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for QueuedRequest {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        // Max-heap: higher priority first, then lower sequence (earlier
        // arrival) first.
        self.priority
            .cmp(&other.priority)
            .then(other.seq.cmp(&self.seq))
    }
}

/// Bounded priority queue over view-window requests.
#[derive(Debug)]
pub struct RequestQueue {
    heap: BinaryHeap<QueuedRequest>,
    capacity: usize,
    next_seq: u64,
    dropped: u64,
}

impl RequestQueue {
    pub fn new(capacity: usize) -> Self {
        Self {
            heap: BinaryHeap::with_capacity(capacity),
            capacity: capacity.max(1),
            next_seq: 0,
            dropped: 0,
        }
    }

    /// Enqueue a request at a priority.
    ///
    /// A full queue fails with a queue-full error unless the incoming
    /// priority strictly exceeds the lowest queued priority, in which case
    /// the lowest-priority item is dropped to make room.
    pub fn enqueue(
        &mut self,
        request: ViewWindowRequest,
        priority: u8,
    ) -> Result<(), ServerError> {
        if self.heap.len() >= self.capacity {
            let lowest = self.lowest_priority();
            if lowest.map_or(true, |p| priority <= p) {
                self.dropped += 1;
                return Err(ServerError::QueueFull {
                    capacity: self.capacity,
                });
            }
            self.remove_lowest();
            self.dropped += 1;
        }

        let item = QueuedRequest {
            request,
            priority,
            enqueued_at: Instant::now(),
            seq: self.next_seq,
        };
        self.next_seq += 1;
        self.heap.push(item);
        Ok(())
    }

    /// Remove and return the highest-priority request.
    pub fn dequeue(&mut self) -> Option<QueuedRequest> {
        self.heap.pop()
    }

    /// Priority of the next request to dequeue.
    pub fn peek_priority(&self) -> Option<u8> {
        self.heap.peek().map(|item| item.priority)
    }

    /// Queued requests naming the given target, in dequeue order.
    pub fn get_for_target(&self, target: &str) -> Vec<&QueuedRequest> {
        let mut matches: Vec<&QueuedRequest> = self
            .heap
            .iter()
            .filter(|item| item.request.target.as_deref() == Some(target))
            .collect();
        matches.sort_by(|a, b| b.cmp(a));
        matches
    }

    /// Remove every queued request naming the given target. Returns the
    /// number removed.
    pub fn remove_for_target(&mut self, target: &str) -> usize {
        let before = self.heap.len();
        let retained: BinaryHeap<QueuedRequest> = self
            .heap
            .drain()
            .filter(|item| item.request.target.as_deref() != Some(target))
            .collect();
        self.heap = retained;
        before - self.heap.len()
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn lowest_priority(&self) -> Option<u8> {
        self.heap.iter().map(|item| item.priority).min()
    }

    fn remove_lowest(&mut self) {
        // Among equal lowest priorities the newest arrival is dropped, so
        // FIFO order within the band is preserved for older work.
        let victim = self
            .heap
            .iter()
            .min_by(|a, b| a.priority.cmp(&b.priority).then(b.seq.cmp(&a.seq)))
            .map(|item| item.seq);
        if let Some(seq) = victim {
            let retained: BinaryHeap<QueuedRequest> =
                self.heap.drain().filter(|item| item.seq != seq).collect();
            self.heap = retained;
        }
    }
}
