//! Bounded push queue.
//!
//! Items are held sorted by descending priority, then descending
//! confidence; equal keys keep insertion order. On overflow the queue
//! replaces its last (least urgent) item only when the incoming item has
//! strictly higher priority, otherwise the incoming item is dropped.

use crate::codestream::DataBin;

/// One queued push.
#[derive(Debug, Clone)]
pub struct PushItem {
    pub session_id: String,
    pub bin: DataBin,
    pub priority: u8,
    pub confidence: f64,
}

/// Priority queue of pending pushes, kept as a sorted vector since the
/// bound is small.
#[derive(Debug)]
pub struct PushScheduler {
    items: Vec<PushItem>,
    capacity: usize,
    dropped: u64,
}

impl PushScheduler {
    pub fn new(capacity: usize) -> Self {
        Self {
            items: Vec::with_capacity(capacity.max(1)),
            capacity: capacity.max(1),
            dropped: 0,
        }
    }

    /// Insert an item at its sorted position. Returns false when it was
    /// dropped instead.
    pub fn enqueue(&mut self, item: PushItem) -> bool {
        if self.items.len() >= self.capacity {
            let Some(last) = self.items.last() else {
                return false;
            };
            if item.priority > last.priority {
                self.items.pop();
            } else {
                self.dropped += 1;
                return false;
            }
            self.dropped += 1;
        }

        // First position where the existing item sorts strictly after the
        // incoming one; equal keys land behind their elders.
        let position = self
            .items
            .iter()
            .position(|existing| {
                existing.priority < item.priority
                    || (existing.priority == item.priority && existing.confidence < item.confidence)
            })
            .unwrap_or(self.items.len());
        self.items.insert(position, item);
        true
    }

    /// Remove and return the most urgent item.
    pub fn dequeue(&mut self) -> Option<PushItem> {
        if self.items.is_empty() {
            None
        } else {
            Some(self.items.remove(0))
        }
    }

    /// Peek without removing.
    pub fn peek(&self) -> Option<&PushItem> {
        self.items.first()
    }

    /// Drop every queued item for a session. Returns the number removed.
    pub fn remove_session(&mut self, session_id: &str) -> usize {
        let before = self.items.len();
        self.items.retain(|item| item.session_id != session_id);
        before - self.items.len()
    }

    /// Drop queued items whose bin key matches any of `keys`.
    pub fn remove_bins(&mut self, keys: &[String]) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !keys.contains(&item.bin.key()));
        before - self.items.len()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    /// Queued items in order, for inspection.
    pub fn iter(&self) -> impl Iterator<Item = &PushItem> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codestream::BinClass;

    fn item(session: &str, id: u32, priority: u8, confidence: f64) -> PushItem {
        PushItem {
            session_id: session.to_string(),
            bin: DataBin::new(BinClass::Precinct, id, vec![0u8; 8]),
            priority,
            confidence,
        }
    }

    #[test]
    fn test_ordering_priority_then_confidence() {
        let mut queue = PushScheduler::new(10);
        queue.enqueue(item("s", 1, 1, 0.9));
        queue.enqueue(item("s", 2, 3, 0.2));
        queue.enqueue(item("s", 3, 3, 0.8));
        queue.enqueue(item("s", 4, 2, 0.5));

        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue())
            .map(|i| i.bin.id)
            .collect();
        assert_eq!(order, vec![3, 2, 4, 1]);
    }

    #[test]
    fn test_equal_keys_keep_insertion_order() {
        let mut queue = PushScheduler::new(10);
        queue.enqueue(item("s", 1, 2, 0.5));
        queue.enqueue(item("s", 2, 2, 0.5));
        queue.enqueue(item("s", 3, 2, 0.5));

        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue())
            .map(|i| i.bin.id)
            .collect();
        assert_eq!(order, vec![1, 2, 3]);
    }

    #[test]
    fn test_confidence_invariant_within_priority() {
        let mut queue = PushScheduler::new(10);
        queue.enqueue(item("s", 1, 2, 0.1));
        queue.enqueue(item("s", 2, 2, 0.9));
        queue.enqueue(item("s", 3, 2, 0.5));

        let confidences: Vec<f64> = queue.iter().map(|i| i.confidence).collect();
        assert!(confidences.windows(2).all(|w| w[0] >= w[1]));
    }

    #[test]
    fn test_overflow_replaces_only_on_strictly_higher_priority() {
        let mut queue = PushScheduler::new(2);
        queue.enqueue(item("s", 1, 2, 0.5));
        queue.enqueue(item("s", 2, 2, 0.4));

        // Same priority: incoming dropped.
        assert!(!queue.enqueue(item("s", 3, 2, 0.9)));
        assert_eq!(queue.len(), 2);
        assert_eq!(queue.dropped(), 1);

        // Strictly higher: last item replaced.
        assert!(queue.enqueue(item("s", 4, 3, 0.1)));
        assert_eq!(queue.len(), 2);
        let order: Vec<u32> = std::iter::from_fn(|| queue.dequeue())
            .map(|i| i.bin.id)
            .collect();
        assert_eq!(order, vec![4, 1]);
    }

    #[test]
    fn test_remove_session() {
        let mut queue = PushScheduler::new(10);
        queue.enqueue(item("a", 1, 1, 0.5));
        queue.enqueue(item("b", 2, 2, 0.5));
        queue.enqueue(item("a", 3, 3, 0.5));

        assert_eq!(queue.remove_session("a"), 2);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.peek().unwrap().session_id, "b");
    }

    #[test]
    fn test_remove_bins() {
        let mut queue = PushScheduler::new(10);
        queue.enqueue(item("a", 1, 1, 0.5));
        queue.enqueue(item("a", 2, 2, 0.5));

        let removed = queue.remove_bins(&["precinct:1".to_string()]);
        assert_eq!(removed, 1);
        assert_eq!(queue.peek().unwrap().bin.id, 2);
    }
}
