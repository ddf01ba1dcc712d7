use parking_lot::RwLock;

/// Ordering of a [`PriorityQueue`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PqType {
    /// Highest priority first
    Max,
    /// Lowest priority first
    Min,
}

#[derive(Debug, Clone)]
struct Item<T> {
    value: T,
    priority: i64,
}

/// Synchronized binary heap keyed by an `i64` priority.
///
/// Heap positions are 1-based (parent `k / 2`, children `2k` and `2k + 1`);
/// position `k` is stored at `items[k - 1]`. `push`/`pop` take the write
/// lock, `head`/`size` the read lock.
#[derive(Debug)]
pub struct PriorityQueue<T> {
    items: RwLock<Vec<Item<T>>>,
    comparator: fn(i64, i64) -> bool,
    kind: PqType,
}

// `comparator(parent, child)` is true when the pair is out of order.
fn max_first(i: i64, j: i64) -> bool {
    i < j
}

fn min_first(i: i64, j: i64) -> bool {
    i > j
}

impl<T> PriorityQueue<T> {
    pub fn new(kind: PqType) -> Self {
        let comparator = match kind {
            PqType::Max => max_first,
            PqType::Min => min_first,
        };
        Self {
            items: RwLock::new(Vec::new()),
            comparator,
            kind,
        }
    }

    pub fn kind(&self) -> PqType {
        self.kind
    }

    pub fn push(&self, value: T, priority: i64) {
        let mut items = self.items.write();
        items.push(Item { value, priority });
        let size = items.len();
        self.swim(&mut items, size);
    }

    /// Remove and return the root, or `None` when empty.
    pub fn pop(&self) -> Option<(T, i64)> {
        let mut items = self.items.write();
        let size = items.len();
        if size == 0 {
            return None;
        }

        items.swap(0, size - 1);
        let root = items.pop()?;
        self.sink(&mut items, 1);
        Some((root.value, root.priority))
    }

    pub fn size(&self) -> usize {
        self.items.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.size() == 0
    }

    /// Priority of the root without removing it.
    pub fn head_priority(&self) -> Option<i64> {
        self.items.read().first().map(|item| item.priority)
    }

    fn less(&self, items: &[Item<T>], i: usize, j: usize) -> bool {
        (self.comparator)(items[i - 1].priority, items[j - 1].priority)
    }

    fn swim(&self, items: &mut [Item<T>], mut k: usize) {
        while k > 1 && self.less(items, k / 2, k) {
            items.swap(k / 2 - 1, k - 1);
            k /= 2;
        }
    }

    fn sink(&self, items: &mut [Item<T>], mut k: usize) {
        let size = items.len();
        while 2 * k <= size {
            let mut j = 2 * k;
            if j < size && self.less(items, j, j + 1) {
                j += 1;
            }
            if !self.less(items, k, j) {
                break;
            }
            items.swap(k - 1, j - 1);
            k = j;
        }
    }
}

impl<T: Clone> PriorityQueue<T> {
    /// Read the root without removing it.
    pub fn head(&self) -> Option<(T, i64)> {
        self.items
            .read()
            .first()
            .map(|item| (item.value.clone(), item.priority))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_new_queue_is_empty() {
        let pq: PriorityQueue<String> = PriorityQueue::new(PqType::Min);
        assert_eq!(pq.size(), 0);
        assert!(pq.is_empty());
        assert!(pq.head().is_none());
        assert!(pq.pop().is_none());
        assert_eq!(pq.kind(), PqType::Min);
    }

    #[test]
    fn test_max_order() {
        let pq = PriorityQueue::new(PqType::Max);
        for i in 0..100i64 {
            pq.push(i.to_string(), i);
        }
        for i in (0..100i64).rev() {
            assert_eq!(pq.pop(), Some((i.to_string(), i)));
        }
        assert!(pq.pop().is_none());
    }

    #[test]
    fn test_min_order() {
        let pq = PriorityQueue::new(PqType::Min);
        for i in (0..100i64).rev() {
            pq.push(i.to_string(), i);
        }
        for i in 0..100i64 {
            assert_eq!(pq.pop(), Some((i.to_string(), i)));
        }
    }

    #[test]
    fn test_min_order_with_scrambled_input() {
        let pq = PriorityQueue::new(PqType::Min);
        let priorities = [42i64, -7, 13, 0, 99, 13, -100, 5, 77, 1];
        for p in priorities {
            pq.push(p, p);
        }

        let mut popped = Vec::new();
        while let Some((_, p)) = pq.pop() {
            popped.push(p);
        }

        let mut expected = priorities.to_vec();
        expected.sort();
        assert_eq!(popped, expected);
    }

    #[test]
    fn test_concurrent_push_keeps_order() {
        let pq = Arc::new(PriorityQueue::new(PqType::Min));
        let handles: Vec<_> = (0..100i64)
            .map(|i| {
                let pq = pq.clone();
                std::thread::spawn(move || pq.push(i.to_string(), i))
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(pq.size(), 100);
        for i in 0..100i64 {
            assert_eq!(pq.pop(), Some((i.to_string(), i)));
        }
    }

    #[test]
    fn test_head_does_not_remove() {
        let max = PriorityQueue::new(PqType::Max);
        max.push("1", 1);
        max.push("2", 2);
        assert_eq!(max.head(), Some(("2", 2)));
        assert_eq!(max.size(), 2);

        let min = PriorityQueue::new(PqType::Min);
        min.push("1", 1);
        min.push("2", 2);
        assert_eq!(min.head(), Some(("1", 1)));
        assert_eq!(min.head_priority(), Some(1));
        assert_eq!(min.size(), 2);
    }
}
