use crate::core::{Result, StoreError};

pub const DEFAULT_CAPACITY: usize = 128;

/// Array-backed binary min-heap keyed by due time.
///
/// Ties between equal keys are broken arbitrarily. The logical capacity starts
/// at `DEFAULT_CAPACITY`, doubles when full, and halves (never below the
/// default) once occupancy drops under half of a grown capacity.
pub struct RetryPriorityQueue<K, V> {
    items: Vec<(K, V)>,
    capacity: usize,
}

impl<K: Ord, V> RetryPriorityQueue<K, V> {
    pub fn new() -> Self {
        Self {
            items: Vec::with_capacity(DEFAULT_CAPACITY),
            capacity: DEFAULT_CAPACITY,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Inserts an item. Returns true when it became the new minimum.
    pub fn enqueue(&mut self, key: K, value: V) -> bool {
        if self.items.len() == self.capacity {
            self.capacity *= 2;
            self.items.reserve_exact(self.capacity - self.items.len());
        }
        self.items.push((key, value));
        self.sift_up(self.items.len() - 1) == 0
    }

    pub fn peek_min(&self) -> Result<(&K, &V)> {
        self.items
            .first()
            .map(|(key, value)| (key, value))
            .ok_or(StoreError::EmptyQueue)
    }

    pub fn dequeue_min(&mut self) -> Result<(K, V)> {
        if self.items.is_empty() {
            return Err(StoreError::EmptyQueue);
        }
        let min = self.items.swap_remove(0);
        if !self.items.is_empty() {
            self.sift_down(0);
        }
        self.shrink_if_sparse();
        Ok(min)
    }

    /// Removes every item matching `predicate`, compacting in place.
    pub fn remove_all_matching<F>(&mut self, mut predicate: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut removed = Vec::new();
        let mut index = 0;
        while index < self.items.len() {
            let (key, value) = &self.items[index];
            if predicate(key, value) {
                removed.push(self.items.swap_remove(index));
            } else {
                index += 1;
            }
        }

        if !removed.is_empty() {
            self.heapify();
            self.shrink_if_sparse();
        }
        removed
    }

    /// Dequeues items while the current minimum satisfies `predicate`.
    pub fn take_while_min_satisfies<F>(&mut self, mut predicate: F) -> Vec<(K, V)>
    where
        F: FnMut(&K, &V) -> bool,
    {
        let mut taken = Vec::new();
        while let Some((key, value)) = self.items.first() {
            if !predicate(key, value) {
                break;
            }
            let min = self.items.swap_remove(0);
            if !self.items.is_empty() {
                self.sift_down(0);
            }
            taken.push(min);
        }
        self.shrink_if_sparse();
        taken
    }

    /// Empties the queue, returning every item in no particular order.
    pub fn drain_all(&mut self) -> Vec<(K, V)> {
        let drained = std::mem::take(&mut self.items);
        self.capacity = DEFAULT_CAPACITY;
        self.items = Vec::with_capacity(DEFAULT_CAPACITY);
        drained
    }

    fn sift_up(&mut self, mut index: usize) -> usize {
        while index > 0 {
            let parent = (index - 1) / 2;
            if self.items[index].0 >= self.items[parent].0 {
                break;
            }
            self.items.swap(index, parent);
            index = parent;
        }
        index
    }

    fn sift_down(&mut self, mut index: usize) {
        let len = self.items.len();
        loop {
            let left = 2 * index + 1;
            let right = left + 1;
            let mut smallest = index;

            if left < len && self.items[left].0 < self.items[smallest].0 {
                smallest = left;
            }
            if right < len && self.items[right].0 < self.items[smallest].0 {
                smallest = right;
            }
            if smallest == index {
                return;
            }
            self.items.swap(index, smallest);
            index = smallest;
        }
    }

    fn heapify(&mut self) {
        for index in (0..self.items.len() / 2).rev() {
            self.sift_down(index);
        }
    }

    fn shrink_if_sparse(&mut self) {
        if self.capacity > DEFAULT_CAPACITY && self.items.len() < self.capacity / 2 {
            self.capacity = (self.capacity / 2).max(DEFAULT_CAPACITY);
            self.items.shrink_to(self.capacity);
        }
    }

    #[cfg(test)]
    fn is_heap(&self) -> bool {
        (1..self.items.len()).all(|index| self.items[(index - 1) / 2].0 <= self.items[index].0)
    }
}

impl<K: Ord, V> Default for RetryPriorityQueue<K, V> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::rngs::StdRng;
    use rand::{Rng, SeedableRng};
    use std::time::Duration;

    #[test]
    fn test_take_due_items_by_time() {
        let mut queue = RetryPriorityQueue::new();
        queue.enqueue(Duration::from_millis(100), "a");
        queue.enqueue(Duration::from_millis(50), "b");
        queue.enqueue(Duration::from_millis(200), "c");

        let now = Duration::from_millis(60);
        let due = queue.take_while_min_satisfies(|due_at, _| *due_at <= now);

        assert_eq!(due, vec![(Duration::from_millis(50), "b")]);
        assert_eq!(
            queue.peek_min().unwrap(),
            (&Duration::from_millis(100), &"a")
        );
    }

    #[test]
    fn test_enqueue_reports_new_minimum() {
        let mut queue = RetryPriorityQueue::new();
        assert!(queue.enqueue(10, ()));
        assert!(!queue.enqueue(20, ()));
        assert!(queue.enqueue(5, ()));
        assert!(!queue.enqueue(5, ()));
        assert_eq!(queue.peek_min().unwrap().0, &5);
    }

    #[test]
    fn test_empty_queue_errors() {
        let mut queue: RetryPriorityQueue<u64, ()> = RetryPriorityQueue::new();
        assert!(matches!(queue.peek_min(), Err(StoreError::EmptyQueue)));
        assert!(matches!(queue.dequeue_min(), Err(StoreError::EmptyQueue)));
        assert!(queue.take_while_min_satisfies(|_, _| true).is_empty());
    }

    #[test]
    fn test_remove_all_matching_keeps_heap_order() {
        let mut queue = RetryPriorityQueue::new();
        for key in [9, 3, 7, 1, 8, 2, 6, 4, 5] {
            queue.enqueue(key, key % 2 == 0);
        }

        let mut removed: Vec<_> = queue
            .remove_all_matching(|_, even| *even)
            .into_iter()
            .map(|(key, _)| key)
            .collect();
        removed.sort();

        assert_eq!(removed, vec![2, 4, 6, 8]);
        let mut order = Vec::new();
        while let Ok((key, _)) = queue.dequeue_min() {
            order.push(key);
        }
        assert_eq!(order, vec![1, 3, 5, 7, 9]);
    }

    #[test]
    fn test_capacity_grows_and_shrinks() {
        let mut queue = RetryPriorityQueue::new();
        for key in 0..300u32 {
            queue.enqueue(key, ());
        }
        assert_eq!(queue.capacity(), 512);

        for _ in 0..250 {
            queue.dequeue_min().unwrap();
        }
        assert_eq!(queue.len(), 50);
        assert_eq!(queue.capacity(), DEFAULT_CAPACITY);

        queue.drain_all();
        assert!(queue.is_empty());
    }

    #[test]
    fn test_heap_invariant_under_random_operations() {
        let mut rng = StdRng::seed_from_u64(0x5eed);
        let mut queue = RetryPriorityQueue::new();
        let mut shadow: Vec<u32> = Vec::new();

        for _ in 0..5_000 {
            match rng.random_range(0..10) {
                0..=5 => {
                    let key = rng.random_range(0..1_000);
                    queue.enqueue(key, ());
                    shadow.push(key);
                }
                6 | 7 => {
                    if let Ok((key, _)) = queue.dequeue_min() {
                        let min = *shadow.iter().min().unwrap();
                        assert_eq!(key, min);
                        let pos = shadow.iter().position(|k| *k == key).unwrap();
                        shadow.swap_remove(pos);
                    }
                }
                8 => {
                    let modulus = rng.random_range(2..7);
                    queue.remove_all_matching(|key, _| key % modulus == 0);
                    shadow.retain(|key| key % modulus != 0);
                }
                _ => {
                    let cutoff = rng.random_range(0..1_000);
                    let taken = queue.take_while_min_satisfies(|key, _| *key <= cutoff);
                    for (key, _) in taken {
                        assert!(key <= cutoff);
                        let pos = shadow.iter().position(|k| *k == key).unwrap();
                        shadow.swap_remove(pos);
                    }
                    assert!(shadow.iter().all(|key| *key > cutoff));
                }
            }

            assert!(queue.is_heap());
            assert_eq!(queue.len(), shadow.len());
            if let Ok((key, _)) = queue.peek_min() {
                assert_eq!(*key, *shadow.iter().min().unwrap());
            }
        }
    }
}
