//! Ring-buffer double-ended queue backing the ready-work queue
//!
//! `Quack` supports O(1) amortized push-front, enqueue and dequeue, plus
//! O(n) indexed access and arbitrary removal so scheduled work can be
//! retargeted or dropped. Indices are always relative to the logical head.

use std::ops::Index;

const DEFAULT_CAPACITY: usize = 4;

/// Array-backed deque
#[derive(Debug, Clone)]
pub struct Quack<T> {
    items: Vec<Option<T>>,
    head: usize,
    count: usize,
}

impl<T> Default for Quack<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Quack<T> {
    /// Create an empty deque
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_CAPACITY)
    }

    /// Create an empty deque with room for `capacity` items before growing
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        let mut items = Vec::with_capacity(capacity);
        items.resize_with(capacity, || None);
        Self {
            items,
            head: 0,
            count: 0,
        }
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.count
    }

    /// Whether the deque is empty
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Current ring capacity
    pub fn capacity(&self) -> usize {
        self.items.len()
    }

    fn physical(&self, index: usize) -> usize {
        (self.head + index) % self.items.len()
    }

    /// Insert at the front
    pub fn push_front(&mut self, item: T) {
        if self.count == self.items.len() {
            self.grow();
        }
        let capacity = self.items.len();
        self.head = (self.head + capacity - 1) % capacity;
        self.items[self.head] = Some(item);
        self.count += 1;
    }

    /// Insert at the back
    pub fn enqueue(&mut self, item: T) {
        if self.count == self.items.len() {
            self.grow();
        }
        let tail = self.physical(self.count);
        self.items[tail] = Some(item);
        self.count += 1;
    }

    /// Remove from the front. Returns `None` on an empty deque.
    pub fn dequeue(&mut self) -> Option<T> {
        if self.count == 0 {
            return None;
        }
        let item = self.items[self.head].take();
        debug_assert!(item.is_some(), "occupied slot was empty");
        self.head = (self.head + 1) % self.items.len();
        self.count -= 1;
        item
    }

    /// Front item without removing it
    pub fn peek_front(&self) -> Option<&T> {
        self.get(0)
    }

    /// Item at a logical index
    pub fn get(&self, index: usize) -> Option<&T> {
        if index >= self.count {
            return None;
        }
        self.items[self.physical(index)].as_ref()
    }

    /// Remove the item at a logical index.
    ///
    /// Items before `index` shift one slot toward the tail and the head
    /// advances, so removal near the front touches the fewest slots.
    pub fn remove_at(&mut self, index: usize) -> Option<T> {
        if index >= self.count {
            return None;
        }
        let capacity = self.items.len();
        let target = self.physical(index);
        let removed = self.items[target].take();

        let mut i = index;
        while i > 0 {
            let from = self.physical(i - 1);
            let to = self.physical(i);
            self.items[to] = self.items[from].take();
            i -= 1;
        }

        self.head = (self.head + 1) % capacity;
        self.count -= 1;
        removed
    }

    /// Remove the first item matching `predicate`
    pub fn remove_first<F>(&mut self, mut predicate: F) -> Option<T>
    where
        F: FnMut(&T) -> bool,
    {
        let index = (0..self.count).find(|&i| self.get(i).is_some_and(&mut predicate))?;
        self.remove_at(index)
    }

    /// Iterate from head to tail
    pub fn iter(&self) -> impl Iterator<Item = &T> + '_ {
        (0..self.count).filter_map(move |i| self.get(i))
    }

    /// Drop all items, keeping capacity
    pub fn clear(&mut self) {
        for slot in self.items.iter_mut() {
            *slot = None;
        }
        self.head = 0;
        self.count = 0;
    }

    fn grow(&mut self) {
        let old_capacity = self.items.len();
        let mut items: Vec<Option<T>> = Vec::with_capacity(old_capacity * 2);

        // Copy as one contiguous block when the ring does not wrap, otherwise
        // as the head..end segment followed by the 0..tail segment.
        let first_len = (old_capacity - self.head).min(self.count);
        items.extend(self.items[self.head..self.head + first_len].iter_mut().map(Option::take));
        let second_len = self.count - first_len;
        items.extend(self.items[..second_len].iter_mut().map(Option::take));

        items.resize_with(old_capacity * 2, || None);
        self.items = items;
        self.head = 0;
    }
}

impl<T: PartialEq> Quack<T> {
    /// Remove the first occurrence of `item`. Returns whether one was found.
    pub fn remove(&mut self, item: &T) -> bool {
        self.remove_first(|candidate| candidate == item).is_some()
    }

    /// Whether the deque contains `item`
    pub fn contains(&self, item: &T) -> bool {
        self.iter().any(|candidate| candidate == item)
    }
}

impl<T: Clone> Quack<T> {
    /// Copy items from head to tail
    pub fn to_vec(&self) -> Vec<T> {
        self.iter().cloned().collect()
    }
}

impl<T> Index<usize> for Quack<T> {
    type Output = T;

    fn index(&self, index: usize) -> &Self::Output {
        match self.get(index) {
            Some(item) => item,
            None => panic!("Quack index {} out of range (len {})", index, self.count),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[derive(Debug, Clone)]
    enum Op {
        Enqueue(u8),
        PushFront(u8),
        Dequeue,
    }

    fn op_strategy() -> impl Strategy<Value = Op> {
        prop_oneof![
            any::<u8>().prop_map(Op::Enqueue),
            any::<u8>().prop_map(Op::PushFront),
            Just(Op::Dequeue),
        ]
    }

    proptest! {
        #[test]
        fn prop_matches_reference_deque(ops in proptest::collection::vec(op_strategy(), 0..200)) {
            let mut quack = Quack::with_capacity(1);
            let mut model = VecDeque::new();

            for op in ops {
                match op {
                    Op::Enqueue(v) => { quack.enqueue(v); model.push_back(v); }
                    Op::PushFront(v) => { quack.push_front(v); model.push_front(v); }
                    Op::Dequeue => { prop_assert_eq!(quack.dequeue(), model.pop_front()); }
                }
                prop_assert_eq!(quack.len(), model.len());
            }

            prop_assert_eq!(quack.to_vec(), model.into_iter().collect::<Vec<_>>());
        }

        #[test]
        fn prop_remove_drops_first_match(
            items in proptest::collection::vec(0u8..8, 1..60),
            front in proptest::collection::vec(0u8..8, 0..10),
            target in 0u8..8,
        ) {
            let mut quack = Quack::with_capacity(2);
            let mut model: Vec<u8> = Vec::new();
            for v in &items { quack.enqueue(*v); model.push(*v); }
            for v in &front { quack.push_front(*v); model.insert(0, *v); }

            let found = quack.remove(&target);
            let position = model.iter().position(|v| *v == target);
            prop_assert_eq!(found, position.is_some());
            if let Some(index) = position {
                model.remove(index);
            }
            prop_assert_eq!(quack.to_vec(), model);
        }
    }

    #[test]
    fn test_dequeue_empty_returns_none() {
        let mut quack: Quack<u32> = Quack::new();
        assert!(quack.dequeue().is_none());
        assert!(quack.peek_front().is_none());
    }

    #[test]
    fn test_growth_preserves_wrapped_order() {
        let mut quack = Quack::with_capacity(4);
        quack.enqueue(1);
        quack.enqueue(2);
        quack.enqueue(3);
        assert_eq!(quack.dequeue(), Some(1));
        assert_eq!(quack.dequeue(), Some(2));
        // head is now at slot 2, so the next pushes wrap
        quack.enqueue(4);
        quack.enqueue(5);
        quack.enqueue(6);
        quack.enqueue(7);
        quack.push_front(0);
        assert_eq!(quack.to_vec(), vec![0, 3, 4, 5, 6, 7]);
        assert!(quack.capacity() >= 6);
    }

    #[test]
    fn test_remove_at_shifts_earlier_items() {
        let mut quack = Quack::new();
        for v in 0..6 {
            quack.enqueue(v);
        }
        assert_eq!(quack.remove_at(3), Some(3));
        assert_eq!(quack.to_vec(), vec![0, 1, 2, 4, 5]);
        assert_eq!(quack[0], 0);
        assert_eq!(quack[3], 4);
        assert_eq!(quack.remove_at(0), Some(0));
        assert_eq!(quack.peek_front(), Some(&1));
        assert_eq!(quack.remove_at(10), None);
    }

    #[test]
    #[should_panic]
    fn test_index_out_of_range_panics() {
        let quack: Quack<u8> = Quack::new();
        let _ = quack[0];
    }
}
