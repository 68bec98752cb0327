//! A growable FIFO queue implemented over a ring buffer.

const INITIAL_CAPACITY: usize = 16;

/// A FIFO message queue backed by a circular array.
///
/// Occupancy is tracked with an explicit length counter, so the full and
/// empty states are never conflated. Pushing past the current capacity
/// doubles the backing array and relocates the wrapped tail segment.
#[derive(Debug, Clone)]
pub struct RingQueue<T> {
    members: Vec<Option<T>>,
    first: usize,
    len: usize,
}

impl<T> RingQueue<T> {
    /// Create an empty queue.
    pub fn new() -> Self {
        let mut members = Vec::new();
        members.resize_with(INITIAL_CAPACITY, || None);
        Self {
            members,
            first: 0,
            len: 0,
        }
    }

    /// Number of elements stored.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if the queue holds no elements.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Current capacity of the backing array.
    pub fn capacity(&self) -> usize {
        self.members.len()
    }

    /// Append an item to the back of the queue.
    pub fn push_back(&mut self, item: T) {
        if self.len == self.members.len() {
            self.expand();
        }
        let idx = self.wrap(self.first + self.len);
        debug_assert!(self.members[idx].is_none());
        self.members[idx] = Some(item);
        self.len += 1;
    }

    /// Remove and return the first item, or `None` if the queue is empty.
    pub fn pop_front(&mut self) -> Option<T> {
        if self.len == 0 {
            return None;
        }
        let item = self.members[self.first].take();
        self.first = self.wrap(self.first + 1);
        self.len -= 1;
        item
    }

    /// Iterate front-to-back without consuming the queue.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).map(move |n| {
            let idx = self.wrap(self.first + n);
            self.members[idx].as_ref().expect("occupied ring queue slot")
        })
    }

    /// Drop all elements, keeping the current capacity.
    pub fn clear(&mut self) {
        for slot in &mut self.members {
            *slot = None;
        }
        self.first = 0;
        self.len = 0;
    }

    fn wrap(&self, idx: usize) -> usize {
        // Capacity only ever doubles, so idx < 2 * capacity here.
        if idx >= self.members.len() {
            idx - self.members.len()
        } else {
            idx
        }
    }

    fn expand(&mut self) {
        let old_capacity = self.members.len();
        let new_capacity = old_capacity.checked_mul(2).expect("ring queue capacity overflow");
        self.members.resize_with(new_capacity, || None);
        if self.first + self.len > old_capacity {
            // The queue wrapped around the end of the old array; move the
            // segment that lived at the end up to the end of the new array.
            for i in (self.first..old_capacity).rev() {
                let item = self.members[i].take();
                self.members[i + old_capacity] = item;
            }
            self.first += old_capacity;
        }
    }
}

impl<T> Default for RingQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use std::collections::VecDeque;

    #[test]
    fn push_pop_order() {
        let mut q = RingQueue::new();
        assert!(q.is_empty());
        for i in 0..5 {
            q.push_back(i);
        }
        assert_eq!(q.len(), 5);
        for i in 0..5 {
            assert_eq!(q.pop_front(), Some(i));
        }
        assert_eq!(q.pop_front(), None);
    }

    #[test]
    fn growth_preserves_wrapped_tail() {
        let mut q = RingQueue::new();
        // Wrap 'first' around before forcing growth.
        for i in 0..INITIAL_CAPACITY {
            q.push_back(i);
        }
        for _ in 0..10 {
            q.pop_front();
        }
        for i in 0..30 {
            q.push_back(100 + i);
        }
        assert!(q.capacity() > INITIAL_CAPACITY);
        let collected: Vec<_> = q.iter().copied().collect();
        let mut expected: Vec<usize> = (10..INITIAL_CAPACITY).collect();
        expected.extend((0..30).map(|i| 100 + i));
        assert_eq!(collected, expected);
    }

    #[test]
    fn clear_resets() {
        let mut q = RingQueue::new();
        q.push_back(1);
        q.push_back(2);
        q.clear();
        assert!(q.is_empty());
        assert_eq!(q.pop_front(), None);
        q.push_back(3);
        assert_eq!(q.pop_front(), Some(3));
    }

    proptest! {
        #[test]
        fn behaves_like_vecdeque(ops in prop::collection::vec(
            prop_oneof![Just(None), (0u32..1000).prop_map(Some)], 0..200)) {
            let mut q = RingQueue::new();
            let mut model = VecDeque::new();
            for op in ops {
                match op {
                    Some(v) => {
                        q.push_back(v);
                        model.push_back(v);
                    }
                    None => {
                        prop_assert_eq!(q.pop_front(), model.pop_front());
                    }
                }
                prop_assert_eq!(q.len(), model.len());
            }
            let got: Vec<_> = q.iter().copied().collect();
            let want: Vec<_> = model.iter().copied().collect();
            prop_assert_eq!(got, want);
        }
    }
}
