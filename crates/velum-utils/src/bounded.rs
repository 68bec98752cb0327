//! A fixed-capacity ring buffer that evicts its oldest element when full.

/// A bounded circular buffer of the most recent `capacity` items.
///
/// Used for period summaries in the bandwidth history, where only the last
/// N periods are retained and older ones silently age out.
#[derive(Debug, Clone)]
pub struct RingBuf<T> {
    slots: Vec<Option<T>>,
    first: usize,
    len: usize,
}

impl<T> RingBuf<T> {
    /// Create a buffer retaining at most `capacity` items.
    pub fn new(capacity: usize) -> Self {
        assert!(capacity > 0, "ring buffer capacity must be nonzero");
        let mut slots = Vec::new();
        slots.resize_with(capacity, || None);
        Self {
            slots,
            first: 0,
            len: 0,
        }
    }

    /// Number of retained items.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True if nothing has been pushed yet.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Maximum number of retained items.
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Append an item, evicting and returning the oldest one if the buffer
    /// is full.
    pub fn push(&mut self, item: T) -> Option<T> {
        if self.len < self.slots.len() {
            let idx = self.wrap(self.first + self.len);
            self.slots[idx] = Some(item);
            self.len += 1;
            None
        } else {
            let evicted = self.slots[self.first].replace(item);
            self.first = self.wrap(self.first + 1);
            evicted
        }
    }

    /// Iterate oldest-to-newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        (0..self.len).map(move |n| {
            let idx = self.wrap(self.first + n);
            self.slots[idx].as_ref().expect("occupied ring buffer slot")
        })
    }

    /// Remove all items.
    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.first = 0;
        self.len = 0;
    }

    fn wrap(&self, idx: usize) -> usize {
        if idx >= self.slots.len() {
            idx - self.slots.len()
        } else {
            idx
        }
    }
}
