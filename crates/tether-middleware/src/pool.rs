//! Fixed-capacity ring buffer used as the message queue between transport
//! I/O and application code.
//!
//! Pushing into a full pool overwrites the oldest element, so producers are
//! never blocked by a slow consumer.
//!
//! ```rust
//! use tether_middleware::pool::Pool;
//!
//! let mut pool = Pool::with_capacity(2);
//! pool.push(1);
//! pool.push(2);
//! pool.push(3); // evicts 1
//! assert_eq!(pool.pop(), Some(2));
//! assert_eq!(pool.pop(), Some(3));
//! assert!(pool.is_empty());
//! ```

#[derive(Debug, Clone)]
pub struct Pool<T> {
    slots: Vec<Option<T>>,
    pop_index: usize,
    push_index: usize,
    len: usize,
}

impl<T> Default for Pool<T> {
    fn default() -> Self {
        Self::with_capacity(0)
    }
}

impl<T> Pool<T> {
    pub fn with_capacity(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity, || None);
        Self {
            slots,
            pop_index: 0,
            push_index: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Append `value`, evicting and returning the oldest element when full.
    ///
    /// A zero-capacity pool drops every value.
    pub fn push(&mut self, value: T) -> Option<T> {
        let capacity = self.capacity();
        if capacity == 0 {
            return Some(value);
        }
        let evicted = if self.is_full() {
            let old = self.slots[self.pop_index].take();
            self.pop_index = self.next(self.pop_index);
            self.len -= 1;
            old
        } else {
            None
        };
        self.slots[self.push_index] = Some(value);
        self.push_index = self.next(self.push_index);
        self.len += 1;
        evicted
    }

    pub fn pop(&mut self) -> Option<T> {
        if self.is_empty() {
            return None;
        }
        let value = self.slots[self.pop_index].take();
        self.pop_index = self.next(self.pop_index);
        self.len -= 1;
        value
    }

    /// Oldest element.
    pub fn front(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.pop_index].as_ref()
    }

    pub fn front_mut(&mut self) -> Option<&mut T> {
        if self.is_empty() {
            return None;
        }
        self.slots[self.pop_index].as_mut()
    }

    /// Newest element.
    pub fn back(&self) -> Option<&T> {
        if self.is_empty() {
            return None;
        }
        let index = (self.push_index + self.capacity() - 1) % self.capacity();
        self.slots[index].as_ref()
    }

    pub fn clear(&mut self) {
        for slot in &mut self.slots {
            *slot = None;
        }
        self.pop_index = 0;
        self.push_index = 0;
        self.len = 0;
    }

    /// Grow to at least `capacity`, keeping every live element in order.
    pub fn reserve(&mut self, capacity: usize) {
        if capacity <= self.capacity() {
            return;
        }
        self.relayout(capacity);
    }

    /// Resize to exactly `capacity`. Shrinking keeps the newest elements.
    pub fn set_capacity(&mut self, capacity: usize) {
        if capacity == self.capacity() {
            return;
        }
        while self.len > capacity {
            self.pop();
        }
        self.relayout(capacity);
    }

    /// Iterate from oldest to newest.
    pub fn iter(&self) -> impl Iterator<Item = &T> {
        let capacity = self.capacity();
        (0..self.len).filter_map(move |i| self.slots[(self.pop_index + i) % capacity].as_ref())
    }

    fn relayout(&mut self, capacity: usize) {
        let mut slots: Vec<Option<T>> = Vec::with_capacity(capacity);
        let len = self.len;
        while let Some(value) = self.pop() {
            slots.push(Some(value));
        }
        slots.resize_with(capacity, || None);
        self.slots = slots;
        self.pop_index = 0;
        self.len = len;
        self.push_index = if capacity == 0 { 0 } else { len % capacity };
    }

    fn next(&self, index: usize) -> usize {
        if index + 1 == self.capacity() { 0 } else { index + 1 }
    }
}
