use std::collections::VecDeque;

/// A FIFO queue with a fixed capacity. Storage is allocated once and never grows.
///
/// Pushing into a full queue or popping from an empty one is a bug in the caller and panics.
#[derive(Debug)]
pub struct FixedQueue<T> {
    items: VecDeque<T>,
    capacity: usize,
}

impl<T> FixedQueue<T> {
    pub fn new(capacity: usize) -> FixedQueue<T> {
        assert!(capacity > 0);
        FixedQueue {
            items: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() == self.capacity
    }

    pub fn push(&mut self, item: T) {
        assert!(!self.is_full(), "push into a full queue (capacity {})", self.capacity);
        self.items.push_back(item);
    }

    pub fn pop(&mut self) -> T {
        match self.items.pop_front() {
            Some(item) => item,
            None => panic!("pop from an empty queue"),
        }
    }

    pub fn front(&self) -> &T {
        self.items.front().expect("front of an empty queue")
    }

    pub fn front_mut(&mut self) -> &mut T {
        self.items.front_mut().expect("front of an empty queue")
    }

    pub fn back(&self) -> &T {
        self.items.back().expect("back of an empty queue")
    }

    pub fn iter(&self) -> impl Iterator<Item = &T> {
        self.items.iter()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fifo_order() {
        let mut q = FixedQueue::new(3);
        q.push(1);
        q.push(2);
        q.push(3);
        assert!(q.is_full());
        assert_eq!(q.pop(), 1);
        q.push(4);
        assert_eq!(*q.front(), 2);
        assert_eq!(*q.back(), 4);
        assert_eq!(q.iter().copied().collect::<Vec<_>>(), vec![2, 3, 4]);
    }

    #[test]
    #[should_panic(expected = "push into a full queue")]
    fn push_when_full_panics() {
        let mut q = FixedQueue::new(1);
        q.push(1);
        q.push(2);
    }

    #[test]
    #[should_panic(expected = "pop from an empty queue")]
    fn pop_when_empty_panics() {
        let mut q = FixedQueue::<u32>::new(1);
        q.pop();
    }
}
