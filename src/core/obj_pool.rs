// src/core/obj_pool.rs - Lock-free object recycling
//
// Core features:
// - Multi-producer / multi-consumer free list on top of crossbeam's SegQueue
// - Non-blocking pop: callers fall back to a fresh allocation on `None`
// - Optional soft cap on the number of idle items

use crossbeam::queue::SegQueue;
use std::fmt;

/// Free list of recyclable objects.
///
/// Items pushed into the pool are handed back by a later `pop`, possibly on
/// another thread. The pool never blocks: `pop` on an empty pool returns
/// `None` immediately and `push` always succeeds unless the pool has reached
/// its cap, in which case the item is dropped and its memory goes back to the
/// allocator.
pub struct ObjPool<T> {
    queue: SegQueue<T>,
    max_len: Option<usize>,
}

impl<T> ObjPool<T> {
    /// Creates an unbounded pool.
    pub fn new() -> Self {
        Self {
            queue: SegQueue::new(),
            max_len: None,
        }
    }

    /// Creates a pool keeping at most `max_len` idle items.
    ///
    /// The cap is checked without synchronization with concurrent pushers, so
    /// the pool may briefly hold a few items more than `max_len`.
    pub fn with_max_len(max_len: usize) -> Self {
        Self {
            queue: SegQueue::new(),
            max_len: Some(max_len),
        }
    }

    /// Returns `item` to the pool.
    ///
    /// # Returns
    /// `true` if the item was kept, `false` if it was dropped because the
    /// pool is full.
    pub fn push(&self, item: T) -> bool {
        if let Some(max) = self.max_len {
            if self.queue.len() >= max {
                return false;
            }
        }
        self.queue.push(item);
        true
    }

    pub fn pop(&self) -> Option<T> {
        self.queue.pop()
    }

    /// Pops a recycled item or builds a fresh one with `f`.
    pub fn pop_or_else<F: FnOnce() -> T>(&self, f: F) -> T {
        self.queue.pop().unwrap_or_else(f)
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn max_len(&self) -> Option<usize> {
        self.max_len
    }

    /// Drops every idle item.
    pub fn clear(&self) {
        while self.queue.pop().is_some() {}
    }
}

impl<T> Default for ObjPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for ObjPool<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ObjPool")
            .field("len", &self.queue.len())
            .field("max_len", &self.max_len)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;

    #[test]
    fn test_pop_empty_returns_none() {
        let pool: ObjPool<Vec<u8>> = ObjPool::new();
        assert!(pool.pop().is_none());
        assert!(pool.is_empty());
    }

    #[test]
    fn test_pop_or_else_reuses_items() {
        let pool = ObjPool::new();
        pool.push(vec![0u8; 64]);
        let v = pool.pop_or_else(Vec::new);
        assert_eq!(v.len(), 64);
        let v = pool.pop_or_else(|| vec![1u8]);
        assert_eq!(v, vec![1u8]);
    }

    #[test]
    fn test_max_len_drops_excess() {
        let pool = ObjPool::with_max_len(2);
        assert!(pool.push(1));
        assert!(pool.push(2));
        assert!(!pool.push(3));
        assert_eq!(pool.len(), 2);
        pool.clear();
        assert!(pool.is_empty());
    }

    /// Every item pushed by concurrent producers is popped exactly once and
    /// nothing is lost or duplicated.
    #[test]
    fn test_concurrent_push_pop_conservation() {
        const THREADS: usize = 4;
        const PER_THREAD: usize = 10_000;

        let pool = Arc::new(ObjPool::new());
        let mut handles = Vec::new();
        for t in 0..THREADS {
            let pool = pool.clone();
            handles.push(std::thread::spawn(move || {
                let mut taken = Vec::new();
                for i in 0..PER_THREAD {
                    pool.push(t * PER_THREAD + i);
                    if i % 2 == 0 {
                        if let Some(v) = pool.pop() {
                            taken.push(v);
                        }
                    }
                }
                taken
            }));
        }

        let mut seen = HashSet::new();
        for h in handles {
            for v in h.join().unwrap() {
                assert!(seen.insert(v), "item {v} popped twice");
            }
        }
        while let Some(v) = pool.pop() {
            assert!(seen.insert(v), "item {v} popped twice");
        }
        assert_eq!(seen.len(), THREADS * PER_THREAD);
    }
}
