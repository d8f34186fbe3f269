//! Reusable byte-buffer pools for block-sized allocations.
//!
//! Every read and write churns through block- and request-sized buffers;
//! pooling them keeps the hot path off the allocator. The pool is purely
//! a performance aid: a buffer that never comes back is just a normal
//! allocation, and correctness never depends on reuse.

use parking_lot::Mutex;

/// Buffers kept on the free list before further returns are dropped.
const MAX_FREE: usize = 64;

/// A pool of buffers of one canonical capacity.
///
/// Multi-producer, multi-consumer. Returned buffers must be unreferenced;
/// double-return or use-after-return is a caller bug.
pub struct BufferPool {
    size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// A pool handing out buffers with capacity `size`.
    pub fn new(size: usize) -> Self {
        assert!(size > 0, "zero-sized buffer pool");
        Self {
            size,
            free: Mutex::new(Vec::new()),
        }
    }

    /// The canonical buffer capacity of this pool.
    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// An empty buffer with at least the canonical capacity.
    pub fn get(&self) -> Vec<u8> {
        if let Some(buf) = self.free.lock().pop() {
            return buf;
        }
        Vec::with_capacity(self.size)
    }

    /// Return a buffer to the pool.
    ///
    /// The buffer must originate from a pool of the same size; a smaller
    /// buffer is a programmer error.
    pub fn put(&self, mut buf: Vec<u8>) {
        assert!(
            buf.capacity() >= self.size,
            "buffer of capacity {} returned to a {}-byte pool",
            buf.capacity(),
            self.size
        );
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < MAX_FREE {
            free.push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_returns_empty_buffer_with_capacity() {
        let pool = BufferPool::new(4096);
        let buf = pool.get();
        assert!(buf.is_empty());
        assert!(buf.capacity() >= 4096);
    }

    #[test]
    fn test_put_then_get_reuses_buffer() {
        let pool = BufferPool::new(128);
        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty(), "recycled buffer must come back cleared");
        assert_eq!(buf.as_ptr(), ptr);
    }

    #[test]
    #[should_panic(expected = "returned to a")]
    fn test_put_from_wrong_pool_panics() {
        let pool = BufferPool::new(4096);
        pool.put(Vec::with_capacity(16));
    }

    #[test]
    fn test_concurrent_get_put() {
        use std::sync::Arc;

        let pool = Arc::new(BufferPool::new(64));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let mut buf = pool.get();
                        buf.resize(64, 0xAB);
                        pool.put(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
    }
}
