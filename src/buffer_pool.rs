//! Size-classed byte buffer pool (spec §4.1).
//!
//! Buffers are keyed by the power-of-two capacity class they were allocated
//! at. `get`/`put` round-trip through per-class stacks so steady-state I/O
//! never touches the allocator. Requests outside `[min, max]` bypass the
//! pool entirely, matching the contract that buffers outside that range are
//! never pooled.

use bytes::BytesMut;
use parking_lot::Mutex;
use std::collections::HashMap;

pub const DEFAULT_MIN_SIZE: usize = 1500;
pub const DEFAULT_MAX_SIZE: usize = DEFAULT_MIN_SIZE * 2;

/// An owned, reusable byte buffer. Exactly one owner at a time: the pool
/// hands it out on `get` and reclaims it on `put`.
pub struct Buffer {
    data: BytesMut,
    class: usize,
}

impl Buffer {
    fn new(class: usize, len: usize) -> Self {
        let mut data = BytesMut::with_capacity(class);
        data.resize(len, 0);
        Self { data, class }
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.class
    }

    pub fn resize(&mut self, new_len: usize, value: u8) {
        self.data.resize(new_len, value);
    }

    fn reclaim(mut self) -> BytesMut {
        self.data.clear();
        self.data
    }
}

fn next_power_of_two_clamped(size: usize, min: usize, max: usize) -> Option<usize> {
    if size > max {
        return None;
    }
    if size == 0 {
        return Some(min);
    }
    Some(size.next_power_of_two().clamp(min, max))
}

struct Inner {
    min: usize,
    max: usize,
    classes: HashMap<usize, Vec<BytesMut>>,
}

/// Pool of reusable buffers, size-classed by power-of-two capacity.
pub struct BufferPool {
    inner: Mutex<Inner>,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_bounds(DEFAULT_MIN_SIZE, DEFAULT_MAX_SIZE)
    }

    pub fn with_bounds(min: usize, max: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                min,
                max,
                classes: HashMap::new(),
            }),
        }
    }

    /// Get a buffer of at least `size` bytes, length set to `size`.
    pub fn get(&self, size: usize) -> Buffer {
        let mut inner = self.inner.lock();
        let (min, max) = (inner.min, inner.max);
        let Some(class) = next_power_of_two_clamped(size, min, max) else {
            // Larger than max: allocate directly, never pooled.
            return Buffer::new(size, size);
        };
        if let Some(mut data) = inner.classes.get_mut(&class).and_then(Vec::pop) {
            data.resize(size, 0);
            return Buffer { data, class };
        }
        Buffer::new(class, size)
    }

    /// Convenience for the tunnel data plane: a buffer sized for one frame
    /// (2-byte length prefix + MTU payload).
    pub fn get_mtu(&self, mtu: usize) -> Buffer {
        self.get(mtu + 2)
    }

    /// A buffer taken straight from the size class with no copy of existing
    /// contents — used where the caller immediately overwrites the buffer.
    pub fn get_zero_copy(&self) -> Buffer {
        let min = self.inner.lock().min;
        self.get(min)
    }

    /// Return a buffer to the pool. Buffers outside `[min, max]` are dropped.
    pub fn put(&self, buffer: Buffer) {
        let mut inner = self.inner.lock();
        if buffer.class < inner.min || buffer.class > inner.max {
            return;
        }
        let class = buffer.class;
        let data = buffer.reclaim();
        inner.classes.entry(class).or_default().push(data);
    }

    pub fn get_batch(&self, size: usize, n: usize) -> Vec<Buffer> {
        (0..n).map(|_| self.get(size)).collect()
    }

    pub fn put_batch(&self, buffers: Vec<Buffer>) {
        for b in buffers {
            self.put(b);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_requested_length_and_pow2_capacity() {
        let pool = BufferPool::new();
        let buf = pool.get(1000);
        assert_eq!(buf.len(), 1000);
        assert_eq!(buf.capacity(), DEFAULT_MIN_SIZE);
    }

    #[test]
    fn put_then_get_reuses_storage() {
        let pool = BufferPool::new();
        let buf = pool.get(1500);
        let ptr_before = buf.as_slice().as_ptr();
        pool.put(buf);
        let buf2 = pool.get(1500);
        assert_eq!(buf2.as_slice().as_ptr(), ptr_before);
    }

    #[test]
    fn oversized_request_bypasses_pool() {
        let pool = BufferPool::new();
        let huge = pool.get(DEFAULT_MAX_SIZE + 1);
        assert_eq!(huge.len(), DEFAULT_MAX_SIZE + 1);
        pool.put(huge);
        // nothing pooled for that class - a fresh get at the same size still
        // allocates directly rather than returning stale storage.
        let inner = pool.inner.lock();
        assert!(inner.classes.values().all(Vec::is_empty));
    }

    #[test]
    fn put_clears_length_but_keeps_capacity() {
        let pool = BufferPool::new();
        let mut buf = pool.get(1500);
        buf.as_mut_slice()[0] = 42;
        pool.put(buf);
        let buf2 = pool.get(1500);
        // length reset to the new request; no stale data leaks across owners
        // because get() immediately resizes (zero-fills) into the old storage.
        assert_eq!(buf2.len(), 1500);
    }

    #[test]
    fn buffers_outside_bounds_are_not_pooled() {
        let pool = BufferPool::with_bounds(512, 1024);
        let oversized = Buffer::new(2048, 2048);
        pool.put(oversized);
        let inner = pool.inner.lock();
        assert!(!inner.classes.contains_key(&2048));
    }

    #[test]
    fn batch_helpers_round_trip() {
        let pool = BufferPool::new();
        let batch = pool.get_batch(1500, 4);
        assert_eq!(batch.len(), 4);
        pool.put_batch(batch);
    }
}
