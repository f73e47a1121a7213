//! Size-keyed pools of reusable buffers for kernel scratch space.
//!
//! Parallel ternary kernels borrow row-sized i32 partials per worker and the
//! linear layers borrow i8 activation scratch. Buffers return to their bucket
//! when the guard drops.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::OnceLock;

/// Buffers shorter than this are not worth keeping.
const MIN_POOL_LEN: usize = 64;

/// Maximum number of buffers kept per length.
const MAX_PER_LEN: usize = 32;

/// A pool of `Vec<T>` bucketed by length.
pub struct BufferPool<T> {
    buckets: Mutex<HashMap<usize, Vec<Vec<T>>>>,
}

impl<T: Copy + Default> Default for BufferPool<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Copy + Default> BufferPool<T> {
    pub fn new() -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Borrow a zeroed buffer of exactly `len` elements.
    pub fn acquire(&self, len: usize) -> PooledBuffer<'_, T> {
        let reused = self.buckets.lock().get_mut(&len).and_then(Vec::pop);
        let buf = match reused {
            Some(mut buf) => {
                buf.fill(T::default());
                buf
            }
            None => vec![T::default(); len],
        };
        PooledBuffer {
            pool: self,
            buf: Some(buf),
        }
    }

    fn release(&self, buf: Vec<T>) {
        let len = buf.len();
        if len < MIN_POOL_LEN {
            return;
        }
        let mut buckets = self.buckets.lock();
        let bucket = buckets.entry(len).or_default();
        if bucket.len() < MAX_PER_LEN {
            bucket.push(buf);
        }
    }

    /// Number of idle buffers across all lengths.
    pub fn idle(&self) -> usize {
        self.buckets.lock().values().map(Vec::len).sum()
    }
}

/// Guard that returns the buffer to its pool when dropped.
pub struct PooledBuffer<'a, T: Copy + Default> {
    pool: &'a BufferPool<T>,
    buf: Option<Vec<T>>,
}

impl<T: Copy + Default> PooledBuffer<'_, T> {
    /// Take the buffer out without returning it to the pool.
    pub fn take(mut self) -> Vec<T> {
        self.buf.take().unwrap_or_default()
    }
}

impl<T: Copy + Default> Deref for PooledBuffer<'_, T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        self.buf.as_deref().unwrap_or_default()
    }
}

impl<T: Copy + Default> DerefMut for PooledBuffer<'_, T> {
    fn deref_mut(&mut self) -> &mut [T] {
        self.buf.as_deref_mut().unwrap_or_default()
    }
}

impl<T: Copy + Default> Drop for PooledBuffer<'_, T> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}

/// Per-worker i32 partial sums.
pub fn i32_pool() -> &'static BufferPool<i32> {
    static POOL: OnceLock<BufferPool<i32>> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

/// Quantized activation scratch.
pub fn i8_pool() -> &'static BufferPool<i8> {
    static POOL: OnceLock<BufferPool<i8>> = OnceLock::new();
    POOL.get_or_init(BufferPool::new)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_release_roundtrip() {
        let pool = BufferPool::<i32>::new();
        {
            let mut b = pool.acquire(1024);
            assert_eq!(b.len(), 1024);
            b[3] = 7;
        }
        assert_eq!(pool.idle(), 1);
        let b2 = pool.acquire(1024);
        assert!(b2.iter().all(|&v| v == 0), "reused buffers come back zeroed");
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn small_buffers_are_dropped() {
        let pool = BufferPool::<i8>::new();
        drop(pool.acquire(8));
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn take_detaches_from_pool() {
        let pool = BufferPool::<i8>::new();
        let v = pool.acquire(256).take();
        assert_eq!(v.len(), 256);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn buckets_are_capped() {
        let pool = BufferPool::<i32>::new();
        let held: Vec<_> = (0..MAX_PER_LEN + 4).map(|_| pool.acquire(128)).collect();
        drop(held);
        assert_eq!(pool.idle(), MAX_PER_LEN);
    }
}
