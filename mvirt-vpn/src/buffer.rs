//! Reusable frame buffers for the TUN read path
//!
//! Buffers are allocated lazily up to a fixed maximum and recycled through a
//! lock-free free list, so the steady-state read loop never touches the heap.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use crossbeam_queue::ArrayQueue;
use thiserror::Error;

/// Default buffer size. Large enough for any frame a TUN device with the
/// default MTU hands out.
pub const DEFAULT_BUFFER_SIZE: usize = 16384;

/// Default upper bound on buffers a single pool will ever create.
pub const DEFAULT_MAX_BUFFERS: usize = 1024;

/// Buffer pool errors.
#[derive(Debug, Error)]
pub enum PoolError {
    #[error("Buffer pool exhausted: all {max_buffers} buffers are in flight")]
    Exhausted { max_buffers: usize },
}

/// Pool of fixed-capacity byte buffers
///
/// `acquire` hands out a free buffer if one exists and otherwise allocates a
/// new one, as long as fewer than `max_buffers` have been created. Buffers
/// go back to the pool when released or dropped, from any thread.
pub struct BufferPool {
    buffer_size: usize,
    max_buffers: usize,
    /// Free list of previously released buffers
    free: ArrayQueue<Box<[u8]>>,
    /// Buffers created and still accounted to this pool
    created: AtomicUsize,
    /// Live `PoolBuffer`s handed out by `acquire`
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create an empty pool. No memory is allocated until the first `acquire`.
    pub fn new(buffer_size: usize, max_buffers: usize) -> Self {
        let max_buffers = max_buffers.max(1);

        tracing::debug!(buffer_size, max_buffers, "Buffer pool created");

        Self {
            buffer_size,
            max_buffers,
            free: ArrayQueue::new(max_buffers),
            created: AtomicUsize::new(0),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Take a buffer from the pool, allocating one if the free list is empty.
    ///
    /// Contents of a recycled buffer are stale; callers must overwrite the
    /// region they later read. The valid length always starts at zero.
    #[inline]
    pub fn acquire(self: &Arc<Self>) -> Result<PoolBuffer, PoolError> {
        let data = match self.free.pop() {
            Some(data) => data,
            None => self.allocate()?,
        };
        self.outstanding.fetch_add(1, Ordering::AcqRel);

        Ok(PoolBuffer {
            pool: Arc::clone(self),
            data: Some(data),
            len: 0,
        })
    }

    /// Return a buffer to the pool. Equivalent to dropping it.
    #[inline]
    pub fn release(&self, buffer: PoolBuffer) {
        debug_assert!(
            std::ptr::eq(self, Arc::as_ptr(&buffer.pool)),
            "Buffer released to a pool it was not acquired from"
        );
        drop(buffer);
    }

    /// Size of every buffer handed out by this pool
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Maximum number of buffers this pool will create
    pub fn max_buffers(&self) -> usize {
        self.max_buffers
    }

    /// Number of buffers sitting in the free list
    #[inline]
    pub fn available(&self) -> usize {
        self.free.len()
    }

    /// Number of buffers created by this pool (free plus in flight)
    #[inline]
    pub fn created(&self) -> usize {
        self.created.load(Ordering::Acquire)
    }

    /// Number of buffers currently held outside the pool
    #[inline]
    pub fn in_flight(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }

    fn allocate(&self) -> Result<Box<[u8]>, PoolError> {
        // Reserve the slot before allocating so concurrent callers cannot
        // overshoot max_buffers.
        self.created
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                (n < self.max_buffers).then_some(n + 1)
            })
            .map_err(|_| PoolError::Exhausted {
                max_buffers: self.max_buffers,
            })?;

        Ok(vec![0u8; self.buffer_size].into_boxed_slice())
    }

    #[inline]
    fn return_buffer(&self, data: Box<[u8]>) {
        // The free list holds max_buffers entries, so this only fails if a
        // foreign buffer was pushed. Forget it from the accounting instead.
        if self.free.push(data).is_err() {
            self.created.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE, DEFAULT_MAX_BUFFERS)
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.buffer_size)
            .field("max_buffers", &self.max_buffers)
            .field("available", &self.available())
            .field("created", &self.created())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

/// A buffer owned from the pool
///
/// Exactly one owner at a time; moving it hands the buffer to the next
/// pipeline stage. Returns to its pool when dropped.
pub struct PoolBuffer {
    pool: Arc<BufferPool>,
    /// Always `Some` until drop
    data: Option<Box<[u8]>>,
    /// Length of valid data, starting at offset 0
    len: usize,
}

impl PoolBuffer {
    /// Valid data
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.storage()[..self.len]
    }

    /// Valid data, mutable
    #[inline]
    pub fn data_mut(&mut self) -> &mut [u8] {
        let len = self.len;
        &mut self.storage_mut()[..len]
    }

    /// Whole buffer, for reading a frame into it.
    #[inline]
    pub fn write_area(&mut self) -> &mut [u8] {
        self.storage_mut()
    }

    /// Mark the first `len` bytes as valid data.
    ///
    /// # Panics
    /// Panics if `len` exceeds the buffer capacity.
    #[inline]
    pub fn set_len(&mut self, len: usize) {
        assert!(
            len <= self.capacity(),
            "Length {len} exceeds buffer capacity {}",
            self.capacity()
        );
        self.len = len;
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.storage().len()
    }

    /// Forget the valid data so the buffer can be refilled in place.
    #[inline]
    pub fn reset(&mut self) {
        self.len = 0;
    }

    #[inline]
    fn storage(&self) -> &[u8] {
        self.data.as_deref().unwrap_or(&[])
    }

    #[inline]
    fn storage_mut(&mut self) -> &mut [u8] {
        self.data.as_deref_mut().unwrap_or(&mut [])
    }
}

impl Drop for PoolBuffer {
    #[inline]
    fn drop(&mut self) {
        if let Some(data) = self.data.take() {
            self.pool.return_buffer(data);
            self.pool.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }
}

impl fmt::Debug for PoolBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PoolBuffer")
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small_pool(max_buffers: usize) -> Arc<BufferPool> {
        Arc::new(BufferPool::new(64, max_buffers))
    }

    #[test]
    fn test_pool_creation_is_lazy() {
        let pool = small_pool(8);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.created(), 0);
        assert_eq!(pool.in_flight(), 0);
    }

    #[test]
    fn test_buffer_acquire_and_drop() {
        let pool = small_pool(8);
        {
            let buf = pool.acquire().expect("Failed to acquire");
            assert_eq!(buf.capacity(), 64);
            assert!(buf.is_empty());
            assert_eq!(pool.in_flight(), 1);
            assert_eq!(pool.available(), 0);
        }
        // Buffer returned on drop
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_explicit_release() {
        let pool = small_pool(8);
        let buf = pool.acquire().unwrap();
        pool.release(buf);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.created(), 1);
    }

    #[test]
    fn test_released_buffer_is_reused() {
        let pool = small_pool(8);
        let buf = pool.acquire().unwrap();
        let ptr = buf.storage().as_ptr();
        drop(buf);

        let mut buf = pool.acquire().unwrap();
        assert_eq!(buf.write_area().as_ptr(), ptr);
        assert_eq!(pool.created(), 1);
        // Valid length is reset even though contents are stale
        assert!(buf.data().is_empty());
    }

    #[test]
    fn test_buffer_write_and_read() {
        let pool = small_pool(8);
        let mut buf = pool.acquire().unwrap();

        buf.write_area()[0..5].copy_from_slice(b"hello");
        buf.set_len(5);

        assert_eq!(buf.data(), b"hello");
        buf.data_mut()[0] = b'j';
        assert_eq!(buf.data(), b"jello");

        buf.reset();
        assert!(buf.is_empty());
    }

    #[test]
    #[should_panic(expected = "exceeds buffer capacity")]
    fn test_set_len_beyond_capacity_panics() {
        let pool = small_pool(1);
        let mut buf = pool.acquire().unwrap();
        buf.set_len(65);
    }

    #[test]
    fn test_pool_exhaustion() {
        let pool = small_pool(4);
        let mut buffers = Vec::new();

        for _ in 0..4 {
            buffers.push(pool.acquire().expect("Should be able to acquire"));
        }

        assert!(matches!(
            pool.acquire(),
            Err(PoolError::Exhausted { max_buffers: 4 })
        ));
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight(), 4);

        // Return one buffer
        buffers.pop();
        assert_eq!(pool.available(), 1);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_zero_max_buffers_is_clamped() {
        let pool = small_pool(0);
        assert_eq!(pool.max_buffers(), 1);
        assert!(pool.acquire().is_ok());
    }

    #[test]
    fn test_buffer_send_across_threads() {
        let pool = small_pool(8);
        let mut buf = pool.acquire().unwrap();

        buf.write_area()[0..5].copy_from_slice(b"hello");
        buf.set_len(5);

        let (tx, rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            tx.send(buf).unwrap();
        });

        let received = rx.recv().unwrap();
        assert_eq!(received.data(), b"hello");
    }

    #[test]
    fn test_accounting_invariant_under_concurrency() {
        let pool = small_pool(32);
        let threads: Vec<_> = (0..4)
            .map(|_| {
                let pool = Arc::clone(&pool);
                std::thread::spawn(move || {
                    for _ in 0..1000 {
                        let held: Vec<_> = (0..4).filter_map(|_| pool.acquire().ok()).collect();
                        assert!(pool.created() <= 32);
                        drop(held);
                    }
                })
            })
            .collect();

        for t in threads {
            t.join().unwrap();
        }

        assert_eq!(pool.in_flight(), 0);
        assert_eq!(pool.available(), pool.created());
        assert!(pool.created() <= 16);
    }

    #[test]
    fn test_in_flight_counts_live_buffers() {
        let pool = small_pool(8);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        drop(a);

        // One buffer free, one live, both created
        assert_eq!(pool.in_flight(), 1);
        assert_eq!(pool.available(), 1);
        assert_eq!(pool.created(), 2);

        let c = pool.acquire().unwrap();
        assert_eq!(pool.in_flight(), 2);
        assert_eq!(pool.available(), 0);
        assert_eq!(pool.in_flight() + pool.available(), pool.created());

        drop((b, c));
        assert_eq!(pool.in_flight(), 0);
    }
}
