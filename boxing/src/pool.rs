use crossbeam_queue::ArrayQueue;
use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use crate::error::Result;

/// A bounded lock-free free list of reusable scratch buffers.
///
/// `acquire` pops a free buffer or, when the pool is exhausted, falls back
/// to the supplied allocator. Dropping the returned guard hands the buffer
/// back; if the pool is already full the buffer is dropped instead.
pub struct ScratchPool<B: Send> {
    free: ArrayQueue<B>,
}

impl<B: Send> ScratchPool<B> {
    /// Create an empty pool that retains at most `capacity` buffers.
    pub fn new(capacity: usize) -> Arc<Self> {
        Arc::new(Self {
            free: ArrayQueue::new(capacity.max(1)),
        })
    }

    /// Create a pool pre-filled with `count` buffers from `alloc`.
    pub fn prefilled(count: usize, mut alloc: impl FnMut() -> Result<B>) -> Result<Arc<Self>> {
        let pool = Self::new(count);
        for _ in 0..count {
            let _ = pool.free.push(alloc()?);
        }
        Ok(pool)
    }

    /// Check out a buffer, allocating a fresh one if none is free.
    pub fn acquire(self: &Arc<Self>, alloc: impl FnOnce() -> Result<B>) -> Result<Scratch<B>> {
        let buf = match self.free.pop() {
            Some(b) => b,
            None => alloc()?,
        };
        Ok(Scratch {
            buf: Some(buf),
            pool: Arc::clone(self),
        })
    }

    /// Number of buffers currently free.
    pub fn available(&self) -> usize {
        self.free.len()
    }

    fn release(&self, buf: B) {
        let _ = self.free.push(buf);
    }
}

/// A buffer checked out from a [`ScratchPool`]. Returned to the pool on drop.
pub struct Scratch<B: Send> {
    buf: Option<B>,
    pool: Arc<ScratchPool<B>>,
}

impl<B: Send> Deref for Scratch<B> {
    type Target = B;

    fn deref(&self) -> &B {
        // `buf` is `Some` from construction until `Drop`.
        self.buf.as_ref().expect("Scratch used after drop")
    }
}

impl<B: Send> DerefMut for Scratch<B> {
    fn deref_mut(&mut self) -> &mut B {
        self.buf.as_mut().expect("Scratch used after drop")
    }
}

impl<B: Send> Drop for Scratch<B> {
    fn drop(&mut self) {
        if let Some(buf) = self.buf.take() {
            self.pool.release(buf);
        }
    }
}
