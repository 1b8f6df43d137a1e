//! Reusable byte buffers for formatting log lines.

use std::ops::{Deref, DerefMut};
use std::sync::{Mutex, PoisonError};

const BUFFER_CAPACITY: usize = 256;
const DEFAULT_MAX_POOLED: usize = 64;

/// A pool of byte buffers safe to borrow from many tasks at once.
#[derive(Debug)]
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new() -> Self {
        Self::with_max_pooled(DEFAULT_MAX_POOLED)
    }

    /// Keep at most `max_pooled` idle buffers; extras are freed on return.
    pub fn with_max_pooled(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::new()),
            max_pooled,
        }
    }

    /// Borrow an empty buffer. It goes back to the pool when dropped.
    pub fn get(&self) -> PooledBuffer<'_> {
        let mut buf = self
            .free
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .pop()
            .unwrap_or_else(|| Vec::with_capacity(BUFFER_CAPACITY));
        buf.clear();
        PooledBuffer { pool: self, buf }
    }

    /// Idle buffers currently held.
    pub fn idle(&self) -> usize {
        self.free.lock().unwrap_or_else(PoisonError::into_inner).len()
    }

    fn put(&self, buf: Vec<u8>) {
        let mut free = self.free.lock().unwrap_or_else(PoisonError::into_inner);
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new()
    }
}

/// A buffer on loan from a [`BufferPool`].
#[derive(Debug)]
pub struct PooledBuffer<'a> {
    pool: &'a BufferPool,
    buf: Vec<u8>,
}

impl Deref for PooledBuffer<'_> {
    type Target = Vec<u8>;

    fn deref(&self) -> &Vec<u8> {
        &self.buf
    }
}

impl DerefMut for PooledBuffer<'_> {
    fn deref_mut(&mut self) -> &mut Vec<u8> {
        &mut self.buf
    }
}

impl Drop for PooledBuffer<'_> {
    fn drop(&mut self) {
        self.pool.put(std::mem::take(&mut self.buf));
    }
}
