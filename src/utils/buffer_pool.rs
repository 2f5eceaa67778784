//! # Read Buffer Pool
//!
//! Reusable socket read buffers, owned by one engine and handed to its reader tasks.
//!
//! Readers acquire a buffer of the configured length, read into it, and drop it when
//! the bytes have been decoded; the buffer goes back to the pool instead of the
//! allocator. Pools are never global: each engine sizes and owns its own, so
//! separate engines (and separate tests) never share buffers.
//!
//! ## Usage
//! ```rust
//! use netcore::utils::buffer_pool::BufferPool;
//!
//! let pool = BufferPool::new(4, 2048);
//! let mut buffer = pool.acquire();
//! assert_eq!(buffer.len(), 2048);
//! buffer[0] = 0x80;
//! drop(buffer); // back in the pool
//! assert_eq!(pool.available(), 4);
//! ```

use std::sync::{Arc, Mutex};

/// A pooled buffer that returns itself to the pool when dropped
pub struct PooledBuffer {
    buffer: Vec<u8>,
    pool: Arc<Shared>,
}

impl PooledBuffer {
    /// Detach the buffer from the pool.
    pub fn into_inner(mut self) -> Vec<u8> {
        std::mem::take(&mut self.buffer)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        // Detached or regrown buffers are left to the allocator.
        if self.buffer.capacity() != self.pool.buffer_size {
            return;
        }
        if let Ok(mut free) = self.pool.free.lock() {
            if free.len() < self.pool.retain {
                free.push(std::mem::take(&mut self.buffer));
            }
        }
    }
}

impl std::ops::Deref for PooledBuffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.buffer
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.buffer
    }
}

struct Shared {
    free: Mutex<Vec<Vec<u8>>>,
    buffer_size: usize,
    retain: usize,
}

/// Thread-safe pool of fixed-length read buffers
#[derive(Clone)]
pub struct BufferPool {
    shared: Arc<Shared>,
}

impl BufferPool {
    /// Pre-allocate `pool_size` buffers of `buffer_size` bytes each.
    pub fn new(pool_size: usize, buffer_size: usize) -> Self {
        let free = (0..pool_size).map(|_| Self::allocate(buffer_size)).collect();
        Self {
            shared: Arc::new(Shared {
                free: Mutex::new(free),
                buffer_size,
                retain: pool_size.max(1),
            }),
        }
    }

    fn allocate(buffer_size: usize) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(buffer_size);
        buffer.resize(buffer_size, 0);
        buffer
    }

    /// Take a buffer from the pool, allocating a fresh one when it is empty.
    pub fn acquire(&self) -> PooledBuffer {
        let buffer = self
            .shared
            .free
            .lock()
            .ok()
            .and_then(|mut free| free.pop())
            .unwrap_or_else(|| Self::allocate(self.shared.buffer_size));

        PooledBuffer {
            buffer,
            pool: self.shared.clone(),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.shared.buffer_size
    }

    /// Number of idle buffers ready to hand out
    pub fn available(&self) -> usize {
        self.shared.free.lock().map(|p| p.len()).unwrap_or(0)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("buffer_size", &self.shared.buffer_size)
            .field("available", &self.available())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_and_return() {
        let pool = BufferPool::new(2, 512);
        let buf = pool.acquire();
        assert_eq!(buf.len(), 512);
        assert_eq!(pool.available(), 1);
        drop(buf);
        assert_eq!(pool.available(), 2);
    }

    #[test]
    fn empty_pool_allocates() {
        let pool = BufferPool::new(1, 64);
        let _a = pool.acquire();
        let b = pool.acquire();
        assert_eq!(b.len(), 64);
        assert_eq!(pool.available(), 0);
    }

    #[test]
    fn pool_does_not_grow_past_retain() {
        let pool = BufferPool::new(1, 64);
        let a = pool.acquire();
        let b = pool.acquire();
        drop(a);
        drop(b);
        assert_eq!(pool.available(), 1);
    }

    #[test]
    fn detached_buffer_is_not_returned() {
        let pool = BufferPool::new(1, 64);
        let owned = pool.acquire().into_inner();
        assert_eq!(owned.len(), 64);
        assert_eq!(pool.available(), 0);
    }
}
