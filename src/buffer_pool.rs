//! Pooled connection buffers
//!
//! Read/write buffers cycle between connections instead of being
//! reallocated per connection. Oversized buffers are dropped rather than
//! pooled.

use std::sync::OnceLock;

use bytes::BytesMut;
use crossbeam_queue::ArrayQueue;

const BUFFER_SIZE: usize = 2048;
const MAX_POOLED: usize = 256;
const MAX_POOLED_CAPACITY: usize = 16384;

struct BufferPool {
    pool: ArrayQueue<BytesMut>,
}

impl BufferPool {
    fn new() -> Self {
        Self {
            pool: ArrayQueue::new(MAX_POOLED),
        }
    }

    fn get(&self) -> BytesMut {
        self.pool
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(BUFFER_SIZE))
    }

    fn put(&self, mut buf: BytesMut) {
        if buf.capacity() <= MAX_POOLED_CAPACITY {
            buf.clear();
            let _ = self.pool.push(buf);
        }
    }
}

static POOL: OnceLock<BufferPool> = OnceLock::new();

fn pool() -> &'static BufferPool {
    POOL.get_or_init(BufferPool::new)
}

/// Take a cleared buffer from the pool
pub fn get() -> BytesMut {
    pool().get()
}

/// Return a buffer for reuse
pub fn put(buf: BytesMut) {
    pool().put(buf);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn recycled_buffers_come_back_empty() {
        let pool = BufferPool::new();
        let mut buf = pool.get();
        buf.extend_from_slice(b"dirty");
        pool.put(buf);

        let buf = pool.get();
        assert!(buf.is_empty());
    }

    #[test]
    fn oversized_buffers_are_not_pooled() {
        let pool = BufferPool::new();
        pool.put(BytesMut::with_capacity(MAX_POOLED_CAPACITY + 1));
        assert!(pool.pool.is_empty());
    }
}
