//! Byte-buffer pool: a pool of fixed-capacity buffers with
//! RAII-style scoped acquisition so release happens on every exit path,
//! including early returns and panics during the encrypt/decrypt call.
//!
//! The teacher reaches for `BytesMut`/`bytes::Buf` throughout; this pool
//! just recycles those buffers instead of allocating fresh ones per record.

use std::sync::Mutex;

use bytes::BytesMut;

pub struct BufferPool {
    free: Mutex<Vec<BytesMut>>,
    capacity_hint: usize,
}

impl BufferPool {
    pub fn new(capacity_hint: usize) -> Self {
        BufferPool {
            free: Mutex::new(Vec::new()),
            capacity_hint,
        }
    }

    /// Acquire a buffer, reusing a freed one if available. The returned
    /// guard releases the buffer back to the pool when dropped, regardless
    /// of how the scope exits.
    pub fn acquire(self: &std::sync::Arc<Self>) -> PooledBuffer {
        let buf = self
            .free
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.capacity_hint));
        PooledBuffer {
            pool: std::sync::Arc::clone(self),
            buf: Some(buf),
        }
    }
}

pub struct PooledBuffer {
    pool: std::sync::Arc<BufferPool>,
    buf: Option<BytesMut>,
}

impl std::ops::Deref for PooledBuffer {
    type Target = BytesMut;

    fn deref(&self) -> &BytesMut {
        self.buf.as_ref().expect("buffer taken before drop")
    }
}

impl std::ops::DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut BytesMut {
        self.buf.as_mut().expect("buffer taken before drop")
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        if let Some(mut buf) = self.buf.take() {
            buf.clear();
            self.pool.free.lock().unwrap().push(buf);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn released_buffer_is_reused() {
        let pool = std::sync::Arc::new(BufferPool::new(16));
        {
            let mut guard = pool.acquire();
            guard.extend_from_slice(b"hello");
        }
        assert_eq!(pool.free.lock().unwrap().len(), 1);
        let guard = pool.acquire();
        assert!(guard.is_empty());
        assert_eq!(pool.free.lock().unwrap().len(), 0);
    }
}
