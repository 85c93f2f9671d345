//! Fixed-size buffer pools for block scratch space.
//!
//! Every `get` hands out exclusive ownership of one buffer until `put`,
//! so the pool is safe for concurrent use by construction. Returning a
//! buffer of the wrong capacity is an internal bug, never a data issue,
//! and panics.

use std::sync::Mutex;

pub struct BufferPool {
    size: usize,
    stack: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            stack: Mutex::new(Vec::new()),
        }
    }

    pub fn buf_size(&self) -> usize {
        self.size
    }

    /// Get an empty buffer with at least `size` capacity.
    pub fn get(&self) -> Vec<u8> {
        let mut stack = self.stack.lock().expect("buffer pool poisoned");
        match stack.pop() {
            Some(buf) => buf,
            None => Vec::with_capacity(self.size),
        }
    }

    /// Return a buffer obtained from [`get`](Self::get).
    pub fn put(&self, mut buf: Vec<u8>) {
        assert_eq!(
            buf.capacity(),
            self.size,
            "foreign buffer returned to pool"
        );
        buf.clear();
        let mut stack = self.stack.lock().expect("buffer pool poisoned");
        stack.push(buf);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buffers_are_recycled() {
        let pool = BufferPool::new(64);
        let mut buf = pool.get();
        buf.extend_from_slice(&[1, 2, 3]);
        let ptr = buf.as_ptr();
        pool.put(buf);
        let buf2 = pool.get();
        assert_eq!(buf2.len(), 0);
        assert_eq!(buf2.as_ptr(), ptr);
    }

    #[test]
    #[should_panic(expected = "foreign buffer")]
    fn undersized_buffer_panics() {
        let pool = BufferPool::new(64);
        pool.put(Vec::with_capacity(8));
    }

    #[test]
    #[should_panic(expected = "foreign buffer")]
    fn oversized_buffer_panics() {
        let pool = BufferPool::new(64);
        pool.put(Vec::with_capacity(128));
    }
}
