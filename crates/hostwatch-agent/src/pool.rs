//! Reusable serialization buffers.

use parking_lot::Mutex;
use serde::Serialize;

/// Buffers larger than this are dropped instead of returned to the pool.
const MAX_RETAINED_CAPACITY: usize = 64 * 1024;

/// A small free-list of byte buffers for JSON encoding.
pub struct BufferPool {
    free: Mutex<Vec<Vec<u8>>>,
    max_pooled: usize,
}

impl BufferPool {
    /// Create a pool that keeps at most `max_pooled` idle buffers.
    pub fn new(max_pooled: usize) -> Self {
        Self {
            free: Mutex::new(Vec::with_capacity(max_pooled)),
            max_pooled,
        }
    }

    /// Encode `value` as JSON using a pooled scratch buffer.
    pub fn encode<T: Serialize + ?Sized>(&self, value: &T) -> Result<String, serde_json::Error> {
        let mut buf = self.free.lock().pop().unwrap_or_else(|| Vec::with_capacity(4096));
        let encoded = serde_json::to_writer(&mut buf, value)
            .map(|()| String::from_utf8_lossy(&buf).into_owned());
        self.release(buf);
        encoded
    }

    /// Number of idle buffers.
    pub fn idle(&self) -> usize {
        self.free.lock().len()
    }

    fn release(&self, mut buf: Vec<u8>) {
        if buf.capacity() > MAX_RETAINED_CAPACITY {
            return;
        }
        buf.clear();
        let mut free = self.free.lock();
        if free.len() < self.max_pooled {
            free.push(buf);
        }
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(8)
    }
}
