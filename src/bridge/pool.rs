//! Reusable copy buffers for stream bridging

use parking_lot::Mutex;
use std::sync::Arc;

/// Idle buffers kept around at most
const MAX_POOLED: usize = 256;

/// Pool of fixed-size byte buffers
#[derive(Debug)]
pub struct BufferPool {
    buffer_size: usize,
    free: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    /// Create a pool handing out `buffer_size` byte buffers
    pub fn new(buffer_size: usize) -> Arc<Self> {
        Arc::new(Self {
            buffer_size: buffer_size.max(1),
            free: Mutex::new(Vec::new()),
        })
    }

    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// Borrow a buffer; it goes back to the pool when the lease drops
    pub fn lease(self: &Arc<Self>) -> BufferLease {
        let buffer = self
            .free
            .lock()
            .pop()
            .unwrap_or_else(|| vec![0u8; self.buffer_size]);

        BufferLease {
            buffer,
            pool: Arc::clone(self),
        }
    }

    /// Number of idle buffers
    pub fn available(&self) -> usize {
        self.free.lock().len()
    }

    fn give_back(&self, buffer: Vec<u8>) {
        if buffer.len() != self.buffer_size {
            return;
        }
        let mut free = self.free.lock();
        if free.len() < MAX_POOLED {
            free.push(buffer);
        }
    }
}

/// RAII lease on a pooled buffer
#[derive(Debug)]
pub struct BufferLease {
    buffer: Vec<u8>,
    pool: Arc<BufferPool>,
}

impl BufferLease {
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.buffer
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }
}

impl Drop for BufferLease {
    fn drop(&mut self) {
        self.pool.give_back(std::mem::take(&mut self.buffer));
    }
}
