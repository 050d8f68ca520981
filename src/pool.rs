//! Pooled buffers shared across connections.
//!
//! Two size classes: header-sized buffers for request heads and response
//! headers, and larger body buffers. A connection holds at most one buffer
//! per slot and must release every acquired buffer exactly once; the
//! `outstanding` counter makes that observable to tests.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;

use bytes::BytesMut;

/// How many free buffers each size class retains.
const MAX_RETAINED: usize = 64;

/// A pool of reusable byte buffers.
pub struct BufferPool {
    header_size: usize,
    buffer_size: usize,
    free_headers: Mutex<Vec<BytesMut>>,
    free_buffers: Mutex<Vec<BytesMut>>,
    outstanding: AtomicUsize,
}

impl BufferPool {
    /// Create a pool with the given header and body buffer capacities.
    pub fn new(header_size: usize, buffer_size: usize) -> BufferPool {
        BufferPool {
            header_size,
            buffer_size,
            free_headers: Mutex::new(Vec::new()),
            free_buffers: Mutex::new(Vec::new()),
            outstanding: AtomicUsize::new(0),
        }
    }

    /// Acquire a header-sized buffer.
    pub fn header(&self) -> BytesMut {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.free_headers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.header_size))
    }

    /// Acquire a body-sized buffer.
    pub fn buffer(&self) -> BytesMut {
        self.outstanding.fetch_add(1, Ordering::AcqRel);
        self.free_buffers
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| BytesMut::with_capacity(self.buffer_size))
    }

    /// Acquire a buffer of at least `size` bytes.
    ///
    /// Sizes above the body class are served as one-off allocations; they
    /// are still counted and must still be released.
    pub fn sized(&self, size: usize) -> BytesMut {
        if size <= self.buffer_size {
            let mut buf = self.buffer();
            if buf.capacity() < size {
                buf.reserve(size - buf.capacity());
            }
            buf
        } else {
            self.outstanding.fetch_add(1, Ordering::AcqRel);
            BytesMut::with_capacity(size)
        }
    }

    /// Return a buffer to the pool.
    pub fn release(&self, mut buf: BytesMut) {
        self.outstanding.fetch_sub(1, Ordering::AcqRel);
        buf.clear();
        if buf.capacity() >= self.buffer_size {
            let mut free = self.free_buffers.lock().unwrap();
            if free.len() < MAX_RETAINED {
                free.push(buf);
            }
        } else if buf.capacity() >= self.header_size {
            let mut free = self.free_headers.lock().unwrap();
            if free.len() < MAX_RETAINED {
                free.push(buf);
            }
        }
        // undersized buffers (chunk frames) are dropped
    }

    /// The header buffer capacity.
    pub fn header_size(&self) -> usize {
        self.header_size
    }

    /// The body buffer capacity.
    pub fn buffer_size(&self) -> usize {
        self.buffer_size
    }

    /// How many buffers are currently out of the pool.
    pub fn outstanding(&self) -> usize {
        self.outstanding.load(Ordering::Acquire)
    }
}

impl std::fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BufferPool")
            .field("header_size", &self.header_size)
            .field("buffer_size", &self.buffer_size)
            .field("outstanding", &self.outstanding)
            .finish()
    }
}
