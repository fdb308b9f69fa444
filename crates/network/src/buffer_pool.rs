use bytes::BytesMut;
use parking_lot::Mutex;

/// Pool of reusable write buffers shared by all connections.
///
/// Outbound pumps encode each frame into a pooled buffer and hand it back once
/// the bytes are on the socket, so steady-state traffic allocates nothing.
#[derive(Debug)]
pub struct BufferPool {
    buffers: Mutex<Vec<BytesMut>>,
    buffer_size: usize,
    max_pooled: usize,
}

impl BufferPool {
    pub fn new(buffer_size: usize, max_pooled: usize) -> Self {
        Self {
            buffers: Mutex::new(Vec::with_capacity(max_pooled)),
            buffer_size,
            max_pooled,
        }
    }

    /// Take an empty buffer with at least `buffer_size` capacity.
    pub fn get(&self) -> BytesMut {
        let pooled = self.buffers.lock().pop();
        match pooled {
            Some(buf) => buf,
            None => BytesMut::with_capacity(self.buffer_size),
        }
    }

    /// Return a buffer. Buffers that grew far beyond the nominal size are
    /// dropped instead of pinning memory.
    pub fn put(&self, mut buf: BytesMut) {
        if buf.capacity() > self.buffer_size * 4 {
            return;
        }
        buf.clear();
        if buf.capacity() < self.buffer_size {
            buf.reserve(self.buffer_size);
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_pooled {
            buffers.push(buf);
        }
    }

    pub fn pooled(&self) -> usize {
        self.buffers.lock().len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(64 * 1024, 256)
    }
}
