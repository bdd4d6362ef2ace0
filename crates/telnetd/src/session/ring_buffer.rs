//! Fixed-capacity circular byte buffer.
//!
//! One buffer per direction of a session. Producers append into the free
//! space, consumers drain from the read position; a full buffer simply
//! accepts nothing, which is what withdraws read interest upstream.

use std::io::{self, IoSlice};

#[derive(Debug)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    /// Read position (wraps around).
    read_pos: usize,
    /// Occupied bytes; the write position is `(read_pos + len) % capacity`.
    len: usize,
}

impl RingBuffer {
    /// Create an empty ring buffer with the given capacity in bytes.
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity].into_boxed_slice(),
            read_pos: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Number of valid bytes currently stored.
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.capacity()
    }

    /// Bytes that can still be appended.
    pub fn free(&self) -> usize {
        self.capacity() - self.len
    }

    fn write_pos(&self) -> usize {
        (self.read_pos + self.len) % self.capacity()
    }

    /// Copy as much of `data` as fits. Returns the number of bytes taken.
    pub fn append(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(self.free());
        if n == 0 {
            return 0;
        }
        let start = self.write_pos();
        let first = n.min(self.capacity() - start);
        self.buf[start..start + first].copy_from_slice(&data[..first]);
        self.buf[..n - first].copy_from_slice(&data[first..n]);
        self.len += n;
        n
    }

    /// Up to `max` buffered bytes in order, as two spans when they wrap.
    pub fn readable(&self, max: usize) -> (&[u8], &[u8]) {
        let n = max.min(self.len);
        if n == 0 {
            return (&[], &[]);
        }
        let first = n.min(self.capacity() - self.read_pos);
        (
            &self.buf[self.read_pos..self.read_pos + first],
            &self.buf[..n - first],
        )
    }

    /// Release `n` bytes from the front after a sink accepted them.
    pub fn consume(&mut self, n: usize) {
        let n = n.min(self.len);
        if n == 0 {
            return;
        }
        self.read_pos = (self.read_pos + n) % self.capacity();
        self.len -= n;
        if self.len == 0 {
            self.read_pos = 0;
        }
    }

    /// Hand the buffered bytes to `write` as vectored slices and consume
    /// however many it reports written.
    pub fn write_to<F>(&mut self, write: F) -> io::Result<usize>
    where
        F: FnOnce(&[IoSlice<'_>]) -> io::Result<usize>,
    {
        let (head, tail) = self.readable(self.len);
        let written = if tail.is_empty() {
            write(&[IoSlice::new(head)])?
        } else {
            write(&[IoSlice::new(head), IoSlice::new(tail)])?
        };
        self.consume(written);
        Ok(written)
    }

    /// Let `read` fill the contiguous free span at the write position and
    /// commit what it reports. Returns `Ok(0)` both for end of stream and
    /// for a full buffer, so callers only invoke it with free space left.
    pub fn fill_from<F>(&mut self, read: F) -> io::Result<usize>
    where
        F: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        if self.free() == 0 {
            return Ok(0);
        }
        let start = self.write_pos();
        let span = self.free().min(self.capacity() - start);
        let n = read(&mut self.buf[start..start + span])?;
        self.len += n.min(span);
        Ok(n)
    }
}
