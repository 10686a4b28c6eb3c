//! Growable, contiguous byte buffer used for per-connection read and write
//! queues.
//!
//! The teacher's original `Buffer` hand-rolled its own allocation with raw
//! pointers; this keeps the same `remaining`/`remaining_mut`/`mark_read`
//! contract but implements it atop a plain `Vec<u8>`, trading a little
//! copying on compaction for a fully safe implementation.

use std::io::{self, Read, Write};
use std::ops::{Deref, DerefMut};

/// A growable byte buffer with independent read and write cursors.
#[derive(Debug, Default)]
pub struct Buffer {
    inner: Vec<u8>,
    read_offset: usize,
    desired_capacity: usize,
}

impl Buffer {
    /// Creates a new, empty `Buffer` that will shrink back down to
    /// `desired_capacity` once drained.
    pub fn new(desired_capacity: usize) -> Self {
        Self {
            inner: Vec::with_capacity(desired_capacity),
            read_offset: 0,
            desired_capacity,
        }
    }

    /// Reserves space for at least `additional` more bytes to be written.
    pub fn reserve(&mut self, additional: usize) {
        self.inner.reserve(additional);
    }

    /// Bytes available to be read.
    pub fn remaining(&self) -> usize {
        self.inner.len() - self.read_offset
    }

    /// Spare capacity available for writing before a reallocation occurs.
    pub fn remaining_mut(&self) -> usize {
        self.inner.capacity() - self.inner.len()
    }

    /// Appends `data` to the writable tail, growing the buffer if needed.
    pub fn extend(&mut self, data: &[u8]) {
        self.inner.extend_from_slice(data);
    }

    /// Reads up to `chunk` bytes from `source` directly into the buffer's
    /// tail, growing it first if there is less than `chunk` spare capacity.
    /// Returns the number of bytes read, as `Read::read` would.
    pub fn fill_from<R: Read>(&mut self, source: &mut R, chunk: usize) -> io::Result<usize> {
        if self.remaining_mut() < chunk {
            self.reserve(chunk);
        }

        let start = self.inner.len();
        self.inner.resize(start + chunk, 0);
        match source.read(&mut self.inner[start..]) {
            Ok(n) => {
                self.inner.truncate(start + n);
                Ok(n)
            }
            Err(e) => {
                self.inner.truncate(start);
                Err(e)
            }
        }
    }

    /// Marks `amount` bytes as consumed from the front of the readable
    /// region, compacting the backing storage once it is fully drained.
    pub fn mark_read(&mut self, amount: usize) {
        self.read_offset = (self.read_offset + amount).min(self.inner.len());
        self.compact();
    }

    /// Resets the buffer to empty, shrinking back to `desired_capacity` if
    /// it grew beyond that while filling.
    fn clear(&mut self) {
        self.inner.clear();
        self.read_offset = 0;
        if self.inner.capacity() > self.desired_capacity {
            self.inner.shrink_to(self.desired_capacity);
        }
    }

    /// Drops already-read bytes from the front once the buffer is fully
    /// drained, or once unread space has grown past the desired capacity.
    fn compact(&mut self) {
        if self.remaining() == 0 {
            self.clear();
            return;
        }

        if self.read_offset > self.desired_capacity {
            self.inner.drain(..self.read_offset);
            self.read_offset = 0;
        }
    }
}

impl Deref for Buffer {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        &self.inner[self.read_offset..]
    }
}

impl DerefMut for Buffer {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.inner[self.read_offset..]
    }
}

impl Write for Buffer {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.extend(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}
