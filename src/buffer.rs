//! Byte buffers for the read path and the pipeline
//!
//! [`Buffer`] is a growable byte region with a read position at its front:
//! bytes are appended at the back, consumed or split off at the front, and a
//! split hands out a frozen [`Bytes`] that shares the allocation instead of
//! copying it. Filter contexts park their partial messages in a `Buffer`.
//!
//! [`BufferFactory`] is what a service exposes to the read path. The default
//! [`PooledBufferFactory`] recycles read buffers so a busy channel does not
//! allocate on every read burst.
//!
//! # Examples
//!
//! ```rust
//! use horizon_reactor::buffer::{Buffer, BufferFactory, PooledBufferFactory};
//!
//! let pool = PooledBufferFactory::new(16, 4096);
//! let mut buf = pool.acquire();
//! buf.put_slice(b"PING\r\n");
//! let line = buf.split_to(4);
//! assert_eq!(&line[..], b"PING");
//! assert_eq!(buf.as_slice(), b"\r\n");
//! pool.release(buf);
//! ```

use std::collections::VecDeque;
use std::io::{self, Read};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use parking_lot::Mutex;

/// Growable byte buffer with split and merge operations
#[derive(Clone, Default, PartialEq, Eq)]
pub struct Buffer {
    inner: BytesMut,
}

impl Buffer {
    pub fn new() -> Self {
        Self { inner: BytesMut::new() }
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            inner: BytesMut::with_capacity(capacity),
        }
    }

    pub fn from_slice(data: &[u8]) -> Self {
        Self {
            inner: BytesMut::from(data),
        }
    }

    /// Readable bytes between the read position and the end.
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity()
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.inner[..]
    }

    pub fn put_slice(&mut self, data: &[u8]) {
        self.inner.put_slice(data);
    }

    /// Appends `other` after the readable bytes, leaving `other` empty.
    pub fn merge(&mut self, other: &mut Buffer) {
        if self.inner.is_empty() {
            std::mem::swap(&mut self.inner, &mut other.inner);
        } else {
            self.inner.unsplit(other.inner.split());
        }
    }

    /// Appends the bytes of a frozen fragment.
    pub fn merge_bytes(&mut self, data: Bytes) {
        if self.inner.is_empty() {
            // Reuse the fragment's allocation when it is not shared
            self.inner = BytesMut::from(data);
        } else {
            self.inner.put_slice(&data);
        }
    }

    /// Splits off the first `at` readable bytes as a frozen message.
    ///
    /// # Panics
    ///
    /// Panics if `at > self.len()`.
    pub fn split_to(&mut self, at: usize) -> Bytes {
        self.inner.split_to(at).freeze()
    }

    /// Takes every readable byte, leaving the buffer empty but keeping any
    /// spare capacity for reuse.
    pub fn take(&mut self) -> Bytes {
        self.inner.split().freeze()
    }

    /// Moves the read position forward by `cnt` bytes.
    pub fn advance(&mut self, cnt: usize) {
        self.inner.advance(cnt);
    }

    pub fn clear(&mut self) {
        self.inner.clear();
    }

    /// Position of the first occurrence of `needle`, searching from `from`.
    pub fn find(&self, needle: &[u8], from: usize) -> Option<usize> {
        find(&self.inner[..], needle, from)
    }

    /// Reads at most `max` bytes from `reader` into the spare capacity.
    ///
    /// Returns the number of bytes read; the buffer is unchanged on error.
    pub fn read_from<R: Read>(&mut self, reader: &mut R, max: usize) -> io::Result<usize> {
        let start = self.inner.len();
        self.inner.resize(start + max, 0);
        match reader.read(&mut self.inner[start..]) {
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

    pub fn freeze(self) -> Bytes {
        self.inner.freeze()
    }

    pub fn into_inner(self) -> BytesMut {
        self.inner
    }
}

impl From<Bytes> for Buffer {
    fn from(data: Bytes) -> Self {
        Self {
            inner: BytesMut::from(data),
        }
    }
}

impl From<&[u8]> for Buffer {
    fn from(data: &[u8]) -> Self {
        Self::from_slice(data)
    }
}

impl std::fmt::Debug for Buffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Buffer")
            .field("len", &self.inner.len())
            .field("capacity", &self.inner.capacity())
            .finish()
    }
}

/// Position of `needle` in `haystack` at or after `from`.
pub fn find(haystack: &[u8], needle: &[u8], from: usize) -> Option<usize> {
    if needle.is_empty() || from >= haystack.len() || needle.len() > haystack.len() - from {
        return None;
    }
    haystack[from..]
        .windows(needle.len())
        .position(|w| w == needle)
        .map(|p| p + from)
}

/// Source of read buffers for a service's channels
pub trait BufferFactory: Send + Sync {
    /// Hands out an empty buffer with at least the factory's default capacity.
    fn acquire(&self) -> Buffer;

    /// Returns a buffer that is no longer needed.
    fn release(&self, buffer: Buffer);
}

/// Allocates a fresh buffer every time
#[derive(Clone, Debug)]
pub struct HeapBufferFactory {
    capacity: usize,
}

impl HeapBufferFactory {
    pub fn new(capacity: usize) -> Self {
        Self { capacity }
    }
}

impl BufferFactory for HeapBufferFactory {
    fn acquire(&self) -> Buffer {
        Buffer::with_capacity(self.capacity)
    }

    fn release(&self, _buffer: Buffer) {}
}

/// Thread-safe pool of read buffers
///
/// Buffers are handed out empty; released buffers keep whatever spare
/// capacity they still own and are topped up to the default capacity on the
/// next acquire. The pool keeps at most `max_buffers` idle buffers.
#[derive(Debug)]
pub struct PooledBufferFactory {
    buffers: Mutex<VecDeque<BytesMut>>,
    default_capacity: usize,
    max_buffers: usize,
}

impl PooledBufferFactory {
    /// Creates a pool with `initial_count` pre-allocated buffers of
    /// `buffer_capacity` bytes; the pool may hold up to twice that many.
    pub fn new(initial_count: usize, buffer_capacity: usize) -> Self {
        let mut buffers = VecDeque::with_capacity(initial_count * 2);
        for _ in 0..initial_count {
            buffers.push_back(BytesMut::with_capacity(buffer_capacity));
        }

        Self {
            buffers: Mutex::new(buffers),
            default_capacity: buffer_capacity,
            max_buffers: (initial_count * 2).max(1),
        }
    }

    /// Idle buffers currently held by the pool.
    pub fn available_count(&self) -> usize {
        self.buffers.lock().len()
    }

    pub fn default_capacity(&self) -> usize {
        self.default_capacity
    }
}

impl BufferFactory for PooledBufferFactory {
    fn acquire(&self) -> Buffer {
        let mut inner = self
            .buffers
            .lock()
            .pop_front()
            .unwrap_or_else(|| BytesMut::with_capacity(self.default_capacity));
        inner.clear();
        inner.reserve(self.default_capacity);
        Buffer { inner }
    }

    fn release(&self, buffer: Buffer) {
        let mut inner = buffer.into_inner();
        inner.clear();
        if inner.capacity() == 0 {
            return;
        }
        let mut buffers = self.buffers.lock();
        if buffers.len() < self.max_buffers {
            buffers.push_back(inner);
        }
    }
}

impl Default for PooledBufferFactory {
    /// 64 buffers of 16 KiB, growing to at most 128 idle buffers.
    fn default() -> Self {
        Self::new(64, 16 * 1024)
    }
}
