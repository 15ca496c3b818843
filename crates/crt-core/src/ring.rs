//! Fixed-capacity scrollback ring buffer.
//!
//! Each session owns one ring that accumulates shell output while no client
//! is attached. Writes never fail: once the buffer is full the oldest bytes
//! are overwritten, and a single write larger than the whole buffer keeps
//! only its tail. Readers see the logical contents as up to two contiguous
//! segments so the wrap point never forces a copy.
//!
//! Ring contents are shell output and may hold secrets, so the storage is
//! zeroed on [`clear`](ScrollbackRing::clear) and on drop via [`zeroize`],
//! which the compiler cannot elide.

use zeroize::Zeroize;

/// Allocation failure while reserving ring storage.
///
/// Surfaced to clients as an out-of-memory protocol error instead of
/// aborting the daemon.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("failed to allocate ring buffer of {capacity} bytes")]
pub struct RingAllocError {
    /// Requested capacity in bytes.
    pub capacity: usize,
}

/// Circular byte store with wrap-around writes and two-segment reads.
#[derive(Debug)]
pub struct ScrollbackRing {
    buf: Vec<u8>,
    /// Next write position.
    head: usize,
    /// Bytes currently stored, at most `buf.len()`.
    used: usize,
}

impl ScrollbackRing {
    /// Allocates a ring with the given capacity.
    ///
    /// # Errors
    ///
    /// Returns [`RingAllocError`] if the storage cannot be reserved.
    pub fn new(capacity: usize) -> Result<Self, RingAllocError> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(capacity)
            .map_err(|_| RingAllocError { capacity })?;
        buf.resize(capacity, 0);
        Ok(Self {
            buf,
            head: 0,
            used: 0,
        })
    }

    /// Total capacity in bytes.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Bytes currently stored.
    #[must_use]
    pub const fn used(&self) -> usize {
        self.used
    }

    /// Returns `true` when no bytes are stored.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.used == 0
    }

    /// Appends `data`, overwriting the oldest bytes once full.
    ///
    /// A write of at least the full capacity keeps only the last
    /// `capacity` bytes of `data`.
    pub fn write(&mut self, data: &[u8]) {
        let capacity = self.buf.len();
        if capacity == 0 || data.is_empty() {
            return;
        }

        if data.len() >= capacity {
            self.buf.copy_from_slice(&data[data.len() - capacity..]);
            self.head = 0;
            self.used = capacity;
            return;
        }

        let space_to_end = capacity - self.head;
        if data.len() <= space_to_end {
            self.buf[self.head..self.head + data.len()].copy_from_slice(data);
        } else {
            self.buf[self.head..].copy_from_slice(&data[..space_to_end]);
            self.buf[..data.len() - space_to_end].copy_from_slice(&data[space_to_end..]);
        }

        self.head = (self.head + data.len()) % capacity;
        self.used = usize::min(self.used + data.len(), capacity);
    }

    /// Logical contents as two contiguous segments, oldest bytes first.
    ///
    /// The second segment is empty unless the data wraps.
    #[must_use]
    pub fn segments(&self) -> (&[u8], &[u8]) {
        if self.used == 0 {
            return (&[], &[]);
        }

        // Until the first wrap the oldest byte sits at offset zero;
        // afterwards it sits where the next write would land.
        let start = if self.used < self.buf.len() {
            0
        } else {
            self.head
        };

        if start + self.used <= self.buf.len() {
            (&self.buf[start..start + self.used], &[])
        } else {
            let first = &self.buf[start..];
            let second = &self.buf[..self.used - first.len()];
            (first, second)
        }
    }

    /// Byte at a logical offset, where offset zero is the oldest byte.
    fn byte_at(&self, offset: usize) -> u8 {
        let start = if self.used < self.buf.len() {
            0
        } else {
            self.head
        };
        self.buf[(start + offset) % self.buf.len()]
    }

    /// Finds a UTF-8 lead-byte boundary at or after `offset`.
    ///
    /// Skips at most three continuation bytes (`10xxxxxx`), so a replay
    /// that starts mid code point drops only the truncated character.
    #[must_use]
    pub fn utf8_boundary(&self, mut offset: usize) -> usize {
        if self.used == 0 || offset >= self.used {
            return offset;
        }

        for _ in 0..3 {
            if offset >= self.used {
                break;
            }
            if self.byte_at(offset) & 0xC0 != 0x80 {
                return offset;
            }
            offset += 1;
        }
        offset
    }

    /// Zeroes the storage and resets the ring to empty.
    pub fn clear(&mut self) {
        self.buf.as_mut_slice().zeroize();
        self.head = 0;
        self.used = 0;
    }
}

impl Drop for ScrollbackRing {
    fn drop(&mut self) {
        self.buf.as_mut_slice().zeroize();
    }
}
