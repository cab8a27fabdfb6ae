//! Pooled request payload buffers.
//!
//! Every request payload is encoded into a fixed-capacity [`PduBuffer`]
//! borrowed from the link's [`PduPool`]. The buffer travels with its
//! transaction and is handed back once the transaction is retired, so a
//! steady request rate does not allocate.

use hmi_common::{LinkError, LinkResult};

/// Fixed-capacity payload buffer.
#[derive(Debug)]
pub struct PduBuffer {
    data: Box<[u8]>,
    len: usize,
}

impl PduBuffer {
    fn zeroed(capacity: usize) -> Self {
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            len: 0,
        }
    }

    /// Maximum payload size.
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written so far.
    #[must_use]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Returns true if nothing has been written.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The written payload.
    #[must_use]
    pub fn as_slice(&self) -> &[u8] {
        &self.data[..self.len]
    }

    /// Forget the written payload. The bytes are not zeroed.
    pub fn clear(&mut self) {
        self.len = 0;
    }

    /// Append raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the bytes do not fit; nothing is written.
    pub fn put_slice(&mut self, src: &[u8]) -> LinkResult<()> {
        let end = self.len + src.len();
        if end > self.data.len() {
            return Err(LinkError::Insufficient {
                needed: end,
                available: self.data.len(),
            });
        }
        self.data[self.len..end].copy_from_slice(src);
        self.len = end;
        Ok(())
    }

    /// Append one byte.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the buffer is full.
    pub fn put_u8(&mut self, value: u8) -> LinkResult<()> {
        self.put_slice(&[value])
    }

    /// Append a big-endian `u16`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the buffer is full.
    pub fn put_u16(&mut self, value: u16) -> LinkResult<()> {
        self.put_slice(&value.to_be_bytes())
    }

    /// Append a big-endian IEEE-754 `f32`.
    ///
    /// # Errors
    ///
    /// Returns [`LinkError::Insufficient`] if the buffer is full.
    pub fn put_f32(&mut self, value: f32) -> LinkResult<()> {
        self.put_slice(&value.to_be_bytes())
    }
}

/// Free list of [`PduBuffer`]s of one capacity.
///
/// Grows on demand and never shrinks while the link runs; [`PduPool::clear`]
/// drops the free list at teardown.
#[derive(Debug)]
pub struct PduPool {
    capacity: usize,
    free: Vec<PduBuffer>,
    allocated: usize,
}

impl PduPool {
    /// Create an empty pool handing out buffers of `capacity` bytes.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            free: Vec::new(),
            allocated: 0,
        }
    }

    /// Take a buffer, allocating a zeroed one if none is idle.
    ///
    /// Reused buffers come back with length 0 but keep their old bytes.
    pub fn acquire(&mut self) -> PduBuffer {
        match self.free.pop() {
            Some(mut buffer) => {
                buffer.clear();
                buffer
            }
            None => {
                self.allocated += 1;
                PduBuffer::zeroed(self.capacity)
            }
        }
    }

    /// Return a buffer to the free list.
    pub fn release(&mut self, buffer: PduBuffer) {
        debug_assert_eq!(buffer.capacity(), self.capacity);
        self.free.push(buffer);
    }

    /// Buffers sitting in the free list.
    #[must_use]
    pub fn idle(&self) -> usize {
        self.free.len()
    }

    /// Buffers alive (idle or on loan).
    #[must_use]
    pub fn allocated(&self) -> usize {
        self.allocated
    }

    /// Buffers currently on loan.
    #[must_use]
    pub fn outstanding(&self) -> usize {
        self.allocated - self.free.len()
    }

    /// Drop the free list. Buffers still on loan stay counted.
    pub fn clear(&mut self) {
        self.allocated -= self.free.len();
        self.free.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_allocates_zeroed() {
        let mut pool = PduPool::new(8);
        let buffer = pool.acquire();
        assert_eq!(buffer.capacity(), 8);
        assert!(buffer.is_empty());
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.outstanding(), 1);
    }

    #[test]
    fn test_release_reuses_without_zeroing() {
        let mut pool = PduPool::new(4);
        let mut buffer = pool.acquire();
        buffer.put_u16(0xBEEF).unwrap();
        pool.release(buffer);
        assert_eq!(pool.idle(), 1);

        let mut reused = pool.acquire();
        assert!(reused.is_empty());
        assert_eq!(pool.allocated(), 1);
        // Old bytes are still there underneath the reset length
        reused.put_u8(0x01).unwrap();
        assert_eq!(reused.as_slice(), &[0x01]);
    }

    #[test]
    fn test_put_overflow_rejected() {
        let mut pool = PduPool::new(3);
        let mut buffer = pool.acquire();
        buffer.put_u16(1).unwrap();
        let err = buffer.put_f32(1.0).unwrap_err();
        assert_eq!(
            err,
            LinkError::Insufficient {
                needed: 6,
                available: 3
            }
        );
        assert_eq!(buffer.len(), 2);
    }

    #[test]
    fn test_clear_leaves_empty_pool() {
        let mut pool = PduPool::new(16);
        let a = pool.acquire();
        let b = pool.acquire();
        pool.release(a);
        pool.release(b);

        pool.clear();
        assert_eq!(pool.idle(), 0);
        assert_eq!(pool.allocated(), 0);

        // Next acquire allocates fresh
        let _c = pool.acquire();
        assert_eq!(pool.allocated(), 1);
        assert_eq!(pool.idle(), 0);
    }

    #[test]
    fn test_f32_big_endian() {
        let mut pool = PduPool::new(4);
        let mut buffer = pool.acquire();
        buffer.put_f32(1.5).unwrap();
        assert_eq!(buffer.as_slice(), &[0x3F, 0xC0, 0x00, 0x00]);
    }
}
