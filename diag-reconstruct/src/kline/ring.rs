//! Fixed-capacity circular byte buffer shared by the K-Line framers
//!
//! All wrap-around arithmetic lives here. Framers address bytes by logical
//! index (0 = oldest unconsumed byte) through [`ByteWindow`].

use crate::types::{ReconstructError, Result};
use std::ops::Range;

/// Random access to a run of buffered bytes
pub trait ByteWindow {
    /// Number of bytes available
    fn len(&self) -> usize;

    /// Byte at logical index; callers stay below `len()`
    fn at(&self, index: usize) -> u8;
}

impl ByteWindow for [u8] {
    fn len(&self) -> usize {
        <[u8]>::len(self)
    }

    fn at(&self, index: usize) -> u8 {
        self[index]
    }
}

/// Bounded ring of bytes with a logical start cursor
#[derive(Debug, Clone)]
pub struct RingBuffer {
    buf: Box<[u8]>,
    start: usize,
    len: usize,
}

impl RingBuffer {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0u8; capacity.max(1)].into_boxed_slice(),
            start: 0,
            len: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn is_full(&self) -> bool {
        self.len == self.buf.len()
    }

    /// Append a byte; never overwrites unconsumed data
    pub fn push(&mut self, byte: u8) -> Result<()> {
        if self.is_full() {
            return Err(ReconstructError::BufferOverflow {
                capacity: self.capacity(),
            });
        }
        let end = self.physical(self.len);
        self.buf[end] = byte;
        self.len += 1;
        Ok(())
    }

    /// Byte at logical index, `None` past the end
    pub fn get(&self, index: usize) -> Option<u8> {
        (index < self.len).then(|| self.buf[self.physical(index)])
    }

    /// Copy of the logical range, clamped to the buffered length
    pub fn peek_range(&self, range: Range<usize>) -> Vec<u8> {
        let end = range.end.min(self.len);
        (range.start.min(end)..end)
            .map(|i| self.buf[self.physical(i)])
            .collect()
    }

    /// Remove and return logical bytes `[0, end)`, zeroing their slots
    ///
    /// The start cursor advances past the removed bytes only; anything after
    /// `end` stays buffered.
    pub fn consume_until(&mut self, end: usize) -> Vec<u8> {
        let end = end.min(self.len);
        let mut taken = Vec::with_capacity(end);
        for _ in 0..end {
            let slot = &mut self.buf[self.start];
            taken.push(*slot);
            *slot = 0;
            self.start = (self.start + 1) % self.buf.len();
        }
        self.len -= end;
        if self.len == 0 {
            self.start = 0;
        }
        taken
    }

    /// Drop everything; O(1), slots are not zeroed
    pub fn clear(&mut self) {
        self.start = 0;
        self.len = 0;
    }

    /// All buffered bytes, oldest first
    pub fn contents(&self) -> Vec<u8> {
        self.peek_range(0..self.len)
    }

    fn physical(&self, index: usize) -> usize {
        (self.start + index) % self.buf.len()
    }
}

impl ByteWindow for RingBuffer {
    fn len(&self) -> usize {
        self.len
    }

    fn at(&self, index: usize) -> u8 {
        self.buf[self.physical(index)]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_push_until_full() {
        let mut ring = RingBuffer::new(4);
        for b in 0..4 {
            ring.push(b).unwrap();
        }
        assert!(ring.is_full());
        assert!(matches!(
            ring.push(9),
            Err(ReconstructError::BufferOverflow { capacity: 4 })
        ));
        assert_eq!(ring.contents(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_consume_keeps_trailing_bytes_and_wraps() {
        let mut ring = RingBuffer::new(4);
        for b in [1, 2, 3] {
            ring.push(b).unwrap();
        }
        assert_eq!(ring.consume_until(2), vec![1, 2]);
        assert_eq!(ring.len(), 1);

        // Wraps past the physical end
        for b in [4, 5, 6] {
            ring.push(b).unwrap();
        }
        assert_eq!(ring.contents(), vec![3, 4, 5, 6]);
        assert_eq!(ring.get(3), Some(6));
        assert_eq!(ring.get(4), None);
        assert_eq!(ByteWindow::at(&ring, 1), 4);
        assert_eq!(ring.peek_range(1..10), vec![4, 5, 6]);
    }

    #[test]
    fn test_clear_is_reset() {
        let mut ring = RingBuffer::new(8);
        ring.push(0xAA).unwrap();
        ring.clear();
        assert!(ring.is_empty());
        assert_eq!(ring.consume_until(3), Vec::<u8>::new());
    }

    #[test]
    fn test_slice_window() {
        let data = [0x81u8, 0x10, 0xF1];
        let window: &[u8] = &data;
        assert_eq!(ByteWindow::len(window), 3);
        assert_eq!(window.at(2), 0xF1);
    }
}
