//! Fixed-capacity circular byte buffer for one direction of a connection.
//!
//! The buffer keeps two free-running `u32` cursors, `head` (next write) and
//! `tail` (next read). They are never masked; the physical position of a
//! cursor is `cursor & (capacity - 1)`, which is why the capacity must be a
//! power of two. All cursor arithmetic wraps, so the number of pending bytes
//! stays correct across `u32` overflow.
//!
//! The ring knows nothing about message structure. It stores bytes and hands
//! out at most two scatter/gather segments for vectored socket I/O.

use std::io::{IoSlice, IoSliceMut};
use std::ops::{Deref, DerefMut};

use crate::config::WireConfig;

/// Up to two I/O segments describing a region of a [`RingBuffer`].
///
/// Dereferences to the slice of populated segments, so it can be handed
/// straight to `write_vectored`, `read_vectored`, `sendmsg` or `recvmsg`.
#[derive(Debug)]
pub struct Segments<T> {
    slots: [T; 2],
    len: usize,
}

impl<T> Segments<T> {
    fn new(slots: [T; 2], len: usize) -> Self {
        Self { slots, len }
    }
}

impl<T> Deref for Segments<T> {
    type Target = [T];

    fn deref(&self) -> &[T] {
        &self.slots[..self.len]
    }
}

impl<T> DerefMut for Segments<T> {
    fn deref_mut(&mut self) -> &mut [T] {
        &mut self.slots[..self.len]
    }
}

/// A circular byte buffer with wrapping cursors.
#[derive(Debug)]
pub struct RingBuffer {
    data: Box<[u8]>,
    head: u32,
    tail: u32,
}

impl Default for RingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RingBuffer {
    /// Create a buffer with the default capacity.
    pub fn new() -> Self {
        Self::with_capacity(WireConfig::BUFFER_CAPACITY)
    }

    /// Create a buffer holding `capacity` bytes.
    ///
    /// # Panics
    ///
    /// Panics if `capacity` is not a power of two or does not fit the 32-bit
    /// cursor space.
    pub fn with_capacity(capacity: usize) -> Self {
        assert!(
            capacity.is_power_of_two() && capacity <= 1 << 31,
            "ring buffer capacity must be a power of two no larger than 2^31, got {capacity}"
        );
        Self {
            data: vec![0u8; capacity].into_boxed_slice(),
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.data.len()
    }

    /// Bytes written but not yet consumed.
    ///
    /// Not clamped: a producer that outruns the consumer sees a value above
    /// [`capacity`](Self::capacity), which signals that older bytes were
    /// overwritten.
    pub fn size(&self) -> usize {
        self.head.wrapping_sub(self.tail) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.head == self.tail
    }

    /// Free bytes between `head` and `tail + capacity`.
    pub fn available(&self) -> usize {
        self.capacity().saturating_sub(self.size())
    }

    pub fn head(&self) -> u32 {
        self.head
    }

    pub fn tail(&self) -> u32 {
        self.tail
    }

    fn mask(&self, cursor: u32) -> usize {
        cursor as usize & (self.data.len() - 1)
    }

    /// Append `bytes` at `head`.
    ///
    /// A write longer than the capacity stores only its final `capacity`
    /// bytes, each at its logical position, while `head` still advances by
    /// the full length.
    pub fn put(&mut self, bytes: &[u8]) {
        let capacity = self.capacity();
        let skip = bytes.len().saturating_sub(capacity);
        let src = &bytes[skip..];

        let start = self.mask(self.head.wrapping_add(skip as u32));
        let first = (capacity - start).min(src.len());
        self.data[start..start + first].copy_from_slice(&src[..first]);
        self.data[..src.len() - first].copy_from_slice(&src[first..]);

        self.head = self.head.wrapping_add(bytes.len() as u32);
    }

    /// Copy `dest.len()` bytes starting at `tail` without consuming them.
    pub fn copy(&self, dest: &mut [u8]) {
        self.copy_at(0, dest);
    }

    /// Copy `dest.len()` bytes starting `offset` bytes past `tail`.
    ///
    /// # Panics
    ///
    /// Panics if `dest` is longer than the buffer capacity.
    pub fn copy_at(&self, offset: usize, dest: &mut [u8]) {
        let capacity = self.capacity();
        assert!(
            dest.len() <= capacity,
            "copy of {} bytes exceeds ring capacity {capacity}",
            dest.len()
        );

        let start = self.mask(self.tail.wrapping_add(offset as u32));
        let first = (capacity - start).min(dest.len());
        let rest = dest.len() - first;
        dest[..first].copy_from_slice(&self.data[start..start + first]);
        dest[first..].copy_from_slice(&self.data[..rest]);
    }

    /// Segments covering the unread bytes, ready for a vectored write.
    ///
    /// When the buffer was overrun only the last `capacity` bytes written are
    /// described. An empty buffer yields no segments.
    pub fn get_iov(&self) -> Segments<IoSlice<'_>> {
        let capacity = self.capacity();
        let live = self.size().min(capacity);
        if live == 0 {
            return Segments::new([IoSlice::new(&[]), IoSlice::new(&[])], 0);
        }

        let start = self.mask(self.head.wrapping_sub(live as u32));
        if start + live <= capacity {
            Segments::new(
                [IoSlice::new(&self.data[start..start + live]), IoSlice::new(&[])],
                1,
            )
        } else {
            let wrapped = live - (capacity - start);
            Segments::new(
                [
                    IoSlice::new(&self.data[start..]),
                    IoSlice::new(&self.data[..wrapped]),
                ],
                2,
            )
        }
    }

    /// Segments covering the free space after `head`, ready for a vectored read.
    ///
    /// A full (or overrun) buffer yields no segments. The cursors do not move;
    /// call [`commit`](Self::commit) with the number of bytes received.
    pub fn put_iov(&mut self) -> Segments<IoSliceMut<'_>> {
        let capacity = self.capacity();
        let free = self.available();
        if free == 0 {
            return Segments::new([IoSliceMut::new(&mut []), IoSliceMut::new(&mut [])], 0);
        }

        let start = self.mask(self.head);
        if start + free <= capacity {
            Segments::new(
                [
                    IoSliceMut::new(&mut self.data[start..start + free]),
                    IoSliceMut::new(&mut []),
                ],
                1,
            )
        } else {
            let wrapped = free - (capacity - start);
            let (front, back) = self.data.split_at_mut(start);
            Segments::new(
                [IoSliceMut::new(back), IoSliceMut::new(&mut front[..wrapped])],
                2,
            )
        }
    }

    /// Advance `head` over bytes written through [`put_iov`](Self::put_iov).
    pub fn commit(&mut self, count: usize) {
        self.head = self.head.wrapping_add(count as u32);
    }

    /// Advance `tail`, discarding `count` read bytes.
    pub fn consume(&mut self, count: usize) {
        self.tail = self.tail.wrapping_add(count as u32);
    }

    #[cfg(test)]
    fn set_cursors(&mut self, head: u32, tail: u32) {
        self.head = head;
        self.tail = tail;
    }
}
