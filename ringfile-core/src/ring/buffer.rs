//! Owned I/O buffers.
//!
//! An [`IoBuf`] is a heap allocation whose address never changes while the
//! buffer is alive, so a raw pointer into it can be handed to the kernel for
//! the duration of an operation. The buffer carries a position/limit window
//! selecting the bytes an operation reads into, and later the bytes a caller
//! is meant to look at.

use crate::ring::DIRECT_IO_ALIGNMENT;
use std::alloc::{alloc_zeroed, dealloc, handle_alloc_error, Layout};
use std::fmt;
use std::ops::Deref;
use std::ptr::NonNull;

/// Alignment of buffers allocated with [`IoBuf::new`].
const DEFAULT_ALIGNMENT: usize = 8;

/// An owned, zero-initialized buffer with a visible window.
pub struct IoBuf {
    /// Start of the allocation.
    ptr: NonNull<u8>,

    /// Layout used for the allocation (at least one byte).
    layout: Layout,

    /// Usable size in bytes.
    capacity: usize,

    /// Start of the visible window.
    position: usize,

    /// End of the visible window.
    limit: usize,
}

// Safety: IoBuf uniquely owns its allocation, like a Box<[u8]>.
unsafe impl Send for IoBuf {}
unsafe impl Sync for IoBuf {}

impl IoBuf {
    /// Allocates a buffer of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self::with_alignment(len, DEFAULT_ALIGNMENT)
    }

    /// Allocates a buffer of `len` bytes aligned for direct I/O.
    pub fn aligned(len: usize) -> Self {
        Self::with_alignment(len, DIRECT_IO_ALIGNMENT)
    }

    /// Allocates a buffer of `len` bytes with the given alignment.
    ///
    /// # Panics
    ///
    /// Panics if `align` is not a power of two or the size overflows.
    pub fn with_alignment(len: usize, align: usize) -> Self {
        let layout = match Layout::from_size_align(len.max(1), align) {
            Ok(layout) => layout,
            Err(e) => panic!("invalid buffer layout (len={len}, align={align}): {e}"),
        };

        // Safety: the layout has a non-zero size.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = match NonNull::new(raw) {
            Some(ptr) => ptr,
            None => handle_alloc_error(layout),
        };

        Self {
            ptr,
            layout,
            capacity: len,
            position: 0,
            limit: len,
        }
    }

    /// Allocates a buffer holding a copy of `data`.
    pub fn from_slice(data: &[u8]) -> Self {
        let mut buf = Self::new(data.len());
        buf.as_full_mut_slice().copy_from_slice(data);
        buf
    }

    /// Total size of the allocation in bytes.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Start of the visible window.
    pub fn position(&self) -> usize {
        self.position
    }

    /// End of the visible window.
    pub fn limit(&self) -> usize {
        self.limit
    }

    /// Number of bytes in the visible window.
    pub fn remaining(&self) -> usize {
        self.limit - self.position
    }

    /// Moves the start of the window.
    ///
    /// # Panics
    ///
    /// Panics if `position` is past the limit.
    pub fn set_position(&mut self, position: usize) {
        assert!(
            position <= self.limit,
            "position {position} past limit {}",
            self.limit
        );
        self.position = position;
    }

    /// Moves the end of the window, pulling the position back if needed.
    ///
    /// # Panics
    ///
    /// Panics if `limit` exceeds the capacity.
    pub fn set_limit(&mut self, limit: usize) {
        assert!(
            limit <= self.capacity,
            "limit {limit} exceeds capacity {}",
            self.capacity
        );
        self.limit = limit;
        self.position = self.position.min(limit);
    }

    /// Makes the whole allocation visible again.
    pub fn clear(&mut self) {
        self.position = 0;
        self.limit = self.capacity;
    }

    /// Address of the first byte of the window.
    pub fn address(&self) -> usize {
        self.as_ptr() as usize
    }

    /// Pointer to the first byte of the window.
    pub fn as_ptr(&self) -> *const u8 {
        // Safety: position <= capacity, which is within the allocation.
        unsafe { self.ptr.as_ptr().add(self.position) }
    }

    /// Mutable pointer to the first byte of the window.
    pub fn as_mut_ptr(&mut self) -> *mut u8 {
        // Safety: position <= capacity, which is within the allocation.
        unsafe { self.ptr.as_ptr().add(self.position) }
    }

    /// The visible window.
    pub fn as_slice(&self) -> &[u8] {
        // Safety: [position, limit) lies within the initialized allocation.
        unsafe { std::slice::from_raw_parts(self.as_ptr(), self.remaining()) }
    }

    /// The visible window, mutably.
    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        let len = self.remaining();
        // Safety: [position, limit) lies within the initialized allocation.
        unsafe { std::slice::from_raw_parts_mut(self.as_mut_ptr(), len) }
    }

    /// The whole allocation, ignoring the window.
    pub fn as_full_mut_slice(&mut self) -> &mut [u8] {
        // Safety: the allocation holds `capacity` initialized bytes.
        unsafe { std::slice::from_raw_parts_mut(self.ptr.as_ptr(), self.capacity) }
    }
}

impl Deref for IoBuf {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl AsRef<[u8]> for IoBuf {
    fn as_ref(&self) -> &[u8] {
        self.as_slice()
    }
}

impl fmt::Debug for IoBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoBuf")
            .field("address", &format_args!("{:#x}", self.ptr.as_ptr() as usize))
            .field("capacity", &self.capacity)
            .field("position", &self.position)
            .field("limit", &self.limit)
            .finish()
    }
}

impl Drop for IoBuf {
    fn drop(&mut self) {
        // Safety: ptr was allocated with this layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}
