//! Binary records exchanged with the native provider.
//!
//! Both structures are `#[repr(C)]` so a provider written in any language can
//! read the pending submissions and write completion results in place.

use std::fmt;

/// Size of a [`SubmissionRecord`] in a packed array.
pub const SUBMISSION_RECORD_STRIDE: usize = 64;

/// One pending submission as handed to the provider.
///
/// The record is padded to a full cache line so that arrays of them never
/// share a line between two entries.
#[repr(C, align(64))]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct SubmissionRecord {
    /// Slot ID; echoed back in the completion.
    pub id: i64,

    /// File descriptor to operate on.
    pub fd: i32,

    /// Number of bytes to transfer.
    pub buf_length: i32,

    /// Address the bytes are transferred to (reads) or from (writes).
    pub buf_base: *mut u8,

    /// File offset.
    pub offset: i64,

    /// Read when true, write otherwise.
    pub is_read: bool,
}

// Safety: the record is plain data; the buffer it points at is owned by the
// submission sitting in the slot table next to it.
unsafe impl Send for SubmissionRecord {}

impl Default for SubmissionRecord {
    fn default() -> Self {
        Self {
            id: -1,
            fd: -1,
            buf_length: 0,
            buf_base: std::ptr::null_mut(),
            offset: 0,
            is_read: true,
        }
    }
}

impl fmt::Debug for SubmissionRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{id={}, fd={}, length={}, address={:#x}, offset={}, read={}}}",
            self.id, self.fd, self.buf_length, self.buf_base as usize, self.offset, self.is_read
        )
    }
}

/// Raw result header filled by the provider after a submit-and-poll call.
#[repr(C)]
#[derive(Debug)]
pub struct CompletionRecord {
    /// How many pending records the provider handed to the kernel.
    pub nr_submitted: i32,

    /// How many completions were written to the arrays below.
    pub nr_completed: i32,

    /// `res` values of the observed completions.
    pub completed_res: *mut i32,

    /// Slot IDs of the observed completions.
    pub completed_ids: *mut i64,
}

/// Owned storage behind a [`CompletionRecord`].
///
/// The arrays are sized for the whole ID space of a ring, so a single poll can
/// never observe more completions than there is room for.
pub struct CompletionBatch {
    raw: CompletionRecord,
    res: Box<[i32]>,
    ids: Box<[i64]>,
}

// Safety: the raw pointers only ever point into `res` and `ids`, which the
// batch owns.
unsafe impl Send for CompletionBatch {}

impl CompletionBatch {
    /// Creates a batch able to hold `capacity` completions.
    pub fn new(capacity: usize) -> Self {
        let mut res = vec![0i32; capacity].into_boxed_slice();
        let mut ids = vec![0i64; capacity].into_boxed_slice();
        let raw = CompletionRecord {
            nr_submitted: 0,
            nr_completed: 0,
            completed_res: res.as_mut_ptr(),
            completed_ids: ids.as_mut_ptr(),
        };

        Self { raw, res, ids }
    }

    /// Clears the counters before a new poll.
    pub fn reset(&mut self) {
        self.raw.nr_submitted = 0;
        self.raw.nr_completed = 0;
    }

    /// Maximum number of completions the batch can hold.
    pub fn capacity(&self) -> usize {
        self.res.len()
    }

    /// Whether no more completions fit.
    pub fn is_full(&self) -> bool {
        self.completed() >= self.capacity()
    }

    /// Records how many pending submissions were handed to the kernel.
    pub fn set_submitted(&mut self, count: usize) {
        self.raw.nr_submitted = count as i32;
    }

    /// Appends a completion. Returns false when the batch is full.
    pub fn push(&mut self, id: i64, res: i32) -> bool {
        let idx = self.completed();
        if idx >= self.capacity() {
            return false;
        }
        self.res[idx] = res;
        self.ids[idx] = id;
        self.raw.nr_completed += 1;
        true
    }

    /// Number of submissions the provider reported as submitted.
    pub fn submitted(&self) -> usize {
        self.raw.nr_submitted.max(0) as usize
    }

    /// Number of completions in the batch.
    pub fn completed(&self) -> usize {
        (self.raw.nr_completed.max(0) as usize).min(self.capacity())
    }

    /// The `(id, res)` pairs in the order the provider reported them.
    pub fn iter(&self) -> impl Iterator<Item = (i64, i32)> + '_ {
        let n = self.completed();
        self.ids[..n].iter().copied().zip(self.res[..n].iter().copied())
    }

    /// Raw header for providers that write results directly.
    pub fn as_raw_mut(&mut self) -> *mut CompletionRecord {
        &mut self.raw
    }
}

impl fmt::Debug for CompletionBatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CompletionBatch")
            .field("submitted", &self.submitted())
            .field("completed", &self.completed())
            .field("capacity", &self.capacity())
            .finish()
    }
}
