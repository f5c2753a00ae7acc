//! Submission/completion ring.
//!
//! This module implements the ring every event loop drives: a fixed-capacity
//! slot table assigning IDs to submissions, the binary records exchanged with
//! the native provider, and [`IoRing`] itself, which admits submissions and
//! runs the submit-then-reap protocol.

mod buffer;
mod config;
mod io_ring;
mod layout;
mod slot;
mod submission;

pub use buffer::IoBuf;
pub use config::{RingConfig, RingConfigBuilder, DEFAULT_RING_DEPTH, MAX_RING_DEPTH};
pub use io_ring::{IoRing, RingFiles};
pub use layout::{CompletionBatch, CompletionRecord, SubmissionRecord, SUBMISSION_RECORD_STRIDE};
pub use slot::SlotTable;
pub(crate) use submission::check_length;
pub use submission::{CompletionFn, OpKind, Submission};

/// Alignment direct I/O requires for offsets, buffer addresses and lengths.
pub const DIRECT_IO_ALIGNMENT: usize = 512;

/// Rounds `value` down to a multiple of [`DIRECT_IO_ALIGNMENT`].
pub fn align_down(value: u64) -> u64 {
    value & !(DIRECT_IO_ALIGNMENT as u64 - 1)
}

/// Rounds `value` up to a multiple of [`DIRECT_IO_ALIGNMENT`].
pub fn align_up(value: u64) -> u64 {
    align_down(value + DIRECT_IO_ALIGNMENT as u64 - 1)
}

/// Whether `value` is a multiple of [`DIRECT_IO_ALIGNMENT`].
pub fn is_aligned(value: u64) -> bool {
    value % DIRECT_IO_ALIGNMENT as u64 == 0
}
