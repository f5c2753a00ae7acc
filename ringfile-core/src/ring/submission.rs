//! Submissions: the unit of work handed to a ring.

use crate::error::{Error, Result};
use crate::ring::buffer::IoBuf;
use crate::ring::layout::SubmissionRecord;
use std::fmt;
use std::os::unix::io::RawFd;

/// Direction of a submission.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    /// Read from the file into the buffer.
    Read,

    /// Write the buffer to the file.
    Write,
}

/// Callback invoked once a submission completes.
///
/// It receives the completion result (bytes transferred, or a negated errno)
/// and gets the buffer back.
pub type CompletionFn = Box<dyn FnOnce(i32, IoBuf) + Send + 'static>;

/// Fails unless `length` bytes fit in a completion result.
pub(crate) fn check_length(length: usize) -> Result<()> {
    if length > i32::MAX as usize {
        return Err(Error::InvalidSubmission(format!(
            "length {length} exceeds {}",
            i32::MAX
        )));
    }
    Ok(())
}

/// A read (or write) request to be added to an [`IoRing`](crate::ring::IoRing).
///
/// The submission owns its buffer from construction until its completion
/// callback runs, so the memory the kernel transfers into stays valid and
/// unmoved for the whole operation.
pub struct Submission {
    kind: OpKind,
    fd: RawFd,
    length: u32,
    offset: u64,
    buf: IoBuf,
    on_completion: CompletionFn,
}

impl Submission {
    /// Creates a read of `buf.remaining()` bytes at `offset`.
    pub fn read<F>(fd: RawFd, offset: u64, buf: IoBuf, on_completion: F) -> Result<Self>
    where
        F: FnOnce(i32, IoBuf) + Send + 'static,
    {
        let length = buf.remaining();
        Self::new(OpKind::Read, fd, length, buf, offset, on_completion)
    }

    /// Creates a submission transferring `length` bytes between the window of
    /// `buf` and the file at `offset`.
    pub fn new<F>(
        kind: OpKind,
        fd: RawFd,
        length: usize,
        buf: IoBuf,
        offset: u64,
        on_completion: F,
    ) -> Result<Self>
    where
        F: FnOnce(i32, IoBuf) + Send + 'static,
    {
        if fd < 0 {
            return Err(Error::InvalidSubmission(format!(
                "invalid file descriptor {fd}, must be >= 0"
            )));
        }
        if length > buf.remaining() {
            return Err(Error::InvalidSubmission(format!(
                "length {length} exceeds the {} bytes available in the buffer",
                buf.remaining()
            )));
        }
        check_length(length)?;
        if offset > i64::MAX as u64 {
            return Err(Error::InvalidSubmission(format!(
                "offset {offset} exceeds {}",
                i64::MAX
            )));
        }

        Ok(Self {
            kind,
            fd,
            length: length as u32,
            offset,
            buf,
            on_completion: Box::new(on_completion),
        })
    }

    /// Direction of the transfer.
    pub fn kind(&self) -> OpKind {
        self.kind
    }

    /// File descriptor the submission operates on.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Number of bytes to transfer.
    pub fn length(&self) -> usize {
        self.length as usize
    }

    /// File offset of the transfer.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// The buffer the transfer uses.
    pub fn buffer(&self) -> &IoBuf {
        &self.buf
    }

    /// Builds the wire record for this submission under slot `id`.
    pub(crate) fn to_record(&mut self, id: usize) -> SubmissionRecord {
        SubmissionRecord {
            id: id as i64,
            fd: self.fd,
            buf_length: self.length as i32,
            buf_base: self.buf.as_mut_ptr(),
            offset: self.offset as i64,
            is_read: self.kind == OpKind::Read,
        }
    }

    /// Runs the completion callback, handing the buffer back.
    pub(crate) fn complete(self, res: i32) {
        (self.on_completion)(res, self.buf);
    }
}

impl fmt::Debug for Submission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Submission")
            .field("kind", &self.kind)
            .field("fd", &self.fd)
            .field("length", &self.length)
            .field("address", &format_args!("{:#x}", self.buf.address()))
            .field("offset", &self.offset)
            .finish()
    }
}
