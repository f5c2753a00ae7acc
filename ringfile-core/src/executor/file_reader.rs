//! Asynchronous reads of an open file.

use crate::error::{AlignmentParam, Error, Result};
use crate::executor::IoExecutor;
use crate::ring::{align_down, align_up, check_length, is_aligned, IoBuf, OpKind, Submission};
use futures::channel::oneshot;
use std::fmt;
use std::future::Future;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use tracing::{debug, warn};

/// A file opened for reading through an [`IoExecutor`].
///
/// Reads may be issued concurrently from any thread. With direct I/O the
/// executor's rings open the file with `O_DIRECT`, and reads go through the
/// alignment handling described on [`read_async`](Self::read_async) and
/// [`read_into_async`](Self::read_into_async).
///
/// The descriptor is closed by [`close`](Self::close), or on drop.
pub struct FileReader {
    path: Arc<Path>,
    executor: IoExecutor,
    direct_io: bool,
    fd: RawFd,
    closed: bool,
}

impl FileReader {
    pub(crate) fn open(executor: IoExecutor, path: &Path) -> Result<Self> {
        let fd = executor.open_file(path, true)?;
        let direct_io = executor.ring_config().direct_io();
        Ok(Self {
            path: Arc::from(path),
            executor,
            direct_io,
            fd,
            closed: false,
        })
    }

    /// Path the reader was opened with.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open descriptor.
    pub fn fd(&self) -> RawFd {
        self.fd
    }

    /// Whether reads use direct I/O.
    pub fn is_direct(&self) -> bool {
        self.direct_io
    }

    /// Reads `length` bytes at `offset`.
    ///
    /// Neither argument has alignment requirements. With direct I/O the read
    /// is widened to the enclosing 512-byte boundaries, so a little more than
    /// asked may be read from the file.
    ///
    /// The returned buffer's window starts at `offset` and holds
    /// `min(length, bytes_read - head)` bytes, where `head` is how far the
    /// widened read starts before `offset` (zero without direct I/O). A read
    /// that ends at or before `offset` yields an empty window, and bytes past
    /// the end of the transfer are never exposed.
    ///
    /// Lengths above `i32::MAX`, after widening, fail with
    /// [`Error::InvalidSubmission`] before any buffer is allocated.
    pub fn read_async(&self, offset: u64, length: usize) -> Result<ReadFuture> {
        if !self.direct_io {
            check_length(length)?;
            return self.submit(ReadWindow::exact(offset, length), IoBuf::new(length));
        }

        let window = ReadWindow::widened(offset, length)?;
        check_length(window.length)?;
        let buf = self.executor.allocate_aligned(window.length)?;
        self.submit(window, buf)
    }

    /// Reads `buf.remaining()` bytes at `offset` into the window of `buf`.
    ///
    /// With direct I/O, the offset, the address of the window and its length
    /// must all be multiples of 512 bytes; otherwise this fails right away
    /// with [`Error::Misaligned`] naming the offending one. Buffers from
    /// [`IoExecutor::allocate_aligned`] satisfy the address requirement.
    ///
    /// On success the window of the returned buffer covers the bytes read.
    pub fn read_into_async(&self, offset: u64, buf: IoBuf) -> Result<ReadFuture> {
        if self.direct_io {
            let address = self.executor.buffer_address(&buf)?;
            if let Some(param) = misalignment(offset, address, buf.remaining()) {
                return Err(Error::Misaligned(param));
            }
        }
        self.submit(ReadWindow::exact(offset, buf.remaining()), buf)
    }

    fn submit(&self, window: ReadWindow, buf: IoBuf) -> Result<ReadFuture> {
        let (tx, rx) = oneshot::channel();
        let pending = PendingRead {
            window,
            base_position: buf.position(),
            direct_io: self.direct_io,
            path: self.path.clone(),
            tx,
        };

        let submission = Submission::new(
            OpKind::Read,
            self.fd,
            window.length,
            buf,
            window.offset,
            move |res, buf| pending.complete(res, buf),
        )?;
        self.executor.submit(submission)?;
        Ok(ReadFuture { rx })
    }

    /// Closes the descriptor.
    pub fn close(mut self) -> Result<()> {
        self.closed = true;
        self.executor.close_file(self.fd)
    }
}

impl Drop for FileReader {
    fn drop(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        match self.executor.close_file(self.fd) {
            Ok(()) => {}
            Err(Error::ExecutorClosed) => {
                debug!("Executor closed before {}, fd {} not closed", self.path.display(), self.fd)
            }
            Err(e) => warn!("Failed to close {}: {}", self.path.display(), e),
        }
    }
}

impl fmt::Debug for FileReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FileReader")
            .field("path", &self.path)
            .field("fd", &self.fd)
            .field("direct_io", &self.direct_io)
            .finish()
    }
}

/// The range actually read, and where the caller's bytes sit inside it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct ReadWindow {
    offset: u64,
    length: usize,
    orig_offset: u64,
    orig_length: usize,
}

impl ReadWindow {
    fn exact(offset: u64, length: usize) -> Self {
        Self {
            offset,
            length,
            orig_offset: offset,
            orig_length: length,
        }
    }

    /// Widens `[offset, offset + length)` to 512-byte boundaries.
    fn widened(offset: u64, length: usize) -> Result<Self> {
        let end = offset
            .checked_add(length as u64)
            .filter(|end| *end <= i64::MAX as u64)
            .ok_or_else(|| {
                Error::InvalidSubmission(format!("read of {length} bytes at {offset} overflows"))
            })?;
        let start = align_down(offset);

        Ok(Self {
            offset: start,
            length: (align_up(end) - start) as usize,
            orig_offset: offset,
            orig_length: length,
        })
    }

    /// Bytes read before the first requested one.
    fn head(&self) -> usize {
        (self.orig_offset - self.offset) as usize
    }

    /// Requested bytes present in a transfer of `transferred` bytes.
    fn visible(&self, transferred: usize) -> usize {
        self.orig_length.min(transferred.saturating_sub(self.head()))
    }
}

/// First direct I/O constraint violated by a read, if any.
fn misalignment(offset: u64, address: usize, length: usize) -> Option<AlignmentParam> {
    if !is_aligned(offset) {
        Some(AlignmentParam::Offset)
    } else if !is_aligned(address as u64) {
        Some(AlignmentParam::BufferAddress)
    } else if !is_aligned(length as u64) {
        Some(AlignmentParam::BufferLength)
    } else {
        None
    }
}

/// Completion state of a read in flight.
struct PendingRead {
    window: ReadWindow,
    base_position: usize,
    direct_io: bool,
    path: Arc<Path>,
    tx: oneshot::Sender<Result<IoBuf>>,
}

impl PendingRead {
    fn complete(self, res: i32, buf: IoBuf) {
        let result = self.resolve(res, buf);
        // The caller may have dropped the future.
        let _ = self.tx.send(result);
    }

    fn resolve(&self, res: i32, mut buf: IoBuf) -> Result<IoBuf> {
        if res < 0 {
            let errno = -res;
            // EINVAL is what the kernel reports for misaligned direct I/O.
            if errno == libc::EINVAL && self.direct_io {
                if let Some(param) = misalignment(self.window.offset, buf.address(), buf.remaining())
                {
                    return Err(Error::Misaligned(param));
                }
            }
            return Err(Error::io_at("read", errno, &*self.path));
        }

        let start = self.base_position + self.window.head();
        let visible = self.window.visible(res as usize);
        buf.set_limit(start + visible);
        buf.set_position(start);
        Ok(buf)
    }
}

/// Result of an asynchronous read.
///
/// Resolves to the buffer, its window set to the bytes requested. Works with
/// any async runtime; [`wait`](Self::wait) blocks the current thread instead.
#[must_use = "futures do nothing unless awaited"]
pub struct ReadFuture {
    rx: oneshot::Receiver<Result<IoBuf>>,
}

impl ReadFuture {
    /// Blocks until the read completes.
    pub fn wait(self) -> Result<IoBuf> {
        futures::executor::block_on(self)
    }
}

impl Future for ReadFuture {
    type Output = Result<IoBuf>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.rx).poll(cx) {
            Poll::Ready(Ok(result)) => Poll::Ready(result),
            // The submission was dropped without completing: its loop is gone.
            Poll::Ready(Err(oneshot::Canceled)) => Poll::Ready(Err(Error::ExecutorClosed)),
            Poll::Pending => Poll::Pending,
        }
    }
}

impl fmt::Debug for ReadFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReadFuture").finish_non_exhaustive()
    }
}
