//! Blocking provider.
//!
//! This provider performs every submission with a positional `pread`/`pwrite`
//! on the calling thread and reports it complete in the same call. It needs no
//! kernel support beyond plain file I/O, which makes it usable on any Unix and
//! inside sandboxes that filter io_uring.

use crate::error::Result;
use crate::provider::{FileOps, NativeProvider, RingBackend};
use crate::ring::{CompletionBatch, RingConfig, SubmissionRecord};
use nix::errno::Errno;
use std::fs::OpenOptions;
use std::os::unix::fs::OpenOptionsExt;
use std::os::unix::io::IntoRawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::debug;

/// Provider completing submissions synchronously with positional syscalls.
#[derive(Debug, Default, Clone)]
pub struct BlockingProvider {
    _private: (),
}

impl BlockingProvider {
    /// Creates a blocking provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl NativeProvider for BlockingProvider {
    fn name(&self) -> &'static str {
        "blocking"
    }

    fn create_ring(
        &self,
        config: &RingConfig,
    ) -> Result<(Box<dyn RingBackend>, Arc<dyn FileOps>)> {
        debug!("Created blocking ring (depth={})", config.depth());
        Ok((Box::new(BlockingBackend), Arc::new(BlockingFileOps)))
    }
}

struct BlockingBackend;

impl BlockingBackend {
    /// Transfers one record, returning bytes moved or `-errno`.
    fn perform(record: &SubmissionRecord) -> i32 {
        let len = record.buf_length as usize;
        let offset = record.offset as libc::off_t;

        loop {
            // Safety: the record points into a buffer owned by the submission
            // in the slot table, valid for `buf_length` bytes.
            let res = unsafe {
                if record.is_read {
                    libc::pread(record.fd, record.buf_base.cast(), len, offset)
                } else {
                    libc::pwrite(record.fd, record.buf_base.cast(), len, offset)
                }
            };

            if res >= 0 {
                return res as i32;
            }
            match Errno::last() {
                Errno::EINTR => continue,
                errno => return -(errno as i32),
            }
        }
    }
}

impl RingBackend for BlockingBackend {
    fn submit_and_check_completions(
        &mut self,
        records: &[SubmissionRecord],
        batch: &mut CompletionBatch,
    ) -> Result<()> {
        let mut submitted = 0;
        for record in records {
            if batch.is_full() {
                break;
            }
            let res = Self::perform(record);
            batch.push(record.id, res);
            submitted += 1;
        }
        batch.set_submitted(submitted);
        Ok(())
    }

    fn destroy(&mut self) {
        debug!("Destroyed blocking ring");
    }
}

struct BlockingFileOps;

impl FileOps for BlockingFileOps {
    fn open_file(&self, path: &Path, read_only: bool, direct_io: bool) -> i32 {
        let mut options = OpenOptions::new();
        options.read(true).write(!read_only);
        if direct_io {
            options.custom_flags(libc::O_DIRECT);
        }

        match options.open(path) {
            Ok(file) => file.into_raw_fd(),
            Err(e) => -e.raw_os_error().unwrap_or(libc::EIO),
        }
    }

    fn close_file(&self, fd: i32) -> i32 {
        match nix::unistd::close(fd) {
            Ok(()) => 0,
            Err(errno) => -(errno as i32),
        }
    }
}
