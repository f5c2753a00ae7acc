//! io_uring provider.
//!
//! Ring submissions map one-to-one onto `IORING_OP_READ`/`IORING_OP_WRITE`
//! entries whose `user_data` is the slot ID. Opening and closing files goes
//! through a small, separate ring so it keeps working when the data ring is
//! set up for I/O polling (which only accepts pollable operations).

use crate::error::{Error, Result};
use crate::provider::{FileOps, NativeProvider, RingBackend};
use crate::ring::{CompletionBatch, RingConfig, SubmissionRecord};
use io_uring::{opcode, squeue, types, IoUring};
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, trace};

/// Idle time before the kernel submission thread goes to sleep.
const SQ_POLL_IDLE_MS: u32 = 2000;

/// Entries of the ring used for open/close.
const FILE_OPS_DEPTH: u32 = 4;

/// Provider backed by the kernel's io_uring interface.
#[derive(Debug, Default)]
pub struct UringProvider {
    _private: (),
}

impl UringProvider {
    /// Checks that io_uring rings can be created in this process.
    pub fn probe() -> std::io::Result<Self> {
        let ring = IoUring::new(2)?;
        drop(ring);
        Ok(Self::default())
    }
}

impl NativeProvider for UringProvider {
    fn name(&self) -> &'static str {
        "io_uring"
    }

    fn create_ring(
        &self,
        config: &RingConfig,
    ) -> Result<(Box<dyn RingBackend>, Arc<dyn FileOps>)> {
        let mut builder = IoUring::builder();
        if config.sq_polling() {
            builder.setup_sqpoll(SQ_POLL_IDLE_MS);
        }
        if config.io_polling() {
            builder.setup_iopoll();
        }
        let ring = builder.build(config.depth())?;
        let file_ring = IoUring::new(FILE_OPS_DEPTH)?;

        debug!(
            "Created io_uring (depth={}, sq_polling={}, io_polling={})",
            config.depth(),
            config.sq_polling(),
            config.io_polling()
        );

        let backend = UringBackend {
            ring: Some(ring),
            io_polling: config.io_polling(),
        };
        let files = UringFileOps {
            ring: Mutex::new(file_ring),
        };
        Ok((Box::new(backend), Arc::new(files)))
    }
}

struct UringBackend {
    ring: Option<IoUring>,
    io_polling: bool,
}

fn to_entry(record: &SubmissionRecord) -> squeue::Entry {
    let fd = types::Fd(record.fd);
    let len = record.buf_length as u32;
    let entry = if record.is_read {
        opcode::Read::new(fd, record.buf_base, len)
            .offset(record.offset as u64)
            .build()
    } else {
        opcode::Write::new(fd, record.buf_base as *const u8, len)
            .offset(record.offset as u64)
            .build()
    };
    entry.user_data(record.id as u64)
}

/// `io_uring_enter` failures after which queued entries are still retried by
/// the next call.
fn is_transient(e: &std::io::Error) -> bool {
    matches!(
        e.raw_os_error(),
        Some(libc::EINTR) | Some(libc::EAGAIN) | Some(libc::EBUSY)
    )
}

impl RingBackend for UringBackend {
    fn submit_and_check_completions(
        &mut self,
        records: &[SubmissionRecord],
        batch: &mut CompletionBatch,
    ) -> Result<()> {
        let ring = self.ring.as_mut().ok_or(Error::RingClosed)?;

        let mut submitted = 0;
        {
            let mut sq = ring.submission();
            for record in records {
                if sq.is_full() {
                    break;
                }
                let entry = to_entry(record);
                // Safety: the buffer belongs to the submission parked in the
                // slot table, which keeps it alive until the completion for
                // this ID is reaped.
                if unsafe { sq.push(&entry) }.is_err() {
                    break;
                }
                submitted += 1;
            }
        }
        batch.set_submitted(submitted);

        // Entries left over from a failed or partial io_uring_enter sit in the
        // SQ already counted as submitted; they must be flushed even when no
        // new record arrived.
        if !ring.submission().is_empty() || self.io_polling {
            match ring.submit() {
                Ok(_) => {}
                Err(e) if is_transient(&e) => trace!("io_uring_enter: {}", e),
                Err(e) => return Err(Error::Os(e)),
            }
        }

        let mut cq = ring.completion();
        while !batch.is_full() {
            match cq.next() {
                Some(cqe) => {
                    batch.push(cqe.user_data() as i64, cqe.result());
                }
                None => break,
            }
        }
        Ok(())
    }

    fn destroy(&mut self) {
        if self.ring.take().is_some() {
            debug!("Destroyed io_uring");
        }
    }
}

struct UringFileOps {
    ring: Mutex<IoUring>,
}

impl UringFileOps {
    /// Runs a single entry to completion and returns its result.
    fn run(&self, entry: squeue::Entry) -> i32 {
        let mut ring = match self.ring.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };

        // Safety: callers keep everything the entry points at alive until
        // this function returns, and it only returns once the entry completed
        // or was never submitted.
        if unsafe { ring.submission().push(&entry) }.is_err() {
            return -libc::EBUSY;
        }

        loop {
            match ring.submit_and_wait(1) {
                Ok(_) => {}
                Err(e) if is_transient(&e) => continue,
                Err(e) => return -e.raw_os_error().unwrap_or(libc::EIO),
            }
            if let Some(cqe) = ring.completion().next() {
                return cqe.result();
            }
        }
    }
}

impl FileOps for UringFileOps {
    fn open_file(&self, path: &Path, read_only: bool, direct_io: bool) -> i32 {
        let c_path = match CString::new(path.as_os_str().as_bytes()) {
            Ok(p) => p,
            Err(_) => return -libc::EINVAL,
        };

        let mut flags = libc::O_CLOEXEC;
        flags |= if read_only { libc::O_RDONLY } else { libc::O_RDWR };
        if direct_io {
            flags |= libc::O_DIRECT;
        }

        let entry = opcode::OpenAt::new(types::Fd(libc::AT_FDCWD), c_path.as_ptr())
            .flags(flags)
            .build();
        self.run(entry)
    }

    fn close_file(&self, fd: i32) -> i32 {
        self.run(opcode::Close::new(types::Fd(fd)).build())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn provider() -> Option<UringProvider> {
        match UringProvider::probe() {
            Ok(p) => Some(p),
            Err(e) => {
                println!("Skipping io_uring test - {}", e);
                None
            }
        }
    }

    #[test]
    fn test_read_through_backend() {
        let Some(provider) = provider() else { return };

        let path = std::env::temp_dir().join(format!("ringfile-uring-{}", uuid::Uuid::new_v4()));
        let content = "line one\nline two\nline three\n".repeat(50);
        std::fs::File::create(&path)
            .unwrap()
            .write_all(content.as_bytes())
            .unwrap();

        let config = RingConfig::buffered(4).unwrap();
        let (mut backend, files) = provider.create_ring(&config).unwrap();
        let fd = files.open_file(&path, true, false);
        assert!(fd >= 0, "open failed: {}", fd);

        let mut buf = vec![0u8; 64];
        let record = SubmissionRecord {
            id: 3,
            fd,
            buf_length: 64,
            buf_base: buf.as_mut_ptr(),
            offset: 9,
            is_read: true,
        };

        let mut batch = CompletionBatch::new(8);
        backend
            .submit_and_check_completions(&[record], &mut batch)
            .unwrap();
        assert_eq!(batch.submitted(), 1);

        let mut completions: Vec<(i64, i32)> = batch.iter().collect();
        while completions.is_empty() {
            batch.reset();
            backend.submit_and_check_completions(&[], &mut batch).unwrap();
            completions.extend(batch.iter());
        }

        assert_eq!(completions, vec![(3, 64)]);
        assert_eq!(&buf[..], &content.as_bytes()[9..73]);

        assert_eq!(files.close_file(fd), 0);
        backend.destroy();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_queued_entries_are_flushed_without_new_records() {
        let Some(provider) = provider() else { return };

        let path = std::env::temp_dir().join(format!("ringfile-uring-{}", uuid::Uuid::new_v4()));
        std::fs::File::create(&path)
            .unwrap()
            .write_all(b"0123456789")
            .unwrap();

        let (_, files) = provider
            .create_ring(&RingConfig::buffered(4).unwrap())
            .unwrap();
        let fd = files.open_file(&path, true, false);
        assert!(fd >= 0, "open failed: {}", fd);

        let mut backend = UringBackend {
            ring: Some(IoUring::new(4).unwrap()),
            io_polling: false,
        };

        // Queue an entry without entering the kernel, as after an EAGAIN.
        let mut buf = [0u8; 4];
        let record = SubmissionRecord {
            id: 1,
            fd,
            buf_length: 4,
            buf_base: buf.as_mut_ptr(),
            offset: 2,
            is_read: true,
        };
        let entry = to_entry(&record);
        unsafe {
            backend
                .ring
                .as_mut()
                .unwrap()
                .submission()
                .push(&entry)
                .unwrap();
        }

        let deadline = std::time::Instant::now() + std::time::Duration::from_secs(5);
        let mut batch = CompletionBatch::new(4);
        let mut completions = Vec::new();
        while completions.is_empty() {
            assert!(std::time::Instant::now() < deadline, "queued entry never completed");
            batch.reset();
            backend.submit_and_check_completions(&[], &mut batch).unwrap();
            completions.extend(batch.iter());
        }

        assert_eq!(completions, vec![(1, 4)]);
        assert_eq!(&buf, b"2345");

        assert_eq!(files.close_file(fd), 0);
        backend.destroy();
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn test_open_missing_file_returns_errno() {
        let Some(provider) = provider() else { return };

        let (mut backend, files) = provider
            .create_ring(&RingConfig::buffered(2).unwrap())
            .unwrap();
        let res = files.open_file(Path::new("/nonexistent/ringfile/file"), true, false);
        assert_eq!(res, -libc::ENOENT);
        backend.destroy();
    }
}
