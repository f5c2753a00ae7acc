//! The ring: admission control plus the submit-then-reap protocol.

use crate::error::{is_file_errno, Error, Result};
use crate::provider::{self, FileOps, NativeProvider, RingBackend};
use crate::ring::config::RingConfig;
use crate::ring::layout::CompletionBatch;
use crate::ring::slot::SlotTable;
use crate::ring::submission::Submission;
use crossbeam_utils::Backoff;
use nix::errno::Errno;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, error, trace, warn};

/// A submission/completion ring.
///
/// The ring is single-threaded: it is meant to be owned by one event loop,
/// which adds submissions, calls
/// [`submit_and_check_completions`](Self::submit_and_check_completions) and
/// thereby runs the completion callbacks on its own thread.
pub struct IoRing {
    config: RingConfig,
    slots: SlotTable,
    backend: Box<dyn RingBackend>,
    files: RingFiles,
    batch: CompletionBatch,
    /// Set once a poll failed; the ring may have lost track of completions.
    failed: bool,
    closed: bool,
}

impl IoRing {
    /// Creates a ring with the process-wide native provider.
    pub fn create(config: RingConfig) -> Result<Self> {
        Self::with_provider(provider::instance().as_ref(), config)
    }

    /// Creates a ring with the given provider.
    pub fn with_provider(provider: &dyn NativeProvider, config: RingConfig) -> Result<Self> {
        let (backend, ops) = provider.create_ring(&config)?;
        let slots = SlotTable::new(config.depth() as usize);
        let batch = CompletionBatch::new(slots.max_in_flight());

        debug!(
            "Created ring (provider={}, depth={}, direct_io={})",
            provider.name(),
            config.depth(),
            config.direct_io()
        );

        Ok(Self {
            config,
            slots,
            backend,
            files: RingFiles {
                ops,
                direct_io: config.direct_io(),
            },
            batch,
            failed: false,
            closed: false,
        })
    }

    /// The configuration the ring was created with.
    pub fn config(&self) -> &RingConfig {
        &self.config
    }

    /// Submissions handed to the kernel whose completion wasn't observed yet.
    pub fn in_flight(&self) -> usize {
        self.slots.in_flight()
    }

    /// Maximum number of pending plus in-flight submissions.
    pub fn max_in_flight(&self) -> usize {
        self.slots.max_in_flight()
    }

    /// Submissions added but not handed to the kernel yet.
    pub fn pending_submissions(&self) -> usize {
        self.slots.pending()
    }

    /// How many more submissions [`add`](Self::add) accepts right now.
    pub fn submission_slots_available(&self) -> usize {
        if self.closed {
            0
        } else {
            self.slots.room()
        }
    }

    /// Whether [`close`](Self::close) ran.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Adds a submission to be handed to the kernel by the next
    /// [`submit_and_check_completions`](Self::submit_and_check_completions).
    ///
    /// When the ring is full or closed the submission is handed back and
    /// nothing changes.
    pub fn add(&mut self, submission: Submission) -> Result<(), Submission> {
        if self.closed {
            return Err(submission);
        }
        self.slots.add(submission).map(|_| ())
    }

    /// Hands the pending submissions to the kernel and runs the callbacks of
    /// the completions that are ready, without waiting for any.
    ///
    /// Returns the number of completions observed.
    pub fn submit_and_check_completions(&mut self) -> Result<usize> {
        if self.closed {
            return Err(Error::RingClosed);
        }
        let result = self.poll();
        if result.is_err() {
            self.failed = true;
        }
        result
    }

    fn poll(&mut self) -> Result<usize> {
        self.batch.reset();
        self.backend
            .submit_and_check_completions(self.slots.pending_records(), &mut self.batch)?;

        let submitted = self.batch.submitted();
        if submitted > self.slots.pending() {
            return Err(Error::Fatal(format!(
                "provider reported {} submissions with only {} pending",
                submitted,
                self.slots.pending()
            )));
        }
        self.slots.on_submitted(submitted);

        // Every reported completion was already reaped from the kernel, so
        // the rest of the batch is processed even after a bad entry.
        let completed = self.batch.completed();
        let mut first_error = None;
        for (id, res) in self.batch.iter() {
            if let Err(e) = self.slots.on_completed(id, res) {
                first_error.get_or_insert(e);
            }
        }

        if submitted > 0 || completed > 0 {
            trace!(
                "Ring poll: submitted={}, completed={}, in_flight={}",
                submitted,
                completed,
                self.slots.in_flight()
            );
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(completed),
        }
    }

    /// Opens a file with the ring's direct I/O setting.
    pub fn open_file(&self, path: &Path, read_only: bool) -> Result<RawFd> {
        if self.closed {
            return Err(Error::RingClosed);
        }
        self.files.open(path, read_only)
    }

    /// Closes a descriptor opened with [`open_file`](Self::open_file).
    pub fn close_file(&self, fd: RawFd) -> Result<()> {
        if self.closed {
            return Err(Error::RingClosed);
        }
        self.files.close(fd)
    }

    /// Handle for opening and closing files from another thread.
    pub fn files(&self) -> RingFiles {
        self.files.clone()
    }

    /// Closes the ring.
    ///
    /// Pending submissions complete with `-ECANCELED`; in-flight ones are
    /// reaped before the kernel resources are released, so no buffer is freed
    /// while the kernel may still write into it. If an earlier poll failed
    /// and completions stop arriving, the remaining in-flight submissions are
    /// leaked instead of waited for. Calling this more than once has no
    /// further effect.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;

        let cancelled = self.slots.cancel_pending(-libc::ECANCELED);
        if cancelled > 0 {
            debug!("Cancelled {} pending submissions", cancelled);
        }

        if self.slots.in_flight() > 0 {
            warn!(
                "Draining {} in-flight submissions before closing the ring",
                self.slots.in_flight()
            );
            let backoff = Backoff::new();
            while self.slots.in_flight() > 0 {
                match self.poll() {
                    // After a failure some completions may never be reported.
                    Ok(0) if self.failed && backoff.is_completed() => {
                        let abandoned = self.slots.abandon();
                        warn!(
                            "Abandoned {} in-flight submissions of a failed ring",
                            abandoned
                        );
                        break;
                    }
                    Ok(0) => backoff.snooze(),
                    Ok(_) => backoff.reset(),
                    Err(e) => {
                        error!("Failed to drain ring: {}", e);
                        let abandoned = self.slots.abandon();
                        warn!("Abandoned {} in-flight submissions", abandoned);
                        break;
                    }
                }
            }
        }

        self.backend.destroy();
        debug!("Closed ring");
    }
}

impl Drop for IoRing {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for IoRing {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoRing")
            .field("config", &self.config)
            .field("slots", &self.slots)
            .field("failed", &self.failed)
            .field("closed", &self.closed)
            .finish()
    }
}

/// Opens and closes files for a ring.
///
/// Obtained from [`IoRing::files`]; usable from any thread, independently of
/// the thread driving the ring.
#[derive(Clone)]
pub struct RingFiles {
    ops: Arc<dyn FileOps>,
    direct_io: bool,
}

impl RingFiles {
    /// Opens `path`, with `O_DIRECT` when the ring uses direct I/O.
    pub fn open(&self, path: &Path, read_only: bool) -> Result<RawFd> {
        let res = self.ops.open_file(path, read_only, self.direct_io);
        if res < 0 {
            return Err(translate("open", -res, Some(path)));
        }
        debug!("Opened {} (fd={})", path.display(), res);
        Ok(res)
    }

    /// Closes `fd`.
    pub fn close(&self, fd: RawFd) -> Result<()> {
        let res = self.ops.close_file(fd);
        if res < 0 {
            return Err(translate("close", -res, None));
        }
        debug!("Closed fd {}", fd);
        Ok(())
    }

    /// Whether files are opened for direct I/O.
    pub fn direct_io(&self) -> bool {
        self.direct_io
    }
}

impl fmt::Debug for RingFiles {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RingFiles")
            .field("direct_io", &self.direct_io)
            .finish()
    }
}

/// Maps an open/close errno onto the error taxonomy.
fn translate(op: &'static str, errno: i32, path: Option<&Path>) -> Error {
    if is_file_errno(errno) {
        return Error::Io {
            op,
            errno,
            path: path.map(Path::to_path_buf),
        };
    }
    Error::Fatal(format!(
        "unexpected {} failure: {}",
        op,
        Errno::from_i32(errno)
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provider::testing::ScriptedProvider;
    use crate::ring::buffer::IoBuf;
    use std::sync::Mutex;

    type Log = Arc<Mutex<Vec<(u64, i32, Vec<u8>)>>>;

    fn read(offset: u64, len: usize, log: &Log) -> Submission {
        let log = log.clone();
        Submission::read(3, offset, IoBuf::new(len), move |res, buf| {
            let n = res.max(0) as usize;
            log.lock().unwrap().push((offset, res, buf[..n].to_vec()));
        })
        .unwrap()
    }

    fn ring(provider: &ScriptedProvider, depth: u32) -> IoRing {
        IoRing::with_provider(provider, RingConfig::buffered(depth).unwrap()).unwrap()
    }

    #[test]
    fn test_depth_two_admission_and_partial_reap() {
        let provider = ScriptedProvider::with_content(b"abcdefgh".to_vec());
        provider.state().complete_per_call = Some(1);
        let mut ring = ring(&provider, 2);
        let log = Log::default();

        assert_eq!(ring.max_in_flight(), 4);
        assert!(ring.add(read(0, 2, &log)).is_ok());
        assert!(ring.add(read(4, 2, &log)).is_ok());
        assert!(ring.add(read(6, 2, &log)).is_err());
        assert_eq!(ring.pending_submissions(), 2);
        assert_eq!(ring.submission_slots_available(), 0);

        assert_eq!(ring.submit_and_check_completions().unwrap(), 1);
        assert_eq!(ring.pending_submissions(), 0);
        assert_eq!(ring.in_flight(), 1);
        assert_eq!(*log.lock().unwrap(), vec![(0, 2, b"ab".to_vec())]);

        assert_eq!(ring.submit_and_check_completions().unwrap(), 1);
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(log.lock().unwrap()[1], (4, 2, b"ef".to_vec()));
    }

    #[test]
    fn test_partial_submission_keeps_remaining_pending() {
        let provider = ScriptedProvider::with_content(vec![7u8; 64]);
        provider.state().accept_per_call = Some(1);
        let mut ring = ring(&provider, 4);
        let log = Log::default();

        for offset in [0, 8, 16] {
            ring.add(read(offset, 4, &log)).unwrap();
        }

        ring.submit_and_check_completions().unwrap();
        assert_eq!(ring.pending_submissions(), 2);
        ring.submit_and_check_completions().unwrap();
        ring.submit_and_check_completions().unwrap();
        assert_eq!(ring.pending_submissions(), 0);

        let offsets: Vec<i64> = provider.state().seen.iter().map(|r| r.offset).collect();
        assert_eq!(offsets, vec![0, 8, 16]);
        assert_eq!(log.lock().unwrap().len(), 3);
    }

    #[test]
    fn test_over_reported_submissions_are_fatal() {
        let provider = ScriptedProvider::default();
        provider.state().over_report = true;
        let mut ring = ring(&provider, 2);
        let log = Log::default();
        ring.add(read(0, 1, &log)).unwrap();

        let err = ring.submit_and_check_completions().unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
    }

    #[test]
    fn test_backend_errors_propagate() {
        let provider = ScriptedProvider::default();
        provider.state().fail_next = true;
        let mut ring = ring(&provider, 2);

        assert!(matches!(
            ring.submit_and_check_completions(),
            Err(Error::Fatal(_))
        ));
        assert_eq!(ring.submit_and_check_completions().unwrap(), 0);
    }

    #[test]
    fn test_close_cancels_pending_and_drains_in_flight() {
        let provider = ScriptedProvider::with_content(b"0123456789".to_vec());
        {
            let mut state = provider.state();
            state.accept_per_call = Some(2);
            state.complete_per_call = Some(1);
        }
        let mut ring = ring(&provider, 4);
        let log = Log::default();

        for offset in [0, 2, 4, 6] {
            ring.add(read(offset, 2, &log)).unwrap();
        }
        ring.submit_and_check_completions().unwrap();
        assert_eq!(ring.in_flight(), 1);
        assert_eq!(ring.pending_submissions(), 2);

        ring.close();
        assert!(ring.is_closed());
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(ring.pending_submissions(), 0);
        assert_eq!(provider.state().destroyed, 1);

        let mut results: Vec<(u64, i32)> =
            log.lock().unwrap().iter().map(|(o, r, _)| (*o, *r)).collect();
        results.sort();
        assert_eq!(
            results,
            vec![
                (0, 2),
                (2, 2),
                (4, -libc::ECANCELED),
                (6, -libc::ECANCELED)
            ]
        );

        // Closing again, or dropping, does not tear down a second time.
        ring.close();
        drop(ring);
        assert_eq!(provider.state().destroyed, 1);
    }

    #[test]
    fn test_bad_completion_does_not_hide_the_rest_of_the_batch() {
        let provider = ScriptedProvider::with_content(b"abcd".to_vec());
        provider.state().bogus_completions = vec![(1000, 0)];
        let mut ring = ring(&provider, 2);
        let log = Log::default();
        ring.add(read(0, 2, &log)).unwrap();

        let err = ring.submit_and_check_completions().unwrap_err();
        assert!(matches!(err, Error::Fatal(_)));
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(*log.lock().unwrap(), vec![(0, 2, b"ab".to_vec())]);

        ring.close();
        assert_eq!(provider.state().destroyed, 1);
    }

    #[test]
    fn test_close_after_failure_gives_up_on_lost_completions() {
        let provider = ScriptedProvider::with_content(b"abcd".to_vec());
        {
            let mut state = provider.state();
            state.bogus_completions = vec![(1000, 0)];
            state.complete_per_call = Some(0);
        }
        let mut ring = ring(&provider, 2);
        let log = Log::default();
        ring.add(read(0, 1, &log)).unwrap();
        ring.add(read(1, 1, &log)).unwrap();

        assert!(ring.submit_and_check_completions().is_err());
        assert_eq!(ring.in_flight(), 2);

        // The provider never reports the two reads again.
        ring.close();
        assert!(ring.is_closed());
        assert_eq!(ring.in_flight(), 0);
        assert_eq!(provider.state().destroyed, 1);
        assert!(log.lock().unwrap().is_empty());
    }

    #[test]
    fn test_closed_ring_fails_fast() {
        let provider = ScriptedProvider::default();
        let mut ring = ring(&provider, 2);
        ring.close();

        let log = Log::default();
        assert!(ring.add(read(0, 1, &log)).is_err());
        assert_eq!(ring.submission_slots_available(), 0);
        assert!(matches!(
            ring.submit_and_check_completions(),
            Err(Error::RingClosed)
        ));
        assert!(matches!(
            ring.open_file(Path::new("/tmp/x"), true),
            Err(Error::RingClosed)
        ));
        assert!(matches!(ring.close_file(3), Err(Error::RingClosed)));
    }

    #[test]
    fn test_drop_closes_ring() {
        let provider = ScriptedProvider::default();
        drop(ring(&provider, 2));
        assert_eq!(provider.state().destroyed, 1);
    }

    #[test]
    fn test_open_and_close_translate_errors() {
        let provider = ScriptedProvider::default();
        let ring = IoRing::with_provider(&provider, RingConfig::direct(2).unwrap()).unwrap();

        assert_eq!(ring.open_file(Path::new("/data/file"), true).unwrap(), 3);
        assert_eq!(
            provider.state().opened,
            vec![(Path::new("/data/file").to_path_buf(), true, true)]
        );

        provider.state().open_result = -libc::ENOENT;
        match ring.open_file(Path::new("/data/missing"), true).unwrap_err() {
            Error::Io { op, errno, path } => {
                assert_eq!(op, "open");
                assert_eq!(errno, libc::ENOENT);
                assert_eq!(path.as_deref(), Some(Path::new("/data/missing")));
            }
            other => panic!("unexpected error: {other:?}"),
        }

        provider.state().open_result = -libc::EFAULT;
        assert!(matches!(
            ring.open_file(Path::new("/data/file"), true),
            Err(Error::Fatal(_))
        ));

        ring.close_file(3).unwrap();
        provider.state().close_result = -libc::EIO;
        assert!(matches!(
            ring.close_file(3),
            Err(Error::Io { op: "close", .. })
        ));
        provider.state().close_result = -libc::EBADF;
        assert!(matches!(ring.close_file(3), Err(Error::Fatal(_))));
    }
}
