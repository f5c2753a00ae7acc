//! Event loop driving a single ring.
//!
//! Each loop owns one [`IoRing`] and runs it on a dedicated thread. Other
//! threads hand it submissions through a lock-free queue; the loop moves them
//! into the ring as room allows, submits, reaps completions and parks briefly
//! when it has nothing to wait for.

use crate::arch::{ThreadBuilder, WorkerThread};
use crate::error::{Error, Result};
use crate::executor::blocking::BlockingWorker;
use crate::executor::lock;
use crate::provider::NativeProvider;
use crate::ring::{IoRing, RingConfig, RingFiles, Submission};
use crossbeam_queue::SegQueue;
use crossbeam_utils::sync::{Parker, Unparker};
use crossbeam_utils::Backoff;
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;
use tracing::{error, info};

static LOOP_ID: AtomicUsize = AtomicUsize::new(0);

/// State shared between the loop thread and submitters.
struct Shared {
    queue: SegQueue<Submission>,
    stopped: AtomicBool,
    /// Submitters between their `stopped` check and their push.
    submitting: AtomicUsize,
    parked: AtomicBool,
    unparker: Unparker,
}

/// An event loop thread and its ring.
pub(crate) struct EventLoop {
    name: String,
    shared: Arc<Shared>,
    files: RingFiles,
    worker: BlockingWorker,
    thread: Mutex<Option<WorkerThread<()>>>,
}

impl EventLoop {
    /// Creates a ring with `provider` and starts a loop thread driving it.
    pub fn start(
        provider: &dyn NativeProvider,
        config: RingConfig,
        idle_park: Duration,
        threads: &mut ThreadBuilder,
    ) -> Result<Self> {
        let id = LOOP_ID.fetch_add(1, Ordering::Relaxed);
        let name = format!("ringfile-loop-{}", id);

        let ring = IoRing::with_provider(provider, config)?;
        let files = ring.files();

        let parker = Parker::new();
        let shared = Arc::new(Shared {
            queue: SegQueue::new(),
            stopped: AtomicBool::new(false),
            submitting: AtomicUsize::new(0),
            parked: AtomicBool::new(false),
            unparker: parker.unparker().clone(),
        });

        let worker = BlockingWorker::spawn(format!("ringfile-files-{}", id))?;

        let thread = {
            let shared = shared.clone();
            let name = name.clone();
            threads.spawn(name.clone(), move || drive(&name, ring, &shared, &parker, idle_park))?
        };
        info!(
            "Started event loop {} (depth={}, core={:?})",
            name,
            config.depth(),
            thread.core_id()
        );

        Ok(Self {
            name,
            shared,
            files,
            worker,
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Queues a submission for the loop thread.
    ///
    /// Once this returns `Ok` the submission's callback is guaranteed to run,
    /// even if the loop is closed concurrently.
    pub fn submit(&self, submission: Submission) -> Result<()> {
        // The loop thread doesn't exit while a submitter is registered, and a
        // submitter registered after the loop decided to exit sees `stopped`.
        self.shared.submitting.fetch_add(1, Ordering::SeqCst);
        if self.shared.stopped.load(Ordering::SeqCst) {
            self.shared.submitting.fetch_sub(1, Ordering::SeqCst);
            return Err(Error::ExecutorClosed);
        }

        self.shared.queue.push(submission);
        if self.shared.parked.load(Ordering::SeqCst) {
            self.shared.unparker.unpark();
        }
        self.shared.submitting.fetch_sub(1, Ordering::SeqCst);
        Ok(())
    }

    /// Opens a file on the blocking worker, waiting for the result.
    pub fn open_file(&self, path: PathBuf, read_only: bool) -> Result<RawFd> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::ExecutorClosed);
        }
        let files = self.files.clone();
        self.worker.run(move || files.open(&path, read_only))?
    }

    /// Closes a file on the blocking worker, waiting for the result.
    pub fn close_file(&self, fd: RawFd) -> Result<()> {
        if self.shared.stopped.load(Ordering::SeqCst) {
            return Err(Error::ExecutorClosed);
        }
        let files = self.files.clone();
        self.worker.run(move || files.close(fd))?
    }

    /// Stops the loop once queued and in-flight work is done, then joins its
    /// threads.
    pub fn close(&self) {
        self.shared.stopped.store(true, Ordering::SeqCst);
        self.shared.unparker.unpark();

        if let Some(loop_thread) = lock(&self.thread).take() {
            // A completion callback may drop the last handle on the loop
            // thread itself; it exits on its own once it sees the flag.
            if loop_thread.thread().id() != thread::current().id() && loop_thread.join().is_err()
            {
                error!("Event loop {} panicked", self.name);
            }
        }
        self.worker.shutdown();
    }
}

impl Drop for EventLoop {
    fn drop(&mut self) {
        self.close();
    }
}

/// Body of the loop thread.
fn drive(name: &str, mut ring: IoRing, shared: &Shared, parker: &Parker, idle_park: Duration) {
    loop {
        let room = ring.submission_slots_available();
        for _ in 0..room {
            let Some(submission) = shared.queue.pop() else {
                break;
            };
            if let Err(rejected) = ring.add(submission) {
                shared.queue.push(rejected);
                break;
            }
        }

        if ring.in_flight() == 0 && ring.pending_submissions() == 0 {
            if shared.stopped.load(Ordering::SeqCst) {
                if shared.submitting.load(Ordering::SeqCst) == 0 && shared.queue.is_empty() {
                    break;
                }
                continue;
            }

            shared.parked.store(true, Ordering::SeqCst);
            if shared.queue.is_empty() && !shared.stopped.load(Ordering::SeqCst) {
                parker.park_timeout(idle_park);
            }
            shared.parked.store(false, Ordering::SeqCst);
        } else if let Err(e) = ring.submit_and_check_completions() {
            error!("Event loop {} stopping after unexpected error: {}", name, e);
            shared.stopped.store(true, Ordering::SeqCst);
            break;
        }
    }

    ring.close();

    // Submissions queued after a fatal error never reach the ring. Wait for
    // racing submitters so none of them pushes after the final drain.
    let backoff = Backoff::new();
    while shared.submitting.load(Ordering::SeqCst) > 0 {
        backoff.snooze();
    }
    while let Some(submission) = shared.queue.pop() {
        submission.complete(-libc::ECANCELED);
    }
    info!("Event loop {} stopped", name);
}
