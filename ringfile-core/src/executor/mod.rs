//! I/O executors.
//!
//! An [`IoExecutor`] runs one or more event loops, each driving its own ring
//! on a dedicated thread, and is the entry point for reading files:
//!
//! ```no_run
//! use ringfile_core::executor::IoExecutor;
//! use ringfile_core::ring::RingConfig;
//!
//! # fn main() -> ringfile_core::Result<()> {
//! let executor = IoExecutor::single_threaded(RingConfig::buffered(64)?)?;
//! let reader = executor.open_for_reading("/etc/hostname")?;
//! let buf = reader.read_async(0, 16)?.wait()?;
//! println!("{}", String::from_utf8_lossy(&buf));
//! reader.close()?;
//! executor.close();
//! # Ok(())
//! # }
//! ```

mod blocking;
mod event_loop;
mod file_reader;
mod multi_loop;

pub use file_reader::{FileReader, ReadFuture};

use crate::arch::{CpuInfo, LoopPlacement, ThreadBuilder};
use crate::error::{Error, Result};
use crate::provider::{self, NativeProvider};
use crate::ring::{IoBuf, RingConfig, Submission};
use event_loop::EventLoop;
use multi_loop::MultiLoopExecutor;
use std::fmt;
use std::os::unix::io::RawFd;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::info;

/// How long an idle event loop parks before checking its queue again.
pub const DEFAULT_IDLE_PARK: Duration = Duration::from_micros(50);

/// Locks a mutex, recovering the data if a holder panicked.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    match mutex.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

/// Configuration of an [`IoExecutor`].
#[derive(Debug, Clone)]
pub struct ExecutorConfig {
    /// Configuration of every loop's ring.
    pub ring: RingConfig,

    /// Number of event loops; must be at least 1.
    pub event_loops: usize,

    /// Whether loop threads are pinned to cores.
    pub pin_threads: bool,

    /// How long an idle loop parks between queue checks.
    pub idle_park: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            ring: RingConfig::default(),
            event_loops: 1,
            pin_threads: false,
            idle_park: DEFAULT_IDLE_PARK,
        }
    }
}

impl ExecutorConfig {
    /// Sizes the executor for the current machine: a pinned loop per core on
    /// small machines, one core left free on larger ones.
    pub fn for_system(ring: RingConfig) -> Self {
        let placement = LoopPlacement::for_system(&CpuInfo::detect());
        Self {
            ring,
            event_loops: placement.loops(),
            pin_threads: placement.pins_threads(),
            ..Self::default()
        }
    }
}

enum Loops {
    Single(EventLoop),
    Multi(MultiLoopExecutor),
}

impl Loops {
    fn submit(&self, submission: Submission) -> Result<()> {
        match self {
            Self::Single(l) => l.submit(submission),
            Self::Multi(m) => m.submit(submission),
        }
    }

    fn open_file(&self, path: &Path, read_only: bool) -> Result<RawFd> {
        match self {
            Self::Single(l) => l.open_file(path.to_path_buf(), read_only),
            Self::Multi(m) => m.open_file(path.to_path_buf(), read_only),
        }
    }

    fn close_file(&self, fd: RawFd) -> Result<()> {
        match self {
            Self::Single(l) => l.close_file(fd),
            Self::Multi(m) => m.close_file(fd),
        }
    }

    fn close(&self) {
        match self {
            Self::Single(l) => l.close(),
            Self::Multi(m) => m.close(),
        }
    }

    fn len(&self) -> usize {
        match self {
            Self::Single(_) => 1,
            Self::Multi(m) => m.len(),
        }
    }
}

struct Inner {
    config: ExecutorConfig,
    provider: Arc<dyn NativeProvider>,
    loops: Loops,
    closed: AtomicBool,
}

/// Handle on a set of event loops reading files.
///
/// Handles are cheap to clone and can be shared across threads. The loops
/// stop when [`close`](Self::close) is called or the last handle (including
/// those held by open [`FileReader`]s) is dropped.
#[derive(Clone)]
pub struct IoExecutor {
    inner: Arc<Inner>,
}

impl IoExecutor {
    /// Starts an executor with the process-wide native provider.
    pub fn new(config: ExecutorConfig) -> Result<Self> {
        Self::with_provider(config, provider::instance())
    }

    /// Starts an executor whose rings are created by `provider`.
    pub fn with_provider(config: ExecutorConfig, provider: Arc<dyn NativeProvider>) -> Result<Self> {
        if config.event_loops == 0 {
            return Err(Error::Config("an executor needs at least one event loop".into()));
        }

        let mut threads = if config.pin_threads {
            ThreadBuilder::pinned(&CpuInfo::detect())
        } else {
            ThreadBuilder::unpinned()
        };

        let loops = if config.event_loops == 1 {
            Loops::Single(EventLoop::start(
                provider.as_ref(),
                config.ring,
                config.idle_park,
                &mut threads,
            )?)
        } else {
            Loops::Multi(MultiLoopExecutor::start(
                provider.as_ref(),
                config.ring,
                config.event_loops,
                config.idle_park,
                &mut threads,
            )?)
        };

        info!(
            "Started I/O executor (provider={}, loops={}, pinned={})",
            provider.name(),
            loops.len(),
            config.pin_threads
        );

        Ok(Self {
            inner: Arc::new(Inner {
                config,
                provider,
                loops,
                closed: AtomicBool::new(false),
            }),
        })
    }

    /// Starts an executor with a single event loop.
    pub fn single_threaded(ring: RingConfig) -> Result<Self> {
        Self::multi_threaded(1, ring)
    }

    /// Starts an executor with `loops` event loops.
    pub fn multi_threaded(loops: usize, ring: RingConfig) -> Result<Self> {
        Self::new(ExecutorConfig {
            ring,
            event_loops: loops,
            ..ExecutorConfig::default()
        })
    }

    /// Configuration of the loops' rings.
    pub fn ring_config(&self) -> &RingConfig {
        &self.inner.config.ring
    }

    /// Number of event loops.
    pub fn event_loops(&self) -> usize {
        self.inner.loops.len()
    }

    /// The provider the rings were created with.
    pub fn provider(&self) -> &Arc<dyn NativeProvider> {
        &self.inner.provider
    }

    /// Opens `path` for reading.
    pub fn open_for_reading(&self, path: impl AsRef<Path>) -> Result<FileReader> {
        FileReader::open(self.clone(), path.as_ref())
    }

    /// Hands a submission to one of the event loops.
    ///
    /// Its callback runs on that loop's thread.
    pub fn submit(&self, submission: Submission) -> Result<()> {
        self.check_open()?;
        self.inner.loops.submit(submission)
    }

    /// Opens a file, with `O_DIRECT` when the rings use direct I/O.
    pub fn open_file(&self, path: impl AsRef<Path>, read_only: bool) -> Result<RawFd> {
        self.check_open()?;
        self.inner.loops.open_file(path.as_ref(), read_only)
    }

    /// Closes a descriptor returned by [`open_file`](Self::open_file).
    pub fn close_file(&self, fd: RawFd) -> Result<()> {
        self.check_open()?;
        self.inner.loops.close_file(fd)
    }

    /// Allocates a buffer usable for direct I/O reads.
    pub fn allocate_aligned(&self, len: usize) -> Result<IoBuf> {
        self.inner.provider.allocate_aligned(len)
    }

    /// Address of the first byte of the buffer's window.
    pub(crate) fn buffer_address(&self, buf: &IoBuf) -> Result<usize> {
        self.inner.provider.address(buf)
    }

    /// Stops every event loop after its queued and in-flight work completes.
    ///
    /// Further operations fail with [`Error::ExecutorClosed`]. Calling this
    /// more than once has no further effect.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.loops.close();
        info!("Closed I/O executor");
    }

    /// Whether [`close`](Self::close) was called.
    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    fn check_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::ExecutorClosed);
        }
        Ok(())
    }
}

impl fmt::Debug for IoExecutor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IoExecutor")
            .field("provider", &self.inner.provider.name())
            .field("ring", &self.inner.config.ring)
            .field("event_loops", &self.event_loops())
            .field("closed", &self.is_closed())
            .finish()
    }
}
