//! Round-robin sharding over several event loops.

use crate::arch::ThreadBuilder;
use crate::error::Result;
use crate::executor::event_loop::EventLoop;
use crate::provider::NativeProvider;
use crate::ring::{RingConfig, Submission};
use std::os::unix::io::RawFd;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

/// Independent event loops sharing one ring configuration.
///
/// Submissions, opens and closes each go to the next loop in turn.
pub(crate) struct MultiLoopExecutor {
    loops: Vec<EventLoop>,
    next: AtomicUsize,
}

impl MultiLoopExecutor {
    /// Starts `count` event loops.
    pub fn start(
        provider: &dyn NativeProvider,
        config: RingConfig,
        count: usize,
        idle_park: Duration,
        threads: &mut ThreadBuilder,
    ) -> Result<Self> {
        let loops = (0..count)
            .map(|_| EventLoop::start(provider, config, idle_park, threads))
            .collect::<Result<Vec<_>>>()?;

        Ok(Self {
            loops,
            next: AtomicUsize::new(0),
        })
    }

    fn next_loop(&self) -> &EventLoop {
        let idx = self.next.fetch_add(1, Ordering::Relaxed) % self.loops.len();
        &self.loops[idx]
    }

    /// Number of event loops.
    pub fn len(&self) -> usize {
        self.loops.len()
    }

    pub fn submit(&self, submission: Submission) -> Result<()> {
        self.next_loop().submit(submission)
    }

    pub fn open_file(&self, path: PathBuf, read_only: bool) -> Result<RawFd> {
        self.next_loop().open_file(path, read_only)
    }

    pub fn close_file(&self, fd: RawFd) -> Result<()> {
        self.next_loop().close_file(fd)
    }

    /// Closes every loop in turn.
    pub fn close(&self) {
        for event_loop in &self.loops {
            event_loop.close();
        }
    }
}
