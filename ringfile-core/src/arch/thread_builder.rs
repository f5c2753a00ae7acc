//! Spawning named, optionally pinned threads
//!
//! Event loops and blocking workers run on dedicated threads. When pinning is
//! enabled each new thread is bound to the next core picked by
//! [`CpuInfo::core_for_loop`].

use crate::arch::CpuInfo;
use std::io;
use std::thread::{self, JoinHandle};
use tracing::{debug, warn};

/// Outcome of binding a thread to a core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PinningResult {
    /// Bound to the requested core.
    Success,
    /// The requested core doesn't exist; bound to this one instead.
    SuccessDifferentCore(usize),
    /// The platform can't report or set affinities.
    Unsupported,
    /// Setting the affinity failed.
    Failed,
}

/// A spawned thread and the core it was assigned.
#[derive(Debug)]
pub struct WorkerThread<T> {
    handle: JoinHandle<T>,
    core_id: Option<usize>,
}

impl<T> WorkerThread<T> {
    /// Core the thread was asked to run on, if pinned.
    pub fn core_id(&self) -> Option<usize> {
        self.core_id
    }

    /// The spawned thread.
    pub fn thread(&self) -> &thread::Thread {
        self.handle.thread()
    }

    /// Waits for the thread to finish.
    pub fn join(self) -> thread::Result<T> {
        self.handle.join()
    }
}

/// Spawns threads, assigning consecutive cores when pinning is on.
#[derive(Debug)]
pub struct ThreadBuilder {
    cpu_info: Option<CpuInfo>,
    next_idx: usize,
}

impl ThreadBuilder {
    /// A builder spawning unpinned threads.
    pub fn unpinned() -> Self {
        Self {
            cpu_info: None,
            next_idx: 0,
        }
    }

    /// A builder pinning each thread to the next core of `cpu_info`.
    pub fn pinned(cpu_info: &CpuInfo) -> Self {
        Self {
            cpu_info: Some(cpu_info.clone()),
            next_idx: 0,
        }
    }

    /// Spawns `f` on a thread called `name`.
    pub fn spawn<F, T>(&mut self, name: impl Into<String>, f: F) -> io::Result<WorkerThread<T>>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let core_id = self
            .cpu_info
            .as_ref()
            .map(|info| info.core_for_loop(self.next_idx));
        self.next_idx += 1;

        let name = name.into();
        let thread_name = name.clone();
        let handle = thread::Builder::new().name(name).spawn(move || {
            if let Some(core) = core_id {
                match pin_current_thread(core) {
                    PinningResult::Success => {
                        debug!("Pinned {} to core {}", thread_name, core)
                    }
                    result => warn!(
                        "Pinning {} to core {}: {:?}",
                        thread_name, core, result
                    ),
                }
            }
            f()
        })?;

        Ok(WorkerThread { handle, core_id })
    }
}

/// Binds the calling thread to `core_id`.
fn pin_current_thread(core_id: usize) -> PinningResult {
    let Some(core_ids) = core_affinity::get_core_ids() else {
        return PinningResult::Unsupported;
    };
    if core_ids.is_empty() {
        return PinningResult::Failed;
    }

    let (idx, result) = match core_ids.get(core_id) {
        Some(_) => (core_id, PinningResult::Success),
        None => {
            let fallback = core_id % core_ids.len();
            (fallback, PinningResult::SuccessDifferentCore(fallback))
        }
    };

    if core_affinity::set_for_current(core_ids[idx]) {
        result
    } else {
        PinningResult::Failed
    }
}
