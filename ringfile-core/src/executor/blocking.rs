//! Single-thread worker for blocking file operations.
//!
//! Opening and closing files may block on the filesystem, so event loops hand
//! them to this worker instead of running them on the thread driving the ring.

use crate::arch::{ThreadBuilder, WorkerThread};
use crate::error::{Error, Result};
use crate::executor::lock;
use std::sync::mpsc;
use std::sync::Mutex;
use std::thread;
use tracing::{debug, error};

type Job = Box<dyn FnOnce() + Send + 'static>;

/// A thread running jobs one at a time, in submission order.
pub(crate) struct BlockingWorker {
    name: String,
    jobs: Mutex<Option<mpsc::Sender<Job>>>,
    thread: Mutex<Option<WorkerThread<()>>>,
}

impl BlockingWorker {
    /// Starts a worker on a thread called `name`.
    pub fn spawn(name: impl Into<String>) -> Result<Self> {
        let name = name.into();
        let (tx, rx) = mpsc::channel::<Job>();

        let thread = ThreadBuilder::unpinned().spawn(name.clone(), move || {
            for job in rx {
                job();
            }
        })?;

        Ok(Self {
            name,
            jobs: Mutex::new(Some(tx)),
            thread: Mutex::new(Some(thread)),
        })
    }

    /// Runs `f` on the worker and waits for its result.
    ///
    /// Fails with [`Error::ExecutorClosed`] once the worker was shut down.
    pub fn run<F, T>(&self, f: F) -> Result<T>
    where
        F: FnOnce() -> T + Send + 'static,
        T: Send + 'static,
    {
        let (reply_tx, reply_rx) = mpsc::sync_channel(1);
        let job: Job = Box::new(move || {
            let _ = reply_tx.send(f());
        });

        {
            let jobs = lock(&self.jobs);
            let tx = jobs.as_ref().ok_or(Error::ExecutorClosed)?;
            tx.send(job).map_err(|_| Error::ExecutorClosed)?;
        }
        reply_rx.recv().map_err(|_| Error::ExecutorClosed)
    }

    /// Stops accepting jobs, lets the queued ones finish and joins the thread.
    pub fn shutdown(&self) {
        drop(lock(&self.jobs).take());

        let Some(worker) = lock(&self.thread).take() else {
            return;
        };
        if worker.thread().id() == thread::current().id() {
            return;
        }
        if worker.join().is_err() {
            error!("Blocking worker {} panicked", self.name);
        } else {
            debug!("Blocking worker {} stopped", self.name);
        }
    }
}

impl Drop for BlockingWorker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
