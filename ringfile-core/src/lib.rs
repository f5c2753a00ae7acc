//! ringfile core - asynchronous file reads over a kernel submission ring
//!
//! Callers submit reads through an [`IoExecutor`]; dedicated event loop
//! threads move them into io_uring style rings, reap completions and resolve
//! each read's [`ReadFuture`].

/// Architecture detection and thread management
pub mod arch;

/// Error types
pub mod error;

/// I/O executors, event loops and file readers
pub mod executor;

/// Native I/O providers
pub mod provider;

/// Submission/completion ring
pub mod ring;

pub use error::{AlignmentParam, Error, Result};
pub use executor::{ExecutorConfig, FileReader, IoExecutor, ReadFuture};
pub use provider::NativeProvider;
pub use ring::{IoBuf, IoRing, RingConfig, Submission};
