//! Native I/O providers.
//!
//! A provider creates the kernel-facing half of a ring: the backend that hands
//! pending submission records to the kernel and reports completions, and the
//! file operations used to open and close descriptors. The provider is picked
//! once per process (see [`instance`]); rings created afterwards all use it.

#[cfg(all(feature = "io_uring", target_os = "linux"))]
pub mod io_uring;

pub mod fallback;

#[cfg(test)]
pub(crate) mod testing;

pub use fallback::BlockingProvider;

#[cfg(all(feature = "io_uring", target_os = "linux"))]
pub use self::io_uring::UringProvider;

use crate::error::{Error, Result};
use crate::ring::{CompletionBatch, IoBuf, RingConfig, SubmissionRecord};
use std::fmt;
use std::path::Path;
use std::sync::{Arc, OnceLock};
use tracing::warn;

/// Capability set of a native I/O provider.
pub trait NativeProvider: Send + Sync + fmt::Debug {
    /// Short name used in logs.
    fn name(&self) -> &'static str;

    /// Creates the kernel resources of a ring.
    ///
    /// The returned backend owns them until [`RingBackend::destroy`] runs.
    fn create_ring(&self, config: &RingConfig)
        -> Result<(Box<dyn RingBackend>, Arc<dyn FileOps>)>;

    /// Allocates a zeroed buffer aligned for direct I/O.
    fn allocate_aligned(&self, len: usize) -> Result<IoBuf> {
        Ok(IoBuf::aligned(len))
    }

    /// Address of the first byte of the buffer's window.
    fn address(&self, buf: &IoBuf) -> Result<usize> {
        Ok(buf.address())
    }
}

/// Kernel-facing half of a ring.
pub trait RingBackend: Send {
    /// Hands as many `records` as possible to the kernel, oldest first, then
    /// collects whatever completions are available without waiting.
    ///
    /// The number of records taken and the `(id, res)` pairs observed are
    /// reported through `batch`. Records beyond the submitted count must be
    /// left alone; they are offered again on the next call.
    fn submit_and_check_completions(
        &mut self,
        records: &[SubmissionRecord],
        batch: &mut CompletionBatch,
    ) -> Result<()>;

    /// Releases the kernel resources. Called exactly once.
    fn destroy(&mut self);
}

/// Opening and closing descriptors for a ring.
///
/// Both operations return the raw syscall convention: a non-negative value on
/// success, a negated errno on failure.
pub trait FileOps: Send + Sync {
    /// Opens `path`, returning a descriptor or `-errno`.
    fn open_file(&self, path: &Path, read_only: bool, direct_io: bool) -> i32;

    /// Closes `fd`, returning 0 or `-errno`.
    fn close_file(&self, fd: i32) -> i32;
}

/// Provider used when no native provider could be loaded.
///
/// Every operation fails with the same [`Error::Unavailable`].
#[derive(Debug, Clone)]
pub struct UnavailableProvider {
    reason: String,
}

impl UnavailableProvider {
    /// Creates a provider reporting `reason` from every operation.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// Why no provider is available.
    pub fn reason(&self) -> &str {
        &self.reason
    }

    fn error(&self) -> Error {
        Error::Unavailable(self.reason.clone())
    }
}

impl NativeProvider for UnavailableProvider {
    fn name(&self) -> &'static str {
        "unavailable"
    }

    fn create_ring(
        &self,
        _config: &RingConfig,
    ) -> Result<(Box<dyn RingBackend>, Arc<dyn FileOps>)> {
        Err(self.error())
    }

    fn allocate_aligned(&self, _len: usize) -> Result<IoBuf> {
        Err(self.error())
    }

    fn address(&self, _buf: &IoBuf) -> Result<usize> {
        Err(self.error())
    }
}

static INSTANCE: OnceLock<Arc<dyn NativeProvider>> = OnceLock::new();

/// The process-wide native provider.
///
/// io_uring is probed on first use; when it can't be set up (old kernel,
/// seccomp filter, feature disabled) an [`UnavailableProvider`] carrying the
/// reason is cached instead, so the probe never runs twice.
pub fn instance() -> Arc<dyn NativeProvider> {
    INSTANCE.get_or_init(select).clone()
}

/// Whether the process-wide provider can create rings.
pub fn is_available() -> bool {
    instance().name() != "unavailable"
}

/// A provider performing positional reads and writes synchronously.
pub fn blocking() -> Arc<dyn NativeProvider> {
    Arc::new(BlockingProvider::new())
}

#[cfg(all(feature = "io_uring", target_os = "linux"))]
fn select() -> Arc<dyn NativeProvider> {
    match UringProvider::probe() {
        Ok(provider) => {
            tracing::info!("Using io_uring native I/O provider");
            Arc::new(provider)
        }
        Err(e) => {
            warn!("io_uring unavailable: {}", e);
            Arc::new(UnavailableProvider::new(format!(
                "io_uring could not be initialized: {e}"
            )))
        }
    }
}

#[cfg(not(all(feature = "io_uring", target_os = "linux")))]
fn select() -> Arc<dyn NativeProvider> {
    warn!("Built without io_uring support, no native I/O provider");
    Arc::new(UnavailableProvider::new(
        "built without the io_uring feature or not running on Linux",
    ))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unavailable_provider_fails_every_operation() {
        let provider = UnavailableProvider::new("no kernel support");
        assert_eq!(provider.reason(), "no kernel support");

        let err = provider
            .create_ring(&RingConfig::default())
            .err()
            .unwrap();
        assert!(matches!(err, Error::Unavailable(ref r) if r == "no kernel support"));

        assert!(provider.allocate_aligned(512).is_err());
        assert!(provider.address(&IoBuf::new(8)).is_err());
    }

    #[test]
    fn test_instance_is_cached() {
        let first = instance();
        let second = instance();
        assert!(Arc::ptr_eq(&first, &second));
        println!("Selected provider: {:?}", first);
    }

    #[test]
    fn test_default_allocation_is_aligned() {
        let provider = blocking();
        let buf = provider.allocate_aligned(1000).unwrap();
        let address = provider.address(&buf).unwrap();
        assert_eq!(address % crate::ring::DIRECT_IO_ALIGNMENT, 0);
        assert_eq!(buf.capacity(), 1000);
    }
}
