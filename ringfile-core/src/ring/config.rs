//! Ring configuration.

use crate::error::{Error, Result};

/// Largest queue depth the kernel accepts for a ring.
pub const MAX_RING_DEPTH: u32 = 32 * 1024;

/// Default queue depth used by [`RingConfig::default`].
pub const DEFAULT_RING_DEPTH: u32 = 256;

/// Configuration of an [`IoRing`](crate::ring::IoRing).
///
/// A configuration is immutable once built. Use [`RingConfig::buffered`],
/// [`RingConfig::direct`] or [`RingConfig::builder`] to create one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RingConfig {
    depth: u32,
    direct_io: bool,
    sq_polling: bool,
    io_polling: bool,
}

impl RingConfig {
    /// A buffered I/O configuration with the given depth.
    pub fn buffered(depth: u32) -> Result<Self> {
        Self::builder(depth).build()
    }

    /// A direct I/O configuration with the given depth.
    pub fn direct(depth: u32) -> Result<Self> {
        Self::builder(depth).with_direct_io().build()
    }

    /// Starts a builder for a ring of the given depth.
    pub fn builder(depth: u32) -> RingConfigBuilder {
        RingConfigBuilder {
            depth,
            direct_io: false,
            sq_polling: false,
            io_polling: false,
        }
    }

    /// Number of entries in the submission queue.
    ///
    /// This is also the maximum number of submissions handed to the kernel by a
    /// single [`submit_and_check_completions`](crate::ring::IoRing::submit_and_check_completions).
    pub fn depth(&self) -> u32 {
        self.depth
    }

    /// Whether files are opened with `O_DIRECT`.
    pub fn direct_io(&self) -> bool {
        self.direct_io
    }

    /// Whether a kernel thread polls the submission queue.
    pub fn sq_polling(&self) -> bool {
        self.sq_polling
    }

    /// Whether completions are busy-polled instead of interrupt driven.
    pub fn io_polling(&self) -> bool {
        self.io_polling
    }
}

impl Default for RingConfig {
    fn default() -> Self {
        Self {
            depth: DEFAULT_RING_DEPTH,
            direct_io: false,
            sq_polling: false,
            io_polling: false,
        }
    }
}

/// Builder for [`RingConfig`].
#[derive(Debug, Clone)]
pub struct RingConfigBuilder {
    depth: u32,
    direct_io: bool,
    sq_polling: bool,
    io_polling: bool,
}

impl RingConfigBuilder {
    /// Uses direct I/O.
    pub fn with_direct_io(self) -> Self {
        self.direct_io(true)
    }

    /// Sets whether direct I/O is used.
    pub fn direct_io(mut self, enabled: bool) -> Self {
        self.direct_io = enabled;
        self
    }

    /// Uses kernel-side submission queue polling.
    pub fn with_sq_polling(self) -> Self {
        self.sq_polling(true)
    }

    /// Sets whether kernel-side submission queue polling is used.
    pub fn sq_polling(mut self, enabled: bool) -> Self {
        self.sq_polling = enabled;
        self
    }

    /// Uses I/O polling.
    ///
    /// Only allowed together with direct I/O. The NVMe driver also needs
    /// `poll_queues` configured for this to do anything useful.
    pub fn with_io_polling(self) -> Self {
        self.io_polling(true)
    }

    /// Sets whether I/O polling is used.
    pub fn io_polling(mut self, enabled: bool) -> Self {
        self.io_polling = enabled;
        self
    }

    /// Validates the settings and builds the configuration.
    pub fn build(self) -> Result<RingConfig> {
        if self.depth == 0 {
            return Err(Error::Config("depth must be positive".into()));
        }
        if self.depth > MAX_RING_DEPTH {
            return Err(Error::Config(format!(
                "depth {} exceeds the maximum of {}",
                self.depth, MAX_RING_DEPTH
            )));
        }
        if self.io_polling && !self.direct_io {
            return Err(Error::Config(
                "I/O polling can only be used with direct I/O".into(),
            ));
        }

        Ok(RingConfig {
            depth: self.depth,
            direct_io: self.direct_io,
            sq_polling: self.sq_polling,
            io_polling: self.io_polling,
        })
    }
}
