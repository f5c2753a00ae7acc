//! Architecture detection and thread management
//!
//! This module is responsible for:
//! - detecting the CPU topology (cores, NUMA nodes);
//! - choosing how many event loops to run;
//! - spawning loop threads, pinned to cores when asked.

pub mod cpu_info;
pub mod placement;
pub mod thread_builder;

pub use cpu_info::{CpuInfo, NumaNode};
pub use placement::LoopPlacement;
pub use thread_builder::{PinningResult, ThreadBuilder, WorkerThread};
