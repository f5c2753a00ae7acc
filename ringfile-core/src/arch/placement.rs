//! Event loop placement
//!
//! Decides how many event loops a machine should run and whether they get
//! pinned to cores. Which core each pinned loop lands on is decided by
//! [`CpuInfo::core_for_loop`], one NUMA node at a time.

use crate::arch::cpu_info::CpuInfo;

/// How event loops are laid out over the machine's cores.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopPlacement {
    /// One unpinned loop.
    Single,

    /// Several loops, each pinned to its own core.
    PinnedSharded {
        /// Number of event loops.
        loops: usize,
    },
}

impl LoopPlacement {
    /// Picks a placement for the given topology.
    ///
    /// Machines with up to four cores run a loop per core; larger ones leave
    /// a core free for the threads submitting work.
    pub fn for_system(cpu_info: &CpuInfo) -> Self {
        let cores = cpu_info.logical_cores();
        if cores <= 1 {
            return Self::Single;
        }

        let loops = if cores <= 4 { cores } else { cores - 1 };
        Self::PinnedSharded { loops }
    }

    /// Number of event loops.
    pub fn loops(&self) -> usize {
        match self {
            Self::Single => 1,
            Self::PinnedSharded { loops } => *loops,
        }
    }

    /// Whether loop threads are pinned.
    pub fn pins_threads(&self) -> bool {
        matches!(self, Self::PinnedSharded { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_for_system() {
        assert_eq!(LoopPlacement::for_system(&CpuInfo::mock(1, 0)), LoopPlacement::Single);

        let placement = LoopPlacement::for_system(&CpuInfo::mock(2, 0));
        assert_eq!(placement, LoopPlacement::PinnedSharded { loops: 2 });
        assert!(placement.pins_threads());

        let placement = LoopPlacement::for_system(&CpuInfo::mock(4, 0));
        assert_eq!(placement.loops(), 4);

        let placement = LoopPlacement::for_system(&CpuInfo::mock(8, 2));
        assert_eq!(placement.loops(), 7);
    }

    #[test]
    fn test_single() {
        let single = LoopPlacement::Single;
        assert_eq!(single.loops(), 1);
        assert!(!single.pins_threads());
    }

    #[test]
    fn test_detected_system() {
        let cpu_info = CpuInfo::detect();
        let placement = LoopPlacement::for_system(&cpu_info);
        println!("Selected placement: {:?}", placement);

        if cpu_info.logical_cores() > 1 {
            assert!(placement.pins_threads());
        } else {
            assert_eq!(placement, LoopPlacement::Single);
        }
    }
}
