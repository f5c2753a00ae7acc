//! CPU topology detection
//!
//! Counts logical and physical cores and reads the NUMA layout from sysfs, so
//! event loops can be spread over cores one NUMA node at a time.

use std::fmt;
use tracing::debug;

/// A NUMA node and the logical cores attached to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NumaNode {
    /// Node ID as numbered by the kernel.
    pub id: usize,
    /// Logical cores on this node, ascending.
    pub cores: Vec<usize>,
}

impl NumaNode {
    /// Creates a node.
    pub fn new(id: usize, cores: Vec<usize>) -> Self {
        Self { id, cores }
    }

    /// Number of logical cores on this node.
    pub fn core_count(&self) -> usize {
        self.cores.len()
    }
}

/// CPU topology of the machine.
#[derive(Clone)]
pub struct CpuInfo {
    logical_cores: usize,
    physical_cores: Option<usize>,
    numa_nodes: Vec<NumaNode>,
    numa_available: bool,
}

impl fmt::Debug for CpuInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CpuInfo")
            .field("logical_cores", &self.logical_cores)
            .field("physical_cores", &self.physical_cores)
            .field("numa_nodes", &self.numa_nodes.len())
            .field("numa_available", &self.numa_available)
            .finish()
    }
}

impl CpuInfo {
    /// Detects the topology of the current machine.
    pub fn detect() -> Self {
        let logical_cores = num_cpus::get().max(1);
        let physical_cores = Some(num_cpus::get_physical()).filter(|&n| n > 0);

        let (numa_nodes, numa_available) = match read_numa_nodes() {
            Some(nodes) if !nodes.is_empty() => (nodes, true),
            _ => (vec![NumaNode::new(0, (0..logical_cores).collect())], false),
        };

        let info = Self {
            logical_cores,
            physical_cores,
            numa_nodes,
            numa_available,
        };
        debug!("Detected CPU topology: {:?}", info);
        info
    }

    /// Number of logical cores.
    pub fn logical_cores(&self) -> usize {
        self.logical_cores
    }

    /// Number of physical cores, when the platform reports it.
    pub fn physical_cores(&self) -> Option<usize> {
        self.physical_cores
    }

    /// NUMA nodes; a single synthetic node when NUMA isn't available.
    pub fn numa_nodes(&self) -> &[NumaNode] {
        &self.numa_nodes
    }

    /// Whether the NUMA layout was read from the system.
    pub fn is_numa_available(&self) -> bool {
        self.numa_available
    }

    /// Core the event loop with the given index should run on.
    ///
    /// Loops fill the first NUMA node before moving to the next one, so
    /// neighbouring loops share memory locality. Indices past the last core
    /// wrap around to the first node.
    pub fn core_for_loop(&self, loop_idx: usize) -> usize {
        if self.numa_available {
            let mut first = 0;
            for node in self.numa_nodes.iter().filter(|n| n.core_count() > 0) {
                if loop_idx < first + node.core_count() {
                    return node.cores[(loop_idx - first) % node.core_count()];
                }
                first += node.core_count();
            }
            if let Some(node) = self.numa_nodes.iter().find(|n| n.core_count() > 0) {
                return node.cores[loop_idx % node.core_count()];
            }
        }
        loop_idx % self.logical_cores
    }

    /// A made-up topology with cores spread evenly over `numa_nodes` nodes.
    #[cfg(test)]
    pub fn mock(logical_cores: usize, numa_nodes: usize) -> Self {
        let nodes = if numa_nodes == 0 {
            vec![NumaNode::new(0, (0..logical_cores).collect())]
        } else {
            let base = logical_cores / numa_nodes;
            let extra = logical_cores % numa_nodes;
            let mut next = 0;
            (0..numa_nodes)
                .map(|id| {
                    let count = base + usize::from(id < extra);
                    let cores = (next..next + count).collect();
                    next += count;
                    NumaNode::new(id, cores)
                })
                .collect()
        };

        Self {
            logical_cores,
            physical_cores: Some(logical_cores / 2),
            numa_nodes: nodes,
            numa_available: numa_nodes > 0,
        }
    }
}

#[cfg(target_os = "linux")]
fn read_numa_nodes() -> Option<Vec<NumaNode>> {
    let entries = std::fs::read_dir("/sys/devices/system/node").ok()?;

    let mut nodes: Vec<NumaNode> = entries
        .filter_map(|entry| {
            let path = entry.ok()?.path();
            let id = path
                .file_name()?
                .to_str()?
                .strip_prefix("node")?
                .parse()
                .ok()?;
            let cpulist = std::fs::read_to_string(path.join("cpulist")).ok()?;
            Some(NumaNode::new(id, parse_cpu_list(&cpulist)))
        })
        .collect();

    nodes.sort_by_key(|n| n.id);
    Some(nodes)
}

#[cfg(not(target_os = "linux"))]
fn read_numa_nodes() -> Option<Vec<NumaNode>> {
    None
}

/// Parses a sysfs CPU list such as `0-2,4,6-8`.
fn parse_cpu_list(cpulist: &str) -> Vec<usize> {
    let mut cores = Vec::new();
    for part in cpulist.trim().split(',').map(str::trim) {
        match part.split_once('-') {
            Some((start, end)) => {
                if let (Ok(start), Ok(end)) = (start.parse::<usize>(), end.parse::<usize>()) {
                    cores.extend(start..=end);
                }
            }
            None => {
                if let Ok(core) = part.parse() {
                    cores.push(core);
                }
            }
        }
    }
    cores
}
