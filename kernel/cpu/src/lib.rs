//! An abstraction for identifying CPUs (cores) and NUMA memory nodes
//! in an SMP multicore system, and for mapping each CPU to its node.
//!
//! The core never reads CPU registers itself. Which CPU a task is on
//! is tracked by the `migration` crate; this crate only provides the
//! identifiers and the static [`Topology`] used to size per-CPU and
//! per-node arrays at startup.

#![cfg_attr(not(test), no_std)]

extern crate alloc;

use alloc::vec::Vec;
use derive_more::{Binary, Display, LowerHex, Octal, UpperHex};
use kernel_config::memory::{MAX_CPUS, MAX_NUMA_NODES};

/// A unique identifier for a CPU.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord,
    Hash, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct CpuId(u32);

impl CpuId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Returns the inner raw value of this `CpuId`.
    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this `CpuId` as an index into a per-CPU array.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for CpuId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}

/// A unique identifier for a NUMA memory node.
#[derive(
    Clone, Copy, Debug, Display, PartialEq, Eq, PartialOrd, Ord, Hash,
)]
#[repr(transparent)]
pub struct NodeId(u32);

impl NodeId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn value(self) -> u32 {
        self.0
    }

    /// Returns this `NodeId` as an index into a per-node array.
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl From<u32> for NodeId {
    fn from(value: u32) -> Self {
        Self(value)
    }
}


/// The fixed mapping from each CPU to the NUMA node it belongs to.
///
/// CPUs are numbered densely from `0` to `nr_cpus() - 1`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Topology {
    cpu_nodes: Vec<NodeId>,
    nr_nodes: usize,
}

impl Topology {
    /// Creates a topology from an explicit per-CPU node list,
    /// where `cpu_nodes[i]` is the node of CPU `i`.
    pub fn new(cpu_nodes: Vec<NodeId>) -> Result<Topology, &'static str> {
        if cpu_nodes.is_empty() {
            return Err("Topology must contain at least one CPU");
        }
        if cpu_nodes.len() > MAX_CPUS {
            return Err("Topology has more CPUs than MAX_CPUS");
        }
        let nr_nodes = cpu_nodes.iter().map(|n| n.index() + 1).max().unwrap_or(1);
        if nr_nodes > MAX_NUMA_NODES {
            return Err("Topology has a node ID beyond MAX_NUMA_NODES");
        }
        Ok(Topology { cpu_nodes, nr_nodes })
    }

    /// A single-node system with `nr_cpus` CPUs.
    pub fn uniform(nr_cpus: usize) -> Result<Topology, &'static str> {
        Self::interleaved(nr_cpus, 1)
    }

    /// Spreads `nr_cpus` CPUs round-robin across `nr_nodes` nodes,
    /// so CPU `i` lands on node `i % nr_nodes`.
    pub fn interleaved(nr_cpus: usize, nr_nodes: usize) -> Result<Topology, &'static str> {
        if nr_nodes == 0 {
            return Err("Topology must contain at least one node");
        }
        let cpu_nodes = (0..nr_cpus)
            .map(|cpu| NodeId::new((cpu % nr_nodes) as u32))
            .collect();
        let mut topology = Self::new(cpu_nodes)?;
        // Keep nodes that ended up with no CPUs; they may still supply memory.
        topology.nr_nodes = core::cmp::max(topology.nr_nodes, nr_nodes);
        if topology.nr_nodes > MAX_NUMA_NODES {
            return Err("Topology has a node ID beyond MAX_NUMA_NODES");
        }
        Ok(topology)
    }

    pub fn nr_cpus(&self) -> usize {
        self.cpu_nodes.len()
    }

    pub fn nr_nodes(&self) -> usize {
        self.nr_nodes
    }

    /// Returns the node that the given CPU belongs to,
    /// or `None` if that CPU doesn't exist.
    pub fn node_of(&self, cpu: CpuId) -> Option<NodeId> {
        self.cpu_nodes.get(cpu.index()).copied()
    }

    /// Returns an iterator over every CPU in this topology.
    pub fn cpus(&self) -> impl Iterator<Item = CpuId> + '_ {
        (0..self.cpu_nodes.len()).map(|i| CpuId::new(i as u32))
    }

    /// Returns an iterator over every node in this topology.
    pub fn nodes(&self) -> impl Iterator<Item = NodeId> + '_ {
        (0..self.nr_nodes).map(|i| NodeId::new(i as u32))
    }
}
