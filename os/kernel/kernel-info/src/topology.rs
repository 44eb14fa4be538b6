//! # NUMA Topology Feed
//!
//! Supplied by ACPI/platform code at boot: which physical ranges and which
//! CPUs belong to which proximity domain, and how far domains are from each
//! other. Distances follow the SLIT convention: 10 is local, larger is
//! farther, 255 means unreachable.

use crate::memory::{MAX_CPUS, MAX_NODES};
use alloc::vec;
use alloc::vec::Vec;
use core::fmt;
use kernel_memory_addresses::PhysicalRange;

/// Distance of a node to itself.
pub const LOCAL_DISTANCE: u8 = 10;

/// Default distance between two distinct nodes when the feed has no matrix.
pub const REMOTE_DISTANCE: u8 = 20;

/// Marks an unreachable node.
pub const UNREACHABLE_DISTANCE: u8 = 255;

/// NUMA node (proximity domain) identifier.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct NodeId(u16);

impl NodeId {
    #[inline]
    #[must_use]
    pub const fn new(id: u16) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "node{}", self.0)
    }
}

/// Logical CPU index, dense from zero. Selects per-CPU slots explicitly.
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct CpuId(u32);

impl CpuId {
    #[inline]
    #[must_use]
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    #[inline]
    #[must_use]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Debug for CpuId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "cpu{}", self.0)
    }
}

/// A physical range that belongs to a domain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NumaMemoryAffinity {
    pub node: NodeId,
    pub range: PhysicalRange,
}

/// A logical CPU that belongs to a domain.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct NumaCpuAffinity {
    pub cpu: CpuId,
    pub node: NodeId,
}

/// The complete topology description.
///
/// An empty feed describes a uniform machine: one node, every CPU on it.
#[derive(Debug, Clone, Default)]
pub struct NumaTopology {
    pub memory: Vec<NumaMemoryAffinity>,
    pub cpus: Vec<NumaCpuAffinity>,
    /// `distances[a][b]`: distance from node `a` to node `b`.
    pub distances: Vec<Vec<u8>>,
}

impl NumaTopology {
    /// A single-node topology.
    #[must_use]
    pub fn uniform() -> Self {
        Self::default()
    }

    /// Number of nodes described: the highest node id referenced plus one,
    /// at least one and at most [`MAX_NODES`].
    #[must_use]
    pub fn node_count(&self) -> usize {
        let from_memory = self.memory.iter().map(|m| m.node.as_usize() + 1);
        let from_cpus = self.cpus.iter().map(|c| c.node.as_usize() + 1);
        from_memory
            .chain(from_cpus)
            .chain(core::iter::once(self.distances.len()))
            .max()
            .unwrap_or(1)
            .clamp(1, MAX_NODES)
    }

    /// Distance between two nodes, defaulting to local/remote when the
    /// matrix does not cover the pair.
    #[must_use]
    pub fn distance(&self, from: NodeId, to: NodeId) -> u8 {
        self.distances
            .get(from.as_usize())
            .and_then(|row| row.get(to.as_usize()))
            .copied()
            .unwrap_or(if from == to {
                LOCAL_DISTANCE
            } else {
                REMOTE_DISTANCE
            })
    }

    /// Node a CPU belongs to; node 0 when the feed does not list it.
    #[must_use]
    pub fn node_of_cpu(&self, cpu: CpuId) -> NodeId {
        self.cpus
            .iter()
            .find(|c| c.cpu == cpu)
            .map_or(NodeId::new(0), |c| c.node)
    }

    /// CPU-to-node table covering [`MAX_CPUS`] slots.
    #[must_use]
    pub fn cpu_node_table(&self) -> Vec<NodeId> {
        let mut table = vec![NodeId::new(0); MAX_CPUS];
        for c in &self.cpus {
            if let Some(slot) = table.get_mut(c.cpu.as_usize()) {
                *slot = c.node;
            }
        }
        table
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_memory_addresses::PhysicalAddress;

    #[test]
    fn empty_feed_is_one_node() {
        let t = NumaTopology::uniform();
        assert_eq!(t.node_count(), 1);
        assert_eq!(t.distance(NodeId::new(0), NodeId::new(0)), LOCAL_DISTANCE);
        assert_eq!(t.node_of_cpu(CpuId::new(7)), NodeId::new(0));
    }

    #[test]
    fn distances_and_cpu_table() {
        let t = NumaTopology {
            memory: vec![NumaMemoryAffinity {
                node: NodeId::new(1),
                range: PhysicalRange::new(PhysicalAddress::new(0x1_0000_0000), 0x1000_0000),
            }],
            cpus: vec![NumaCpuAffinity {
                cpu: CpuId::new(3),
                node: NodeId::new(1),
            }],
            distances: vec![vec![10, 21], vec![21, 10]],
        };
        assert_eq!(t.node_count(), 2);
        assert_eq!(t.distance(NodeId::new(0), NodeId::new(1)), 21);
        assert_eq!(t.distance(NodeId::new(0), NodeId::new(5)), REMOTE_DISTANCE);
        assert_eq!(t.cpu_node_table()[3], NodeId::new(1));
        assert_eq!(t.cpu_node_table()[0], NodeId::new(0));
    }
}
