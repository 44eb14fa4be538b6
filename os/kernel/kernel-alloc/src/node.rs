//! # NUMA Nodes
//!
//! A node owns one zone per address class and knows how far every other
//! node is. Allocation on a node walks its zones from the highest class the
//! [`Gaf`] permits down to DMA and never leaves the node.

use crate::frame::{FrameRole, FrameState};
use crate::error::AttachError;
use crate::gaf::Gaf;
use crate::memory_model::MemoryModel;
use crate::zone::{NR_ZONE_TYPES, Zone, ZoneType};
use alloc::vec::Vec;
use bitflags::bitflags;
use core::fmt;
use kernel_info::memory::MAX_NODES;
use kernel_info::topology::{NumaTopology, UNREACHABLE_DISTANCE};
use kernel_info::{NodeId, Result, Status};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalRange, Pfn, is_aligned};

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct NodeStates: u8 {
        const POSSIBLE = 1 << 0;
        const ONLINE = 1 << 1;
        const HAS_MEMORY = 1 << 2;
        const HAS_CPU = 1 << 3;
    }
}

/// Set of nodes, one bit per [`NodeId`].
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct NodeMask(u16);

const _: () = assert!(MAX_NODES <= u16::BITS as usize);

impl NodeMask {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn contains(self, node: NodeId) -> bool {
        node.as_usize() < MAX_NODES && self.0 & (1 << node.as_usize()) != 0
    }

    #[must_use]
    pub const fn with(self, node: NodeId) -> Self {
        if node.as_usize() < MAX_NODES {
            Self(self.0 | (1 << node.as_usize()))
        } else {
            self
        }
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[allow(clippy::cast_possible_truncation)]
    pub fn iter(self) -> impl Iterator<Item = NodeId> {
        (0..MAX_NODES as u16)
            .map(NodeId::new)
            .filter(move |&n| self.contains(n))
    }
}

impl fmt::Debug for NodeMask {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// Zones tried for `gaf`, highest class first.
#[must_use]
pub const fn zone_order(gaf: Gaf) -> &'static [ZoneType] {
    if gaf.contains(Gaf::DMA) {
        &[ZoneType::Dma]
    } else if gaf.contains(Gaf::DMA32) {
        &[ZoneType::Dma32, ZoneType::Dma]
    } else {
        &[ZoneType::Normal, ZoneType::Dma32, ZoneType::Dma]
    }
}

pub struct Node {
    id: NodeId,
    states: NodeStates,
    zones: [Zone; NR_ZONE_TYPES],
    distances: Vec<u8>,
    fallback: Vec<NodeId>,
    allowed: NodeMask,
}

impl fmt::Debug for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Node")
            .field("id", &self.id)
            .field("states", &self.states)
            .field("fallback", &self.fallback)
            .field("zones", &self.zones)
            .finish_non_exhaustive()
    }
}

impl Node {
    /// Build node `id` of `count` from the topology feed.
    pub(crate) fn new(id: NodeId, count: usize, topology: &NumaTopology) -> Self {
        #[allow(clippy::cast_possible_truncation)]
        let nodes = || (0..count as u16).map(NodeId::new);
        let distances: Vec<u8> = nodes().map(|other| topology.distance(id, other)).collect();

        let mut fallback: Vec<NodeId> = nodes()
            .filter(|&other| other != id && distances[other.as_usize()] != UNREACHABLE_DISTANCE)
            .collect();
        fallback.sort_by_key(|other| (distances[other.as_usize()], *other));
        let allowed = fallback.iter().fold(NodeMask::empty().with(id), |m, &n| m.with(n));

        let has_cpu = if topology.cpus.is_empty() {
            id == NodeId::new(0)
        } else {
            topology.cpus.iter().any(|c| c.node == id)
        };
        let mut states = NodeStates::POSSIBLE | NodeStates::ONLINE;
        states.set(NodeStates::HAS_CPU, has_cpu);

        log::debug!("{id:?}: distances {distances:?}, fallback {fallback:?}");
        Self {
            id,
            states,
            zones: ZoneType::ALL.map(|zt| Zone::new(id, zt)),
            distances,
            fallback,
            allowed,
        }
    }

    #[must_use]
    pub const fn id(&self) -> NodeId {
        self.id
    }

    #[must_use]
    pub const fn states(&self) -> NodeStates {
        self.states
    }

    #[must_use]
    pub const fn zone(&self, zone_type: ZoneType) -> &Zone {
        &self.zones[zone_type.index()]
    }

    pub fn zones(&self) -> impl Iterator<Item = &Zone> {
        self.zones.iter()
    }

    /// Nodes this node may fall back to, itself included.
    #[must_use]
    pub const fn allowed(&self) -> NodeMask {
        self.allowed
    }

    /// Other nodes, nearest first.
    #[must_use]
    pub fn fallback(&self) -> &[NodeId] {
        &self.fallback
    }

    #[must_use]
    pub fn distance_to(&self, other: NodeId) -> u8 {
        self.distances
            .get(other.as_usize())
            .copied()
            .unwrap_or(UNREACHABLE_DISTANCE)
    }

    #[must_use]
    pub fn managed(&self) -> u64 {
        self.zones.iter().map(Zone::managed).sum()
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.zones.iter().map(Zone::free_frames).sum()
    }

    /// Split `range` into per-zone pieces. With a `priority` the whole range
    /// goes to that zone.
    fn pieces(
        range: PhysicalRange,
        priority: Option<ZoneType>,
    ) -> impl Iterator<Item = (ZoneType, Pfn, Pfn)> {
        let mut start = Pfn::from_phys(range.base);
        let end = Pfn::new(range.end() >> kernel_memory_addresses::PAGE_SHIFT);
        core::iter::from_fn(move || {
            if start >= end {
                return None;
            }
            let zone = priority.unwrap_or_else(|| ZoneType::of(start));
            let piece_end = if priority.is_some() {
                end
            } else {
                zone.end_pfn().min(end)
            };
            let piece = (zone, start, piece_end);
            start = piece_end;
            Some(piece)
        })
    }

    /// Validate a range for attach: page-granular, non-empty, unattached.
    pub(crate) fn check_range(
        model: &MemoryModel,
        range: PhysicalRange,
    ) -> core::result::Result<(), AttachError> {
        if range.is_empty() {
            return Err(AttachError::Empty);
        }
        if !is_aligned(range.base.as_u64(), PAGE_SIZE) || !is_aligned(range.size, PAGE_SIZE) {
            return Err(AttachError::Misaligned);
        }
        if range.base.checked_add(range.size).is_none() {
            return Err(AttachError::Overflow);
        }
        let start = Pfn::from_phys(range.base).as_u64();
        let covered = (start..start + range.pages())
            .filter_map(|pfn| model.frame(Pfn::new(pfn)))
            .any(|f| f.role() != FrameRole::Unused || f.state().contains(FrameState::RESERVED));
        if covered {
            return Err(AttachError::AlreadyAttached);
        }
        Ok(())
    }

    /// Register usable RAM with this node's zones.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for an empty range or one already attached.
    /// - [`Status::MisAligned`] if base or size is not page-aligned.
    pub(crate) fn attach_range(
        &mut self,
        model: &mut MemoryModel,
        range: PhysicalRange,
        priority: Option<ZoneType>,
    ) -> Result<()> {
        Self::check_range(model, range)?;
        for (zone, start, end) in Self::pieces(range, priority) {
            self.zones[zone.index()].attach(model, start, end);
        }
        self.states.insert(NodeStates::HAS_MEMORY);
        Ok(())
    }

    /// Account firmware-owned RAM without making it allocatable.
    pub(crate) fn reserve_range(&mut self, model: &mut MemoryModel, range: PhysicalRange) {
        for (zone, start, end) in Self::pieces(range, None) {
            self.zones[zone.index()].reserve(model, start, end);
        }
    }

    /// Allocate from this node only, walking zones permitted by `gaf`.
    ///
    /// # Errors
    /// [`Status::OutOfMem`] when no permitted zone can satisfy the request.
    pub fn alloc(&self, model: &MemoryModel, gaf: Gaf, order: u32) -> Result<Pfn> {
        let mut last = Status::OutOfMem;
        for &zt in zone_order(gaf) {
            match self.zone(zt).alloc_checked(model, order, gaf.is_required()) {
                Ok(pfn) => return Ok(pfn),
                Err(Status::OutOfMem) => {}
                Err(e) => last = e,
            }
        }
        Err(last)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::topology::{NumaCpuAffinity, REMOTE_DISTANCE};
    use kernel_info::CpuId;
    use kernel_memory_addresses::PhysicalAddress;

    fn three_nodes() -> NumaTopology {
        NumaTopology {
            memory: Vec::new(),
            cpus: alloc::vec![NumaCpuAffinity { cpu: CpuId::new(0), node: NodeId::new(2) }],
            distances: alloc::vec![
                alloc::vec![10, 30, 20],
                alloc::vec![30, 10, 255],
                alloc::vec![20, 255, 10],
            ],
        }
    }

    #[test]
    fn fallback_is_sorted_by_distance() {
        let topo = three_nodes();
        let n0 = Node::new(NodeId::new(0), 3, &topo);
        assert_eq!(n0.fallback(), [NodeId::new(2), NodeId::new(1)]);
        assert_eq!(n0.distance_to(NodeId::new(1)), 30);
        assert!(!n0.states().contains(NodeStates::HAS_CPU));

        let n1 = Node::new(NodeId::new(1), 3, &topo);
        assert_eq!(n1.fallback(), [NodeId::new(0)]);
        assert!(!n1.allowed().contains(NodeId::new(2)));
        assert_eq!(n1.allowed().len(), 2);

        let n2 = Node::new(NodeId::new(2), 3, &topo);
        assert!(n2.states().contains(NodeStates::HAS_CPU));
    }

    #[test]
    fn uniform_feed_defaults() {
        let topo = NumaTopology::uniform();
        let n = Node::new(NodeId::new(0), 2, &topo);
        assert_eq!(n.distance_to(NodeId::new(1)), REMOTE_DISTANCE);
        assert!(n.states().contains(NodeStates::HAS_CPU | NodeStates::ONLINE));
    }

    #[test]
    fn attach_splits_at_zone_boundaries() {
        let mut model = MemoryModel::new();
        let mut node = Node::new(NodeId::new(0), 1, &NumaTopology::uniform());
        // 8 MiB below and 8 MiB above the DMA limit.
        let range = PhysicalRange::new(PhysicalAddress::new(8 << 20), 16 << 20);
        node.attach_range(&mut model, range, None).unwrap();
        assert_eq!(node.zone(ZoneType::Dma).managed(), 2048);
        assert_eq!(node.zone(ZoneType::Dma32).managed(), 2048);
        assert!(node.states().contains(NodeStates::HAS_MEMORY));

        assert_eq!(node.attach_range(&mut model, range, None), Err(Status::InvalidArguments));
        let odd = PhysicalRange::new(PhysicalAddress::new(0x1800), 0x1000);
        assert_eq!(node.attach_range(&mut model, odd, None), Err(Status::MisAligned));
        let empty = PhysicalRange::new(PhysicalAddress::new(0x1000), 0);
        assert_eq!(node.attach_range(&mut model, empty, None), Err(Status::InvalidArguments));
    }

    #[test]
    fn priority_overrides_the_address_class() {
        let mut model = MemoryModel::new();
        let mut node = Node::new(NodeId::new(0), 1, &NumaTopology::uniform());
        let range = PhysicalRange::new(PhysicalAddress::new(0x10_0000), 0x10_0000);
        node.attach_range(&mut model, range, Some(ZoneType::Normal)).unwrap();
        assert_eq!(node.zone(ZoneType::Normal).managed(), 256);
        assert_eq!(node.zone(ZoneType::Dma).managed(), 0);
    }

    #[test]
    fn zone_hint_caps_the_search() {
        let mut model = MemoryModel::new();
        let mut node = Node::new(NodeId::new(0), 1, &NumaTopology::uniform());
        let high = PhysicalRange::new(PhysicalAddress::new(0x1_0000_0000), 0x10_0000);
        node.attach_range(&mut model, high, None).unwrap();
        assert_eq!(node.alloc(&model, Gaf::DMA32 | Gaf::REQUIRED, 0), Err(Status::OutOfMem));

        let low = PhysicalRange::new(PhysicalAddress::new(0x20_0000), 0x10_0000);
        node.attach_range(&mut model, low, None).unwrap();
        let pfn = node.alloc(&model, Gaf::DMA32 | Gaf::REQUIRED, 0).unwrap();
        assert_eq!(ZoneType::of(pfn), ZoneType::Dma);
        let pfn = node.alloc(&model, Gaf::REQUIRED, 0).unwrap();
        assert_eq!(ZoneType::of(pfn), ZoneType::Normal);
    }
}
