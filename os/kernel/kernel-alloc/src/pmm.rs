//! # Physical Memory Manager
//!
//! [`Pmm`] is the allocator context: the memory model, one [`Node`] per
//! NUMA domain and the per-CPU caches. Callers name the CPU they run on;
//! there is no implicit current CPU.
//!
//! ```text
//! alloc(cpu, gaf, order)
//!   │
//!   ├─ home node of cpu ──► order 0? per-CPU cache : zones (Normal → DMA32 → DMA)
//!   │
//!   ├─ unless ONLY_THIS_NODE: fallback nodes, nearest first, zones only
//!   │
//!   └─ still nothing: drain per-CPU caches once and retry
//! ```

use crate::error::AttachError;
use crate::frame::{Frame, FrameRole};
use crate::gaf::Gaf;
use crate::memory_model::MemoryModel;
use crate::node::{Node, zone_order};
use crate::pcp_cache::PcpCache;
use crate::zone::{ZoneStats, ZoneType};
use alloc::vec::Vec;
use kernel_info::boot::{BootMemoryKind, BootMemoryRegion};
use kernel_info::fatal::fatal;
use kernel_info::memory::{MAX_CPUS, MAX_FRAME_ORDER};
use kernel_info::topology::NumaTopology;
use kernel_info::{CpuId, NodeId, Result, Status, invariant};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalRange, Pfn};
use kernel_vmem::{PhysMapper, PhysMapperExt};

pub struct Pmm {
    model: MemoryModel,
    nodes: Vec<Node>,
    cpu_nodes: Vec<NodeId>,
    pcp: PcpCache,
}

impl core::fmt::Debug for Pmm {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Pmm").field("nodes", &self.nodes).finish_non_exhaustive()
    }
}

impl Pmm {
    /// Build the nodes from `topology` and hand the boot memory map to them.
    ///
    /// `Usable` regions become allocatable; other RAM kinds are only
    /// accounted as reserved. Device and bad memory is skipped.
    ///
    /// # Errors
    /// Any attach error of a usable region, see [`Pmm::attach_range`].
    pub fn new(topology: &NumaTopology, boot_map: &[BootMemoryRegion]) -> Result<Self> {
        let count = topology.node_count();
        #[allow(clippy::cast_possible_truncation)]
        let nodes = (0..count)
            .map(|i| Node::new(NodeId::new(i as u16), count, topology))
            .collect();
        let mut pmm = Self {
            model: MemoryModel::new(),
            nodes,
            cpu_nodes: topology.cpu_node_table(),
            pcp: PcpCache::new(MAX_CPUS),
        };

        for region in boot_map {
            let Some(range) = region.frame_aligned() else {
                continue;
            };
            match region.kind {
                BootMemoryKind::Usable => pmm.attach_range(region.node, range, None)?,
                kind if kind.is_ram() => pmm.reserve_range(region.node, range)?,
                _ => {}
            }
        }
        log::debug!(
            "pmm: {} node(s), {} managed frames, {} free",
            pmm.nodes.len(),
            pmm.stats().managed,
            pmm.stats().free
        );
        Ok(pmm)
    }

    fn node_mut(&mut self, id: NodeId) -> core::result::Result<&mut Node, AttachError> {
        self.nodes.get_mut(id.as_usize()).ok_or(AttachError::UnknownNode(id))
    }

    /// Register usable RAM with `node`. Without a `priority` the zone
    /// follows the physical address and the range is split at zone limits.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for an empty range or one already attached.
    /// - [`Status::MisAligned`] if base or size is not page-aligned.
    /// - [`Status::OutOfRange`] for an unknown node.
    pub fn attach_range(
        &mut self,
        node: NodeId,
        range: PhysicalRange,
        priority: Option<ZoneType>,
    ) -> Result<()> {
        let result = match self.nodes.get_mut(node.as_usize()) {
            Some(n) => n.attach_range(&mut self.model, range, priority),
            None => Err(AttachError::UnknownNode(node).into()),
        };
        if let Err(e) = result {
            log::warn!("pmm: cannot attach {range:?} to {node:?}: {e}");
        }
        result
    }

    fn reserve_range(&mut self, node: NodeId, range: PhysicalRange) -> Result<()> {
        let model = &mut self.model;
        let target = match self.nodes.get_mut(node.as_usize()) {
            Some(n) => n,
            None => return Err(AttachError::UnknownNode(node).into()),
        };
        target.reserve_range(model, range);
        Ok(())
    }

    #[must_use]
    pub const fn model(&self) -> &MemoryModel {
        &self.model
    }

    #[must_use]
    pub fn nodes(&self) -> &[Node] {
        &self.nodes
    }

    #[must_use]
    pub fn node(&self, id: NodeId) -> Option<&Node> {
        self.nodes.get(id.as_usize())
    }

    #[must_use]
    pub fn frame(&self, pfn: Pfn) -> Option<&Frame> {
        self.model.frame(pfn)
    }

    /// Home node of `cpu`; node 0 for CPUs the feed does not know.
    #[must_use]
    pub fn node_of_cpu(&self, cpu: CpuId) -> NodeId {
        self.cpu_nodes
            .get(cpu.as_usize())
            .copied()
            .filter(|n| n.as_usize() < self.nodes.len())
            .unwrap_or_default()
    }

    /// Counters summed over every zone of every node.
    #[must_use]
    pub fn stats(&self) -> ZoneStats {
        self.nodes
            .iter()
            .flat_map(Node::zones)
            .map(crate::zone::Zone::stats)
            .fold(ZoneStats::default(), |a, s| ZoneStats {
                present: a.present + s.present,
                managed: a.managed + s.managed,
                reserved: a.reserved + s.reserved,
                spanned: a.spanned + s.spanned,
                allocated: a.allocated + s.allocated,
                cached: a.cached + s.cached,
                free: a.free + s.free,
            })
    }

    #[track_caller]
    fn descriptor(&self, pfn: Pfn) -> &Frame {
        match self.model.frame(pfn) {
            Some(frame) => frame,
            None => fatal(format_args!("{pfn:?} has no frame descriptor")),
        }
    }

    fn home(&self, id: NodeId) -> &Node {
        self.nodes.get(id.as_usize()).unwrap_or(&self.nodes[0])
    }

    const fn check_request(gaf: Gaf, order: u32) -> Result<()> {
        if gaf.contains(Gaf::NEVER_FAIL) {
            return Err(Status::Unsupported);
        }
        if order > MAX_FRAME_ORDER {
            return Err(Status::InvalidArguments);
        }
        Ok(())
    }

    /// Nodes to try for a request preferring `home`.
    fn candidates<'a>(&'a self, home: &'a Node, gaf: Gaf) -> impl Iterator<Item = &'a Node> {
        let remote = !gaf.contains(Gaf::ONLY_THIS_NODE);
        let allowed = home.allowed();
        core::iter::once(home).chain(
            home.fallback()
                .iter()
                .filter(move |&&n| remote && allowed.contains(n))
                .filter_map(move |&n| self.node(n)),
        )
    }

    fn alloc_cached(&self, cpu: CpuId, node: &Node, gaf: Gaf) -> Option<Pfn> {
        let pfn = zone_order(gaf)
            .iter()
            .find_map(|&zt| self.pcp.alloc(cpu, node, &self.model, zt, gaf.is_required()))?;
        self.descriptor(pfn).set_reference_count(1);
        Some(pfn)
    }

    fn try_alloc(&self, cpu: Option<CpuId>, home: &Node, gaf: Gaf, order: u32) -> Option<Pfn> {
        for node in self.candidates(home, gaf) {
            let local = node.id() == home.id();
            let pfn = match cpu {
                Some(cpu) if order == 0 && local && self.pcp.covers(cpu) => {
                    self.alloc_cached(cpu, node, gaf)
                }
                _ => node.alloc(&self.model, gaf, order).ok(),
            };
            if let Some(pfn) = pfn {
                if !local {
                    log::trace!(
                        "pmm: order-{order} from fallback {:?} for {:?}",
                        node.id(),
                        home.id()
                    );
                }
                return Some(pfn);
            }
        }
        None
    }

    fn alloc_from(&self, cpu: Option<CpuId>, home: NodeId, gaf: Gaf, order: u32) -> Result<Pfn> {
        Self::check_request(gaf, order)?;
        let home = self.home(home);
        if let Some(pfn) = self.try_alloc(cpu, home, gaf, order) {
            return Ok(pfn);
        }
        // Frames parked in per-CPU caches are free memory too.
        if self.drain_all() > 0
            && let Some(pfn) = self.try_alloc(cpu, home, gaf, order)
        {
            return Ok(pfn);
        }
        log::warn!("pmm: out of memory for order-{order} {gaf:?} near {:?}", home.id());
        Err(Status::OutOfMem)
    }

    /// Allocate a `2^order` block for code running on `cpu`.
    ///
    /// The block's head carries one reference. The frame is not zeroed; see
    /// [`Pmm::alloc_zeroed`].
    ///
    /// # Errors
    /// - [`Status::Unsupported`] for [`Gaf::NEVER_FAIL`].
    /// - [`Status::InvalidArguments`] if `order` exceeds [`MAX_FRAME_ORDER`].
    /// - [`Status::OutOfMem`] when every eligible zone is exhausted.
    pub fn alloc(&self, cpu: CpuId, gaf: Gaf, order: u32) -> Result<Pfn> {
        self.alloc_from(Some(cpu), self.node_of_cpu(cpu), gaf, order)
    }

    /// Like [`Pmm::alloc`] but preferring `node` and bypassing per-CPU caches.
    ///
    /// # Errors
    /// As [`Pmm::alloc`].
    pub fn alloc_near(&self, node: NodeId, gaf: Gaf, order: u32) -> Result<Pfn> {
        self.alloc_from(None, node, gaf, order)
    }

    /// Allocate from `node` only, never falling back.
    ///
    /// # Errors
    /// As [`Pmm::alloc`], plus [`Status::OutOfRange`] for an unknown node.
    pub fn alloc_on_node(&self, node: NodeId, gaf: Gaf, order: u32) -> Result<Pfn> {
        Self::check_request(gaf, order)?;
        let target = self.node(node).ok_or(Status::OutOfRange)?;
        target.alloc(&self.model, gaf, order)
    }

    /// Allocate and zero a block through `mapper`.
    ///
    /// # Errors
    /// As [`Pmm::alloc`].
    pub fn alloc_zeroed(
        &self,
        cpu: CpuId,
        gaf: Gaf,
        order: u32,
        mapper: &dyn PhysMapper,
    ) -> Result<Pfn> {
        let pfn = self.alloc(cpu, gaf, order)?;
        for i in 0..1u64 << order {
            // Safety: the block was just allocated and nobody else maps it.
            unsafe { mapper.zero_frame(pfn.to_phys() + i * PAGE_SIZE) };
        }
        Ok(pfn)
    }

    /// Allocate `n` order-0 frames, all or nothing.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] if `n` is zero.
    /// - [`Status::OutOfMem`] if fewer than `n` frames could be found; the
    ///   partial set has been released again.
    pub fn alloc_frames(&self, cpu: CpuId, gaf: Gaf, n: usize) -> Result<Vec<Pfn>> {
        if n == 0 {
            return Err(Status::InvalidArguments);
        }
        let mut frames = Vec::with_capacity(n);
        for _ in 0..n {
            match self.alloc(cpu, gaf, 0) {
                Ok(pfn) => frames.push(pfn),
                Err(e) => {
                    self.free_frames(cpu, &frames);
                    return Err(e);
                }
            }
        }
        Ok(frames)
    }

    pub fn free_frames(&self, cpu: CpuId, frames: &[Pfn]) {
        for &pfn in frames {
            self.free(cpu, pfn, 0);
        }
    }

    /// Turn an allocated `2^order` block into as many order-0 frames, each
    /// holding one reference. They are released one by one and coalesce
    /// again in the zone.
    #[track_caller]
    pub fn split_block(&self, pfn: Pfn, order: u32) {
        let head = self.descriptor(pfn);
        invariant!(
            head.order() == order && head.reference_count() == 1,
            "{pfn:?} is not an exclusively owned order-{order} block"
        );
        head.set_order(0);
        for i in 1..1u64 << order {
            let frame = self.descriptor(pfn + i);
            frame.set_role(FrameRole::Pmm);
            frame.set_reference_count(1);
        }
    }

    /// Give back a block obtained from one of the `alloc` calls. The caller
    /// must hold the only reference.
    #[track_caller]
    pub fn free(&self, cpu: CpuId, pfn: Pfn, order: u32) {
        self.drop_owner(pfn, order);
        self.release(Some(cpu), pfn, order);
    }

    /// [`Pmm::free`] straight to the zone, bypassing per-CPU caches.
    #[track_caller]
    pub fn free_direct(&self, pfn: Pfn, order: u32) {
        self.drop_owner(pfn, order);
        self.release(None, pfn, order);
    }

    #[track_caller]
    fn drop_owner(&self, pfn: Pfn, order: u32) {
        let frame = self.descriptor(pfn);
        invariant!(
            frame.order() == order,
            "{pfn:?} freed as order {order} but heads order {}",
            frame.order()
        );
        let left = frame.put();
        invariant!(left == 0, "{pfn:?} freed with {left} references left");
    }

    fn release(&self, cpu: Option<CpuId>, pfn: Pfn, order: u32) {
        let frame = self.descriptor(pfn);
        let node = self.home(frame.node());
        match cpu {
            Some(cpu)
                if order == 0 && self.pcp.covers(cpu) && self.node_of_cpu(cpu) == node.id() =>
            {
                self.pcp.free(cpu, node, &self.model, pfn);
            }
            _ => node.zone(frame.zone_type()).free(&self.model, pfn, order),
        }
    }

    /// Take another reference on an allocated frame; returns the new count.
    #[track_caller]
    pub fn get_frame(&self, pfn: Pfn) -> u32 {
        let frame = self.descriptor(pfn);
        invariant!(frame.reference_count() != 0, "reference taken on unowned {pfn:?}");
        frame.get()
    }

    /// Drop a reference. The block goes back to the allocator when the last
    /// reference is gone and nothing maps it; returns whether it was freed.
    #[track_caller]
    pub fn put_frame(&self, cpu: CpuId, pfn: Pfn) -> bool {
        self.put_from(Some(cpu), pfn)
    }

    /// [`Pmm::put_frame`] releasing straight to the zone.
    #[track_caller]
    pub fn put_frame_direct(&self, pfn: Pfn) -> bool {
        self.put_from(None, pfn)
    }

    #[track_caller]
    fn put_from(&self, cpu: Option<CpuId>, pfn: Pfn) -> bool {
        let frame = self.descriptor(pfn);
        if frame.put() != 0 {
            return false;
        }
        if frame.mapped_count() != 0 {
            log::warn!("pmm: last reference to {pfn:?} dropped while still mapped");
            return false;
        }
        self.release(cpu, pfn, frame.order());
        true
    }

    /// Return every frame cached on `cpu` to its zones.
    pub fn drain_cpu(&self, cpu: CpuId) -> usize {
        let drained = self
            .pcp
            .drain(cpu, self.home(self.node_of_cpu(cpu)), &self.model);
        if drained != 0 {
            log::trace!("pmm: drained {drained} frames from {cpu:?}");
        }
        drained
    }

    fn drain_all(&self) -> usize {
        self.pcp.cpus().map(|cpu| self.drain_cpu(cpu)).sum()
    }

    /// Frames parked in `cpu`'s cache.
    #[must_use]
    pub fn cached_frames(&self, cpu: CpuId) -> usize {
        self.pcp.cached(cpu)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::FrameState;
    use kernel_info::memory::{PCP_BATCH, PCP_HIGH};
    use kernel_info::topology::{NumaCpuAffinity, NumaMemoryAffinity};
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_vmem::testing::TestPhys;

    const CPU0: CpuId = CpuId::new(0);
    const MIB: u64 = 1 << 20;

    fn single(size: u64) -> Pmm {
        Pmm::new(&NumaTopology::uniform(), &[BootMemoryRegion::usable(0, size)]).unwrap()
    }

    fn two_nodes() -> Pmm {
        let topo = NumaTopology {
            memory: alloc::vec![
                NumaMemoryAffinity {
                    node: NodeId::new(0),
                    range: PhysicalRange::new(PhysicalAddress::new(0), 64 * MIB),
                },
                NumaMemoryAffinity {
                    node: NodeId::new(1),
                    range: PhysicalRange::new(PhysicalAddress::new(64 * MIB), 64 * MIB),
                },
            ],
            cpus: alloc::vec![
                NumaCpuAffinity { cpu: CpuId::new(0), node: NodeId::new(0) },
                NumaCpuAffinity { cpu: CpuId::new(1), node: NodeId::new(1) },
            ],
            distances: alloc::vec![alloc::vec![10, 20], alloc::vec![20, 10]],
        };
        let map = [
            BootMemoryRegion::new(0, 64 * MIB, BootMemoryKind::Usable, NodeId::new(0)),
            BootMemoryRegion::new(64 * MIB, 64 * MIB, BootMemoryKind::Usable, NodeId::new(1)),
        ];
        Pmm::new(&topo, &map).unwrap()
    }

    #[test]
    fn boot_map_kinds() {
        let map = [
            BootMemoryRegion::usable(0x10_0000, 0x10_0000),
            BootMemoryRegion::new(0x20_0000, 0x1_0000, BootMemoryKind::Reserved, NodeId::new(0)),
            BootMemoryRegion::new(0xfee0_0000, 0x1000, BootMemoryKind::Mmio, NodeId::new(0)),
            BootMemoryRegion::usable(0x30_0800, 0x800),
        ];
        let pmm = Pmm::new(&NumaTopology::uniform(), &map).unwrap();
        let stats = pmm.stats();
        assert_eq!(stats.managed, 256);
        assert_eq!(stats.reserved, 16);
        assert_eq!(stats.present, 272);
        assert_eq!(stats.free, 256);
        assert_eq!(stats.allocated, 16);
    }

    #[test]
    fn sixteen_mib_scenario() {
        let pmm = single(16 * MIB);
        let dma = pmm.nodes()[0].zone(ZoneType::Dma);
        assert_eq!(dma.managed(), 4096);
        for _ in 0..4096 {
            dma.alloc(pmm.model(), 0).unwrap();
        }
        assert_eq!(dma.alloc(pmm.model(), 0), Err(Status::OutOfMem));
        assert_eq!(pmm.alloc(CPU0, Gaf::BOOT, 0), Err(Status::OutOfMem));
    }

    #[test]
    fn exhaustion_is_deterministic() {
        let pmm = single(4 * MIB);
        let mut held = Vec::new();
        while let Ok(pfn) = pmm.alloc(CPU0, Gaf::REQUIRED, 0) {
            held.push(pfn);
        }
        assert_eq!(held.len(), 1024);
        assert_eq!(pmm.alloc(CPU0, Gaf::REQUIRED, 0), Err(Status::OutOfMem));
        pmm.free_frames(CPU0, &held);
        pmm.drain_cpu(CPU0);
        assert_eq!(pmm.stats().free, 1024);
        assert_eq!(pmm.stats().allocated, 0);
    }

    #[test]
    fn critical_watermark_needs_required() {
        let pmm = single(4 * MIB);
        let mut plain = 0;
        while pmm.alloc(CPU0, Gaf::KERNEL, 0).is_ok() {
            plain += 1;
        }
        // 1024 managed, critical mark 16
        assert_eq!(plain, 1024 - 16);
        assert!(pmm.alloc(CPU0, Gaf::REQUIRED, 0).is_ok());
    }

    #[test]
    fn request_validation() {
        let pmm = single(MIB);
        assert_eq!(pmm.alloc(CPU0, Gaf::NEVER_FAIL, 0), Err(Status::Unsupported));
        assert_eq!(pmm.alloc(CPU0, Gaf::KERNEL, MAX_FRAME_ORDER + 1), Err(Status::InvalidArguments));
        assert_eq!(pmm.alloc_on_node(NodeId::new(3), Gaf::KERNEL, 0), Err(Status::OutOfRange));
        assert_eq!(pmm.alloc_frames(CPU0, Gaf::KERNEL, 0), Err(Status::InvalidArguments));
    }

    #[test]
    fn attach_errors() {
        let mut pmm = single(MIB);
        let again = PhysicalRange::new(PhysicalAddress::new(0x8_0000), 0x1000);
        assert_eq!(pmm.attach_range(NodeId::new(0), again, None), Err(Status::InvalidArguments));
        let fresh = PhysicalRange::new(PhysicalAddress::new(2 * MIB), MIB);
        assert_eq!(pmm.attach_range(NodeId::new(4), fresh, None), Err(Status::OutOfRange));
        pmm.attach_range(NodeId::new(0), fresh, None).unwrap();
        assert_eq!(pmm.stats().managed, 512);
    }

    #[test]
    fn order_zero_goes_through_the_cpu_cache() {
        let pmm = single(16 * MIB);
        let pfn = pmm.alloc(CPU0, Gaf::KERNEL, 0).unwrap();
        assert_eq!(pmm.cached_frames(CPU0), PCP_BATCH - 1);
        let frame = pmm.frame(pfn).unwrap();
        assert_eq!(frame.reference_count(), 1);
        assert!(!frame.state().contains(FrameState::CACHED));

        pmm.free(CPU0, pfn, 0);
        assert_eq!(pmm.cached_frames(CPU0), PCP_BATCH);
        assert!(pmm.frame(pfn).unwrap().state().contains(FrameState::CACHED));

        assert_eq!(pmm.drain_cpu(CPU0), PCP_BATCH);
        assert_eq!(pmm.cached_frames(CPU0), 0);
        assert_eq!(pmm.stats().allocated, 0);
    }

    #[test]
    fn cache_overflow_drains_a_batch() {
        let pmm = single(16 * MIB);
        let frames = pmm.alloc_frames(CPU0, Gaf::KERNEL, PCP_HIGH + 1).unwrap();
        pmm.drain_cpu(CPU0);
        pmm.free_frames(CPU0, &frames);
        assert_eq!(pmm.cached_frames(CPU0), PCP_HIGH + 1 - PCP_BATCH);
        assert_eq!(pmm.stats().cached as usize, PCP_HIGH + 1 - PCP_BATCH);
    }

    #[test]
    fn alloc_frames_is_all_or_nothing() {
        let pmm = single(MIB);
        assert_eq!(pmm.alloc_frames(CPU0, Gaf::REQUIRED, 257), Err(Status::OutOfMem));
        pmm.drain_cpu(CPU0);
        assert_eq!(pmm.stats().free, 256);
        let frames = pmm.alloc_frames(CPU0, Gaf::REQUIRED, 256).unwrap();
        assert_eq!(frames.len(), 256);
    }

    #[test]
    fn references_gate_the_free() {
        let pmm = single(MIB);
        let pfn = pmm.alloc(CPU0, Gaf::KERNEL, 2).unwrap();
        assert_eq!(pmm.get_frame(pfn), 2);
        assert!(!pmm.put_frame(CPU0, pfn));
        let frame = pmm.frame(pfn).unwrap();
        frame.map();
        assert!(!pmm.put_frame(CPU0, pfn));
        assert!(!frame.is_free());

        frame.unmap();
        frame.set_reference_count(1);
        assert!(pmm.put_frame(CPU0, pfn));
        assert_eq!(pmm.stats().allocated, 0);
    }

    #[test]
    fn split_blocks_free_page_by_page() {
        let pmm = single(MIB);
        let pfn = pmm.alloc_near(NodeId::new(0), Gaf::KERNEL, 3).unwrap();
        pmm.split_block(pfn, 3);
        for i in 0..8 {
            assert_eq!(pmm.frame(pfn + i).unwrap().reference_count(), 1);
        }
        for i in (0..8).rev() {
            assert!(pmm.put_frame(CPU0, pfn + i));
        }
        pmm.drain_cpu(CPU0);
        assert_eq!(pmm.stats().allocated, 0);
        assert_eq!(pmm.stats().free, 256);
    }

    #[test]
    fn numa_fidelity() {
        let pmm = two_nodes();
        assert_eq!(pmm.node_of_cpu(CpuId::new(1)), NodeId::new(1));

        let local = pmm.alloc(CpuId::new(1), Gaf::KERNEL, 3).unwrap();
        assert_eq!(pmm.frame(local).unwrap().node(), NodeId::new(1));

        let pinned = pmm.alloc_on_node(NodeId::new(0), Gaf::KERNEL, 0).unwrap();
        assert_eq!(pmm.frame(pinned).unwrap().node(), NodeId::new(0));
    }

    #[test]
    fn fallback_respects_only_this_node() {
        let pmm = two_nodes();
        let node1 = pmm.node(NodeId::new(1)).unwrap();
        let mut held = Vec::new();
        while let Ok(pfn) = pmm.alloc_on_node(NodeId::new(1), Gaf::REQUIRED, MAX_FRAME_ORDER) {
            held.push(pfn);
        }
        while let Ok(pfn) = pmm.alloc_on_node(NodeId::new(1), Gaf::REQUIRED, 0) {
            held.push(pfn);
        }
        assert_eq!(node1.free_frames(), 0);

        let cpu1 = CpuId::new(1);
        assert_eq!(pmm.alloc(cpu1, Gaf::BOOT, 0), Err(Status::OutOfMem));
        let remote = pmm.alloc(cpu1, Gaf::KERNEL, 0).unwrap();
        assert_eq!(pmm.frame(remote).unwrap().node(), NodeId::new(0));
    }

    #[test]
    fn zeroed_allocations() {
        let pmm = single(MIB);
        let phys = TestPhys::new();
        let pfn = pmm.alloc(CPU0, Gaf::KERNEL, 1).unwrap();
        unsafe { phys.write_bytes(pfn.to_phys() + PAGE_SIZE, &[0xaa; 8]) };
        pmm.free(CPU0, pfn, 1);

        let pfn = pmm.alloc_zeroed(CPU0, Gaf::USER, 1, &phys).unwrap();
        let mut buf = [0xffu8; 8];
        unsafe { phys.read_bytes(pfn.to_phys() + PAGE_SIZE, &mut buf) };
        assert_eq!(buf, [0; 8]);
    }
}
