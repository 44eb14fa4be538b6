use crate::frame::FrameRole;
use crate::gaf::Gaf;
use crate::pmm::Pmm;
use alloc::sync::Arc;
use kernel_info::NodeId;
use kernel_memory_addresses::{PhysicalAddress, Pfn};
use kernel_vmem::PageSource;

/// Feeds page-table frames from the [`Pmm`] and keeps frame `mapped_count`s
/// in step with leaf entries.
///
/// Table frames are taken from `node` (falling back by distance) with
/// [`Gaf::KERNEL`] plus `REQUIRED`: a walk that cannot get a table fails
/// the whole map.
#[derive(Debug, Clone)]
pub struct PmmPageSource {
    pmm: Arc<Pmm>,
    node: NodeId,
}

impl PmmPageSource {
    #[must_use]
    pub const fn new(pmm: Arc<Pmm>, node: NodeId) -> Self {
        Self { pmm, node }
    }

    #[must_use]
    pub fn pmm(&self) -> &Pmm {
        &self.pmm
    }

    fn for_each_frame(&self, pa: PhysicalAddress, frames: u64, f: impl Fn(&crate::frame::Frame)) {
        let first = Pfn::from_phys(pa).as_u64();
        for pfn in first..first + frames {
            // Device memory has no descriptors.
            if let Some(frame) = self.pmm.frame(Pfn::new(pfn))
                && frame.role() != FrameRole::Unused
            {
                f(frame);
            }
        }
    }
}

impl PageSource for PmmPageSource {
    fn alloc_table(&self) -> Option<PhysicalAddress> {
        let pfn = self
            .pmm
            .alloc_near(self.node, Gaf::KERNEL | Gaf::REQUIRED, 0)
            .ok()?;
        if let Some(frame) = self.pmm.frame(pfn) {
            frame.set_role(FrameRole::PageTable);
        }
        Some(pfn.to_phys())
    }

    fn free_table(&self, pa: PhysicalAddress) {
        self.pmm.free_direct(Pfn::from_phys(pa), 0);
    }

    fn leaf_mapped(&self, pa: PhysicalAddress, frames: u64) {
        self.for_each_frame(pa, frames, crate::frame::Frame::map);
    }

    fn leaf_unmapped(&self, pa: PhysicalAddress, frames: u64) {
        self.for_each_frame(pa, frames, crate::frame::Frame::unmap);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::CpuId;
    use kernel_info::boot::BootMemoryRegion;
    use kernel_info::topology::NumaTopology;
    use kernel_memory_addresses::VirtualAddress;
    use kernel_vmem::testing::{RecordingTlb, TestPhys};
    use kernel_vmem::{AddressSpaceTag, MapControl, MmuFlags, PageTable, UnmapControl, X86Paging4};

    #[test]
    fn tables_and_leaves_are_accounted() {
        let map = [BootMemoryRegion::usable(0, 1 << 20)];
        let pmm = Arc::new(Pmm::new(&NumaTopology::uniform(), &map).unwrap());
        let src = PmmPageSource::new(pmm.clone(), NodeId::new(0));
        let cpu = CpuId::new(0);
        let in_use = || pmm.stats().allocated - pmm.stats().cached;

        let pt = PageTable::<X86Paging4>::new(
            &src,
            Arc::new(TestPhys::new()),
            Arc::new(RecordingTlb::default()),
            AddressSpaceTag::new(1),
        )
        .unwrap();
        let data = pmm.alloc(cpu, Gaf::USER, 0).unwrap();
        let va = VirtualAddress::new(0x40_0000);
        pt.map(&src, cpu, va, data.to_phys(), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        assert_eq!(pmm.frame(data).unwrap().mapped_count(), 1);
        assert_eq!(pmm.frame(pt.root().pfn()).unwrap().role(), FrameRole::PageTable);
        // root, PDPT, PD and PT plus the data frame
        assert_eq!(in_use(), 5);

        pt.unmap(&src, cpu, va, 1, UnmapControl::empty()).unwrap();
        assert_eq!(pmm.frame(data).unwrap().mapped_count(), 0);
        pt.destroy(&src);
        pmm.free(cpu, data, 0);
        pmm.drain_cpu(cpu);
        assert_eq!(pmm.stats().allocated, 0);
    }
}
