//! Shared state of every address space and memory object.

use crate::pcid::PcidAllocator;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use kernel_alloc::{FrameRole, FrameState, Gaf, Pmm, PmmPageSource};
use kernel_info::{CpuId, NodeId, Result};
use kernel_memory_addresses::Pfn;
use kernel_vmem::{ArchPageTable, MmuContext, PhysMapper, PhysMapperExt, TlbFlush};

/// Runtime switches of the virtual memory layer.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct VmmConfig {
    /// Domain the shared zero page is taken from.
    pub zero_page_gaf: Gaf,
    /// Give each user address space its own PCID. Without it every space
    /// runs under the kernel tag and a root load discards the TLB.
    pub pcid_enabled: bool,
}

impl Default for VmmConfig {
    fn default() -> Self {
        Self {
            zero_page_gaf: Gaf::KERNEL,
            pcid_enabled: true,
        }
    }
}

/// Allocator, architecture hooks and the kernel page table, shared by
/// reference from every [`AddressSpace`](crate::AddressSpace) and
/// [`VmObject`](crate::VmObject).
pub struct VmContext {
    pmm: Arc<Pmm>,
    source: PmmPageSource,
    mapper: Arc<dyn PhysMapper>,
    mmu: Arc<dyn MmuContext>,
    kernel_table: ArchPageTable,
    zero_frame: Pfn,
    pcids: PcidAllocator,
    config: VmmConfig,
    next_id: AtomicU64,
    kernel_claimed: AtomicBool,
}

impl core::fmt::Debug for VmContext {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmContext")
            .field("kernel_table", &self.kernel_table)
            .field("zero_frame", &self.zero_frame)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl VmContext {
    /// Build the kernel page table and the shared zero page.
    ///
    /// # Errors
    /// [`Status::OutOfMem`](kernel_info::Status::OutOfMem) if either cannot
    /// be allocated.
    pub fn new(
        pmm: Arc<Pmm>,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
        mmu: Arc<dyn MmuContext>,
        config: VmmConfig,
    ) -> Result<Arc<Self>> {
        let source = PmmPageSource::new(pmm.clone(), NodeId::default());
        let kernel_table = ArchPageTable::new_kernel(&source, mapper.clone(), tlb)?;

        let zero_frame = match pmm.alloc_near(NodeId::default(), config.zero_page_gaf, 0) {
            Ok(pfn) => pfn,
            Err(e) => {
                kernel_table.destroy(&source);
                return Err(e);
            }
        };
        // Safety: freshly allocated, nobody else can see it yet.
        unsafe { mapper.zero_frame(zero_frame.to_phys()) };
        if let Some(frame) = pmm.frame(zero_frame) {
            frame.insert_state(FrameState::PINNED);
        }
        log::debug!(
            "vmm: kernel root {:?}, zero page {zero_frame:?}, pcid {}",
            kernel_table.root(),
            if config.pcid_enabled { "on" } else { "off" }
        );

        Ok(Arc::new(Self {
            pmm,
            source,
            mapper,
            mmu,
            kernel_table,
            zero_frame,
            pcids: PcidAllocator::new(),
            config,
            next_id: AtomicU64::new(1),
            kernel_claimed: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub fn pmm(&self) -> &Pmm {
        &self.pmm
    }

    #[must_use]
    pub const fn page_source(&self) -> &PmmPageSource {
        &self.source
    }

    #[must_use]
    pub fn mapper(&self) -> &dyn PhysMapper {
        &*self.mapper
    }

    #[must_use]
    pub fn mmu(&self) -> &dyn MmuContext {
        &*self.mmu
    }

    /// The page table of the kernel address space. Its upper half is shared
    /// by every user table.
    #[must_use]
    pub const fn kernel_table(&self) -> &ArchPageTable {
        &self.kernel_table
    }

    /// Read-only source of zero-filled pages.
    #[must_use]
    pub const fn zero_frame(&self) -> Pfn {
        self.zero_frame
    }

    #[must_use]
    pub const fn config(&self) -> VmmConfig {
        self.config
    }

    /// PCIDs currently owned by user address spaces.
    #[must_use]
    pub fn pcids_in_use(&self) -> usize {
        self.pcids.in_use()
    }

    pub(crate) const fn pcids(&self) -> &PcidAllocator {
        &self.pcids
    }

    pub(crate) fn next_id(&self) -> u64 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    /// `true` exactly once.
    pub(crate) fn claim_kernel(&self) -> bool {
        !self.kernel_claimed.swap(true, Ordering::AcqRel)
    }

    /// One zeroed frame for object contents, preferring `node` if given.
    pub(crate) fn alloc_page(&self, cpu: CpuId, gaf: Gaf, node: Option<NodeId>) -> Result<Pfn> {
        let pfn = match node {
            Some(node) => self.pmm.alloc_near(node, gaf, 0)?,
            None => self.pmm.alloc(cpu, gaf, 0)?,
        };
        // Safety: freshly allocated and not yet mapped anywhere.
        unsafe { self.mapper.zero_frame(pfn.to_phys()) };
        self.set_lru(pfn);
        Ok(pfn)
    }

    /// A private copy of `src`.
    pub(crate) fn copy_page(
        &self,
        cpu: CpuId,
        gaf: Gaf,
        node: Option<NodeId>,
        src: Pfn,
    ) -> Result<Pfn> {
        let pfn = match node {
            Some(node) => self.pmm.alloc_near(node, gaf, 0)?,
            None => self.pmm.alloc(cpu, gaf, 0)?,
        };
        // Safety: `pfn` is ours alone; the caller holds a reference on `src`.
        unsafe { self.mapper.copy_frame(pfn.to_phys(), src.to_phys()) };
        self.set_lru(pfn);
        Ok(pfn)
    }

    fn set_lru(&self, pfn: Pfn) {
        if let Some(frame) = self.pmm.frame(pfn) {
            frame.set_role(FrameRole::Lru);
        }
    }

    /// Drop one object reference on `pfn`.
    pub(crate) fn release_page(&self, cpu: CpuId, pfn: Pfn) {
        self.pmm.put_frame(cpu, pfn);
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use kernel_info::boot::BootMemoryRegion;
    use kernel_info::topology::NumaTopology;
    use kernel_vmem::testing::{RecordingMmu, RecordingTlb, TestPhys};

    /// A context over 64 MiB of arena-backed memory on one node.
    pub(crate) fn context() -> Arc<VmContext> {
        let pmm = Pmm::new(&NumaTopology::uniform(), &[BootMemoryRegion::usable(0, 64 << 20)]).unwrap();
        VmContext::new(
            Arc::new(pmm),
            Arc::new(TestPhys::new()),
            Arc::new(RecordingTlb::default()),
            Arc::new(RecordingMmu::default()),
            VmmConfig::default(),
        )
        .unwrap()
    }
}
