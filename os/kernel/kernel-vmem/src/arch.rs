use crate::flags::{HarvestControl, MapControl, MmuFlags, UnmapControl};
use crate::mode::{X86Ept4, X86Paging4};
use crate::page_table::{Harvest, PageTable, Translation};
use crate::phys_mapper::PhysMapper;
use crate::source::PageSource;
use crate::tlb::{AddressSpaceTag, TlbFlush};
use alloc::sync::Arc;
use kernel_info::{CpuId, Result};
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::CpuSet;

/// Which hardware format an address space uses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ArchKind {
    /// CPU page tables.
    Mmu,
    /// Extended Page Tables for a guest.
    Ept,
}

/// A page table in one of the supported formats, chosen at construction.
#[derive(Debug)]
pub enum ArchPageTable {
    Mmu(PageTable<X86Paging4>),
    Ept(PageTable<X86Ept4>),
}

macro_rules! dispatch {
    ($self:expr, $pt:ident => $body:expr) => {
        match $self {
            ArchPageTable::Mmu($pt) => $body,
            ArchPageTable::Ept($pt) => $body,
        }
    };
}

impl ArchPageTable {
    pub fn new(
        kind: ArchKind,
        source: &dyn PageSource,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
        tag: AddressSpaceTag,
    ) -> Result<Self> {
        Ok(match kind {
            ArchKind::Mmu => Self::Mmu(PageTable::new(source, mapper, tlb, tag)?),
            ArchKind::Ept => Self::Ept(PageTable::new(source, mapper, tlb, tag)?),
        })
    }

    /// The kernel's CPU page table.
    pub fn new_kernel(
        source: &dyn PageSource,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
    ) -> Result<Self> {
        Ok(Self::Mmu(PageTable::new_kernel(source, mapper, tlb)?))
    }

    /// A user CPU page table sharing `kernel`'s upper half.
    pub fn new_user(kernel: &Self, source: &dyn PageSource, tag: AddressSpaceTag) -> Result<Self> {
        match kernel {
            Self::Mmu(k) => Ok(Self::Mmu(PageTable::new_sharing(k, source, tag)?)),
            Self::Ept(_) => Err(kernel_info::Status::Unsupported),
        }
    }

    /// Re-copy `kernel`'s upper root slots. Only CPU tables share them.
    pub fn sync_upper_half(&self, kernel: &Self) {
        if let (Self::Mmu(user), Self::Mmu(k)) = (self, kernel) {
            user.sync_upper_half(k);
        }
    }

    #[must_use]
    pub const fn kind(&self) -> ArchKind {
        match self {
            Self::Mmu(_) => ArchKind::Mmu,
            Self::Ept(_) => ArchKind::Ept,
        }
    }

    #[allow(clippy::too_many_arguments)]
    pub fn map(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        pa: PhysicalAddress,
        n: u64,
        flags: MmuFlags,
        control: MapControl,
    ) -> Result<u64> {
        dispatch!(self, pt => pt.map(source, cpu, va, pa, n, flags, control))
    }

    pub fn unmap(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        control: UnmapControl,
    ) -> Result<u64> {
        dispatch!(self, pt => pt.unmap(source, cpu, va, n, control))
    }

    pub fn protect(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        flags: MmuFlags,
    ) -> Result<()> {
        dispatch!(self, pt => pt.protect(source, cpu, va, n, flags))
    }

    pub fn query(&self, va: VirtualAddress) -> Result<Translation> {
        dispatch!(self, pt => pt.query(va))
    }

    pub fn harvest_accessed(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        action: HarvestControl,
    ) -> Result<Harvest> {
        dispatch!(self, pt => pt.harvest_accessed(source, cpu, va, n, action))
    }

    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        dispatch!(self, pt => pt.root())
    }

    #[must_use]
    pub fn tag(&self) -> AddressSpaceTag {
        dispatch!(self, pt => pt.tag())
    }

    #[must_use]
    pub fn table_count(&self) -> usize {
        dispatch!(self, pt => pt.table_count())
    }

    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        dispatch!(self, pt => pt.active_cpus())
    }

    pub fn activate(&self, cpu: CpuId) -> bool {
        dispatch!(self, pt => pt.activate(cpu))
    }

    pub fn deactivate(&self, cpu: CpuId) {
        dispatch!(self, pt => pt.deactivate(cpu));
    }

    #[cfg(any(test, feature = "test-support"))]
    pub fn simulate_access(&self, va: VirtualAddress) -> Result<()> {
        dispatch!(self, pt => pt.simulate_access(va))
    }

    pub fn destroy(self, source: &dyn PageSource) {
        dispatch!(self, pt => pt.destroy(source));
    }
}
