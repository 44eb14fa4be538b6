//! # Memory Objects
//!
//! A [`VmObject`] is the content a mapping shows: either pages the kernel
//! allocates on demand ([`VmObjectPaged`]) or a fixed physical window
//! ([`VmObjectPhysical`]). Offsets and sizes are bytes and must be
//! page-granular.

use crate::aspace::AddressSpace;
use crate::context::VmContext;
use crate::paged::VmObjectPaged;
use alloc::sync::{Arc, Weak};
use bitflags::bitflags;
use kernel_info::{CpuId, Result, Status};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, VirtualAddress, is_aligned};
use kernel_vmem::MmuFlags;

bitflags! {
    /// Creation options of a memory object.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct VmoFlags: u32 {
        /// Size may change after creation.
        const RESIZABLE  = 1 << 0;
        /// All pages in one physically contiguous block, committed up front.
        const CONTIGUOUS = 1 << 1;
        /// Absent pages come from a page provider.
        const PAGER      = 1 << 2;
        /// Physical objects only: map with the default cache policy.
        const CACHED     = 1 << 3;
    }
}

/// How `commit_range` fills absent pages.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CommitOption {
    /// Allocate zeroed frames.
    Populate,
    /// Install zero markers only; frames come on the first write.
    ZeroMarker,
}

/// Byte range `[offset, offset + size)` of an object of `object_size` bytes
/// as `(first page, page count)`.
pub(crate) const fn page_span(offset: u64, size: u64, object_size: u64) -> Result<(u64, u64)> {
    if size == 0 || !is_aligned(offset, PAGE_SIZE) || !is_aligned(size, PAGE_SIZE) {
        return Err(Status::InvalidArguments);
    }
    match offset.checked_add(size) {
        Some(end) if end <= object_size => Ok((offset / PAGE_SIZE, size / PAGE_SIZE)),
        _ => Err(Status::OutOfRange),
    }
}

/// One place an object is mapped, used to reach its translations when pages
/// change underneath.
#[derive(Debug, Clone)]
pub(crate) struct MappingLink {
    pub(crate) id: u64,
    pub(crate) aspace: Weak<AddressSpace>,
    pub(crate) base: VirtualAddress,
    /// Object byte offset shown at `base`.
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl MappingLink {
    /// Part of object pages `[first, first + count)` this mapping shows, as
    /// `(address, pages)`.
    pub(crate) fn span(&self, first: u64, count: u64) -> Option<(VirtualAddress, u64)> {
        let lo = (first * PAGE_SIZE).max(self.offset);
        let hi = ((first + count) * PAGE_SIZE).min(self.offset + self.size);
        (lo < hi).then(|| (self.base + (lo - self.offset), (hi - lo) / PAGE_SIZE))
    }
}

/// A fixed physical window, typically device memory.
#[derive(Debug)]
pub struct VmObjectPhysical {
    id: u64,
    base: PhysicalAddress,
    size: u64,
    flags: VmoFlags,
}

impl VmObjectPhysical {
    /// # Errors
    /// [`Status::InvalidArguments`] for an empty or unaligned window, or for
    /// flags other than [`VmoFlags::CACHED`].
    pub fn create(
        ctx: &VmContext,
        base: PhysicalAddress,
        size: u64,
        flags: VmoFlags,
    ) -> Result<Arc<VmObject>> {
        if size == 0
            || !is_aligned(base.as_u64(), PAGE_SIZE)
            || !is_aligned(size, PAGE_SIZE)
            || base.checked_add(size).is_none()
            || !VmoFlags::CACHED.contains(flags)
        {
            return Err(Status::InvalidArguments);
        }
        Ok(Arc::new(VmObject::Physical(Self {
            id: ctx.next_id(),
            base,
            size,
            flags,
        })))
    }

    /// Physical address shown at `offset`.
    ///
    /// # Errors
    /// [`Status::OutOfRange`] past the end of the window.
    pub fn lookup_range(&self, offset: u64) -> Result<PhysicalAddress> {
        if offset >= self.size {
            return Err(Status::OutOfRange);
        }
        Ok(self.base + offset)
    }

    #[must_use]
    pub const fn base(&self) -> PhysicalAddress {
        self.base
    }
}

/// A memory object.
#[derive(Debug)]
pub enum VmObject {
    Paged(VmObjectPaged),
    Physical(VmObjectPhysical),
}

impl VmObject {
    #[must_use]
    pub fn id(&self) -> u64 {
        match self {
            Self::Paged(p) => p.id(),
            Self::Physical(p) => p.id,
        }
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        match self {
            Self::Paged(p) => p.size(),
            Self::Physical(p) => p.size,
        }
    }

    #[must_use]
    pub fn flags(&self) -> VmoFlags {
        match self {
            Self::Paged(p) => p.flags(),
            Self::Physical(p) => p.flags,
        }
    }

    #[must_use]
    pub const fn as_paged(&self) -> Option<&VmObjectPaged> {
        match self {
            Self::Paged(p) => Some(p),
            Self::Physical(_) => None,
        }
    }

    #[must_use]
    pub const fn as_physical(&self) -> Option<&VmObjectPhysical> {
        match self {
            Self::Physical(p) => Some(p),
            Self::Paged(_) => None,
        }
    }

    /// Back `[offset, offset + size)`. Returns the number of pages newly
    /// committed; a physical window is always backed and commits nothing.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for an empty or unaligned range.
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - See [`VmObjectPaged::commit_range`].
    pub fn commit_range(
        &self,
        cpu: CpuId,
        offset: u64,
        size: u64,
        option: CommitOption,
    ) -> Result<u64> {
        match self {
            Self::Paged(p) => p.commit_range(cpu, offset, size, option),
            Self::Physical(p) => page_span(offset, size, p.size).map(|_| 0),
        }
    }

    /// # Errors
    /// [`Status::Unsupported`] for physical windows, otherwise see
    /// [`VmObjectPaged::decommit`].
    pub fn decommit(&self, cpu: CpuId, offset: u64, size: u64) -> Result<u64> {
        match self {
            Self::Paged(p) => p.decommit(cpu, offset, size),
            Self::Physical(_) => Err(Status::Unsupported),
        }
    }

    /// Physical address of the byte at `offset`, if a frame backs it.
    ///
    /// # Errors
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - [`Status::NotFound`] if the page is absent or reads as zeroes.
    pub fn lookup(&self, offset: u64) -> Result<PhysicalAddress> {
        match self {
            Self::Paged(p) => p.lookup(offset),
            Self::Physical(p) => p.lookup_range(offset),
        }
    }

    /// # Errors
    /// [`Status::Unsupported`] for physical windows, otherwise see
    /// [`VmObjectPaged::create_cow_clone`].
    pub fn create_cow_clone(
        self: &Arc<Self>,
        cpu: CpuId,
        offset: u64,
        size: u64,
    ) -> Result<Arc<Self>> {
        match &**self {
            Self::Paged(p) => p.create_cow_clone(self, cpu, offset, size),
            Self::Physical(_) => Err(Status::Unsupported),
        }
    }

    /// Final permissions of a mapping of this object.
    pub(crate) fn mapping_flags(&self, flags: MmuFlags) -> MmuFlags {
        match self {
            Self::Physical(p) if !p.flags.contains(VmoFlags::CACHED) => flags | MmuFlags::UNCACHED,
            _ => flags,
        }
    }

    /// Register a mapping; returns its link id. Physical windows never
    /// change underneath their mappings and keep no links.
    pub(crate) fn attach(
        &self,
        aspace: Weak<AddressSpace>,
        base: VirtualAddress,
        offset: u64,
        size: u64,
    ) -> u64 {
        match self {
            Self::Paged(p) => p.attach(aspace, base, offset, size),
            Self::Physical(_) => 0,
        }
    }

    pub(crate) fn detach(&self, link: u64) {
        if let Self::Paged(p) = self {
            p.detach(link);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_span_checks_order() {
        assert_eq!(page_span(0, 0, 0x4000), Err(Status::InvalidArguments));
        assert_eq!(page_span(0x800, 0x1000, 0x4000), Err(Status::InvalidArguments));
        assert_eq!(page_span(0x3000, 0x2000, 0x4000), Err(Status::OutOfRange));
        assert_eq!(page_span(u64::MAX & !0xFFF, 0x1000, 0x4000), Err(Status::OutOfRange));
        assert_eq!(page_span(0x1000, 0x3000, 0x4000), Ok((1, 3)));
    }

    #[test]
    fn link_span_clips_to_the_mapping() {
        let link = MappingLink {
            id: 1,
            aspace: Weak::new(),
            base: VirtualAddress::new(0x40_0000),
            offset: 0x2000,
            size: 0x3000,
        };
        // Object pages 2..5 are shown at 0x40_0000..0x40_3000.
        assert_eq!(link.span(0, 2), None);
        assert_eq!(link.span(0, 4), Some((VirtualAddress::new(0x40_0000), 2)));
        assert_eq!(link.span(4, 8), Some((VirtualAddress::new(0x40_2000), 1)));
        assert_eq!(link.span(5, 1), None);
    }
}
