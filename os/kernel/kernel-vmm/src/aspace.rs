//! # Address Spaces
//!
//! An [`AddressSpace`] owns a region tree and the page table its mappings
//! are installed in. The kernel space uses the shared kernel table; each
//! user space has its own table whose upper half is copied from the kernel
//! table, and its own PCID.
//!
//! Translations are installed lazily by [`AddressSpace::handle_fault`];
//! creating a region never touches the page table.

use crate::context::VmContext;
use crate::error::RegionError;
use crate::object::VmObject;
use crate::paged::Resolution;
use crate::region::{Area, Backing, Mapping, Region, RegionInfo, RegionRange, RegionSet};
use alloc::sync::{Arc, Weak};
use core::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use kernel_info::fatal::{Canary, fourcc};
use kernel_info::memory::{KERNEL_ASPACE_BASE, KERNEL_ASPACE_END, USER_ASPACE_BASE, USER_ASPACE_END};
use kernel_info::{CpuId, Result, Status};
use kernel_memory_addresses::{
    PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress, VirtualRange, is_aligned,
};
use kernel_sync::{MutexGuard, RawTicket, TicketMutex};
use kernel_vmem::{AddressSpaceTag, ArchPageTable, MmuFlags, PhysMapperExt, UnmapControl};

const ASPACE_MAGIC: u32 = fourcc(b"VMAS");

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum AspaceKind {
    Kernel,
    User,
}

impl AspaceKind {
    /// Addresses a space of this kind may map.
    #[must_use]
    pub const fn range(self) -> VirtualRange {
        match self {
            Self::Kernel => VirtualRange::new(
                VirtualAddress::new(KERNEL_ASPACE_BASE),
                KERNEL_ASPACE_END - KERNEL_ASPACE_BASE,
            ),
            Self::User => VirtualRange::new(
                VirtualAddress::new(USER_ASPACE_BASE),
                USER_ASPACE_END - USER_ASPACE_BASE,
            ),
        }
    }
}

/// A virtual address space.
pub struct AddressSpace {
    canary: Canary<ASPACE_MAGIC>,
    kind: AspaceKind,
    ctx: Arc<VmContext>,
    /// `None` for the kernel space, which edits the shared kernel table.
    arch: Option<ArchPageTable>,
    regions: TicketMutex<RegionSet>,
    this: Weak<Self>,
    faults: AtomicU64,
    users: AtomicUsize,
    destroyed: AtomicBool,
}

impl core::fmt::Debug for AddressSpace {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AddressSpace")
            .field("kind", &self.kind)
            .field("root", &self.table().root())
            .field("tag", &self.table().tag())
            .field("faults", &self.faults)
            .field("users", &self.users)
            .finish_non_exhaustive()
    }
}

impl AddressSpace {
    /// # Errors
    /// - [`Status::AlreadyExists`] for a second kernel space.
    /// - [`Status::NoResource`] if no PCID is left.
    /// - [`Status::OutOfMem`] if the root table cannot be allocated.
    pub fn create(ctx: &Arc<VmContext>, kind: AspaceKind) -> Result<Arc<Self>> {
        let arch = match kind {
            AspaceKind::Kernel => {
                if !ctx.claim_kernel() {
                    return Err(Status::AlreadyExists);
                }
                None
            }
            AspaceKind::User => {
                let tag = if ctx.config().pcid_enabled {
                    ctx.pcids().alloc()?
                } else {
                    AddressSpaceTag::KERNEL
                };
                match ArchPageTable::new_user(ctx.kernel_table(), ctx.page_source(), tag) {
                    Ok(table) => Some(table),
                    Err(e) => {
                        if tag != AddressSpaceTag::KERNEL {
                            ctx.pcids().free(tag);
                        }
                        return Err(e);
                    }
                }
            }
        };

        let aspace = Arc::new_cyclic(|this| Self {
            canary: Canary::new(),
            kind,
            ctx: ctx.clone(),
            arch,
            regions: TicketMutex::new(RegionSet::new()),
            this: this.clone(),
            faults: AtomicU64::new(0),
            users: AtomicUsize::new(0),
            destroyed: AtomicBool::new(false),
        });
        log::debug!(
            "aspace {kind:?}: root {:?}, tag {}",
            aspace.table().root(),
            aspace.table().tag().as_u16()
        );
        Ok(aspace)
    }

    #[must_use]
    pub const fn kind(&self) -> AspaceKind {
        self.kind
    }

    #[must_use]
    pub const fn range(&self) -> VirtualRange {
        self.kind.range()
    }

    /// The page table mappings of this space are installed in.
    #[must_use]
    pub fn table(&self) -> &ArchPageTable {
        self.arch.as_ref().unwrap_or_else(|| self.ctx.kernel_table())
    }

    #[must_use]
    pub fn faults(&self) -> u64 {
        self.faults.load(Ordering::Relaxed)
    }

    /// CPUs that have switched to this space and not away from it.
    #[must_use]
    pub fn users(&self) -> usize {
        self.users.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    pub(crate) const fn ctx(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    pub(crate) fn regions(&self) -> MutexGuard<'_, RegionSet, RawTicket> {
        self.regions.lock()
    }

    pub(crate) fn count_fault(&self) {
        self.faults.fetch_add(1, Ordering::Relaxed);
    }

    #[track_caller]
    pub(crate) fn check(&self) -> Result<()> {
        self.canary.verify();
        if self.is_destroyed() {
            return Err(Status::BadState);
        }
        Ok(())
    }

    /// Re-copy the kernel's upper root slots into a user table.
    pub fn sync_kernel_aspace(&self) {
        self.canary.verify();
        if let Some(table) = &self.arch {
            table.sync_upper_half(self.ctx.kernel_table());
        }
    }

    /// Add a region. With a `backing` it maps the object; without one it
    /// reserves an area that later regions may be placed in. Returns the
    /// base.
    ///
    /// `align` applies to gap search and must be a power of two of at
    /// least a page; zero means a page. User spaces add
    /// [`MmuFlags::USER`] themselves.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for a zero or unaligned size or base,
    ///   a bad alignment, flags without access or with `USER`, flags an
    ///   enclosing area does not allow, or an unaligned backing offset.
    /// - [`Status::OutOfRange`] if the range leaves the address space or the
    ///   object.
    /// - [`Status::AlreadyExists`] if it overlaps a region.
    /// - [`Status::NoResource`] if no gap is large enough.
    /// - [`Status::BadState`] if the address space was destroyed.
    pub fn create_subregion(
        &self,
        range: RegionRange,
        align: u64,
        flags: MmuFlags,
        backing: Option<Backing>,
    ) -> Result<VirtualAddress> {
        self.check()?;
        let align = if align == 0 { PAGE_SIZE } else { align };
        if range.size == 0
            || !is_aligned(range.size, PAGE_SIZE)
            || !align.is_power_of_two()
            || align < PAGE_SIZE
            || flags.contains(MmuFlags::USER)
            || (backing.is_some() && !flags.has_access())
        {
            return Err(Status::InvalidArguments);
        }
        if let Some(backing) = &backing {
            if !is_aligned(backing.offset, PAGE_SIZE) {
                return Err(Status::InvalidArguments);
            }
            if backing
                .offset
                .checked_add(range.size)
                .is_none_or(|end| end > backing.object.size())
            {
                return Err(Status::OutOfRange);
            }
        }

        let mut regions = self.regions.lock();
        let root = self.range();
        let (target, allowed, range) = match range.base {
            Some(base) => {
                let range = VirtualRange::new(base, range.size);
                if !base.is_aligned::<Size4K>() {
                    return Err(RegionError::Invalid.into());
                }
                if !root.contains_range(&range) {
                    return Err(RegionError::OutsideRoot.into());
                }
                let (target, allowed) = regions.container_mut(&range, MmuFlags::all())?;
                (target, allowed, range)
            }
            None => {
                let base = regions.find_gap(&root, range.size, align)?;
                (&mut *regions, MmuFlags::all(), VirtualRange::new(base, range.size))
            }
        };
        if !allowed.contains(flags & MmuFlags::ACCESS) {
            return Err(RegionError::Invalid.into());
        }

        let region = match backing {
            Some(Backing { object, offset }) => {
                let flags = self.mapping_flags(&object, flags);
                Region::Mapping(Mapping::new(self.this.clone(), range, flags, object, offset))
            }
            None => Region::Area(Area::new(range, flags)),
        };
        log::trace!("aspace {:?}: {:?} {:?}", self.kind, region.range(), region.info().kind);
        target.insert(region);
        Ok(range.base)
    }

    /// A region that maps nothing but can hold regions placed inside it.
    ///
    /// # Errors
    /// See [`AddressSpace::create_subregion`].
    pub fn reserve_subregion(
        &self,
        range: RegionRange,
        align: u64,
        flags: MmuFlags,
    ) -> Result<VirtualAddress> {
        self.create_subregion(range, align, flags, None)
    }

    /// Remove the region starting at `base`, areas with everything inside,
    /// and drop its translations.
    ///
    /// # Errors
    /// - [`Status::NotFound`] if no region starts at `base`.
    /// - [`Status::BadState`] if the address space was destroyed.
    pub fn destroy_subregion(&self, cpu: CpuId, base: VirtualAddress) -> Result<()> {
        self.check()?;
        let mut regions = self.regions.lock();
        let region = regions
            .remove(base)
            .ok_or(RegionError::NotFound(base.as_u64()))?;
        let range = region.range();
        self.unmap_pages(cpu, range.base, range.pages());
        drop(regions);
        log::trace!("aspace {:?}: removed {range:?}", self.kind);
        drop(region);
        Ok(())
    }

    /// The innermost region containing `va`.
    ///
    /// # Errors
    /// [`Status::NotFound`] if no region contains it.
    pub fn find_subregion(&self, va: VirtualAddress) -> Result<RegionInfo> {
        self.canary.verify();
        self.regions
            .lock()
            .find_deepest(va)
            .map(Region::info)
            .ok_or(Status::NotFound)
    }

    /// Change the permissions of `range`, which must lie within one mapping.
    /// The mapping is split at the range's edges. Pages still shared
    /// copy-on-write stay read-only.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for an empty or unaligned range, flags
    ///   without access or with `USER`, or a range that leaves its mapping.
    /// - [`Status::NotFound`] if no mapping contains the start.
    /// - [`Status::BadState`] if the address space was destroyed.
    pub fn protect(&self, cpu: CpuId, range: VirtualRange, flags: MmuFlags) -> Result<()> {
        self.check()?;
        if range.is_empty()
            || !range.is_page_aligned()
            || !flags.has_access()
            || flags.contains(MmuFlags::USER)
        {
            return Err(Status::InvalidArguments);
        }
        let mut regions = self.regions.lock();
        let not_found = RegionError::NotFound(range.base.as_u64());
        let set = regions.mapping_set_mut(range.base).ok_or(not_found)?;
        let flags = match set.containing(range.base) {
            Some(Region::Mapping(m)) => self.mapping_flags(m.object(), flags),
            _ => return Err(not_found.into()),
        };
        set.reprotect(&self.this, &range, flags)?;

        let table = self.table();
        for i in 0..range.pages() {
            let va = range.base + i * PAGE_SIZE;
            let Ok(current) = table.query(va) else {
                continue;
            };
            let next = if current.flags.contains(MmuFlags::WRITABLE) {
                flags
            } else {
                flags.difference(MmuFlags::WRITABLE)
            };
            table.protect(self.ctx.page_source(), cpu, va, 1, next)?;
        }
        drop(regions);
        Ok(())
    }

    /// A user space whose mappings show copy-on-write clones of this
    /// space's paged objects. Physical windows and contiguous objects are
    /// shared as they are.
    ///
    /// # Errors
    /// - [`Status::Unsupported`] for the kernel space.
    /// - Any error of [`AddressSpace::create`] or of cloning an object.
    pub fn fork(&self, cpu: CpuId) -> Result<Arc<Self>> {
        self.check()?;
        if self.kind != AspaceKind::User {
            return Err(Status::Unsupported);
        }
        let child = Self::create(&self.ctx, AspaceKind::User)?;
        let regions = self.regions.lock();
        let set = Self::fork_set(cpu, &regions, &child.this)?;
        drop(regions);
        *child.regions.lock() = set;
        log::debug!(
            "aspace: forked {:?} into {:?}",
            self.table().root(),
            child.table().root()
        );
        Ok(child)
    }

    fn fork_set(cpu: CpuId, set: &RegionSet, child: &Weak<Self>) -> Result<RegionSet> {
        let mut forked = RegionSet::new();
        for region in set.iter() {
            let info = region.info();
            let copy = match region {
                Region::Area(area) => Region::Area(Area::with_children(
                    info.range,
                    info.flags,
                    Self::fork_set(cpu, area.children(), child)?,
                )),
                Region::Mapping(mapping) => {
                    let object = mapping.object();
                    let (object, offset) =
                        match object.create_cow_clone(cpu, mapping.offset(), info.range.size) {
                            Ok(clone) => (clone, 0),
                            Err(Status::Unsupported) => (object.clone(), mapping.offset()),
                            Err(e) => return Err(e),
                        };
                    Region::Mapping(Mapping::new(
                        child.clone(),
                        info.range,
                        info.flags,
                        object,
                        offset,
                    ))
                }
            };
            forked.insert(copy);
        }
        Ok(forked)
    }

    /// Remove every region and mark the space unusable. The root table is
    /// released when the last reference goes.
    ///
    /// # Errors
    /// [`Status::BadState`] if already destroyed or still installed on a CPU.
    pub fn destroy(&self, cpu: CpuId) -> Result<()> {
        self.canary.verify();
        if self.users() != 0 || self.destroyed.swap(true, Ordering::AcqRel) {
            return Err(Status::BadState);
        }
        let mut regions = self.regions.lock();
        let removed = regions.take_all();
        for region in &removed {
            let range = region.range();
            self.unmap_pages(cpu, range.base, range.pages());
        }
        drop(regions);
        log::debug!("aspace {:?}: destroyed, {} region(s) removed", self.kind, removed.len());
        drop(removed);
        Ok(())
    }

    /// Install `to` on `cpu`, leaving `from`.
    pub fn switch(cpu: CpuId, from: Option<&Self>, to: &Self) {
        to.canary.verify();
        if let Some(from) = from {
            from.canary.verify();
            if core::ptr::eq(from, to) {
                return;
            }
            from.table().deactivate(cpu);
            from.users.fetch_sub(1, Ordering::AcqRel);
        }
        let table = to.table();
        let stale = table.activate(cpu);
        to.users.fetch_add(1, Ordering::AcqRel);
        // Without PCIDs every user space shares the kernel tag.
        let flush =
            stale || (to.kind == AspaceKind::User && table.tag() == AddressSpaceTag::KERNEL);
        to.ctx.mmu().load(cpu, table.root(), table.tag(), flush);
        log::trace!("cpu {cpu:?}: switched to {:?} (flush: {flush})", table.root());
    }

    /// Copy `data` into the object pages behind `va`, resolving them like a
    /// write fault would but without installing translations.
    ///
    /// # Errors
    /// - [`Status::NotFound`] if part of the range is not mapped.
    /// - [`Status::ShouldWait`] if a page provider has not delivered yet.
    /// - [`Status::OutOfMem`] if a private copy cannot be made.
    pub fn write_bytes(&self, cpu: CpuId, va: VirtualAddress, data: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < data.len() {
            let at = va + done as u64;
            let chunk = chunk_len(at, data.len() - done);
            self.with_page(cpu, at, true, |pa| {
                // Safety: the object page is held by its map while the
                // cursor is locked.
                unsafe { self.ctx.mapper().write_bytes(pa, &data[done..done + chunk]) };
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Copy the contents behind `va` into `out`. Untouched pages read as
    /// zeroes.
    ///
    /// # Errors
    /// As for [`AddressSpace::write_bytes`].
    pub fn read_bytes(&self, cpu: CpuId, va: VirtualAddress, out: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < out.len() {
            let at = va + done as u64;
            let chunk = chunk_len(at, out.len() - done);
            let window = &mut out[done..done + chunk];
            self.with_page(cpu, at, false, |pa| {
                // Safety: see `write_bytes`.
                unsafe { self.ctx.mapper().read_bytes(pa, window) };
            })?;
            done += chunk;
        }
        Ok(())
    }

    fn with_page(
        &self,
        cpu: CpuId,
        va: VirtualAddress,
        write: bool,
        f: impl FnOnce(PhysicalAddress),
    ) -> Result<()> {
        self.check()?;
        let regions = self.regions.lock();
        let mapping = regions.mapping_at(va).ok_or(Status::NotFound)?;
        let offset = mapping.object_offset(va);
        let within = va.offset::<Size4K>();
        match &**mapping.object() {
            VmObject::Physical(window) => f(window.lookup_range(offset)? + within),
            VmObject::Paged(object) => {
                let mut cursor = object.cursor();
                match cursor.require_owned_page(cpu, offset / PAGE_SIZE, write)? {
                    Resolution::Page { pfn, .. } => f(pfn.to_phys() + within),
                    Resolution::Wait(_) => return Err(Status::ShouldWait),
                }
            }
        }
        Ok(())
    }

    /// Final permissions of a mapping of `object` in this space.
    fn mapping_flags(&self, object: &VmObject, flags: MmuFlags) -> MmuFlags {
        let flags = object.mapping_flags(flags);
        match self.kind {
            AspaceKind::User => flags | MmuFlags::USER,
            AspaceKind::Kernel => flags,
        }
    }

    /// Drop the translations of `pages` pages from `va` on.
    pub(crate) fn unmap_pages(&self, cpu: CpuId, va: VirtualAddress, pages: u64) {
        if let Err(e) = self
            .table()
            .unmap(self.ctx.page_source(), cpu, va, pages, UnmapControl::WITHOUT_TERMINAL)
        {
            log::warn!("aspace {:?}: unmap of {pages} page(s) at {va:?} failed: {e}", self.kind);
        }
    }

    /// Remove write access from the translation of `va`, if it has one.
    pub(crate) fn write_protect_page(&self, cpu: CpuId, va: VirtualAddress) {
        let table = self.table();
        let Ok(current) = table.query(va) else {
            return;
        };
        if current.flags.contains(MmuFlags::WRITABLE)
            && let Err(e) = table.protect(
                self.ctx.page_source(),
                cpu,
                va,
                1,
                current.flags.difference(MmuFlags::WRITABLE),
            )
        {
            log::warn!("aspace {:?}: write-protect of {va:?} failed: {e}", self.kind);
        }
    }
}

/// Bytes from `va` up to `remaining` that stay within one page.
fn chunk_len(va: VirtualAddress, remaining: usize) -> usize {
    #[allow(clippy::cast_possible_truncation)]
    let room = (PAGE_SIZE - va.offset::<Size4K>()) as usize;
    room.min(remaining)
}

impl Drop for AddressSpace {
    fn drop(&mut self) {
        self.canary.verify();
        let regions = self.regions.get_mut().take_all();
        match self.arch.take() {
            Some(table) => {
                // Reports every remaining leaf as unmapped.
                let tag = table.tag();
                table.destroy(self.ctx.page_source());
                if tag != AddressSpaceTag::KERNEL {
                    self.ctx.pcids().free(tag);
                }
            }
            None => {
                // Kernel space teardown runs on the boot CPU.
                for region in &regions {
                    let range = region.range();
                    self.unmap_pages(CpuId::default(), range.base, range.pages());
                }
            }
        }
        drop(regions);
        self.canary.poison();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;

    #[test]
    fn one_kernel_space_per_context() {
        let ctx = context();
        let kernel = AddressSpace::create(&ctx, AspaceKind::Kernel).unwrap();
        assert_eq!(kernel.table().root(), ctx.kernel_table().root());
        assert_eq!(
            AddressSpace::create(&ctx, AspaceKind::Kernel).err(),
            Some(Status::AlreadyExists)
        );
    }

    #[test]
    fn user_spaces_get_distinct_tags() {
        let ctx = context();
        let a = AddressSpace::create(&ctx, AspaceKind::User).unwrap();
        let b = AddressSpace::create(&ctx, AspaceKind::User).unwrap();
        assert_ne!(a.table().tag(), b.table().tag());
        assert_ne!(a.table().root(), b.table().root());
        assert_eq!(ctx.pcids_in_use(), 2);
        drop(a);
        assert_eq!(ctx.pcids_in_use(), 1);
    }

    #[test]
    fn region_argument_checks() {
        let ctx = context();
        let aspace = AddressSpace::create(&ctx, AspaceKind::User).unwrap();
        let at = |base, size| RegionRange::fixed(VirtualAddress::new(base), size);
        let reserve = |range, flags| aspace.reserve_subregion(range, 0, flags);

        assert_eq!(reserve(at(0x10_0000, 0), MmuFlags::RW), Err(Status::InvalidArguments));
        assert_eq!(reserve(at(0x10_0800, 0x1000), MmuFlags::RW), Err(Status::InvalidArguments));
        assert_eq!(reserve(at(0x10_0000, 0x1000), MmuFlags::USER), Err(Status::InvalidArguments));
        assert_eq!(reserve(at(0, 0x1000), MmuFlags::RW), Err(Status::OutOfRange));
        assert_eq!(
            reserve(at(USER_ASPACE_END - 0x1000, 0x2000), MmuFlags::RW),
            Err(Status::OutOfRange)
        );
        assert_eq!(
            aspace.create_subregion(RegionRange::anywhere(0x1000), 0x1800, MmuFlags::RW, None),
            Err(Status::InvalidArguments)
        );

        assert_eq!(reserve(at(0x10_0000, 0x4000), MmuFlags::RW), Ok(VirtualAddress::new(0x10_0000)));
        assert_eq!(reserve(at(0x10_2000, 0x4000), MmuFlags::RW), Err(Status::AlreadyExists));
        // Nested reservations may not widen the area's permissions.
        assert_eq!(reserve(at(0x10_1000, 0x1000), MmuFlags::RWX), Err(Status::InvalidArguments));
        assert_eq!(reserve(at(0x10_1000, 0x1000), MmuFlags::READABLE), Ok(VirtualAddress::new(0x10_1000)));
        assert_eq!(
            aspace.destroy_subregion(CpuId::default(), VirtualAddress::new(0x20_0000)),
            Err(Status::NotFound)
        );
    }

    #[test]
    fn destroyed_spaces_refuse_work() {
        let ctx = context();
        let aspace = AddressSpace::create(&ctx, AspaceKind::User).unwrap();
        aspace
            .reserve_subregion(RegionRange::anywhere(0x4000), 0, MmuFlags::RW)
            .unwrap();
        aspace.destroy(CpuId::default()).unwrap();
        assert!(aspace.is_destroyed());
        assert_eq!(aspace.destroy(CpuId::default()), Err(Status::BadState));
        assert_eq!(
            aspace.reserve_subregion(RegionRange::anywhere(0x1000), 0, MmuFlags::RW),
            Err(Status::BadState)
        );
    }
}
