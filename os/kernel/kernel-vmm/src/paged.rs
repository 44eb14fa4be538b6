//! # Paged Objects
//!
//! Pages are committed lazily: the first touch of an index allocates a
//! frame, installs a zero marker or asks the page provider. Clones share
//! frames as [`Slot::Shared`] until one side writes.
//!
//! ```text
//!                 write                       read
//!  absent   ──► Owned(new zeroed)       ──► Zero (maps zero frame RO)
//!  Zero     ──► Owned(new zeroed)       ──► Zero
//!  Shared   ──► ref == 1 ? Owned(same)  ──► Shared (maps RO)
//!               : Owned(copy), put old
//!  Owned    ──► Owned                   ──► Owned
//! ```
//!
//! Whenever a slot changes its frame, every mapping of the index is
//! removed first, so no translation outlives the reference it was built on.
//!
//! A clone of an object whose absent pages are not plain zeroes (a pager
//! object, or a clone of one) keeps its parent. Absent pages are taken from
//! the parent on first touch and shared like the pages present at clone time.

use crate::aspace::AddressSpace;
use crate::context::VmContext;
use crate::cow::{CowPageMap, Slot};
use crate::object::{CommitOption, MappingLink, VmObject, VmoFlags, page_span};
use crate::page_request::{PageProvider, PageRequest, ProviderReply};
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_alloc::{FrameRole, Gaf};
use kernel_info::memory::MAX_FRAME_ORDER;
use kernel_info::{CpuId, NodeId, Result, Status};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn, VirtualAddress};
use kernel_sync::{SpinLock, SpinLockGuard};
use kernel_vmem::PhysMapperExt;

/// Address spaces kept alive until the object locks are released.
type Pins = Vec<Arc<AddressSpace>>;

/// Where a clone finds the pages it has not taken yet.
#[derive(Debug)]
struct Ancestor {
    object: Arc<VmObject>,
    /// Parent index of this object's index 0.
    first: u64,
}

#[derive(Debug, Default)]
struct Links {
    next: u64,
    list: Vec<MappingLink>,
}

/// Outcome of resolving one page for a fault.
#[derive(Debug, Clone)]
pub enum Resolution {
    /// Map `pfn`; writable only if `writable`.
    Page { pfn: Pfn, writable: bool },
    /// The page source has not delivered yet.
    Wait(Arc<PageRequest>),
}

/// Demand-paged memory with copy-on-write clones.
pub struct VmObjectPaged {
    id: u64,
    ctx: Arc<VmContext>,
    gaf: Gaf,
    node: Option<NodeId>,
    flags: VmoFlags,
    provider: Option<Arc<dyn PageProvider>>,
    parent: Option<Ancestor>,
    pages: SpinLock<CowPageMap>,
    links: SpinLock<Links>,
}

impl core::fmt::Debug for VmObjectPaged {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("VmObjectPaged")
            .field("id", &self.id)
            .field("flags", &self.flags)
            .field("gaf", &self.gaf)
            .field("node", &self.node)
            .finish_non_exhaustive()
    }
}

impl VmObjectPaged {
    /// An object of `n_pages` pages. Nothing is allocated until a page is
    /// touched, except for [`VmoFlags::CONTIGUOUS`] objects which take one
    /// block up front.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for zero pages or a bad flag mix.
    /// - [`Status::OutOfRange`] if the size overflows.
    /// - [`Status::NoResource`] for a contiguous object beyond the largest block.
    /// - [`Status::OutOfMem`] if the contiguous block cannot be allocated.
    pub fn create(
        ctx: &Arc<VmContext>,
        gaf: Gaf,
        n_pages: u64,
        flags: VmoFlags,
    ) -> Result<Arc<VmObject>> {
        Self::build(ctx, gaf, None, n_pages, flags, None)
    }

    /// As [`VmObjectPaged::create`], with frames taken from `node` first.
    ///
    /// # Errors
    /// See [`VmObjectPaged::create`].
    pub fn create_on(
        ctx: &Arc<VmContext>,
        gaf: Gaf,
        node: NodeId,
        n_pages: u64,
        flags: VmoFlags,
    ) -> Result<Arc<VmObject>> {
        Self::build(ctx, gaf, Some(node), n_pages, flags, None)
    }

    /// An object whose absent pages are requested from `provider`.
    ///
    /// # Errors
    /// See [`VmObjectPaged::create`]; pager objects cannot be contiguous.
    pub fn create_with_pager(
        ctx: &Arc<VmContext>,
        gaf: Gaf,
        n_pages: u64,
        flags: VmoFlags,
        provider: Arc<dyn PageProvider>,
    ) -> Result<Arc<VmObject>> {
        Self::build(ctx, gaf, None, n_pages, flags | VmoFlags::PAGER, Some(provider))
    }

    fn build(
        ctx: &Arc<VmContext>,
        gaf: Gaf,
        node: Option<NodeId>,
        n_pages: u64,
        flags: VmoFlags,
        provider: Option<Arc<dyn PageProvider>>,
    ) -> Result<Arc<VmObject>> {
        let contiguous = flags.contains(VmoFlags::CONTIGUOUS);
        if n_pages == 0
            || flags.contains(VmoFlags::CACHED)
            || flags.contains(VmoFlags::PAGER) != provider.is_some()
            || (contiguous && flags.intersects(VmoFlags::PAGER | VmoFlags::RESIZABLE))
        {
            return Err(Status::InvalidArguments);
        }
        if n_pages.checked_mul(PAGE_SIZE).is_none() {
            return Err(Status::OutOfRange);
        }

        let mut map = CowPageMap::new(n_pages);
        if contiguous {
            Self::commit_block(ctx, gaf, node, &mut map)?;
        }
        let object = Self {
            id: ctx.next_id(),
            ctx: ctx.clone(),
            gaf,
            node,
            flags,
            provider,
            parent: None,
            pages: SpinLock::new(map),
            links: SpinLock::new(Links::default()),
        };
        log::trace!("vmo {}: {n_pages} page(s), {flags:?}", object.id);
        Ok(Arc::new(VmObject::Paged(object)))
    }

    /// Back every page of `map` from one naturally aligned block. Frames
    /// past the object's end go straight back.
    fn commit_block(
        ctx: &VmContext,
        gaf: Gaf,
        node: Option<NodeId>,
        map: &mut CowPageMap,
    ) -> Result<()> {
        let pages = map.pages();
        let order = pages.next_power_of_two().trailing_zeros();
        if order > MAX_FRAME_ORDER {
            return Err(Status::NoResource);
        }
        let pmm = ctx.pmm();
        let head = pmm.alloc_near(node.unwrap_or_default(), gaf, order)?;
        pmm.split_block(head, order);
        for i in 0..1u64 << order {
            let pfn = head + i;
            if i >= pages {
                pmm.put_frame_direct(pfn);
                continue;
            }
            // Safety: the block was just allocated and is ours alone.
            unsafe { ctx.mapper().zero_frame(pfn.to_phys()) };
            if let Some(frame) = pmm.frame(pfn) {
                frame.set_role(FrameRole::Lru);
            }
            map.insert(i, Slot::Owned(pfn));
        }
        Ok(())
    }

    #[must_use]
    pub const fn id(&self) -> u64 {
        self.id
    }

    /// Size in bytes.
    #[must_use]
    pub fn size(&self) -> u64 {
        self.pages.lock().pages() * PAGE_SIZE
    }

    #[must_use]
    pub const fn flags(&self) -> VmoFlags {
        self.flags
    }

    #[must_use]
    pub const fn gaf(&self) -> Gaf {
        self.gaf
    }

    #[must_use]
    pub const fn node(&self) -> Option<NodeId> {
        self.node
    }

    /// Pages backed by a frame.
    #[must_use]
    pub fn resident_pages(&self) -> usize {
        self.pages.lock().resident()
    }

    /// Pages with any slot, zero markers included.
    #[must_use]
    pub fn committed_pages(&self) -> usize {
        self.pages.lock().committed()
    }

    /// Mappings currently showing this object.
    #[must_use]
    pub fn mapping_count(&self) -> usize {
        self.links.lock().list.len()
    }

    #[must_use]
    pub fn slot(&self, index: u64) -> Option<Slot> {
        self.pages.lock().get(index)
    }

    /// The outstanding page-source request for `index`, if any.
    #[must_use]
    pub fn pending_request(&self, index: u64) -> Option<Arc<PageRequest>> {
        self.pages.lock().pending(index).cloned()
    }

    /// Lock the page map for fault resolution.
    #[must_use]
    pub fn cursor(&self) -> Cursor<'_> {
        Cursor {
            object: self,
            map: self.pages.lock(),
            pins: Vec::new(),
        }
    }

    /// Commit `[offset, offset + size)`; already committed pages are left
    /// alone. Returns the number of pages newly committed.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for an empty or unaligned range.
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - [`Status::OutOfMem`]; pages committed before the failure stay.
    /// - [`Status::ShouldWait`] if the page provider still owes pages. The
    ///   requests are visible through [`VmObjectPaged::pending_request`].
    pub fn commit_range(
        &self,
        cpu: CpuId,
        offset: u64,
        size: u64,
        option: CommitOption,
    ) -> Result<u64> {
        let mut pins = Pins::new();
        let mut map = self.pages.lock();
        let (first, count) = page_span(offset, size, map.pages() * PAGE_SIZE)?;

        let mut committed = 0;
        let mut waiting = false;
        for index in first..first + count {
            match (map.get(index), option) {
                (Some(Slot::Owned(_) | Slot::Shared(_)), _)
                | (Some(Slot::Zero), CommitOption::ZeroMarker) => {}
                (None, CommitOption::ZeroMarker) => {
                    // Absent pages of these read through their source.
                    if !self.inherits() {
                        map.insert(index, Slot::Zero);
                        committed += 1;
                    }
                }
                (None, CommitOption::Populate) if self.inherits() => {
                    match self.inherit(cpu, &mut map, index)? {
                        Some(Resolution::Page { .. }) => committed += 1,
                        Some(Resolution::Wait(_)) => waiting = true,
                        None => {
                            let pfn = self.ctx.alloc_page(cpu, self.gaf, self.node)?;
                            map.insert(index, Slot::Owned(pfn));
                            committed += 1;
                        }
                    }
                }
                (slot, CommitOption::Populate) => {
                    let pfn = self.ctx.alloc_page(cpu, self.gaf, self.node)?;
                    map.insert(index, Slot::Owned(pfn));
                    if slot == Some(Slot::Zero) {
                        pins.extend(self.unmap_everywhere(cpu, index, 1));
                    }
                    committed += 1;
                }
            }
        }
        drop(map);
        drop(pins);
        if waiting {
            return Err(Status::ShouldWait);
        }
        Ok(committed)
    }

    /// Release the pages of `[offset, offset + size)` after removing them
    /// from every mapping. Returns the number of frames released.
    ///
    /// # Errors
    /// - [`Status::Unsupported`] for contiguous objects.
    /// - [`Status::InvalidArguments`] / [`Status::OutOfRange`] as for
    ///   [`VmObjectPaged::commit_range`].
    pub fn decommit(&self, cpu: CpuId, offset: u64, size: u64) -> Result<u64> {
        if self.flags.contains(VmoFlags::CONTIGUOUS) {
            return Err(Status::Unsupported);
        }
        let mut map = self.pages.lock();
        let (first, count) = page_span(offset, size, map.pages() * PAGE_SIZE)?;
        let (released, pins) = self.release_range(cpu, &mut map, first, count);
        drop(map);
        drop(pins);
        Ok(released)
    }

    fn release_range(
        &self,
        cpu: CpuId,
        map: &mut CowPageMap,
        first: u64,
        count: u64,
    ) -> (u64, Pins) {
        map.cancel_range(first, count);
        let taken = map.take_range(first, count);
        if taken.is_empty() {
            return (0, Pins::new());
        }
        let pins = self.unmap_everywhere(cpu, first, count);
        let mut released = 0;
        for pfn in taken.iter().filter_map(|(_, slot)| slot.frame()) {
            self.ctx.release_page(cpu, pfn);
            released += 1;
        }
        log::trace!("vmo {}: released {released} page(s) at index {first}", self.id);
        (released, pins)
    }

    /// Change the size to `n_pages`. Shrinking releases the tail.
    ///
    /// # Errors
    /// - [`Status::Unsupported`] without [`VmoFlags::RESIZABLE`].
    /// - [`Status::InvalidArguments`] for zero pages.
    /// - [`Status::OutOfRange`] if the size overflows.
    pub fn resize(&self, cpu: CpuId, n_pages: u64) -> Result<()> {
        if !self.flags.contains(VmoFlags::RESIZABLE) {
            return Err(Status::Unsupported);
        }
        if n_pages == 0 {
            return Err(Status::InvalidArguments);
        }
        if n_pages.checked_mul(PAGE_SIZE).is_none() {
            return Err(Status::OutOfRange);
        }
        let mut map = self.pages.lock();
        let old = map.pages();
        let pins = if n_pages < old {
            self.release_range(cpu, &mut map, n_pages, old - n_pages).1
        } else {
            Pins::new()
        };
        map.set_pages(n_pages);
        drop(map);
        drop(pins);
        Ok(())
    }

    /// A new object showing `[offset, offset + size)` of this one, which
    /// `this` wraps. Every frame in range becomes shared by both sides and is
    /// write-protected in this object's mappings; zero markers stay markers.
    /// Absent pages stay absent, and the clone of a pager object takes them
    /// from this object when it first touches them.
    ///
    /// # Errors
    /// - [`Status::Unsupported`] for contiguous objects.
    /// - [`Status::InvalidArguments`] / [`Status::OutOfRange`] as for
    ///   [`VmObjectPaged::commit_range`].
    pub(crate) fn create_cow_clone(
        &self,
        this: &Arc<VmObject>,
        cpu: CpuId,
        offset: u64,
        size: u64,
    ) -> Result<Arc<VmObject>> {
        if self.flags.contains(VmoFlags::CONTIGUOUS) {
            return Err(Status::Unsupported);
        }
        let mut map = self.pages.lock();
        let (first, count) = page_span(offset, size, map.pages() * PAGE_SIZE)?;

        let pmm = self.ctx.pmm();
        let mut child = CowPageMap::new(count);
        let mut converted = Vec::new();
        for (index, slot) in map.range_mut(first, count) {
            if let Slot::Owned(pfn) = *slot {
                *slot = Slot::Shared(pfn);
                converted.push(index);
            }
            if let Some(pfn) = slot.frame() {
                pmm.get_frame(pfn);
            }
            child.insert(index - first, *slot);
        }
        let pins = self.write_protect_everywhere(cpu, &converted);
        drop(map);
        drop(pins);

        let clone = Self {
            id: self.ctx.next_id(),
            ctx: self.ctx.clone(),
            gaf: self.gaf,
            node: self.node,
            flags: self.flags.difference(VmoFlags::PAGER | VmoFlags::CONTIGUOUS),
            provider: None,
            parent: self.inherits().then(|| Ancestor {
                object: this.clone(),
                first,
            }),
            pages: SpinLock::new(child),
            links: SpinLock::new(Links::default()),
        };
        log::trace!(
            "vmo {}: clone {} of {count} page(s) at index {first}, {} newly shared",
            self.id,
            clone.id,
            converted.len()
        );
        Ok(Arc::new(VmObject::Paged(clone)))
    }

    /// Install a frame the page provider produced for `index`. The object
    /// takes over the caller's reference; complete the request afterwards.
    ///
    /// # Errors
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - [`Status::AlreadyExists`] if the page is already committed. The
    ///   reference stays with the caller.
    pub fn supply_page(&self, index: u64, pfn: Pfn) -> Result<()> {
        let mut map = self.pages.lock();
        if index >= map.pages() {
            return Err(Status::OutOfRange);
        }
        if map.get(index).is_some() {
            return Err(Status::AlreadyExists);
        }
        self.adopt(pfn);
        map.insert(index, Slot::Owned(pfn));
        map.take_pending(index);
        Ok(())
    }

    /// Physical address of the byte at `offset`.
    ///
    /// # Errors
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - [`Status::NotFound`] if no frame backs the page.
    pub fn lookup(&self, offset: u64) -> Result<PhysicalAddress> {
        let map = self.pages.lock();
        if offset >= map.pages() * PAGE_SIZE {
            return Err(Status::OutOfRange);
        }
        map.get(offset / PAGE_SIZE)
            .and_then(Slot::frame)
            .map(|pfn| pfn.to_phys() + offset % PAGE_SIZE)
            .ok_or(Status::NotFound)
    }

    /// Whether absent pages come from somewhere other than the zero page.
    fn inherits(&self) -> bool {
        self.provider.is_some() || self.parent.is_some()
    }

    /// Fill absent page `index` from the provider or the parent. `None` if
    /// the page reads as zeroes.
    fn inherit(
        &self,
        cpu: CpuId,
        map: &mut CowPageMap,
        index: u64,
    ) -> Result<Option<Resolution>> {
        if self.provider.is_some() {
            return Ok(Some(self.fetch(map, index)));
        }
        let Some(parent) = &self.parent else {
            return Ok(None);
        };
        let Some(source) = parent.object.as_paged() else {
            return Ok(None);
        };
        let resolved = source.share_page(cpu, parent.first + index)?;
        if let Some(Resolution::Page { pfn, .. }) = resolved {
            map.insert(index, Slot::Shared(pfn));
        }
        Ok(resolved)
    }

    /// Hand page `index` to a clone. The frame becomes shared and the
    /// clone's reference is taken. `None` if the page reads as zeroes.
    fn share_page(&self, cpu: CpuId, index: u64) -> Result<Option<Resolution>> {
        let mut pins = Pins::new();
        let mut map = self.pages.lock();
        if index >= map.pages() {
            return Ok(None);
        }
        if map.get(index).is_none()
            && let Some(Resolution::Wait(request)) = self.inherit(cpu, &mut map, index)?
        {
            return Ok(Some(Resolution::Wait(request)));
        }
        let pfn = match map.get(index) {
            None | Some(Slot::Zero) => return Ok(None),
            Some(Slot::Shared(pfn)) => pfn,
            Some(Slot::Owned(pfn)) => {
                map.insert(index, Slot::Shared(pfn));
                pins = self.write_protect_everywhere(cpu, &[index]);
                pfn
            }
        };
        self.ctx.pmm().get_frame(pfn);
        drop(map);
        drop(pins);
        Ok(Some(Resolution::Page {
            pfn,
            writable: false,
        }))
    }

    /// Ask the provider for `index`, reusing a request still in flight.
    fn fetch(&self, map: &mut CowPageMap, index: u64) -> Resolution {
        if let Some(request) = map.pending(index)
            && request.is_pending()
        {
            return Resolution::Wait(request.clone());
        }
        let Some(provider) = &self.provider else {
            kernel_info::fatal::fatal(format_args!("vmo {} has no page provider", self.id));
        };
        let request = Arc::new(PageRequest::new(self.id, index));
        match provider.request(self.id, index, &request) {
            ProviderReply::Ready(pfn) => {
                self.adopt(pfn);
                map.insert(index, Slot::Owned(pfn));
                map.take_pending(index);
                Resolution::Page { pfn, writable: true }
            }
            ProviderReply::Pending => {
                log::trace!("vmo {}: index {index} requested from provider", self.id);
                map.add_pending(index, request.clone());
                Resolution::Wait(request)
            }
        }
    }

    fn adopt(&self, pfn: Pfn) {
        if let Some(frame) = self.ctx.pmm().frame(pfn) {
            frame.set_role(FrameRole::Lru);
        }
    }

    pub(crate) fn attach(
        &self,
        aspace: Weak<AddressSpace>,
        base: VirtualAddress,
        offset: u64,
        size: u64,
    ) -> u64 {
        let mut links = self.links.lock();
        links.next += 1;
        let id = links.next;
        links.list.push(MappingLink {
            id,
            aspace,
            base,
            offset,
            size,
        });
        id
    }

    pub(crate) fn detach(&self, link: u64) {
        self.links.lock().list.retain(|l| l.id != link);
    }

    /// Remove the translations of pages `[first, first + count)` from every
    /// mapping.
    fn unmap_everywhere(&self, cpu: CpuId, first: u64, count: u64) -> Pins {
        let links = self.links.lock();
        let mut pins = Pins::new();
        for link in &links.list {
            let Some((va, pages)) = link.span(first, count) else {
                continue;
            };
            let Some(aspace) = link.aspace.upgrade() else {
                continue;
            };
            aspace.unmap_pages(cpu, va, pages);
            pins.push(aspace);
        }
        pins
    }

    fn write_protect_everywhere(&self, cpu: CpuId, indices: &[u64]) -> Pins {
        if indices.is_empty() {
            return Pins::new();
        }
        let links = self.links.lock();
        let mut pins = Pins::new();
        for link in &links.list {
            let Some(aspace) = link.aspace.upgrade() else {
                continue;
            };
            for &index in indices {
                if let Some((va, _)) = link.span(index, 1) {
                    aspace.write_protect_page(cpu, va);
                }
            }
            pins.push(aspace);
        }
        pins
    }
}

impl Drop for VmObjectPaged {
    fn drop(&mut self) {
        let links = self.links.get_mut();
        kernel_info::invariant!(links.list.is_empty(), "vmo {} dropped while mapped", self.id);
        let pmm = self.ctx.pmm();
        let map = self.pages.get_mut();
        map.cancel_range(0, u64::MAX);
        for pfn in map.drain().filter_map(Slot::frame) {
            pmm.put_frame_direct(pfn);
        }
    }
}

/// The page map of one object, locked for resolving faults.
///
/// Mapping the resolved page while the cursor is held keeps a concurrent
/// decommit from releasing it first.
pub struct Cursor<'a> {
    object: &'a VmObjectPaged,
    map: SpinLockGuard<'a, CowPageMap>,
    pins: Pins,
}

impl Cursor<'_> {
    /// Make page `index` resident for a read, or private for a `write`.
    ///
    /// # Errors
    /// - [`Status::OutOfRange`] past the end of the object.
    /// - [`Status::OutOfMem`] if a frame cannot be allocated.
    pub fn require_owned_page(
        &mut self,
        cpu: CpuId,
        index: u64,
        write: bool,
    ) -> Result<Resolution> {
        if index >= self.map.pages() {
            return Err(Status::OutOfRange);
        }
        let object = self.object;
        let ctx = &object.ctx;
        let zero = Resolution::Page {
            pfn: ctx.zero_frame(),
            writable: false,
        };

        if self.map.get(index).is_none()
            && let Some(Resolution::Wait(request)) = object.inherit(cpu, &mut self.map, index)?
        {
            return Ok(Resolution::Wait(request));
        }

        Ok(match self.map.get(index) {
            None if write => {
                let pfn = ctx.alloc_page(cpu, object.gaf, object.node)?;
                self.map.insert(index, Slot::Owned(pfn));
                Resolution::Page { pfn, writable: true }
            }
            None => {
                self.map.insert(index, Slot::Zero);
                zero
            }
            Some(Slot::Owned(pfn)) => Resolution::Page { pfn, writable: true },
            Some(Slot::Shared(pfn)) if !write => Resolution::Page { pfn, writable: false },
            Some(Slot::Zero) if !write => zero,
            Some(Slot::Shared(pfn)) => {
                let sole = ctx.pmm().frame(pfn).is_some_and(|f| f.reference_count() == 1);
                if sole {
                    self.map.insert(index, Slot::Owned(pfn));
                    Resolution::Page { pfn, writable: true }
                } else {
                    let copy = ctx.copy_page(cpu, object.gaf, object.node, pfn)?;
                    self.map.insert(index, Slot::Owned(copy));
                    self.pins.extend(object.unmap_everywhere(cpu, index, 1));
                    ctx.release_page(cpu, pfn);
                    Resolution::Page { pfn: copy, writable: true }
                }
            }
            Some(Slot::Zero) => {
                let pfn = ctx.alloc_page(cpu, object.gaf, object.node)?;
                self.map.insert(index, Slot::Owned(pfn));
                self.pins.extend(object.unmap_everywhere(cpu, index, 1));
                Resolution::Page { pfn, writable: true }
            }
        })
    }
}
