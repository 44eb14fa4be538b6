//! # Generic multi-level page table
//!
//! [`PageTable<P>`] owns one translation hierarchy in the format of the
//! paging mode `P` and implements every structural operation on it:
//!
//! - [`map`](PageTable::map) installs leaves, allocating intermediate tables
//!   through a [`PageSource`] and optionally using 2 MiB / 1 GiB leaves.
//! - [`unmap`](PageTable::unmap) clears leaves, splitting partially covered
//!   large leaves and freeing tables that became empty.
//! - [`protect`](PageTable::protect) rewrites leaf permissions.
//! - [`query`](PageTable::query) translates one address.
//! - [`harvest_accessed`](PageTable::harvest_accessed) reads, resets or acts
//!   on the hardware accessed bits.
//!
//! ## Locking and invalidation
//!
//! Every operation, including `query`, runs under the table's spin lock.
//! Edits that remove or narrow a translation collect the affected pages in a
//! [`PendingInvalidation`]. After the lock is released the batch is
//! flushed: on the calling CPU if it has the table loaded, by shootdown to
//! every other CPU in the active set. Table frames unlinked by the edit are
//! returned to the page source only after that flush.
//!
//! CPUs that do not have the table loaded while it changes are recorded as
//! stale; [`activate`](PageTable::activate) reports them so the switch-in
//! can discard translations still cached under the table's tag.
//!
//! ## Shared upper half
//!
//! For formats with an upper half, the kernel table pre-allocates every
//! upper root slot. User tables copy those slots at creation, so kernel
//! mappings added later are visible everywhere. Neither side ever frees the
//! shared tables, and user tables refuse edits in the upper half.

use crate::entry::PageTableEntry;
use crate::error::WalkError;
use crate::flags::{HarvestControl, MapControl, MmuFlags, UnmapControl};
use crate::mode::PagingMode;
use crate::phys_mapper::{PhysMapper, PhysMapperExt};
use crate::source::PageSource;
use crate::table::{ENTRIES, RawTable};
use crate::tlb::{AddressSpaceTag, PendingInvalidation, TlbFlush};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::marker::PhantomData;
use core::sync::atomic::{AtomicUsize, Ordering};
use kernel_info::{CpuId, Result};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{AtomicCpuSet, CpuSet, SpinLock};
use log::trace;

/// Size of the leaf that translated an address.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum MapSize {
    Size4K,
    Size2M,
    Size1G,
}

impl MapSize {
    const fn from_level(level: usize) -> Self {
        match level {
            0 => Self::Size4K,
            1 => Self::Size2M,
            _ => Self::Size1G,
        }
    }

    #[must_use]
    pub const fn bytes(self) -> u64 {
        match self {
            Self::Size4K => 1 << 12,
            Self::Size2M => 1 << 21,
            Self::Size1G => 1 << 30,
        }
    }
}

/// Result of [`PageTable::query`].
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Translation {
    /// Physical address of the queried byte.
    pub pa: PhysicalAddress,
    pub flags: MmuFlags,
    pub size: MapSize,
}

/// Counters reported by [`PageTable::harvest_accessed`].
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct Harvest {
    /// Pages whose accessed bit was set.
    pub accessed: u64,
    /// Pages unmapped by [`HarvestControl::UnmapUnaccessed`].
    pub unmapped: u64,
}

#[derive(Copy, Clone, Eq, PartialEq)]
enum UpperHalf {
    /// No sharing.
    Private,
    /// Kernel table: upper root slots pre-allocated and never freed.
    Owned,
    /// User table: upper root slots copied from the kernel, read-only here.
    Borrowed,
}

#[derive(Copy, Clone)]
enum Edit {
    Unmap(UnmapControl),
    Protect(MmuFlags),
    Harvest(HarvestControl),
}

enum Install {
    Mapped,
    Replaced,
    Skipped,
    /// A table hangs where a large leaf was requested; retry one level down.
    TooLarge,
}

/// Per-operation state threaded through a walk.
struct Walk<'a> {
    source: &'a dyn PageSource,
    pending: PendingInvalidation,
    freed: Vec<PhysicalAddress>,
    pages: u64,
    accessed: u64,
}

impl<'a> Walk<'a> {
    fn new(source: &'a dyn PageSource) -> Self {
        Self {
            source,
            pending: PendingInvalidation::new(),
            freed: Vec::new(),
            pages: 0,
            accessed: 0,
        }
    }
}

/// One translation hierarchy in paging format `P`.
pub struct PageTable<P: PagingMode> {
    root: PhysicalAddress,
    mapper: Arc<dyn PhysMapper>,
    tlb: Arc<dyn TlbFlush>,
    tag: AddressSpaceTag,
    upper: UpperHalf,
    /// CPUs that currently have this table loaded.
    active: AtomicCpuSet,
    /// CPUs that may cache translations of this tag from before an edit.
    stale: AtomicCpuSet,
    lock: SpinLock<()>,
    /// Table frames owned by this hierarchy, root included.
    tables: AtomicUsize,
    _mode: PhantomData<P>,
}

impl<P: PagingMode> core::fmt::Debug for PageTable<P> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("PageTable")
            .field("mode", &P::NAME)
            .field("root", &self.root)
            .field("tag", &self.tag)
            .field("active", &self.active)
            .field("tables", &self.tables.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

impl<P: PagingMode> PageTable<P> {
    /// An empty, private hierarchy.
    ///
    /// A reused tag may still be cached anywhere, so every CPU starts stale.
    pub fn new(
        source: &dyn PageSource,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
        tag: AddressSpaceTag,
    ) -> Result<Self> {
        Self::with_root(source, mapper, tlb, tag, UpperHalf::Private)
    }

    /// The kernel hierarchy. Allocates every upper-half root slot so user
    /// tables can share them.
    pub fn new_kernel(
        source: &dyn PageSource,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
    ) -> Result<Self> {
        let table =
            Self::with_root(source, mapper, tlb, AddressSpaceTag::KERNEL, UpperHalf::Owned)?;
        let Some(first) = P::UPPER_HALF_SLOT else {
            return Ok(table);
        };

        let root = table.raw(table.root);
        for slot in first..ENTRIES {
            let Some(pa) = source.alloc_table() else {
                table.release_upper(source, first);
                source.free_table(table.root);
                return Err(WalkError::OutOfTables.into());
            };
            table.zero_table(pa);
            root.store(slot, P::Entry::table(pa).raw());
        }
        table.tables.fetch_add(ENTRIES - first, Ordering::Relaxed);
        Ok(table)
    }

    /// A user hierarchy sharing `kernel`'s upper half.
    pub fn new_sharing(
        kernel: &Self,
        source: &dyn PageSource,
        tag: AddressSpaceTag,
    ) -> Result<Self> {
        let table = Self::with_root(
            source,
            kernel.mapper.clone(),
            kernel.tlb.clone(),
            tag,
            UpperHalf::Borrowed,
        )?;
        table.sync_upper_half(kernel);
        Ok(table)
    }

    fn with_root(
        source: &dyn PageSource,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
        tag: AddressSpaceTag,
        upper: UpperHalf,
    ) -> Result<Self> {
        let root = source.alloc_table().ok_or(WalkError::OutOfTables)?;
        let table = Self {
            root,
            mapper,
            tlb,
            tag,
            upper,
            active: AtomicCpuSet::new(),
            stale: AtomicCpuSet::new(),
            lock: SpinLock::new(()),
            tables: AtomicUsize::new(1),
            _mode: PhantomData,
        };
        table.zero_table(root);
        if tag != AddressSpaceTag::KERNEL {
            table.stale.insert_all(CpuSet::from_bits(u64::MAX));
        }
        Ok(table)
    }

    /// Copy the kernel's upper root slots into this table.
    pub fn sync_upper_half(&self, kernel: &Self) {
        let Some(first) = P::UPPER_HALF_SLOT else {
            return;
        };
        if self.upper != UpperHalf::Borrowed {
            return;
        }
        let _guard = self.lock.lock();
        let src = kernel.raw(kernel.root);
        let dst = self.raw(self.root);
        for slot in first..ENTRIES {
            dst.store(slot, src.load(slot));
        }
    }

    fn release_upper(&self, source: &dyn PageSource, first: usize) {
        let root = self.raw(self.root);
        for slot in first..ENTRIES {
            let e = P::Entry::from_raw(root.load(slot));
            if e.is_present() {
                root.store(slot, 0);
                source.free_table(e.address());
            }
        }
    }

    #[must_use]
    pub const fn root(&self) -> PhysicalAddress {
        self.root
    }

    #[must_use]
    pub const fn tag(&self) -> AddressSpaceTag {
        self.tag
    }

    /// Number of table frames owned, root and pre-allocated upper half included.
    #[must_use]
    pub fn table_count(&self) -> usize {
        self.tables.load(Ordering::Relaxed)
    }

    #[must_use]
    pub fn active_cpus(&self) -> CpuSet {
        self.active.snapshot()
    }

    /// Mark the table as loaded on `cpu`. Returns whether the switch-in must
    /// discard translations cached under this tag.
    pub fn activate(&self, cpu: CpuId) -> bool {
        self.active.insert(cpu);
        self.stale.remove(cpu)
    }

    pub fn deactivate(&self, cpu: CpuId) {
        self.active.remove(cpu);
    }

    #[inline]
    fn raw<'t>(&self, pa: PhysicalAddress) -> &'t RawTable {
        // Safety: table frames are owned by this hierarchy (or the shared
        // kernel half) and stay live until `destroy`.
        unsafe { self.mapper.table(pa) }
    }

    fn zero_table(&self, pa: PhysicalAddress) {
        self.raw(pa).zero();
    }

    #[inline]
    fn index(lin: u64, level: usize) -> usize {
        ((lin >> P::shift(level)) as usize) % ENTRIES
    }

    fn is_pinned(&self, level: usize, idx: usize) -> bool {
        level == P::LEVELS - 1
            && self.upper != UpperHalf::Private
            && P::UPPER_HALF_SLOT.is_some_and(|first| idx >= first)
    }

    /// Validate `[va, va + n pages)` and return its linear bounds.
    fn check_range(
        &self,
        va: VirtualAddress,
        n: u64,
    ) -> core::result::Result<(u64, u64), WalkError> {
        if n == 0 {
            return Err(WalkError::Invalid);
        }
        if !va.is_aligned::<Size4K>() {
            return Err(WalkError::Misaligned);
        }
        let bytes = n.checked_mul(PAGE_SIZE).ok_or(WalkError::OutOfRange)?;
        let last = va.checked_add(bytes - 1).ok_or(WalkError::OutOfRange)?;
        if !P::is_valid_va(va) || !P::is_valid_va(last) {
            return Err(WalkError::OutOfRange);
        }
        let start = P::linear(va);
        let end = P::linear(last) + 1;
        if end <= start {
            return Err(WalkError::OutOfRange);
        }
        if self.upper == UpperHalf::Borrowed
            && let Some(first) = P::UPPER_HALF_SLOT
            && Self::index(end - 1, P::LEVELS - 1) >= first
        {
            return Err(WalkError::OutOfRange);
        }
        Ok((start, end))
    }

    /// Map `n` pages starting at `va` to the physical range starting at `pa`.
    ///
    /// Returns the number of 4 KiB pages installed (new or replaced). With
    /// [`MapControl::ERROR_IF_EXISTING`] the whole range is checked before
    /// anything changes. If an intermediate table cannot be allocated, the
    /// leaves this call installed are removed again and `OutOfMem` is
    /// returned.
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
        if !flags.has_access()
            || control.contains(MapControl::ERROR_IF_EXISTING | MapControl::OVERWRITE_IF_EXISTING)
        {
            return Err(WalkError::Invalid.into());
        }
        if !pa.is_aligned::<Size4K>() {
            return Err(WalkError::Misaligned.into());
        }
        let (start, end) = self.check_range(va, n)?;
        pa.checked_add(end - start).ok_or(WalkError::OutOfRange)?;

        let mut walk = Walk::new(source);
        let guard = self.lock.lock();
        let result = self.map_locked(&mut walk, start, end, pa, flags, control);
        drop(guard);
        self.finish(cpu, &mut walk);

        let installed = result?;
        trace!("{}: mapped {installed} pages at {va:?} -> {pa:?} {flags:?}", P::NAME);
        Ok(installed)
    }

    fn map_locked(
        &self,
        walk: &mut Walk<'_>,
        start: u64,
        end: u64,
        pa: PhysicalAddress,
        flags: MmuFlags,
        control: MapControl,
    ) -> core::result::Result<u64, WalkError> {
        if control.contains(MapControl::ERROR_IF_EXISTING)
            && let Some(lin) = self.scan(start, end, true)
        {
            return Err(WalkError::Existing(P::from_linear(lin)));
        }

        // Fresh installs as coalesced linear ranges, for rollback.
        let mut fresh: Vec<(u64, u64)> = Vec::new();
        let mut installed = 0;
        let mut lin = start;
        while lin < end {
            let offset = lin - start;
            let target = pa + offset;
            let mut level = self.leaf_level(lin, target, end - lin, control);
            loop {
                let step = P::entry_size(level);
                match self.install(walk, lin, target, level, flags, control) {
                    Ok(Install::TooLarge) => {
                        level -= 1;
                        continue;
                    }
                    Ok(outcome) => {
                        match outcome {
                            Install::Mapped => {
                                installed += P::entry_pages(level);
                                match fresh.last_mut() {
                                    Some((_, e)) if *e == lin => *e += step,
                                    _ => fresh.push((lin, lin + step)),
                                }
                            }
                            Install::Replaced => installed += P::entry_pages(level),
                            Install::Skipped | Install::TooLarge => {}
                        }
                        lin += step;
                    }
                    Err(err) => {
                        let mut undo = fresh;
                        // Prune tables allocated for the failed page.
                        if self.scan(lin, lin + PAGE_SIZE, true).is_none() {
                            undo.push((lin, lin + PAGE_SIZE));
                        }
                        self.rollback(walk, &undo);
                        return Err(err);
                    }
                }
                break;
            }
        }
        Ok(installed)
    }

    /// Largest leaf level usable at `lin` for `target` with `remaining` bytes left.
    fn leaf_level(
        &self,
        lin: u64,
        target: PhysicalAddress,
        remaining: u64,
        control: MapControl,
    ) -> usize {
        if !control.contains(MapControl::TRY_LARGE_PAGE) {
            return 0;
        }
        (1..P::LEVELS)
            .rev()
            .filter(|&l| P::leaf_allowed(l))
            .find(|&l| {
                let size = P::entry_size(l);
                lin % size == 0 && target.as_u64() % size == 0 && remaining >= size
            })
            .unwrap_or(0)
    }

    fn install(
        &self,
        walk: &mut Walk<'_>,
        lin: u64,
        pa: PhysicalAddress,
        level: usize,
        flags: MmuFlags,
        control: MapControl,
    ) -> core::result::Result<Install, WalkError> {
        let mut table_pa = self.root;
        let mut l = P::LEVELS - 1;
        loop {
            let table = self.raw(table_pa);
            let idx = Self::index(lin, l);
            let e = P::Entry::from_raw(table.load(idx));

            if l == level {
                let pages = P::entry_pages(l);
                if !e.is_present() {
                    table.store(idx, P::Entry::leaf(pa, flags, l).raw());
                    walk.source.leaf_mapped(pa, pages);
                    return Ok(Install::Mapped);
                }
                if !e.is_leaf(l) {
                    return Ok(Install::TooLarge);
                }
                if control.contains(MapControl::OVERWRITE_IF_EXISTING) {
                    table.store(idx, P::Entry::leaf(pa, flags, l).raw());
                    walk.source.leaf_unmapped(e.address(), pages);
                    walk.source.leaf_mapped(pa, pages);
                    walk.pending.push(P::from_linear(lin));
                    return Ok(Install::Replaced);
                }
                if control.contains(MapControl::ERROR_IF_EXISTING) {
                    return Err(WalkError::Existing(P::from_linear(lin)));
                }
                return Ok(Install::Skipped);
            }

            table_pa = if !e.is_present() {
                let child = walk.source.alloc_table().ok_or(WalkError::OutOfTables)?;
                self.zero_table(child);
                table.store(idx, P::Entry::table(child).raw());
                self.tables.fetch_add(1, Ordering::Relaxed);
                child
            } else if e.is_leaf(l) {
                if control.contains(MapControl::OVERWRITE_IF_EXISTING) {
                    let base = lin & !(P::entry_size(l) - 1);
                    self.split(walk, table, idx, l, e, base)?
                } else if control.contains(MapControl::ERROR_IF_EXISTING) {
                    return Err(WalkError::Existing(P::from_linear(lin)));
                } else {
                    return Ok(Install::Skipped);
                }
            } else {
                e.address()
            };
            l -= 1;
        }
    }

    fn rollback(&self, walk: &mut Walk<'_>, fresh: &[(u64, u64)]) {
        let pages = walk.pages;
        for &(start, end) in fresh {
            // Fresh leaves never need a split, so this cannot run out of tables.
            if let Err(e) = self.edit_level(
                walk,
                self.root,
                P::LEVELS - 1,
                0,
                start,
                end,
                Edit::Unmap(UnmapControl::WITHOUT_TERMINAL),
            ) {
                log::warn!("{}: rollback of [{start:#x}, {end:#x}) failed: {e}", P::NAME);
            }
        }
        walk.pages = pages;
    }

    /// Remove translations for `n` pages starting at `va`.
    ///
    /// Returns the number of 4 KiB pages that were mapped.
    pub fn unmap(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        control: UnmapControl,
    ) -> Result<u64> {
        let (start, end) = self.check_range(va, n)?;
        let walk = self.edit(source, cpu, start, end, Edit::Unmap(control))?;
        trace!("{}: unmapped {} pages at {va:?}", P::NAME, walk.0);
        Ok(walk.0)
    }

    /// Rewrite the permissions of `n` mapped pages starting at `va`.
    ///
    /// Fails with `NotFound`, before anything changes, if any page in the
    /// range has no translation. Large pages crossing either end are split
    /// first, so running out of tables leaves every permission as it was.
    pub fn protect(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        flags: MmuFlags,
    ) -> Result<()> {
        if !flags.has_access() {
            return Err(WalkError::Invalid.into());
        }
        let (start, end) = self.check_range(va, n)?;
        self.edit(source, cpu, start, end, Edit::Protect(flags))?;
        Ok(())
    }

    /// Inspect the accessed bits of `n` pages starting at `va`.
    pub fn harvest_accessed(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        va: VirtualAddress,
        n: u64,
        action: HarvestControl,
    ) -> Result<Harvest> {
        let (start, end) = self.check_range(va, n)?;
        let (unmapped, accessed) = self.edit(source, cpu, start, end, Edit::Harvest(action))?;
        Ok(Harvest { accessed, unmapped })
    }

    /// Translate `va`.
    pub fn query(&self, va: VirtualAddress) -> Result<Translation> {
        if !P::is_valid_va(va) {
            return Err(WalkError::OutOfRange.into());
        }
        let lin = P::linear(va);
        let _guard = self.lock.lock();
        let mut table_pa = self.root;
        for level in (0..P::LEVELS).rev() {
            let e = P::Entry::from_raw(self.raw(table_pa).load(Self::index(lin, level)));
            if !e.is_present() {
                break;
            }
            if e.is_leaf(level) {
                let offset = lin & (P::entry_size(level) - 1);
                return Ok(Translation {
                    pa: e.address() + offset,
                    flags: e.mmu_flags(),
                    size: MapSize::from_level(level),
                });
            }
            table_pa = e.address();
        }
        Err(WalkError::NotMapped(va).into())
    }

    /// Set the accessed bit of the leaf translating `va`, as the CPU would.
    #[cfg(any(test, feature = "test-support"))]
    pub fn simulate_access(&self, va: VirtualAddress) -> Result<()> {
        let lin = P::linear(va);
        let _guard = self.lock.lock();
        let mut table_pa = self.root;
        for level in (0..P::LEVELS).rev() {
            let table = self.raw(table_pa);
            let idx = Self::index(lin, level);
            let e = P::Entry::from_raw(table.load(idx));
            if !e.is_present() {
                break;
            }
            if e.is_leaf(level) {
                table.store(idx, e.raw() | P::Entry::ACCESSED);
                return Ok(());
            }
            table_pa = e.address();
        }
        Err(WalkError::NotMapped(va).into())
    }

    /// Run `edit` over `[start, end)` under the lock, then flush and release
    /// unlinked tables. Returns `(pages, accessed)`.
    fn edit(
        &self,
        source: &dyn PageSource,
        cpu: CpuId,
        start: u64,
        end: u64,
        edit: Edit,
    ) -> core::result::Result<(u64, u64), WalkError> {
        let mut walk = Walk::new(source);
        let guard = self.lock.lock();
        let result = match edit {
            Edit::Protect(_) => match self.scan(start, end, false) {
                Some(lin) => Err(WalkError::NotMapped(P::from_linear(lin))),
                None => self.split_at(&mut walk, start).and_then(|()| {
                    self.split_at(&mut walk, end)?;
                    self.edit_level(&mut walk, self.root, P::LEVELS - 1, 0, start, end, edit)
                }),
            },
            _ => self.edit_level(&mut walk, self.root, P::LEVELS - 1, 0, start, end, edit),
        };
        drop(guard);
        self.finish(cpu, &mut walk);
        result.map(|()| (walk.pages, walk.accessed))
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_level(
        &self,
        walk: &mut Walk<'_>,
        table_pa: PhysicalAddress,
        level: usize,
        base: u64,
        start: u64,
        end: u64,
        edit: Edit,
    ) -> core::result::Result<(), WalkError> {
        let table = self.raw(table_pa);
        let size = P::entry_size(level);
        let first = ((start - base) / size) as usize;
        let last = ((end - 1 - base) / size) as usize;

        for idx in first..=last {
            let e_base = base + idx as u64 * size;
            let lo = start.max(e_base);
            let hi = end.min(e_base + size);
            let e = P::Entry::from_raw(table.load(idx));
            if !e.is_present() {
                continue;
            }

            let child = if e.is_leaf(level) {
                let whole = lo == e_base && hi == e_base + size;
                if whole {
                    self.edit_leaf(walk, table, idx, level, e, e_base, P::entry_pages(level), edit);
                    continue;
                }
                if let Edit::Harvest(action) = edit {
                    // Partially covered large leaves are observed, never split.
                    let action = match action {
                        HarvestControl::UnmapUnaccessed => HarvestControl::ResetAccessed,
                        other => other,
                    };
                    let pages = (hi - lo) / PAGE_SIZE;
                    self.edit_leaf(
                        walk,
                        table,
                        idx,
                        level,
                        e,
                        e_base,
                        pages,
                        Edit::Harvest(action),
                    );
                    continue;
                }
                self.split(walk, table, idx, level, e, e_base)?
            } else {
                e.address()
            };

            self.edit_level(walk, child, level - 1, e_base, lo, hi, edit)?;

            if let Edit::Unmap(control) = edit
                && !control.contains(UnmapControl::ONLY_TERMINAL)
                && !self.is_pinned(level, idx)
                && self.raw(child).is_empty()
            {
                table.store(idx, 0);
                walk.freed.push(child);
                self.tables.fetch_sub(1, Ordering::Relaxed);
            }
        }
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    fn edit_leaf(
        &self,
        walk: &mut Walk<'_>,
        table: &RawTable,
        idx: usize,
        level: usize,
        e: P::Entry,
        e_base: u64,
        pages: u64,
        edit: Edit,
    ) {
        let va = P::from_linear(e_base);
        match edit {
            Edit::Unmap(_) => {
                table.store(idx, 0);
                walk.source.leaf_unmapped(e.address(), pages);
                walk.pending.push(va);
                walk.pages += pages;
            }
            Edit::Protect(flags) => {
                let old = e.mmu_flags();
                table.store(idx, P::Entry::leaf(e.address(), flags, level).raw());
                if old.narrows_to(flags) {
                    walk.pending.push(va);
                }
            }
            Edit::Harvest(action) => {
                if e.is_accessed() {
                    walk.accessed += pages;
                    if action != HarvestControl::Observe {
                        table.clear_bits(idx, P::Entry::ACCESSED);
                        walk.pending.push(va);
                    }
                } else if action == HarvestControl::UnmapUnaccessed {
                    if table.compare_exchange(idx, e.raw(), 0) {
                        walk.source.leaf_unmapped(e.address(), pages);
                        walk.pending.push(va);
                        walk.pages += pages;
                    } else {
                        // Touched since the load.
                        walk.accessed += pages;
                    }
                }
            }
        }
    }

    /// Split every large leaf that straddles `lin`. The translations stay
    /// the same.
    fn split_at(&self, walk: &mut Walk<'_>, lin: u64) -> core::result::Result<(), WalkError> {
        let mut table_pa = self.root;
        for level in (1..P::LEVELS).rev() {
            let size = P::entry_size(level);
            if lin % size == 0 {
                return Ok(());
            }
            let table = self.raw(table_pa);
            let idx = Self::index(lin, level);
            let e = P::Entry::from_raw(table.load(idx));
            if !e.is_present() {
                return Ok(());
            }
            table_pa = if e.is_leaf(level) {
                self.split(walk, table, idx, level, e, lin & !(size - 1))?
            } else {
                e.address()
            };
        }
        Ok(())
    }

    /// Replace the large leaf at `table[idx]` with a table of leaves one
    /// level down carrying the same translation. Returns the new table.
    fn split(
        &self,
        walk: &mut Walk<'_>,
        table: &RawTable,
        idx: usize,
        level: usize,
        e: P::Entry,
        e_base: u64,
    ) -> core::result::Result<PhysicalAddress, WalkError> {
        debug_assert!(level > 0);
        let child = walk.source.alloc_table().ok_or(WalkError::OutOfTables)?;
        let t = self.raw(child);
        let flags = e.mmu_flags();
        let step = P::entry_size(level - 1);
        for i in 0..ENTRIES {
            t.store(i, P::Entry::leaf(e.address() + i as u64 * step, flags, level - 1).raw());
        }
        table.store(idx, P::Entry::table(child).raw());
        self.tables.fetch_add(1, Ordering::Relaxed);
        walk.pending.push(P::from_linear(e_base));
        Ok(child)
    }

    /// First page in `[start, end)` that is mapped (`want_mapped`) or
    /// unmapped (`!want_mapped`).
    fn scan(&self, start: u64, end: u64, want_mapped: bool) -> Option<u64> {
        self.scan_level(self.root, P::LEVELS - 1, 0, start, end, want_mapped)
    }

    fn scan_level(
        &self,
        table_pa: PhysicalAddress,
        level: usize,
        base: u64,
        start: u64,
        end: u64,
        want_mapped: bool,
    ) -> Option<u64> {
        let table = self.raw(table_pa);
        let size = P::entry_size(level);
        let first = ((start - base) / size) as usize;
        let last = ((end - 1 - base) / size) as usize;
        for idx in first..=last {
            let e_base = base + idx as u64 * size;
            let lo = start.max(e_base);
            let hi = end.min(e_base + size);
            let e = P::Entry::from_raw(table.load(idx));
            let hit = if !e.is_present() {
                (!want_mapped).then_some(lo)
            } else if e.is_leaf(level) {
                want_mapped.then_some(lo)
            } else {
                self.scan_level(e.address(), level - 1, e_base, lo, hi, want_mapped)
            };
            if hit.is_some() {
                return hit;
            }
        }
        None
    }

    /// Flush the batch, then hand unlinked tables back to the source.
    fn finish(&self, cpu: CpuId, walk: &mut Walk<'_>) {
        self.flush(cpu, &mut walk.pending);
        for pa in walk.freed.drain(..) {
            walk.source.free_table(pa);
        }
    }

    fn flush(&self, cpu: CpuId, pending: &mut PendingInvalidation) {
        if pending.is_empty() {
            return;
        }
        let active = self.active.snapshot();
        let remote = active.without(cpu);
        if active.contains(cpu) || remote.is_empty() {
            self.tlb.invalidate_local(self.tag, pending);
        }
        if !remote.is_empty() {
            trace!("{}: shootdown {pending:?} to {remote:?}", P::NAME);
            self.tlb.shootdown(cpu, remote, self.tag, pending);
        }
        self.stale.insert_all(CpuSet::from_bits(!active.bits()));
        pending.clear();
    }

    /// Release every table frame and report remaining leaves as unmapped.
    ///
    /// Shared upper-half tables are left alone unless this is the kernel
    /// table. The table must not be loaded on any CPU.
    pub fn destroy(self, source: &dyn PageSource) {
        kernel_info::invariant!(
            self.active.snapshot().is_empty(),
            "destroying a page table still active on {:?}",
            self.active
        );
        let _guard = self.lock.lock();
        self.teardown(source, self.root, P::LEVELS - 1, true);
        source.free_table(self.root);
    }

    fn teardown(
        &self,
        source: &dyn PageSource,
        table_pa: PhysicalAddress,
        level: usize,
        root: bool,
    ) {
        let table = self.raw(table_pa);
        for idx in 0..ENTRIES {
            if root && self.upper == UpperHalf::Borrowed && self.is_pinned(level, idx) {
                continue;
            }
            let e = P::Entry::from_raw(table.load(idx));
            if !e.is_present() {
                continue;
            }
            if e.is_leaf(level) {
                source.leaf_unmapped(e.address(), P::entry_pages(level));
            } else {
                self.teardown(source, e.address(), level - 1, false);
                source.free_table(e.address());
            }
            table.store(idx, 0);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mode::{X86Ept4, X86Paging4};
    use crate::testing::{RecordingTlb, TestPhys, TestSource, TlbEvent};

    const CPU0: CpuId = CpuId::new(0);
    const CPU1: CpuId = CpuId::new(1);

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn pa(v: u64) -> PhysicalAddress {
        PhysicalAddress::new(v)
    }

    fn setup() -> (PageTable<X86Paging4>, TestSource, Arc<RecordingTlb>) {
        let source = TestSource::new(pa(0x1000_0000));
        let tlb = Arc::new(RecordingTlb::default());
        let table = PageTable::new(&source, Arc::new(TestPhys::new()), tlb.clone(), AddressSpaceTag::new(7))
            .expect("root");
        (table, source, tlb)
    }

    #[test]
    fn map_query_unmap() {
        let (pt, src, _) = setup();
        let n = pt
            .map(&src, CPU0, va(0x40_0000), pa(0x20_0000), 4, MmuFlags::RW | MmuFlags::USER, MapControl::empty())
            .unwrap();
        assert_eq!(n, 4);
        assert_eq!(src.mapped_frames(), 4);

        let t = pt.query(va(0x40_3123)).unwrap();
        assert_eq!(t.pa, pa(0x20_3123));
        assert_eq!(t.flags, MmuFlags::RW | MmuFlags::USER);
        assert_eq!(t.size, MapSize::Size4K);
        assert_eq!(pt.query(va(0x40_4000)), Err(kernel_info::Status::NotFound));

        // Root + PDPT + PD + PT.
        assert_eq!(pt.table_count(), 4);
        assert_eq!(pt.unmap(&src, CPU0, va(0x40_0000), 4, UnmapControl::empty()).unwrap(), 4);
        assert_eq!(src.mapped_frames(), 0);
        assert_eq!(pt.table_count(), 1);
        assert_eq!(src.freed().len(), 3);
    }

    #[test]
    fn argument_validation() {
        let (pt, src, _) = setup();
        let m = |v, p, n, f| pt.map(&src, CPU0, va(v), pa(p), n, f, MapControl::empty());
        use kernel_info::Status;
        assert_eq!(m(0x1000, 0x1000, 0, MmuFlags::RW), Err(Status::InvalidArguments));
        assert_eq!(m(0x1001, 0x1000, 1, MmuFlags::RW), Err(Status::MisAligned));
        assert_eq!(m(0x1000, 0x1800, 1, MmuFlags::RW), Err(Status::MisAligned));
        assert_eq!(m(0x1000, 0x1000, 1, MmuFlags::USER), Err(Status::InvalidArguments));
        assert_eq!(m(0x0000_8000_0000_0000, 0x1000, 1, MmuFlags::RW), Err(Status::OutOfRange));
        assert_eq!(m(0x0000_7FFF_FFFF_F000, 0x1000, 2, MmuFlags::RW), Err(Status::OutOfRange));
        assert_eq!(
            pt.map(
                &src,
                CPU0,
                va(0x1000),
                pa(0x1000),
                1,
                MmuFlags::RW,
                MapControl::ERROR_IF_EXISTING | MapControl::OVERWRITE_IF_EXISTING
            ),
            Err(Status::InvalidArguments)
        );
    }

    #[test]
    fn existing_translations_follow_map_control() {
        use kernel_info::Status;
        let (pt, src, _) = setup();
        pt.map(&src, CPU0, va(0x2000), pa(0xA000), 1, MmuFlags::READABLE, MapControl::empty())
            .unwrap();

        // Skip: only the new page counts.
        let n = pt
            .map(&src, CPU0, va(0x1000), pa(0x5000), 3, MmuFlags::RW, MapControl::SKIP_IF_EXISTING)
            .unwrap();
        assert_eq!(n, 2);
        assert_eq!(pt.query(va(0x2000)).unwrap().pa, pa(0xA000));

        // Error: nothing changes.
        let before = src.mapped_frames();
        assert_eq!(
            pt.map(&src, CPU0, va(0x0000), pa(0x9000), 4, MmuFlags::RW, MapControl::ERROR_IF_EXISTING),
            Err(Status::AlreadyExists)
        );
        assert_eq!(src.mapped_frames(), before);
        assert_eq!(pt.query(va(0x0000)), Err(Status::NotFound));

        // Overwrite.
        let n = pt
            .map(&src, CPU0, va(0x2000), pa(0xB000), 1, MmuFlags::RW, MapControl::OVERWRITE_IF_EXISTING)
            .unwrap();
        assert_eq!(n, 1);
        assert_eq!(pt.query(va(0x2000)).unwrap().pa, pa(0xB000));
        assert_eq!(src.mapped_frames(), 3);
    }

    #[test]
    fn large_pages_are_used_and_split_on_partial_unmap() {
        let (pt, src, _) = setup();
        let n = pt
            .map(&src, CPU0, va(0x20_0000), pa(0x40_0000), 513, MmuFlags::RW, MapControl::TRY_LARGE_PAGE)
            .unwrap();
        assert_eq!(n, 513);
        assert_eq!(pt.query(va(0x20_0000)).unwrap().size, MapSize::Size2M);
        assert_eq!(pt.query(va(0x40_0000)).unwrap().size, MapSize::Size4K);

        assert_eq!(pt.unmap(&src, CPU0, va(0x21_0000), 1, UnmapControl::empty()).unwrap(), 1);
        assert_eq!(pt.query(va(0x21_0000)), Err(kernel_info::Status::NotFound));
        let t = pt.query(va(0x21_1000)).unwrap();
        assert_eq!(t.size, MapSize::Size4K);
        assert_eq!(t.pa, pa(0x41_1000));
        assert_eq!(src.mapped_frames(), 512);
    }

    #[test]
    fn protect_requires_every_page_mapped() {
        use kernel_info::Status;
        let (pt, src, tlb) = setup();
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 2, MmuFlags::RW, MapControl::empty())
            .unwrap();
        assert_eq!(
            pt.protect(&src, CPU0, va(0x1000), 3, MmuFlags::READABLE),
            Err(Status::NotFound)
        );
        assert_eq!(pt.query(va(0x1000)).unwrap().flags, MmuFlags::RW);

        tlb.clear();
        pt.protect(&src, CPU0, va(0x1000), 2, MmuFlags::READABLE).unwrap();
        assert_eq!(pt.query(va(0x2000)).unwrap().flags, MmuFlags::READABLE);
        assert_eq!(tlb.invalidated_pages(), vec![va(0x1000), va(0x2000)]);

        // Widening needs no invalidation.
        tlb.clear();
        pt.protect(&src, CPU0, va(0x1000), 2, MmuFlags::RWX).unwrap();
        assert!(tlb.events().is_empty());
    }

    #[test]
    fn protect_splits_before_changing_anything() {
        use kernel_info::Status;
        let (pt, src, _) = setup();
        pt.map(&src, CPU0, va(0x20_0000), pa(0x40_0000), 1024, MmuFlags::RW, MapControl::TRY_LARGE_PAGE)
            .unwrap();
        assert_eq!(pt.query(va(0x3F_F000)).unwrap().size, MapSize::Size2M);

        // Both large pages need a split; only one table is left.
        src.set_limit(1);
        assert_eq!(
            pt.protect(&src, CPU0, va(0x3F_F000), 2, MmuFlags::READABLE),
            Err(Status::OutOfMem)
        );
        assert_eq!(pt.query(va(0x3F_F000)).unwrap().flags, MmuFlags::RW);
        assert_eq!(pt.query(va(0x40_0000)).unwrap().flags, MmuFlags::RW);

        src.set_limit(usize::MAX);
        pt.protect(&src, CPU0, va(0x3F_F000), 2, MmuFlags::READABLE).unwrap();
        let t = pt.query(va(0x40_0000)).unwrap();
        assert_eq!((t.size, t.flags, t.pa), (MapSize::Size4K, MmuFlags::READABLE, pa(0x60_0000)));
        assert_eq!(pt.query(va(0x3F_E000)).unwrap().flags, MmuFlags::RW);
        assert_eq!(pt.query(va(0x40_1000)).unwrap().flags, MmuFlags::RW);
        assert_eq!(src.mapped_frames(), 1024);
    }

    #[test]
    fn out_of_tables_rolls_back() {
        let (pt, src, _) = setup();
        // Root exists; one more table is all we get.
        src.set_limit(1);
        assert_eq!(
            pt.map(&src, CPU0, va(0x1000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty()),
            Err(kernel_info::Status::OutOfMem)
        );
        assert_eq!(src.mapped_frames(), 0);

        src.set_limit(usize::MAX);
        pt.map(&src, CPU0, va(0x1F_F000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        // Crossing into the next PT needs one more table than is left.
        src.set_limit(0);
        assert_eq!(
            pt.map(&src, CPU0, va(0x1F_E000), pa(0x8000), 4, MmuFlags::RW, MapControl::SKIP_IF_EXISTING),
            Err(kernel_info::Status::OutOfMem)
        );
        assert_eq!(src.mapped_frames(), 1);
        assert_eq!(pt.query(va(0x1F_E000)), Err(kernel_info::Status::NotFound));
        assert_eq!(pt.query(va(0x1F_F000)).unwrap().pa, pa(0x1000));
    }

    #[test]
    fn only_terminal_keeps_tables() {
        let (pt, src, _) = setup();
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        pt.unmap(&src, CPU0, va(0x1000), 1, UnmapControl::ONLY_TERMINAL).unwrap();
        assert_eq!(pt.table_count(), 4);
        assert!(src.freed().is_empty());
    }

    #[test]
    fn harvest_modes() {
        let (pt, src, _) = setup();
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 2, MmuFlags::RW, MapControl::empty())
            .unwrap();
        pt.simulate_access(va(0x1000)).unwrap();

        let h = pt.harvest_accessed(&src, CPU0, va(0x1000), 2, HarvestControl::Observe).unwrap();
        assert_eq!(h, Harvest { accessed: 1, unmapped: 0 });

        let h = pt
            .harvest_accessed(&src, CPU0, va(0x1000), 2, HarvestControl::ResetAccessed)
            .unwrap();
        assert_eq!(h.accessed, 1);
        let h = pt.harvest_accessed(&src, CPU0, va(0x1000), 2, HarvestControl::Observe).unwrap();
        assert_eq!(h.accessed, 0);

        pt.simulate_access(va(0x2000)).unwrap();
        let h = pt
            .harvest_accessed(&src, CPU0, va(0x1000), 2, HarvestControl::UnmapUnaccessed)
            .unwrap();
        assert_eq!(h, Harvest { accessed: 1, unmapped: 1 });
        assert!(pt.query(va(0x1000)).is_err());
        assert!(pt.query(va(0x2000)).is_ok());
    }

    #[test]
    fn flush_targets_follow_the_active_set() {
        let (pt, src, tlb) = setup();
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        assert!(pt.activate(CPU0));
        assert!(!pt.activate(CPU0));

        tlb.clear();
        pt.unmap(&src, CPU0, va(0x1000), 1, UnmapControl::empty()).unwrap();
        assert!(matches!(tlb.events()[..], [TlbEvent::Local { .. }]));

        pt.activate(CPU1);
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        tlb.clear();
        pt.unmap(&src, CPU0, va(0x1000), 1, UnmapControl::empty()).unwrap();
        let events = tlb.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[1], TlbEvent::Shootdown { targets, .. } if targets == CpuSet::only(CPU1)));

        // A CPU that was away while the table changed must flush on return.
        pt.deactivate(CPU1);
        pt.map(&src, CPU0, va(0x1000), pa(0x1000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        pt.protect(&src, CPU0, va(0x1000), 1, MmuFlags::READABLE).unwrap();
        assert!(pt.activate(CPU1));
    }

    #[test]
    fn user_tables_share_the_kernel_half() {
        use kernel_info::Status;
        let src = TestSource::new(pa(0x1000_0000));
        let phys: Arc<dyn PhysMapper> = Arc::new(TestPhys::new());
        let kernel = PageTable::<X86Paging4>::new_kernel(&src, phys, Arc::new(RecordingTlb::default())).unwrap();
        assert_eq!(kernel.table_count(), 257);

        let user = PageTable::new_sharing(&kernel, &src, AddressSpaceTag::new(3)).unwrap();
        kernel
            .map(&src, CPU0, va(0xFFFF_8880_0000_0000), pa(0x7000), 1, MmuFlags::RW, MapControl::empty())
            .unwrap();
        assert_eq!(user.query(va(0xFFFF_8880_0000_0000)).unwrap().pa, pa(0x7000));
        assert_eq!(
            user.map(&src, CPU0, va(0xFFFF_8880_0000_1000), pa(0x8000), 1, MmuFlags::RW, MapControl::empty()),
            Err(Status::OutOfRange)
        );

        // Emptying the kernel mapping keeps the shared slot.
        kernel
            .unmap(&src, CPU0, va(0xFFFF_8880_0000_0000), 1, UnmapControl::empty())
            .unwrap();
        assert_eq!(kernel.table_count(), 257);

        let freed_before = src.freed().len();
        user.destroy(&src);
        assert_eq!(src.freed().len(), freed_before + 1);
        assert!(kernel.query(va(0xFFFF_8880_0000_0000)).is_err());
    }

    #[test]
    fn ept_tables_walk_the_same_way() {
        let src = TestSource::new(pa(0x1000_0000));
        let pt = PageTable::<X86Ept4>::new(
            &src,
            Arc::new(TestPhys::new()),
            Arc::new(RecordingTlb::default()),
            AddressSpaceTag::new(1),
        )
        .unwrap();
        pt.map(&src, CPU0, va(0x8000_0000), pa(0x4000_0000), 512 * 512, MmuFlags::RWX, MapControl::TRY_LARGE_PAGE)
            .unwrap();
        let t = pt.query(va(0x8000_1234)).unwrap();
        assert_eq!(t.size, MapSize::Size1G);
        assert_eq!(t.pa, pa(0x4000_1234));
        assert_eq!(t.flags, MmuFlags::RWX);
    }
}
