//! # Zones
//!
//! A zone is a physically contiguous span of one node's memory managed by a
//! binary buddy allocator. Blocks of order `k` are `2^k` frames whose base
//! PFN is `2^k`-aligned; each order keeps its own free list.
//!
//! ```text
//! alloc(0) with only an order-2 block free:
//!
//!   order 2: [0x100 ─────────────── 0x103]
//!   split →  order 1: [0x102 ─ 0x103]      (upper half back on list 1)
//!   split →  order 0: [0x101]              (upper half back on list 0)
//!   return   0x100
//! ```
//!
//! Freeing walks the same path upward, merging with the buddy
//! (`pfn ^ (1 << order)`) while it is free, of equal order and in this zone.

use crate::frame::{Frame, FrameRole, FrameState};
use crate::free_list::FreeList;
use crate::memory_model::MemoryModel;
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::fatal::fatal;
use kernel_info::memory::{DMA_ZONE_LIMIT, DMA32_ZONE_LIMIT, MAX_FRAME_ORDER, NR_FRAME_ORDERS};
use kernel_info::{NodeId, Result, Status, invariant};
use kernel_memory_addresses::{PAGE_SHIFT, Pfn};
use kernel_sync::SpinLock;

pub const NR_ZONE_TYPES: usize = 3;

/// Address class of a zone.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ZoneType {
    /// Below 16 MiB.
    Dma = 0,
    /// Below 4 GiB.
    Dma32 = 1,
    Normal = 2,
}

impl ZoneType {
    pub const ALL: [Self; NR_ZONE_TYPES] = [Self::Dma, Self::Dma32, Self::Normal];

    #[must_use]
    pub const fn from_index(index: usize) -> Self {
        match index {
            0 => Self::Dma,
            1 => Self::Dma32,
            _ => Self::Normal,
        }
    }

    #[must_use]
    pub const fn index(self) -> usize {
        self as usize
    }

    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Dma => "DMA",
            Self::Dma32 => "DMA32",
            Self::Normal => "Normal",
        }
    }

    /// The zone a frame falls into by address.
    #[must_use]
    pub const fn of(pfn: Pfn) -> Self {
        let pa = pfn.as_u64() << PAGE_SHIFT;
        if pa < DMA_ZONE_LIMIT {
            Self::Dma
        } else if pa < DMA32_ZONE_LIMIT {
            Self::Dma32
        } else {
            Self::Normal
        }
    }

    /// First PFN past this zone's address class.
    #[must_use]
    pub const fn end_pfn(self) -> Pfn {
        match self {
            Self::Dma => Pfn::new(DMA_ZONE_LIMIT >> PAGE_SHIFT),
            Self::Dma32 => Pfn::new(DMA32_ZONE_LIMIT >> PAGE_SHIFT),
            Self::Normal => Pfn::new(u64::MAX),
        }
    }
}

/// Where a zone's free memory sits relative to its watermarks.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Ord, PartialOrd)]
pub enum Watermark {
    /// Below the moderate mark.
    Critical,
    /// Below the sufficient mark.
    Moderate,
    Sufficient,
}

/// Counter snapshot.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct ZoneStats {
    pub present: u64,
    pub managed: u64,
    pub reserved: u64,
    pub spanned: u64,
    pub allocated: u64,
    pub cached: u64,
    pub free: u64,
}

#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
struct Marks {
    critical: u64,
    moderate: u64,
    sufficient: u64,
}

impl Marks {
    const fn for_managed(managed: u64) -> Self {
        Self {
            critical: managed / 64,
            moderate: managed / 32,
            sufficient: managed / 16,
        }
    }
}

pub struct Zone {
    zone_type: ZoneType,
    node: NodeId,
    start_pfn: Pfn,
    end_pfn: Pfn,
    present: u64,
    managed: u64,
    reserved: u64,
    marks: Marks,
    free: AtomicU64,
    allocated: AtomicU64,
    cached: AtomicU64,
    lists: SpinLock<[FreeList; NR_FRAME_ORDERS]>,
}

impl fmt::Debug for Zone {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Zone")
            .field("name", &self.zone_type.name())
            .field("node", &self.node)
            .field("start_pfn", &self.start_pfn)
            .field("stats", &self.stats())
            .finish_non_exhaustive()
    }
}

#[track_caller]
fn descriptor(model: &MemoryModel, pfn: Pfn) -> &Frame {
    match model.frame(pfn) {
        Some(frame) => frame,
        None => fatal(format_args!("no descriptor for {pfn:?}")),
    }
}

impl Zone {
    pub(crate) fn new(node: NodeId, zone_type: ZoneType) -> Self {
        Self {
            zone_type,
            node,
            start_pfn: Pfn::new(0),
            end_pfn: Pfn::new(0),
            present: 0,
            managed: 0,
            reserved: 0,
            marks: Marks::default(),
            free: AtomicU64::new(0),
            allocated: AtomicU64::new(0),
            cached: AtomicU64::new(0),
            lists: SpinLock::new(core::array::from_fn(|_| FreeList::new())),
        }
    }

    #[must_use]
    pub const fn zone_type(&self) -> ZoneType {
        self.zone_type
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.zone_type.name()
    }

    #[must_use]
    pub const fn node(&self) -> NodeId {
        self.node
    }

    #[must_use]
    pub const fn start_pfn(&self) -> Pfn {
        self.start_pfn
    }

    #[must_use]
    pub const fn spanned(&self) -> u64 {
        self.end_pfn.as_u64() - self.start_pfn.as_u64()
    }

    #[must_use]
    pub const fn managed(&self) -> u64 {
        self.managed
    }

    #[must_use]
    pub fn free_frames(&self) -> u64 {
        self.free.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn stats(&self) -> ZoneStats {
        ZoneStats {
            present: self.present,
            managed: self.managed,
            reserved: self.reserved,
            spanned: self.spanned(),
            allocated: self.allocated.load(Ordering::Acquire),
            cached: self.cached.load(Ordering::Acquire),
            free: self.free_frames(),
        }
    }

    /// Number of free blocks on each order's list.
    #[must_use]
    pub fn free_blocks(&self) -> [u64; NR_FRAME_ORDERS] {
        let lists = self.lists.lock();
        core::array::from_fn(|order| lists[order].len())
    }

    #[must_use]
    pub fn watermark(&self) -> Watermark {
        let free = self.free_frames();
        if free >= self.marks.sufficient {
            Watermark::Sufficient
        } else if free >= self.marks.moderate {
            Watermark::Moderate
        } else {
            Watermark::Critical
        }
    }

    fn extend_span(&mut self, start: Pfn, end: Pfn) {
        if self.present == 0 {
            self.start_pfn = start;
            self.end_pfn = end;
        } else {
            self.start_pfn = self.start_pfn.min(start);
            self.end_pfn = self.end_pfn.max(end);
        }
    }

    /// Hand `[start, end)` to the buddy allocator.
    ///
    /// The caller has checked that no frame in the range is attached yet.
    pub(crate) fn attach(&mut self, model: &mut MemoryModel, start: Pfn, end: Pfn) {
        let count = end - start;
        model.populate(start, end);
        for raw in start.as_u64()..end.as_u64() {
            if let Some(frame) = model.frame_mut(Pfn::new(raw)) {
                frame.bind(self.node, self.zone_type, FrameRole::Pmm, FrameState::empty());
            }
        }

        let model: &MemoryModel = model;
        {
            let mut lists = self.lists.lock();
            let mut pfn = start;
            while pfn < end {
                let remaining = end - pfn;
                let order = pfn
                    .alignment_order()
                    .min(MAX_FRAME_ORDER)
                    .min(remaining.ilog2());
                self.insert_locked(&mut lists, model, pfn, order);
                pfn = pfn + (1 << order);
            }
        }

        self.extend_span(start, end);
        self.present += count;
        self.managed += count;
        self.free.fetch_add(count, Ordering::AcqRel);
        self.marks = Marks::for_managed(self.managed);
        log::debug!(
            "{:?}/{}: attached [{start:?}, {end:?}), {} managed frames",
            self.node,
            self.name(),
            self.managed
        );
    }

    /// Account `[start, end)` as present but never allocatable. The frames
    /// count as allocated for good.
    pub(crate) fn reserve(&mut self, model: &mut MemoryModel, start: Pfn, end: Pfn) {
        let count = end - start;
        for raw in start.as_u64()..end.as_u64() {
            if let Some(frame) = model.frame_mut(Pfn::new(raw))
                && frame.role() == FrameRole::Unused
            {
                frame.bind(self.node, self.zone_type, FrameRole::Unused, FrameState::RESERVED);
            }
        }
        self.extend_span(start, end);
        self.present += count;
        self.reserved += count;
        self.allocated.fetch_add(count, Ordering::AcqRel);
    }

    /// Put a block on its list, merging with free buddies. Counters are the
    /// caller's business.
    fn insert_locked(
        &self,
        lists: &mut [FreeList; NR_FRAME_ORDERS],
        model: &MemoryModel,
        mut pfn: Pfn,
        mut order: u32,
    ) {
        descriptor(model, pfn).set_order(0);
        while order < MAX_FRAME_ORDER {
            let Some(buddy) = model.frame(pfn.buddy(order)) else {
                break;
            };
            if !buddy.is_free()
                || buddy.order() != order
                || buddy.zone_type() != self.zone_type
                || buddy.node() != self.node
            {
                break;
            }
            lists[order as usize].remove(model, buddy);
            buddy.remove_state(FrameState::FREE);
            buddy.set_order(0);
            pfn = pfn.min(buddy.pfn());
            order += 1;
        }
        let head = descriptor(model, pfn);
        head.set_order(order);
        head.insert_state(FrameState::FREE);
        lists[order as usize].push(model, head);
    }

    /// Take an order-`order` block off the lists, splitting a larger one if
    /// needed.
    fn take_locked(
        &self,
        lists: &mut [FreeList; NR_FRAME_ORDERS],
        model: &MemoryModel,
        order: u32,
    ) -> Option<Pfn> {
        let found = (order..=MAX_FRAME_ORDER).find(|&o| !lists[o as usize].is_empty())?;
        let head = lists[found as usize].pop(model)?;
        invariant!(
            head.is_free() && head.order() == found,
            "{:?} on order-{found} list with order {}",
            head.pfn(),
            head.order()
        );
        head.remove_state(FrameState::FREE);

        let pfn = head.pfn();
        let mut current = found;
        while current > order {
            current -= 1;
            let upper = descriptor(model, pfn + (1 << current));
            upper.set_order(current);
            upper.insert_state(FrameState::FREE);
            lists[current as usize].push(model, upper);
        }
        head.set_order(order);
        Some(pfn)
    }

    /// Whether taking `frames` keeps the zone at or above its critical mark.
    fn above_critical(&self, frames: u64) -> bool {
        self.free_frames()
            .checked_sub(frames)
            .is_some_and(|left| left >= self.marks.critical)
    }

    fn account_alloc(&self, frames: u64) {
        let before = self.free.fetch_sub(frames, Ordering::AcqRel);
        self.allocated.fetch_add(frames, Ordering::AcqRel);
        if before >= self.marks.moderate && before - frames < self.marks.moderate {
            log::warn!(
                "{:?}/{}: free frames fell below the moderate watermark ({} left)",
                self.node,
                self.name(),
                before - frames
            );
        }
    }

    /// Allocate an order-`order` block, ignoring watermarks.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] if `order` exceeds [`MAX_FRAME_ORDER`].
    /// - [`Status::OutOfMem`] if no list at or above `order` has a block.
    pub fn alloc(&self, model: &MemoryModel, order: u32) -> Result<Pfn> {
        self.alloc_checked(model, order, true)
    }

    /// Allocate honoring the critical watermark unless `required`.
    pub(crate) fn alloc_checked(
        &self,
        model: &MemoryModel,
        order: u32,
        required: bool,
    ) -> Result<Pfn> {
        if order > MAX_FRAME_ORDER {
            return Err(Status::InvalidArguments);
        }
        let frames = 1u64 << order;
        let pfn = {
            let mut lists = self.lists.lock();
            if !required && !self.above_critical(frames) {
                return Err(Status::OutOfMem);
            }
            let pfn = self.take_locked(&mut lists, model, order).ok_or(Status::OutOfMem)?;
            self.account_alloc(frames);
            pfn
        };
        let head = descriptor(model, pfn);
        head.set_role(FrameRole::Pmm);
        head.set_reference_count(1);
        Ok(pfn)
    }

    /// Move up to `count` order-0 frames into `out` under one lock hold.
    /// The frames are flagged [`FrameState::CACHED`] and carry no reference.
    pub(crate) fn alloc_batch(
        &self,
        model: &MemoryModel,
        count: usize,
        required: bool,
        out: &mut Vec<Pfn>,
    ) -> usize {
        let mut taken = 0;
        let mut lists = self.lists.lock();
        while taken < count {
            if !required && !self.above_critical(1) {
                break;
            }
            let Some(pfn) = self.take_locked(&mut lists, model, 0) else {
                break;
            };
            self.account_alloc(1);
            descriptor(model, pfn).insert_state(FrameState::CACHED);
            out.push(pfn);
            taken += 1;
        }
        drop(lists);
        self.cached.fetch_add(taken as u64, Ordering::AcqRel);
        log::trace!("{:?}/{}: batch of {taken} frames to a per-CPU cache", self.node, self.name());
        taken
    }

    /// Return cached order-0 frames under one lock hold.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn free_batch(
        &self,
        model: &MemoryModel,
        pfns: impl IntoIterator<Item = Pfn>,
    ) -> usize {
        let mut returned = 0u64;
        let mut lists = self.lists.lock();
        for pfn in pfns {
            let frame = descriptor(model, pfn);
            invariant!(
                frame.state().contains(FrameState::CACHED),
                "{pfn:?} returned from a per-CPU cache without being cached"
            );
            frame.reset_state(FrameState::empty());
            self.insert_locked(&mut lists, model, pfn, 0);
            returned += 1;
        }
        drop(lists);
        self.release_accounting(returned);
        self.cached.fetch_sub(returned, Ordering::AcqRel);
        returned as usize
    }

    fn release_accounting(&self, frames: u64) {
        let prev = self.allocated.fetch_sub(frames, Ordering::AcqRel);
        invariant!(prev >= frames, "{}: allocated counter underflow", self.name());
        self.free.fetch_add(frames, Ordering::AcqRel);
    }

    /// Return an order-`order` block and coalesce it with free buddies.
    ///
    /// Freeing a block already on a free list, or one that still carries
    /// references or mappings, is fatal.
    #[track_caller]
    pub fn free(&self, model: &MemoryModel, pfn: Pfn, order: u32) {
        invariant!(order <= MAX_FRAME_ORDER, "free of order {order}");
        invariant!(pfn.is_aligned(order), "free of misaligned order-{order} block {pfn:?}");
        let frame = descriptor(model, pfn);
        invariant!(
            frame.zone_type() == self.zone_type && frame.node() == self.node,
            "{pfn:?} freed into the wrong zone"
        );
        frame.check_releasable();
        frame.reset_state(FrameState::empty());
        frame.set_role(FrameRole::Pmm);
        {
            let mut lists = self.lists.lock();
            self.insert_locked(&mut lists, model, pfn, order);
        }
        self.release_accounting(1 << order);
    }

    /// Take a frame back out of the cached counter when a per-CPU cache
    /// hands it to a caller.
    pub(crate) fn uncache(&self, frames: u64) {
        self.cached.fetch_sub(frames, Ordering::AcqRel);
    }

    /// A caller parked frames in a per-CPU cache.
    pub(crate) fn recache(&self, frames: u64) {
        self.cached.fetch_add(frames, Ordering::AcqRel);
    }

    /// Whether `pfn` belongs to this zone.
    #[must_use]
    pub fn contains(&self, model: &MemoryModel, pfn: Pfn) -> bool {
        model.frame(pfn).is_some_and(|f| {
            f.role() != FrameRole::Unused
                && f.zone_type() == self.zone_type
                && f.node() == self.node
        })
    }
}
