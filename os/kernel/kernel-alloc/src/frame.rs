//! # Frame Descriptors
//!
//! One [`Frame`] per attached physical page. Descriptors are shared by
//! reference across CPUs, so every field that changes after attach is an
//! atomic. The free-list link fields are only written under the owning
//! zone's lock.

use crate::zone::ZoneType;
use bitflags::bitflags;
use core::sync::atomic::{AtomicU8, AtomicU16, AtomicU32, AtomicU64, Ordering};
use kernel_info::{NodeId, invariant};
use kernel_memory_addresses::{PhysicalAddress, Pfn};

/// Sentinel for an empty link.
pub(crate) const NO_LINK: u64 = u64::MAX;

/// Who currently uses a frame.
#[repr(u8)]
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameRole {
    /// Not attached to any zone.
    Unused = 0,
    Io = 1,
    Lru = 2,
    PageTable = 3,
    Slab = 4,
    /// Managed by the frame allocator and not claimed for a specific use.
    Pmm = 5,
    Mmio = 6,
}

impl FrameRole {
    const fn from_u8(v: u8) -> Self {
        match v {
            1 => Self::Io,
            2 => Self::Lru,
            3 => Self::PageTable,
            4 => Self::Slab,
            5 => Self::Pmm,
            6 => Self::Mmio,
            _ => Self::Unused,
        }
    }
}

bitflags! {
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FrameState: u16 {
        const DIRTY = 1 << 0;
        const ACTIVE = 1 << 1;
        const PINNED = 1 << 2;
        const SHARED = 1 << 3;
        /// Parked in a per-CPU cache.
        const CACHED = 1 << 4;
        /// Head of a block on a zone free list.
        const FREE = 1 << 5;
        const RESERVED = 1 << 6;
    }
}

/// Whether a descriptor stands for one page or heads a multi-page block.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum FrameKind {
    Frame,
    Folio { order: u32 },
}

/// Physical page descriptor.
#[derive(Debug)]
pub struct Frame {
    pfn: Pfn,
    node: u16,
    zone: u8,
    role: AtomicU8,
    order: AtomicU8,
    state: AtomicU16,
    mapped_count: AtomicU32,
    reference_count: AtomicU32,
    next: AtomicU64,
    prev: AtomicU64,
}

impl Frame {
    pub(crate) const fn new(pfn: Pfn) -> Self {
        Self {
            pfn,
            node: 0,
            zone: 0,
            role: AtomicU8::new(FrameRole::Unused as u8),
            order: AtomicU8::new(0),
            state: AtomicU16::new(0),
            mapped_count: AtomicU32::new(0),
            reference_count: AtomicU32::new(0),
            next: AtomicU64::new(NO_LINK),
            prev: AtomicU64::new(NO_LINK),
        }
    }

    /// Bind the descriptor to its zone when its range is attached.
    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn bind(
        &mut self,
        node: NodeId,
        zone: ZoneType,
        role: FrameRole,
        state: FrameState,
    ) {
        self.node = node.as_usize() as u16;
        self.zone = zone as u8;
        *self.role.get_mut() = role as u8;
        *self.state.get_mut() = state.bits();
        *self.order.get_mut() = 0;
    }

    #[inline]
    #[must_use]
    pub const fn pfn(&self) -> Pfn {
        self.pfn
    }

    #[inline]
    #[must_use]
    pub const fn phys(&self) -> PhysicalAddress {
        self.pfn.to_phys()
    }

    #[inline]
    #[must_use]
    pub const fn node(&self) -> NodeId {
        NodeId::new(self.node)
    }

    #[inline]
    #[must_use]
    pub const fn zone_type(&self) -> ZoneType {
        ZoneType::from_index(self.zone as usize)
    }

    #[must_use]
    pub fn role(&self) -> FrameRole {
        FrameRole::from_u8(self.role.load(Ordering::Acquire))
    }

    pub fn set_role(&self, role: FrameRole) {
        self.role.store(role as u8, Ordering::Release);
    }

    #[must_use]
    pub fn state(&self) -> FrameState {
        FrameState::from_bits_retain(self.state.load(Ordering::Acquire))
    }

    pub fn insert_state(&self, flags: FrameState) {
        self.state.fetch_or(flags.bits(), Ordering::AcqRel);
    }

    pub fn remove_state(&self, flags: FrameState) {
        self.state.fetch_and(!flags.bits(), Ordering::AcqRel);
    }

    pub(crate) fn reset_state(&self, flags: FrameState) {
        self.state.store(flags.bits(), Ordering::Release);
    }

    #[inline]
    #[must_use]
    pub fn is_free(&self) -> bool {
        self.state().contains(FrameState::FREE)
    }

    /// Order of the block this frame heads (free or allocated); 0 otherwise.
    #[must_use]
    pub fn order(&self) -> u32 {
        u32::from(self.order.load(Ordering::Acquire))
    }

    #[allow(clippy::cast_possible_truncation)]
    pub(crate) fn set_order(&self, order: u32) {
        self.order.store(order as u8, Ordering::Release);
    }

    #[must_use]
    pub fn kind(&self) -> FrameKind {
        match self.order() {
            0 => FrameKind::Frame,
            order if !self.is_free() => FrameKind::Folio { order },
            _ => FrameKind::Frame,
        }
    }

    #[must_use]
    pub fn reference_count(&self) -> u32 {
        self.reference_count.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn mapped_count(&self) -> u32 {
        self.mapped_count.load(Ordering::Acquire)
    }

    pub(crate) fn set_reference_count(&self, count: u32) {
        self.reference_count.store(count, Ordering::Release);
    }

    /// Take one more reference; returns the new count.
    pub fn get(&self) -> u32 {
        self.reference_count.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Drop one reference; returns the new count.
    #[track_caller]
    pub fn put(&self) -> u32 {
        let prev = self.reference_count.fetch_sub(1, Ordering::AcqRel);
        invariant!(prev != 0, "reference count underflow on {:?}", self.pfn);
        prev - 1
    }

    pub fn map(&self) {
        self.mapped_count.fetch_add(1, Ordering::AcqRel);
    }

    #[track_caller]
    pub fn unmap(&self) {
        let prev = self.mapped_count.fetch_sub(1, Ordering::AcqRel);
        invariant!(prev != 0, "mapped count underflow on {:?}", self.pfn);
    }

    /// Abort unless the frame may go back to the allocator.
    #[track_caller]
    pub(crate) fn check_releasable(&self) {
        let state = self.state();
        invariant!(
            !state.intersects(FrameState::FREE | FrameState::CACHED),
            "double free of {:?}",
            self.pfn
        );
        invariant!(
            !state.contains(FrameState::PINNED),
            "freeing pinned frame {:?}",
            self.pfn
        );
        invariant!(
            self.reference_count() == 0 && self.mapped_count() == 0,
            "freeing {:?} with {} references and {} mappings",
            self.pfn,
            self.reference_count(),
            self.mapped_count()
        );
    }

    pub(crate) fn next(&self) -> u64 {
        self.next.load(Ordering::Relaxed)
    }

    pub(crate) fn prev(&self) -> u64 {
        self.prev.load(Ordering::Relaxed)
    }

    pub(crate) fn set_next(&self, pfn: u64) {
        self.next.store(pfn, Ordering::Relaxed);
    }

    pub(crate) fn set_prev(&self, pfn: u64) {
        self.prev.store(pfn, Ordering::Relaxed);
    }
}
