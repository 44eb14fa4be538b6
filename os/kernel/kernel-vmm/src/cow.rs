//! Page index to frame map of a paged object.

use crate::page_request::PageRequest;
use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use kernel_memory_addresses::Pfn;

/// What backs one page of an object.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Slot {
    /// Private frame; may be mapped writable.
    Owned(Pfn),
    /// Frame also referenced by a clone or the object it was cloned from.
    /// Mapped read-only until a write makes it private.
    Shared(Pfn),
    /// Reads as zeroes; backed by the shared zero frame.
    Zero,
}

impl Slot {
    /// The frame this slot holds a reference on.
    #[must_use]
    pub const fn frame(self) -> Option<Pfn> {
        match self {
            Self::Owned(pfn) | Self::Shared(pfn) => Some(pfn),
            Self::Zero => None,
        }
    }
}

/// Sparse slots plus requests still outstanding at a page source.
///
/// Absent indices have no entry in either map.
#[derive(Debug, Default)]
pub(crate) struct CowPageMap {
    slots: BTreeMap<u64, Slot>,
    pending: BTreeMap<u64, Arc<PageRequest>>,
    pages: u64,
}

impl CowPageMap {
    pub(crate) const fn new(pages: u64) -> Self {
        Self {
            slots: BTreeMap::new(),
            pending: BTreeMap::new(),
            pages,
        }
    }

    /// Object size in pages.
    pub(crate) const fn pages(&self) -> u64 {
        self.pages
    }

    pub(crate) const fn set_pages(&mut self, pages: u64) {
        self.pages = pages;
    }

    pub(crate) fn get(&self, index: u64) -> Option<Slot> {
        self.slots.get(&index).copied()
    }

    /// Install `slot`, returning what was there.
    pub(crate) fn insert(&mut self, index: u64, slot: Slot) -> Option<Slot> {
        debug_assert!(index < self.pages);
        self.slots.insert(index, slot)
    }

    /// Remove and return the slots of `[first, first + count)`.
    pub(crate) fn take_range(&mut self, first: u64, count: u64) -> Vec<(u64, Slot)> {
        let taken: Vec<_> = self
            .slots
            .range(first..first.saturating_add(count))
            .map(|(&i, &s)| (i, s))
            .collect();
        for (index, _) in &taken {
            self.slots.remove(index);
        }
        taken
    }

    pub(crate) fn range(&self, first: u64, count: u64) -> impl Iterator<Item = (u64, Slot)> + '_ {
        self.slots
            .range(first..first.saturating_add(count))
            .map(|(&i, &s)| (i, s))
    }

    pub(crate) fn range_mut(
        &mut self,
        first: u64,
        count: u64,
    ) -> impl Iterator<Item = (u64, &mut Slot)> + '_ {
        self.slots
            .range_mut(first..first.saturating_add(count))
            .map(|(&i, s)| (i, s))
    }

    /// Every slot, for teardown.
    pub(crate) fn drain(&mut self) -> impl Iterator<Item = Slot> + '_ {
        core::mem::take(&mut self.slots).into_values()
    }

    pub(crate) fn pending(&self, index: u64) -> Option<&Arc<PageRequest>> {
        self.pending.get(&index)
    }

    pub(crate) fn add_pending(&mut self, index: u64, request: Arc<PageRequest>) {
        self.pending.insert(index, request);
    }

    pub(crate) fn take_pending(&mut self, index: u64) -> Option<Arc<PageRequest>> {
        self.pending.remove(&index)
    }

    /// Cancel the requests of `[first, first + count)`; returns how many
    /// were still outstanding.
    pub(crate) fn cancel_range(&mut self, first: u64, count: u64) -> usize {
        let indices: Vec<u64> = self
            .pending
            .range(first..first.saturating_add(count))
            .map(|(&i, _)| i)
            .collect();
        indices
            .into_iter()
            .filter_map(|i| self.pending.remove(&i))
            .filter(|r| r.cancel())
            .count()
    }

    /// Slots that hold a frame.
    pub(crate) fn resident(&self) -> usize {
        self.slots.values().filter(|s| s.frame().is_some()).count()
    }

    /// Slots of any kind, zero markers included.
    pub(crate) fn committed(&self) -> usize {
        self.slots.len()
    }
}
