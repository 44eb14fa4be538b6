//! Host-side stand-ins for physical memory and TLB hardware.

use crate::phys_mapper::PhysMapper;
use crate::source::PageSource;
use crate::tlb::{AddressSpaceTag, MmuContext, PendingInvalidation, TlbFlush};
use alloc::boxed::Box;
use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicI64, AtomicU64, AtomicUsize, Ordering};
use kernel_info::CpuId;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress};
use kernel_sync::{CpuSet, SpinLock};

#[repr(C, align(4096))]
struct Frame([u8; PAGE_SIZE as usize]);

/// Physical memory backed by heap frames, created zeroed on first touch.
///
/// Frames are never released, so pointers handed out stay valid for the
/// lifetime of the arena.
#[derive(Default)]
pub struct TestPhys {
    frames: SpinLock<BTreeMap<u64, Box<Frame>>>,
}

impl TestPhys {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of frames touched so far.
    #[must_use]
    pub fn resident(&self) -> usize {
        self.frames.lock().len()
    }
}

impl PhysMapper for TestPhys {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        let mut frames = self.frames.lock();
        let frame = frames
            .entry(pa.as_u64() >> 12)
            .or_insert_with(|| Box::new(Frame([0; PAGE_SIZE as usize])));
        let base = core::ptr::addr_of_mut!(frame.0).cast::<u8>();
        // Safety: the offset stays inside the 4 KiB frame.
        unsafe { base.add(pa.offset::<Size4K>() as usize) }
    }
}

/// Bump allocator for table frames with an adjustable allowance.
pub struct TestSource {
    next: AtomicU64,
    remaining: AtomicUsize,
    freed: SpinLock<Vec<PhysicalAddress>>,
    mapped: AtomicI64,
}

impl TestSource {
    /// Hand out frames upward from `base`.
    #[must_use]
    pub const fn new(base: PhysicalAddress) -> Self {
        Self {
            next: AtomicU64::new(base.as_u64()),
            remaining: AtomicUsize::new(usize::MAX),
            freed: SpinLock::new(Vec::new()),
            mapped: AtomicI64::new(0),
        }
    }

    /// Allow only `n` more table allocations.
    pub fn set_limit(&self, n: usize) {
        self.remaining.store(n, Ordering::SeqCst);
    }

    #[must_use]
    pub fn freed(&self) -> Vec<PhysicalAddress> {
        self.freed.lock().clone()
    }

    /// Frames currently reported as mapped by leaves.
    #[must_use]
    pub fn mapped_frames(&self) -> i64 {
        self.mapped.load(Ordering::SeqCst)
    }
}

impl PageSource for TestSource {
    fn alloc_table(&self) -> Option<PhysicalAddress> {
        self.remaining
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .ok()?;
        Some(PhysicalAddress::new(self.next.fetch_add(PAGE_SIZE, Ordering::SeqCst)))
    }

    fn free_table(&self, pa: PhysicalAddress) {
        self.freed.lock().push(pa);
    }

    #[allow(clippy::cast_possible_wrap)]
    fn leaf_mapped(&self, _pa: PhysicalAddress, frames: u64) {
        self.mapped.fetch_add(frames as i64, Ordering::SeqCst);
    }

    #[allow(clippy::cast_possible_wrap)]
    fn leaf_unmapped(&self, _pa: PhysicalAddress, frames: u64) {
        self.mapped.fetch_sub(frames as i64, Ordering::SeqCst);
    }
}

/// One call into [`RecordingTlb`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TlbEvent {
    Local {
        tag: AddressSpaceTag,
        pages: Vec<VirtualAddress>,
        full: bool,
    },
    Shootdown {
        from: CpuId,
        targets: CpuSet,
        tag: AddressSpaceTag,
        pages: Vec<VirtualAddress>,
        full: bool,
    },
}

/// Flush policy that records what it was asked to do.
#[derive(Default)]
pub struct RecordingTlb {
    events: SpinLock<Vec<TlbEvent>>,
}

impl RecordingTlb {
    #[must_use]
    pub fn events(&self) -> Vec<TlbEvent> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Pages of all local invalidations, in order.
    #[must_use]
    pub fn invalidated_pages(&self) -> Vec<VirtualAddress> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                TlbEvent::Local { pages, .. } => Some(pages.clone()),
                TlbEvent::Shootdown { .. } => None,
            })
            .flatten()
            .collect()
    }

    /// CPUs that received a shootdown.
    #[must_use]
    pub fn shootdown_targets(&self) -> CpuSet {
        self.events
            .lock()
            .iter()
            .fold(CpuSet::empty(), |acc, e| match e {
                TlbEvent::Shootdown { targets, .. } => acc.union(*targets),
                TlbEvent::Local { .. } => acc,
            })
    }
}

impl TlbFlush for RecordingTlb {
    fn invalidate_local(&self, tag: AddressSpaceTag, batch: &PendingInvalidation) {
        self.events.lock().push(TlbEvent::Local {
            tag,
            pages: batch.pages().to_vec(),
            full: batch.is_full(),
        });
    }

    fn shootdown(
        &self,
        from: CpuId,
        targets: CpuSet,
        tag: AddressSpaceTag,
        batch: &PendingInvalidation,
    ) {
        self.events.lock().push(TlbEvent::Shootdown {
            from,
            targets,
            tag,
            pages: batch.pages().to_vec(),
            full: batch.is_full(),
        });
    }
}

/// One root load seen by [`RecordingMmu`].
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct RootLoad {
    pub cpu: CpuId,
    pub root: PhysicalAddress,
    pub tag: AddressSpaceTag,
    pub flush: bool,
}

/// MMU context that records root loads instead of writing CR3.
#[derive(Default)]
pub struct RecordingMmu {
    loads: SpinLock<Vec<RootLoad>>,
}

impl RecordingMmu {
    #[must_use]
    pub fn loads(&self) -> Vec<RootLoad> {
        self.loads.lock().clone()
    }

    #[must_use]
    pub fn last(&self) -> Option<RootLoad> {
        self.loads.lock().last().copied()
    }
}

impl MmuContext for RecordingMmu {
    fn load(&self, cpu: CpuId, root: PhysicalAddress, tag: AddressSpaceTag, flush: bool) {
        self.loads.lock().push(RootLoad { cpu, root, tag, flush });
    }
}
