//! # TLB maintenance
//!
//! Edits that remove or narrow a translation queue the affected page into a
//! [`PendingInvalidation`]. Before the edit returns, the batch is handed to
//! a [`TlbFlush`] policy: locally when only the current CPU can hold the
//! translation, by shootdown to every other CPU in the table's active set
//! otherwise.
//!
//! The address-space tag (PCID on x86) scopes every invalidation, so a CPU
//! that switched away keeps its cached translations of other spaces.

use kernel_info::CpuId;
use kernel_info::memory::TLB_BATCH;
use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};
use kernel_sync::CpuSet;

/// Address-space identifier used to tag TLB entries (PCID 1..=4095 for user
/// spaces, 0 for the kernel).
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct AddressSpaceTag(u16);

impl AddressSpaceTag {
    pub const KERNEL: Self = Self(0);

    #[must_use]
    pub const fn new(tag: u16) -> Self {
        Self(tag)
    }

    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self.0
    }
}

/// Batched set of virtual pages awaiting invalidation.
///
/// Holds up to [`TLB_BATCH`] page addresses. One more turns it into a full
/// flush of the tag, after which further pages are not recorded.
#[derive(Clone)]
pub struct PendingInvalidation {
    pages: [VirtualAddress; TLB_BATCH],
    len: usize,
    full: bool,
}

impl Default for PendingInvalidation {
    fn default() -> Self {
        Self::new()
    }
}

impl core::fmt::Debug for PendingInvalidation {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        if self.full {
            f.write_str("PendingInvalidation(full)")
        } else {
            f.debug_list().entries(self.pages()).finish()
        }
    }
}

impl PendingInvalidation {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            pages: [VirtualAddress::zero(); TLB_BATCH],
            len: 0,
            full: false,
        }
    }

    /// Queue one page. Overflows into a full flush.
    pub fn push(&mut self, va: VirtualAddress) {
        if self.full {
            return;
        }
        if self.len == TLB_BATCH {
            self.full = true;
            self.len = 0;
            return;
        }
        self.pages[self.len] = va;
        self.len += 1;
    }

    /// Queue `count` consecutive pages starting at `va`, each `stride` bytes.
    pub fn push_range(&mut self, va: VirtualAddress, count: u64, stride: u64) {
        if count > TLB_BATCH as u64 {
            self.mark_full();
            return;
        }
        for i in 0..count {
            self.push(va + i * stride);
        }
    }

    pub fn mark_full(&mut self) {
        self.full = true;
        self.len = 0;
    }

    #[must_use]
    pub const fn is_full(&self) -> bool {
        self.full
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        !self.full && self.len == 0
    }

    /// Queued pages; empty when the batch degraded to a full flush.
    #[must_use]
    pub fn pages(&self) -> &[VirtualAddress] {
        &self.pages[..self.len]
    }

    pub fn clear(&mut self) {
        self.len = 0;
        self.full = false;
    }
}

/// Flush policy for one paging format.
pub trait TlbFlush: Send + Sync {
    /// Invalidate the batch on the calling CPU.
    fn invalidate_local(&self, tag: AddressSpaceTag, batch: &PendingInvalidation);

    /// Invalidate the batch on every CPU in `targets` and wait for them to
    /// acknowledge. `targets` never contains the calling CPU.
    fn shootdown(
        &self,
        from: CpuId,
        targets: CpuSet,
        tag: AddressSpaceTag,
        batch: &PendingInvalidation,
    );
}

/// Loads a translation root on the current CPU.
pub trait MmuContext: Send + Sync {
    /// Install `root` tagged with `tag`. When `flush` is set, translations
    /// previously cached under `tag` must be discarded.
    fn load(&self, cpu: CpuId, root: PhysicalAddress, tag: AddressSpaceTag, flush: bool);
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use hw::*;

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
mod hw {
    use super::{AddressSpaceTag, MmuContext, PendingInvalidation, TlbFlush};
    use alloc::sync::Arc;
    use core::sync::atomic::{AtomicU32, Ordering};
    use kernel_info::CpuId;
    use kernel_memory_addresses::PhysicalAddress;
    use kernel_registers::{Cr3, StoreRegisterUnsafe, tlb};
    use kernel_sync::CpuSet;

    /// Transport for shootdown IPIs, provided by the interrupt controller
    /// driver. The handler on the target CPU calls
    /// [`ShootdownRequest::service`].
    pub trait IpiTransport: Send + Sync {
        fn send_shootdown(&self, target: CpuId, request: Arc<ShootdownRequest>);
    }

    /// One shootdown in flight: the batch plus an acknowledgement counter.
    pub struct ShootdownRequest {
        tag: AddressSpaceTag,
        batch: PendingInvalidation,
        outstanding: AtomicU32,
    }

    impl ShootdownRequest {
        /// Run on the target CPU from the IPI handler.
        pub fn service(&self) {
            invalidate(self.tag, &self.batch);
            self.outstanding.fetch_sub(1, Ordering::AcqRel);
        }
    }

    fn invalidate(tag: AddressSpaceTag, batch: &PendingInvalidation) {
        // Kernel translations are cached under every PCID. Otherwise
        // the target has the tagged space loaded, so the current PCID
        // is the right one.
        unsafe {
            if tag == AddressSpaceTag::KERNEL {
                tlb::invpcid_all_contexts();
            } else if batch.is_full() {
                tlb::flush_current();
            } else {
                for &va in batch.pages() {
                    tlb::invlpg(va);
                }
            }
        }
    }

    /// x86 flush policy: `invlpg` for the current PCID, CR3 reload for
    /// full flushes, IPIs for remote CPUs.
    pub struct X86Tlb<I: IpiTransport> {
        ipi: I,
    }

    impl<I: IpiTransport> X86Tlb<I> {
        pub const fn new(ipi: I) -> Self {
            Self { ipi }
        }
    }

    impl<I: IpiTransport> TlbFlush for X86Tlb<I> {
        fn invalidate_local(&self, tag: AddressSpaceTag, batch: &PendingInvalidation) {
            invalidate(tag, batch);
        }

        fn shootdown(
            &self,
            _from: CpuId,
            targets: CpuSet,
            tag: AddressSpaceTag,
            batch: &PendingInvalidation,
        ) {
            let request = Arc::new(ShootdownRequest {
                tag,
                batch: batch.clone(),
                outstanding: AtomicU32::new(targets.len()),
            });
            for cpu in targets.iter() {
                self.ipi.send_shootdown(cpu, request.clone());
            }
            while request.outstanding.load(Ordering::Acquire) != 0 {
                core::hint::spin_loop();
            }
        }
    }

    /// Loads CR3 with PCID. `flush == false` sets the no-flush hint.
    pub struct X86Mmu;

    impl MmuContext for X86Mmu {
        fn load(&self, _cpu: CpuId, root: PhysicalAddress, tag: AddressSpaceTag, flush: bool) {
            let cr3 = Cr3::for_root(root, tag.as_u16(), !flush);
            unsafe { cr3.store_unsafe() };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn batch_overflows_into_full_flush() {
        let mut batch = PendingInvalidation::new();
        for i in 0..TLB_BATCH as u64 {
            batch.push(VirtualAddress::new(i * 0x1000));
        }
        assert!(!batch.is_full());
        assert_eq!(batch.pages().len(), TLB_BATCH);

        batch.push(VirtualAddress::new(0xdead_0000));
        assert!(batch.is_full());
        assert!(batch.pages().is_empty());
        assert!(!batch.is_empty());

        batch.clear();
        assert!(batch.is_empty());
    }

    #[test]
    fn large_ranges_skip_straight_to_full() {
        let mut batch = PendingInvalidation::new();
        batch.push_range(VirtualAddress::new(0), 512, 0x1000);
        assert!(batch.is_full());
    }
}
