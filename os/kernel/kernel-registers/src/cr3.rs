use crate::{LoadRegisterUnsafe, StoreRegisterUnsafe};
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// CR3 — Page-Map Level-4 Base Register (IA-32e, CR4.PCIDE = 1).
///
/// With process-context identifiers enabled, bits 0–11 carry the PCID of the
/// address space instead of the PWT/PCD cache controls. Bit 63 is write-only:
/// when set on a store, the TLB entries tagged with the new PCID are kept.
#[bitfield(u64)]
pub struct Cr3 {
    /// Bits 0–11 — PCID: process-context identifier (0 = kernel).
    #[bits(12)]
    pub pcid: u16,

    /// Bits 12–51 — root table physical base >> 12.
    #[bits(40)]
    root_base_4k: u64,

    /// Bits 52–62 — Reserved.
    #[bits(11)]
    __: u16,

    /// Bit 63 — no-flush hint (store only).
    pub preserve_tlb: bool,
}

impl Cr3 {
    /// Build a CR3 value for a 4 KiB-aligned root table and a PCID.
    #[must_use]
    pub fn for_root(root: PhysicalAddress, pcid: u16, preserve_tlb: bool) -> Self {
        debug_assert_eq!(root.as_u64() & 0xFFF, 0, "root table must be 4K-aligned");
        debug_assert!(pcid < 4096, "PCID is 12 bits");
        Self::new()
            .with_pcid(pcid)
            .with_root_base_4k(root.as_u64() >> 12)
            .with_preserve_tlb(preserve_tlb)
    }

    /// Physical address of the root table.
    #[must_use]
    pub fn root(&self) -> PhysicalAddress {
        PhysicalAddress::new(self.root_base_4k() << 12)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl LoadRegisterUnsafe for Cr3 {
    unsafe fn load_unsafe() -> Self {
        let mut cr3: u64;
        unsafe {
            core::arch::asm!("mov {}, cr3", out(reg) cr3, options(nomem, nostack, preserves_flags));
        }
        Self::from_bits(cr3)
    }
}

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
impl StoreRegisterUnsafe for Cr3 {
    unsafe fn store_unsafe(self) {
        let cr3 = self.into_bits();
        unsafe {
            core::arch::asm!("mov cr3, {}", in(reg) cr3, options(nostack, preserves_flags));
        }
    }
}
