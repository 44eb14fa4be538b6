//! # Page-table entry encodings
//!
//! Two hardware formats share one walker:
//!
//! - [`X86Pte`]: the IA-32e paging entry used at every level of a 4-level
//!   hierarchy (PML4E, PDPTE, PDE, PTE).
//! - [`EptPte`]: the Extended Page Table entry used for guest-physical
//!   translation.
//!
//! Both implement [`PageTableEntry`], which casts [`MmuFlags`] down to
//! hardware bits and back. Levels are numbered from the leaf table upward:
//! level 0 maps 4 KiB, level 1 2 MiB, level 2 1 GiB.

use crate::MmuFlags;
use bitfield_struct::bitfield;
use kernel_memory_addresses::PhysicalAddress;

/// Operations the walker needs from an entry encoding.
pub trait PageTableEntry: Copy + Eq + core::fmt::Debug {
    /// Mask of the hardware "accessed" bit.
    const ACCESSED: u64;

    fn from_raw(bits: u64) -> Self;

    fn raw(self) -> u64;

    fn is_present(self) -> bool;

    /// Whether this present entry terminates the walk at `level`.
    fn is_leaf(self, level: usize) -> bool;

    /// Physical address the entry points at (next table or mapped page).
    fn address(self) -> PhysicalAddress;

    /// Non-leaf entry pointing at the table frame `pa`.
    fn table(pa: PhysicalAddress) -> Self;

    /// Leaf entry mapping `pa` with `flags` at `level`.
    fn leaf(pa: PhysicalAddress, flags: MmuFlags, level: usize) -> Self;

    /// Permissions of a leaf, cast back to [`MmuFlags`].
    fn mmu_flags(self) -> MmuFlags;

    fn is_accessed(self) -> bool {
        self.raw() & Self::ACCESSED != 0
    }
}

/// IA-32e page-table entry.
///
/// The same layout serves all four levels. At levels 1 and 2 `large_page`
/// (PS) turns the entry into a 2 MiB / 1 GiB leaf; at level 0 that bit is
/// PAT and stays clear.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct X86Pte {
    /// Bit 0 — P.
    pub present: bool,
    /// Bit 1 — R/W.
    pub writable: bool,
    /// Bit 2 — U/S.
    pub user: bool,
    /// Bit 3 — PWT.
    pub write_through: bool,
    /// Bit 4 — PCD.
    pub cache_disabled: bool,
    /// Bit 5 — A, set by the CPU on any access.
    pub accessed: bool,
    /// Bit 6 — D, set by the CPU on write (leaves only).
    pub dirty: bool,
    /// Bit 7 — PS (levels 1, 2) / PAT (level 0).
    pub large_page: bool,
    /// Bit 8 — G.
    pub global: bool,
    /// Bits 9–11 — available to software.
    #[bits(3)]
    pub os_low: u8,
    /// Bits 12–51 — physical frame >> 12.
    #[bits(40)]
    pub frame: u64,
    /// Bits 52–58 — available to software.
    #[bits(7)]
    pub os_high: u8,
    /// Bits 59–62 — protection key (leaves, CR4.PKE).
    #[bits(4)]
    pub protection_key: u8,
    /// Bit 63 — XD / NX.
    pub no_execute: bool,
}

impl PageTableEntry for X86Pte {
    const ACCESSED: u64 = 1 << 5;

    #[inline]
    fn from_raw(bits: u64) -> Self {
        Self::from_bits(bits)
    }

    #[inline]
    fn raw(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    fn is_present(self) -> bool {
        self.present()
    }

    #[inline]
    fn is_leaf(self, level: usize) -> bool {
        level == 0 || self.large_page()
    }

    #[inline]
    fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    /// Intermediate entries are maximally permissive; the leaf decides.
    fn table(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_present(true)
            .with_writable(true)
            .with_user(true)
            .with_frame(pa.as_u64() >> 12)
    }

    fn leaf(pa: PhysicalAddress, flags: MmuFlags, level: usize) -> Self {
        Self::new()
            .with_present(flags.has_access())
            .with_writable(flags.contains(MmuFlags::WRITABLE))
            .with_user(flags.contains(MmuFlags::USER))
            .with_cache_disabled(flags.contains(MmuFlags::UNCACHED))
            .with_large_page(level > 0)
            .with_no_execute(!flags.contains(MmuFlags::EXECUTABLE))
            .with_frame(pa.as_u64() >> 12)
    }

    fn mmu_flags(self) -> MmuFlags {
        let mut flags = MmuFlags::READABLE;
        flags.set(MmuFlags::WRITABLE, self.writable());
        flags.set(MmuFlags::EXECUTABLE, !self.no_execute());
        flags.set(MmuFlags::USER, self.user());
        flags.set(MmuFlags::UNCACHED, self.cache_disabled());
        flags
    }
}

/// EPT memory type: write-back.
pub const EPT_MEMORY_WB: u8 = 6;
/// EPT memory type: uncacheable.
pub const EPT_MEMORY_UC: u8 = 0;

/// Extended Page Table entry (guest-physical → host-physical).
///
/// An entry is present when any of R/W/X is set. There is no user bit;
/// [`MmuFlags::USER`] is ignored by this encoding.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct EptPte {
    pub read: bool,
    pub write: bool,
    pub execute: bool,
    /// Bits 3–5 — memory type (leaves only).
    #[bits(3)]
    pub memory_type: u8,
    pub ignore_pat: bool,
    /// Bit 7 — 2 MiB / 1 GiB leaf.
    pub large_page: bool,
    pub accessed: bool,
    pub dirty: bool,
    /// Bit 10 — execute for user-mode linear addresses (MBEC).
    pub user_execute: bool,
    #[bits(1)]
    __r0: u8,
    #[bits(40)]
    pub frame: u64,
    #[bits(11)]
    __r1: u16,
    pub suppress_ve: bool,
}

impl PageTableEntry for EptPte {
    const ACCESSED: u64 = 1 << 8;

    #[inline]
    fn from_raw(bits: u64) -> Self {
        Self::from_bits(bits)
    }

    #[inline]
    fn raw(self) -> u64 {
        self.into_bits()
    }

    #[inline]
    fn is_present(self) -> bool {
        self.read() || self.write() || self.execute()
    }

    #[inline]
    fn is_leaf(self, level: usize) -> bool {
        level == 0 || self.large_page()
    }

    #[inline]
    fn address(self) -> PhysicalAddress {
        PhysicalAddress::new(self.frame() << 12)
    }

    fn table(pa: PhysicalAddress) -> Self {
        Self::new()
            .with_read(true)
            .with_write(true)
            .with_execute(true)
            .with_frame(pa.as_u64() >> 12)
    }

    fn leaf(pa: PhysicalAddress, flags: MmuFlags, level: usize) -> Self {
        let memory_type = if flags.contains(MmuFlags::UNCACHED) {
            EPT_MEMORY_UC
        } else {
            EPT_MEMORY_WB
        };
        Self::new()
            .with_read(flags.contains(MmuFlags::READABLE))
            .with_write(flags.contains(MmuFlags::WRITABLE))
            .with_execute(flags.contains(MmuFlags::EXECUTABLE))
            .with_memory_type(memory_type)
            .with_ignore_pat(true)
            .with_large_page(level > 0)
            .with_frame(pa.as_u64() >> 12)
    }

    fn mmu_flags(self) -> MmuFlags {
        let mut flags = MmuFlags::empty();
        flags.set(MmuFlags::READABLE, self.read());
        flags.set(MmuFlags::WRITABLE, self.write());
        flags.set(MmuFlags::EXECUTABLE, self.execute());
        flags.set(MmuFlags::UNCACHED, self.memory_type() == EPT_MEMORY_UC);
        flags
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn x86_leaf_encoding() {
        let pa = PhysicalAddress::new(0x0012_3000);
        let e = X86Pte::leaf(pa, MmuFlags::RW | MmuFlags::USER, 0);
        assert!(e.present() && e.writable() && e.user() && e.no_execute());
        assert!(!e.large_page());
        assert_eq!(e.address(), pa);
        assert_eq!(e.mmu_flags(), MmuFlags::RW | MmuFlags::USER);
        assert_eq!(e.raw(), (1 << 63) | 0x0012_3000 | 0b111);
    }

    #[test]
    fn x86_read_only_executable_and_uncached() {
        let e = X86Pte::leaf(PhysicalAddress::new(0x20_0000), MmuFlags::RX | MmuFlags::UNCACHED, 1);
        assert!(e.is_leaf(1));
        assert!(!e.writable() && !e.no_execute() && e.cache_disabled());
        assert_eq!(e.mmu_flags(), MmuFlags::RX | MmuFlags::UNCACHED);
    }

    #[test]
    fn x86_without_access_is_not_present() {
        let e = X86Pte::leaf(PhysicalAddress::new(0x1000), MmuFlags::USER, 0);
        assert!(!e.is_present());
    }

    #[test]
    fn x86_table_entry_is_not_a_leaf_above_level_zero() {
        let t = X86Pte::table(PhysicalAddress::new(0x5000));
        assert!(t.is_present());
        assert!(!t.is_leaf(2));
        assert_eq!(t.address().as_u64(), 0x5000);
    }

    #[test]
    fn ept_encoding_ignores_user_and_sets_memory_type() {
        let e = EptPte::leaf(PhysicalAddress::new(0x4000), MmuFlags::RW | MmuFlags::USER, 0);
        assert!(e.is_present());
        assert_eq!(e.memory_type(), EPT_MEMORY_WB);
        assert_eq!(e.mmu_flags(), MmuFlags::RW);

        let uc = EptPte::leaf(PhysicalAddress::new(0x4000), MmuFlags::READABLE | MmuFlags::UNCACHED, 0);
        assert_eq!(uc.memory_type(), EPT_MEMORY_UC);
        assert_eq!(uc.mmu_flags(), MmuFlags::READABLE | MmuFlags::UNCACHED);
    }

    #[test]
    fn accessed_masks_match_the_fields() {
        assert!(X86Pte::new().with_accessed(true).is_accessed());
        assert!(EptPte::new().with_accessed(true).is_accessed());
        assert_eq!(X86Pte::new().with_accessed(true).raw(), X86Pte::ACCESSED);
        assert_eq!(EptPte::new().with_accessed(true).raw(), EptPte::ACCESSED);
    }
}
