use crate::entry::{EptPte, PageTableEntry, X86Pte};
use crate::table::ENTRIES;
use kernel_memory_addresses::{PAGE_SHIFT, VirtualAddress};

/// Shape of a paging hierarchy.
///
/// Levels count from the leaf table (0) up to the root (`LEVELS - 1`).
pub trait PagingMode: Send + Sync + 'static {
    type Entry: PageTableEntry;

    const NAME: &'static str;

    /// Number of table levels.
    const LEVELS: usize;

    /// Whether a leaf may be installed at `level`.
    fn leaf_allowed(level: usize) -> bool;

    /// First root slot that maps the shared upper half, if the format has one.
    const UPPER_HALF_SLOT: Option<usize>;

    /// VA bit shift of entries at `level`.
    #[inline]
    #[must_use]
    fn shift(level: usize) -> u32 {
        PAGE_SHIFT + 9 * level as u32
    }

    /// Bytes covered by one entry at `level`.
    #[inline]
    #[must_use]
    fn entry_size(level: usize) -> u64 {
        1 << Self::shift(level)
    }

    /// Number of 4 KiB pages covered by one entry at `level`.
    #[inline]
    #[must_use]
    fn entry_pages(level: usize) -> u64 {
        1 << (9 * level)
    }

    #[inline]
    #[must_use]
    fn index(va: VirtualAddress, level: usize) -> usize {
        va.table_index(Self::shift(level)) % ENTRIES
    }

    /// Whether `va` is translatable by this format.
    fn is_valid_va(va: VirtualAddress) -> bool;

    /// Walk offset of `va`: the address with any sign extension stripped.
    #[inline]
    #[must_use]
    fn linear(va: VirtualAddress) -> u64 {
        va.as_u64() & LINEAR_MASK
    }

    /// Inverse of [`linear`](Self::linear).
    fn from_linear(lin: u64) -> VirtualAddress;
}

/// Bits translated by a 4-level walk.
pub const LINEAR_MASK: u64 = (1 << 48) - 1;

/// IA-32e 4-level paging (PML4 → PDPT → PD → PT).
pub struct X86Paging4;

impl PagingMode for X86Paging4 {
    type Entry = X86Pte;

    const NAME: &'static str = "x86-64 4-level";
    const LEVELS: usize = 4;
    const UPPER_HALF_SLOT: Option<usize> = Some(256);

    #[inline]
    fn leaf_allowed(level: usize) -> bool {
        level <= 2
    }

    #[inline]
    fn is_valid_va(va: VirtualAddress) -> bool {
        va.is_canonical()
    }

    #[inline]
    #[allow(clippy::cast_possible_wrap, clippy::cast_sign_loss)]
    fn from_linear(lin: u64) -> VirtualAddress {
        VirtualAddress::new((((lin << 16) as i64) >> 16) as u64)
    }
}

/// 4-level Extended Page Tables. Guest-physical addresses are 48 bits and
/// have no upper half.
pub struct X86Ept4;

impl PagingMode for X86Ept4 {
    type Entry = EptPte;

    const NAME: &'static str = "EPT 4-level";
    const LEVELS: usize = 4;
    const UPPER_HALF_SLOT: Option<usize> = None;

    #[inline]
    fn leaf_allowed(level: usize) -> bool {
        level <= 2
    }

    #[inline]
    fn is_valid_va(va: VirtualAddress) -> bool {
        va.as_u64() >> VirtualAddress::BITS == 0
    }

    #[inline]
    fn from_linear(lin: u64) -> VirtualAddress {
        VirtualAddress::new(lin)
    }
}
