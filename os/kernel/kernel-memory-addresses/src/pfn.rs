use crate::{PAGE_SHIFT, PhysicalAddress};
use core::fmt;
use core::ops::{Add, Sub};

/// Physical frame number: `physical_address >> 12`.
///
/// Frame descriptors are addressed by `Pfn`; free lists link frames by it.
///
/// ```rust
/// # use kernel_memory_addresses::*;
/// let pfn = Pfn::new(0x104);
/// assert_eq!(pfn.buddy(2), Pfn::new(0x100));
/// assert_eq!(pfn.buddy(0), Pfn::new(0x105));
/// assert!(Pfn::new(0x100).is_aligned(8));
/// ```
#[repr(transparent)]
#[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct Pfn(u64);

impl Pfn {
    #[inline]
    #[must_use]
    pub const fn new(v: u64) -> Self {
        Self(v)
    }

    #[inline]
    #[must_use]
    pub const fn from_phys(pa: PhysicalAddress) -> Self {
        Self(pa.as_u64() >> PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn to_phys(self) -> PhysicalAddress {
        PhysicalAddress::new(self.0 << PAGE_SHIFT)
    }

    #[inline]
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }

    #[inline]
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Whether this frame is the base of an order-`order` block.
    #[inline]
    #[must_use]
    pub const fn is_aligned(self, order: u32) -> bool {
        self.0 & ((1 << order) - 1) == 0
    }

    /// The address-aligned partner of an order-`order` block starting here.
    #[inline]
    #[must_use]
    pub const fn buddy(self, order: u32) -> Self {
        Self(self.0 ^ (1 << order))
    }

    /// Largest order whose block starting at this frame is naturally aligned.
    #[inline]
    #[must_use]
    pub const fn alignment_order(self) -> u32 {
        if self.0 == 0 {
            u64::BITS
        } else {
            self.0.trailing_zeros()
        }
    }
}

impl fmt::Debug for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PFN({:#x})", self.0)
    }
}

impl fmt::Display for Pfn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}", self.0)
    }
}

impl Add<u64> for Pfn {
    type Output = Self;
    #[inline]
    fn add(self, rhs: u64) -> Self {
        Self(self.0 + rhs)
    }
}

impl Sub for Pfn {
    type Output = u64;
    #[inline]
    fn sub(self, rhs: Self) -> u64 {
        self.0 - rhs.0
    }
}

impl From<PhysicalAddress> for Pfn {
    #[inline]
    fn from(pa: PhysicalAddress) -> Self {
        Self::from_phys(pa)
    }
}
