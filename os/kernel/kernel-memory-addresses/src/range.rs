use crate::{PAGE_SIZE, PhysicalAddress, VirtualAddress};
use core::fmt;

macro_rules! range_type {
    ($(#[$meta:meta])* $name:ident, $addr:ident) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Hash)]
        pub struct $name {
            pub base: $addr,
            pub size: u64,
        }

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(base: $addr, size: u64) -> Self {
                Self { base, size }
            }

            /// Exclusive end as a raw value; saturates at `u64::MAX`.
            #[inline]
            #[must_use]
            pub const fn end(&self) -> u64 {
                self.base.as_u64().saturating_add(self.size)
            }

            /// Last byte covered, or `None` for an empty range.
            #[inline]
            #[must_use]
            pub const fn last(&self) -> Option<u64> {
                if self.size == 0 {
                    None
                } else {
                    Some(self.base.as_u64() + (self.size - 1))
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_empty(&self) -> bool {
                self.size == 0
            }

            #[inline]
            #[must_use]
            pub const fn contains(&self, addr: $addr) -> bool {
                match self.last() {
                    Some(last) => addr.as_u64() >= self.base.as_u64() && addr.as_u64() <= last,
                    None => false,
                }
            }

            /// Whether `other` lies entirely within `self`.
            #[inline]
            #[must_use]
            pub const fn contains_range(&self, other: &Self) -> bool {
                match (self.last(), other.last()) {
                    (Some(last), Some(olast)) => {
                        other.base.as_u64() >= self.base.as_u64() && olast <= last
                    }
                    _ => false,
                }
            }

            #[inline]
            #[must_use]
            pub const fn overlaps(&self, other: &Self) -> bool {
                match (self.last(), other.last()) {
                    (Some(last), Some(olast)) => {
                        self.base.as_u64() <= olast && other.base.as_u64() <= last
                    }
                    _ => false,
                }
            }

            #[inline]
            #[must_use]
            pub const fn is_page_aligned(&self) -> bool {
                crate::is_aligned(self.base.as_u64(), PAGE_SIZE)
                    && crate::is_aligned(self.size, PAGE_SIZE)
            }

            /// Number of 4 KiB pages touched by this range.
            #[inline]
            #[must_use]
            pub const fn pages(&self) -> u64 {
                crate::pages_for(self.size)
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "[{:#x}, {:#x})", self.base.as_u64(), self.end())
            }
        }
    };
}

range_type!(
    /// Half-open physical range `[base, base + size)`.
    PhysicalRange,
    PhysicalAddress
);

range_type!(
    /// Half-open virtual range `[base, base + size)`.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::*;
    /// let a = VirtualRange::new(VirtualAddress::new(0x1000), 0x2000);
    /// let b = VirtualRange::new(VirtualAddress::new(0x2000), 0x1000);
    /// let c = VirtualRange::new(VirtualAddress::new(0x3000), 0x1000);
    /// assert!(a.overlaps(&b));
    /// assert!(!a.overlaps(&c));
    /// assert!(a.contains_range(&b));
    /// ```
    VirtualRange,
    VirtualAddress
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_ranges_contain_and_overlap_nothing() {
        let e = VirtualRange::new(VirtualAddress::new(0x1000), 0);
        let r = VirtualRange::new(VirtualAddress::new(0x0), 0x10_000);
        assert!(!e.contains(VirtualAddress::new(0x1000)));
        assert!(!r.overlaps(&e));
        assert!(!r.contains_range(&e));
    }

    #[test]
    fn ranges_reaching_top_of_address_space() {
        let top = VirtualRange::new(VirtualAddress::new(0xFFFF_FFFF_FFFF_F000), 0x1000);
        assert_eq!(top.last(), Some(u64::MAX));
        assert!(top.contains(VirtualAddress::new(u64::MAX)));
        assert_eq!(top.end(), u64::MAX);
    }

    #[test]
    fn page_counts_round_up() {
        let r = PhysicalRange::new(PhysicalAddress::new(0), 0x1001);
        assert_eq!(r.pages(), 2);
        assert!(!r.is_page_aligned());
    }
}
