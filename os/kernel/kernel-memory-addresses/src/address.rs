use crate::{PageSize, PhysicalPage, Pfn, VirtualPage};
use core::fmt;
use core::ops::{Add, AddAssign, Sub};

macro_rules! address_type {
    ($(#[$meta:meta])* $name:ident, $page:ident, $tag:literal) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name(u64);

        impl $name {
            #[inline]
            #[must_use]
            pub const fn new(v: u64) -> Self {
                Self(v)
            }

            #[inline]
            #[must_use]
            pub const fn zero() -> Self {
                Self(0)
            }

            #[inline]
            #[must_use]
            pub const fn as_u64(self) -> u64 {
                self.0
            }

            /// The page of size `S` containing this address.
            #[inline]
            #[must_use]
            pub const fn page<S: PageSize>(self) -> $page<S> {
                $page::<S>::containing(self)
            }

            /// Offset of this address within its page of size `S`.
            #[inline]
            #[must_use]
            pub const fn offset<S: PageSize>(self) -> u64 {
                self.0 & (S::SIZE - 1)
            }

            #[inline]
            #[must_use]
            pub const fn is_aligned<S: PageSize>(self) -> bool {
                self.offset::<S>() == 0
            }

            #[inline]
            #[must_use]
            pub const fn align_down<S: PageSize>(self) -> Self {
                Self(self.0 & !(S::SIZE - 1))
            }

            /// Align up to a page boundary of size `S`; `None` on overflow.
            #[inline]
            #[must_use]
            pub const fn align_up<S: PageSize>(self) -> Option<Self> {
                match crate::align_up(self.0, S::SIZE) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_add(self, rhs: u64) -> Option<Self> {
                match self.0.checked_add(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }

            #[inline]
            #[must_use]
            pub const fn checked_sub(self, rhs: u64) -> Option<Self> {
                match self.0.checked_sub(rhs) {
                    Some(v) => Some(Self(v)),
                    None => None,
                }
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!($tag, "(0x{:016X})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "0x{:016X}", self.0)
            }
        }

        impl fmt::LowerHex for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::LowerHex::fmt(&self.0, f)
            }
        }

        impl From<u64> for $name {
            #[inline]
            fn from(v: u64) -> Self {
                Self(v)
            }
        }

        impl From<$name> for u64 {
            #[inline]
            fn from(v: $name) -> Self {
                v.0
            }
        }

        impl Add<u64> for $name {
            type Output = Self;
            #[inline]
            fn add(self, rhs: u64) -> Self {
                Self(self.0 + rhs)
            }
        }

        impl AddAssign<u64> for $name {
            #[inline]
            fn add_assign(&mut self, rhs: u64) {
                self.0 += rhs;
            }
        }

        impl Sub<u64> for $name {
            type Output = Self;
            #[inline]
            fn sub(self, rhs: u64) -> Self {
                Self(self.0 - rhs)
            }
        }

        impl Sub for $name {
            type Output = u64;
            #[inline]
            fn sub(self, rhs: Self) -> u64 {
                self.0 - rhs.0
            }
        }
    };
}

address_type!(
    /// Physical memory address (RAM or MMIO).
    ///
    /// Carries intent and prevents accidental VA/PA mix-ups.
    PhysicalAddress,
    PhysicalPage,
    "PA"
);

address_type!(
    /// Virtual memory address as seen through the page tables.
    VirtualAddress,
    VirtualPage,
    "VA"
);

impl PhysicalAddress {
    /// Frame number of the 4 KiB frame containing this address.
    #[inline]
    #[must_use]
    pub const fn pfn(self) -> Pfn {
        Pfn::from_phys(self)
    }
}

impl VirtualAddress {
    /// Number of implemented virtual address bits with 4-level paging.
    pub const BITS: u32 = 48;

    /// Whether bits 63..47 are a sign extension of bit 47.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::VirtualAddress;
    /// assert!(VirtualAddress::new(0x0000_7FFF_FFFF_F000).is_canonical());
    /// assert!(VirtualAddress::new(0xFFFF_8000_0000_0000).is_canonical());
    /// assert!(!VirtualAddress::new(0x0000_8000_0000_0000).is_canonical());
    /// ```
    #[inline]
    #[must_use]
    pub const fn is_canonical(self) -> bool {
        let upper = self.0 >> (Self::BITS - 1);
        upper == 0 || upper == (1 << (64 - Self::BITS + 1)) - 1
    }

    /// The 9-bit table index selected by this address at a level with the
    /// given shift (12 for the leaf table, 21, 30, 39, 48 above it).
    #[inline]
    #[must_use]
    pub const fn table_index(self, shift: u32) -> usize {
        ((self.0 >> shift) & 0x1FF) as usize
    }

    #[inline]
    #[must_use]
    pub fn from_ptr<T>(ptr: *const T) -> Self {
        Self(ptr.addr() as u64)
    }

    #[inline]
    #[must_use]
    pub fn as_ptr<T>(self) -> *const T {
        self.0 as usize as *const T
    }

    #[inline]
    #[must_use]
    pub fn as_mut_ptr<T>(self) -> *mut T {
        self.0 as usize as *mut T
    }
}
