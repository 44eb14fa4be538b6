use crate::{PageSize, PhysicalAddress, VirtualAddress};
use core::fmt;
use core::marker::PhantomData;

macro_rules! page_type {
    ($(#[$meta:meta])* $name:ident, $addr:ident) => {
        $(#[$meta])*
        #[repr(transparent)]
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name<S: PageSize> {
            base: u64,
            _size: PhantomData<S>,
        }

        impl<S: PageSize> $name<S> {
            /// Page that contains `addr` (aligns down to the page boundary).
            #[inline]
            #[must_use]
            pub const fn containing(addr: $addr) -> Self {
                Self {
                    base: addr.as_u64() & !(S::SIZE - 1),
                    _size: PhantomData,
                }
            }

            /// Page starting exactly at `addr`, or `None` if `addr` is misaligned.
            #[inline]
            #[must_use]
            pub const fn from_base(addr: $addr) -> Option<Self> {
                if addr.is_aligned::<S>() {
                    Some(Self::containing(addr))
                } else {
                    None
                }
            }

            #[inline]
            #[must_use]
            pub const fn base(self) -> $addr {
                $addr::new(self.base)
            }

            /// Combine this base with an in-page offset.
            #[inline]
            #[must_use]
            pub const fn join(self, offset: u64) -> $addr {
                debug_assert!(offset < S::SIZE);
                $addr::new(self.base | offset)
            }

            /// The page `n` pages after this one.
            #[inline]
            #[must_use]
            pub const fn add(self, n: u64) -> Self {
                Self {
                    base: self.base + n * S::SIZE,
                    _size: PhantomData,
                }
            }
        }

        impl<S: PageSize> fmt::Debug for $name<S> {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "<{}>({:#018X})"), S::as_str(), self.base)
            }
        }

        impl<S: PageSize> From<$name<S>> for $addr {
            #[inline]
            fn from(p: $name<S>) -> Self {
                p.base()
            }
        }
    };
}

page_type!(
    /// Physical page base for size `S`. The low `S::SHIFT` bits are zero.
    ///
    /// ```rust
    /// # use kernel_memory_addresses::*;
    /// let pp = PhysicalPage::<Size4K>::from_base(PhysicalAddress::new(0x5000)).unwrap();
    /// assert_eq!(pp.add(2).base().as_u64(), 0x7000);
    /// assert!(PhysicalPage::<Size4K>::from_base(PhysicalAddress::new(0x5001)).is_none());
    /// ```
    PhysicalPage,
    PhysicalAddress
);

page_type!(
    /// Virtual page base for size `S`. The low `S::SHIFT` bits are zero.
    VirtualPage,
    VirtualAddress
);
