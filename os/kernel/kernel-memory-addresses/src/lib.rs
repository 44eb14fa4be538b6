//! # Virtual and Physical Memory Address Types
//!
//! Strongly typed wrappers for raw memory addresses, page bases, page frame
//! numbers and page-granular ranges used by the physical memory manager, the
//! page-table walker and the virtual memory manager.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] / [`VirtualAddress`] | A raw 64-bit address in one of the two spaces. |
//! | [`PhysicalPage<S>`] / [`VirtualPage<S>`] | A page-aligned base for page size `S`. |
//! | [`Pfn`] | Physical frame number, `pa >> 12`. Index into the frame descriptor array. |
//! | [`PhysicalRange`] / [`VirtualRange`] | Half-open `[base, base + size)` ranges. |
//!
//! Page sizes are marker types implementing [`PageSize`]: [`Size4K`],
//! [`Size2M`] and [`Size1G`].
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
//! let page = pa.page::<Size4K>();
//! assert_eq!(page.base().as_u64(), 0x0000_0010_2000_0000);
//! assert_eq!(page.join(pa.offset::<Size4K>()), pa);
//!
//! let pfn = Pfn::from_phys(pa);
//! assert_eq!(pfn.as_u64(), 0x0102_0000);
//! assert_eq!(pfn.to_phys().as_u64(), 0x0000_0010_2000_0000);
//!
//! let r = VirtualRange::new(VirtualAddress::new(0x4000), 0x3000);
//! assert!(r.contains(VirtualAddress::new(0x6FFF)));
//! assert!(!r.contains(VirtualAddress::new(0x7000)));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`
//!   and `Hash`, making them suitable as map keys.
//! - Alignment and offset helpers are `const fn`.
//! - The phantom marker `S` enforces the page size at the type level.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod address;
mod page;
mod page_size;
mod pfn;
mod range;

pub use address::{PhysicalAddress, VirtualAddress};
pub use page::{PhysicalPage, VirtualPage};
pub use page_size::{PageSize, Size1G, Size2M, Size4K};
pub use pfn::Pfn;
pub use range::{PhysicalRange, VirtualRange};

/// Base page shift (4 KiB frames).
pub const PAGE_SHIFT: u32 = 12;

/// Base page size in bytes.
pub const PAGE_SIZE: u64 = 1 << PAGE_SHIFT;

/// Align `value` down to `align` (must be a power of two).
///
/// ```rust
/// # use kernel_memory_addresses::align_down;
/// assert_eq!(align_down(0x1234, 0x1000), 0x1000);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Align `value` up to `align` (must be a power of two).
///
/// Returns `None` on overflow.
///
/// ```rust
/// # use kernel_memory_addresses::align_up;
/// assert_eq!(align_up(0x1001, 0x1000), Some(0x2000));
/// assert_eq!(align_up(u64::MAX, 0x1000), None);
/// ```
#[inline(always)]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> Option<u64> {
    debug_assert!(align.is_power_of_two());
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Whether `value` is a multiple of `align` (must be a power of two).
#[inline(always)]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Number of 4 KiB pages needed to cover `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}
