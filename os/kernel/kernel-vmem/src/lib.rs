//! # Generic Page Tables
//!
//! A multi-level page-table walker parameterized over the paging format,
//! shared by the kernel's CPU page tables and by guest Extended Page Tables.
//!
//! ## What you get
//! - [`PageTable<P>`]: map / unmap / protect / query / harvest-accessed over
//!   any [`PagingMode`], with large-page support and rollback on allocation
//!   failure.
//! - [`X86Paging4`] / [`X86Ept4`]: the two supported formats, with their
//!   entry encodings [`X86Pte`] and [`EptPte`].
//! - [`MmuFlags`]: architecture-neutral permissions, cast per format.
//! - [`PageSource`], [`TlbFlush`], [`MmuContext`], [`PhysMapper`]: the
//!   policies a table is built from.
//! - [`ArchPageTable`]: enum dispatch over the concrete formats.
//!
//! ## x86-64 Virtual Address → Physical Address Walk
//!
//! ```text
//! | 47‒39 | 38‒30 | 29‒21 | 20‒12 | 11‒0   |
//! |  PML4 |  PDPT |   PD  |   PT  | Offset |
//! |   3   |   2   |   1   |   0   |        |  ← level numbering used here
//! ```
//!
//! A leaf may sit at level 0 (4 KiB), level 1 (2 MiB, `PS=1`) or level 2
//! (1 GiB, `PS=1`). EPT uses the same shape with its own entry bits.
//!
//! ## Invalidation
//!
//! Edits that narrow or remove a translation flush the TLB before they
//! return, locally or by targeted shootdown to the CPUs that have the table
//! loaded. See [`page_table`] for details.

#![cfg_attr(not(test), no_std)]
#![allow(unsafe_code, clippy::inline_always)]

extern crate alloc;

mod arch;
mod entry;
mod error;
mod flags;
mod mode;
pub mod page_table;
mod phys_mapper;
mod source;
mod table;
mod tlb;

#[cfg(any(test, feature = "test-support"))]
pub mod testing;

pub use arch::{ArchKind, ArchPageTable};
pub use entry::{EPT_MEMORY_UC, EPT_MEMORY_WB, EptPte, PageTableEntry, X86Pte};
pub use error::WalkError;
pub use flags::{HarvestControl, MapControl, MmuFlags, UnmapControl};
pub use mode::{PagingMode, X86Ept4, X86Paging4};
pub use page_table::{Harvest, MapSize, PageTable, Translation};
pub use phys_mapper::{PhysMapper, PhysMapperExt};
pub use source::PageSource;
pub use table::{ENTRIES, RawTable};
pub use tlb::{AddressSpaceTag, MmuContext, PendingInvalidation, TlbFlush};

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
pub use tlb::{IpiTransport, ShootdownRequest, X86Mmu, X86Tlb};
