//! # Virtual Memory
//!
//! Address spaces, the regions inside them, and the objects that back those
//! regions, on top of [`kernel_alloc::Pmm`] for frames and
//! [`kernel_vmem::ArchPageTable`] for translations.
//!
//! ```text
//!  Vmm ─┬─ VmContext (pmm, mapper, mmu, kernel root, zero page, PCIDs)
//!       └─ AddressSpace (kernel) ...  AddressSpace (user) ─► ArchPageTable
//!                                        │
//!                                   RegionSet
//!                                    ├─ Area ── children ...
//!                                    └─ Mapping ─► VmObject ─┬─ Paged ─► CowPageMap
//!                                                            └─ Physical (base, size)
//! ```
//!
//! Nothing is backed until touched: a fault resolves through
//! [`AddressSpace::handle_fault`], which asks the object for a page through
//! its [`Cursor`] and installs the translation. Copy-on-write clones share
//! frames until the first write.
//!
//! ## Example
//!
//! ```ignore
//! let vmm = Vmm::new(pmm, mapper, tlb, mmu, VmmConfig::default())?;
//! let user = vmm.create_user_aspace()?;
//! let object = VmObjectPaged::create(vmm.context(), Gaf::USER, 4, VmoFlags::empty())?;
//! let va = user.create_subregion(
//!     RegionRange::anywhere(4 * PAGE_SIZE),
//!     PAGE_SIZE,
//!     MmuFlags::READ | MmuFlags::WRITABLE,
//!     Some(Backing::new(object, 0)),
//! )?;
//! let mut fault = PageFault::new(va, FaultCause::ABSENT | FaultCause::WRITE | FaultCause::USER);
//! vmm.handle_fault(cpu, Some(&user), &mut fault)?;
//! ```
//!
//! ## Locking
//!
//! | Data | Guard |
//! |------|-------|
//! | regions of one address space | `TicketMutex<RegionSet>` |
//! | pages of one object | `SpinLock<CowPageMap>`, held by a [`Cursor`] |
//! | mappings of one object | `SpinLock` over the mapping links |
//! | translations | the page table's own lock |
//! | frames | zone and per-CPU cache locks in `kernel-alloc` |
//!
//! Locks are taken in the order of the table. Address spaces found through
//! mapping links are kept alive until every object lock is released, so an
//! address space is never torn down under one.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod aspace;
mod context;
mod cow;
mod error;
mod fault;
mod object;
mod page_request;
mod paged;
mod pcid;
mod region;
mod vmm;

pub use aspace::{AddressSpace, AspaceKind};
pub use context::{VmContext, VmmConfig};
pub use cow::Slot;
pub use error::RegionError;
pub use fault::{FaultCause, PageFault, PageFaultErrorCode};
pub use object::{CommitOption, VmObject, VmObjectPhysical, VmoFlags};
pub use page_request::{PageProvider, PageRequest, ProviderReply};
pub use paged::{Cursor, Resolution, VmObjectPaged};
pub use region::{Backing, RegionInfo, RegionKind, RegionRange};
pub use vmm::Vmm;
