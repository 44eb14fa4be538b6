//! # Page Faults
//!
//! The trap handler decodes the x86 error code into a [`PageFault`] and
//! hands it to [`AddressSpace::handle_fault`] (or [`Vmm::handle_fault`],
//! which picks the address space):
//!
//! ```text
//!  #PF ─► PageFault::from_error_code(cr2, code)
//!          │
//!          ├─ no mapping at va ............................ NotFound
//!          ├─ user access to the kernel half ................ InvalidArguments
//!          ├─ write to RO / fetch from NX / user to kernel .. Unsupported
//!          │
//!          ├─ physical object ─► map base + offset
//!          └─ paged object ─► cursor.require_owned_page
//!                              ├─ Page ─► map (RO unless private)
//!                              └─ Wait ─► ShouldWait, fault.request set
//! ```
//!
//! [`Vmm::handle_fault`]: crate::Vmm::handle_fault

use crate::aspace::{AddressSpace, AspaceKind};
use crate::object::VmObject;
use crate::page_request::PageRequest;
use crate::paged::Resolution;
use alloc::sync::Arc;
use bitfield_struct::bitfield;
use bitflags::bitflags;
use kernel_info::{CpuId, Result, Status};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Size4K, VirtualAddress};
use kernel_vmem::{MapControl, MmuFlags};

/// Error code pushed by the CPU for `#PF`.
#[bitfield(u64)]
#[derive(PartialEq, Eq)]
pub struct PageFaultErrorCode {
    /// Bit 0 — P: the page was present (protection violation).
    pub present: bool,
    /// Bit 1 — W/R: the access was a write.
    pub write: bool,
    /// Bit 2 — U/S: the access came from user mode.
    pub user: bool,
    /// Bit 3 — RSVD: a reserved bit was set in a paging entry.
    pub reserved_bit: bool,
    /// Bit 4 — I/D: instruction fetch.
    pub instruction_fetch: bool,
    /// Bit 5 — PK: protection-key violation.
    pub protection_key: bool,
    /// Bit 6 — SS: shadow-stack access.
    pub shadow_stack: bool,
    #[bits(8)]
    __: u8,
    /// Bit 15 — SGX.
    pub sgx: bool,
    #[bits(48)]
    __: u64,
}

bitflags! {
    /// Why a page fault happened, independent of the error-code layout.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct FaultCause: u8 {
        /// No translation was present.
        const ABSENT      = 1 << 0;
        const WRITE       = 1 << 1;
        /// Raised in user mode.
        const USER        = 1 << 2;
        const INSTRUCTION = 1 << 3;
    }
}

impl From<PageFaultErrorCode> for FaultCause {
    fn from(code: PageFaultErrorCode) -> Self {
        let mut cause = Self::empty();
        cause.set(Self::ABSENT, !code.present());
        cause.set(Self::WRITE, code.write());
        cause.set(Self::USER, code.user());
        cause.set(Self::INSTRUCTION, code.instruction_fetch());
        cause
    }
}

/// One fault being resolved.
#[derive(Debug, Clone)]
pub struct PageFault {
    pub va: VirtualAddress,
    pub cause: FaultCause,
    /// Set when resolution returns [`Status::ShouldWait`]: wait on it, then
    /// retry the fault.
    pub request: Option<Arc<PageRequest>>,
}

impl PageFault {
    #[must_use]
    pub const fn new(va: VirtualAddress, cause: FaultCause) -> Self {
        Self {
            va,
            cause,
            request: None,
        }
    }

    /// Decode the faulting address (CR2) and the pushed error code.
    #[must_use]
    pub fn from_error_code(cr2: u64, code: u64) -> Self {
        Self::new(VirtualAddress::new(cr2), PageFaultErrorCode::from_bits(code).into())
    }

    #[must_use]
    pub const fn is_write(&self) -> bool {
        self.cause.contains(FaultCause::WRITE)
    }
}

impl AddressSpace {
    /// Resolve `fault` and install the translation.
    ///
    /// # Errors
    /// - [`Status::NotFound`] if no mapping covers the address.
    /// - [`Status::InvalidArguments`] for a user-mode fault on a kernel
    ///   address.
    /// - [`Status::Unsupported`] for a permission violation.
    /// - [`Status::ShouldWait`] if a page provider has not delivered yet;
    ///   `fault.request` is set.
    /// - [`Status::OutOfMem`] if a frame or table cannot be allocated.
    /// - [`Status::BadState`] if the address space was destroyed.
    pub fn handle_fault(&self, cpu: CpuId, fault: &mut PageFault) -> Result<()> {
        self.check()?;
        self.count_fault();
        let va = fault.va;
        let cause = fault.cause;
        log::trace!("#PF {va:?} {cause:?} on cpu {cpu:?}");

        let user_half = AspaceKind::User.range().contains(va);
        if cause.contains(FaultCause::USER) && (self.kind() == AspaceKind::Kernel || !user_half) {
            return Err(Status::InvalidArguments);
        }

        let regions = self.regions();
        let mapping = regions.mapping_at(va).ok_or(Status::NotFound)?;
        let flags = mapping.flags();
        let denied = (cause.contains(FaultCause::WRITE) && !flags.contains(MmuFlags::WRITABLE))
            || (cause.contains(FaultCause::INSTRUCTION) && !flags.contains(MmuFlags::EXECUTABLE))
            || (cause.contains(FaultCause::USER) && !flags.contains(MmuFlags::USER));
        if denied {
            log::trace!("#PF {va:?}: {cause:?} not allowed by {flags:?}");
            return Err(Status::Unsupported);
        }

        let page = va.align_down::<Size4K>();
        let offset = mapping.object_offset(va);
        let (pa, flags) = match &**mapping.object() {
            VmObject::Physical(window) => (window.lookup_range(offset)?, flags),
            VmObject::Paged(object) => {
                let mut cursor = object.cursor();
                match cursor.require_owned_page(cpu, offset / PAGE_SIZE, fault.is_write())? {
                    Resolution::Page { pfn, writable } => {
                        let flags = if writable {
                            flags
                        } else {
                            flags.difference(MmuFlags::WRITABLE)
                        };
                        // Map under the cursor so a racing decommit cannot
                        // release the frame first.
                        self.install(cpu, page, pfn.to_phys(), flags)?;
                        return Ok(());
                    }
                    Resolution::Wait(request) => {
                        log::trace!("#PF {va:?}: waiting for index {}", request.index());
                        fault.request = Some(request);
                        return Err(Status::ShouldWait);
                    }
                }
            }
        };
        self.install(cpu, page, pa, flags)
    }

    fn install(
        &self,
        cpu: CpuId,
        page: VirtualAddress,
        pa: PhysicalAddress,
        flags: MmuFlags,
    ) -> Result<()> {
        self.table()
            .map(
                self.ctx().page_source(),
                cpu,
                page,
                pa,
                1,
                flags,
                MapControl::OVERWRITE_IF_EXISTING,
            )
            .map(|_| ())
    }
}
