use crate::aspace::{AddressSpace, AspaceKind};
use crate::context::{VmContext, VmmConfig};
use crate::fault::{FaultCause, PageFault};
use alloc::sync::Arc;
use kernel_alloc::Pmm;
use kernel_info::{CpuId, Result, Status};
use kernel_vmem::{MmuContext, PhysMapper, TlbFlush};

/// The virtual memory layer: shared context plus the kernel address space.
#[derive(Debug)]
pub struct Vmm {
    ctx: Arc<VmContext>,
    kernel: Arc<AddressSpace>,
}

impl Vmm {
    /// # Errors
    /// [`Status::OutOfMem`] if the kernel table or the zero page cannot be
    /// allocated.
    pub fn new(
        pmm: Arc<Pmm>,
        mapper: Arc<dyn PhysMapper>,
        tlb: Arc<dyn TlbFlush>,
        mmu: Arc<dyn MmuContext>,
        config: VmmConfig,
    ) -> Result<Self> {
        let ctx = VmContext::new(pmm, mapper, tlb, mmu, config)?;
        let kernel = AddressSpace::create(&ctx, AspaceKind::Kernel)?;
        Ok(Self { ctx, kernel })
    }

    #[must_use]
    pub const fn context(&self) -> &Arc<VmContext> {
        &self.ctx
    }

    #[must_use]
    pub const fn kernel_aspace(&self) -> &Arc<AddressSpace> {
        &self.kernel
    }

    /// # Errors
    /// See [`AddressSpace::create`].
    pub fn create_user_aspace(&self) -> Result<Arc<AddressSpace>> {
        AddressSpace::create(&self.ctx, AspaceKind::User)
    }

    /// Route `fault` by address: the kernel half goes to the kernel space,
    /// everything else to `current`.
    ///
    /// # Errors
    /// - [`Status::InvalidArguments`] for a user-mode fault on a kernel address.
    /// - [`Status::NotFound`] for a lower-half fault without a current user
    ///   space.
    /// - See [`AddressSpace::handle_fault`].
    pub fn handle_fault(
        &self,
        cpu: CpuId,
        current: Option<&AddressSpace>,
        fault: &mut PageFault,
    ) -> Result<()> {
        if fault.va.as_u64() >= AspaceKind::Kernel.range().base.as_u64() {
            if fault.cause.contains(FaultCause::USER) {
                log::trace!("#PF {:?}: user access to the kernel half", fault.va);
                return Err(Status::InvalidArguments);
            }
            return self.kernel.handle_fault(cpu, fault);
        }
        current.ok_or(Status::NotFound)?.handle_fault(cpu, fault)
    }
}
