//! # HHDM-based PhysMapper
//!
//! The kernel maps all of physical memory at [`HHDM_BASE`]. Reaching a
//! physical address is then a single addition:
//!
//! ```text
//!  pa ──► HHDM_BASE + pa ──► *mut u8
//! ```
//!
//! Page tables, frame zeroing and COW copies all go through this mapper in
//! the kernel image. Host tests substitute an in-memory arena.

use kernel_info::memory::HHDM_BASE;
use kernel_memory_addresses::PhysicalAddress;
use kernel_vmem::PhysMapper;

/// [`PhysMapper`] for a kernel with a higher-half direct map.
///
/// # Safety
/// The HHDM must cover every physical address handed to it.
#[derive(Debug, Default, Copy, Clone)]
pub struct HhdmPhysMapper;

impl HhdmPhysMapper {
    /// Direct-map address of `pa`.
    #[must_use]
    pub const fn virt(pa: PhysicalAddress) -> u64 {
        HHDM_BASE + pa.as_u64()
    }
}

impl PhysMapper for HhdmPhysMapper {
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8 {
        Self::virt(pa) as *mut u8
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn offsets_by_the_direct_map_base() {
        let pa = PhysicalAddress::new(0x1234_5000);
        assert_eq!(HhdmPhysMapper::virt(pa), HHDM_BASE + 0x1234_5000);
        let ptr = unsafe { HhdmPhysMapper.phys_to_ptr(pa) };
        assert_eq!(ptr as u64, HHDM_BASE + 0x1234_5000);
    }
}
