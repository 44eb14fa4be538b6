//! TLB maintenance instructions.

#[cfg(all(feature = "asm", target_arch = "x86_64"))]
use kernel_memory_addresses::VirtualAddress;

/// Invalidate the translation for one page in the current PCID.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub unsafe fn invlpg(va: VirtualAddress) {
    unsafe {
        core::arch::asm!("invlpg [{}]", in(reg) va.as_u64(), options(nostack, preserves_flags));
    }
}

/// Flush all non-global translations of the current PCID by reloading CR3.
///
/// # Safety
/// Ring 0 only.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub unsafe fn flush_current() {
    use crate::{Cr3, LoadRegisterUnsafe, StoreRegisterUnsafe};
    unsafe {
        let cr3 = Cr3::load_unsafe().with_preserve_tlb(false);
        cr3.store_unsafe();
    }
}

/// Invalidate every translation of every PCID, global ones included
/// (INVPCID type 2).
///
/// # Safety
/// Ring 0 only; requires CPUID.(EAX=07H,ECX=0):EBX.INVPCID.
#[cfg(all(feature = "asm", target_arch = "x86_64"))]
#[inline]
pub unsafe fn invpcid_all_contexts() {
    let descriptor = [0u64; 2];
    unsafe {
        core::arch::asm!(
            "invpcid {}, [{}]",
            in(reg) 2u64,
            in(reg) descriptor.as_ptr(),
            options(nostack, preserves_flags)
        );
    }
}
