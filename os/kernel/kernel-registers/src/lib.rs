//! # Typed `X86_64` Paging Registers
//!
//! CR3 with process-context identifiers and the TLB maintenance
//! instructions used when switching address spaces and after page-table
//! edits. Instruction wrappers exist only with the `asm` feature on x86-64;
//! the bit layouts are available everywhere for host tests.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

pub mod cr3;
pub mod tlb;

pub use cr3::Cr3;

pub trait LoadRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// For example, the register access might be privileged and require kernel mode (Ring 0).
    unsafe fn load_unsafe() -> Self;
}

pub trait StoreRegisterUnsafe {
    /// # Safety
    /// The caller must uphold the implementation-specific safety requirements.
    /// Writing a paging register changes the active translation.
    unsafe fn store_unsafe(self);
}
