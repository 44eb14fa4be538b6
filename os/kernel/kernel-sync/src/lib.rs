//! # Kernel synchronization primitives
//!
//! Locks used by the memory core, plus the two SMP building blocks it needs:
//! explicitly indexed per-CPU slots and atomic CPU sets for targeted TLB
//! shootdown.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod completion;
mod cpu_set;
mod mutex;
mod per_cpu;
mod raw;
mod spin_lock;

pub use completion::Completion;
pub use cpu_set::{AtomicCpuSet, CpuSet};
pub use mutex::{Mutex, MutexGuard};
pub use per_cpu::PerCpu;
pub use raw::{RawSpin, RawTicket};
pub use spin_lock::{SpinLock, SpinLockGuard};

pub type SpinMutex<T> = Mutex<T, RawSpin>;
pub type TicketMutex<T> = Mutex<T, RawTicket>;

impl<T> SpinMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawSpin::new(), value)
    }
}

impl<T> TicketMutex<T> {
    pub const fn new(value: T) -> Self {
        Self::from_raw(RawTicket::new(), value)
    }
}

pub trait RawLock {
    fn raw_lock(&self);
    fn raw_try_lock(&self) -> bool;
    fn raw_is_locked(&self) -> bool;
}

pub trait RawUnlock {
    /// # Safety
    /// The caller must hold the lock.
    unsafe fn raw_unlock(&self);
}
