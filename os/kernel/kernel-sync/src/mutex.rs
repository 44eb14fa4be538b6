use crate::{RawLock, RawUnlock};
use core::cell::UnsafeCell;
use core::fmt;
use core::ops::{Deref, DerefMut};

/// A mutex over a pluggable raw lock word `R`.
///
/// [`SpinMutex`](crate::SpinMutex) and [`TicketMutex`](crate::TicketMutex)
/// are the two instantiations used in the kernel.
pub struct Mutex<T, R> {
    raw: R,
    cell: UnsafeCell<T>,
}

unsafe impl<T: Send, R: Sync> Sync for Mutex<T, R> {}
unsafe impl<T: Send, R: Send> Send for Mutex<T, R> {}

impl<T, R> Mutex<T, R> {
    pub const fn from_raw(raw: R, value: T) -> Self {
        Self {
            raw,
            cell: UnsafeCell::new(value),
        }
    }

    #[inline]
    pub const fn get_mut(&mut self) -> &mut T {
        self.cell.get_mut()
    }

    pub fn into_inner(self) -> T {
        self.cell.into_inner()
    }
}

impl<T, R> Mutex<T, R>
where
    R: RawLock + RawUnlock,
{
    #[inline]
    pub fn lock(&self) -> MutexGuard<'_, T, R> {
        self.raw.raw_lock();
        MutexGuard { m: self }
    }

    #[inline]
    pub fn try_lock(&self) -> Option<MutexGuard<'_, T, R>> {
        if self.raw.raw_try_lock() {
            Some(MutexGuard { m: self })
        } else {
            None
        }
    }

    #[inline]
    pub fn with_lock<U>(&self, f: impl FnOnce(&mut T) -> U) -> U {
        let mut g = self.lock();
        f(&mut g)
    }

    /// Racy snapshot for assertions.
    #[inline]
    pub fn is_locked(&self) -> bool {
        self.raw.raw_is_locked()
    }
}

impl<T, R: RawLock> fmt::Debug for Mutex<T, R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Mutex")
            .field("locked", &self.raw.raw_is_locked())
            .finish_non_exhaustive()
    }
}

pub struct MutexGuard<'a, T, R>
where
    R: RawLock + RawUnlock,
{
    m: &'a Mutex<T, R>,
}

impl<T, R> MutexGuard<'_, T, R>
where
    R: RawLock + RawUnlock,
{
    /// Release the mutex while `f` runs and re-acquire it afterwards.
    pub fn unlocked<U>(this: &mut Self, f: impl FnOnce() -> U) -> U {
        unsafe { this.m.raw.raw_unlock() };
        let result = f();
        this.m.raw.raw_lock();
        result
    }
}

impl<T, R> Deref for MutexGuard<'_, T, R>
where
    R: RawLock + RawUnlock,
{
    type Target = T;

    fn deref(&self) -> &T {
        unsafe { &*self.m.cell.get() }
    }
}

impl<T, R> DerefMut for MutexGuard<'_, T, R>
where
    R: RawLock + RawUnlock,
{
    fn deref_mut(&mut self) -> &mut T {
        unsafe { &mut *self.m.cell.get() }
    }
}

impl<T, R> Drop for MutexGuard<'_, T, R>
where
    R: RawLock + RawUnlock,
{
    fn drop(&mut self) {
        unsafe { self.m.raw.raw_unlock() }
    }
}
