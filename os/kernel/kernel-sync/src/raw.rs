use crate::{RawLock, RawUnlock};
use core::hint::spin_loop;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

/// Unfair test-and-set lock word.
pub struct RawSpin {
    held: AtomicBool,
}

impl Default for RawSpin {
    fn default() -> Self {
        Self::new()
    }
}

impl RawSpin {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            held: AtomicBool::new(false),
        }
    }
}

impl RawLock for RawSpin {
    fn raw_lock(&self) {
        while self.held.swap(true, Ordering::Acquire) {
            while self.held.load(Ordering::Relaxed) {
                spin_loop();
            }
        }
    }

    fn raw_try_lock(&self) -> bool {
        !self.held.swap(true, Ordering::Acquire)
    }

    fn raw_is_locked(&self) -> bool {
        self.held.load(Ordering::Relaxed)
    }
}

impl RawUnlock for RawSpin {
    unsafe fn raw_unlock(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// FIFO ticket lock word.
///
/// Waiters are served in arrival order, which keeps a busy address space
/// from starving one faulting CPU.
pub struct RawTicket {
    next: AtomicUsize,
    owner: AtomicUsize,
}

impl Default for RawTicket {
    fn default() -> Self {
        Self::new()
    }
}

impl RawTicket {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            next: AtomicUsize::new(0),
            owner: AtomicUsize::new(0),
        }
    }

    /// Number of CPUs holding or queued for the lock. Diagnostic only.
    pub fn queue_len(&self) -> usize {
        let next = self.next.load(Ordering::Relaxed);
        next.wrapping_sub(self.owner.load(Ordering::Relaxed))
    }
}

impl RawLock for RawTicket {
    fn raw_lock(&self) {
        let ticket = self.next.fetch_add(1, Ordering::Relaxed);
        while self.owner.load(Ordering::Acquire) != ticket {
            spin_loop();
        }
    }

    fn raw_try_lock(&self) -> bool {
        let owner = self.owner.load(Ordering::Relaxed);
        self.next
            .compare_exchange(
                owner,
                owner.wrapping_add(1),
                Ordering::Acquire,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    fn raw_is_locked(&self) -> bool {
        self.queue_len() != 0
    }
}

impl RawUnlock for RawTicket {
    unsafe fn raw_unlock(&self) {
        // Only the holder writes `owner`, so a plain load + store suffices.
        let t = self.owner.load(Ordering::Relaxed);
        self.owner.store(t.wrapping_add(1), Ordering::Release);
    }
}
