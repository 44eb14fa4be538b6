use core::hint::spin_loop;
use core::sync::atomic::{AtomicU8, AtomicU64, Ordering};
use kernel_info::Status;

const PENDING: u8 = 0;
const COMPLETE: u8 = 1;
const CANCELLED: u8 = 2;

/// One-shot completion carrying a `u64` payload.
///
/// The first `complete` or `cancel` wins; later calls are ignored. Waiting
/// is a bounded spin here. A scheduler-backed wait parks the thread instead
/// and only polls [`Completion::try_wait`] on wake-up.
#[derive(Debug, Default)]
pub struct Completion {
    state: AtomicU8,
    value: AtomicU64,
}

impl Completion {
    #[must_use]
    pub const fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            value: AtomicU64::new(0),
        }
    }

    fn finish(&self, state: u8, value: u64) -> bool {
        // Claim the transition first so a concurrent cancel cannot interleave
        // with the payload store.
        if self
            .state
            .compare_exchange(PENDING, PENDING | 0x80, Ordering::Acquire, Ordering::Relaxed)
            .is_err()
        {
            return false;
        }
        self.value.store(value, Ordering::Relaxed);
        self.state.store(state, Ordering::Release);
        true
    }

    /// Signal success. Returns `false` if already finished.
    pub fn complete(&self, value: u64) -> bool {
        self.finish(COMPLETE, value)
    }

    /// Signal abandonment. Returns `false` if already finished.
    pub fn cancel(&self) -> bool {
        self.finish(CANCELLED, 0)
    }

    pub fn is_pending(&self) -> bool {
        !matches!(self.state.load(Ordering::Acquire), COMPLETE | CANCELLED)
    }

    /// Non-blocking poll.
    ///
    /// # Errors
    /// * [`Status::ShouldWait`] while pending.
    /// * [`Status::BadState`] if cancelled.
    pub fn try_wait(&self) -> Result<u64, Status> {
        match self.state.load(Ordering::Acquire) {
            COMPLETE => Ok(self.value.load(Ordering::Relaxed)),
            CANCELLED => Err(Status::BadState),
            _ => Err(Status::ShouldWait),
        }
    }

    /// Spin for at most `budget` polls.
    ///
    /// # Errors
    /// * [`Status::TimeOut`] if still pending after `budget` polls.
    /// * [`Status::BadState`] if cancelled.
    pub fn wait(&self, budget: usize) -> Result<u64, Status> {
        for _ in 0..budget {
            match self.try_wait() {
                Err(Status::ShouldWait) => spin_loop(),
                done => return done,
            }
        }
        match self.try_wait() {
            Err(Status::ShouldWait) => Err(Status::TimeOut),
            done => done,
        }
    }
}
