//! # Fatal Invariant Checks
//!
//! A broken free-list link, a mismatched canary or a double free means the
//! allocator's own bookkeeping is corrupt. Such checks stay enabled in every
//! build and end in [`fatal`], which logs the report and hands it to the
//! installed hook. The default hook panics; a kernel image installs one that
//! halts all CPUs, and tests may install their own.
//!
//! ```rust,should_panic
//! use kernel_info::invariant;
//!
//! let free_count = 3;
//! invariant!(free_count == 0, "zone still has {free_count} free blocks");
//! ```

use core::fmt;
use core::panic::Location;
use core::sync::atomic::{AtomicPtr, Ordering};

/// Diagnostic context passed to the fatal hook.
pub struct FatalReport<'a> {
    pub location: &'static Location<'static>,
    pub message: fmt::Arguments<'a>,
}

impl fmt::Display for FatalReport<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invariant violated at {}: {}", self.location, self.message)
    }
}

/// Signature of a fatal hook. It must not return.
pub type FatalHook = fn(&FatalReport<'_>) -> !;

/// Null means [`default_hook`].
static HOOK: AtomicPtr<()> = AtomicPtr::new(core::ptr::null_mut());

fn default_hook(report: &FatalReport<'_>) -> ! {
    panic!("{report}")
}

/// Install `hook` and return the previously installed one.
pub fn set_fatal_hook(hook: FatalHook) -> FatalHook {
    let prev = HOOK.swap(hook as *mut (), Ordering::AcqRel);
    decode(prev)
}

/// Restore the default (panicking) hook.
pub fn reset_fatal_hook() {
    HOOK.store(core::ptr::null_mut(), Ordering::Release);
}

#[allow(unsafe_code)]
fn decode(raw: *mut ()) -> FatalHook {
    if raw.is_null() {
        default_hook
    } else {
        // SAFETY: only `set_fatal_hook` stores non-null values, and it stores `FatalHook`s.
        unsafe { core::mem::transmute::<*mut (), FatalHook>(raw) }
    }
}

/// Report a broken invariant. Never returns.
#[track_caller]
#[cold]
pub fn fatal(message: fmt::Arguments<'_>) -> ! {
    let report = FatalReport {
        location: Location::caller(),
        message,
    };
    log::error!("{report}");
    decode(HOOK.load(Ordering::Acquire))(&report)
}

/// Always-on invariant check.
///
/// Unlike `debug_assert!`, the condition is evaluated in release builds too.
#[macro_export]
macro_rules! invariant {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            $crate::fatal::fatal(::core::format_args!($($arg)+))
        }
    };
}

/// Build a canary magic from four ASCII bytes.
#[must_use]
pub const fn fourcc(tag: &[u8; 4]) -> u32 {
    u32::from_be_bytes(*tag)
}

/// Magic value embedded in long-lived objects and checked on every entry.
#[derive(Debug)]
pub struct Canary<const MAGIC: u32> {
    value: u32,
}

impl<const MAGIC: u32> Canary<MAGIC> {
    #[must_use]
    pub const fn new() -> Self {
        Self { value: MAGIC }
    }

    #[must_use]
    pub const fn is_valid(&self) -> bool {
        self.value == MAGIC
    }

    /// Abort through the fatal hook if the canary was overwritten.
    #[track_caller]
    pub fn verify(&self) {
        if self.value != MAGIC {
            fatal(format_args!(
                "canary mismatch: expected {MAGIC:#010x}, found {:#010x}",
                self.value
            ));
        }
    }

    /// Invalidate on teardown so stale references are caught.
    pub const fn poison(&mut self) {
        self.value = !MAGIC;
    }
}

impl<const MAGIC: u32> Default for Canary<MAGIC> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::panic;

    const MAGIC: u32 = fourcc(b"TEST");

    fn marking_hook(report: &FatalReport<'_>) -> ! {
        panic!("hooked: {}", report.message)
    }

    #[test]
    fn canary_detects_poison() {
        let mut c = Canary::<MAGIC>::new();
        c.verify();
        c.poison();
        assert!(!c.is_valid());
        let res = panic::catch_unwind(|| c.verify());
        assert!(res.is_err());
    }

    #[test]
    fn installed_hook_receives_the_report() {
        let prev = set_fatal_hook(marking_hook);
        let res = panic::catch_unwind(|| {
            invariant!(1 + 1 == 3, "arithmetic is broken: {}", 42);
        });
        set_fatal_hook(prev);

        let payload = res.unwrap_err();
        let msg = payload
            .downcast_ref::<String>()
            .cloned()
            .unwrap_or_default();
        assert!(msg.contains("arithmetic is broken: 42"), "{msg}");
    }

    #[test]
    fn passing_invariant_is_silent() {
        invariant!(true, "never printed");
    }
}
