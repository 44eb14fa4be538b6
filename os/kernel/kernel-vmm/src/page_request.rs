//! # Page Requests
//!
//! A paged object created with a [`PageProvider`] asks it for every absent
//! page. A provider that can answer at once returns
//! [`ProviderReply::Ready`]; one that must fetch the data returns
//! [`ProviderReply::Pending`] and finishes later:
//!
//! ```text
//!  fault ──► require_owned_page ──► provider.request ──► Pending
//!    │                                                     │
//!    ◄── ShouldWait + Arc<PageRequest> ◄───────────────────┘
//!    │
//!  request.wait(spins)          provider: supply_page(index, pfn)
//!    │                                    request.complete()
//!    ▼
//!  retry: the page is resident
//! ```
//!
//! The object lock is never held while waiting.

use alloc::sync::Arc;
use kernel_info::Result;
use kernel_memory_addresses::Pfn;
use kernel_sync::Completion;

/// An outstanding request for one page of one object.
#[derive(Debug)]
pub struct PageRequest {
    object_id: u64,
    index: u64,
    done: Completion,
}

impl PageRequest {
    pub(crate) const fn new(object_id: u64, index: u64) -> Self {
        Self {
            object_id,
            index,
            done: Completion::new(),
        }
    }

    #[must_use]
    pub const fn object_id(&self) -> u64 {
        self.object_id
    }

    /// Page index within the object.
    #[must_use]
    pub const fn index(&self) -> u64 {
        self.index
    }

    /// Wake every waiter. Returns `false` if already finished.
    pub fn complete(&self) -> bool {
        self.done.complete(self.index)
    }

    /// Abandon the request; waiters see `BadState` and the next fault asks
    /// again.
    pub fn cancel(&self) -> bool {
        self.done.cancel()
    }

    #[must_use]
    pub fn is_pending(&self) -> bool {
        self.done.is_pending()
    }

    /// Spin for at most `spins` polls.
    ///
    /// # Errors
    /// - [`Status::TimeOut`](kernel_info::Status::TimeOut) if still pending.
    /// - [`Status::BadState`](kernel_info::Status::BadState) if cancelled.
    pub fn wait(&self, spins: usize) -> Result<()> {
        self.done.wait(spins).map(|_| ())
    }
}

/// Answer of a [`PageProvider`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum ProviderReply {
    /// The page is available now. The provider hands over one reference.
    Ready(Pfn),
    /// The provider will call `supply_page` and then
    /// [`PageRequest::complete`].
    Pending,
}

/// External source of page contents, such as a file or a user pager.
///
/// `request` runs with the object lock held and must not block.
pub trait PageProvider: Send + Sync {
    fn request(&self, object_id: u64, index: u64, request: &Arc<PageRequest>) -> ProviderReply;
}

#[cfg(test)]
mod tests {
    use super::*;
    use kernel_info::Status;

    #[test]
    fn wait_reports_each_outcome() {
        let req = PageRequest::new(3, 9);
        assert_eq!(req.wait(4), Err(Status::TimeOut));
        assert!(req.complete());
        assert_eq!(req.wait(0), Ok(()));
        assert!(!req.cancel());

        let dropped = PageRequest::new(3, 10);
        assert!(dropped.cancel());
        assert!(!dropped.is_pending());
        assert_eq!(dropped.wait(4), Err(Status::BadState));
    }
}
