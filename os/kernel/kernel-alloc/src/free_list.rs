use crate::frame::{Frame, NO_LINK};
use crate::memory_model::MemoryModel;
use kernel_info::fatal::fatal;
use kernel_info::invariant;
use kernel_memory_addresses::Pfn;

/// Intrusive doubly linked list of free block heads.
///
/// The links live in the frame descriptors and hold PFNs, not pointers:
///
/// ```text
///  head ──► [pfn 0x200] ⇄ [pfn 0x040] ⇄ [pfn 0x880] ──► NO_LINK
/// ```
///
/// # Invariants
/// - Only touched under the owning zone's lock.
/// - A frame is on at most one list at a time.
#[derive(Debug)]
pub(crate) struct FreeList {
    head: u64,
    len: u64,
}

impl Default for FreeList {
    fn default() -> Self {
        Self::new()
    }
}

#[track_caller]
fn linked(model: &MemoryModel, pfn: u64) -> &Frame {
    match model.frame(Pfn::new(pfn)) {
        Some(frame) => frame,
        None => fatal(format_args!("free list links to {pfn:#x} without a descriptor")),
    }
}

impl FreeList {
    pub(crate) const fn new() -> Self {
        Self { head: NO_LINK, len: 0 }
    }

    pub(crate) const fn len(&self) -> u64 {
        self.len
    }

    pub(crate) const fn is_empty(&self) -> bool {
        self.head == NO_LINK
    }

    pub(crate) fn push(&mut self, model: &MemoryModel, frame: &Frame) {
        let pfn = frame.pfn().as_u64();
        if self.head != NO_LINK {
            linked(model, self.head).set_prev(pfn);
        }
        frame.set_next(self.head);
        frame.set_prev(NO_LINK);
        self.head = pfn;
        self.len += 1;
    }

    pub(crate) fn pop<'m>(&mut self, model: &'m MemoryModel) -> Option<&'m Frame> {
        if self.head == NO_LINK {
            return None;
        }
        let frame = linked(model, self.head);
        self.remove(model, frame);
        Some(frame)
    }

    pub(crate) fn remove(&mut self, model: &MemoryModel, frame: &Frame) {
        let pfn = frame.pfn().as_u64();
        let (prev, next) = (frame.prev(), frame.next());
        if prev == NO_LINK {
            invariant!(self.head == pfn, "broken free-list head at {pfn:#x}");
            self.head = next;
        } else {
            let p = linked(model, prev);
            invariant!(p.next() == pfn, "broken free-list link {prev:#x} -> {pfn:#x}");
            p.set_next(next);
        }
        if next != NO_LINK {
            linked(model, next).set_prev(prev);
        }
        frame.set_next(NO_LINK);
        frame.set_prev(NO_LINK);
        invariant!(self.len != 0, "free-list length underflow");
        self.len -= 1;
    }

    /// Heads on the list, most recently freed first.
    pub(crate) fn iter<'m>(&self, model: &'m MemoryModel) -> impl Iterator<Item = Pfn> + 'm {
        let mut cursor = self.head;
        core::iter::from_fn(move || {
            if cursor == NO_LINK {
                return None;
            }
            let pfn = Pfn::new(cursor);
            cursor = linked(model, cursor).next();
            Some(pfn)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec::Vec;

    fn model() -> MemoryModel {
        let mut m = MemoryModel::new();
        m.populate(Pfn::new(0), Pfn::new(16));
        m
    }

    #[test]
    fn push_pop_is_lifo() {
        let m = model();
        let mut list = FreeList::new();
        for pfn in [1, 4, 9] {
            list.push(&m, m.frame(Pfn::new(pfn)).unwrap());
        }
        assert_eq!(list.len(), 3);
        assert_eq!(list.iter(&m).collect::<Vec<_>>(), [Pfn::new(9), Pfn::new(4), Pfn::new(1)]);
        assert_eq!(list.pop(&m).unwrap().pfn(), Pfn::new(9));
        assert_eq!(list.len(), 2);
    }

    #[test]
    fn remove_from_the_middle() {
        let m = model();
        let mut list = FreeList::new();
        for pfn in [2, 3, 5] {
            list.push(&m, m.frame(Pfn::new(pfn)).unwrap());
        }
        list.remove(&m, m.frame(Pfn::new(3)).unwrap());
        assert_eq!(list.iter(&m).collect::<Vec<_>>(), [Pfn::new(5), Pfn::new(2)]);
        list.remove(&m, m.frame(Pfn::new(5)).unwrap());
        list.remove(&m, m.frame(Pfn::new(2)).unwrap());
        assert!(list.is_empty());
        assert_eq!(list.len(), 0);
    }
}
