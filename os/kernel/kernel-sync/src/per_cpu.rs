use alloc::boxed::Box;
use alloc::vec::Vec;
use core::ops::Index;
use kernel_info::CpuId;

/// One `T` per logical CPU, selected by an explicit [`CpuId`].
///
/// There is no implicit "current CPU" here: callers pass the CPU they run on.
/// Slots are cache-line aligned so neighbouring CPUs do not false-share.
pub struct PerCpu<T> {
    slots: Box<[Slot<T>]>,
}

#[repr(C, align(64))]
struct Slot<T>(T);

impl<T> PerCpu<T> {
    /// Build `count` slots, initializing each from its CPU id.
    pub fn new_with(count: usize, mut init: impl FnMut(CpuId) -> T) -> Self {
        let slots: Vec<Slot<T>> = (0..count)
            .map(|i| Slot(init(CpuId::new(i as u32))))
            .collect();
        Self {
            slots: slots.into_boxed_slice(),
        }
    }

    #[inline]
    pub fn get(&self, cpu: CpuId) -> Option<&T> {
        self.slots.get(cpu.as_usize()).map(|s| &s.0)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (CpuId, &T)> {
        self.slots
            .iter()
            .enumerate()
            .map(|(i, s)| (CpuId::new(i as u32), &s.0))
    }
}

impl<T> Index<CpuId> for PerCpu<T> {
    type Output = T;

    fn index(&self, cpu: CpuId) -> &T {
        &self.slots[cpu.as_usize()].0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use core::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn slots_are_indexed_explicitly() {
        let p = PerCpu::new_with(4, |cpu| AtomicUsize::new(cpu.as_usize() * 10));
        p[CpuId::new(2)].fetch_add(1, Ordering::Relaxed);
        assert_eq!(p.get(CpuId::new(2)).unwrap().load(Ordering::Relaxed), 21);
        assert!(p.get(CpuId::new(4)).is_none());
        assert_eq!(p.iter().count(), 4);
    }

    #[test]
    fn slots_do_not_share_cache_lines() {
        assert_eq!(core::mem::align_of::<Slot<u8>>(), 64);
    }
}
