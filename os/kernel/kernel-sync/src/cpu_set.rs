use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};
use kernel_info::CpuId;
use kernel_info::memory::MAX_CPUS;

/// A snapshot set of logical CPUs.
#[derive(Copy, Clone, Default, Eq, PartialEq)]
pub struct CpuSet(u64);

impl CpuSet {
    #[must_use]
    pub const fn empty() -> Self {
        Self(0)
    }

    #[must_use]
    pub const fn only(cpu: CpuId) -> Self {
        Self(1 << cpu.as_usize())
    }

    #[must_use]
    pub const fn from_bits(bits: u64) -> Self {
        Self(bits)
    }

    #[must_use]
    pub const fn bits(self) -> u64 {
        self.0
    }

    #[must_use]
    pub const fn contains(self, cpu: CpuId) -> bool {
        self.0 & (1 << cpu.as_usize()) != 0
    }

    #[must_use]
    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    #[must_use]
    pub const fn len(self) -> u32 {
        self.0.count_ones()
    }

    #[must_use]
    pub const fn without(self, cpu: CpuId) -> Self {
        Self(self.0 & !(1 << cpu.as_usize()))
    }

    /// Whether the set is empty or holds only `cpu`.
    #[must_use]
    pub const fn is_subset_of_only(self, cpu: CpuId) -> bool {
        self.without(cpu).is_empty()
    }

    #[must_use]
    pub const fn union(self, other: Self) -> Self {
        Self(self.0 | other.0)
    }

    #[must_use]
    pub const fn difference(self, other: Self) -> Self {
        Self(self.0 & !other.0)
    }

    pub fn iter(self) -> impl Iterator<Item = CpuId> {
        (0..MAX_CPUS)
            .filter(move |i| self.0 & (1 << i) != 0)
            .map(|i| CpuId::new(i as u32))
    }
}

impl fmt::Debug for CpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.iter()).finish()
    }
}

/// A CPU set updated concurrently, e.g. the CPUs that currently have an
/// address space loaded.
#[derive(Default)]
pub struct AtomicCpuSet(AtomicU64);

impl AtomicCpuSet {
    #[must_use]
    pub const fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Add `cpu`; returns whether it was already present.
    pub fn insert(&self, cpu: CpuId) -> bool {
        debug_assert!(cpu.as_usize() < MAX_CPUS);
        let bit = 1 << cpu.as_usize();
        self.0.fetch_or(bit, Ordering::AcqRel) & bit != 0
    }

    /// Remove `cpu`; returns whether it was present.
    pub fn remove(&self, cpu: CpuId) -> bool {
        let bit = 1 << cpu.as_usize();
        self.0.fetch_and(!bit, Ordering::AcqRel) & bit != 0
    }

    /// Add every CPU of `set`.
    pub fn insert_all(&self, set: CpuSet) {
        self.0.fetch_or(set.0, Ordering::AcqRel);
    }

    /// Remove every CPU of `set`.
    pub fn remove_all(&self, set: CpuSet) {
        self.0.fetch_and(!set.0, Ordering::AcqRel);
    }

    pub fn contains(&self, cpu: CpuId) -> bool {
        self.snapshot().contains(cpu)
    }

    pub fn snapshot(&self) -> CpuSet {
        CpuSet(self.0.load(Ordering::Acquire))
    }
}

impl fmt::Debug for AtomicCpuSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&self.snapshot(), f)
    }
}
