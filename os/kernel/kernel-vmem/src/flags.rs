//! Architecture-neutral permission flags and walk controls.

use bitflags::bitflags;

bitflags! {
    /// Permissions and cache policy of a mapping, independent of the paging
    /// format. Each entry encoding casts these down to hardware bits and back.
    ///
    /// A mapping is only installed if at least one of the access bits
    /// ([`READABLE`](Self::READABLE), [`WRITABLE`](Self::WRITABLE),
    /// [`EXECUTABLE`](Self::EXECUTABLE)) is set.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MmuFlags: u32 {
        const READABLE   = 1 << 0;
        const WRITABLE   = 1 << 1;
        const EXECUTABLE = 1 << 2;
        /// Accessible from user mode.
        const USER       = 1 << 3;
        /// Bypass the caches (MMIO).
        const UNCACHED   = 1 << 4;

        const RW  = Self::READABLE.bits() | Self::WRITABLE.bits();
        const RX  = Self::READABLE.bits() | Self::EXECUTABLE.bits();
        const RWX = Self::RW.bits() | Self::EXECUTABLE.bits();
    }
}

impl MmuFlags {
    /// The access bits only.
    pub const ACCESS: Self = Self::RWX;

    #[must_use]
    pub const fn has_access(self) -> bool {
        self.intersects(Self::ACCESS)
    }

    /// Whether changing from `self` to `new` removes any permission or changes
    /// the cache policy, i.e. whether stale TLB entries would be too permissive.
    #[must_use]
    pub const fn narrows_to(self, new: Self) -> bool {
        let removed = self.difference(new);
        removed.intersects(Self::ACCESS.union(Self::USER))
            || self.contains(Self::UNCACHED) != new.contains(Self::UNCACHED)
    }
}

bitflags! {
    /// Behavior of `map` when a translation already exists.
    ///
    /// The empty set is [`SKIP_IF_EXISTING`](Self::SKIP_IF_EXISTING).
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct MapControl: u8 {
        /// Fail with `AlreadyExists` before touching anything.
        const ERROR_IF_EXISTING     = 1 << 0;
        /// Replace the existing translation.
        const OVERWRITE_IF_EXISTING = 1 << 1;
        /// Use 2 MiB / 1 GiB leaves where alignment and length allow.
        const TRY_LARGE_PAGE        = 1 << 2;
    }
}

impl MapControl {
    /// Leave existing translations alone and continue.
    pub const SKIP_IF_EXISTING: Self = Self::empty();
}

bitflags! {
    /// Behavior of `unmap`.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
    pub struct UnmapControl: u8 {
        /// Clear leaves but keep intermediate tables even when they become empty.
        const ONLY_TERMINAL = 1 << 0;
    }
}

impl UnmapControl {
    /// Clear leaves and free emptied intermediate tables.
    pub const WITHOUT_TERMINAL: Self = Self::empty();
}

/// What `harvest_accessed` does with each leaf it visits.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum HarvestControl {
    /// Report the accessed bit, change nothing.
    Observe,
    /// Clear the accessed bit of leaves that have it set.
    ResetAccessed,
    /// Unmap leaves whose accessed bit is clear and reset the others.
    UnmapUnaccessed,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn narrowing_detection() {
        assert!(MmuFlags::RW.narrows_to(MmuFlags::READABLE));
        assert!(!MmuFlags::READABLE.narrows_to(MmuFlags::RW));
        assert!(MmuFlags::READABLE.narrows_to(MmuFlags::READABLE | MmuFlags::UNCACHED));
        assert!((MmuFlags::RW | MmuFlags::USER).narrows_to(MmuFlags::RW));
    }
}
