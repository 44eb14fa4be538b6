//! Allocation-domain flags.

use bitflags::bitflags;

bitflags! {
    /// How and where a frame may be allocated.
    ///
    /// The zone hint (`DMA`, `DMA32`) caps the highest zone tried; without
    /// one every zone of a node is eligible, highest first.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct Gaf: u32 {
        /// Only the DMA zone (below 16 MiB).
        const DMA = 1 << 0;
        /// Zones below 4 GiB.
        const DMA32 = 1 << 1;
        /// May dip below the critical watermark.
        const REQUIRED = 1 << 2;
        /// Never fall back to another node.
        const ONLY_THIS_NODE = 1 << 3;
        /// Retry until it succeeds. Rejected: there is no reclaim to retry against.
        const NEVER_FAIL = 1 << 4;
        /// The consumer zeroes the frame through the physical mapper.
        const ZERO = 1 << 5;
        const RECLAIM = 1 << 6;
        const DIRECTLY_RECLAIM = 1 << 7;

        const BOOT = Self::ONLY_THIS_NODE.bits() | Self::REQUIRED.bits();
        const KERNEL = Self::RECLAIM.bits();
        const USER = Self::RECLAIM.bits() | Self::ZERO.bits();
    }
}

impl Gaf {
    /// Whether the critical watermark may be crossed.
    #[must_use]
    pub const fn is_required(self) -> bool {
        self.contains(Self::REQUIRED)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        assert!(Gaf::BOOT.contains(Gaf::ONLY_THIS_NODE));
        assert!(Gaf::BOOT.is_required());
        assert!(!Gaf::KERNEL.is_required());
        assert!(Gaf::USER.contains(Gaf::ZERO));
    }
}
