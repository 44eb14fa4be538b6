//! # Boot Memory Map
//!
//! The platform layer (firmware memory map, ACPI SRAT) is responsible for
//! producing these records. The memory core treats the map as an opaque,
//! ordered sequence and never parses firmware formats itself.

use crate::NodeId;
use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// What a physical region may be used for.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum BootMemoryKind {
    /// Free RAM, handed to the frame allocator.
    Usable,
    /// Firmware or loader owned; present but never allocated.
    Reserved,
    /// Holds the kernel image or boot-time data structures.
    Kernel,
    /// ACPI tables; reclaimable after the platform layer is done with them.
    AcpiReclaimable,
    /// ACPI non-volatile storage.
    AcpiNvs,
    /// Device memory. Mapped through physical memory objects, never allocated.
    Mmio,
    /// Faulty RAM.
    Bad,
}

impl BootMemoryKind {
    /// Whether frames of this kind are accounted as present RAM.
    #[must_use]
    pub const fn is_ram(self) -> bool {
        matches!(
            self,
            Self::Usable | Self::Reserved | Self::Kernel | Self::AcpiReclaimable | Self::AcpiNvs
        )
    }
}

/// One physical region of the boot memory map.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct BootMemoryRegion {
    pub base: PhysicalAddress,
    pub size: u64,
    pub kind: BootMemoryKind,
    /// NUMA domain the region belongs to; node 0 on non-NUMA machines.
    pub node: NodeId,
}

impl BootMemoryRegion {
    #[must_use]
    pub const fn new(base: u64, size: u64, kind: BootMemoryKind, node: NodeId) -> Self {
        Self {
            base: PhysicalAddress::new(base),
            size,
            kind,
            node,
        }
    }

    /// Shorthand for a usable region on node 0.
    #[must_use]
    pub const fn usable(base: u64, size: u64) -> Self {
        Self::new(base, size, BootMemoryKind::Usable, NodeId::new(0))
    }

    #[must_use]
    pub const fn range(&self) -> PhysicalRange {
        PhysicalRange::new(self.base, self.size)
    }

    /// The region shrunk inwards to whole 4 KiB frames, or `None` if no full
    /// frame remains.
    #[must_use]
    pub fn frame_aligned(&self) -> Option<PhysicalRange> {
        let start = self.base.align_up::<kernel_memory_addresses::Size4K>()?;
        let end = PhysicalAddress::new(self.range().end())
            .align_down::<kernel_memory_addresses::Size4K>();
        (end > start).then(|| PhysicalRange::new(start, end - start))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_aligned_trims_partial_frames() {
        let r = BootMemoryRegion::usable(0x1800, 0x3000);
        let a = r.frame_aligned().unwrap();
        assert_eq!(a.base.as_u64(), 0x2000);
        assert_eq!(a.size, 0x2000);

        assert!(BootMemoryRegion::usable(0x1800, 0x900).frame_aligned().is_none());
    }
}
