//! # Memory Layout

pub use kernel_memory_addresses::{PAGE_SHIFT, PAGE_SIZE};

/// First user-mappable address; page 0 stays unmapped to catch null derefs.
pub const USER_ASPACE_BASE: u64 = 0x0000_0000_0000_1000;

/// End (exclusive) of the lower canonical half.
pub const USER_ASPACE_END: u64 = 0x0000_8000_0000_0000;

/// Start of the higher canonical half, owned by the kernel address space.
pub const KERNEL_ASPACE_BASE: u64 = 0xffff_8000_0000_0000;

/// End (exclusive) of the kernel address space. The topmost page is left out
/// so the range end stays representable.
pub const KERNEL_ASPACE_END: u64 = 0xffff_ffff_ffff_f000;

/// A simple Higher Half Direct Map (HHDM) base.
/// Anything mapped at [`HHDM_BASE`] + `pa` lets the kernel
/// access physical memory via a fixed offset.
pub const HHDM_BASE: u64 = 0xffff_8880_0000_0000;

/// Where the kernel executes (VMA).
pub const KERNEL_BASE: u64 = 0xffff_ffff_8000_0000;

/// Root-table slot where the kernel half begins (PML4 index 256).
pub const KERNEL_ROOT_FIRST_SLOT: usize = 256;

/// Highest buddy order. An order-`k` block spans `2^k` frames (4 MiB at 10).
pub const MAX_FRAME_ORDER: u32 = 10;

/// Number of free lists per zone.
pub const NR_FRAME_ORDERS: usize = MAX_FRAME_ORDER as usize + 1;

/// Frames per memory-model section, as a shift (2^15 frames = 128 MiB).
pub const SECTION_FRAME_SHIFT: u32 = 15;

/// Number of frames covered by one memory-model section.
pub const FRAMES_PER_SECTION: u64 = 1 << SECTION_FRAME_SHIFT;

/// Upper bound (exclusive) of the DMA zone.
pub const DMA_ZONE_LIMIT: u64 = 16 * 1024 * 1024;

/// Upper bound (exclusive) of the DMA32 zone.
pub const DMA32_ZONE_LIMIT: u64 = 4 * 1024 * 1024 * 1024;

/// Maximum number of NUMA nodes.
pub const MAX_NODES: usize = 8;

/// Maximum number of logical CPUs.
pub const MAX_CPUS: usize = 64;

/// Frames a per-CPU cache holds before it drains a batch back to its zone.
pub const PCP_HIGH: usize = 64;

/// Frames moved per refill or drain of a per-CPU cache.
pub const PCP_BATCH: usize = 16;

/// Page addresses queued before a pending invalidation degrades into a full flush.
pub const TLB_BATCH: usize = 32;

/// Largest x86 process-context identifier. PCID 0 belongs to the kernel.
pub const MAX_PCID: u16 = 4095;

const _: () = {
    assert!(USER_ASPACE_BASE < USER_ASPACE_END);
    assert!(KERNEL_ASPACE_BASE < HHDM_BASE);
    assert!(HHDM_BASE < KERNEL_BASE);
    assert!(KERNEL_BASE < KERNEL_ASPACE_END);
    assert!(PCP_BATCH <= PCP_HIGH);
    assert!(MAX_CPUS <= 64);
    assert!(DMA_ZONE_LIMIT.is_power_of_two());
    assert!(FRAMES_PER_SECTION >= 1 << MAX_FRAME_ORDER);
};
