use core::sync::atomic::{AtomicU64, Ordering};

/// Number of entries in every table of the supported paging formats.
pub const ENTRIES: usize = 512;

/// One 4 KiB page-table frame as seen through the physical mapper.
///
/// Entries are atomics: the CPU sets accessed/dirty bits concurrently with
/// software, and other CPUs may walk the table while it is being edited.
#[repr(C, align(4096))]
pub struct RawTable {
    entries: [AtomicU64; ENTRIES],
}

const _: () = assert!(size_of::<RawTable>() == 4096);

impl RawTable {
    #[inline]
    pub fn load(&self, index: usize) -> u64 {
        self.entries[index].load(Ordering::Acquire)
    }

    #[inline]
    pub fn store(&self, index: usize, bits: u64) {
        self.entries[index].store(bits, Ordering::Release);
    }

    /// Atomically clear `mask` and return the previous value.
    #[inline]
    pub fn clear_bits(&self, index: usize, mask: u64) -> u64 {
        self.entries[index].fetch_and(!mask, Ordering::AcqRel)
    }

    /// Replace `current` with `new`; fails if the entry changed meanwhile.
    #[inline]
    pub fn compare_exchange(&self, index: usize, current: u64, new: u64) -> bool {
        self.entries[index]
            .compare_exchange(current, new, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Whether every entry is zero.
    pub fn is_empty(&self) -> bool {
        self.entries.iter().all(|e| e.load(Ordering::Relaxed) == 0)
    }

    pub fn zero(&self) {
        for e in &self.entries {
            e.store(0, Ordering::Relaxed);
        }
    }
}
