use kernel_memory_addresses::PhysicalAddress;

/// Where page-table frames come from and who hears about leaf changes.
///
/// The walker zeroes a table frame itself after [`alloc_table`] returns it,
/// and only hands frames back through [`free_table`] once no CPU can still
/// walk them.
///
/// [`alloc_table`]: PageSource::alloc_table
/// [`free_table`]: PageSource::free_table
pub trait PageSource: Sync {
    /// One 4 KiB frame for a new table, or `None` when memory is exhausted.
    fn alloc_table(&self) -> Option<PhysicalAddress>;

    fn free_table(&self, pa: PhysicalAddress);

    /// A leaf now maps `frames` frames starting at `pa`.
    fn leaf_mapped(&self, _pa: PhysicalAddress, _frames: u64) {}

    /// A leaf mapping `frames` frames starting at `pa` was removed.
    fn leaf_unmapped(&self, _pa: PhysicalAddress, _frames: u64) {}
}
