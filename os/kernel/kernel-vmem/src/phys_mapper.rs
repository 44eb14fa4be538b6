//! Access to physical memory from kernel code.

use crate::table::RawTable;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress};

/// Mapping strategy for physical memory. Page tables and frame contents
/// live at physical addresses; code can only dereference virtual ones.
///
/// The kernel uses a higher-half direct map; host tests use an in-memory
/// arena (see `testing`).
pub trait PhysMapper: Send + Sync {
    /// Pointer through which the byte at `pa` can be read and written.
    ///
    /// # Safety
    /// `pa` must lie in memory covered by this mapper. The caller is
    /// responsible for aliasing discipline on the returned pointer.
    unsafe fn phys_to_ptr(&self, pa: PhysicalAddress) -> *mut u8;
}

/// Typed helpers on top of [`PhysMapper`].
pub trait PhysMapperExt: PhysMapper {
    /// View the 4 KiB frame at `pa` as a page table.
    ///
    /// # Safety
    /// `pa` must be a 4 KiB-aligned page-table frame owned by the caller's
    /// page table.
    #[inline]
    unsafe fn table<'a>(&self, pa: PhysicalAddress) -> &'a RawTable {
        debug_assert!(pa.as_u64() % PAGE_SIZE == 0);
        unsafe { &*self.phys_to_ptr(pa).cast::<RawTable>() }
    }

    /// Fill the frame at `pa` with zeroes.
    ///
    /// # Safety
    /// The caller must own the frame.
    #[inline]
    unsafe fn zero_frame(&self, pa: PhysicalAddress) {
        unsafe { core::ptr::write_bytes(self.phys_to_ptr(pa), 0, PAGE_SIZE as usize) }
    }

    /// Copy one frame's contents into another.
    ///
    /// # Safety
    /// The caller must own `dst` and keep `src` alive for the duration.
    #[inline]
    unsafe fn copy_frame(&self, dst: PhysicalAddress, src: PhysicalAddress) {
        unsafe {
            core::ptr::copy_nonoverlapping(
                self.phys_to_ptr(src),
                self.phys_to_ptr(dst),
                PAGE_SIZE as usize,
            );
        }
    }

    /// Read bytes starting at `pa`; must not cross a frame boundary.
    ///
    /// # Safety
    /// The frame must be live.
    unsafe fn read_bytes(&self, pa: PhysicalAddress, out: &mut [u8]) {
        debug_assert!(
            pa.offset::<kernel_memory_addresses::Size4K>() + out.len() as u64 <= PAGE_SIZE
        );
        unsafe {
            core::ptr::copy_nonoverlapping(self.phys_to_ptr(pa), out.as_mut_ptr(), out.len());
        }
    }

    /// Write bytes starting at `pa`; must not cross a frame boundary.
    ///
    /// # Safety
    /// The caller must own the frame.
    unsafe fn write_bytes(&self, pa: PhysicalAddress, data: &[u8]) {
        debug_assert!(
            pa.offset::<kernel_memory_addresses::Size4K>() + data.len() as u64 <= PAGE_SIZE
        );
        unsafe {
            core::ptr::copy_nonoverlapping(data.as_ptr(), self.phys_to_ptr(pa), data.len());
        }
    }
}

impl<T: PhysMapper + ?Sized> PhysMapperExt for T {}
