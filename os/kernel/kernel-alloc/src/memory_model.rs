//! # Sparse Memory Model
//!
//! Maps a [`Pfn`] to its [`Frame`] descriptor. Physical memory is split into
//! sections of [`FRAMES_PER_SECTION`] frames; a section's descriptor array
//! exists only once a range inside it has been attached.
//!
//! ```text
//!  pfn >> SECTION_FRAME_SHIFT          pfn & (FRAMES_PER_SECTION - 1)
//!        │                                   │
//!  ┌─────▼─────┐                             │
//!  │ section 0 │──► [Frame; 32768]           │
//!  │ section 1 │──► (none)                   │
//!  │ section 2 │──► [Frame; 32768] ◄─────────┘
//!  └───────────┘
//! ```

use crate::frame::Frame;
use alloc::boxed::Box;
use alloc::vec::Vec;
use kernel_info::memory::{FRAMES_PER_SECTION, SECTION_FRAME_SHIFT};
use kernel_memory_addresses::{PhysicalAddress, Pfn};

#[derive(Debug, Default)]
pub struct MemoryModel {
    sections: Vec<Option<Box<[Frame]>>>,
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
const fn split(pfn: Pfn) -> (usize, usize) {
    let raw = pfn.as_u64();
    (
        (raw >> SECTION_FRAME_SHIFT) as usize,
        (raw & (FRAMES_PER_SECTION - 1)) as usize,
    )
}

impl MemoryModel {
    #[must_use]
    pub const fn new() -> Self {
        Self { sections: Vec::new() }
    }

    #[must_use]
    pub fn frame(&self, pfn: Pfn) -> Option<&Frame> {
        let (section, index) = split(pfn);
        self.sections.get(section)?.as_deref()?.get(index)
    }

    pub(crate) fn frame_mut(&mut self, pfn: Pfn) -> Option<&mut Frame> {
        let (section, index) = split(pfn);
        self.sections.get_mut(section)?.as_deref_mut()?.get_mut(index)
    }

    /// Whether a descriptor exists for `pfn`.
    #[must_use]
    pub fn pfn_valid(&self, pfn: Pfn) -> bool {
        self.frame(pfn).is_some()
    }

    #[must_use]
    pub fn phys_to_frame(&self, pa: PhysicalAddress) -> Option<&Frame> {
        self.frame(Pfn::from_phys(pa))
    }

    #[must_use]
    pub const fn frame_to_phys(frame: &Frame) -> PhysicalAddress {
        frame.phys()
    }

    /// Number of sections with descriptors.
    #[must_use]
    pub fn populated_sections(&self) -> usize {
        self.sections.iter().filter(|s| s.is_some()).count()
    }

    /// Create the descriptor arrays covering `[start, end)`.
    pub(crate) fn populate(&mut self, start: Pfn, end: Pfn) {
        if end <= start {
            return;
        }
        let (first, _) = split(start);
        let (last, _) = split(Pfn::new(end.as_u64() - 1));
        if self.sections.len() <= last {
            self.sections.resize_with(last + 1, || None);
        }
        for (section, slot) in self.sections.iter_mut().enumerate().take(last + 1).skip(first) {
            if slot.is_none() {
                let base = (section as u64) << SECTION_FRAME_SHIFT;
                log::debug!("memory model: populating section {section} at {:?}", Pfn::new(base));
                *slot = Some(
                    (0..FRAMES_PER_SECTION)
                        .map(|i| Frame::new(Pfn::new(base + i)))
                        .collect(),
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sections_appear_on_demand() {
        let mut model = MemoryModel::new();
        assert!(!model.pfn_valid(Pfn::new(0)));

        model.populate(Pfn::new(FRAMES_PER_SECTION * 2 + 5), Pfn::new(FRAMES_PER_SECTION * 2 + 9));
        assert_eq!(model.populated_sections(), 1);
        assert!(model.pfn_valid(Pfn::new(FRAMES_PER_SECTION * 2)));
        assert!(!model.pfn_valid(Pfn::new(FRAMES_PER_SECTION)));

        let pa = PhysicalAddress::new((FRAMES_PER_SECTION * 2 + 7) << 12);
        let frame = model.phys_to_frame(pa).unwrap();
        assert_eq!(MemoryModel::frame_to_phys(frame), pa);
    }

    #[test]
    fn ranges_spanning_sections() {
        let mut model = MemoryModel::new();
        model.populate(Pfn::new(FRAMES_PER_SECTION - 1), Pfn::new(FRAMES_PER_SECTION + 1));
        assert_eq!(model.populated_sections(), 2);
    }
}
