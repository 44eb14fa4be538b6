//! # Region Tree
//!
//! Each address space keeps its regions in a [`RegionSet`] ordered by base
//! address. A region is either a [`Mapping`] of an object or an [`Area`],
//! a reservation that can hold further regions:
//!
//! ```text
//!  root [0x1000 ........................................ 0x8000_0000_0000)
//!    ├─ Mapping [0x40_0000, 0x40_4000) → vmo 7 @ 0
//!    └─ Area    [0x1000_0000, 0x2000_0000)
//!         ├─ Mapping [0x1000_0000, 0x1000_2000) → vmo 9 @ 0x3000
//!         └─ Mapping [0x1800_0000, 0x1800_1000) → vmo 2 @ 0
//! ```
//!
//! Siblings never overlap and children lie within their area.

use crate::aspace::AddressSpace;
use crate::error::RegionError;
use crate::object::VmObject;
use alloc::collections::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use kernel_memory_addresses::{VirtualAddress, VirtualRange, align_up};
use kernel_vmem::MmuFlags;

/// Where a new region goes.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionRange {
    /// `None` picks the lowest free gap.
    pub base: Option<VirtualAddress>,
    pub size: u64,
}

impl RegionRange {
    #[must_use]
    pub const fn fixed(base: VirtualAddress, size: u64) -> Self {
        Self { base: Some(base), size }
    }

    #[must_use]
    pub const fn anywhere(size: u64) -> Self {
        Self { base: None, size }
    }
}

/// The object a mapping shows and the byte offset it starts at.
#[derive(Debug, Clone)]
pub struct Backing {
    pub object: Arc<VmObject>,
    pub offset: u64,
}

impl Backing {
    #[must_use]
    pub const fn new(object: Arc<VmObject>, offset: u64) -> Self {
        Self { object, offset }
    }
}

/// What [`AddressSpace::find_subregion`] reports.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum RegionKind {
    Mapping { object_id: u64, offset: u64 },
    Area,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct RegionInfo {
    pub range: VirtualRange,
    pub flags: MmuFlags,
    pub kind: RegionKind,
}

/// `[range)` showing `object` from byte `offset` on. Registered with the
/// object for as long as it lives.
#[derive(Debug)]
pub(crate) struct Mapping {
    range: VirtualRange,
    flags: MmuFlags,
    object: Arc<VmObject>,
    offset: u64,
    link: u64,
}

impl Mapping {
    pub(crate) fn new(
        aspace: Weak<AddressSpace>,
        range: VirtualRange,
        flags: MmuFlags,
        object: Arc<VmObject>,
        offset: u64,
    ) -> Self {
        let link = object.attach(aspace, range.base, offset, range.size);
        Self {
            range,
            flags,
            object,
            offset,
            link,
        }
    }

    pub(crate) const fn range(&self) -> VirtualRange {
        self.range
    }

    pub(crate) const fn flags(&self) -> MmuFlags {
        self.flags
    }

    pub(crate) const fn object(&self) -> &Arc<VmObject> {
        &self.object
    }

    pub(crate) const fn offset(&self) -> u64 {
        self.offset
    }

    /// Object byte offset of the page holding `va`.
    pub(crate) fn object_offset(&self, va: VirtualAddress) -> u64 {
        self.offset + (va.align_down::<kernel_memory_addresses::Size4K>() - self.range.base)
    }

    /// The part of this mapping in `range`, with `flags`, as a new mapping.
    pub(crate) fn slice(
        &self,
        aspace: &Weak<AddressSpace>,
        range: VirtualRange,
        flags: MmuFlags,
    ) -> Self {
        debug_assert!(self.range.contains_range(&range));
        Self::new(
            aspace.clone(),
            range,
            flags,
            self.object.clone(),
            self.offset + (range.base - self.range.base),
        )
    }
}

impl Drop for Mapping {
    fn drop(&mut self) {
        self.object.detach(self.link);
    }
}

/// A reservation; holds regions but maps nothing itself.
#[derive(Debug)]
pub(crate) struct Area {
    range: VirtualRange,
    flags: MmuFlags,
    children: RegionSet,
}

impl Area {
    pub(crate) const fn new(range: VirtualRange, flags: MmuFlags) -> Self {
        Self {
            range,
            flags,
            children: RegionSet::new(),
        }
    }

    pub(crate) const fn children(&self) -> &RegionSet {
        &self.children
    }

    pub(crate) fn with_children(range: VirtualRange, flags: MmuFlags, children: RegionSet) -> Self {
        Self { range, flags, children }
    }
}

#[derive(Debug)]
pub(crate) enum Region {
    Mapping(Mapping),
    Area(Area),
}

impl Region {
    pub(crate) const fn range(&self) -> VirtualRange {
        match self {
            Self::Mapping(m) => m.range,
            Self::Area(a) => a.range,
        }
    }

    pub(crate) fn info(&self) -> RegionInfo {
        match self {
            Self::Mapping(m) => RegionInfo {
                range: m.range,
                flags: m.flags,
                kind: RegionKind::Mapping {
                    object_id: m.object.id(),
                    offset: m.offset,
                },
            },
            Self::Area(a) => RegionInfo {
                range: a.range,
                flags: a.flags,
                kind: RegionKind::Area,
            },
        }
    }
}

/// Non-overlapping regions keyed by base address.
#[derive(Debug, Default)]
pub(crate) struct RegionSet {
    regions: BTreeMap<u64, Region>,
}

impl RegionSet {
    pub(crate) const fn new() -> Self {
        Self {
            regions: BTreeMap::new(),
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.regions.len()
    }

    pub(crate) fn iter(&self) -> impl Iterator<Item = &Region> {
        self.regions.values()
    }

    /// The region at this level containing `va`.
    pub(crate) fn containing(&self, va: VirtualAddress) -> Option<&Region> {
        self.regions
            .range(..=va.as_u64())
            .next_back()
            .map(|(_, r)| r)
            .filter(|r| r.range().contains(va))
    }

    /// The innermost region containing `va`.
    pub(crate) fn find_deepest(&self, va: VirtualAddress) -> Option<&Region> {
        let region = self.containing(va)?;
        match region {
            Region::Area(area) => area.children.find_deepest(va).or(Some(region)),
            Region::Mapping(_) => Some(region),
        }
    }

    pub(crate) fn mapping_at(&self, va: VirtualAddress) -> Option<&Mapping> {
        match self.find_deepest(va)? {
            Region::Mapping(m) => Some(m),
            Region::Area(_) => None,
        }
    }

    /// The set a region covering `range` belongs in: the innermost area that
    /// wholly contains it, or this level. Also returns the permissions that
    /// area allows.
    pub(crate) fn container_mut(
        &mut self,
        range: &VirtualRange,
        allowed: MmuFlags,
    ) -> Result<(&mut Self, MmuFlags), RegionError> {
        let descend = match self.regions.range(..range.end()).next_back() {
            Some((_, r)) if !r.range().overlaps(range) => None,
            Some((&base, Region::Area(a))) if a.range.contains_range(range) => Some(base),
            Some((&base, _)) => return Err(RegionError::Overlap(base)),
            None => None,
        };
        let Some(base) = descend else {
            return Ok((self, allowed));
        };
        match self.regions.get_mut(&base) {
            Some(Region::Area(area)) => {
                let allowed = allowed & area.flags;
                area.children.container_mut(range, allowed)
            }
            _ => Err(RegionError::Invalid),
        }
    }

    /// Lowest `align`-aligned base in `within` with `size` free bytes.
    pub(crate) fn find_gap(
        &self,
        within: &VirtualRange,
        size: u64,
        align: u64,
    ) -> Result<VirtualAddress, RegionError> {
        let mut cursor = align_up(within.base.as_u64(), align).ok_or(RegionError::NoSpace)?;
        for region in self.regions.values() {
            let range = region.range();
            if range.end() <= cursor {
                continue;
            }
            if cursor.checked_add(size).is_some_and(|end| end <= range.base.as_u64()) {
                break;
            }
            cursor = align_up(range.end(), align).ok_or(RegionError::NoSpace)?;
        }
        match cursor.checked_add(size) {
            Some(end) if end <= within.end() => Ok(VirtualAddress::new(cursor)),
            _ => Err(RegionError::NoSpace),
        }
    }

    /// Add `region`; the caller has checked it fits.
    pub(crate) fn insert(&mut self, region: Region) {
        let base = region.range().base.as_u64();
        let previous = self.regions.insert(base, region);
        debug_assert!(previous.is_none());
    }

    /// Remove the outermost region starting at `base`.
    pub(crate) fn remove(&mut self, base: VirtualAddress) -> Option<Region> {
        if let Some(region) = self.regions.remove(&base.as_u64()) {
            return Some(region);
        }
        let (_, region) = self.regions.range_mut(..=base.as_u64()).next_back()?;
        match region {
            Region::Area(area) if area.range.contains(base) => area.children.remove(base),
            _ => None,
        }
    }

    /// The set holding the mapping that contains `va`.
    pub(crate) fn mapping_set_mut(&mut self, va: VirtualAddress) -> Option<&mut Self> {
        let (key, nested) = self
            .regions
            .range(..=va.as_u64())
            .next_back()
            .filter(|(_, r)| r.range().contains(va))
            .map(|(&k, r)| (k, matches!(r, Region::Area(_))))?;
        if !nested {
            return Some(self);
        }
        match self.regions.get_mut(&key) {
            Some(Region::Area(area)) => area.children.mapping_set_mut(va),
            _ => None,
        }
    }

    /// Replace the mapping containing `range` with up to three pieces; the
    /// piece covering `range` gets `flags`.
    pub(crate) fn reprotect(
        &mut self,
        aspace: &Weak<AddressSpace>,
        range: &VirtualRange,
        flags: MmuFlags,
    ) -> Result<(), RegionError> {
        let key = self
            .regions
            .range(..=range.base.as_u64())
            .next_back()
            .map(|(&k, _)| k)
            .ok_or(RegionError::NotFound(range.base.as_u64()))?;
        let Some(Region::Mapping(old)) = self.regions.get(&key) else {
            return Err(RegionError::NotFound(range.base.as_u64()));
        };
        if !old.range.contains_range(range) {
            return Err(RegionError::Invalid);
        }

        let whole = old.range;
        let mut pieces = Vec::with_capacity(3);
        if range.base > whole.base {
            let head = VirtualRange::new(whole.base, range.base - whole.base);
            pieces.push(old.slice(aspace, head, old.flags));
        }
        pieces.push(old.slice(aspace, *range, flags));
        if range.end() < whole.end() {
            let tail =
                VirtualRange::new(VirtualAddress::new(range.end()), whole.end() - range.end());
            pieces.push(old.slice(aspace, tail, old.flags));
        }
        self.regions.remove(&key);
        for piece in pieces {
            self.insert(Region::Mapping(piece));
        }
        Ok(())
    }

    /// Every region, leaving the set empty.
    pub(crate) fn take_all(&mut self) -> Vec<Region> {
        core::mem::take(&mut self.regions).into_values().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::testing::context;
    use crate::object::{VmObjectPhysical, VmoFlags};
    use kernel_memory_addresses::PhysicalAddress;

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn range(base: u64, size: u64) -> VirtualRange {
        VirtualRange::new(va(base), size)
    }

    fn area(base: u64, size: u64) -> Region {
        Region::Area(Area::new(range(base, size), MmuFlags::RW))
    }

    fn place(set: &mut RegionSet, region: Region) -> Result<(), RegionError> {
        let (target, _) = set.container_mut(&region.range(), MmuFlags::all())?;
        target.insert(region);
        Ok(())
    }

    #[test]
    fn siblings_never_overlap() {
        let mut set = RegionSet::new();
        place(&mut set, area(0x10_000, 0x4000)).unwrap();
        place(&mut set, area(0x20_000, 0x1000)).unwrap();

        assert_eq!(place(&mut set, area(0xF_000, 0x2000)), Err(RegionError::Overlap(0x10_000)));
        assert_eq!(place(&mut set, area(0x13_000, 0x2000)), Err(RegionError::Overlap(0x10_000)));
        assert_eq!(place(&mut set, area(0x1F_000, 0x4000)), Err(RegionError::Overlap(0x20_000)));
        place(&mut set, area(0x14_000, 0xC000)).unwrap();

        let ranges: Vec<_> = set.iter().map(Region::range).collect();
        for pair in ranges.windows(2) {
            assert!(pair[0].end() <= pair[1].base.as_u64());
        }
    }

    #[test]
    fn fixed_regions_nest_into_areas() {
        let mut set = RegionSet::new();
        place(&mut set, area(0x10_000, 0x10_000)).unwrap();
        place(&mut set, area(0x12_000, 0x2000)).unwrap();
        assert_eq!(set.len(), 1);

        let deepest = set.find_deepest(va(0x13_800)).unwrap();
        assert_eq!(deepest.range(), range(0x12_000, 0x2000));
        assert_eq!(set.find_deepest(va(0x18_000)).unwrap().range(), range(0x10_000, 0x10_000));
        assert!(set.find_deepest(va(0x20_000)).is_none());

        // The area itself goes first when both start at the same base.
        place(&mut set, area(0x10_000, 0x1000)).unwrap();
        let outer = set.remove(va(0x10_000)).unwrap();
        assert_eq!(outer.range(), range(0x10_000, 0x10_000));
        assert!(set.remove(va(0x10_000)).is_none());
    }

    #[test]
    fn gaps_respect_alignment() {
        let mut set = RegionSet::new();
        let within = range(0x1000, 0x10_0000);
        place(&mut set, area(0x1000, 0x1000)).unwrap();
        place(&mut set, area(0x3000, 0x1000)).unwrap();

        assert_eq!(set.find_gap(&within, 0x1000, 0x1000), Ok(va(0x2000)));
        assert_eq!(set.find_gap(&within, 0x2000, 0x1000), Ok(va(0x4000)));
        assert_eq!(set.find_gap(&within, 0x1000, 0x10_000), Ok(va(0x10_000)));
        assert_eq!(set.find_gap(&within, 0x20_0000, 0x1000), Err(RegionError::NoSpace));
    }

    #[test]
    fn reprotect_splits_and_relinks() {
        let ctx = context();
        let object = VmObjectPhysical::create(&ctx, PhysicalAddress::new(0xFEE0_0000), 0x4000, VmoFlags::empty()).unwrap();
        let object_id = object.id();
        let mut set = RegionSet::new();
        set.insert(Region::Mapping(Mapping::new(
            Weak::new(),
            range(0x40_0000, 0x4000),
            MmuFlags::RW,
            object,
            0,
        )));

        set.reprotect(&Weak::new(), &range(0x40_1000, 0x1000), MmuFlags::READABLE)
            .unwrap();
        let infos: Vec<_> = set.iter().map(Region::info).collect();
        assert_eq!(infos.len(), 3);
        assert_eq!(infos[1].flags, MmuFlags::READABLE);
        assert_eq!(infos[2].range, range(0x40_2000, 0x2000));
        assert_eq!(
            infos[2].kind,
            RegionKind::Mapping {
                object_id,
                offset: 0x2000
            }
        );
        assert_eq!(
            set.reprotect(&Weak::new(), &range(0x40_1000, 0x2000), MmuFlags::RW),
            Err(RegionError::Invalid)
        );
    }
}
