//! Process-context identifiers for user address spaces.

use kernel_info::memory::MAX_PCID;
use kernel_info::{Result, Status};
use kernel_sync::SpinLock;
use kernel_vmem::AddressSpaceTag;

const WORDS: usize = (MAX_PCID as usize + 1).div_ceil(64);

struct Bitmap {
    words: [u64; WORDS],
    hint: usize,
    used: usize,
}

/// Hands out tags `1..=MAX_PCID`. Tag 0 belongs to the kernel.
pub(crate) struct PcidAllocator {
    bitmap: SpinLock<Bitmap>,
}

impl PcidAllocator {
    pub(crate) const fn new() -> Self {
        let mut words = [0; WORDS];
        words[0] = 1;
        Self {
            bitmap: SpinLock::new(Bitmap { words, hint: 0, used: 0 }),
        }
    }

    /// Next free tag, scanning from the word of the last allocation.
    pub(crate) fn alloc(&self) -> Result<AddressSpaceTag> {
        let mut map = self.bitmap.lock();
        for step in 0..WORDS {
            let idx = (map.hint + step) % WORDS;
            let word = map.words[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let tag = idx * 64 + bit;
            if tag > MAX_PCID as usize {
                continue;
            }
            map.words[idx] |= 1 << bit;
            map.hint = idx;
            map.used += 1;
            #[allow(clippy::cast_possible_truncation)]
            return Ok(AddressSpaceTag::new(tag as u16));
        }
        log::warn!("vmm: all {MAX_PCID} PCIDs in use");
        Err(Status::NoResource)
    }

    #[track_caller]
    pub(crate) fn free(&self, tag: AddressSpaceTag) {
        let tag = usize::from(tag.as_u16());
        let mut map = self.bitmap.lock();
        let (idx, bit) = (tag / 64, tag % 64);
        kernel_info::invariant!(
            tag != 0 && map.words[idx] & (1 << bit) != 0,
            "PCID {tag} released twice"
        );
        map.words[idx] &= !(1 << bit);
        map.used -= 1;
    }

    /// Tags currently handed out.
    pub(crate) fn in_use(&self) -> usize {
        self.bitmap.lock().used
    }
}
