use core::fmt;
use core::hash::Hash;

/// Sealed trait pattern to restrict `PageSize` impls to our markers.
mod sealed {
    pub trait Sealed {}
}

/// Marker trait for supported page sizes.
pub trait PageSize:
    sealed::Sealed + Clone + Copy + Eq + Ord + Hash + fmt::Display + fmt::Debug
{
    /// Page size in bytes (power of two).
    const SIZE: u64;
    /// log2(SIZE), i.e., number of low bits used for the offset.
    const SHIFT: u32;
    /// Number of 4 KiB frames covered by one page of this size.
    const FRAMES: u64 = Self::SIZE >> 12;

    fn as_str() -> &'static str;
}

macro_rules! page_size {
    ($(#[$meta:meta])* $name:ident, $shift:literal, $label:literal) => {
        $(#[$meta])*
        #[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
        pub struct $name;

        impl sealed::Sealed for $name {}

        impl PageSize for $name {
            const SIZE: u64 = 1 << $shift;
            const SHIFT: u32 = $shift;

            fn as_str() -> &'static str {
                $label
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(Self::as_str())
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                fmt::Display::fmt(self, f)
            }
        }
    };
}

page_size!(
    /// 4 KiB page (4096 bytes), the frame granularity.
    Size4K, 12, "4K"
);
page_size!(
    /// 2 MiB page (`2_097_152` bytes), a PD-level leaf.
    Size2M, 21, "2M"
);
page_size!(
    /// 1 GiB page (`1_073_741_824` bytes), a PDPT-level leaf.
    Size1G, 30, "1G"
);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes_and_frame_counts() {
        assert_eq!(Size4K::SIZE, 4096);
        assert_eq!(Size2M::FRAMES, 512);
        assert_eq!(Size1G::FRAMES, 512 * 512);
        assert_eq!(format!("{Size2M:?}"), "2M");
    }
}
