use kernel_info::Status;

/// Why a region could not be placed or found.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("zero size, bad alignment or bad flags")]
    Invalid,
    #[error("range leaves the address space")]
    OutsideRoot,
    #[error("range overlaps the region at {0:#x}")]
    Overlap(u64),
    #[error("no gap of the requested size")]
    NoSpace,
    #[error("no region starts at {0:#x}")]
    NotFound(u64),
}

impl From<RegionError> for Status {
    fn from(value: RegionError) -> Self {
        match value {
            RegionError::Invalid => Self::InvalidArguments,
            RegionError::OutsideRoot => Self::OutOfRange,
            RegionError::Overlap(_) => Self::AlreadyExists,
            RegionError::NoSpace => Self::NoResource,
            RegionError::NotFound(_) => Self::NotFound,
        }
    }
}
