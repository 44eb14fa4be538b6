use kernel_info::Status;
use kernel_memory_addresses::VirtualAddress;

/// Failures of a page-table walk.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum WalkError {
    #[error("no frame left for an intermediate table")]
    OutOfTables,
    #[error("a translation already exists at {0:?}")]
    Existing(VirtualAddress),
    #[error("no translation at {0:?}")]
    NotMapped(VirtualAddress),
    #[error("address not page aligned")]
    Misaligned,
    #[error("address outside the translatable range")]
    OutOfRange,
    #[error("zero length or conflicting flags")]
    Invalid,
}

impl From<WalkError> for Status {
    fn from(value: WalkError) -> Self {
        match value {
            WalkError::OutOfTables => Self::OutOfMem,
            WalkError::Existing(_) => Self::AlreadyExists,
            WalkError::NotMapped(_) => Self::NotFound,
            WalkError::Misaligned => Self::MisAligned,
            WalkError::OutOfRange => Self::OutOfRange,
            WalkError::Invalid => Self::InvalidArguments,
        }
    }
}
