use kernel_info::{NodeId, Status};

/// Why a physical range could not be handed to the allocator.
#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum AttachError {
    #[error("empty range")]
    Empty,
    #[error("base or size is not page-aligned")]
    Misaligned,
    #[error("range wraps the physical address space")]
    Overflow,
    #[error("range overlaps frames that are already attached")]
    AlreadyAttached,
    #[error("{0:?} is not described by the topology")]
    UnknownNode(NodeId),
}

impl From<AttachError> for Status {
    fn from(e: AttachError) -> Self {
        match e {
            AttachError::Empty | AttachError::AlreadyAttached => Self::InvalidArguments,
            AttachError::Misaligned => Self::MisAligned,
            AttachError::Overflow | AttachError::UnknownNode(_) => Self::OutOfRange,
        }
    }
}
