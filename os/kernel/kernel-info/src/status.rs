//! # Status Codes
//!
//! Every public operation of the memory core reports failure through
//! [`Status`]. Success is the `Ok` arm of [`Result`].

/// Result alias used across the memory core.
pub type Result<T> = core::result::Result<T, Status>;

/// Uniform error taxonomy.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, thiserror::Error)]
pub enum Status {
    /// No frame or table page could be obtained. Always recoverable.
    #[error("out of memory")]
    OutOfMem,
    /// Zero length, bad flags or another contract violation by the caller.
    #[error("invalid arguments")]
    InvalidArguments,
    /// The request lies outside the object, zone or address space.
    #[error("out of range")]
    OutOfRange,
    /// No mapping, region or entry at the requested location.
    #[error("not found")]
    NotFound,
    /// The target exists but is in a state that forbids the operation.
    #[error("bad state")]
    BadState,
    /// Something already occupies the requested location.
    #[error("already exists")]
    AlreadyExists,
    /// The operation or flag combination is not supported.
    #[error("unsupported")]
    Unsupported,
    /// An address or size is not aligned as required.
    #[error("misaligned")]
    MisAligned,
    /// A bounded resource other than memory (PCIDs, slots) is exhausted.
    #[error("no resource")]
    NoResource,
    /// The operation is pending on a page request; wait and retry.
    #[error("should wait")]
    ShouldWait,
    /// A wait expired before the request completed.
    #[error("timed out")]
    TimeOut,
    /// Unexpected internal failure.
    #[error("internal error")]
    InternalError,
}

impl Status {
    /// Stable numeric code, negative like a syscall return value.
    #[must_use]
    pub const fn code(self) -> i32 {
        match self {
            Self::OutOfMem => -1,
            Self::InvalidArguments => -2,
            Self::OutOfRange => -3,
            Self::NotFound => -4,
            Self::BadState => -5,
            Self::AlreadyExists => -6,
            Self::Unsupported => -7,
            Self::MisAligned => -8,
            Self::NoResource => -9,
            Self::ShouldWait => -10,
            Self::TimeOut => -11,
            Self::InternalError => -12,
        }
    }

    /// Inverse of [`Status::code`]. `0` and unknown codes yield `None`.
    #[must_use]
    pub const fn from_code(code: i32) -> Option<Self> {
        Some(match code {
            -1 => Self::OutOfMem,
            -2 => Self::InvalidArguments,
            -3 => Self::OutOfRange,
            -4 => Self::NotFound,
            -5 => Self::BadState,
            -6 => Self::AlreadyExists,
            -7 => Self::Unsupported,
            -8 => Self::MisAligned,
            -9 => Self::NoResource,
            -10 => Self::ShouldWait,
            -11 => Self::TimeOut,
            -12 => Self::InternalError,
            _ => return None,
        })
    }
}

/// Collapse a [`Result`] into the numeric channel: `0` on success.
#[must_use]
pub fn to_code<T>(result: &Result<T>) -> i32 {
    match result {
        Ok(_) => 0,
        Err(s) => s.code(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_round_trip() {
        for code in -12..=-1 {
            let s = Status::from_code(code).unwrap();
            assert_eq!(s.code(), code);
        }
        assert_eq!(Status::from_code(0), None);
        assert_eq!(to_code(&Ok::<(), Status>(())), 0);
    }

    #[test]
    fn messages() {
        assert_eq!(Status::OutOfMem.to_string(), "out of memory");
        assert_eq!(Status::ShouldWait.to_string(), "should wait");
    }
}
