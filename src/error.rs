//! The error taxonomy is deliberately closed. Everything that can go wrong in
//! the store maps to one of these variants, and the variants are plain enough
//! to mirror into `Lattice::last_error` for callers which only see sentinel
//! return values through a wrapping layer.

use std::error::Error;
use std::fmt::{Display, Formatter};
use std::io;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LatticeError {
    /// A required input was empty or missing.
    NullInput,
    /// The store path could not be used (empty, no parent directory, ...).
    InvalidPath,
    /// The data file exists but does not carry the expected magic number.
    InvalidMagic,
    /// The node does not exist, or the request doesn't fit the node
    /// (oversized payload, wrong type, bad id).
    InvalidNode,
    /// On-disk bytes failed validation (bad slot, checksum mismatch).
    Corruption,
    OutOfMemory,
    /// Disk mode only: the pre-allocated file has no free slots left.
    CapacityExhausted,
    DiskFull,
    /// Any other I/O failure. The message is logged at the point of failure;
    /// only the kind is carried so the error stays `Copy` and comparable.
    Io(io::ErrorKind),
    WalNotEnabled,
    WalCorruption,
    LicenseInvalid,
    /// The per-machine admission counter reached the free tier limit.
    FreeTierLimit,
    /// A chunked aggregate was missing one or more of its data chunks.
    ChunkIncomplete,
    BufferTooSmall,
}

impl Display for LatticeError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            LatticeError::NullInput => write!(f, "required input was null or empty"),
            LatticeError::InvalidPath => write!(f, "invalid store path"),
            LatticeError::InvalidMagic => write!(f, "file has invalid magic number"),
            LatticeError::InvalidNode => write!(f, "invalid or unknown node"),
            LatticeError::Corruption => write!(f, "data corruption detected"),
            LatticeError::OutOfMemory => write!(f, "out of memory"),
            LatticeError::CapacityExhausted => write!(f, "pre-allocated node capacity exhausted"),
            LatticeError::DiskFull => write!(f, "disk full"),
            LatticeError::Io(kind) => write!(f, "io error: {}", kind),
            LatticeError::WalNotEnabled => write!(f, "write-ahead log is not enabled"),
            LatticeError::WalCorruption => write!(f, "write-ahead log is corrupt"),
            LatticeError::LicenseInvalid => write!(f, "license is invalid"),
            LatticeError::FreeTierLimit => write!(f, "free tier node limit reached"),
            LatticeError::ChunkIncomplete => write!(f, "chunked node is missing data chunks"),
            LatticeError::BufferTooSmall => write!(f, "destination buffer too small"),
        }
    }
}

impl Error for LatticeError {}

impl From<io::Error> for LatticeError {
    fn from(io_err: io::Error) -> Self {
        match io_err.kind() {
            io::ErrorKind::StorageFull => LatticeError::DiskFull,
            io::ErrorKind::OutOfMemory => LatticeError::OutOfMemory,
            kind => LatticeError::Io(kind),
        }
    }
}

pub type Result<T> = std::result::Result<T, LatticeError>;

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn io_error_kinds_fold_into_taxonomy() {
        let e: LatticeError = io::Error::from(io::ErrorKind::StorageFull).into();
        assert_eq!(e, LatticeError::DiskFull);

        let e: LatticeError = io::Error::from(io::ErrorKind::PermissionDenied).into();
        assert_eq!(e, LatticeError::Io(io::ErrorKind::PermissionDenied));
    }
}
