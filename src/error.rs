#[cfg(any(test, feature = "std"))]
use std::io;

/// The set of all possible errors
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// The name does not fit the 8.3 scheme
    InvalidName,
    /// No entry with that name exists
    NotFound,
    /// An entry with that name already exists
    Exists,
    /// No free directory entry, or no free block in the required region
    NoSpace,
    /// Operation not permitted on this handle
    BadHandle,
    /// No superblock candidate with a valid checksum and link pair
    SuperblockCorrupt,
    /// Walking a FAT chain produced the contained out-of-range block index
    CorruptChain(i16),
    /// Failure surfaced by the NAND adapter
    Io,
}

impl From<Infallible> for Error {
    fn from(_: Infallible) -> Error {
        unreachable!()
    }
}

#[cfg(any(test, feature = "std"))]
impl From<io::Error> for Error {
    fn from(_: io::Error) -> Error {
        Error::Io
    }
}

#[derive(Debug)]
pub enum Infallible {}
