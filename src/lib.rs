//! BBFS, a log-structured filesystem for raw NAND flash. A flat
//! namespace of 8.3-named files sits on top of a bare page/block driver:
//! no translation layer, crash safety through shadow blocks and a
//! sequence-numbered superblock pair, wear spread by randomized
//! allocation.

#![cfg_attr(not(test), no_std)]

#[macro_use]
extern crate bitflags;
extern crate alloc;
#[cfg(any(test, feature = "std"))]
extern crate std;

pub mod error;
pub mod fs;
pub mod nand;
pub mod rng;
pub mod sys;

pub use error::Error;
pub use fs::file::{Mode, OpenFlags, Whence};
pub use fs::sync::{Dir, DirEntry, File, FileType, Metadata, Synced};
pub use fs::Bbfs;
pub use nand::{MemNand, Nand};
