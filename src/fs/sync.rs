use alloc::string::String;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt::{self, Debug};

use spin::{Mutex, MutexGuard};

use crate::error::Error;
use crate::fs::file::{Mode, OpenFile, OpenFlags, Whence};
use crate::fs::Bbfs;
use crate::nand::Nand;

/// Shared-state wrapper. Every operation takes the lock for its whole
/// duration, which is the exclusive-mutation guarantee the engine
/// assumes.
pub struct Synced<T> {
    inner: Arc<Mutex<T>>,
}

impl<T> Synced<T> {
    pub fn with_inner(inner: T) -> Synced<T> {
        Synced {
            inner: Arc::new(Mutex::new(inner)),
        }
    }

    pub fn inner(&self) -> MutexGuard<'_, T> {
        self.inner.lock()
    }
}

impl<T> Clone for Synced<T> {
    fn clone(&self) -> Self {
        Synced {
            inner: self.inner.clone(),
        }
    }
}

impl<D: Nand> Synced<Bbfs<D>> {
    pub fn mount(device: D, seed: u64) -> Result<Synced<Bbfs<D>>, Error> {
        Bbfs::mount(device, seed).map(Synced::with_inner)
    }

    pub fn format(device: D, seed: u64) -> Result<Synced<Bbfs<D>>, Error> {
        Bbfs::format(device, seed).map(Synced::with_inner)
    }

    /// Open `name` under the given access mode and behavior flags.
    ///
    /// `CREATE | EXCL` on an existing file fails with `Exists`; a missing
    /// file without `CREATE` fails with `NotFound`. `TRUNC` drops the
    /// contents of a writable open; `APPEND` starts positioned at the end
    /// of the file.
    pub fn open(
        &self,
        name: &str,
        mode: Mode,
        flags: OpenFlags,
    ) -> Result<File<D>, Error> {
        let mut fs = self.inner();
        let index = match fs.find_entry(name) {
            Ok(index) => {
                if flags.contains(OpenFlags::CREATE | OpenFlags::EXCL) {
                    return Err(Error::Exists);
                }
                index
            }
            Err(Error::NotFound) if flags.contains(OpenFlags::CREATE) => {
                fs.create_entry(name)?
            }
            Err(err) => return Err(err),
        };
        if mode.writable() && flags.contains(OpenFlags::TRUNC) {
            fs.shrink(index, 0)?;
        }
        let entry = fs.entry(index);
        let mut state = OpenFile::new(index, &entry, mode);
        if flags.contains(OpenFlags::APPEND) && entry.len_bytes() > 0 {
            state.seek(&mut fs, entry.len_bytes() as i64, Whence::Set)?;
        }
        drop(fs);
        Ok(File {
            fs: self.clone(),
            state,
            closed: false,
        })
    }

    /// Remove `name`, releasing its blocks and flushing the superblock.
    pub fn unlink(&self, name: &str) -> Result<(), Error> {
        let mut fs = self.inner();
        let index = fs.find_entry(name)?;
        fs.delete_entry(index)?;
        fs.flush()
    }

    /// Enumerate the flat namespace. Only the root path exists.
    pub fn read_dir(&self, path: &str) -> Result<Dir<D>, Error> {
        if path != "/" {
            return Err(Error::NotFound);
        }
        Ok(Dir {
            fs: self.clone(),
            cursor: -1,
        })
    }

    /// Validate the filesystem, optionally repairing it. Returns the
    /// number of problems found.
    pub fn fsck(&self, fix: bool) -> Result<u32, Error> {
        self.inner().fsck(fix)
    }

    pub fn metadata(&self, name: &str) -> Result<Metadata, Error> {
        let fs = self.inner();
        let entry = fs.entry(fs.find_entry(name)?);
        Ok(Metadata {
            len: entry.len_bytes(),
        })
    }

    /// Physical blocks of a file, for memory-mapping clients.
    pub fn file_blocks(&self, name: &str) -> Option<Vec<u16>> {
        self.inner().file_blocks(name)
    }

    pub fn total_blocks(&self) -> u16 {
        self.inner().total_blocks()
    }

    pub fn free_blocks(&self) -> usize {
        self.inner().free_blocks()
    }
}

impl<D: Nand> Debug for Synced<Bbfs<D>> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Synced<Bbfs>")
    }
}

/// An open file. Writable handles settle their page cache, shadow block
/// and any deferred extension on `close`, which also flushes the
/// superblock; dropping an unclosed writer does the same on a best-effort
/// basis.
pub struct File<D: Nand> {
    fs: Synced<Bbfs<D>>,
    state: OpenFile,
    closed: bool,
}

impl<D: Nand> File<D> {
    pub fn read(&mut self, buf: &mut [u8]) -> Result<usize, Error> {
        let mut fs = self.fs.inner();
        self.state.read(&mut *fs, buf)
    }

    pub fn write(&mut self, buf: &[u8]) -> Result<usize, Error> {
        let mut fs = self.fs.inner();
        self.state.write(&mut *fs, buf)
    }

    pub fn seek(&mut self, offset: i64, whence: Whence) -> Result<u64, Error> {
        let mut fs = self.fs.inner();
        self.state.seek(&mut *fs, offset, whence)
    }

    pub fn ftruncate(&mut self, len: u32) -> Result<(), Error> {
        let mut fs = self.fs.inner();
        self.state.ftruncate(&mut *fs, len)
    }

    pub fn close(mut self) -> Result<(), Error> {
        self.closed = true;
        let mut fs = self.fs.inner();
        self.state.finish(&mut *fs)
    }
}

impl<D: Nand> Debug for File<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let role = if self.state.is_writing() {
            "writer"
        } else {
            "reader"
        };
        write!(f, "File({})", role)
    }
}

impl<D: Nand> Drop for File<D> {
    fn drop(&mut self) {
        if !self.closed && self.state.is_writing() {
            let mut fs = self.fs.inner();
            let _ = self.state.finish(&mut *fs);
        }
    }
}

/// Directory listing cursor over the flat namespace.
pub struct Dir<D: Nand> {
    fs: Synced<Bbfs<D>>,
    cursor: isize,
}

impl<D: Nand> Debug for Dir<D> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "Dir({})", self.cursor)
    }
}

impl<D: Nand> Iterator for Dir<D> {
    type Item = DirEntry;

    fn next(&mut self) -> Option<DirEntry> {
        let fs = self.fs.inner();
        loop {
            self.cursor += 1;
            if self.cursor as usize >= fs.entry_count() {
                return None;
            }
            let entry = fs.entry(self.cursor as usize);
            if entry.is_valid() {
                return Some(DirEntry {
                    name: entry.file_name(),
                    len: entry.len_bytes(),
                });
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DirEntry {
    name: String,
    len: u32,
}

impl DirEntry {
    pub fn file_name(&self) -> &str {
        &self.name
    }

    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file_type(&self) -> FileType {
        FileType::Regular
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Metadata {
    len: u32,
}

impl Metadata {
    pub fn len(&self) -> u32 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn file_type(&self) -> FileType {
        FileType::Regular
    }
}

/// The namespace is flat; everything in it is a regular file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileType {
    Regular,
}
