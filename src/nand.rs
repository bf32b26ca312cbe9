use alloc::vec;
use alloc::vec::Vec;

use crate::error::{Error, Infallible};
use crate::sys::{BLOCK_SIZE, PAGES_PER_BLOCK, PAGE_SIZE};

/// Raw NAND driver contract. The filesystem sits directly on top of this,
/// with no translation layer in between: pages are programmed into erased
/// blocks and whole blocks are erased.
///
/// Implementations may block in any method. Failures are surfaced through
/// the associated error type and never retried by the filesystem.
pub trait Nand {
    type Error: Into<Error>;

    /// Total capacity in bytes. Must be a multiple of the block size.
    fn size(&self) -> usize;

    /// Read an arbitrary byte range out of one page. `offset + buf.len()`
    /// must not run past the end of the page.
    fn read(
        &self,
        block: u16,
        page: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Self::Error>;

    /// Program `count` whole pages into an erased region of `block`,
    /// starting at `first_page`. `with_ecc` selects whether the controller
    /// computes error correction codes for the data area.
    fn write_pages(
        &mut self,
        block: u16,
        first_page: usize,
        count: usize,
        buf: &[u8],
        with_ecc: bool,
    ) -> Result<(), Self::Error>;

    /// Erase one block back to all-ones.
    fn erase_block(&mut self, block: u16) -> Result<(), Self::Error>;
}

/// RAM-backed NAND, used by the tests and by hosts that operate on a
/// flash image loaded into memory. Programming follows NAND semantics:
/// it can only clear bits, so writing a page twice without an erase
/// corrupts it instead of replacing it.
#[derive(Clone)]
pub struct MemNand {
    data: Vec<u8>,
}

impl MemNand {
    pub fn new(blocks: usize) -> MemNand {
        MemNand {
            data: vec![0xff; blocks * BLOCK_SIZE],
        }
    }

    pub fn from_image(data: Vec<u8>) -> MemNand {
        MemNand { data }
    }

    pub fn image(&self) -> &[u8] {
        &self.data
    }
}

impl Nand for MemNand {
    type Error = Infallible;

    fn size(&self) -> usize {
        self.data.len()
    }

    fn read(
        &self,
        block: u16,
        page: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Infallible> {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        let base = block as usize * BLOCK_SIZE + page * PAGE_SIZE + offset;
        buf.copy_from_slice(&self.data[base..base + buf.len()]);
        Ok(())
    }

    fn write_pages(
        &mut self,
        block: u16,
        first_page: usize,
        count: usize,
        buf: &[u8],
        _with_ecc: bool,
    ) -> Result<(), Infallible> {
        debug_assert!(first_page + count <= PAGES_PER_BLOCK);
        debug_assert!(buf.len() >= count * PAGE_SIZE);
        let base = block as usize * BLOCK_SIZE + first_page * PAGE_SIZE;
        let dst = &mut self.data[base..base + count * PAGE_SIZE];
        debug_assert!(dst.iter().all(|&b| b == 0xff), "page programmed twice");
        for (cell, &byte) in dst.iter_mut().zip(buf) {
            *cell &= byte;
        }
        Ok(())
    }

    fn erase_block(&mut self, block: u16) -> Result<(), Infallible> {
        let base = block as usize * BLOCK_SIZE;
        self.data[base..base + BLOCK_SIZE].fill(0xff);
        Ok(())
    }
}

#[cfg(any(test, feature = "std"))]
mod file {
    use std::cell::RefCell;
    use std::fs::File;
    use std::io::{self, Read, Seek, SeekFrom, Write};

    use crate::sys::{BLOCK_SIZE, PAGE_SIZE};

    use super::Nand;

    impl Nand for RefCell<File> {
        type Error = io::Error;

        fn size(&self) -> usize {
            self.borrow()
                .metadata()
                .map(|data| data.len() as usize)
                .unwrap_or(0)
        }

        fn read(
            &self,
            block: u16,
            page: usize,
            offset: usize,
            buf: &mut [u8],
        ) -> Result<(), io::Error> {
            let base = block as u64 * BLOCK_SIZE as u64
                + (page * PAGE_SIZE + offset) as u64;
            let mut refmut = self.borrow_mut();
            refmut
                .seek(SeekFrom::Start(base))
                .and_then(|_| refmut.read_exact(buf))
        }

        fn write_pages(
            &mut self,
            block: u16,
            first_page: usize,
            count: usize,
            buf: &[u8],
            _with_ecc: bool,
        ) -> Result<(), io::Error> {
            let base = block as u64 * BLOCK_SIZE as u64
                + (first_page * PAGE_SIZE) as u64;
            let refmut = self.get_mut();
            refmut
                .seek(SeekFrom::Start(base))
                .and_then(|_| refmut.write_all(&buf[..count * PAGE_SIZE]))
        }

        fn erase_block(&mut self, block: u16) -> Result<(), io::Error> {
            let base = block as u64 * BLOCK_SIZE as u64;
            let refmut = self.get_mut();
            refmut
                .seek(SeekFrom::Start(base))
                .and_then(|_| refmut.write_all(&[0xff; BLOCK_SIZE]))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::sys::{BLOCK_SIZE, PAGE_SIZE};

    use super::{MemNand, Nand};

    #[test]
    fn fresh_device_is_erased() {
        let nand = MemNand::new(4);
        assert_eq!(nand.size(), 4 * BLOCK_SIZE);
        let mut buf = [0u8; 16];
        nand.read(3, 31, PAGE_SIZE - 16, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 16]);
    }

    #[test]
    fn program_and_read_back() {
        let mut nand = MemNand::new(2);
        let page = [0xabu8; PAGE_SIZE];
        nand.write_pages(1, 3, 1, &page, true).unwrap();
        let mut buf = [0u8; 8];
        nand.read(1, 3, 100, &mut buf).unwrap();
        assert_eq!(buf, [0xab; 8]);
    }

    #[test]
    fn erase_restores_ones() {
        let mut nand = MemNand::new(1);
        nand.write_pages(0, 0, 1, &[0u8; PAGE_SIZE], true).unwrap();
        nand.erase_block(0).unwrap();
        let mut buf = [0u8; 4];
        nand.read(0, 0, 0, &mut buf).unwrap();
        assert_eq!(buf, [0xff; 4]);
    }

    #[test]
    fn file_backed_device() {
        use std::cell::RefCell;
        use std::fs::OpenOptions;
        use std::io::Write;

        let path = std::env::temp_dir()
            .join(format!("bbfs-nand-{}.img", std::process::id()));
        {
            let mut image = std::fs::File::create(&path).unwrap();
            image.write_all(&vec![0u8; 4 * BLOCK_SIZE]).unwrap();
        }
        let image = OpenOptions::new()
            .read(true)
            .write(true)
            .open(&path)
            .unwrap();
        let mut nand = RefCell::new(image);
        assert_eq!(nand.size(), 4 * BLOCK_SIZE);
        nand.erase_block(2).unwrap();
        nand.write_pages(2, 1, 1, &[0x5au8; PAGE_SIZE], true).unwrap();
        let mut buf = [0u8; 8];
        nand.read(2, 1, 0, &mut buf).unwrap();
        assert_eq!(buf, [0x5a; 8]);
        let _ = std::fs::remove_file(&path);
    }
}
