use alloc::boxed::Box;

use crate::error::Error;
use crate::fs::{Bbfs, BIG_FILE_SIZE};
use crate::nand::Nand;
use crate::sys::dirent::Entry;
use crate::sys::fat;
use crate::sys::{BLOCK_SIZE, PAGES_PER_BLOCK, PAGE_SIZE};

const BLOCK: u32 = BLOCK_SIZE as u32;
const PAGE: u32 = PAGE_SIZE as u32;

bitflags! {
    /// Open-file state machine flags.
    pub(crate) struct HandleFlags: u16 {
        const READING = 0x01;
        const WRITING = 0x02;
        /// The page holding `pos` sits in the handle's page buffer and
        /// may be dirty
        const PAGE_CACHED = 0x04;
        /// The current block is being rewritten into a fresh shadow
        /// block; the old block stays live in the FAT until end-of-block
        const BLOCK_SHADOWED = 0x08;
        /// An ftruncate grew the file; the zero fill is deferred
        const LAZY_EXTEND = 0x10;
    }
}

bitflags! {
    /// Open behavior, orthogonal to the access mode.
    pub struct OpenFlags: u16 {
        const CREATE = 0x01;
        const EXCL = 0x02;
        const TRUNC = 0x04;
        const APPEND = 0x08;
    }
}

/// Access mode of a handle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mode {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl Mode {
    pub fn readable(self) -> bool {
        self != Mode::WriteOnly
    }

    pub fn writable(self) -> bool {
        self != Mode::ReadOnly
    }
}

/// Origin of a seek offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Whence {
    Set,
    Cur,
    End,
}

/// The FAT slot (or entry head) whose value names the handle's current
/// block. Chains are spliced through this, so it is kept as indices into
/// the superblock state rather than a borrowed pointer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Link {
    Entry(usize),
    Fat(i16),
}

/// Per-handle engine state. The surrounding `File` wrapper owns the lock;
/// every method here runs under it and receives the filesystem by
/// reference.
///
/// Invariant between calls: `block` is the chain block containing `pos`
/// (`TERMINATOR` when `pos` sits at the end of the materialized chain)
/// and `link` is the slot whose value is `block`. While `BLOCK_SHADOWED`
/// is set, `block` still names the old chain block; `shadow` is its
/// replacement under construction.
pub(crate) struct OpenFile {
    entry: usize,
    pos: u32,
    block: i16,
    link: Link,
    shadow: i16,
    /// Pages already programmed into the shadow block
    shadow_written: u32,
    cached_page: u16,
    flags: HandleFlags,
    final_size: u32,
    page: Option<Box<[u8; PAGE_SIZE]>>,
}

impl OpenFile {
    pub(crate) fn new(index: usize, entry: &Entry, mode: Mode) -> OpenFile {
        let mut flags = HandleFlags::empty();
        if mode.readable() {
            flags.insert(HandleFlags::READING);
        }
        if mode.writable() {
            flags.insert(HandleFlags::WRITING);
        }
        OpenFile {
            entry: index,
            pos: 0,
            block: entry.block,
            link: Link::Entry(index),
            shadow: fat::TERMINATOR,
            shadow_written: 0,
            cached_page: 0,
            flags,
            final_size: 0,
            page: if mode.writable() {
                Some(Box::new([0; PAGE_SIZE]))
            } else {
                None
            },
        }
    }

    pub(crate) fn is_writing(&self) -> bool {
        self.flags.contains(HandleFlags::WRITING)
    }

    fn len_bytes<D: Nand>(&self, fs: &Bbfs<D>) -> u32 {
        fs.entry(self.entry).len_bytes()
    }

    // --- read -----------------------------------------------------------

    pub(crate) fn read<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        buf: &mut [u8],
    ) -> Result<usize, Error> {
        if !self.flags.contains(HandleFlags::READING) {
            return Err(Error::BadHandle);
        }
        let len = self.len_bytes(fs);
        if self.pos >= len || buf.is_empty() {
            return Ok(0);
        }
        let total = (buf.len() as u32).min(len - self.pos) as usize;
        let mut done = 0;
        while done < total {
            let block_off = self.pos % BLOCK;
            let page = (block_off / PAGE) as usize;
            let page_off = (block_off % PAGE) as usize;
            let n = (total - done).min(PAGE_SIZE - page_off);
            let dst = &mut buf[done..done + n];
            if self.flags.contains(HandleFlags::PAGE_CACHED)
                && self.cached_page as usize == page
            {
                let cache = self.page.as_ref().ok_or(Error::BadHandle)?;
                dst.copy_from_slice(&cache[page_off..page_off + n]);
            } else if self.flags.contains(HandleFlags::BLOCK_SHADOWED)
                && self.shadow_written & (1 << page) != 0
            {
                fs.read_slice(self.shadow, page, page_off, dst)?;
            } else {
                fs.read_slice(self.block, page, page_off, dst)?;
            }
            self.pos += n as u32;
            done += n;
            if self.pos % BLOCK == 0 {
                self.advance_block(fs)?;
            }
        }
        Ok(total)
    }

    // --- write ----------------------------------------------------------

    pub(crate) fn write<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        buf: &[u8],
    ) -> Result<usize, Error> {
        if !self.flags.contains(HandleFlags::WRITING) {
            return Err(Error::BadHandle);
        }
        self.write_inner(fs, buf)
    }

    fn write_inner<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        buf: &[u8],
    ) -> Result<usize, Error> {
        let mut written = 0;
        while written < buf.len() {
            let remaining = (buf.len() - written) as u32;
            if !self.flags.contains(HandleFlags::BLOCK_SHADOWED) {
                self.begin_block(fs, self.pos + remaining)?;
            }
            let block_off = self.pos % BLOCK;
            let page = (block_off / PAGE) as usize;
            let page_off = (block_off % PAGE) as usize;
            let n = (remaining as usize).min(PAGE_SIZE - page_off);
            if self.shadow_written & (1 << page) != 0 {
                // this shadow page is already programmed; splice the
                // shadow in and start another one for the same block
                self.retire_block(fs)?;
                continue;
            }
            if page_off == 0 && n == PAGE_SIZE {
                // whole page, bypass the cache
                self.flags.remove(HandleFlags::PAGE_CACHED);
                fs.write_page(self.shadow, page, &buf[written..written + n])?;
                self.shadow_written |= 1 << page;
            } else {
                if !self.flags.contains(HandleFlags::PAGE_CACHED) {
                    self.page_begin(fs, page)?;
                }
                let cache = self.page.as_mut().ok_or(Error::BadHandle)?;
                cache[page_off..page_off + n]
                    .copy_from_slice(&buf[written..written + n]);
                if page_off + n == PAGE_SIZE {
                    self.page_end(fs)?;
                }
            }
            self.pos += n as u32;
            written += n;
            let mut entry = fs.entry(self.entry);
            if self.pos > entry.len_bytes() {
                entry.set_len(self.pos);
                fs.set_entry(self.entry, entry);
            }
            if self.pos % BLOCK == 0 {
                self.end_block(fs)?;
            }
        }
        Ok(written)
    }

    /// Allocate and erase a shadow for the block holding `pos`. The
    /// allocation hint is the best known final size, which steers big
    /// files away from the small-file area.
    fn begin_block<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        final_hint: u32,
    ) -> Result<(), Error> {
        let final_size = if self.flags.contains(HandleFlags::LAZY_EXTEND) {
            self.final_size.max(final_hint)
        } else {
            self.len_bytes(fs).max(final_hint)
        };
        let prev = match self.link {
            Link::Fat(block) => block,
            Link::Entry(_) => fat::TERMINATOR,
        };
        let shadow = fs.alloc_block(prev, final_size >= BIG_FILE_SIZE)?;
        fs.erase(shadow)?;
        self.shadow = shadow;
        self.shadow_written = 0;
        self.flags.insert(HandleFlags::BLOCK_SHADOWED);
        Ok(())
    }

    /// Load the page under `pos` from the old chain block into the cache
    /// so partial writes merge with existing data.
    fn page_begin<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        page: usize,
    ) -> Result<(), Error> {
        let block = self.block;
        let cache = self.page.as_mut().ok_or(Error::BadHandle)?;
        if block == fat::TERMINATOR {
            cache.fill(0);
        } else {
            fs.read_slice(block, page, 0, &mut cache[..])?;
        }
        self.cached_page = page as u16;
        self.flags.insert(HandleFlags::PAGE_CACHED);
        Ok(())
    }

    /// Program the cached page into the shadow block.
    fn page_end<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        let shadow = self.shadow;
        let page = self.cached_page as usize;
        let cache = self.page.as_ref().ok_or(Error::BadHandle)?;
        fs.write_page(shadow, page, &cache[..])?;
        self.shadow_written |= 1 << page;
        self.flags.remove(HandleFlags::PAGE_CACHED);
        Ok(())
    }

    /// Finish the shadow block: carry over the pages the write never
    /// touched, then splice the shadow into the chain in place of the old
    /// block. The FAT updates are RAM-only; durability comes from the
    /// next superblock flush.
    fn end_block<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        let new = self.shadow;
        let old = self.block;
        if old != fat::TERMINATOR {
            for page in 0..PAGES_PER_BLOCK {
                if self.shadow_written & (1 << page) == 0 {
                    fs.copy_page(old, new, page)?;
                }
            }
            let next = fs.fat_get(old)?;
            fs.fat_set(new, next)?;
            fs.fat_set(old, fat::UNUSED)?;
            self.set_link(fs, new)?;
        } else {
            self.set_link(fs, new)?;
            fs.fat_set(new, fat::TERMINATOR)?;
        }
        self.link = Link::Fat(new);
        self.block = fs.fat_get(new)?;
        self.shadow = fat::TERMINATOR;
        self.shadow_written = 0;
        self.flags.remove(HandleFlags::BLOCK_SHADOWED);
        Ok(())
    }

    /// Splice the current shadow and come back to the same position,
    /// ready for a fresh shadow of the same block.
    fn retire_block<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        if self.flags.contains(HandleFlags::PAGE_CACHED) {
            self.page_end(fs)?;
        }
        let pos = self.pos;
        self.end_block(fs)?;
        self.walk_to(fs, pos)
    }

    fn set_link<D: Nand>(&mut self, fs: &mut Bbfs<D>, value: i16) -> Result<(), Error> {
        match self.link {
            Link::Entry(index) => {
                let mut entry = fs.entry(index);
                entry.block = value;
                fs.set_entry(index, entry);
            }
            Link::Fat(slot) => fs.fat_set(slot, value)?,
        }
        Ok(())
    }

    fn advance_block<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        if self.flags.contains(HandleFlags::BLOCK_SHADOWED) {
            if self.flags.contains(HandleFlags::PAGE_CACHED) {
                self.page_end(fs)?;
            }
            self.end_block(fs)
        } else {
            self.link = Link::Fat(self.block);
            self.block = fs.fat_get(self.block)?;
            Ok(())
        }
    }

    /// Re-derive `block` and `link` for `pos` by walking the chain from
    /// the entry head.
    fn walk_to<D: Nand>(&mut self, fs: &Bbfs<D>, pos: u32) -> Result<(), Error> {
        let entry = fs.entry(self.entry);
        let mut link = Link::Entry(self.entry);
        let mut block = entry.block;
        for _ in 0..pos / BLOCK {
            if block == fat::TERMINATOR {
                break;
            }
            link = Link::Fat(block);
            block = fs.fat_get(block)?;
        }
        self.pos = pos;
        self.block = block;
        self.link = link;
        Ok(())
    }

    // --- seek / truncate ------------------------------------------------

    pub(crate) fn seek<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        offset: i64,
        whence: Whence,
    ) -> Result<u64, Error> {
        let len = self.len_bytes(fs);
        let base = match whence {
            Whence::Set => 0,
            Whence::Cur => self.pos as i64,
            Whence::End => len as i64,
        };
        let limit = if self.flags.contains(HandleFlags::LAZY_EXTEND) {
            self.final_size.max(len)
        } else {
            len
        };
        let target = (base + offset).clamp(0, limit as i64) as u32;

        if self.flags.contains(HandleFlags::WRITING) {
            let cross_page = target / PAGE != self.pos / PAGE;
            let cross_block = target / BLOCK != self.pos / BLOCK;
            if cross_page && self.flags.contains(HandleFlags::PAGE_CACHED) {
                self.page_end(fs)?;
            }
            if cross_block && self.flags.contains(HandleFlags::BLOCK_SHADOWED) {
                self.end_block(fs)?;
            }
        }
        if self.flags.contains(HandleFlags::LAZY_EXTEND) && target > len {
            self.extend(fs)?;
        }
        self.walk_to(fs, target)?;
        Ok(target as u64)
    }

    pub(crate) fn ftruncate<D: Nand>(
        &mut self,
        fs: &mut Bbfs<D>,
        new_len: u32,
    ) -> Result<(), Error> {
        if !self.flags.contains(HandleFlags::WRITING) {
            return Err(Error::BadHandle);
        }
        let len = self.len_bytes(fs);
        if new_len < len {
            if self.pos > new_len {
                self.seek(fs, new_len as i64, Whence::Set)?;
            }
            // a shadow for a block past the cut holds data the truncate
            // discards; the block was never spliced, so dropping the
            // flags is enough to abandon it
            let keep = new_len.div_ceil(BLOCK);
            if self.flags.contains(HandleFlags::BLOCK_SHADOWED)
                && self.pos / BLOCK >= keep
            {
                self.flags.remove(HandleFlags::PAGE_CACHED);
                self.flags.remove(HandleFlags::BLOCK_SHADOWED);
                self.shadow = fat::TERMINATOR;
                self.shadow_written = 0;
            }
            self.flags.remove(HandleFlags::LAZY_EXTEND);
            fs.shrink(self.entry, new_len)?;
            self.walk_to(fs, self.pos)?;
        } else if new_len > len {
            self.flags.insert(HandleFlags::LAZY_EXTEND);
            self.final_size = new_len;
        } else {
            self.flags.remove(HandleFlags::LAZY_EXTEND);
        }
        Ok(())
    }

    /// Materialize a pending lazy extension by pushing zero-filled chunks
    /// through the ordinary write path.
    fn extend<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        let target = self.final_size;
        let len = self.len_bytes(fs);
        if target > len {
            self.walk_to(fs, len)?;
            let zeros = [0u8; PAGE_SIZE];
            while self.pos < target {
                let gap = target - self.pos;
                let n = gap.min(PAGE - self.pos % PAGE) as usize;
                self.write_inner(fs, &zeros[..n])?;
            }
        }
        self.flags.remove(HandleFlags::LAZY_EXTEND);
        Ok(())
    }

    // --- close ----------------------------------------------------------

    /// Settle all pending state and flush the superblock. Called by
    /// `File::close` and by the drop guard.
    pub(crate) fn finish<D: Nand>(&mut self, fs: &mut Bbfs<D>) -> Result<(), Error> {
        if self.flags.contains(HandleFlags::WRITING) {
            if self.flags.contains(HandleFlags::PAGE_CACHED) {
                self.page_end(fs)?;
            }
            if self.flags.contains(HandleFlags::BLOCK_SHADOWED) {
                self.end_block(fs)?;
            }
            if self.flags.contains(HandleFlags::LAZY_EXTEND) {
                self.extend(fs)?;
                if self.flags.contains(HandleFlags::PAGE_CACHED) {
                    self.page_end(fs)?;
                }
                if self.flags.contains(HandleFlags::BLOCK_SHADOWED) {
                    self.end_block(fs)?;
                }
            }
            fs.flush()?;
        }
        Ok(())
    }
}
