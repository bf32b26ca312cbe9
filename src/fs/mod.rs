use alloc::vec::Vec;

use rand_core::SeedableRng;

use crate::error::Error;
use crate::nand::Nand;
use crate::rng::Lcg;
use crate::sys::dirent::{self, Entry};
use crate::sys::fat;
use crate::sys::superblock::{self, Superblock};
use crate::sys::{
    page_span, BLOCK_SIZE, DIR_ENTRIES, FAT_ENTRIES, PAGES_PER_BLOCK,
    PAGE_SIZE, SUPERBLOCK_POOL,
};

pub mod file;
pub mod fsck;
pub mod sync;

/// Initial width of the small-file area in blocks (1 MiB)
const SMALL_AREA_BLOCKS: u16 = ((1 << 20) / BLOCK_SIZE) as u16;
/// Files at least this long take the whole-device allocation path
pub(crate) const BIG_FILE_SIZE: u32 = 512 * 1024;

/// The tail region reserved for small files. Keeping churny small files
/// clustered here preserves contiguous space at the head of the device
/// for large files.
struct Area {
    start: u16,
    free: u16,
}

/// In-memory filesystem over a raw NAND device: the decoded superblock
/// chain plus the allocator and flush state derived from it.
///
/// All mutating operations assume exclusive access; `Synced` provides the
/// outer lock.
pub struct Bbfs<D: Nand> {
    pub(crate) device: D,
    superblocks: Vec<Superblock>,
    /// Page-dirty bitmap per superblock, consumed by `flush`
    dirty: Vec<u32>,
    total_blocks: u16,
    small_area: Area,
    pub(crate) rng: Lcg,
    /// Rotating slot in the superblock pool, randomized at init
    sb_cursor: u16,
}

impl<D: Nand> core::fmt::Debug for Bbfs<D> {
    fn fmt(&self, f: &mut core::fmt::Formatter) -> core::fmt::Result {
        f.debug_struct("Bbfs")
            .field("total_blocks", &self.total_blocks)
            .field("superblocks", &self.superblocks.len())
            .finish()
    }
}

impl<D: Nand> Bbfs<D> {
    /// Locate the freshest consistent superblock chain and build the
    /// in-memory state from it.
    pub fn mount(device: D, seed: u64) -> Result<Bbfs<D>, Error> {
        let (total_blocks, count) = Self::geometry(&device)?;
        let linked = count > 1;
        let pool_start = total_blocks - SUPERBLOCK_POOL as u16;

        let mut candidates: Vec<(u32, u16)> = Vec::new();
        for block in pool_start..total_blocks {
            let mut raw = [0u8; superblock::FOOTER_SIZE];
            device
                .read(
                    block,
                    PAGES_PER_BLOCK - 1,
                    PAGE_SIZE - superblock::FOOTER_SIZE,
                    &mut raw,
                )
                .map_err(Into::into)?;
            let footer = superblock::Footer::decode(&raw);
            if footer.magic == superblock::MAGIC_PRIMARY {
                candidates.push((footer.seqno, block));
            }
        }
        candidates.sort_by(|a, b| b.0.cmp(&a.0));

        for &(_, block) in &candidates {
            if let Ok(chain) = Self::try_load(&device, total_blocks, block, linked)
            {
                return Ok(Self::init_state(device, chain, total_blocks, seed));
            }
        }
        Err(Error::SuperblockCorrupt)
    }

    /// Write a fresh, empty superblock chain and return the mounted
    /// filesystem. The superblock pool (and, on undersized devices, the
    /// FAT slots past the end of the device) is marked `RESERVED`.
    pub fn format(device: D, seed: u64) -> Result<Bbfs<D>, Error> {
        let (total_blocks, count) = Self::geometry(&device)?;
        let reserved_from = total_blocks as usize - SUPERBLOCK_POOL;
        let mut chain = Vec::with_capacity(count);
        for index in 0..count {
            let magic = if index == 0 {
                superblock::MAGIC_PRIMARY
            } else {
                superblock::MAGIC_LINKED
            };
            let mut sb = Superblock::new_empty(magic);
            for slot in 0..FAT_ENTRIES {
                if index * FAT_ENTRIES + slot >= reserved_from {
                    sb.fat[slot] = fat::RESERVED;
                }
            }
            chain.push(sb);
        }
        let mut fs = Self::init_state(device, chain, total_blocks, seed);
        for dirty in fs.dirty.iter_mut() {
            *dirty = !0;
        }
        fs.flush()?;
        Ok(fs)
    }

    fn geometry(device: &D) -> Result<(u16, usize), Error> {
        let size = device.size();
        if size == 0 || size % BLOCK_SIZE != 0 {
            return Err(Error::SuperblockCorrupt);
        }
        let total = size / BLOCK_SIZE;
        if total < 2 * SUPERBLOCK_POOL || total > 2 * FAT_ENTRIES {
            return Err(Error::SuperblockCorrupt);
        }
        Ok((total as u16, total.div_ceil(FAT_ENTRIES)))
    }

    fn read_image(device: &D, block: u16) -> Result<Vec<u8>, Error> {
        let mut image = alloc::vec![0u8; BLOCK_SIZE];
        for page in 0..PAGES_PER_BLOCK {
            let at = page * PAGE_SIZE;
            device
                .read(block, page, 0, &mut image[at..at + PAGE_SIZE])
                .map_err(Into::into)?;
        }
        Ok(image)
    }

    fn try_load(
        device: &D,
        total_blocks: u16,
        primary_block: u16,
        linked: bool,
    ) -> Result<Vec<Superblock>, Error> {
        let primary = Superblock::decode(&Self::read_image(device, primary_block)?)?;
        let mut chain = Vec::with_capacity(2);
        if linked {
            let link = primary.footer.link;
            if link >= total_blocks {
                return Err(Error::SuperblockCorrupt);
            }
            let secondary = Superblock::decode(&Self::read_image(device, link)?)?;
            if secondary.footer.magic != superblock::MAGIC_LINKED
                || secondary.footer.seqno != primary.footer.seqno
            {
                return Err(Error::SuperblockCorrupt);
            }
            chain.push(primary);
            chain.push(secondary);
        } else {
            chain.push(primary);
        }
        Ok(chain)
    }

    fn init_state(
        device: D,
        superblocks: Vec<Superblock>,
        total_blocks: u16,
        seed: u64,
    ) -> Bbfs<D> {
        let dirty = alloc::vec![0u32; superblocks.len()];
        let mut fs = Bbfs {
            device,
            superblocks,
            dirty,
            total_blocks,
            small_area: Area { start: 0, free: 0 },
            rng: Lcg::seed_from_u64(seed),
            sb_cursor: 0,
        };
        let pool_start = fs.pool_start();
        let start = total_blocks.saturating_sub(SMALL_AREA_BLOCKS).min(pool_start);
        let mut free = 0;
        for block in start..pool_start {
            if fs.superblocks[block as usize / FAT_ENTRIES].fat
                [block as usize % FAT_ENTRIES]
                == fat::UNUSED
            {
                free += 1;
            }
        }
        fs.small_area = Area { start, free };
        fs.sb_cursor = fs.rng.pick(SUPERBLOCK_POOL as u16);
        fs
    }

    pub fn total_blocks(&self) -> u16 {
        self.total_blocks
    }

    pub fn free_blocks(&self) -> usize {
        (0..self.total_blocks as usize)
            .filter(|&b| {
                self.superblocks[b / FAT_ENTRIES].fat[b % FAT_ENTRIES]
                    == fat::UNUSED
            })
            .count()
    }

    pub(crate) fn pool_start(&self) -> u16 {
        self.total_blocks - SUPERBLOCK_POOL as u16
    }

    pub(crate) fn small_area_start(&self) -> u16 {
        self.small_area.start
    }

    pub(crate) fn small_area_free(&self) -> u16 {
        self.small_area.free
    }

    // --- FAT and entry access -------------------------------------------

    pub(crate) fn fat_get(&self, block: i16) -> Result<i16, Error> {
        if block < 0 || block as u16 >= self.total_blocks {
            return Err(Error::CorruptChain(block));
        }
        let b = block as usize;
        Ok(self.superblocks[b / FAT_ENTRIES].fat[b % FAT_ENTRIES])
    }

    pub(crate) fn fat_set(&mut self, block: i16, value: i16) -> Result<(), Error> {
        if block < 0 || block as u16 >= self.total_blocks {
            return Err(Error::CorruptChain(block));
        }
        let b = block as usize;
        self.superblocks[b / FAT_ENTRIES].fat[b % FAT_ENTRIES] = value;
        self.dirty[b / FAT_ENTRIES] |= page_span(2 * (b % FAT_ENTRIES), 2);
        Ok(())
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.superblocks.len() * DIR_ENTRIES
    }

    pub(crate) fn entry(&self, index: usize) -> Entry {
        self.superblocks[index / DIR_ENTRIES].entries[index % DIR_ENTRIES]
    }

    pub(crate) fn set_entry(&mut self, index: usize, entry: Entry) {
        let slot = index % DIR_ENTRIES;
        self.superblocks[index / DIR_ENTRIES].entries[slot] = entry;
        self.dirty[index / DIR_ENTRIES] |= page_span(
            superblock::ENTRIES_OFFSET + slot * dirent::SIZE,
            dirent::SIZE,
        );
    }

    // --- directory operations -------------------------------------------

    pub(crate) fn find_entry(&self, name: &str) -> Result<usize, Error> {
        let (stem, ext) = dirent::parse_name(name)?;
        for index in 0..self.entry_count() {
            let entry = self.entry(index);
            if entry.is_valid() && entry.name == stem && entry.ext == ext {
                return Ok(index);
            }
        }
        Err(Error::NotFound)
    }

    pub(crate) fn create_entry(&mut self, name: &str) -> Result<usize, Error> {
        let (stem, ext) = dirent::parse_name(name)?;
        for index in 0..self.entry_count() {
            if !self.entry(index).is_valid() {
                let mut entry = Entry::EMPTY;
                entry.name = stem;
                entry.ext = ext;
                entry.valid = 1;
                entry.block = fat::TERMINATOR;
                self.set_entry(index, entry);
                return Ok(index);
            }
        }
        Err(Error::NoSpace)
    }

    pub(crate) fn delete_entry(&mut self, index: usize) -> Result<(), Error> {
        self.shrink(index, 0)?;
        let mut entry = self.entry(index);
        entry.valid = 0;
        self.set_entry(index, entry);
        Ok(())
    }

    /// Cut the chain of entry `index` down to `new_len` bytes, releasing
    /// every block past the last one kept.
    pub(crate) fn shrink(&mut self, index: usize, new_len: u32) -> Result<(), Error> {
        let mut entry = self.entry(index);
        let keep = new_len.div_ceil(BLOCK_SIZE as u32);
        if keep == 0 {
            let head = entry.block;
            entry.block = fat::TERMINATOR;
            if fat::in_use(head) {
                self.free_chain(head)?;
            }
        } else {
            let mut block = entry.block;
            for _ in 1..keep {
                block = self.fat_get(block)?;
            }
            let rest = self.fat_get(block)?;
            self.fat_set(block, fat::TERMINATOR)?;
            if fat::is_chained(rest) {
                self.free_chain(rest)?;
            }
        }
        entry.set_len(new_len);
        self.set_entry(index, entry);
        Ok(())
    }

    pub(crate) fn free_chain(&mut self, head: i16) -> Result<(), Error> {
        let mut block = head;
        let mut hops = 0;
        while block != fat::TERMINATOR {
            let next = self.fat_get(block)?;
            if !fat::in_use(next) {
                return Err(Error::CorruptChain(block));
            }
            self.fat_set(block, fat::UNUSED)?;
            block = next;
            hops += 1;
            if hops > self.total_blocks {
                return Err(Error::CorruptChain(head));
            }
        }
        Ok(())
    }

    /// Physical block list of a file, for memory-mapping clients.
    pub fn file_blocks(&self, name: &str) -> Option<Vec<u16>> {
        let entry = self.entry(self.find_entry(name).ok()?);
        let mut blocks = Vec::new();
        let mut block = entry.block;
        while block != fat::TERMINATOR {
            if block < 0 || blocks.len() > self.total_blocks as usize {
                return None;
            }
            blocks.push(block as u16);
            block = self.fat_get(block).ok()?;
            if !fat::in_use(block) {
                return None;
            }
        }
        Some(blocks)
    }

    // --- allocator ------------------------------------------------------

    /// Pick the next free block for a file being extended past `prev`
    /// (`TERMINATOR` for a fresh file). Small files draw from the tail
    /// area by random probe; big files take the first free block of the
    /// whole device. The chosen block is not yet linked into the FAT.
    ///
    /// Block 0 is handed out only as a chain head: the `UNUSED` sentinel
    /// makes 0 unrepresentable as a next pointer.
    pub(crate) fn alloc_block(&mut self, prev: i16, big_file: bool) -> Result<i16, Error> {
        if prev != fat::TERMINATOR {
            let next = prev + 1;
            if (next as u16) < self.total_blocks && self.fat_get(next)? == fat::UNUSED {
                self.note_alloc(next as u16);
                return Ok(next);
            }
        }
        let head = prev == fat::TERMINATOR;
        if !big_file {
            let start = self.small_area.start;
            let span = self.pool_start() - start;
            if span == 0 {
                return Err(Error::NoSpace);
            }
            let probe = self.rng.pick(span);
            for step in 0..span {
                let block = start + (probe + step) % span;
                if block == 0 && !head {
                    continue;
                }
                if self.fat_get(block as i16)? == fat::UNUSED {
                    self.note_alloc(block);
                    return Ok(block as i16);
                }
            }
            return Err(Error::NoSpace);
        }
        let first = if head { 0 } else { 1 };
        for block in first..self.total_blocks {
            if self.fat_get(block as i16)? == fat::UNUSED {
                self.note_alloc(block);
                return Ok(block as i16);
            }
        }
        Err(Error::NoSpace)
    }

    fn note_alloc(&mut self, block: u16) {
        if block >= self.small_area.start && block < self.pool_start() {
            self.small_area.free = self.small_area.free.saturating_sub(1);
            self.resize_small_area();
        }
    }

    /// Keep at least 20% of the area free by extending it one block at a
    /// time toward the head of the device.
    fn resize_small_area(&mut self) {
        while self.small_area.start > 0
            && (self.small_area.free as u32) * 5
                < (self.total_blocks - self.small_area.start) as u32
        {
            self.small_area.start -= 1;
            if self
                .fat_get(self.small_area.start as i16)
                .map(|v| v == fat::UNUSED)
                .unwrap_or(false)
            {
                self.small_area.free += 1;
            }
        }
    }

    // --- flush protocol -------------------------------------------------

    /// Persist the in-memory superblocks if anything is dirty. Images go
    /// out last-to-first so the primary's link can point at the block just
    /// chosen for the secondary; targets rotate through the 16-block pool
    /// to spread wear.
    pub(crate) fn flush(&mut self) -> Result<(), Error> {
        if self.dirty.iter().all(|&d| d == 0) {
            return Ok(());
        }
        let pool_start = self.pool_start();
        for index in (0..self.superblocks.len()).rev() {
            {
                let sb = &mut self.superblocks[index];
                sb.footer.seqno = sb.footer.seqno.wrapping_add(1);
            }
            self.dirty[index] |=
                page_span(superblock::FOOTER_OFFSET, superblock::FOOTER_SIZE);

            let target = pool_start + self.sb_cursor % SUPERBLOCK_POOL as u16;
            self.sb_cursor = self.sb_cursor.wrapping_add(1);

            let image = self.superblocks[index].encode();
            self.device.erase_block(target).map_err(Into::into)?;
            self.device
                .write_pages(target, 0, PAGES_PER_BLOCK, &image, true)
                .map_err(Into::into)?;
            self.dirty[index] = 0;

            if index > 0 {
                self.superblocks[index - 1].footer.link = target;
                self.dirty[index - 1] |=
                    page_span(superblock::FOOTER_OFFSET, superblock::FOOTER_SIZE);
            }
        }
        Ok(())
    }

    /// Validate the filesystem; see `fsck::run`.
    pub fn fsck(&mut self, fix: bool) -> Result<u32, Error> {
        fsck::run(self, fix)
    }

    // --- NAND helpers ---------------------------------------------------

    pub(crate) fn read_slice(
        &self,
        block: i16,
        page: usize,
        offset: usize,
        buf: &mut [u8],
    ) -> Result<(), Error> {
        debug_assert!(offset + buf.len() <= PAGE_SIZE);
        if block < 0 || block as u16 >= self.total_blocks {
            return Err(Error::CorruptChain(block));
        }
        self.device
            .read(block as u16, page, offset, buf)
            .map_err(Into::into)
    }

    pub(crate) fn write_page(
        &mut self,
        block: i16,
        page: usize,
        buf: &[u8],
    ) -> Result<(), Error> {
        debug_assert_eq!(buf.len(), PAGE_SIZE);
        if block < 0 || block as u16 >= self.total_blocks {
            return Err(Error::CorruptChain(block));
        }
        self.device
            .write_pages(block as u16, page, 1, buf, true)
            .map_err(Into::into)
    }

    pub(crate) fn copy_page(
        &mut self,
        from: i16,
        to: i16,
        page: usize,
    ) -> Result<(), Error> {
        let mut buf = [0u8; PAGE_SIZE];
        self.read_slice(from, page, 0, &mut buf)?;
        self.write_page(to, page, &buf)
    }

    pub(crate) fn erase(&mut self, block: i16) -> Result<(), Error> {
        if block < 0 || block as u16 >= self.total_blocks {
            return Err(Error::CorruptChain(block));
        }
        self.device.erase_block(block as u16).map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use crate::nand::MemNand;
    use crate::sys::fat;
    use crate::sys::superblock::{self, CHECKSUM_MAGIC};
    use crate::sys::{BLOCK_SIZE, SUPERBLOCK_POOL};

    use super::Bbfs;

    const BLOCKS: usize = 128;

    fn fresh() -> Bbfs<MemNand> {
        Bbfs::format(MemNand::new(BLOCKS), 0x5eed).unwrap()
    }

    #[test]
    fn blank_device_fails_mount() {
        // 64 MiB of erased flash, no valid footer anywhere
        let nand = MemNand::new(4096);
        assert_eq!(
            Bbfs::mount(nand, 1).unwrap_err(),
            crate::error::Error::SuperblockCorrupt
        );
    }

    #[test]
    fn format_then_mount() {
        let fs = fresh();
        let image = fs.device.image().to_vec();
        let fs = Bbfs::mount(MemNand::from_image(image), 99).unwrap();
        assert_eq!(fs.total_blocks(), BLOCKS as u16);
        // pool is reserved, the rest of the device is free
        assert_eq!(fs.free_blocks(), BLOCKS - SUPERBLOCK_POOL);
        for block in fs.pool_start()..fs.total_blocks() {
            assert_eq!(fs.fat_get(block as i16).unwrap(), fat::RESERVED);
        }
    }

    #[test]
    fn mount_prefers_highest_seqno() {
        let mut fs = fresh();
        for _ in 0..5 {
            fs.set_entry(0, fs.entry(0));
            fs.flush().unwrap();
        }
        let seqno_before = fs.superblocks[0].footer.seqno;
        let fs = Bbfs::mount(MemNand::from_image(fs.device.image().to_vec()), 3).unwrap();
        assert_eq!(fs.superblocks[0].footer.seqno, seqno_before);
    }

    #[test]
    fn flush_images_sum_to_magic() {
        let mut fs = fresh();
        let index = fs.create_entry("A.TXT").unwrap();
        fs.flush().unwrap();
        // every pool block that carries a footer magic must checksum clean
        let image = fs.device.image();
        let mut seen = 0;
        for block in BLOCKS - SUPERBLOCK_POOL..BLOCKS {
            let raw = &image[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE];
            let magic = &raw[superblock::FOOTER_OFFSET..superblock::FOOTER_OFFSET + 4];
            if magic == b"BBFS" {
                assert_eq!(superblock::checksum(raw), CHECKSUM_MAGIC);
                seen += 1;
            }
        }
        assert!(seen >= 1);
        fs.delete_entry(index).unwrap();
    }

    #[test]
    fn flush_rotates_pool_slots() {
        let mut fs = fresh();
        let mut targets = std::collections::HashSet::new();
        for _ in 0..8 {
            fs.set_entry(0, fs.entry(0));
            fs.flush().unwrap();
            // find the block holding the freshest primary
            let image = fs.device.image();
            let seqno = fs.superblocks[0].footer.seqno;
            for block in BLOCKS - SUPERBLOCK_POOL..BLOCKS {
                let raw = &image[block * BLOCK_SIZE..(block + 1) * BLOCK_SIZE];
                let footer = superblock::Footer::decode(&raw[superblock::FOOTER_OFFSET..]);
                if footer.magic == superblock::MAGIC_PRIMARY && footer.seqno == seqno {
                    targets.insert(block);
                }
            }
        }
        assert!(targets.len() > 4);
    }

    #[test]
    fn clean_flush_is_a_no_op() {
        let mut fs = fresh();
        let seqno = fs.superblocks[0].footer.seqno;
        fs.flush().unwrap();
        assert_eq!(fs.superblocks[0].footer.seqno, seqno);
    }

    #[test]
    fn entries_create_find_delete() {
        let mut fs = fresh();
        let index = fs.create_entry("HELLO.TXT").unwrap();
        assert_eq!(fs.find_entry("HELLO.TXT").unwrap(), index);
        assert_eq!(fs.entry(index).block, fat::TERMINATOR);
        assert_eq!(
            fs.find_entry("OTHER.TXT").unwrap_err(),
            crate::error::Error::NotFound
        );
        assert_eq!(
            fs.find_entry("NOT A VALID NAME").unwrap_err(),
            crate::error::Error::InvalidName
        );
        fs.delete_entry(index).unwrap();
        assert!(fs.find_entry("HELLO.TXT").is_err());
    }

    #[test]
    fn small_files_land_in_the_tail_area() {
        let mut fs = fresh();
        for _ in 0..4 {
            let block = fs.alloc_block(fat::TERMINATOR, false).unwrap();
            assert!(block as u16 >= fs.small_area_start());
            assert!((block as u16) < fs.pool_start());
            fs.fat_set(block, fat::TERMINATOR).unwrap();
        }
    }

    #[test]
    fn big_files_fill_from_the_head() {
        let mut fs = fresh();
        let block = fs.alloc_block(fat::TERMINATOR, true).unwrap();
        assert_eq!(block, 0);
    }

    #[test]
    fn block_zero_only_heads_chains() {
        let mut fs = fresh();
        // kill the linear preference so the scan path runs
        fs.fat_set(6, fat::TERMINATOR).unwrap();
        let block = fs.alloc_block(5, true).unwrap();
        assert_eq!(block, 1);
        let head = fs.alloc_block(fat::TERMINATOR, true).unwrap();
        assert_eq!(head, 0);
    }

    #[test]
    fn linear_preference_wins() {
        let mut fs = fresh();
        let first = fs.alloc_block(fat::TERMINATOR, true).unwrap();
        fs.fat_set(first, fat::TERMINATOR).unwrap();
        let second = fs.alloc_block(first, false).unwrap();
        assert_eq!(second, first + 1);
    }

    #[test]
    fn small_area_keeps_its_free_ratio() {
        let mut fs = fresh();
        for _ in 0..40 {
            let block = match fs.alloc_block(fat::TERMINATOR, false) {
                Ok(block) => block,
                Err(_) => break,
            };
            fs.fat_set(block, fat::TERMINATOR).unwrap();
            assert!(
                fs.small_area_free() as u32 * 5
                    >= (fs.total_blocks() - fs.small_area_start()) as u32
                    || fs.small_area_start() == 0
            );
        }
    }

    #[test]
    fn exhausted_device_reports_no_space() {
        let mut fs = fresh();
        loop {
            match fs.alloc_block(fat::TERMINATOR, true) {
                Ok(block) => fs.fat_set(block, fat::TERMINATOR).unwrap(),
                Err(err) => {
                    assert_eq!(err, crate::error::Error::NoSpace);
                    break;
                }
            }
        }
        assert_eq!(fs.free_blocks(), 0);
    }

    #[test]
    fn shrink_releases_the_tail() {
        let mut fs = fresh();
        let index = fs.create_entry("CHAIN.BIN").unwrap();
        // hand-build a three block chain: 10 -> 11 -> 12
        let mut entry = fs.entry(index);
        entry.block = 10;
        entry.set_len(3 * BLOCK_SIZE as u32);
        fs.set_entry(index, entry);
        fs.fat_set(10, 11).unwrap();
        fs.fat_set(11, 12).unwrap();
        fs.fat_set(12, fat::TERMINATOR).unwrap();

        fs.shrink(index, BLOCK_SIZE as u32 + 1).unwrap();
        assert_eq!(fs.fat_get(10).unwrap(), 11);
        assert_eq!(fs.fat_get(11).unwrap(), fat::TERMINATOR);
        assert_eq!(fs.fat_get(12).unwrap(), fat::UNUSED);
        let entry = fs.entry(index);
        assert_eq!(entry.size, 2 * BLOCK_SIZE as u32);
        assert_eq!(entry.len_bytes(), BLOCK_SIZE as u32 + 1);

        fs.shrink(index, 0).unwrap();
        assert_eq!(fs.entry(index).block, fat::TERMINATOR);
        assert_eq!(fs.fat_get(10).unwrap(), fat::UNUSED);
        assert_eq!(fs.fat_get(11).unwrap(), fat::UNUSED);
    }

    #[test]
    fn file_blocks_walks_the_chain() {
        let mut fs = fresh();
        let index = fs.create_entry("MAP.BIN").unwrap();
        let mut entry = fs.entry(index);
        entry.block = 5;
        entry.set_len(2 * BLOCK_SIZE as u32);
        fs.set_entry(index, entry);
        fs.fat_set(5, 9).unwrap();
        fs.fat_set(9, fat::TERMINATOR).unwrap();
        assert_eq!(fs.file_blocks("MAP.BIN").unwrap(), alloc::vec![5, 9]);
        assert_eq!(fs.file_blocks("NONE.BIN"), None);
    }

    #[test]
    fn linked_pair_round_trips() {
        // device larger than one superblock's FAT coverage
        let nand = MemNand::new(4224);
        let mut fs = Bbfs::format(nand, 77).unwrap();
        assert_eq!(fs.superblocks.len(), 2);
        // a chain crossing the superblock boundary
        let index = fs.create_entry("SPAN.BIN").unwrap();
        let mut entry = fs.entry(index);
        entry.block = 4095;
        entry.set_len(2 * BLOCK_SIZE as u32);
        fs.set_entry(index, entry);
        fs.fat_set(4095, 4096).unwrap();
        fs.fat_set(4096, fat::TERMINATOR).unwrap();
        fs.flush().unwrap();

        let fs = Bbfs::mount(MemNand::from_image(fs.device.image().to_vec()), 5).unwrap();
        assert_eq!(fs.superblocks.len(), 2);
        assert_eq!(
            fs.superblocks[0].footer.seqno,
            fs.superblocks[1].footer.seqno
        );
        assert_eq!(fs.file_blocks("SPAN.BIN").unwrap(), alloc::vec![4095, 4096]);
    }

    #[test]
    fn torn_secondary_falls_back() {
        let nand = MemNand::new(4224);
        let mut fs = Bbfs::format(nand, 42).unwrap();
        let index = fs.create_entry("KEEP.BIN").unwrap();
        fs.flush().unwrap();
        fs.delete_entry(index).unwrap();
        fs.flush().unwrap();

        // corrupt the newest secondary so its checksum fails; mount must
        // fall back to the older consistent pair, where KEEP.BIN exists
        let mut torn = fs.device.image().to_vec();
        let link = fs.superblocks[0].footer.link as usize;
        torn[link * BLOCK_SIZE + 100] ^= 0x01;
        let reborn = Bbfs::mount(MemNand::from_image(torn), 8).unwrap();
        assert!(reborn.find_entry("KEEP.BIN").is_ok());

        // while the intact image mounts the newest pair, where the
        // delete took effect
        let intact = fs.device.image().to_vec();
        let fresh_mount = Bbfs::mount(MemNand::from_image(intact), 8).unwrap();
        assert!(fresh_mount.find_entry("KEEP.BIN").is_err());
    }
}
