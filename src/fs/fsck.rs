//! Offline integrity checker. Validates filenames, directory entry
//! bounds, FAT chains and block ownership over the in-memory superblocks,
//! optionally repairing what it finds. Repaired state is flushed before
//! returning.

use alloc::vec::Vec;

use rand_core::RngCore;

use crate::error::Error;
use crate::fs::Bbfs;
use crate::nand::Nand;
use crate::sys::dirent::{Entry, EXT_LEN, NAME_LEN};
use crate::sys::fat;
use crate::sys::BLOCK_SIZE;

const BLOCK: u32 = BLOCK_SIZE as u32;

/// 512-bit filter over `name || ext` keys. A negative proves the name is
/// unseen; a positive is confirmed by a linear scan of the entry table,
/// keeping the duplicate check linear overall.
#[derive(Default)]
pub(crate) struct Bloom {
    bits: [u64; 8],
}

impl Bloom {
    fn slot(key: &[u8; 11]) -> usize {
        let mut hash = 0u32;
        for &byte in key {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u32);
        }
        hash ^= hash >> 7;
        (hash & 511) as usize
    }

    pub(crate) fn contains(&self, key: &[u8; 11]) -> bool {
        let slot = Self::slot(key);
        self.bits[slot / 64] & (1 << (slot % 64)) != 0
    }

    pub(crate) fn insert(&mut self, key: &[u8; 11]) {
        let slot = Self::slot(key);
        self.bits[slot / 64] |= 1 << (slot % 64);
    }
}

struct BlockBitmap {
    words: Vec<u64>,
}

impl BlockBitmap {
    fn new(blocks: usize) -> BlockBitmap {
        BlockBitmap {
            words: alloc::vec![0; blocks.div_ceil(64)],
        }
    }

    fn get(&self, block: usize) -> bool {
        self.words[block / 64] & (1 << (block % 64)) != 0
    }

    fn set(&mut self, block: usize) {
        self.words[block / 64] |= 1 << (block % 64);
    }
}

fn name_key(entry: &Entry) -> [u8; 11] {
    let mut key = [0u8; 11];
    key[..NAME_LEN].copy_from_slice(&entry.name);
    key[NAME_LEN..].copy_from_slice(&entry.ext);
    key
}

fn clean_tail(bytes: &[u8]) -> bool {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    bytes[len..].iter().all(|&b| b == 0)
}

fn scrub_tail(bytes: &mut [u8]) {
    let len = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
    for byte in &mut bytes[len..] {
        *byte = 0;
    }
}

fn has_duplicate_before<D: Nand>(
    fs: &Bbfs<D>,
    index: usize,
    name: &[u8; NAME_LEN],
    ext: &[u8; EXT_LEN],
) -> bool {
    (0..index).any(|other| {
        let entry = fs.entry(other);
        entry.is_valid() && entry.name == *name && entry.ext == *ext
    })
}

fn name_taken<D: Nand>(fs: &Bbfs<D>, name: &[u8; NAME_LEN], ext: &[u8; EXT_LEN]) -> bool {
    (0..fs.entry_count()).any(|index| {
        let entry = fs.entry(index);
        entry.is_valid() && entry.name == *name && entry.ext == *ext
    })
}

/// Pick a fresh `FSCKxxxx` name for a repaired or adopted entry.
fn rename_fsck<D: Nand>(fs: &mut Bbfs<D>, entry: &mut Entry, bloom: &mut Bloom) {
    let ext = [0u8; EXT_LEN];
    let mut name = *b"FSCK0000";
    for _ in 0..1000 {
        let n = fs.rng.next_u32() % 10000;
        name[4] = b'0' + (n / 1000) as u8;
        name[5] = b'0' + (n / 100 % 10) as u8;
        name[6] = b'0' + (n / 10 % 10) as u8;
        name[7] = b'0' + (n % 10) as u8;
        let mut key = [0u8; 11];
        key[..NAME_LEN].copy_from_slice(&name);
        if bloom.contains(&key) && name_taken(fs, &name, &ext) {
            continue;
        }
        bloom.insert(&key);
        break;
    }
    entry.name = name;
    entry.ext = ext;
}

/// Walk `hops` FAT steps from the entry head, marking blocks as used.
/// Returns how many sound leading blocks were seen and whether the whole
/// chain checked out.
fn walk_chain<D: Nand>(
    fs: &Bbfs<D>,
    entry: &Entry,
    hops: usize,
    used: &mut BlockBitmap,
) -> (usize, bool) {
    if hops == 0 {
        return (0, entry.block == fat::TERMINATOR);
    }
    let mut block = entry.block;
    let mut kept = 0;
    for hop in 0..hops {
        if block < 0 || block as u16 >= fs.total_blocks() {
            return (kept, false);
        }
        if used.get(block as usize) {
            return (kept, false);
        }
        used.set(block as usize);
        kept += 1;
        let value = match fs.fat_get(block) {
            Ok(value) => value,
            Err(_) => return (kept, false),
        };
        if hop + 1 == hops {
            if value != fat::TERMINATOR {
                return (kept, false);
            }
        } else if fat::is_chained(value) {
            block = value;
        } else {
            return (kept, false);
        }
    }
    (hops, true)
}

fn truncate_chain<D: Nand>(
    fs: &mut Bbfs<D>,
    entry: &mut Entry,
    kept: usize,
) -> Result<(), Error> {
    if kept == 0 {
        entry.block = fat::TERMINATOR;
        entry.size = 0;
        entry.padding = 0;
    } else {
        let mut block = entry.block;
        for _ in 1..kept {
            block = fs.fat_get(block)?;
        }
        fs.fat_set(block, fat::TERMINATOR)?;
        entry.size = kept as u32 * BLOCK;
        entry.padding = 0;
    }
    Ok(())
}

/// Follow an orphan chain from `head`, marking blocks as used and (when
/// fixing) cutting it at the first bad link. Returns the chain length.
fn claim_orphan<D: Nand>(
    fs: &mut Bbfs<D>,
    head: i16,
    used: &mut BlockBitmap,
    fix: bool,
) -> Result<usize, Error> {
    let mut block = head;
    let mut prev = fat::TERMINATOR;
    let mut count = 0;
    loop {
        if block < 0 || block as u16 >= fs.total_blocks() || used.get(block as usize) {
            if fix && prev != fat::TERMINATOR {
                fs.fat_set(prev, fat::TERMINATOR)?;
            }
            return Ok(count);
        }
        used.set(block as usize);
        count += 1;
        let value = fs.fat_get(block)?;
        if value == fat::TERMINATOR {
            return Ok(count);
        }
        if !fat::is_chained(value) {
            if fix {
                fs.fat_set(block, fat::TERMINATOR)?;
            }
            return Ok(count);
        }
        prev = block;
        block = value;
    }
}

pub(crate) fn run<D: Nand>(fs: &mut Bbfs<D>, fix: bool) -> Result<u32, Error> {
    let total = fs.total_blocks() as usize;
    let mut errors = 0u32;
    let mut used = BlockBitmap::new(total);
    let mut bloom = Bloom::default();

    for index in 0..fs.entry_count() {
        let mut entry = fs.entry(index);
        if !entry.is_valid() {
            continue;
        }
        let mut changed = false;

        // stray bytes past the terminating zero of name or ext
        if !clean_tail(&entry.name) || !clean_tail(&entry.ext) {
            errors += 1;
            if fix {
                scrub_tail(&mut entry.name);
                scrub_tail(&mut entry.ext);
                changed = true;
            }
        }

        // duplicate names; the later entry loses
        let key = name_key(&entry);
        if bloom.contains(&key)
            && has_duplicate_before(fs, index, &entry.name, &entry.ext)
        {
            errors += 1;
            if fix {
                entry.valid = 0;
                fs.set_entry(index, entry);
            }
            continue;
        }
        bloom.insert(&key);

        // size must be block-rounded, padding less than a block
        if entry.size % BLOCK != 0 {
            errors += 1;
            if fix {
                entry.size = entry.size.div_ceil(BLOCK) * BLOCK;
                changed = true;
            }
        }
        if entry.padding as u32 >= BLOCK {
            errors += 1;
            if fix {
                entry.padding = 0;
                changed = true;
            }
        }

        let hops = (entry.size.div_ceil(BLOCK)) as usize;
        let (kept, sound) = walk_chain(fs, &entry, hops, &mut used);
        if !sound {
            errors += 1;
            if fix {
                truncate_chain(fs, &mut entry, kept)?;
                rename_fsck(fs, &mut entry, &mut bloom);
                changed = true;
            }
        }

        if fix && changed {
            fs.set_entry(index, entry);
        }
    }

    // blocks chained in the FAT but reachable from no entry
    for block in 0..total {
        if used.get(block) {
            continue;
        }
        if !fat::in_use(fs.fat_get(block as i16)?) {
            continue;
        }
        errors += 1;
        let count = claim_orphan(fs, block as i16, &mut used, fix)?;
        if fix {
            adopt(fs, block as i16, count, &mut bloom)?;
        }
    }

    if fix && errors > 0 {
        fs.flush()?;
    }
    Ok(errors)
}

/// Give an orphan chain a directory entry under a fresh `FSCK` name. With
/// the table full the blocks are released instead.
fn adopt<D: Nand>(
    fs: &mut Bbfs<D>,
    head: i16,
    count: usize,
    bloom: &mut Bloom,
) -> Result<(), Error> {
    for index in 0..fs.entry_count() {
        if !fs.entry(index).is_valid() {
            let mut entry = Entry::EMPTY;
            entry.valid = 1;
            entry.block = head;
            entry.size = count as u32 * BLOCK;
            entry.padding = 0;
            rename_fsck(fs, &mut entry, bloom);
            fs.set_entry(index, entry);
            return Ok(());
        }
    }
    fs.free_chain(head)
}

#[cfg(test)]
mod tests {
    use crate::nand::MemNand;
    use crate::sys::fat;
    use crate::sys::BLOCK_SIZE;

    use super::super::Bbfs;
    use super::Bloom;

    fn fresh() -> Bbfs<MemNand> {
        Bbfs::format(MemNand::new(128), 0xc0ffee).unwrap()
    }

    #[test]
    fn clean_filesystem_passes() {
        let mut fs = fresh();
        let index = fs.create_entry("GOOD.TXT").unwrap();
        let mut entry = fs.entry(index);
        entry.block = 20;
        entry.set_len(BLOCK_SIZE as u32);
        fs.set_entry(index, entry);
        fs.fat_set(20, fat::TERMINATOR).unwrap();
        assert_eq!(fs.fsck(false).unwrap(), 0);
        assert_eq!(fs.fsck(true).unwrap(), 0);
    }

    #[test]
    fn dirty_name_tail_is_scrubbed() {
        let mut fs = fresh();
        let index = fs.create_entry("AB.C").unwrap();
        let mut entry = fs.entry(index);
        entry.name[5] = b'X';
        fs.set_entry(index, entry);
        assert_eq!(fs.fsck(false).unwrap(), 1);
        assert_eq!(fs.fsck(true).unwrap(), 1);
        let entry = fs.entry(index);
        assert_eq!(entry.name, *b"AB\0\0\0\0\0\0");
        assert_eq!(fs.fsck(false).unwrap(), 0);
    }

    #[test]
    fn duplicate_loses_the_later_entry() {
        let mut fs = fresh();
        let first = fs.create_entry("TWIN.SAV").unwrap();
        let second = fs.create_entry("TWIN2.SAV").unwrap();
        let mut entry = fs.entry(second);
        entry.name = fs.entry(first).name;
        fs.set_entry(second, entry);
        assert!(fs.fsck(false).unwrap() >= 1);
        assert!(fs.fsck(true).unwrap() >= 1);
        assert!(fs.entry(first).is_valid());
        assert!(!fs.entry(second).is_valid());
        assert_eq!(fs.fsck(false).unwrap(), 0);
    }

    #[test]
    fn bad_size_and_padding_are_clamped() {
        let mut fs = fresh();
        let index = fs.create_entry("ODD.BIN").unwrap();
        let mut entry = fs.entry(index);
        entry.block = 30;
        entry.size = BLOCK_SIZE as u32 + 7;
        entry.padding = BLOCK_SIZE as u16;
        fs.set_entry(index, entry);
        fs.fat_set(30, 31).unwrap();
        fs.fat_set(31, fat::TERMINATOR).unwrap();
        assert_eq!(fs.fsck(false).unwrap(), 2);
        assert_eq!(fs.fsck(true).unwrap(), 2);
        let entry = fs.entry(index);
        assert_eq!(entry.size, 2 * BLOCK_SIZE as u32);
        assert_eq!(entry.padding, 0);
        assert_eq!(fs.fsck(false).unwrap(), 0);
    }

    #[test]
    fn broken_chain_is_truncated_and_renamed() {
        let mut fs = fresh();
        let index = fs.create_entry("TORN.BIN").unwrap();
        let mut entry = fs.entry(index);
        entry.block = 40;
        entry.set_len(3 * BLOCK_SIZE as u32);
        fs.set_entry(index, entry);
        fs.fat_set(40, 41).unwrap();
        // second hop dangles into free space
        assert!(fs.fsck(false).unwrap() >= 1);
        assert!(fs.fsck(true).unwrap() >= 1);
        assert_eq!(fs.fsck(true).unwrap(), 0);
        let entry = fs.entry(index);
        assert!(entry.is_valid());
        assert_eq!(&entry.name[..4], b"FSCK");
        assert_eq!(entry.size, 2 * BLOCK_SIZE as u32);
        assert_eq!(fs.fat_get(41).unwrap(), fat::TERMINATOR);
    }

    #[test]
    fn orphan_chain_is_adopted() {
        let mut fs = fresh();
        // two chained blocks no entry references
        fs.fat_set(50, 51).unwrap();
        fs.fat_set(51, fat::TERMINATOR).unwrap();
        assert_eq!(fs.fsck(false).unwrap(), 1);
        assert_eq!(fs.fsck(true).unwrap(), 1);
        assert_eq!(fs.fsck(false).unwrap(), 0);

        let adopted = (0..fs.entry_count())
            .map(|index| fs.entry(index))
            .find(|entry| entry.is_valid() && &entry.name[..4] == b"FSCK")
            .unwrap();
        assert_eq!(adopted.block, 50);
        assert_eq!(adopted.size, 2 * BLOCK_SIZE as u32);
        assert_eq!(
            fs.file_blocks(&adopted.file_name()).unwrap(),
            alloc::vec![50, 51]
        );
    }

    #[test]
    fn report_mode_never_mutates() {
        let mut fs = fresh();
        fs.fat_set(60, fat::TERMINATOR).unwrap();
        let before = fs.fsck(false).unwrap();
        assert_eq!(before, 1);
        // a second report run sees the same picture
        assert_eq!(fs.fsck(false).unwrap(), before);
        assert_eq!(fs.fat_get(60).unwrap(), fat::TERMINATOR);
    }

    #[test]
    fn bloom_filter_behaves() {
        let mut bloom = Bloom::default();
        let key = *b"HELLO\0\0\0TXT";
        assert!(!bloom.contains(&key));
        bloom.insert(&key);
        assert!(bloom.contains(&key));
        // distinct keys rarely collide
        let other = *b"WORLD\0\0\0BIN";
        assert!(!bloom.contains(&other));
    }
}
