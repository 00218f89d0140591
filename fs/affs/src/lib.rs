// Copyright 2024 Kevin Ludwig
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! AFFS (Amiga Fast File System), read-only.
//!
//! Big-endian throughout. Block size is not known ahead of time: the boot
//! block only carries a root-block pointer in units of *its own* block
//! size, so mounting tries candidate block sizes of 512/1024/2048/4096
//! bytes in turn and accepts the first whose root block passes the type,
//! secondary-type and checksum checks. The original driver's >2 GiB
//! block-cache sizing formula is not reproduced here since this driver
//! keeps no such cache -- see DESIGN.md.

use std::any::Any;
use std::cell::RefCell;

use holycore_disk::{Core, Disk};
use holycore_err::{Error, Result};
use holycore_fs::block_map::{read_range, BlockSource};
use holycore_fs::{find_file, latin1, EntryInfo, Format, FsDriver, MountedFs};
use log::debug;

/// Amiga epoch (1978-01-01) to Unix epoch, in seconds: 8 leap-inclusive
/// years plus 2 extra days.
const AMIGA_EPOCH_OFFSET: u64 = 8 * 365 * 86400 + 2 * 86400;

const T_HEADER: u32 = 2;
const ST_ROOT: u32 = 1;
const ST_USERDIR: u32 = 2;
const ST_SOFTLINK: u32 = 3;
const ST_LINKDIR: u32 = 4;
const ST_FILE: u32 = 0xFFFF_FFFD; // -3
const ST_LINKFILE: u32 = 0xFFFF_FFFC; // -4

const HARDLINK_NEST_MAX: u32 = 8;
const HASH_CHAIN_SANITY_LIMIT: u32 = 4096;

fn be32(buf: &[u8], off: usize) -> u32 {
    u32::from_be_bytes(buf[off..off + 4].try_into().unwrap())
}

fn checksum_is_zero(block: &[u8]) -> bool {
    let mut sum: u32 = 0;
    for chunk in block.chunks_exact(4) {
        sum = sum.wrapping_add(u32::from_be_bytes(chunk.try_into().unwrap()));
    }
    sum == 0
}

/// `toupper(c) + hash*13`, masked to 11 bits, as every AFFS implementation
/// computes a case-insensitive hash-table bucket.
fn affs_hash(name: &[u8], ht_size: u32) -> u32 {
    let mut hash = name.len() as u32;
    for &c in name {
        hash = hash.wrapping_mul(13).wrapping_add(c.to_ascii_uppercase() as u32);
        hash &= 0x7ff;
    }
    hash % ht_size
}

struct Geometry {
    log_blocksize: u8,
    block_bytes: usize,
    /// `block_bytes/4 - 56`: both the hash-table size of a directory header
    /// and the data-block-table size of a file header.
    table_len: u32,
    name_off: usize,
    sectype_off: usize,
    extension_off: usize,
    parent_off: usize,
    hash_chain_off: usize,
    real_entry_off: usize,
    size_off: usize,
    date_off: usize,
}

impl Geometry {
    fn new(log_blocksize: u8, block_bytes: usize) -> Self {
        Self {
            log_blocksize,
            block_bytes,
            table_len: (block_bytes / 4) as u32 - 56,
            name_off: block_bytes - 80,
            sectype_off: block_bytes - 4,
            extension_off: block_bytes - 8,
            parent_off: block_bytes - 12,
            hash_chain_off: block_bytes - 16,
            real_entry_off: block_bytes - 32,
            size_off: block_bytes - 188,
            date_off: block_bytes - 92,
        }
    }

    fn block_to_sector(&self, block: u32) -> u64 {
        (block as u64) << self.log_blocksize
    }
}

pub struct AffsMount {
    geom: Geometry,
    root_block: u32,
    label: RefCell<Option<String>>,
}

#[derive(Clone)]
pub struct AffsNode {
    header_block: u32,
    is_dir: bool,
    size: u64,
    mtime: u64,
}

pub struct AffsOpenFile {
    node: AffsNode,
    offset: u64,
    size: u64,
    /// Header-block number for each table-index, filled in lazily and
    /// monotonically as the file is read.
    header_cache: Vec<Option<u32>>,
}

impl AffsMount {
    fn read_block(&self, core: &Core, disk: &mut Disk, block: u32, buf: &mut [u8]) -> Result<()> {
        core.read(disk, self.geom.block_to_sector(block), 0, self.geom.block_bytes, buf)
    }

    fn read_name(&self, block: &[u8]) -> String {
        let len = block[self.geom.name_off] as usize;
        let len = len.min(30);
        latin1::to_utf8(&block[self.geom.name_off + 1..self.geom.name_off + 1 + len])
    }

    fn node_from_header(&self, block_num: u32, block: &[u8]) -> Result<AffsNode> {
        if be32(block, 0) != T_HEADER {
            return Err(Error::BadFs);
        }
        let sectype = be32(block, self.geom.sectype_off);
        let is_dir = matches!(sectype, ST_USERDIR | ST_ROOT);
        let size = if is_dir { 0 } else { be32(block, self.geom.size_off) as u64 };
        let days = be32(block, self.geom.date_off) as u64;
        let mins = be32(block, self.geom.date_off + 4) as u64;
        let ticks = be32(block, self.geom.date_off + 8) as u64;
        let mtime = days * 86400 + mins * 60 + ticks / 50 + AMIGA_EPOCH_OFFSET;
        Ok(AffsNode { header_block: block_num, is_dir, size, mtime })
    }

    /// Follows hardlink headers (sec_type LINKFILE/LINKDIR) to the real
    /// header they point at, at most [`HARDLINK_NEST_MAX`] hops.
    fn resolve_hardlink(&self, core: &Core, disk: &mut Disk, mut block_num: u32, mut block: Vec<u8>) -> Result<(u32, Vec<u8>)> {
        let mut hops = 0;
        loop {
            let sectype = be32(&block, self.geom.sectype_off);
            if sectype != ST_LINKFILE && sectype != ST_LINKDIR {
                return Ok((block_num, block));
            }
            hops += 1;
            if hops > HARDLINK_NEST_MAX {
                return Err(Error::SymlinkLoop);
            }
            block_num = be32(&block, self.geom.real_entry_off);
            self.read_block(core, disk, block_num, &mut block)?;
        }
    }

    fn dir_lookup(&self, core: &Core, disk: &mut Disk, dir_block: u32, name: &str) -> Result<Option<(AffsNode, EntryInfo)>> {
        let mut block = vec![0u8; self.geom.block_bytes];
        self.read_block(core, disk, dir_block, &mut block)?;
        let ht_size = be32(&block, 12);
        let bucket = affs_hash(name.as_bytes(), ht_size);
        let mut ptr = be32(&block, 24 + bucket as usize * 4);

        let mut hops = 0u32;
        while ptr != 0 {
            hops += 1;
            if hops > HASH_CHAIN_SANITY_LIMIT {
                return Err(Error::BadFs);
            }
            let mut cand = vec![0u8; self.geom.block_bytes];
            self.read_block(core, disk, ptr, &mut cand)?;
            let cand_name = self.read_name(&cand);
            if cand_name.eq_ignore_ascii_case(name) {
                let (real_block, real_header) = self.resolve_hardlink(core, disk, ptr, cand)?;
                let node = self.node_from_header(real_block, &real_header)?;
                return Ok(Some((node.clone(), EntryInfo { is_dir: node.is_dir, mtime: node.mtime })));
            }
            ptr = be32(&cand, self.geom.hash_chain_off);
        }
        Ok(None)
    }
}

impl Format for AffsMount {
    type Node = AffsNode;

    fn root(&self) -> AffsNode {
        AffsNode { header_block: self.root_block, is_dir: true, size: 0, mtime: 0 }
    }

    fn lookup(&self, core: &Core, disk: &mut Disk, dir: &AffsNode, name: &str) -> Result<Option<(AffsNode, EntryInfo)>> {
        if !dir.is_dir {
            return Err(Error::BadFileType);
        }
        self.dir_lookup(core, disk, dir.header_block, name)
    }

    fn read_symlink(&self, core: &Core, disk: &mut Disk, node: &AffsNode) -> Result<Option<String>> {
        let mut block = vec![0u8; self.geom.block_bytes];
        self.read_block(core, disk, node.header_block, &mut block)?;
        if be32(&block, self.geom.sectype_off) != ST_SOFTLINK {
            return Ok(None);
        }
        let text_end = block[24..].iter().position(|&b| b == 0).map(|p| 24 + p).unwrap_or(block.len());
        let mut text = latin1::to_utf8(&block[24..text_end]);
        if text.starts_with(':') {
            text.replace_range(0..1, "/");
        }
        Ok(Some(text))
    }
}

struct AffsBlockSource<'a> {
    mount: &'a AffsMount,
    node: &'a AffsNode,
    header_cache: &'a mut Vec<Option<u32>>,
}

impl BlockSource for AffsBlockSource<'_> {
    fn logical_to_physical(&mut self, core: &Core, disk: &mut Disk, logical_block: u64) -> Result<Option<u64>> {
        let table_len = self.mount.geom.table_len as u64;
        let header_index = (logical_block / table_len) as usize;
        let slot_in_header = (logical_block % table_len) as u32;

        if self.header_cache.len() <= header_index {
            self.header_cache.resize(header_index + 1, None);
        }
        let header_block = match self.header_cache[header_index] {
            Some(b) => b,
            None => {
                let mut block_num = self.node.header_block;
                let mut block = vec![0u8; self.mount.geom.block_bytes];
                for _ in 0..header_index {
                    self.mount.read_block(core, disk, block_num, &mut block)?;
                    block_num = be32(&block, self.mount.geom.extension_off);
                    if block_num == 0 {
                        return Ok(None);
                    }
                }
                self.header_cache[header_index] = Some(block_num);
                block_num
            }
        };

        let mut block = vec![0u8; self.mount.geom.block_bytes];
        self.mount.read_block(core, disk, header_block, &mut block)?;
        let slot = self.mount.geom.table_len - 1 - slot_in_header;
        let ptr = be32(&block, 24 + slot as usize * 4);
        if ptr == 0 {
            Ok(None)
        } else {
            Ok(Some(self.mount.geom.block_to_sector(ptr)))
        }
    }
}

impl MountedFs for AffsMount {
    fn open(&self, core: &Core, disk: &mut Disk, path: &str) -> Result<Box<dyn Any>> {
        let (node, _) = find_file(self, core, disk, path)?;
        if node.is_dir {
            return Err(Error::BadFileType);
        }
        Ok(Box::new(AffsOpenFile { size: node.size, node, offset: 0, header_cache: Vec::new() }))
    }

    fn read(&self, core: &Core, disk: &mut Disk, file: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
        let file = file.downcast_mut::<AffsOpenFile>().ok_or(Error::BadArgument)?;
        let mut src = AffsBlockSource { mount: self, node: &file.node, header_cache: &mut file.header_cache };
        let n = read_range(core, disk, &mut src, 0, file.size, file.offset, buf)?;
        file.offset += n as u64;
        Ok(n)
    }

    fn size(&self, file: &dyn Any) -> u64 {
        file.downcast_ref::<AffsOpenFile>().map(|f| f.size).unwrap_or(0)
    }

    fn dir(&self, core: &Core, disk: &mut Disk, path: &str, visit: &mut dyn FnMut(&str, EntryInfo) -> bool) -> Result<()> {
        let (node, _) = if path.is_empty() || path == "/" {
            (self.root(), EntryInfo { is_dir: true, mtime: 0 })
        } else {
            find_file(self, core, disk, path)?
        };
        if !node.is_dir {
            return Err(Error::BadFileType);
        }
        let mut block = vec![0u8; self.geom.block_bytes];
        self.read_block(core, disk, node.header_block, &mut block)?;
        let ht_size = be32(&block, 12);
        for bucket in 0..ht_size {
            let mut ptr = be32(&block, 24 + bucket as usize * 4);
            while ptr != 0 {
                let mut cand = vec![0u8; self.geom.block_bytes];
                self.read_block(core, disk, ptr, &mut cand)?;
                let name = self.read_name(&cand);
                let (real_block, real_header) = self.resolve_hardlink(core, disk, ptr, cand.clone())?;
                let entry_node = self.node_from_header(real_block, &real_header)?;
                if visit(&name, EntryInfo { is_dir: entry_node.is_dir, mtime: entry_node.mtime }) {
                    return Ok(());
                }
                ptr = be32(&cand, self.geom.hash_chain_off);
            }
        }
        Ok(())
    }

    fn label(&self, core: &Core, disk: &mut Disk) -> Result<String> {
        if let Some(label) = self.label.borrow().as_ref() {
            return Ok(label.clone());
        }
        let mut block = vec![0u8; self.geom.block_bytes];
        self.read_block(core, disk, self.root_block, &mut block)?;
        let label = self.read_name(&block);
        *self.label.borrow_mut() = Some(label.clone());
        Ok(label)
    }

    fn mtime(&self, core: &Core, disk: &mut Disk) -> Result<u64> {
        let mut block = vec![0u8; self.geom.block_bytes];
        self.read_block(core, disk, self.root_block, &mut block)?;
        let node = self.node_from_header(self.root_block, &block)?;
        Ok(node.mtime)
    }
}

pub struct AffsDriver;

impl FsDriver for AffsDriver {
    fn name(&self) -> &'static str {
        "affs"
    }

    fn mount(&self, core: &Core, mut disk: Disk) -> std::result::Result<(Box<dyn MountedFs>, Disk), (Error, Disk)> {
        let mut boot = [0u8; 12];
        if let Err(e) = core.read(&mut disk, 0, 0, 12, &mut boot) {
            return Err((e, disk));
        }
        if &boot[0..3] != b"DOS" || boot[3] & 0x1 == 0 {
            return Err((Error::BadFs, disk));
        }
        let rootblock = be32(&boot, 8);

        for log_blocksize in 0u8..4 {
            let block_bytes = 512usize << log_blocksize;
            let root_sector = (rootblock as u64) << log_blocksize;
            let mut block = vec![0u8; block_bytes];
            if core.read(&mut disk, root_sector, 0, block_bytes, &mut block).is_err() {
                continue;
            }
            if be32(&block, 0) != T_HEADER {
                continue;
            }
            if be32(&block, block_bytes - 4) != ST_ROOT {
                continue;
            }
            if !checksum_is_zero(&block) {
                continue;
            }
            debug!("affs: accepted block size {block_bytes} bytes");
            let geom = Geometry::new(log_blocksize, block_bytes);
            let mount = AffsMount { geom, root_block: rootblock, label: RefCell::new(None) };
            return Ok((Box::new(mount), disk));
        }
        Err((Error::BadFs, disk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holycore_disk::{Backend, Core};

    /// Builds a 512-byte-block AFFS image in memory with a root directory
    /// containing one file.
    struct ImageBuilder {
        blocks: Vec<Vec<u8>>,
    }

    impl ImageBuilder {
        fn new(n: usize) -> Self {
            Self { blocks: vec![vec![0u8; 512]; n] }
        }

        fn set_be32(&mut self, block: usize, off: usize, v: u32) {
            self.blocks[block][off..off + 4].copy_from_slice(&v.to_be_bytes());
        }

        fn fix_checksum(&mut self, block: usize) {
            self.set_be32(block, 20, 0);
            let mut sum: u32 = 0;
            for chunk in self.blocks[block].chunks_exact(4) {
                sum = sum.wrapping_add(u32::from_be_bytes(chunk.try_into().unwrap()));
            }
            self.set_be32(block, 20, 0u32.wrapping_sub(sum));
        }

        fn into_bytes(self) -> Vec<u8> {
            self.blocks.into_iter().flatten().collect()
        }
    }

    fn build_image() -> Vec<u8> {
        let mut img = ImageBuilder::new(64);
        img.blocks[0][0..3].copy_from_slice(b"DOS");
        img.blocks[0][3] = 0x01; // FFS
        img.set_be32(0, 8, 1); // rootblock = 1 (block size 512 => sector 1)

        // Root block at block 1.
        img.set_be32(1, 0, T_HEADER);
        let ht_size = 512u32 / 4 - 56;
        img.set_be32(1, 12, ht_size);
        let hash = affs_hash(b"HELLO.TXT", ht_size);
        img.set_be32(1, 24 + hash as usize * 4, 2); // -> block 2
        // volume name "TEST" at BS-80
        img.blocks[1][512 - 80] = 4;
        img.blocks[1][512 - 79..512 - 79 + 4].copy_from_slice(b"TEST");
        img.set_be32(1, 512 - 4, ST_ROOT);
        img.fix_checksum(1);

        // File header at block 2: "hello.txt", contents "holy\n" (5 bytes)
        // stored at block 3.
        img.set_be32(2, 0, T_HEADER);
        img.set_be32(2, 24 + 71 * 4, 3); // last table slot (table_len=72) -> data block 3
        img.set_be32(2, 512 - 188, 5); // byte_size
        img.blocks[2][512 - 80] = 9;
        img.blocks[2][512 - 79..512 - 79 + 9].copy_from_slice(b"hello.txt");
        img.set_be32(2, 512 - 4, ST_FILE);
        img.fix_checksum(2);

        img.blocks[3][0..5].copy_from_slice(b"holy\n");

        img.into_bytes()
    }

    struct MemBackend {
        image: Vec<u8>,
    }

    impl Backend for MemBackend {
        fn dev_id(&self) -> u32 {
            1
        }
        fn open(&self, _name: &str, disk: &mut Disk) -> Result<()> {
            disk.log_sector_size = 9;
            disk.total_sectors = (self.image.len() / 512) as u64;
            disk.max_agglomerate = 32;
            Ok(())
        }
        fn read(&self, _core: &Core, _disk: &Disk, sector_hw: u64, count_hw: u32, buf: &mut [u8]) -> Result<()> {
            let start = sector_hw as usize * 512;
            buf.copy_from_slice(&self.image[start..start + count_hw as usize * 512]);
            Ok(())
        }
    }

    fn mount() -> (Core, Disk, Box<dyn MountedFs>) {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: build_image() }));
        let disk = core.open("mem").unwrap();
        let (_, mounted, disk) = AffsDriver.mount(&core, disk).map(|(m, d)| ("affs", m, d)).unwrap();
        (core, disk, mounted)
    }

    #[test]
    fn reads_hello_file() {
        let (core, mut disk, fs) = mount();
        let mut file = fs.open(&core, &mut disk, "hello.txt").unwrap();
        assert_eq!(fs.size(file.as_ref()), 5);
        let mut buf = [0u8; 5];
        let n = fs.read(&core, &mut disk, file.as_mut(), &mut buf).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"holy\n");
    }

    #[test]
    fn label_is_volume_name() {
        let (core, mut disk, fs) = mount();
        assert_eq!(fs.label(&core, &mut disk).unwrap(), "TEST");
    }

    #[test]
    fn missing_file_is_not_found() {
        let (core, mut disk, fs) = mount();
        let err = fs.open(&core, &mut disk, "nope.txt").unwrap_err();
        assert_eq!(err, Error::FileNotFound);
    }

    #[test]
    fn rejects_non_affs_image() {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: vec![0u8; 64 * 512] }));
        let disk = core.open("mem").unwrap();
        let err = AffsDriver.mount(&core, disk).unwrap_err().0;
        assert_eq!(err, Error::BadFs);
    }
}
