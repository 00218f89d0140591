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

//! MINIX v1/v2/v3, read-only.
//!
//! Little-endian on-disk (the byte-swapped big-endian build the original
//! supports is not reproduced here -- see DESIGN.md). The superblock's
//! magic number selects the variant, which in turn selects inode size,
//! on-disk zone-pointer width, directory name length and whether a third
//! (triple) indirection level is available.

use std::any::Any;

use holycore_disk::{Core, Disk};
use holycore_err::{Error, Result};
use holycore_fs::block_map::{read_range, BlockSource};
use holycore_fs::{find_file, EntryInfo, Format, FsDriver, MountedFs};
use log::debug;
use zerocopy::little_endian::{U16, U32};
use zerocopy::{FromBytes, Immutable, KnownLayout};

/// Byte offset of the superblock: block 0 is the boot block, block 1 (at
/// the standard 1024-byte block size every variant's superblock is read
/// at, before the real block size is even known) holds the superblock
/// itself, so the inode table -- "block 2 + imap + zmap" below -- lines up
/// with imap/zmap starting right after it.
const SUPERBLOCK_OFFSET: u64 = 1024;

const MAGIC_V1_14: u16 = 0x137F;
const MAGIC_V1_30: u16 = 0x138F;
const MAGIC_V2_14: u16 = 0x2468;
const MAGIC_V2_30: u16 = 0x2478;
const MAGIC_V3: u16 = 0x4D5A;

const S_IFMT: u16 = 0o170000;
const S_IFDIR: u16 = 0o040000;
const S_IFLNK: u16 = 0o120000;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct SuperblockV1V2 {
    ninodes: U16,
    nzones: U16,
    imap_blocks: U16,
    zmap_blocks: U16,
    firstdatazone: U16,
    log_zone_size: U16,
    max_size: U32,
    magic: U16,
    state: U16,
    zones: U32,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct SuperblockV3 {
    ninodes: U32,
    _pad0: U16,
    imap_blocks: U16,
    zmap_blocks: U16,
    firstdatazone: U16,
    log_zone_size: U16,
    _pad1: U16,
    max_size: U32,
    zones: U32,
    magic: U16,
    _pad2: U16,
    blocksize: U16,
    disk_version: u8,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
struct InodeV1 {
    mode: U16,
    uid: U16,
    size: U32,
    time: U32,
    gid: u8,
    nlinks: u8,
    zone: [U16; 9],
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
struct InodeV2 {
    mode: U16,
    nlinks: U16,
    uid: U16,
    gid: U16,
    size: U32,
    atime: U32,
    mtime: U32,
    ctime: U32,
    zone: [U32; 10],
}

#[derive(Clone, Copy)]
enum Variant {
    V1,
    V2,
    V3,
}

struct Layout {
    variant: Variant,
    block_size: u32,
    log_zone_size: u8,
    zone_ptr_bytes: u8,
    name_len: usize,
    ino_bytes: u8,
    inode_size: u32,
    num_zone_slots: u8,
    imap_blocks: u32,
    zmap_blocks: u32,
}

impl Layout {
    fn inode_table_block(&self) -> u64 {
        2 + self.imap_blocks as u64 + self.zmap_blocks as u64
    }

    fn inodes_per_block(&self) -> u32 {
        self.block_size / self.inode_size
    }

    fn sectors_per_block(&self) -> u64 {
        self.block_size as u64 / 512
    }

    fn ptrs_per_block(&self) -> u64 {
        self.block_size as u64 / self.zone_ptr_bytes as u64
    }
}

fn zone_from(buf: &[u8], idx: usize, ptr_bytes: u8) -> u32 {
    let off = idx * ptr_bytes as usize;
    if ptr_bytes == 2 {
        u16::from_le_bytes(buf[off..off + 2].try_into().unwrap()) as u32
    } else {
        u32::from_le_bytes(buf[off..off + 4].try_into().unwrap())
    }
}

#[derive(Clone, Copy)]
struct Zones {
    slots: [u32; 10],
    count: u8,
}

pub struct MinixMount {
    layout: Layout,
}

/// A path-walk reference to an inode. Lightweight on purpose: `Format::root`
/// has no disk access, so it cannot resolve mode/size/zones up front the way
/// `read_inode` does. Every method that needs those re-resolves via
/// `read_inode` instead of trusting stale fields cached on the node.
#[derive(Clone, Copy)]
pub struct MinixNode {
    ino: u32,
}

/// The fully resolved contents of one inode, fetched fresh whenever a
/// directory listing, open, or symlink read needs mode/size/zone data.
struct Inode {
    is_dir: bool,
    is_symlink: bool,
    size: u64,
    mtime: u64,
    zones: Zones,
}

pub struct MinixOpenFile {
    size: u64,
    zones: Zones,
    offset: u64,
}

impl MinixMount {
    fn read_block(&self, core: &Core, disk: &mut Disk, block: u64, buf: &mut [u8]) -> Result<()> {
        core.read(disk, block * self.layout.sectors_per_block(), 0, buf.len(), buf)
    }

    fn read_inode(&self, core: &Core, disk: &mut Disk, ino: u32) -> Result<Inode> {
        if ino == 0 {
            return Err(Error::BadFs);
        }
        let idx = ino - 1;
        let block = self.layout.inode_table_block() + (idx / self.layout.inodes_per_block()) as u64;
        let off_in_block = (idx % self.layout.inodes_per_block()) * self.layout.inode_size;
        let mut block_buf = vec![0u8; self.layout.block_size as usize];
        self.read_block(core, disk, block, &mut block_buf)?;
        let rec = &block_buf[off_in_block as usize..off_in_block as usize + self.layout.inode_size as usize];

        let (mode, size, mtime, zones) = match self.layout.variant {
            Variant::V1 => {
                let inode = InodeV1::read_from_bytes(rec).map_err(|_| Error::BadFs)?;
                let mut slots = [0u32; 10];
                for (i, z) in inode.zone.iter().enumerate() {
                    slots[i] = z.get() as u32;
                }
                (inode.mode.get(), inode.size.get() as u64, inode.time.get() as u64, Zones { slots, count: 9 })
            }
            Variant::V2 | Variant::V3 => {
                let inode = InodeV2::read_from_bytes(rec).map_err(|_| Error::BadFs)?;
                let mut slots = [0u32; 10];
                for (i, z) in inode.zone.iter().enumerate() {
                    slots[i] = z.get();
                }
                (inode.mode.get(), inode.size.get() as u64, inode.mtime.get() as u64, Zones { slots, count: 10 })
            }
        };

        Ok(Inode {
            is_dir: mode & S_IFMT == S_IFDIR,
            is_symlink: mode & S_IFMT == S_IFLNK,
            size,
            mtime,
            zones,
        })
    }

    fn dirent_size(&self) -> usize {
        self.layout.ino_bytes as usize + self.layout.name_len
    }

    fn dir_lookup(&self, core: &Core, disk: &mut Disk, dir_ino: u32, name: &str) -> Result<Option<(MinixNode, EntryInfo)>> {
        let dir = self.read_inode(core, disk, dir_ino)?;
        if !dir.is_dir {
            return Err(Error::BadFileType);
        }
        let mut found = None;
        self.iterate_dir(core, disk, &dir, &mut |entry_name, ino| {
            if entry_name == name {
                found = Some(ino);
                true
            } else {
                false
            }
        })?;
        match found {
            None => Ok(None),
            Some(ino) => {
                let child = self.read_inode(core, disk, ino)?;
                Ok(Some((MinixNode { ino }, EntryInfo { is_dir: child.is_dir, mtime: child.mtime })))
            }
        }
    }

    /// Streams the directory's data blocks and invokes `visit(name, ino)`
    /// for every non-free entry; stops early when `visit` returns `true`.
    fn iterate_dir(&self, core: &Core, disk: &mut Disk, dir: &Inode, visit: &mut dyn FnMut(&str, u32) -> bool) -> Result<()> {
        let mut src = MinixBlockSource { mount: self, zones: dir.zones };
        let mut buf = vec![0u8; dir.size as usize];
        read_range(core, disk, &mut src, self.layout.log_zone_size as u32, dir.size, 0, &mut buf)?;

        let rec_len = self.dirent_size();
        for chunk in buf.chunks_exact(rec_len) {
            let ino = if self.layout.ino_bytes == 2 {
                u16::from_le_bytes(chunk[0..2].try_into().unwrap()) as u32
            } else {
                u32::from_le_bytes(chunk[0..4].try_into().unwrap())
            };
            if ino == 0 {
                continue;
            }
            let name_bytes = &chunk[self.layout.ino_bytes as usize..];
            let end = name_bytes.iter().position(|&b| b == 0).unwrap_or(name_bytes.len());
            let name = String::from_utf8_lossy(&name_bytes[..end]);
            if visit(&name, ino) {
                return Ok(());
            }
        }
        Ok(())
    }
}

impl Format for MinixMount {
    type Node = MinixNode;

    fn root(&self) -> MinixNode {
        MinixNode { ino: 1 }
    }

    fn lookup(&self, core: &Core, disk: &mut Disk, dir: &MinixNode, name: &str) -> Result<Option<(MinixNode, EntryInfo)>> {
        self.dir_lookup(core, disk, dir.ino, name)
    }

    fn read_symlink(&self, core: &Core, disk: &mut Disk, node: &MinixNode) -> Result<Option<String>> {
        let inode = self.read_inode(core, disk, node.ino)?;
        if !inode.is_symlink {
            return Ok(None);
        }
        let mut src = MinixBlockSource { mount: self, zones: inode.zones };
        let mut buf = vec![0u8; inode.size as usize];
        read_range(core, disk, &mut src, self.layout.log_zone_size as u32, inode.size, 0, &mut buf)?;
        Ok(Some(String::from_utf8_lossy(&buf).into_owned()))
    }
}

struct MinixBlockSource<'a> {
    mount: &'a MinixMount,
    zones: Zones,
}

impl MinixBlockSource<'_> {
    fn resolve_indirect(&self, core: &Core, disk: &mut Disk, start_zone: u32, indices: &[u64]) -> Result<Option<u32>> {
        let mut zone = start_zone;
        for &idx in indices {
            if zone == 0 {
                return Ok(None);
            }
            let phys_block = (zone as u64) << self.mount.layout.log_zone_size;
            let mut buf = vec![0u8; self.mount.layout.block_size as usize];
            self.mount.read_block(core, disk, phys_block, &mut buf)?;
            zone = zone_from(&buf, idx as usize, self.mount.layout.zone_ptr_bytes);
        }
        if zone == 0 {
            Ok(None)
        } else {
            Ok(Some(zone))
        }
    }
}

impl BlockSource for MinixBlockSource<'_> {
    fn logical_to_physical(&mut self, core: &Core, disk: &mut Disk, logical_block: u64) -> Result<Option<u64>> {
        let log_zone_size = self.mount.layout.log_zone_size as u32;
        let zone_index = logical_block >> log_zone_size;
        let block_in_zone = logical_block & ((1u64 << log_zone_size) - 1);
        let ptrs = self.mount.layout.ptrs_per_block();

        let zone = if zone_index < 7 {
            let z = self.zones.slots[zone_index as usize];
            if z == 0 {
                None
            } else {
                Some(z)
            }
        } else if zone_index < 7 + ptrs {
            self.resolve_indirect(core, disk, self.zones.slots[7], &[zone_index - 7])?
        } else if zone_index < 7 + ptrs + ptrs * ptrs {
            let rem = zone_index - 7 - ptrs;
            self.resolve_indirect(core, disk, self.zones.slots[8], &[rem / ptrs, rem % ptrs])?
        } else if self.zones.count == 10 && zone_index < 7 + ptrs + ptrs * ptrs + ptrs * ptrs * ptrs {
            let rem = zone_index - 7 - ptrs - ptrs * ptrs;
            self.resolve_indirect(core, disk, self.zones.slots[9], &[rem / (ptrs * ptrs), (rem / ptrs) % ptrs, rem % ptrs])?
        } else {
            None
        };

        Ok(zone.map(|z| {
            let phys_block = ((z as u64) << log_zone_size) + block_in_zone;
            phys_block * self.mount.layout.sectors_per_block()
        }))
    }
}

impl MountedFs for MinixMount {
    fn open(&self, core: &Core, disk: &mut Disk, path: &str) -> Result<Box<dyn Any>> {
        let (node, _) = find_file(self, core, disk, path)?;
        let inode = self.read_inode(core, disk, node.ino)?;
        if inode.is_dir {
            return Err(Error::BadFileType);
        }
        Ok(Box::new(MinixOpenFile { size: inode.size, zones: inode.zones, offset: 0 }))
    }

    fn read(&self, core: &Core, disk: &mut Disk, file: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
        let file = file.downcast_mut::<MinixOpenFile>().ok_or(Error::BadArgument)?;
        let mut src = MinixBlockSource { mount: self, zones: file.zones };
        let n = read_range(core, disk, &mut src, self.layout.log_zone_size as u32, file.size, file.offset, buf)?;
        file.offset += n as u64;
        Ok(n)
    }

    fn size(&self, file: &dyn Any) -> u64 {
        file.downcast_ref::<MinixOpenFile>().map(|f| f.size).unwrap_or(0)
    }

    fn dir(&self, core: &Core, disk: &mut Disk, path: &str, visit: &mut dyn FnMut(&str, EntryInfo) -> bool) -> Result<()> {
        let node = if path.is_empty() || path == "/" { self.root() } else { find_file(self, core, disk, path)?.0 };
        let inode = self.read_inode(core, disk, node.ino)?;
        if !inode.is_dir {
            return Err(Error::BadFileType);
        }
        self.iterate_dir(core, disk, &inode, &mut |name, ino| match self.read_inode(core, disk, ino) {
            Ok(entry) => visit(name, EntryInfo { is_dir: entry.is_dir, mtime: entry.mtime }),
            Err(_) => false,
        })
    }

    fn mtime(&self, core: &Core, disk: &mut Disk) -> Result<u64> {
        Ok(self.read_inode(core, disk, 1)?.mtime)
    }
}

pub struct MinixDriver;

impl FsDriver for MinixDriver {
    fn name(&self) -> &'static str {
        "minix"
    }

    fn mount(&self, core: &Core, mut disk: Disk) -> std::result::Result<(Box<dyn MountedFs>, Disk), (Error, Disk)> {
        let sector = SUPERBLOCK_OFFSET / 512;
        let offset = (SUPERBLOCK_OFFSET % 512) as u32;
        let mut buf = [0u8; 32];
        if let Err(e) = core.read(&mut disk, sector, offset, 32, &mut buf) {
            return Err((e, disk));
        }

        let magic_v1v2 = u16::from_le_bytes(buf[16..18].try_into().unwrap());
        let magic_v3 = u16::from_le_bytes(buf[24..26].try_into().unwrap());

        let layout = if matches!(magic_v1v2, MAGIC_V1_14 | MAGIC_V1_30) {
            let sb = SuperblockV1V2::read_from_bytes(&buf[..24]).unwrap();
            Layout {
                variant: Variant::V1,
                block_size: 1024,
                log_zone_size: sb.log_zone_size.get() as u8,
                zone_ptr_bytes: 2,
                name_len: if magic_v1v2 == MAGIC_V1_30 { 30 } else { 14 },
                ino_bytes: 2,
                inode_size: 32,
                num_zone_slots: 9,
                imap_blocks: sb.imap_blocks.get() as u32,
                zmap_blocks: sb.zmap_blocks.get() as u32,
            }
        } else if matches!(magic_v1v2, MAGIC_V2_14 | MAGIC_V2_30) {
            let sb = SuperblockV1V2::read_from_bytes(&buf[..24]).unwrap();
            Layout {
                variant: Variant::V2,
                block_size: 1024,
                log_zone_size: sb.log_zone_size.get() as u8,
                zone_ptr_bytes: 4,
                name_len: if magic_v1v2 == MAGIC_V2_30 { 30 } else { 14 },
                ino_bytes: 2,
                inode_size: 64,
                num_zone_slots: 10,
                imap_blocks: sb.imap_blocks.get() as u32,
                zmap_blocks: sb.zmap_blocks.get() as u32,
            }
        } else if magic_v3 == MAGIC_V3 {
            let sb = SuperblockV3::read_from_bytes(&buf[..31]).unwrap();
            let block_size = sb.blocksize.get() as u32;
            if !block_size.is_power_of_two() || !(512..=16384).contains(&block_size) {
                return Err((Error::BadFs, disk));
            }
            if sb.log_zone_size.get() >= 20 {
                return Err((Error::BadFs, disk));
            }
            Layout {
                variant: Variant::V3,
                block_size,
                log_zone_size: sb.log_zone_size.get() as u8,
                zone_ptr_bytes: 4,
                name_len: 60,
                ino_bytes: 4,
                inode_size: 64,
                num_zone_slots: 10,
                imap_blocks: sb.imap_blocks.get() as u32,
                zmap_blocks: sb.zmap_blocks.get() as u32,
            }
        } else {
            return Err((Error::BadFs, disk));
        };

        debug!("minix: mounted variant with block size {}", layout.block_size);
        let mount = MinixMount { layout };
        match mount.read_inode(core, &mut disk, 1) {
            Ok(root) if root.is_dir => Ok((Box::new(mount), disk)),
            Ok(_) => Err((Error::BadFs, disk)),
            Err(e) => Err((e, disk)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use holycore_disk::{Backend, Core};

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

    fn write_le16(buf: &mut [u8], off: usize, v: u16) {
        buf[off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn write_le32(buf: &mut [u8], off: usize, v: u32) {
        buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
    }

    /// Minimal MINIX3 1 KiB-block image: block 0 boot, block 1 superblock,
    /// block 2 imap, block 3 zmap, inode table at block 4, root dir data
    /// at block 5, one file "hello" reaching a single byte 0x42 through
    /// triple indirection.
    fn build_image() -> Vec<u8> {
        const BS: usize = 1024;
        let mut blocks: Vec<Vec<u8>> = vec![vec![0u8; BS]; 4096];

        let sb = &mut blocks[1];
        write_le32(sb, 0, 64); // ninodes
        write_le16(sb, 6, 1); // imap_blocks
        write_le16(sb, 8, 1); // zmap_blocks
        write_le16(sb, 12, 0); // log_zone_size
        write_le32(sb, 20, 1); // zones
        write_le16(sb, 24, MAGIC_V3);
        write_le16(sb, 28, BS as u16); // blocksize

        // InodeV2 layout: mode@0, nlinks@2, uid@4, gid@6, size@8, atime@12,
        // mtime@16, ctime@20, zone[10]@24 (4 bytes each).
        const PTRS: u64 = (BS / 4) as u64; // zone pointers per indirect block
        let triple_zone_index = 7 + PTRS + PTRS * PTRS; // first triple-indirect slot
        let target_off = triple_zone_index * BS as u64;

        // Root inode (#1) at inode table block 4, inode size 64, entry 0.
        {
            let inode = &mut blocks[4][0..64];
            write_le16(inode, 0, S_IFDIR | 0o755);
            write_le32(inode, 8, 64); // size: one 64-byte (4-byte ino + 60-byte name) dirent
            write_le32(inode, 24, 5); // zone[0] = block 5 (root dir data)
        }
        // File inode (#2) for "hello", reaching into triple indirection.
        {
            let inode = &mut blocks[4][64..128];
            write_le16(inode, 0, 0o100000 | 0o644);
            write_le32(inode, 8, target_off as u32 + 1024);
            write_le32(inode, 24 + 9 * 4, 6); // zone[9] = triple-indirect block 6
        }

        // Triple-indirect block (6): entry 0 -> double-indirect block 7.
        write_le32(&mut blocks[6], 0, 7);
        // Double-indirect block (7): entry 0 -> single-indirect block 8.
        write_le32(&mut blocks[7], 0, 8);
        // Single-indirect block (8): entry 0 -> data block 9.
        write_le32(&mut blocks[8], 0, 9);
        // Data block 9, byte 0 = 0x42: the first byte resolved through
        // triple indirection.
        blocks[9][0] = 0x42;

        // Root directory entry: ino=2, name="hello" (60-byte name field).
        {
            let dir = &mut blocks[5][0..32];
            write_le32(dir, 0, 2);
            dir[4..9].copy_from_slice(b"hello");
        }

        blocks.into_iter().flatten().collect()
    }

    fn mount() -> (Core, Disk, Box<dyn MountedFs>) {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: build_image() }));
        let disk = core.open("mem").unwrap();
        let (mounted, disk) = MinixDriver.mount(&core, disk).unwrap();
        (core, disk, mounted)
    }

    #[test]
    fn lists_root_directory() {
        let (core, mut disk, fs) = mount();
        let mut seen = Vec::new();
        fs.dir(&core, &mut disk, "/", &mut |name, info| {
            seen.push((name.to_string(), info.is_dir));
            false
        })
        .unwrap();
        assert_eq!(seen, vec![("hello".to_string(), false)]);
    }

    #[test]
    fn triple_indirect_byte_reads_back() {
        const BS: u64 = 1024;
        const PTRS: u64 = BS / 4;
        let target_off = (7 + PTRS + PTRS * PTRS) * BS;

        let (core, mut disk, fs) = mount();
        let mut file = fs.open(&core, &mut disk, "/hello").unwrap();
        file.downcast_mut::<MinixOpenFile>().unwrap().offset = target_off;

        let mut buf = [0u8; 4];
        let n = fs.read(&core, &mut disk, file.as_mut(), &mut buf).unwrap();
        assert_eq!(n, 4);
        assert_eq!(buf[0], 0x42);
        assert_eq!(buf[1], 0);
    }

    #[test]
    fn rejects_non_minix_image() {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: vec![0u8; 4096 * 1024] }));
        let disk = core.open("mem").unwrap();
        let err = MinixDriver.mount(&core, disk).unwrap_err().0;
        assert_eq!(err, Error::BadFs);
    }
}
