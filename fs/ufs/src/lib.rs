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

//! UFS1 / UFS2, read-only.
//!
//! Little-endian on-disk (the big-endian BSD build is not reproduced here
//! -- see DESIGN.md, same call as MINIX's dropped byte-swapped variant).
//! One driver handles both superblock generations: the magic number found
//! while probing `{128, 16, 0, 512}` (in 512-byte standard sectors)
//! selects UFS1 (32-bit block pointers, 128-byte inodes, 4 per fragment)
//! or UFS2 (64-bit pointers, 256-byte inodes, 2 per fragment).

use std::any::Any;

use holycore_disk::{Core, Disk};
use holycore_err::{Error, Result};
use holycore_fs::block_map::{read_range, BlockSource};
use holycore_fs::{find_file, latin1, EntryInfo, Format, FsDriver, MountedFs};
use log::debug;
use zerocopy::little_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, KnownLayout};

const UFS1_MAGIC: u32 = 0x11954;
const UFS2_MAGIC: u32 = 0x1954_0119;
const ROOT_INO: u32 = 2;

const ATTR_TYPE_MASK: u16 = 0o170000;
const ATTR_DIR: u16 = 0o040000;
const ATTR_LNK: u16 = 0o120000;

/// Candidates for the superblock location, in 512-byte standard sectors,
/// tried in this exact order. A read failure at any candidate (not just a
/// magic mismatch) aborts the whole probe -- faithfully reproduced from
/// the original mount loop, which does not retry past an I/O error.
const SBLOCK_CANDIDATES: [u64; 4] = [128, 16, 0, 512];

const SUPERBLOCK_SIZE: usize = 1376;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct Superblock {
    _unused0: [u8; 16],
    inoblk_offs: U32,
    _unused1: [u8; 4],
    cylg_offset: U32,
    cylg_mask: U32,
    mtime: U32,
    _unused2: [u8; 12],
    bsize: U32,
    _unused3: [u8; 48],
    /// "The size of filesystem blocks to disk blocks": shift applied to a
    /// fs-block number to get its absolute 512-byte standard sector.
    fsbtodb_shift: U32,
    _unused4: [u8; 40],
    uuidhi: U32,
    uuidlow: U32,
    _unused5: [u8; 32],
    ino_per_group: U32,
    frags_per_group: U32,
    _unused6: [u8; 488],
    volume_name: [u8; 32],
    _unused7: [u8; 360],
    mtime2: U64,
    _unused8: [u8; 292],
    magic: U32,
}

const _: () = assert!(std::mem::size_of::<Superblock>() == SUPERBLOCK_SIZE);

#[derive(Clone, Copy, PartialEq, Eq)]
enum Variant {
    V1,
    V2,
}

impl Variant {
    fn inode_size(self) -> u32 {
        match self {
            Variant::V1 => 128,
            Variant::V2 => 256,
        }
    }

    /// `UFS_INODE_PER_BLOCK`: how many inodes share one 512-byte fragment.
    fn inodes_per_sector(self) -> u32 {
        match self {
            Variant::V1 => 4,
            Variant::V2 => 2,
        }
    }

    fn ptr_bytes(self) -> u8 {
        match self {
            Variant::V1 => 4,
            Variant::V2 => 8,
        }
    }

    /// `LOG_INODE_BLKSZ`: log2 of the on-disk block-pointer width.
    fn log_ptr_bytes(self) -> u32 {
        match self {
            Variant::V1 => 2,
            Variant::V2 => 3,
        }
    }
}

struct Layout {
    variant: Variant,
    fsbtodb_shift: u32,
    /// log2 of `indirsz`: block pointers per indirect block.
    log_indirsz: u32,
    ino_per_group: u32,
    frags_per_group: u32,
    inoblk_offs: u32,
    cylg_offset: u32,
    cylg_mask: u32,
    uuidhi: u32,
    uuidlow: u32,
    volume_name: [u8; 32],
    mtime: u32,
    mtime2: u64,
}

impl Layout {
    fn indirsz(&self) -> u64 {
        1u64 << self.log_indirsz
    }

    /// Standard sector housing one inode, and the byte offset within it.
    fn inode_location(&self, ino: u32) -> (u64, u32) {
        let group = ino / self.ino_per_group;
        let grpino = ino % self.ino_per_group;
        let mut grpblk = group * self.frags_per_group;
        if self.variant == Variant::V1 {
            grpblk += self.cylg_offset * (group & !self.cylg_mask);
        }
        let ips = self.variant.inodes_per_sector();
        let base_sector = ((self.inoblk_offs + grpblk) as u64) << self.fsbtodb_shift;
        let sector = base_sector + (grpino / ips) as u64;
        let offset = (grpino % ips) * self.variant.inode_size();
        (sector, offset)
    }
}

struct Inode {
    is_dir: bool,
    is_symlink: bool,
    size: u64,
    nblocks: i64,
    /// 12 direct + 3 indirect (single/double/triple) fs-block numbers, or
    /// (when `nblocks == 0` and `size` is small enough) the raw bytes of
    /// an inline symlink target.
    ptrs: [u64; 15],
}

impl Inode {
    fn inline_bytes(&self, ptr_bytes: u8) -> Vec<u8> {
        let mut raw = Vec::with_capacity(15 * ptr_bytes as usize);
        for &p in &self.ptrs {
            if ptr_bytes == 4 {
                raw.extend_from_slice(&(p as u32).to_le_bytes());
            } else {
                raw.extend_from_slice(&p.to_le_bytes());
            }
        }
        raw
    }
}

pub struct UfsMount {
    layout: Layout,
}

#[derive(Clone, Copy)]
pub struct UfsNode {
    ino: u32,
}

pub struct UfsOpenFile {
    size: u64,
    ptrs: [u64; 15],
    offset: u64,
}

impl UfsMount {
    fn read_inode(&self, core: &Core, disk: &mut Disk, ino: u32) -> Result<Inode> {
        if ino == 0 {
            return Err(Error::BadFs);
        }
        let (sector, offset) = self.layout.inode_location(ino);
        let inode_size = self.layout.variant.inode_size() as usize;
        let mut buf = vec![0u8; inode_size];
        core.read(disk, sector, offset, inode_size, &mut buf)?;

        let (mode, size, nblocks, ptrs) = match self.layout.variant {
            Variant::V1 => {
                let mode = u16::from_le_bytes(buf[0..2].try_into().unwrap());
                let size = u64::from_le_bytes(buf[8..16].try_into().unwrap());
                let nblocks = u32::from_le_bytes(buf[104..108].try_into().unwrap()) as i64;
                let mut ptrs = [0u64; 15];
                for (i, p) in ptrs.iter_mut().enumerate() {
                    let off = 40 + i * 4;
                    *p = u32::from_le_bytes(buf[off..off + 4].try_into().unwrap()) as u64;
                }
                (mode, size, nblocks, ptrs)
            }
            Variant::V2 => {
                let mode = u16::from_le_bytes(buf[0..2].try_into().unwrap());
                let size = u64::from_le_bytes(buf[16..24].try_into().unwrap());
                let nblocks = i64::from_le_bytes(buf[24..32].try_into().unwrap());
                let mut ptrs = [0u64; 15];
                for (i, p) in ptrs.iter_mut().enumerate() {
                    let off = 112 + i * 8;
                    *p = u64::from_le_bytes(buf[off..off + 8].try_into().unwrap());
                }
                (mode, size, nblocks, ptrs)
            }
        };

        Ok(Inode {
            is_dir: mode & ATTR_TYPE_MASK == ATTR_DIR,
            is_symlink: mode & ATTR_TYPE_MASK == ATTR_LNK,
            size,
            nblocks,
            ptrs,
        })
    }

    fn iterate_dir(&self, core: &Core, disk: &mut Disk, dir: &Inode, visit: &mut dyn FnMut(&str, u32) -> bool) -> Result<()> {
        if !dir.is_dir {
            return Err(Error::BadFileType);
        }
        let mut src = UfsBlockSource { mount: self, ptrs: dir.ptrs };
        let mut buf = vec![0u8; dir.size as usize];
        read_range(core, disk, &mut src, self.layout.fsbtodb_shift, dir.size, 0, &mut buf)?;

        let mut pos = 0usize;
        while pos + 8 <= buf.len() {
            let ino = u32::from_le_bytes(buf[pos..pos + 4].try_into().unwrap());
            let direntlen = u16::from_le_bytes(buf[pos + 4..pos + 6].try_into().unwrap()) as usize;
            if direntlen == 0 {
                break;
            }
            let namelen = match self.layout.variant {
                Variant::V1 => u16::from_le_bytes(buf[pos + 6..pos + 8].try_into().unwrap()) as usize,
                Variant::V2 => buf[pos + 7] as usize,
            };
            if ino != 0 && pos + 8 + namelen <= buf.len() {
                let name = String::from_utf8_lossy(&buf[pos + 8..pos + 8 + namelen]);
                if visit(&name, ino) {
                    return Ok(());
                }
            }
            pos += direntlen;
        }
        Ok(())
    }

    fn dir_lookup(&self, core: &Core, disk: &mut Disk, dir_ino: u32, name: &str) -> Result<Option<(UfsNode, EntryInfo)>> {
        let dir = self.read_inode(core, disk, dir_ino)?;
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
                Ok(Some((UfsNode { ino }, EntryInfo { is_dir: child.is_dir, mtime: 0 })))
            }
        }
    }
}

impl Format for UfsMount {
    type Node = UfsNode;

    fn root(&self) -> UfsNode {
        UfsNode { ino: ROOT_INO }
    }

    fn lookup(&self, core: &Core, disk: &mut Disk, dir: &UfsNode, name: &str) -> Result<Option<(UfsNode, EntryInfo)>> {
        self.dir_lookup(core, disk, dir.ino, name)
    }

    fn read_symlink(&self, core: &Core, disk: &mut Disk, node: &UfsNode) -> Result<Option<String>> {
        let inode = self.read_inode(core, disk, node.ino)?;
        if !inode.is_symlink {
            return Ok(None);
        }
        let ptr_bytes = self.layout.variant.ptr_bytes();
        let inline_cap = 15u64 * ptr_bytes as u64;
        let text = if inode.nblocks == 0 && inode.size <= inline_cap {
            let raw = inode.inline_bytes(ptr_bytes);
            raw[..inode.size as usize].to_vec()
        } else {
            let mut src = UfsBlockSource { mount: self, ptrs: inode.ptrs };
            let mut buf = vec![0u8; inode.size as usize];
            read_range(core, disk, &mut src, self.layout.fsbtodb_shift, inode.size, 0, &mut buf)?;
            buf
        };
        Ok(Some(String::from_utf8_lossy(&text).into_owned()))
    }
}

/// Resolves a file's 12 direct + 3 indirect block pointers. The
/// triple-indirect bound is an explicit `blk < indirsz^3` check -- see
/// DESIGN.md's note on this choice; it rejects a quadruple indirect block
/// with `BadFs` instead of silently misreading one.
struct UfsBlockSource<'a> {
    mount: &'a UfsMount,
    ptrs: [u64; 15],
}

impl UfsBlockSource<'_> {
    fn resolve_indirect(&self, core: &Core, disk: &mut Disk, start_block: u64, indices: &[u64]) -> Result<Option<u64>> {
        let layout = &self.mount.layout;
        let ptr_bytes = layout.variant.ptr_bytes() as usize;
        let mut block = start_block;
        for &idx in indices {
            if block == 0 {
                return Ok(None);
            }
            let sector = block << layout.fsbtodb_shift;
            let mut entry = [0u8; 8];
            core.read(disk, sector, (idx as u64 * ptr_bytes as u64) as u32, ptr_bytes, &mut entry[..ptr_bytes])?;
            block = if ptr_bytes == 4 {
                u32::from_le_bytes(entry[0..4].try_into().unwrap()) as u64
            } else {
                u64::from_le_bytes(entry[0..8].try_into().unwrap())
            };
        }
        if block == 0 {
            Ok(None)
        } else {
            Ok(Some(block))
        }
    }
}

impl BlockSource for UfsBlockSource<'_> {
    fn logical_to_physical(&mut self, core: &Core, disk: &mut Disk, logical_block: u64) -> Result<Option<u64>> {
        let layout = &self.mount.layout;
        let shift = layout.fsbtodb_shift;
        let indirsz = layout.indirsz();

        let mut blk = logical_block;
        let fs_block = if blk < 12 {
            let b = self.ptrs[blk as usize];
            if b == 0 {
                None
            } else {
                Some(b)
            }
        } else {
            blk -= 12;
            if blk < indirsz {
                self.resolve_indirect(core, disk, self.ptrs[12], &[blk])?
            } else {
                blk -= indirsz;
                if blk < indirsz * indirsz {
                    self.resolve_indirect(core, disk, self.ptrs[13], &[blk / indirsz, blk % indirsz])?
                } else {
                    blk -= indirsz * indirsz;
                    if blk < indirsz * indirsz * indirsz {
                        self.resolve_indirect(
                            core,
                            disk,
                            self.ptrs[14],
                            &[blk / (indirsz * indirsz), (blk / indirsz) % indirsz, blk % indirsz],
                        )?
                    } else {
                        return Err(Error::BadFs);
                    }
                }
            }
        };
        Ok(fs_block.map(|b| b << shift))
    }
}

impl MountedFs for UfsMount {
    fn open(&self, core: &Core, disk: &mut Disk, path: &str) -> Result<Box<dyn Any>> {
        let (node, _) = find_file(self, core, disk, path)?;
        let inode = self.read_inode(core, disk, node.ino)?;
        if inode.is_dir {
            return Err(Error::BadFileType);
        }
        Ok(Box::new(UfsOpenFile { size: inode.size, ptrs: inode.ptrs, offset: 0 }))
    }

    fn read(&self, core: &Core, disk: &mut Disk, file: &mut dyn Any, buf: &mut [u8]) -> Result<usize> {
        let file = file.downcast_mut::<UfsOpenFile>().ok_or(Error::BadArgument)?;
        let mut src = UfsBlockSource { mount: self, ptrs: file.ptrs };
        let n = read_range(core, disk, &mut src, self.layout.fsbtodb_shift, file.size, file.offset, buf)?;
        file.offset += n as u64;
        Ok(n)
    }

    fn size(&self, file: &dyn Any) -> u64 {
        file.downcast_ref::<UfsOpenFile>().map(|f| f.size).unwrap_or(0)
    }

    fn dir(&self, core: &Core, disk: &mut Disk, path: &str, visit: &mut dyn FnMut(&str, EntryInfo) -> bool) -> Result<()> {
        let node = if path.is_empty() || path == "/" { self.root() } else { find_file(self, core, disk, path)?.0 };
        let inode = self.read_inode(core, disk, node.ino)?;
        self.iterate_dir(core, disk, &inode, &mut |name, ino| match self.read_inode(core, disk, ino) {
            Ok(entry) => visit(name, EntryInfo { is_dir: entry.is_dir, mtime: 0 }),
            Err(_) => false,
        })
    }

    fn label(&self, _core: &Core, _disk: &mut Disk) -> Result<String> {
        let end = self.layout.volume_name.iter().position(|&b| b == 0).unwrap_or(32);
        Ok(latin1::to_utf8(&self.layout.volume_name[..end]))
    }

    fn uuid(&self, _core: &Core, _disk: &mut Disk) -> Result<String> {
        if self.layout.uuidhi == 0 && self.layout.uuidlow == 0 {
            return Err(Error::NotImplemented);
        }
        Ok(format!("{:08x}{:08x}", self.layout.uuidhi, self.layout.uuidlow))
    }

    fn mtime(&self, _core: &Core, _disk: &mut Disk) -> Result<u64> {
        if self.layout.variant == Variant::V2 && self.layout.mtime2 > self.layout.mtime as u64 {
            Ok(self.layout.mtime2)
        } else {
            Ok(self.layout.mtime as u64)
        }
    }
}

pub struct UfsDriver;

impl FsDriver for UfsDriver {
    fn name(&self) -> &'static str {
        "ufs"
    }

    fn mount(&self, core: &Core, mut disk: Disk) -> std::result::Result<(Box<dyn MountedFs>, Disk), (Error, Disk)> {
        for &candidate in &SBLOCK_CANDIDATES {
            let mut buf = [0u8; SUPERBLOCK_SIZE];
            // A read failure here (including OutOfRange on a too-small
            // disk) aborts the whole probe rather than trying the next
            // candidate -- see SBLOCK_CANDIDATES's doc comment.
            if let Err(e) = core.read(&mut disk, candidate, 0, SUPERBLOCK_SIZE, &mut buf) {
                return Err((e, disk));
            }
            let sb = Superblock::read_from_bytes(&buf).unwrap();
            let magic = sb.magic.get();
            let variant = if magic == UFS1_MAGIC {
                Variant::V1
            } else if magic == UFS2_MAGIC {
                Variant::V2
            } else {
                continue;
            };
            let bsize = sb.bsize.get();
            if bsize == 0 || !bsize.is_power_of_two() || sb.ino_per_group.get() == 0 {
                continue;
            }
            let mut log2_bsize = 0u32;
            while (1u32 << log2_bsize) < bsize {
                log2_bsize += 1;
            }
            let layout = Layout {
                variant,
                fsbtodb_shift: sb.fsbtodb_shift.get(),
                log_indirsz: log2_bsize - variant.log_ptr_bytes(),
                ino_per_group: sb.ino_per_group.get(),
                frags_per_group: sb.frags_per_group.get(),
                inoblk_offs: sb.inoblk_offs.get(),
                cylg_offset: sb.cylg_offset.get(),
                cylg_mask: sb.cylg_mask.get(),
                uuidhi: sb.uuidhi.get(),
                uuidlow: sb.uuidlow.get(),
                volume_name: sb.volume_name,
                mtime: sb.mtime.get(),
                mtime2: sb.mtime2.get(),
            };
            debug!("ufs: accepted {} bit variant, block size {bsize} bytes", 8 * variant.ptr_bytes());
            let mount = UfsMount { layout };
            match mount.read_inode(core, &mut disk, ROOT_INO) {
                Ok(root) if root.is_dir => return Ok((Box::new(mount), disk)),
                Ok(_) => continue,
                Err(e) => return Err((e, disk)),
            }
        }
        Err((Error::BadFs, disk))
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

    fn set_le32(sectors: &mut [Vec<u8>], sector: usize, off: usize, v: u32) {
        sectors[sector][off..off + 4].copy_from_slice(&v.to_le_bytes());
    }
    fn set_le16(sectors: &mut [Vec<u8>], sector: usize, off: usize, v: u16) {
        sectors[sector][off..off + 2].copy_from_slice(&v.to_le_bytes());
    }
    fn set_le64(sectors: &mut [Vec<u8>], sector: usize, off: usize, v: u64) {
        sectors[sector][off..off + 8].copy_from_slice(&v.to_le_bytes());
    }

    /// UFS2 image: bsize=2048 (fsbtodb_shift=2), ino_per_group=64, all
    /// inodes in group 0, inode table starting at fs block 4 (sector 16).
    /// Layout: root(ino 2) -> {"etc"(4,dir), "a"(3,file)}; etc -> {"link"
    /// (5, inline symlink to "/a")}; a's contents are "xyz".
    fn build_image() -> Vec<u8> {
        const N: usize = 300;
        let mut sectors: Vec<Vec<u8>> = vec![vec![0u8; 512]; N];

        // Superblock at sector 16.
        set_le32(&mut sectors, 16, 16, 4); // inoblk_offs = fs block 4
        set_le32(&mut sectors, 16, 48, 2048); // bsize
        set_le32(&mut sectors, 16, 100, 2); // fsbtodb_shift (2048/512=4=2^2)
        set_le32(&mut sectors, 16, 184, 64); // ino_per_group
        set_le32(&mut sectors, 16, 188, 64); // frags_per_group
        sectors[16][680..680 + 4].copy_from_slice(b"TEST");
        set_le32(&mut sectors, 16, 1372, UFS2_MAGIC);

        // Root inode (ino=2): sector 17 offset 0, dir, size=20 (2
        // entries), dir_blocks[0]=5.
        set_le16(&mut sectors, 17, 0, ATTR_DIR | 0o755);
        set_le64(&mut sectors, 17, 16, 20); // size
        set_le64(&mut sectors, 17, 24, 0); // nblocks
        set_le64(&mut sectors, 17, 112, 5); // blocks[0] = fs block 5

        // Inode "a" (ino=3): sector 17 offset 256, regular file, size=3,
        // dir_blocks[0]=7.
        set_le16(&mut sectors, 17, 256, 0o100644);
        set_le64(&mut sectors, 17, 256 + 16, 3);
        set_le64(&mut sectors, 17, 256 + 24, 1);
        set_le64(&mut sectors, 17, 256 + 112, 7);

        // Inode "etc" (ino=4): sector 18 offset 0, dir, size=12,
        // dir_blocks[0]=6.
        set_le16(&mut sectors, 18, 0, ATTR_DIR | 0o755);
        set_le64(&mut sectors, 18, 16, 12);
        set_le64(&mut sectors, 18, 24, 0);
        set_le64(&mut sectors, 18, 112, 6);

        // Inode "link" (ino=5): sector 18 offset 256, symlink, size=2
        // ("/a"), nblocks=0 -> inline, stored in blocks[0..2].
        set_le16(&mut sectors, 18, 256, ATTR_LNK | 0o777);
        set_le64(&mut sectors, 18, 256 + 16, 2);
        set_le64(&mut sectors, 18, 256 + 24, 0);
        sectors[18][256 + 112] = b'/';
        sectors[18][256 + 113] = b'a';

        // Root dir data, fs block 5 = sector 20: "etc"(ino 4), "a"(ino 3).
        // UFS2 dirent: ino(4) direntlen(2) filetype(1) namelen(1) name.
        set_le32(&mut sectors, 20, 0, 4);
        set_le16(&mut sectors, 20, 4, 11);
        sectors[20][6] = 2; // filetype: dir
        sectors[20][7] = 3; // namelen
        sectors[20][8..11].copy_from_slice(b"etc");

        set_le32(&mut sectors, 20, 11, 3);
        set_le16(&mut sectors, 20, 15, 9);
        sectors[20][17] = 1; // filetype: file
        sectors[20][18] = 1; // namelen
        sectors[20][19] = b'a';

        // etc dir data, fs block 6 = sector 24: "link"(ino 5).
        set_le32(&mut sectors, 24, 0, 5);
        set_le16(&mut sectors, 24, 4, 12);
        sectors[24][6] = 7; // filetype: symlink
        sectors[24][7] = 4;
        sectors[24][8..12].copy_from_slice(b"link");

        // "a" file data, fs block 7 = sector 28: "xyz".
        sectors[28][0..3].copy_from_slice(b"xyz");

        sectors.into_iter().flatten().collect()
    }

    fn mount() -> (Core, Disk, Box<dyn MountedFs>) {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: build_image() }));
        let disk = core.open("mem").unwrap();
        let (mounted, disk) = UfsDriver.mount(&core, disk).unwrap();
        (core, disk, mounted)
    }

    #[test]
    fn reads_file_through_direct_block() {
        let (core, mut disk, fs) = mount();
        let mut file = fs.open(&core, &mut disk, "/a").unwrap();
        assert_eq!(fs.size(file.as_ref()), 3);
        let mut buf = [0u8; 3];
        let n = fs.read(&core, &mut disk, file.as_mut(), &mut buf).unwrap();
        assert_eq!(n, 3);
        assert_eq!(&buf, b"xyz");
    }

    #[test]
    fn resolves_inline_symlink_to_sibling_directory() {
        let (core, mut disk, fs) = mount();
        let mut file = fs.open(&core, &mut disk, "/etc/link").unwrap();
        assert_eq!(fs.size(file.as_ref()), 3);
        let mut buf = [0u8; 3];
        let n = fs.read(&core, &mut disk, file.as_mut(), &mut buf).unwrap();
        assert_eq!(&buf[..n], b"xyz");
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
        seen.sort();
        assert_eq!(seen, vec![("a".to_string(), false), ("etc".to_string(), true)]);
    }

    #[test]
    fn label_is_volume_name() {
        let (core, mut disk, fs) = mount();
        assert_eq!(fs.label(&core, &mut disk).unwrap(), "TEST");
    }

    #[test]
    fn rejects_non_ufs_image() {
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image: vec![0u8; 300 * 512] }));
        let disk = core.open("mem").unwrap();
        let err = UfsDriver.mount(&core, disk).unwrap_err().0;
        assert_eq!(err, Error::BadFs);
    }
}
