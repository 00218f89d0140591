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

//! Common block-mapping helper shared by every format driver: given a
//! per-driver `logical_block -> physical block` callback,
//! stream a byte range out of a file with the minimum number of `disk_read`
//! calls, merging contiguous physical runs and zero-filling holes.

use holycore_disk::{Core, Disk};
use holycore_err::Result;

/// Per-driver seam: resolves one logical block of an open file to a
/// physical block number (in standard 512-byte-sector units), or `None` for
/// a hole. Implementations typically hold the open file's node and any
/// per-open cache (e.g. AFFS's table-index -> block-number array) by
/// `&mut` borrow for the duration of one `read_range` call.
pub trait BlockSource {
    fn logical_to_physical(&mut self, core: &Core, disk: &mut Disk, logical_block: u64) -> Result<Option<u64>>;
}

/// Reads up to `buf.len()` bytes starting at `offset` into a file of
/// `file_size` bytes whose blocks are `1 << log_block_size` standard
/// sectors each. Returns the number of bytes produced, clamped to the file
/// end. Consecutive logical blocks that map to consecutive physical blocks
/// are agglomerated into a single `Core::read` call.
pub fn read_range(
    core: &Core,
    disk: &mut Disk,
    src: &mut dyn BlockSource,
    log_block_size: u32,
    file_size: u64,
    offset: u64,
    buf: &mut [u8],
) -> Result<usize> {
    let block_bytes: u64 = 512u64 << log_block_size;
    let end = offset.saturating_add(buf.len() as u64).min(file_size);
    if offset >= end {
        return Ok(0);
    }

    // A run is a span of physical bytes, contiguous in both source address
    // and destination buffer offset, not yet flushed to `core.read`.
    let mut run: Option<(u64, u64, usize)> = None;
    macro_rules! flush {
        () => {
            if let Some((start_byte, len, dest)) = run.take() {
                let sector = start_byte / 512;
                let sector_off = (start_byte % 512) as u32;
                core.read(disk, sector, sector_off, len as usize, &mut buf[dest..dest + len as usize])?;
            }
        };
    }

    let mut pos = offset;
    let mut produced = 0usize;
    while pos < end {
        let logical_block = pos / block_bytes;
        let block_off = pos % block_bytes;
        let take = ((block_bytes - block_off).min(end - pos)) as usize;
        let dest = produced;

        match src.logical_to_physical(core, disk, logical_block)? {
            None => {
                flush!();
                for b in &mut buf[dest..dest + take] {
                    *b = 0;
                }
            }
            Some(phys_block) => {
                let phys_byte = phys_block * 512 + block_off;
                match run {
                    Some((run_start, run_len, run_dest)) if run_start + run_len == phys_byte && run_dest + run_len as usize == dest => {
                        run = Some((run_start, run_len + take as u64, run_dest));
                    }
                    _ => {
                        flush!();
                        run = Some((phys_byte, take as u64, dest));
                    }
                }
            }
        }
        pos += take as u64;
        produced += take;
    }
    flush!();
    Ok(produced)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    struct MemBackend {
        image: Vec<u8>,
    }

    impl holycore_disk::Backend for MemBackend {
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
            let len = count_hw as usize * 512;
            buf.copy_from_slice(&self.image[start..start + len]);
            Ok(())
        }
    }

    /// Maps every logical block `n` to physical block `n + 10` except
    /// logical block 2, which is a hole.
    struct Shifted {
        calls: RefCell<u32>,
    }

    impl BlockSource for Shifted {
        fn logical_to_physical(&mut self, _core: &Core, _disk: &mut Disk, logical_block: u64) -> Result<Option<u64>> {
            *self.calls.borrow_mut() += 1;
            if logical_block == 2 {
                Ok(None)
            } else {
                Ok(Some(logical_block + 10))
            }
        }
    }

    fn make(image_len: usize) -> (Core, Disk) {
        let image: Vec<u8> = (0..image_len).map(|i| (i % 251) as u8).collect();
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend { image }));
        let disk = core.open("x").unwrap();
        (core, disk)
    }

    #[test]
    fn agglomerates_contiguous_runs_and_zero_fills_holes() {
        let (core, mut disk) = make(64 * 512);
        let mut src = Shifted { calls: RefCell::new(0) };
        // block size = 1 sector (log_block_size = 0), 4 logical blocks.
        let file_size = 4 * 512;
        let mut buf = vec![0xffu8; file_size];
        let n = read_range(&core, &mut disk, &mut src, 0, file_size as u64, 0, &mut buf).unwrap();
        assert_eq!(n, file_size);
        assert_eq!(&buf[1024..1536], &[0u8; 512][..]);
        assert_ne!(buf[0], 0);
    }

    #[test]
    fn clamps_to_file_size() {
        let (core, mut disk) = make(64 * 512);
        let mut src = Shifted { calls: RefCell::new(0) };
        let mut buf = vec![0u8; 4096];
        let n = read_range(&core, &mut disk, &mut src, 0, 300, 100, &mut buf).unwrap();
        assert_eq!(n, 200);
    }
}
