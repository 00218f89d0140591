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

use std::cell::{Cell, RefCell};

use holycore_err::{Error, Result};
use log::{debug, error};

use crate::backend::{Backend, PullStage};
use crate::cache::Cache;
use crate::config::{
    CACHE_LINE_BYTES, CACHE_LINE_SECTORS, CACHE_TIMEOUT_MS, DISK_SIZE_UNKNOWN, MAX_DISK_SECTORS,
    MAX_LOG_SECTOR_SIZE, MIN_LOG_SECTOR_SIZE, STANDARD_SECTOR_BITS,
};
use crate::disk::Disk;
use crate::partition::Partition;

/// Millisecond wall-clock source. Abstracted so the 2-second removable-media
/// invalidation window can be driven by a deterministic fake in tests
/// instead of `SystemTime`.
pub trait Clock {
    fn now_ms(&self) -> u64;
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_ms(&self) -> u64 {
        use std::time::{SystemTime, UNIX_EPOCH};
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0)
    }
}

/// Resolves a `<partmap>N[,<partmap>N...]` spec against an already-opened
/// disk into a `Partition` chain. Implemented out-of-crate by
/// `holycore-partmap` and registered with `Core::set_partition_resolver`,
/// so the partition-table formats stay decoupled from the disk core.
pub trait PartitionResolver {
    /// `disk` is positioned at no partition yet (`disk.partition` is
    /// `None`); `spec` is the comma-joined chain after the drive name,
    /// e.g. `"msdos1,bsd1"`. Implementations read partition tables by
    /// temporarily setting `disk.partition` to the chain built so far and
    /// calling `core.read`/`core.write`, then restoring it before
    /// returning, the way `Core::open` restores the drive name on error.
    fn resolve(&self, core: &Core, disk: &mut Disk, spec: &str) -> Result<Partition>;
}

/// The single-fiber, process-wide context owning the registered backend
/// list and the cache table. Every entry point is a
/// `&self` method; the only genuinely mutable shared state (the cache
/// table and the removable-media timer) lives behind interior mutability,
/// which is what lets stacking backends (diskfilter, cryptodisk) recurse
/// into `Core::read` on their member disks without a reentrant `&mut self`.
pub struct Core {
    backends: Vec<Box<dyn Backend>>,
    partition_resolver: Option<Box<dyn PartitionResolver>>,
    cache: RefCell<Cache>,
    clock: Box<dyn Clock>,
    last_activity_ms: Cell<u64>,
}

impl Default for Core {
    fn default() -> Self {
        Self::new()
    }
}

impl Core {
    pub fn new() -> Self {
        Self::with_clock(Box::new(SystemClock))
    }

    pub fn with_clock(clock: Box<dyn Clock>) -> Self {
        Self {
            backends: Vec::new(),
            partition_resolver: None,
            cache: RefCell::new(Cache::new()),
            clock,
            last_activity_ms: Cell::new(0),
        }
    }

    pub fn register_backend(&mut self, backend: Box<dyn Backend>) {
        self.backends.push(backend);
    }

    pub fn set_partition_resolver(&mut self, resolver: Box<dyn PartitionResolver>) {
        self.partition_resolver = Some(resolver);
    }

    pub fn iterate_backends(&self, stage: PullStage, mut visit: impl FnMut(&str) -> bool) -> bool {
        for backend in &self.backends {
            if backend.iterate(stage, &mut visit) {
                return true;
            }
        }
        false
    }

    fn backend_for(&self, dev_id: u32) -> Option<&dyn Backend> {
        self.backends.iter().find(|b| b.dev_id() == dev_id).map(|b| b.as_ref())
    }

    /// Find the first `,` not escaped with `\`.
    fn find_part_sep(name: &str) -> Option<usize> {
        let bytes = name.as_bytes();
        let mut i = 0;
        while i < bytes.len() {
            match bytes[i] {
                b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b',' => i += 2,
                b',' => return Some(i),
                _ => i += 1,
            }
        }
        None
    }

    pub fn open(&self, name: &str) -> Result<Disk> {
        debug!("opening `{name}'");
        let part_sep = Self::find_part_sep(name);
        let drive = match part_sep {
            Some(idx) => &name[..idx],
            None => name,
        };

        let mut disk = Disk::new_bare(drive.to_string());
        let mut opened = false;
        for backend in &self.backends {
            match backend.open(drive, &mut disk) {
                Ok(()) => {
                    disk.dev_id = backend.dev_id();
                    opened = true;
                    break;
                }
                Err(Error::UnknownDevice) => continue,
                Err(e) => return Err(e),
            }
        }
        if !opened {
            return Err(Error::UnknownDevice);
        }
        if disk.log_sector_size < MIN_LOG_SECTOR_SIZE || disk.log_sector_size > MAX_LOG_SECTOR_SIZE {
            error!(
                "sector size of {} bytes is not supported",
                1u64 << disk.log_sector_size
            );
            return Err(Error::NotImplemented);
        }

        if let Some(idx) = part_sep {
            let spec = &name[idx + 1..];
            let resolver = self
                .partition_resolver
                .as_deref()
                .ok_or(Error::UnknownDevice)?;
            let partition = resolver.resolve(self, &mut disk, spec)?;
            disk.partition = Some(partition);
        }

        let now = self.clock.now_ms();
        if now > self.last_activity_ms.get() + CACHE_TIMEOUT_MS {
            self.cache.borrow_mut().invalidate_all();
        }
        self.last_activity_ms.set(now);

        Ok(disk)
    }

    pub fn close(&self, mut disk: Disk) {
        debug!("closing `{}'", disk.name);
        if let Some(backend) = self.backend_for(disk.dev_id) {
            backend.close(&mut disk);
        }
        self.last_activity_ms.set(self.clock.now_ms());
    }

    /// Size of the innermost partition if one is mounted, else of the whole
    /// disk, in 512-byte standard sectors. `DISK_SIZE_UNKNOWN` if the
    /// backend never learned its own size.
    pub fn get_size(&self, disk: &Disk) -> u64 {
        if let Some(part) = &disk.partition {
            part.len()
        } else if disk.total_sectors != DISK_SIZE_UNKNOWN {
            disk.total_sectors << (disk.log_sector_size as u32 - STANDARD_SECTOR_BITS)
        } else {
            DISK_SIZE_UNKNOWN
        }
    }

    fn total_std_sectors(disk: &Disk) -> u64 {
        if disk.total_sectors == DISK_SIZE_UNKNOWN {
            return MAX_DISK_SECTORS;
        }
        let shift = disk.log_sector_size as u32 - STANDARD_SECTOR_BITS;
        let v = disk.total_sectors.checked_shl(shift).unwrap_or(u64::MAX);
        v.min(MAX_DISK_SECTORS)
    }

    /// Normalize `(sector, offset)` so `offset` is in `[0, 512)`, walk the
    /// partition chain adding starts while checking each bound, then check
    /// against the (clamped) disk size.
    fn adjust_range(disk: &Disk, sector: u64, offset: u32, size: u64) -> Result<(u64, u32)> {
        let mut sector = sector + (offset as u64 >> STANDARD_SECTOR_BITS);
        let mut offset = offset & ((1 << STANDARD_SECTOR_BITS) - 1);

        if let Some(innermost) = &disk.partition {
            for part in innermost.chain() {
                let needed = (offset as u64 + size + 511) >> STANDARD_SECTOR_BITS;
                if sector >= part.len || part.len - sector < needed {
                    return Err(Error::OutOfRange);
                }
                sector += part.start;
            }
        }

        let total = Self::total_std_sectors(disk);
        let needed = (offset as u64 + size + 511) >> STANDARD_SECTOR_BITS;
        if total <= sector || needed > total - sector {
            return Err(Error::OutOfRange);
        }

        Ok((sector, offset))
    }

    fn transform_to_hw(disk: &Disk, std_sector: u64) -> u64 {
        std_sector >> (disk.log_sector_size as u32 - STANDARD_SECTOR_BITS)
    }

    /// Read exactly `len` bytes starting at absolute standard-sector byte
    /// offset `byte_start`, in units of the backend's hardware sector,
    /// without touching the cache. Used as the last-resort fallback when a
    /// full-line or agglomerated backend read is refused.
    fn backend_read_raw(&self, disk: &Disk, byte_start: u64, len: usize, buf: &mut [u8]) -> Result<()> {
        let hw_size = disk.hardware_sector_size();
        let hw_start = byte_start / hw_size;
        let hw_inner = (byte_start % hw_size) as usize;
        let hw_count = ((hw_inner + len) as u64 + hw_size - 1) / hw_size;
        let mut tmp = vec![0u8; (hw_count * hw_size) as usize];
        let backend = self.backend_for(disk.dev_id).ok_or(Error::UnknownDevice)?;
        backend.read(self, disk, hw_start, hw_count as u32, &mut tmp)?;
        buf.copy_from_slice(&tmp[hw_inner..hw_inner + len]);
        Ok(())
    }

    /// Read at most one cache line's worth of bytes starting at
    /// `aligned_sector + inner_offset/512` (`aligned_sector` is line
    /// aligned, `0 <= inner_offset < CACHE_LINE_BYTES`).
    fn read_small(&self, disk: &Disk, aligned_sector: u64, inner_offset: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let mut line = [0u8; CACHE_LINE_BYTES];
        let hit = self
            .cache
            .borrow_mut()
            .fetch_line(disk.dev_id, disk.disk_id, aligned_sector, &mut line);
        if hit {
            buf.copy_from_slice(&line[inner_offset as usize..inner_offset as usize + buf.len()]);
            return Ok(());
        }

        let total_std = Self::total_std_sectors(disk);
        let within = disk.total_sectors == DISK_SIZE_UNKNOWN
            || aligned_sector + CACHE_LINE_SECTORS < total_std;
        if within {
            let hw_sector = Self::transform_to_hw(disk, aligned_sector);
            let hw_count = (CACHE_LINE_BYTES as u64 / disk.hardware_sector_size()) as u32;
            if let Some(backend) = self.backend_for(disk.dev_id) {
                if backend.read(self, disk, hw_sector, hw_count, &mut line).is_ok() {
                    buf.copy_from_slice(&line[inner_offset as usize..inner_offset as usize + buf.len()]);
                    self.cache
                        .borrow_mut()
                        .store_line(disk.dev_id, disk.disk_id, aligned_sector, &line);
                    return Ok(());
                }
            }
        }

        let byte_start = (aligned_sector << STANDARD_SECTOR_BITS) + inner_offset;
        self.backend_read_raw(disk, byte_start, buf.len(), buf)
    }

    fn fire_hook(disk: &mut Disk, sector: u64, offset: u32, size: u32) {
        if let Some(hook) = &mut disk.read_hook {
            hook(sector, offset, size);
        }
    }

    /// The hot path: fs → disk_read → adjust-range → cache → backend_read.
    pub fn read(&self, disk: &mut Disk, sector: u64, offset: u32, size: usize, buf: &mut [u8]) -> Result<()> {
        assert_eq!(buf.len(), size);
        let (mut sector, mut offset) = Self::adjust_range(disk, sector, offset, size as u64)?;
        let mut pos = 0usize;

        if offset != 0 || sector % CACHE_LINE_SECTORS != 0 {
            let start_sector = sector & !(CACHE_LINE_SECTORS - 1);
            let inner = ((sector - start_sector) << STANDARD_SECTOR_BITS) + offset as u64;
            let len = ((CACHE_LINE_BYTES as u64 - inner).min(size as u64)) as usize;
            self.read_small(disk, start_sector, inner, &mut buf[pos..pos + len])?;
            Self::fire_hook(disk, sector, offset, len as u32);
            pos += len;
            let consumed = offset as u64 + len as u64;
            sector += consumed >> STANDARD_SECTOR_BITS;
            offset = (consumed & ((1 << STANDARD_SECTOR_BITS) - 1)) as u32;
        }

        while size - pos >= CACHE_LINE_BYTES {
            let remaining_lines = ((size - pos) as u64) / CACHE_LINE_BYTES as u64;
            let window = remaining_lines.min(disk.max_agglomerate as u64).max(1);
            let mut hit_at: Option<u64> = None;
            {
                let cache = self.cache.borrow();
                for i in 0..window {
                    if cache.has_line(disk.dev_id, disk.disk_id, sector + i * CACHE_LINE_SECTORS) {
                        hit_at = Some(i);
                        break;
                    }
                }
            }
            let to_fetch = hit_at.unwrap_or(window);

            if to_fetch > 0 {
                let span_bytes = (to_fetch * CACHE_LINE_BYTES as u64) as usize;
                let dst = &mut buf[pos..pos + span_bytes];
                let hw_sector = Self::transform_to_hw(disk, sector);
                let hw_count = (span_bytes as u64 / disk.hardware_sector_size()) as u32;
                let backend_ok = self
                    .backend_for(disk.dev_id)
                    .map(|b| b.read(self, disk, hw_sector, hw_count, dst))
                    .unwrap_or(Err(Error::UnknownDevice));
                match backend_ok {
                    Ok(()) => {
                        let mut cache = self.cache.borrow_mut();
                        for i in 0..to_fetch {
                            let line_sector = sector + i * CACHE_LINE_SECTORS;
                            let off = (i * CACHE_LINE_BYTES as u64) as usize;
                            cache.store_line(disk.dev_id, disk.disk_id, line_sector, &dst[off..off + CACHE_LINE_BYTES]);
                        }
                    }
                    Err(_) => {
                        let byte_start = sector << STANDARD_SECTOR_BITS;
                        self.backend_read_raw(disk, byte_start, span_bytes, dst)?;
                    }
                }
                Self::fire_hook(disk, sector, 0, span_bytes as u32);
                sector += to_fetch * CACHE_LINE_SECTORS;
                pos += span_bytes;
            }

            if let Some(_) = hit_at {
                let mut line = [0u8; CACHE_LINE_BYTES];
                self.cache
                    .borrow_mut()
                    .fetch_line(disk.dev_id, disk.disk_id, sector, &mut line);
                buf[pos..pos + CACHE_LINE_BYTES].copy_from_slice(&line);
                Self::fire_hook(disk, sector, 0, CACHE_LINE_BYTES as u32);
                sector += CACHE_LINE_SECTORS;
                pos += CACHE_LINE_BYTES;
            }
        }

        if size - pos > 0 {
            self.read_small(disk, sector, 0, &mut buf[pos..])?;
            Self::fire_hook(disk, sector, 0, (size - pos) as u32);
        }

        Ok(())
    }

    /// Read-modify-write for unaligned ends; bypasses and invalidates the
    /// cache for every touched line.
    pub fn write(&self, disk: &mut Disk, sector: u64, offset: u32, size: usize, buf: &[u8]) -> Result<()> {
        let (mut sector, mut offset) = Self::adjust_range(disk, sector, offset, size as u64)?;
        let hw_size = disk.hardware_sector_size();
        let mut pos = 0usize;

        // Align down to a hardware sector boundary.
        let std_per_hw = hw_size >> STANDARD_SECTOR_BITS;
        let aligned_sector = sector & !(std_per_hw - 1);
        let mut real_offset = offset as u64 + ((sector - aligned_sector) << STANDARD_SECTOR_BITS);
        sector = aligned_sector;

        while pos < size {
            let remaining = size - pos;
            if real_offset != 0 || (remaining as u64) < hw_size {
                let mut tmp = vec![0u8; hw_size as usize];
                let saved_partition = disk.partition.take();
                let hw_sector = Self::transform_to_hw(disk, sector);
                let read_res = self
                    .backend_for(disk.dev_id)
                    .ok_or(Error::UnknownDevice)
                    .and_then(|b| b.read(self, disk, hw_sector, 1, &mut tmp));
                disk.partition = saved_partition;
                read_res?;

                let len = ((hw_size - real_offset) as usize).min(remaining);
                tmp[real_offset as usize..real_offset as usize + len].copy_from_slice(&buf[pos..pos + len]);

                self.cache.borrow_mut().invalidate(disk.dev_id, disk.disk_id, sector);
                let backend = self.backend_for(disk.dev_id).ok_or(Error::UnknownDevice)?;
                backend.write(self, disk, hw_sector, 1, &tmp)?;

                sector += hw_size >> STANDARD_SECTOR_BITS;
                pos += len;
                real_offset = 0;
            } else {
                let n = (remaining as u64 / hw_size).min(
                    disk.max_agglomerate as u64 * (CACHE_LINE_BYTES as u64 / hw_size),
                );
                let hw_sector = Self::transform_to_hw(disk, sector);
                let backend = self.backend_for(disk.dev_id).ok_or(Error::UnknownDevice)?;
                backend.write(self, disk, hw_sector, n as u32, &buf[pos..pos + (n * hw_size) as usize])?;

                let mut s = sector;
                for _ in 0..n {
                    self.cache.borrow_mut().invalidate(disk.dev_id, disk.disk_id, s);
                    s += hw_size >> STANDARD_SECTOR_BITS;
                }
                sector = s;
                pos += (n * hw_size) as usize;
            }
            offset = 0;
        }

        Ok(())
    }
}
