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

use crate::config::{CACHE_LINE_BYTES, CACHE_LINE_SECTORS, CACHE_LINE_SECTORS_LOG2, CACHE_NUM};

/// Direct-mapped sector cache. One line covers `CACHE_LINE_SECTORS`
/// standard (512-byte) sectors; a hit requires `dev_id`, `disk_id` and the
/// line-aligned `sector` to all match.
pub struct Cache {
    entries: Vec<Slot>,
}

struct Slot {
    tenant: Option<Tenant>,
    /// Held while a caller is mid-copy out of this line; an entry with
    /// `lock = true` is never evicted or freed.
    lock: bool,
}

struct Tenant {
    dev_id: u32,
    disk_id: u64,
    /// Line-aligned absolute standard sector.
    sector: u64,
    data: Box<[u8; CACHE_LINE_BYTES]>,
}

impl Default for Cache {
    fn default() -> Self {
        Self::new()
    }
}

impl Cache {
    pub fn new() -> Self {
        let mut entries = Vec::with_capacity(CACHE_NUM);
        entries.resize_with(CACHE_NUM, || Slot {
            tenant: None,
            lock: false,
        });
        Self { entries }
    }

    fn index(dev_id: u32, disk_id: u64, aligned_sector: u64) -> usize {
        let line = aligned_sector >> CACHE_LINE_SECTORS_LOG2;
        let h = (dev_id as u64)
            .wrapping_mul(524287)
            .wrapping_add((disk_id as u64).wrapping_mul(2606459))
            .wrapping_add(line);
        (h % CACHE_NUM as u64) as usize
    }

    /// If the line containing `aligned_sector` is cached, copy it into
    /// `out` (which must be exactly `CACHE_LINE_BYTES` long) and return
    /// `true`.
    pub fn fetch_line(&mut self, dev_id: u32, disk_id: u64, aligned_sector: u64, out: &mut [u8]) -> bool {
        debug_assert_eq!(aligned_sector % CACHE_LINE_SECTORS, 0);
        debug_assert_eq!(out.len(), CACHE_LINE_BYTES);
        let idx = Self::index(dev_id, disk_id, aligned_sector);
        let slot = &mut self.entries[idx];
        let Some(tenant) = &slot.tenant else {
            return false;
        };
        if tenant.dev_id != dev_id || tenant.disk_id != disk_id || tenant.sector != aligned_sector {
            return false;
        }
        slot.lock = true;
        out.copy_from_slice(tenant.data.as_slice());
        slot.lock = false;
        true
    }

    /// True if fetching `aligned_sector` would hit, without copying
    /// anything out. Used by the agglomeration scan to decide where to
    /// stop an in-flight backend read one line early.
    pub fn has_line(&self, dev_id: u32, disk_id: u64, aligned_sector: u64) -> bool {
        let idx = Self::index(dev_id, disk_id, aligned_sector);
        matches!(&self.entries[idx].tenant, Some(t) if t.dev_id == dev_id && t.disk_id == disk_id && t.sector == aligned_sector)
    }

    /// Publish a freshly read line. Allocation failure (which cannot
    /// actually happen for a `Box<[u8; N]>` under the global allocator, but
    /// is modeled for fidelity with the C source) just means the read
    /// completes uncached.
    pub fn store_line(&mut self, dev_id: u32, disk_id: u64, aligned_sector: u64, data: &[u8]) {
        debug_assert_eq!(aligned_sector % CACHE_LINE_SECTORS, 0);
        debug_assert_eq!(data.len(), CACHE_LINE_BYTES);
        let idx = Self::index(dev_id, disk_id, aligned_sector);
        let slot = &mut self.entries[idx];
        if slot.lock {
            // Never overwrite a locked tenant; drop the line uncached.
            return;
        }
        let mut buf = Box::new([0u8; CACHE_LINE_BYTES]);
        buf.copy_from_slice(data);
        slot.tenant = Some(Tenant {
            dev_id,
            disk_id,
            sector: aligned_sector,
            data: buf,
        });
    }

    pub fn invalidate(&mut self, dev_id: u32, disk_id: u64, sector: u64) {
        let aligned = sector & !(CACHE_LINE_SECTORS - 1);
        let idx = Self::index(dev_id, disk_id, aligned);
        let slot = &mut self.entries[idx];
        if slot.lock {
            return;
        }
        if matches!(&slot.tenant, Some(t) if t.dev_id == dev_id && t.disk_id == disk_id && t.sector == aligned) {
            slot.tenant = None;
        }
    }

    pub fn invalidate_all(&mut self) {
        for slot in &mut self.entries {
            if !slot.lock {
                slot.tenant = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_requires_all_three_keys() {
        let mut c = Cache::new();
        let line = [7u8; CACHE_LINE_BYTES];
        c.store_line(1, 2, 0, &line);
        let mut out = [0u8; CACHE_LINE_BYTES];
        assert!(c.fetch_line(1, 2, 0, &mut out));
        assert_eq!(out, line);
        assert!(!c.fetch_line(1, 3, 0, &mut out));
        assert!(!c.fetch_line(2, 2, 0, &mut out));
        assert!(!c.fetch_line(1, 2, CACHE_LINE_SECTORS, &mut out));
    }

    #[test]
    fn store_invalidates_previous_tenant_of_the_slot() {
        let mut c = Cache::new();
        // Two different (dev,disk,sector) keys that collide on the same
        // slot will evict one another; same key simply republishes.
        let a = [1u8; CACHE_LINE_BYTES];
        let b = [2u8; CACHE_LINE_BYTES];
        c.store_line(1, 1, 0, &a);
        c.store_line(1, 1, 0, &b);
        let mut out = [0u8; CACHE_LINE_BYTES];
        assert!(c.fetch_line(1, 1, 0, &mut out));
        assert_eq!(out, b);
    }

    #[test]
    fn invalidate_all_clears_everything() {
        let mut c = Cache::new();
        let data = [9u8; CACHE_LINE_BYTES];
        c.store_line(5, 5, 0, &data);
        c.invalidate_all();
        let mut out = [0u8; CACHE_LINE_BYTES];
        assert!(!c.fetch_line(5, 5, 0, &mut out));
    }
}
