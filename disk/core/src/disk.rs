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

use crate::backend::BackendData;
use crate::config::DISK_SIZE_UNKNOWN;
use crate::partition::Partition;

/// Caller-supplied callback invoked with the coordinates of every byte
/// delivered by a read: `(sector_std, offset, size)`. The cache and the
/// filesystem block-mapping helper call it synchronously, in ascending
/// offset order, before the caller can observe the bytes.
pub type ReadHook = Box<dyn FnMut(u64, u32, u32)>;

/// An opened drive: one instance per successful `Core::open`.
pub struct Disk {
    pub dev_id: u32,
    pub disk_id: u64,
    /// `1 << log_sector_size` is the backend's native sector size, in
    /// `9..=12`.
    pub log_sector_size: u8,
    /// In hardware sectors; may be [`DISK_SIZE_UNKNOWN`].
    pub total_sectors: u64,
    /// Largest run of cache lines the backend accepts in one agglomerated
    /// read.
    pub max_agglomerate: u32,
    pub partition: Option<Partition>,
    pub name: String,
    pub read_hook: Option<ReadHook>,
    pub data: BackendData,
}

impl Disk {
    pub(crate) fn new_bare(name: String) -> Self {
        Self {
            dev_id: 0,
            disk_id: 0,
            log_sector_size: crate::config::STANDARD_SECTOR_BITS as u8,
            total_sectors: DISK_SIZE_UNKNOWN,
            max_agglomerate: crate::config::DEFAULT_MAX_AGGLOMERATE,
            partition: None,
            name,
            read_hook: None,
            data: Box::new(()),
        }
    }

    pub fn hardware_sector_size(&self) -> u64 {
        1u64 << self.log_sector_size
    }

    pub fn set_read_hook<F: FnMut(u64, u32, u32) + 'static>(&mut self, hook: F) {
        self.read_hook = Some(Box::new(hook));
    }
}
