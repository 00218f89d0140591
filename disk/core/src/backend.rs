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

use std::any::Any;

use holycore_err::{Error, Result};

use crate::Disk;
use crate::core::Core;

/// Backend-private per-disk state. Each backend downcasts this to its own
/// type in every call; the facade never inspects it.
pub type BackendData = Box<dyn Any + Send + Sync>;

/// Which enumeration pass `Backend::iterate` is being asked to perform.
///
/// Fixed disks are reported on the `Fixed` pass; removable media (CD, USB)
/// is only reported on the `Removable` pass, so that menu/name completion
/// can list fixed disks first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PullStage {
    Fixed,
    Removable,
}

/// A block device driver: firmware BIOS disk, SCSI/USB mass storage,
/// IEEE-1275 OpenFirmware disk, host-file loopback, or a synthesized disk
/// from a stacking layer (diskfilter, cryptodisk).
///
/// `read`/`write` operate in units of the backend's own hardware sector
/// (`1 << disk.log_sector_size`), never in standard 512-byte sectors; the
/// facade performs that translation before calling in.
pub trait Backend {
    /// Stable small integer identifying this backend. Used together with
    /// `disk_id` as the cache addressing key.
    fn dev_id(&self) -> u32;

    /// List the disk names this backend currently knows about. Returns
    /// `true` from `visit` to stop early; `iterate` propagates that.
    fn iterate(&self, stage: PullStage, visit: &mut dyn FnMut(&str) -> bool) -> bool {
        let _ = stage;
        let _ = visit;
        false
    }

    /// Parse `name`, fill in `disk`'s identity/geometry fields, and stash
    /// any backend-private state in `disk.data`.
    ///
    /// Returns `Err(Error::UnknownDevice)` when `name` does not belong to
    /// this backend — the facade tries the next registered backend in that
    /// case. Any other error is fatal and aborts `open`.
    fn open(&self, name: &str, disk: &mut Disk) -> Result<()>;

    fn close(&self, disk: &mut Disk) {
        let _ = disk;
    }

    /// Read `count_hw` hardware sectors starting at `sector_hw` into `buf`.
    ///
    /// `core` gives stacking backends (diskfilter, cryptodisk) a way to
    /// recurse into `Core::read` on their member disks; plain hardware
    /// backends ignore it.
    fn read(&self, core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &mut [u8]) -> Result<()>;

    fn write(&self, core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &[u8]) -> Result<()> {
        let _ = (core, disk, sector_hw, count_hw, buf);
        Err(Error::NotImplemented)
    }
}
