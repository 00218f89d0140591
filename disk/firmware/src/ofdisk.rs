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

//! `ieee1275/<devpath>` naming for Open Firmware disks. Enumeration walks
//! the OF device tree for `block` device aliases on real firmware; there's
//! no such tree to walk here, so `iterate` always reports nothing and
//! `open` only accepts names that already carry the `ieee1275/` prefix.

use holycore_disk::{Backend, Core, Disk, PullStage};
use holycore_err::{Error, Result};
use log::debug;

pub const DEV_ID: u32 = 2;

const PREFIX: &str = "ieee1275/";

struct Priv {
    devpath: String,
}

pub struct OfdiskBackend;

impl Backend for OfdiskBackend {
    fn dev_id(&self) -> u32 {
        DEV_ID
    }

    fn iterate(&self, stage: PullStage, visit: &mut dyn FnMut(&str) -> bool) -> bool {
        let _ = (stage, visit);
        false
    }

    fn open(&self, name: &str, disk: &mut Disk) -> Result<()> {
        let devpath = name.strip_prefix(PREFIX).ok_or(Error::UnknownDevice)?;
        if devpath.is_empty() {
            return Err(Error::UnknownDevice);
        }
        debug!("ofdisk: opening {name}");

        disk.disk_id = fnv1a64(devpath.as_bytes());
        disk.log_sector_size = 9;
        disk.total_sectors = holycore_disk::config::DISK_SIZE_UNKNOWN;
        disk.max_agglomerate = holycore_disk::config::DEFAULT_MAX_AGGLOMERATE;
        disk.data = Box::new(Priv {
            devpath: devpath.to_string(),
        });
        Ok(())
    }

    fn read(&self, _core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, _buf: &mut [u8]) -> Result<()> {
        disk.data.downcast_ref::<Priv>().ok_or(Error::Io)?;
        let _ = (sector_hw, count_hw);
        Err(Error::NotImplemented)
    }
}

fn fnv1a64(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn requires_the_ieee1275_prefix() {
        let mut core = Core::new();
        core.register_backend(Box::new(OfdiskBackend));
        assert_eq!(core.open("hd0").unwrap_err(), Error::UnknownDevice);
    }

    #[test]
    fn opens_a_devpath() {
        let mut core = Core::new();
        core.register_backend(Box::new(OfdiskBackend));
        let disk = core.open("ieee1275/disk@0").unwrap();
        assert_eq!(disk.log_sector_size, 9);
    }
}
