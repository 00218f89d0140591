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

//! `hostdisk//path` backend: a loopback over a host file or block device,
//! the only backend in this workspace with a real, testable I/O path. Every
//! other backend (BIOS, SCSI, OpenFirmware) talks to hardware this crate
//! cannot reach from hosted Rust.

use std::cell::RefCell;
use std::fs::{File, OpenOptions};
use std::os::unix::fs::FileExt;

use holycore_disk::config::DEFAULT_MAX_AGGLOMERATE;
use holycore_disk::{Backend, Core, Disk};
use holycore_err::{Error, Result};
use log::error;

pub const DEV_ID: u32 = 4;

const NAME_PREFIX: &str = "hostdisk/";

pub struct HostdiskBackend;

struct Priv {
    file: RefCell<File>,
}

impl Backend for HostdiskBackend {
    fn dev_id(&self) -> u32 {
        DEV_ID
    }

    fn open(&self, name: &str, disk: &mut Disk) -> Result<()> {
        let path = name.strip_prefix(NAME_PREFIX).ok_or(Error::UnknownDevice)?;
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .or_else(|_| OpenOptions::new().read(true).open(path))
            .map_err(|e| {
                error!("hostdisk: failed to open `{path}': {e}");
                Error::Io
            })?;
        let len = file.metadata().map_err(|_| Error::Io)?.len();

        disk.disk_id = fnv1a64(path.as_bytes());
        disk.log_sector_size = 9;
        disk.total_sectors = len / 512;
        disk.max_agglomerate = DEFAULT_MAX_AGGLOMERATE;
        disk.data = Box::new(Priv {
            file: RefCell::new(file),
        });
        Ok(())
    }

    fn read(&self, _core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &mut [u8]) -> Result<()> {
        let p = disk.data.downcast_ref::<Priv>().ok_or(Error::Io)?;
        let want = count_hw as usize * 512;
        if buf.len() != want {
            return Err(Error::BadArgument);
        }
        p.file
            .borrow()
            .read_exact_at(buf, sector_hw * 512)
            .map_err(|_| Error::ReadError)
    }

    fn write(&self, _core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &[u8]) -> Result<()> {
        let p = disk.data.downcast_ref::<Priv>().ok_or(Error::Io)?;
        let want = count_hw as usize * 512;
        if buf.len() != want {
            return Err(Error::BadArgument);
        }
        p.file
            .borrow()
            .write_all_at(buf, sector_hw * 512)
            .map_err(|_| Error::WriteError)
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
    use std::io::Write;

    #[test]
    fn round_trips_through_the_full_facade() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let mut image = vec![0u8; 1 << 20];
        for (i, b) in image.iter_mut().enumerate() {
            *b = (i % 256) as u8;
        }
        file.write_all(&image).unwrap();

        let mut core = holycore_disk::Core::new();
        core.register_backend(Box::new(HostdiskBackend));
        let name = format!("hostdisk/{}", file.path().display());
        let mut disk = core.open(&name).unwrap();

        let mut buf = [0u8; 128];
        core.read(&mut disk, 10, 3, 128, &mut buf).unwrap();
        assert_eq!(&buf[..], &image[10 * 512 + 3..10 * 512 + 3 + 128]);
    }
}
