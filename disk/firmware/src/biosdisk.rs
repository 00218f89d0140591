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

//! `hd%d` / `fd%d` / `cd` naming and drive-number parsing, grounded on the
//! int 0x13 backend. Real reads go through the BIOS disk address packet
//! (DAP) or CHS calls, neither of which exist outside a boot loader, so
//! [`BiosdiskBackend::read`]/`write` always fail with `NotImplemented`.

use holycore_disk::{Backend, Core, Disk, PullStage};
use holycore_err::{Error, Result};
use log::{debug, trace};

pub const DEV_ID: u32 = 1;

/// Per-disk state filled in by `open`: which BIOS drive number this name
/// maps to, and whether it's the boot CD (`0x13` drive numbers below 0x80
/// are floppies, 0x80 and up are hard disks/CD).
struct Priv {
    drive: u32,
    is_cdrom: bool,
}

pub struct BiosdiskBackend {
    /// BIOS drive number of the boot CD, if any was detected at startup.
    /// A real firmware build discovers this once via `get-cdinfo`; hosted
    /// Rust has no such call, so it's always `None` here.
    cd_drive: Option<u32>,
}

impl BiosdiskBackend {
    pub fn new() -> Self {
        Self { cd_drive: None }
    }
}

impl Default for BiosdiskBackend {
    fn default() -> Self {
        Self::new()
    }
}

fn drive_name(drive: u32, is_cdrom: bool) -> String {
    if is_cdrom {
        "cd".to_string()
    } else if drive & 0x80 != 0 {
        format!("hd{}", drive & !0x80)
    } else {
        format!("fd{drive}")
    }
}

fn parse_drive(name: &str, cd_drive: Option<u32>) -> Result<(u32, bool)> {
    if name == "cd" {
        return cd_drive.map(|d| (d, true)).ok_or(Error::UnknownDevice);
    }
    let (prefix, rest) = name.split_at(2.min(name.len()));
    let (base, is_cdrom) = match prefix {
        "hd" => (0x80, false),
        "fd" => (0, false),
        _ => return Err(Error::UnknownDevice),
    };
    let n: u32 = rest.parse().map_err(|_| Error::UnknownDevice)?;
    Ok((base + n, is_cdrom))
}

impl Backend for BiosdiskBackend {
    fn dev_id(&self) -> u32 {
        DEV_ID
    }

    fn iterate(&self, stage: PullStage, visit: &mut dyn FnMut(&str) -> bool) -> bool {
        match stage {
            // A real implementation probes 0x80..0x90 by attempting a
            // one-sector read and stopping at the first failure; there is
            // nothing to probe here, so fixed disks enumerate empty.
            PullStage::Fixed => false,
            PullStage::Removable => {
                if let Some(cd) = self.cd_drive {
                    trace!("biosdisk: iterating cd (drive 0x{cd:02x})");
                    if visit("cd") {
                        return true;
                    }
                }
                false
            }
        }
    }

    fn open(&self, name: &str, disk: &mut Disk) -> Result<()> {
        let (drive, is_cdrom) = parse_drive(name, self.cd_drive)?;
        debug!("biosdisk: opening {name} (drive 0x{drive:02x})");

        disk.disk_id = drive as u64;
        disk.log_sector_size = if is_cdrom { 11 } else { 9 };
        disk.total_sectors = holycore_disk::config::DISK_SIZE_UNKNOWN;
        // Phoenix EDD limits a single transfer to 0x7f sectors.
        disk.max_agglomerate = 0x7f >> 3;
        disk.data = Box::new(Priv { drive, is_cdrom });
        Ok(())
    }

    fn read(&self, _core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, _buf: &mut [u8]) -> Result<()> {
        disk.data.downcast_ref::<Priv>().ok_or(Error::Io)?;
        let _ = (sector_hw, count_hw);
        Err(Error::NotImplemented)
    }

    fn write(&self, _core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &[u8]) -> Result<()> {
        let p = disk.data.downcast_ref::<Priv>().ok_or(Error::Io)?;
        if p.is_cdrom {
            return Err(Error::WriteError);
        }
        let _ = (sector_hw, count_hw, buf);
        Err(Error::NotImplemented)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_hd_and_fd_names() {
        assert_eq!(parse_drive("hd0", None).unwrap(), (0x80, false));
        assert_eq!(parse_drive("hd1", None).unwrap(), (0x81, false));
        assert_eq!(parse_drive("fd0", None).unwrap(), (0, false));
    }

    #[test]
    fn cd_requires_a_detected_boot_cd() {
        assert_eq!(parse_drive("cd", None).unwrap_err(), Error::UnknownDevice);
        assert_eq!(parse_drive("cd", Some(0x9f)).unwrap(), (0x9f, true));
    }

    #[test]
    fn round_trips_through_drive_name() {
        assert_eq!(drive_name(0x80, false), "hd0");
        assert_eq!(drive_name(0x03, false), "fd3");
        assert_eq!(drive_name(0x9f, true), "cd");
    }

    #[test]
    fn rejects_unrelated_names() {
        assert_eq!(parse_drive("mem0", None).unwrap_err(), Error::UnknownDevice);
    }
}
