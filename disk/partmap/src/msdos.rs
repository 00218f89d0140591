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

//! MS-DOS (MBR) partition table: primary entries 0–3 in the boot sector,
//! extended entries numbered from 4 onward walking the EBR linked list.

use holycore_disk::{Core, Disk, Partition};
use holycore_err::{Error, Result};
use log::trace;
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const NAME: &str = "msdos";

const BOOT_SIGNATURE: u16 = 0xaa55;
const TYPE_EXTENDED: u8 = 0x05;
const TYPE_EXTENDED_LBA: u8 = 0x0f;
const TYPE_EXTENDED_LINUX: u8 = 0x85;
const TYPE_EMPTY: u8 = 0x00;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct MbrEntry {
    flag: u8,
    start_head: u8,
    start_sector: u8,
    start_cylinder: u8,
    kind: u8,
    end_head: u8,
    end_sector: u8,
    end_cylinder: u8,
    start_lba: u32,
    length: u32,
}

fn is_extended(kind: u8) -> bool {
    matches!(kind, TYPE_EXTENDED | TYPE_EXTENDED_LBA | TYPE_EXTENDED_LINUX)
}

fn read_entries(core: &Core, disk: &mut Disk, sector: u64) -> Result<[MbrEntry; 4]> {
    let mut buf = [0u8; 512];
    core.read(disk, sector, 0, 512, &mut buf)?;
    if u16::from_le_bytes([buf[510], buf[511]]) != BOOT_SIGNATURE {
        return Err(Error::BadFs);
    }
    let mut parsed = Vec::with_capacity(4);
    for i in 0..4 {
        let off = 446 + i * 16;
        parsed.push(MbrEntry::read_from_bytes(&buf[off..off + 16]).map_err(|_| Error::BadFs)?);
    }
    parsed.try_into().map_err(|_| Error::BadFs)
}

/// Probe for partition number `want`. Numbering matches the on-disk
/// convention directly: primaries are 0..=3, extended logicals start at 4.
pub fn probe(core: &Core, disk: &mut Disk, want: u32) -> Result<Partition> {
    let entries = read_entries(core, disk, 0)?;

    if want < 4 {
        let e = &entries[want as usize];
        if e.kind == TYPE_EMPTY {
            return Err(Error::BadFileName);
        }
        return Ok(Partition::new(e.start_lba as u64, e.length as u64, want, NAME));
    }

    // Extended partitions: walk the EBR chain. Each EBR's own table has at
    // most one entry describing the logical partition's data, and at most
    // one "link" entry (extended type) pointing at the next EBR, whose
    // `start_lba` is relative to the first extended partition's start.
    let first_extended = entries
        .iter()
        .find(|e| is_extended(e.kind))
        .ok_or(Error::BadFileName)?;
    let extended_base = first_extended.start_lba as u64;

    let mut ebr_offset = 0u64;
    let mut number = 4u32;
    loop {
        let ebr = read_entries(core, disk, extended_base + ebr_offset)?;
        let data = &ebr[0];
        if data.kind == TYPE_EMPTY {
            return Err(Error::BadFileName);
        }

        if number == want {
            return Ok(Partition::new(
                extended_base + ebr_offset + data.start_lba as u64,
                data.length as u64,
                number,
                NAME,
            ));
        }

        let link = ebr.iter().skip(1).find(|e| is_extended(e.kind));
        match link {
            Some(link) => {
                trace!("msdos: following EBR link to {}", link.start_lba);
                ebr_offset = link.start_lba as u64;
                number += 1;
            }
            None => return Err(Error::BadFileName),
        }
    }
}
