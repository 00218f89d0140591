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

//! GUID Partition Table: header at standard sector 1, entry array at
//! `header.entries_lba`, each entry carrying a 16-byte type GUID.
//! Type-GUID lookup re-reads the entry from the parent disk using the
//! entry's byte offset and index, matching the `partition.offset` /
//! `partition.index` fields callers already carry.

use holycore_disk::{Core, Disk, Partition};
use holycore_err::{Error, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

pub const NAME: &str = "gpt";

const SIGNATURE: u64 = 0x5452415020494645; // "EFI PART" little-endian

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct GptHeader {
    signature: u64,
    revision: u32,
    header_size: u32,
    header_crc32: u32,
    reserved: u32,
    my_lba: u64,
    alternate_lba: u64,
    first_usable_lba: u64,
    last_usable_lba: u64,
    disk_guid: [u8; 16],
    entries_lba: u64,
    num_entries: u32,
    entry_size: u32,
    entries_crc32: u32,
}

#[derive(FromBytes, KnownLayout, Immutable, Clone)]
#[repr(C, packed)]
pub struct GptEntry {
    pub type_guid: [u8; 16],
    pub unique_guid: [u8; 16],
    pub first_lba: u64,
    pub last_lba: u64,
    pub attributes: u64,
    pub name_utf16: [u8; 72],
}

fn read_header(core: &Core, disk: &mut Disk) -> Result<GptHeader> {
    let mut buf = [0u8; 512];
    core.read(disk, 1, 0, 512, &mut buf)?;
    let header = GptHeader::read_from_bytes(&buf[..92]).map_err(|_| Error::BadFs)?;
    let signature = header.signature;
    if signature != SIGNATURE {
        return Err(Error::BadFs);
    }
    Ok(header)
}

fn read_entry(core: &Core, disk: &mut Disk, header: &GptHeader, index: u32) -> Result<GptEntry> {
    let num_entries = header.num_entries;
    let entry_size = header.entry_size as u64;
    let entries_lba = header.entries_lba;
    if index >= num_entries {
        return Err(Error::BadFileName);
    }
    let byte_offset = entries_lba * 512 + index as u64 * entry_size;
    let sector = byte_offset / 512;
    let offset_in_sector = (byte_offset % 512) as u32;

    let mut buf = vec![0u8; entry_size as usize];
    core.read(disk, sector, offset_in_sector, entry_size as usize, &mut buf)?;
    GptEntry::read_from_bytes(&buf[..128]).map_err(|_| Error::BadFs)
}

pub fn probe(core: &Core, disk: &mut Disk, want: u32) -> Result<Partition> {
    let header = read_header(core, disk)?;
    let entry = read_entry(core, disk, &header, want)?;
    let type_guid = entry.type_guid;
    let first_lba = entry.first_lba;
    let last_lba = entry.last_lba;
    if type_guid == [0u8; 16] {
        return Err(Error::BadFileName);
    }
    let len = last_lba + 1 - first_lba;
    Ok(Partition::new(first_lba, len, want, NAME))
}

/// Re-reads an entry's type GUID straight from the parent disk, for a
/// caller that already has the header location cached.
pub fn entry_type_guid(core: &Core, disk: &mut Disk, want: u32) -> Result<[u8; 16]> {
    let header = read_header(core, disk)?;
    let entry = read_entry(core, disk, &header, want)?;
    Ok(entry.type_guid)
}
