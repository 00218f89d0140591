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

//! Label scan and metadata-area circular buffer read: a sector scan for
//! the LVM2 label, then a wrap-copy of the "raw locn" when it straddles
//! the end of the MDA.

use holycore_disk::{Core, Disk};
use holycore_err::{Error, Result};
use zerocopy::{FromBytes, Immutable, KnownLayout};

const LABEL_ID: &[u8; 8] = b"LABELONE";
const LVM2_LABEL: &[u8; 8] = b"LVM2 001";
const LABEL_SCAN_SECTORS: u64 = 4;
const FMTT_MAGIC: &[u8; 16] = b" LVM2 x[5A%r0N*>";
const MDA_HEADER_SIZE: u64 = 512;

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct LabelHeader {
    id: [u8; 8],
    sector: u64,
    crc: u32,
    offset: u32,
    kind: [u8; 8],
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct PvHeader {
    pv_uuid: [u8; 32],
    device_size: u64,
    // Followed by a variable-length array of `DiskLocn`; data area first,
    // metadata area(s) after a zero-offset terminator entry.
}

#[derive(FromBytes, KnownLayout, Immutable, Clone, Copy)]
#[repr(C, packed)]
struct DiskLocn {
    offset: u64,
    size: u64,
}

#[derive(FromBytes, KnownLayout, Immutable)]
#[repr(C, packed)]
struct MdaHeader {
    checksum: u32,
    magic: [u8; 16],
    version: u32,
    start: u64,
    size: u64,
    raw_locn_offset: u64,
    raw_locn_size: u64,
}

pub struct PvLabel {
    pub uuid: String,
    pub mda_offset: u64,
    pub mda_size: u64,
}

fn format_uuid(raw: &[u8; 32]) -> String {
    let mut out = String::with_capacity(39);
    for (i, &b) in raw.iter().enumerate() {
        out.push(b as char);
        if matches!(i, 1 | 5 | 9 | 13 | 17 | 21 | 25) {
            out.push('-');
        }
    }
    out
}

/// Scans the first [`LABEL_SCAN_SECTORS`] sectors of `disk` for an LVM2
/// label and returns the PV's UUID and metadata-area location.
pub fn scan_label(core: &Core, disk: &mut Disk) -> Result<PvLabel> {
    let mut sector_buf = [0u8; 512];
    for sector in 0..LABEL_SCAN_SECTORS {
        core.read(disk, sector, 0, 512, &mut sector_buf)?;
        let header = match LabelHeader::read_from_bytes(&sector_buf[..24]) {
            Ok(h) => h,
            Err(_) => continue,
        };
        if &header.id != LABEL_ID || &header.kind != LVM2_LABEL {
            continue;
        }

        let pvh_offset = header.offset as usize;
        let pvh = PvHeader::read_from_bytes(&sector_buf[pvh_offset..pvh_offset + 40])
            .map_err(|_| Error::BadFs)?;
        let uuid = format_uuid(&pvh.pv_uuid);

        // disk_areas_xl: data area at index 0, metadata area at index 1;
        // when there are several metadata areas, just use the first one.
        let locn_offset = pvh_offset + 40;
        let mda_locn = DiskLocn::read_from_bytes(&sector_buf[locn_offset + 16..locn_offset + 32])
            .map_err(|_| Error::BadFs)?;

        return Ok(PvLabel {
            uuid,
            mda_offset: mda_locn.offset,
            mda_size: mda_locn.size,
        });
    }
    Err(Error::BadFs)
}

/// Reads the MDA's current metadata text into a contiguous `String`,
/// un-wrapping the circular buffer when the "raw locn" straddles the end
/// of the metadata area.
pub fn read_metadata_text(core: &Core, disk: &mut Disk, mda_offset: u64, mda_size: u64) -> Result<String> {
    let mut buf = vec![0u8; mda_size as usize];
    let mda_byte_offset = mda_offset * 512;
    let sector = mda_byte_offset / 512;
    let offset_in_sector = (mda_byte_offset % 512) as u32;
    core.read(disk, sector, offset_in_sector, mda_size as usize, &mut buf)?;

    let header = MdaHeader::read_from_bytes(&buf[..44]).map_err(|_| Error::BadFs)?;
    let magic = header.magic;
    if magic != *FMTT_MAGIC {
        return Err(Error::BadFs);
    }

    let locn_offset = header.raw_locn_offset;
    let locn_size = header.raw_locn_size;
    let mda_size_field = header.size;

    let text_start = locn_offset as usize;
    let text_len = if locn_offset + locn_size > mda_size_field {
        // Wraps: the tail lives past `mda_size`; stitch it together.
        let wrapped_len = (locn_offset + locn_size - mda_size_field) as usize;
        let mut out = buf[text_start..mda_size as usize].to_vec();
        out.extend_from_slice(&buf[MDA_HEADER_SIZE as usize..MDA_HEADER_SIZE as usize + wrapped_len]);
        return String::from_utf8(out).map_err(|_| Error::BadFs);
    } else {
        locn_size as usize
    };

    String::from_utf8(buf[text_start..text_start + text_len].to_vec()).map_err(|_| Error::BadFs)
}
