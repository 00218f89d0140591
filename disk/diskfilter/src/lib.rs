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

//! LVM2 logical-volume synthesized disk: scans backing disks
//! for an LVM2 label, parses the textual VG metadata, and presents every
//! logical volume it finds as an ordinary named disk under
//! [`DISKFILTER_ID`], recursing back into [`Core::read`] on the PVs (or, for
//! a `PVMOVE` mirror leg, another LV) that actually back it.

pub mod label;
pub mod parse;
pub mod types;

use std::cell::RefCell;

use holycore_disk::{Backend, Core, Disk, PullStage};
use holycore_err::{Error, Result};
use log::{debug, warn};

pub use types::{LogicalVolume, NodeRef, PhysicalVolume, RaidLayout, Segment, SegmentKind, VolumeGroup};

/// Which physical child (and the position of parity/Q alongside it) holds
/// the data for stripe number `stripe` under `layout`, given `raid_disks`
/// total children.
///
/// Healthy-path geometry only: a missing child is not handled here, that is
/// `raid5rec`/`raid6rec`-style reconstruction work out of scope for this
/// driver (see DESIGN.md) -- but every stripe still maps every data slot to
/// exactly one child, satisfying the "total and injective per child"
/// property regardless of which children are actually readable.
fn raid_data_disk(layout: RaidLayout, raid_disks: usize, stripe: u64, data_slot: usize) -> usize {
    match layout {
        RaidLayout::Raid4 => data_slot,
        RaidLayout::Raid5LeftSymmetric => {
            let parity = raid_disks - 1 - (stripe as usize % raid_disks);
            (parity + 1 + data_slot) % raid_disks
        }
        RaidLayout::Raid6RightAsymmetric => {
            let q = raid_disks - 1 - (stripe as usize % raid_disks);
            let p = (q + raid_disks - 1) % raid_disks;
            let mut idx = (q + 1) % raid_disks;
            let mut remaining = data_slot;
            loop {
                if idx != p && idx != q {
                    if remaining == 0 {
                        return idx;
                    }
                    remaining -= 1;
                }
                idx = (idx + 1) % raid_disks;
            }
        }
    }
}

/// Stable `dev_id` for disks synthesized by this backend: the ASCII bytes
/// `"LVM2"`.
pub const DISKFILTER_ID: u32 = 0x4c564d32;

/// One registered volume group: the parsed metadata plus, for every PV
/// mentioned in it that has actually been scanned so far, the disk name it
/// was opened under. A VG with PVs spread across disks that haven't been
/// scanned yet is registered anyway; LVs referencing an unscanned PV simply
/// fail to open until that PV is scanned too.
struct RegisteredVg {
    group: VolumeGroup,
    /// `(pv id, backing disk name)`.
    backing: Vec<(String, String)>,
}

/// Per-disk state stashed in `Disk::data` by [`Diskfilter::open`]: the
/// resolved LV plus enough of its VG to translate a VG-relative sector into
/// a child read without re-walking the registry on every call.
struct LvDiskData {
    vg_name: String,
    lv: LogicalVolume,
    extent_size: u64,
    /// `(pv name, backing disk name, pe_start)`.
    pv_backing: Vec<(String, String, u64)>,
}

/// Process-wide registry of scanned volume groups. One instance is shared
/// by every `lv/<vg>/<lv>` disk name; register it with
/// [`Core::register_backend`] after scanning whatever PVs are present with
/// [`Diskfilter::scan_disk`].
#[derive(Default)]
pub struct Diskfilter {
    vgs: RefCell<Vec<RegisteredVg>>,
}

impl Diskfilter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Scans `name` for an LVM2 label and, if found, parses its VG metadata
    /// and folds it into the registry. Not an error for `name` to carry no
    /// label at all — callers scan every disk they know about and ignore
    /// `Err(Error::BadFs)` the way `holy_diskfilter_iterate`'s PV sweep does.
    pub fn scan_disk(&self, core: &Core, name: &str) -> Result<()> {
        let mut disk = core.open(name)?;
        let scan = label::scan_label(core, &mut disk).and_then(|pvl| {
            let text = label::read_metadata_text(core, &mut disk, pvl.mda_offset, pvl.mda_size)?;
            let vg = parse::parse_vg_metadata(&text)?;
            Ok((pvl.uuid, vg))
        });
        core.close(disk);
        let (pv_uuid, vg) = scan?;
        self.register(name, pv_uuid, vg);
        Ok(())
    }

    fn register(&self, disk_name: &str, pv_uuid: String, vg: VolumeGroup) {
        let mut vgs = self.vgs.borrow_mut();
        if let Some(existing) = vgs.iter_mut().find(|v| v.group.id == vg.id) {
            if existing.group.name != vg.name {
                warn!(
                    "diskfilter: VG {} changed name from `{}' to `{}', keeping the old one",
                    vg.id, existing.group.name, vg.name
                );
            }
            if let Some(prior) = existing.backing.iter().find(|(id, _)| *id == pv_uuid) {
                if prior.1 != disk_name {
                    warn!(
                        "diskfilter: PV {pv_uuid} already backed by `{}', ignoring duplicate at `{disk_name}'",
                        prior.1
                    );
                }
            } else {
                existing.backing.push((pv_uuid, disk_name.to_string()));
            }
            return;
        }
        if vgs.iter().any(|v| v.group.name == vg.name) {
            warn!("diskfilter: duplicate volume group name `{}'", vg.name);
        }
        debug!("diskfilter: registered VG `{}' ({})", vg.name, vg.id);
        vgs.push(RegisteredVg {
            group: vg,
            backing: vec![(pv_uuid, disk_name.to_string())],
        });
    }

    fn find_lv(&self, vg_name: &str, lv_name: &str) -> Option<LvDiskData> {
        let vgs = self.vgs.borrow();
        let vg = vgs.iter().find(|v| v.group.name == vg_name)?;
        let lv = vg.group.find_lv(lv_name)?.clone();
        let pv_backing = vg
            .group
            .pvs
            .iter()
            .filter_map(|pv| {
                vg.backing
                    .iter()
                    .find(|(id, _)| *id == pv.id)
                    .map(|(_, disk_name)| (pv.name.clone(), disk_name.clone(), pv.pe_start))
            })
            .collect();
        Some(LvDiskData {
            vg_name: vg.group.name.clone(),
            lv,
            extent_size: vg.group.extent_size,
            pv_backing,
        })
    }
}

/// Splits `"lv/<vg>/<lv>"` into `(vg, lv)`.
fn parse_name(name: &str) -> Option<(&str, &str)> {
    let rest = name.strip_prefix("lv/")?;
    let slash = rest.find('/')?;
    Some((&rest[..slash], &rest[slash + 1..]))
}

/// One `(start sector, run length, target)` piece of a translated read,
/// where `target` is either a PV (absolute sector on its backing disk) or a
/// sibling LV (VG-relative sector, recursed through `lv/<vg>/<name>`).
enum Target {
    Pv { disk_name: String, sector: u64 },
    Lv { vg_name: String, lv_name: String, sector: u64 },
}

/// Resolves one `node` reference plus a local offset within it to a
/// concrete read target.
fn resolve_node(data: &LvDiskData, node: &NodeRef, local_sector: u64) -> Result<Target> {
    if let Some((_, disk_name, pe_start)) = data.pv_backing.iter().find(|(name, _, _)| *name == node.name) {
        return Ok(Target::Pv {
            disk_name: disk_name.clone(),
            sector: pe_start + node.start + local_sector,
        });
    }
    // Not a known PV: assume it names another LV in the same VG, as
    // `PVMOVE` temporarily does while moving extents onto a freshly
    // allocated mirror leg.
    Ok(Target::Lv {
        vg_name: data.vg_name.clone(),
        lv_name: node.name.clone(),
        sector: node.start + local_sector,
    })
}

/// Finds the segment covering `extent` and returns it with the sector
/// offset into its own start.
fn segment_for(lv: &LogicalVolume, extent_size: u64, sector: u64) -> Result<(&Segment, u64)> {
    let extent = sector / extent_size;
    let seg = lv
        .segments
        .iter()
        .find(|s| extent >= s.start_extent && extent < s.start_extent + s.extent_count)
        .ok_or(Error::OutOfRange)?;
    let seg_start_sector = seg.start_extent * extent_size;
    Ok((seg, sector - seg_start_sector))
}

/// One physically contiguous chunk that can be satisfied with a single
/// child read: resolves one step of the translation, capped so it never
/// crosses a segment or (for striped segments) a stripe boundary.
fn next_chunk(data: &LvDiskData, sector: u64, remaining: u64) -> Result<(Target, u64)> {
    let (seg, in_seg) = segment_for(&data.lv, data.extent_size, sector)?;
    let seg_remaining = seg.extent_count * data.extent_size - in_seg;

    match &seg.kind {
        SegmentKind::Linear { node } => {
            let len = remaining.min(seg_remaining);
            Ok((resolve_node(data, node, in_seg)?, len))
        }
        SegmentKind::Mirror { nodes, .. } => {
            let node = nodes.first().ok_or(Error::BadFs)?;
            let len = remaining.min(seg_remaining);
            Ok((resolve_node(data, node, in_seg)?, len))
        }
        SegmentKind::Striped { stripe_size, nodes } => {
            if nodes.is_empty() || *stripe_size == 0 {
                return Err(Error::BadFs);
            }
            let stripe_index = in_seg / stripe_size;
            let pos_in_stripe = in_seg % stripe_size;
            let node_idx = (stripe_index as usize) % nodes.len();
            let stripe_round = stripe_index / (nodes.len() as u64);
            let node_offset = stripe_round * stripe_size + pos_in_stripe;
            let len = remaining.min(seg_remaining).min(stripe_size - pos_in_stripe);
            Ok((resolve_node(data, &nodes[node_idx], node_offset)?, len))
        }
        SegmentKind::Raid { layout, stripe_size, nodes } => {
            if nodes.is_empty() || *stripe_size == 0 {
                return Err(Error::BadFs);
            }
            let raid_disks = nodes.len();
            let data_disks = match layout {
                RaidLayout::Raid4 | RaidLayout::Raid5LeftSymmetric => raid_disks - 1,
                RaidLayout::Raid6RightAsymmetric => raid_disks - 2,
            };
            if data_disks == 0 {
                return Err(Error::BadFs);
            }
            let chunk_index = in_seg / stripe_size;
            let pos_in_chunk = in_seg % stripe_size;
            let stripe = chunk_index / data_disks as u64;
            let data_slot = (chunk_index % data_disks as u64) as usize;
            let disk_idx = raid_data_disk(*layout, raid_disks, stripe, data_slot);
            let node_offset = stripe * stripe_size + pos_in_chunk;
            let len = remaining.min(seg_remaining).min(stripe_size - pos_in_chunk);
            Ok((resolve_node(data, &nodes[disk_idx], node_offset)?, len))
        }
    }
}

impl Backend for Diskfilter {
    fn dev_id(&self) -> u32 {
        DISKFILTER_ID
    }

    fn iterate(&self, stage: PullStage, visit: &mut dyn FnMut(&str) -> bool) -> bool {
        if stage != PullStage::Fixed {
            return false;
        }
        for vg in self.vgs.borrow().iter() {
            for lv in &vg.group.lvs {
                if lv.visible && visit(&format!("lv/{}/{}", vg.group.name, lv.name)) {
                    return true;
                }
            }
        }
        false
    }

    fn open(&self, name: &str, disk: &mut Disk) -> Result<()> {
        let (vg_name, lv_name) = parse_name(name).ok_or(Error::UnknownDevice)?;
        let data = self.find_lv(vg_name, lv_name).ok_or(Error::UnknownDevice)?;
        disk.log_sector_size = 9;
        disk.total_sectors = data.lv.size;
        disk.data = Box::new(data);
        Ok(())
    }

    fn read(&self, core: &Core, disk: &Disk, sector_hw: u64, count_hw: u32, buf: &mut [u8]) -> Result<()> {
        let data = disk.data.downcast_ref::<LvDiskData>().ok_or(Error::BadArgument)?;
        let mut sector = sector_hw;
        let mut remaining = count_hw as u64;
        let mut pos = 0usize;

        while remaining > 0 {
            let (target, len) = next_chunk(data, sector, remaining)?;
            let bytes = (len * 512) as usize;
            let dst = &mut buf[pos..pos + bytes];
            match target {
                Target::Pv { disk_name, sector: abs } => {
                    let mut child = core.open(&disk_name)?;
                    let res = core.read(&mut child, abs, 0, bytes, dst);
                    core.close(child);
                    res?;
                }
                Target::Lv { vg_name, lv_name, sector: rel } => {
                    let child_name = format!("lv/{vg_name}/{lv_name}");
                    let mut child = core.open(&child_name)?;
                    let res = core.read(&mut child, rel, 0, bytes, dst);
                    core.close(child);
                    res?;
                }
            }
            sector += len;
            remaining -= len;
            pos += bytes;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use types::{LogicalVolume, Segment};

    fn lv_with(kind: SegmentKind, start_extent: u64, extent_count: u64) -> LogicalVolume {
        LogicalVolume {
            name: "root".into(),
            id: "x".into(),
            visible: true,
            segments: vec![Segment {
                start_extent,
                extent_count,
                kind,
            }],
            size: extent_count * 8192,
        }
    }

    fn base_data(lv: LogicalVolume) -> LvDiskData {
        LvDiskData {
            vg_name: "myvg".into(),
            lv,
            extent_size: 8192,
            pv_backing: vec![("pv0".into(), "hostdisk//pv0.img".into(), 2048)],
        }
    }

    #[test]
    fn linear_segment_resolves_to_backing_pv() {
        let data = base_data(lv_with(
            SegmentKind::Linear {
                node: NodeRef { name: "pv0".into(), start: 0 },
            },
            0,
            10,
        ));
        let (target, len) = next_chunk(&data, 100, 50).unwrap();
        assert_eq!(len, 50);
        match target {
            Target::Pv { disk_name, sector } => {
                assert_eq!(disk_name, "hostdisk//pv0.img");
                assert_eq!(sector, 2048 + 100);
            }
            _ => panic!("expected Pv target"),
        }
    }

    #[test]
    fn striped_segment_round_robins_and_caps_at_stripe_boundary() {
        let data = base_data(lv_with(
            SegmentKind::Striped {
                stripe_size: 64,
                nodes: vec![
                    NodeRef { name: "pv0".into(), start: 0 },
                    NodeRef { name: "pv1".into(), start: 0 },
                ],
            },
            0,
            100,
        ));
        // Sector 64 is the start of stripe index 1, which lands on node 1.
        let (_target, len) = next_chunk(&data, 64, 1000).unwrap();
        assert_eq!(len, 64);
    }

    #[test]
    fn raid4_parity_is_fixed_last_and_data_stays_in_order() {
        let nodes: Vec<NodeRef> = (0..4)
            .map(|i| NodeRef { name: format!("pv{i}"), start: 0 })
            .collect();
        let data = base_data(lv_with(
            SegmentKind::Raid {
                layout: RaidLayout::Raid4,
                stripe_size: 64,
                nodes,
            },
            0,
            300,
        ));
        // 3 data disks; chunk 0 (sectors 0..64) is data_slot 0 -> pv0.
        let (target, len) = next_chunk(&data, 0, 1000).unwrap();
        assert_eq!(len, 64);
        match target {
            Target::Pv { disk_name, .. } => assert_eq!(disk_name, "hostdisk//pv0.img"),
            _ => panic!("expected Pv target"),
        }
    }

    #[test]
    fn raid5_left_symmetric_maps_every_stripe_to_exactly_one_child() {
        let nodes: Vec<NodeRef> = (0..4)
            .map(|i| NodeRef { name: format!("pv{i}"), start: 0 })
            .collect();
        let raid_disks = nodes.len();
        let stripe_size = 8u64;
        let data_disks = raid_disks - 1;

        // Walk every data slot of the first few stripes and check the
        // (stripe, disk) pairs are all distinct -- the parity position
        // rotates, so no two data slots in the same stripe should ever
        // collide on the same child.
        for stripe in 0..raid_disks as u64 {
            let mut seen = std::collections::HashSet::new();
            for slot in 0..data_disks {
                let disk = raid_data_disk(RaidLayout::Raid5LeftSymmetric, raid_disks, stripe, slot);
                assert!(disk < raid_disks);
                assert!(seen.insert(disk), "stripe {stripe} slot {slot} collided on disk {disk}");
            }
        }
    }

    #[test]
    fn raid6_right_asymmetric_maps_every_stripe_to_exactly_one_child() {
        let raid_disks = 5usize;
        let data_disks = raid_disks - 2;
        for stripe in 0..raid_disks as u64 {
            let mut seen = std::collections::HashSet::new();
            for slot in 0..data_disks {
                let disk = raid_data_disk(RaidLayout::Raid6RightAsymmetric, raid_disks, stripe, slot);
                assert!(disk < raid_disks);
                assert!(seen.insert(disk), "stripe {stripe} slot {slot} collided on disk {disk}");
            }
        }
    }

    #[test]
    fn raid_segment_resolves_through_backing_pv() {
        let nodes: Vec<NodeRef> = (0..3)
            .map(|i| NodeRef { name: format!("pv{i}"), start: 0 })
            .collect();
        let mut lv = lv_with(
            SegmentKind::Raid {
                layout: RaidLayout::Raid5LeftSymmetric,
                stripe_size: 16,
                nodes,
            },
            0,
            200,
        );
        lv.name = "raided".into();
        let mut data = base_data(lv);
        data.pv_backing = vec![
            ("pv0".into(), "hostdisk//pv0.img".into(), 0),
            ("pv1".into(), "hostdisk//pv1.img".into(), 0),
            ("pv2".into(), "hostdisk//pv2.img".into(), 0),
        ];
        let (_target, len) = next_chunk(&data, 0, 1000).unwrap();
        assert_eq!(len, 16);
    }

    #[test]
    fn parses_open_name() {
        assert_eq!(parse_name("lv/myvg/root"), Some(("myvg", "root")));
        assert_eq!(parse_name("hostdisk//x"), None);
    }
}
