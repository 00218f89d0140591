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

//! Textual LVM2 metadata parser, grounded on `holy_lvm_getvalue`/
//! `holy_lvm_check_flag`'s cursor-advancing scan style: each helper takes
//! the buffer and a cursor position and returns the value plus the cursor
//! just past it, the way the original walks a raw `char *` forward.

use holycore_err::{Error, Result};

use crate::types::{LogicalVolume, NodeRef, PhysicalVolume, RaidLayout, Segment, SegmentKind, VolumeGroup};

/// Finds `key` and returns the `u64` immediately following `" = "`, plus
/// the position just after the parsed digits.
fn get_value(text: &str, from: usize, key: &str) -> Result<(u64, usize)> {
    let pos = text[from..].find(key).ok_or(Error::BadFs)? + from + key.len();
    let digits_end = text[pos..]
        .find(|c: char| !c.is_ascii_digit())
        .map(|i| pos + i)
        .unwrap_or(text.len());
    let value: u64 = text[pos..digits_end].parse().map_err(|_| Error::BadFs)?;
    Ok((value, digits_end))
}

fn get_quoted(text: &str, from: usize, key: &str) -> Result<(String, usize)> {
    let pos = text[from..].find(key).ok_or(Error::BadFs)? + from + key.len();
    let quote_start = text[pos..].find('"').ok_or(Error::BadFs)? + pos + 1;
    let quote_end = text[quote_start..].find('"').ok_or(Error::BadFs)? + quote_start;
    Ok((text[quote_start..quote_end].to_string(), quote_end + 1))
}

/// `status = [ "FOO", "BAR" ]`-style flag check within the LV's own
/// sub-block (bounded by `end` so a later LV's flags aren't matched).
fn check_flag(text: &str, from: usize, end: usize, flag: &str) -> bool {
    let Some(rel) = text[from..end].find("status") else {
        return false;
    };
    let block = &text[from + rel..end];
    let Some(bracket) = block.find('[') else {
        return false;
    };
    block[bracket..].contains(&format!("\"{flag}\""))
}

fn block_end(text: &str, open_brace: usize) -> Result<usize> {
    let mut depth = 0i32;
    for (i, c) in text[open_brace..].char_indices() {
        match c {
            '{' => depth += 1,
            '}' => {
                depth -= 1;
                if depth == 0 {
                    return Ok(open_brace + i);
                }
            }
            _ => {}
        }
    }
    Err(Error::BadFs)
}

fn next_token(text: &str, from: usize) -> (&str, usize) {
    let s = &text[from..];
    let start = s.find(|c: char| !c.is_whitespace()).unwrap_or(s.len());
    let rel_end = s[start..].find(char::is_whitespace).unwrap_or(s.len() - start);
    (&s[start..start + rel_end], from + start + rel_end)
}

fn parse_node_list(text: &str, from: usize, extent_size: u64) -> Result<(Vec<NodeRef>, usize)> {
    let start = text[from..].find('[').ok_or(Error::BadFs)? + from + 1;
    let end = text[start..].find(']').ok_or(Error::BadFs)? + start;
    let list = &text[start..end];

    let mut nodes = Vec::new();
    let mut cursor = 0usize;
    while let Some(q1) = list[cursor..].find('"') {
        let name_start = cursor + q1 + 1;
        let name_end = name_start + list[name_start..].find('"').ok_or(Error::BadFs)?;
        let name = list[name_start..name_end].to_string();

        let after_name = name_end + 1;
        let comma = list[after_name..].find(',').ok_or(Error::BadFs)? + after_name + 1;
        let digits_end = list[comma..]
            .find(|c: char| !c.is_ascii_digit() && c != ' ')
            .map(|i| comma + i)
            .unwrap_or(list.len());
        let offset_extents: u64 = list[comma..digits_end].trim().parse().map_err(|_| Error::BadFs)?;
        nodes.push(NodeRef {
            name,
            start: offset_extents * extent_size,
        });
        cursor = digits_end;
    }
    Ok((nodes, end + 1))
}

/// `device_count = N`, `stripe_size = N`, then the `raids = [ ... ]` child
/// list -- the same shape as `striped`'s `stripe_count`/`stripe_size`/
/// `stripes`, since LVM2 describes every striped-geometry segment type with
/// the same trio of keys.
fn parse_raid_children(text: &str, from: usize, extent_size: u64) -> Result<(Vec<NodeRef>, u64, usize)> {
    let (_device_count, cursor) = get_value(text, from, "device_count = ")?;
    let (stripe_size, cursor) = get_value(text, cursor, "stripe_size = ")?;
    let (nodes, next) = parse_node_list(text, cursor, extent_size)?;
    Ok((nodes, stripe_size, next))
}

/// RAID4 metadata lists the parity child first; callers read through
/// `nodes` expecting parity last (matching RAID5/6), so move it.
fn rotate_parity_to_end(mut nodes: Vec<NodeRef>) -> Vec<NodeRef> {
    if !nodes.is_empty() {
        let parity = nodes.remove(0);
        nodes.push(parity);
    }
    nodes
}

fn parse_segment(text: &str, from: usize, end: usize, extent_size: u64) -> Result<(Segment, usize)> {
    let open_brace = text[from..end].find('{').ok_or(Error::BadFs)? + from;
    let seg_end = block_end(text, open_brace)?;

    let (start_extent, cursor) = get_value(text, open_brace, "start_extent = ")?;
    let (extent_count, cursor) = get_value(text, cursor, "extent_count = ")?;
    let (kind_name, cursor) = get_quoted(text, cursor, "type = ")?;

    let kind = match kind_name.as_str() {
        "striped" => {
            let (node_count, cursor) = get_value(text, cursor, "stripe_count = ")?;
            let (stripe_size, cursor) = if node_count != 1 {
                get_value(text, cursor, "stripe_size = ")?
            } else {
                (0, cursor)
            };
            let (nodes, _) = parse_node_list(text, cursor, extent_size)?;
            if node_count == 1 {
                SegmentKind::Linear {
                    node: nodes.into_iter().next().ok_or(Error::BadFs)?,
                }
            } else {
                SegmentKind::Striped { stripe_size, nodes }
            }
        }
        "mirror" => {
            let (_node_count, cursor) = get_value(text, cursor, "mirror_count = ")?;
            let (nodes, _) = parse_node_list(text, cursor, extent_size)?;
            let pvmove = check_flag(text, from, seg_end, "PVMOVE");
            SegmentKind::Mirror { nodes, pvmove }
        }
        raid if raid.starts_with("raid4") => {
            let (nodes, stripe_size, _) = parse_raid_children(text, cursor, extent_size)?;
            // The metadata lists parity first; rotate it to the last child
            // so reads can treat `nodes[..len-1]` as the data set uniformly
            // with RAID5/6.
            let nodes = rotate_parity_to_end(nodes);
            SegmentKind::Raid {
                layout: RaidLayout::Raid4,
                stripe_size,
                nodes,
            }
        }
        raid if raid.starts_with("raid5") => {
            let (nodes, stripe_size, _) = parse_raid_children(text, cursor, extent_size)?;
            SegmentKind::Raid {
                layout: RaidLayout::Raid5LeftSymmetric,
                stripe_size,
                nodes,
            }
        }
        raid if raid.starts_with("raid6") => {
            let (nodes, stripe_size, _) = parse_raid_children(text, cursor, extent_size)?;
            SegmentKind::Raid {
                layout: RaidLayout::Raid6RightAsymmetric,
                stripe_size,
                nodes,
            }
        }
        _ => return Err(Error::BadFs),
    };

    Ok((
        Segment {
            start_extent,
            extent_count,
            kind,
        },
        seg_end + 1,
    ))
}

fn parse_lv(text: &str, from: usize, end: usize, extent_size: u64) -> Result<(LogicalVolume, usize)> {
    let (name, _) = next_token(text, from);
    let open_brace = text[from..end].find('{').ok_or(Error::BadFs)? + from;
    let lv_end = block_end(text, open_brace)?;

    let visible = check_flag(text, open_brace, lv_end, "VISIBLE");
    let (id, cursor) = get_quoted(text, open_brace, "id = ")?;
    let (segment_count, mut cursor) = get_value(text, cursor, "segment_count = ")?;

    let mut segments = Vec::new();
    let mut size = 0u64;
    for _ in 0..segment_count {
        match parse_segment(text, cursor, lv_end, extent_size) {
            Ok((seg, next)) => {
                size += seg.extent_count * extent_size;
                segments.push(seg);
                cursor = next;
            }
            Err(_) => {
                // Unknown/unsupported segment type: skip the whole LV,
                // but the VG itself still registers.
                return Err(Error::BadFs);
            }
        }
    }

    Ok((
        LogicalVolume {
            name: name.to_string(),
            id,
            visible,
            segments,
            size,
        },
        lv_end + 1,
    ))
}

fn parse_pv(text: &str, from: usize, end: usize) -> Result<(PhysicalVolume, usize)> {
    let (name, _) = next_token(text, from);
    let open_brace = text[from..end].find('{').ok_or(Error::BadFs)? + from;
    let pv_end = block_end(text, open_brace)?;

    let (id, cursor) = get_quoted(text, open_brace, "id = ")?;
    let (pe_start, _) = get_value(text, cursor, "pe_start = ")?;

    Ok((
        PhysicalVolume {
            name: name.to_string(),
            id,
            pe_start,
        },
        pv_end + 1,
    ))
}

/// Parses one VG's textual metadata, as extracted from the MDA circular
/// buffer by [`crate::label::read_metadata_text`].
pub fn parse_vg_metadata(text: &str) -> Result<VolumeGroup> {
    let (name, after_name) = next_token(text, 0);
    let name = name.to_string();

    let (id, cursor) = get_quoted(text, after_name, "id = ")?;
    let (extent_size, cursor) = get_value(text, cursor, "extent_size = ")?;

    let mut pvs = Vec::new();
    if let Some(rel) = text[cursor..].find("physical_volumes {") {
        let block_start = cursor + rel + "physical_volumes {".len();
        let open_brace = cursor + rel + "physical_volumes ".len();
        let end = block_end(text, open_brace)?;
        let mut p = block_start;
        while p < end {
            let (tok, _) = next_token(text, p);
            if tok == "}" || tok.is_empty() {
                break;
            }
            let (pv, next) = parse_pv(text, p, end)?;
            pvs.push(pv);
            p = next;
        }
    }

    let mut lvs = Vec::new();
    if let Some(rel) = text[cursor..].find("logical_volumes {") {
        let block_start = cursor + rel + "logical_volumes {".len();
        let open_brace = cursor + rel + "logical_volumes ".len();
        let end = block_end(text, open_brace)?;
        let mut p = block_start;
        while p < end {
            let (tok, _) = next_token(text, p);
            if tok == "}" || tok.is_empty() {
                break;
            }
            match parse_lv(text, p, end, extent_size) {
                Ok((lv, next)) => {
                    lvs.push(lv);
                    p = next;
                }
                Err(_) => {
                    // Skip to the matching close brace of this LV and
                    // move on; the VG as a whole still registers.
                    let lv_open = text[p..end].find('{').map(|i| p + i);
                    match lv_open.and_then(|o| block_end(text, o).ok()) {
                        Some(lv_end) => p = lv_end + 1,
                        None => break,
                    }
                }
            }
        }
    }

    Ok(VolumeGroup {
        name,
        id,
        extent_size,
        pvs,
        lvs,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"myvg {
id = "aBcDeFgHiJkLmNoPqRsTuVwXyZ012345"
extent_size = 8192

physical_volumes {
pv0 {
id = "11111111111111111111111111111111"
pe_start = 2048
}
}

logical_volumes {
root {
id = "22222222222222222222222222222222"
status = ["READ", "WRITE", "VISIBLE"]
segment_count = 1

segment1 {
start_extent = 0
extent_count = 100
type = "striped"
stripe_count = 1

stripes = [
"pv0", 0
]
}
}
}
}"#;

    #[test]
    fn parses_vg_name_id_and_extent_size() {
        let vg = parse_vg_metadata(SAMPLE).unwrap();
        assert_eq!(vg.name, "myvg");
        assert_eq!(vg.extent_size, 8192);
    }

    #[test]
    fn parses_one_pv() {
        let vg = parse_vg_metadata(SAMPLE).unwrap();
        assert_eq!(vg.pvs.len(), 1);
        assert_eq!(vg.pvs[0].name, "pv0");
        assert_eq!(vg.pvs[0].pe_start, 2048);
    }

    #[test]
    fn parses_one_lv_with_linear_segment() {
        let vg = parse_vg_metadata(SAMPLE).unwrap();
        assert_eq!(vg.lvs.len(), 1);
        let lv = &vg.lvs[0];
        assert_eq!(lv.name, "root");
        assert!(lv.visible);
        assert_eq!(lv.segments.len(), 1);
        match &lv.segments[0].kind {
            SegmentKind::Linear { node } => {
                assert_eq!(node.name, "pv0");
                assert_eq!(node.start, 0);
            }
            other => panic!("expected Linear, got {other:?}"),
        }
    }

    const RAID5_SAMPLE: &str = r#"myvg {
id = "aBcDeFgHiJkLmNoPqRsTuVwXyZ012345"
extent_size = 8192

physical_volumes {
pv0 {
id = "11111111111111111111111111111111"
pe_start = 2048
}
pv1 {
id = "33333333333333333333333333333333"
pe_start = 2048
}
pv2 {
id = "44444444444444444444444444444444"
pe_start = 2048
}
}

logical_volumes {
redundant {
id = "22222222222222222222222222222222"
status = ["READ", "WRITE", "VISIBLE"]
segment_count = 1

segment1 {
start_extent = 0
extent_count = 100
type = "raid5_ls"
device_count = 3
stripe_size = 64

raids = [
"pv0", 0,
"pv1", 0,
"pv2", 0
]
}
}
}
}"#;

    #[test]
    fn parses_raid5_segment_with_its_children() {
        let vg = parse_vg_metadata(RAID5_SAMPLE).unwrap();
        let lv = &vg.lvs[0];
        assert_eq!(lv.segments.len(), 1);
        match &lv.segments[0].kind {
            SegmentKind::Raid { layout, stripe_size, nodes } => {
                assert_eq!(*layout, RaidLayout::Raid5LeftSymmetric);
                assert_eq!(*stripe_size, 64);
                assert_eq!(nodes.len(), 3);
                assert_eq!(nodes[0].name, "pv0");
                assert_eq!(nodes[2].name, "pv2");
            }
            other => panic!("expected Raid, got {other:?}"),
        }
    }
}
