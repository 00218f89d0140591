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

//! In-memory model of a parsed LVM2 volume group.

/// A reference to one child of a segment: either a physical volume or (for
/// a segment that mirrors/stripes onto another logical volume, which LVM2
/// permits for `PVMOVE`) another LV, resolved by name within the same VG.
#[derive(Debug, Clone)]
pub struct NodeRef {
    pub name: String,
    /// Byte offset (in standard sectors) into the named child where this
    /// segment's data begins.
    pub start: u64,
}

/// Which child rotates as parity (or parity+Q) for a given stripe, per
/// segment type §4.5 names.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RaidLayout {
    /// (N-1) data + 1 parity; parity fixed on the last child.
    Raid4,
    /// (N-1) data + 1 parity; parity rotates left-symmetric per stripe.
    Raid5LeftSymmetric,
    /// (N-2) data + P + Q; both rotate right-asymmetric per stripe.
    Raid6RightAsymmetric,
}

#[derive(Debug, Clone)]
pub enum SegmentKind {
    /// Plain linear mapping onto a single child.
    Linear { node: NodeRef },
    /// Round-robin across `nodes` at `stripe_size` (in standard sectors)
    /// granularity.
    Striped { stripe_size: u64, nodes: Vec<NodeRef> },
    /// All nodes carry the same data. `pvmove` marks an in-progress
    /// `PVMOVE`, in which case only `nodes[0]` is trusted.
    Mirror { nodes: Vec<NodeRef>, pvmove: bool },
    /// RAID4/5/6 parity layout. `nodes` carries every child disk (data and
    /// parity/Q) in on-disk order; `layout` picks the stripe-to-parity
    /// rotation that locates the data child for a given LV extent. Only the
    /// healthy-path read (no missing child) is resolved here -- degraded-mode
    /// parity reconstruction is "raid5rec"/"raid6rec"-style work delegated
    /// out of scope, see DESIGN.md.
    Raid {
        layout: RaidLayout,
        stripe_size: u64,
        nodes: Vec<NodeRef>,
    },
}

#[derive(Debug, Clone)]
pub struct Segment {
    pub start_extent: u64,
    pub extent_count: u64,
    pub kind: SegmentKind,
}

#[derive(Debug, Clone)]
pub struct LogicalVolume {
    pub name: String,
    pub id: String,
    pub visible: bool,
    pub segments: Vec<Segment>,
    /// Total size in standard sectors (sum of `extent_count * extent_size`
    /// over all segments).
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct PhysicalVolume {
    pub name: String,
    pub id: String,
    /// Start of the PV's data area, in standard sectors from the start of
    /// the backing disk.
    pub pe_start: u64,
}

#[derive(Debug, Clone)]
pub struct VolumeGroup {
    pub name: String,
    pub id: String,
    /// Extent size, in standard sectors.
    pub extent_size: u64,
    pub pvs: Vec<PhysicalVolume>,
    pub lvs: Vec<LogicalVolume>,
}

impl VolumeGroup {
    pub fn find_lv(&self, name: &str) -> Option<&LogicalVolume> {
        self.lvs.iter().find(|lv| lv.name == name)
    }

    pub fn find_pv(&self, name: &str) -> Option<&PhysicalVolume> {
        self.pvs.iter().find(|pv| pv.name == name)
    }
}
