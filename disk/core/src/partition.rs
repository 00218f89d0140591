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

/// One partition on a chain from outermost (disk) to innermost (what the
/// disk actually addresses). Immutable once probed.
///
/// `start`/`len` are in 512-byte standard sectors, relative to the
/// enclosing partition (or the whole disk, for the outermost entry).
#[derive(Debug, Clone)]
pub struct Partition {
    pub start: u64,
    pub len: u64,
    pub number: u32,
    pub partmap: &'static str,
    pub parent: Option<Box<Partition>>,
}

impl Partition {
    pub fn new(start: u64, len: u64, number: u32, partmap: &'static str) -> Self {
        Self {
            start,
            len,
            number,
            partmap,
            parent: None,
        }
    }

    pub fn nested(mut self, parent: Partition) -> Self {
        self.parent = Some(Box::new(parent));
        self
    }

    /// Total length of this (innermost) partition, in standard sectors.
    /// Matches `holy_partition_get_len`: only the innermost entry's `len`
    /// matters, parents only contribute offset.
    pub fn len(&self) -> u64 {
        self.len
    }

    /// Iterator from innermost (self) outward to the outermost ancestor.
    pub fn chain(&self) -> PartitionChainIter<'_> {
        PartitionChainIter { next: Some(self) }
    }
}

pub struct PartitionChainIter<'a> {
    next: Option<&'a Partition>,
}

impl<'a> Iterator for PartitionChainIter<'a> {
    type Item = &'a Partition;

    fn next(&mut self) -> Option<Self::Item> {
        let cur = self.next.take()?;
        self.next = cur.parent.as_deref();
        Some(cur)
    }
}
