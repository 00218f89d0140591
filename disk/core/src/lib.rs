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

//! Backend abstraction, disk facade, partition chain and sector cache for
//! the holycore boot-time disk stack.
//!
//! This crate has no concept of any on-disk filesystem format; it only
//! answers "give me these bytes from this named drive". Format drivers
//! live in `holycore-fs` and its per-format sibling crates.

pub mod backend;
pub mod cache;
pub mod config;
mod core;
mod disk;
mod partition;

pub use backend::{Backend, BackendData, PullStage};
pub use core::{Clock, Core, PartitionResolver, SystemClock};
pub use disk::{Disk, ReadHook};
pub use partition::{Partition, PartitionChainIter};

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    /// An in-memory backend used only to exercise the facade/cache
    /// algorithms; real backends live in `holycore-disk-hostdisk` and
    /// `holycore-disk-firmware`.
    struct MemBackend {
        image: Vec<u8>,
        read_calls: RefCell<u32>,
    }

    impl Backend for MemBackend {
        fn dev_id(&self) -> u32 {
            99
        }

        fn open(&self, name: &str, disk: &mut Disk) -> holycore_err::Result<()> {
            if name != "mem0" {
                return Err(holycore_err::Error::UnknownDevice);
            }
            disk.log_sector_size = 9;
            disk.total_sectors = (self.image.len() / 512) as u64;
            disk.max_agglomerate = 32;
            Ok(())
        }

        fn read(&self, _core: &Core, _disk: &Disk, sector_hw: u64, count_hw: u32, buf: &mut [u8]) -> holycore_err::Result<()> {
            *self.read_calls.borrow_mut() += 1;
            let start = sector_hw as usize * 512;
            let len = count_hw as usize * 512;
            buf.copy_from_slice(&self.image[start..start + len]);
            Ok(())
        }
    }

    fn make_core(image_len: usize) -> (Core, Disk) {
        let image: Vec<u8> = (0..image_len).map(|i| (i % 251) as u8).collect();
        let mut core = Core::new();
        core.register_backend(Box::new(MemBackend {
            image,
            read_calls: RefCell::new(0),
        }));
        let disk = core.open("mem0").unwrap();
        (core, disk)
    }

    #[test]
    fn read_returns_exact_bytes() {
        let (core, mut disk) = make_core(1024 * 1024);
        let mut buf = [0u8; 37];
        core.read(&mut disk, 10, 5, 37, &mut buf).unwrap();
        for (i, b) in buf.iter().enumerate() {
            let abs = 10 * 512 + 5 + i;
            assert_eq!(*b, (abs % 251) as u8);
        }
    }

    #[test]
    fn zero_length_read_succeeds() {
        let (core, mut disk) = make_core(4096);
        let mut buf: [u8; 0] = [];
        core.read(&mut disk, 0, 0, 0, &mut buf).unwrap();
    }

    #[test]
    fn read_out_of_range_fails_before_touching_backend() {
        let (core, mut disk) = make_core(4096);
        let mut buf = [0u8; 16];
        let err = core.read(&mut disk, 1_000_000, 0, 16, &mut buf).unwrap_err();
        assert_eq!(err, holycore_err::Error::OutOfRange);
    }

    #[test]
    fn partition_chain_offsets_are_additive() {
        let (core, mut disk) = make_core(16 * 1024 * 1024);
        // Outer msdos partition at std-sector 2048, inner bsd slice at 100.
        disk.partition = Some(
            Partition::new(100, 1000, 0, "bsd").nested(Partition::new(2048, 20000, 0, "msdos")),
        );
        let mut buf = [0u8; 4];
        core.read(&mut disk, 0, 0, 4, &mut buf).unwrap();
        let expected_abs = (2048 + 100) * 512;
        assert_eq!(buf, [(expected_abs % 251) as u8, ((expected_abs + 1) % 251) as u8, ((expected_abs + 2) % 251) as u8, ((expected_abs + 3) % 251) as u8]);
    }

    #[test]
    fn repeated_reads_hit_cache_and_agree() {
        let (core, mut disk) = make_core(1024 * 1024);
        let mut a = [0u8; 8192];
        let mut b = [0u8; 8192];
        core.read(&mut disk, 0, 0, 8192, &mut a).unwrap();
        core.read(&mut disk, 0, 0, 8192, &mut b).unwrap();
        assert_eq!(a, b);
    }
}
