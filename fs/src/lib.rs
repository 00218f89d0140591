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

//! Filesystem dispatcher and the shared helpers every on-disk format driver
//! builds on: path walking with symlink resolution (`path::find_file`) and
//! the block-mapping streaming read (`block_map::read_range`). Individual
//! formats (AFFS, MINIX, UFS, SFS) live in sibling crates and only implement
//! the small [`Format`] and [`block_map::BlockSource`] seams.

pub use holycore_err::{Error, Result};

pub mod block_map;
pub mod latin1;
pub mod path;

use holycore_disk::{Core, Disk};
use std::any::Any;

pub use path::find_file;

/// At most 8 symlinks resolved per path lookup (shared by every format:
/// AFFS hardlinks, MINIX/UFS/SFS symlinks).
pub const SYMLINK_NEST_MAX: u32 = 8;

/// Metadata a directory walk or listing reports about one entry, without
/// committing to a format-specific node representation.
#[derive(Debug, Clone, Copy)]
pub struct EntryInfo {
    pub is_dir: bool,
    /// Seconds since the Unix epoch, after any format-specific epoch
    /// conversion.
    pub mtime: u64,
}

/// One on-disk filesystem format's view of directory structure, shared by
/// [`path::find_file`]. A format crate implements this once; path walking,
/// symlink dereferencing and loop detection all live here instead of being
/// reimplemented per driver.
pub trait Format {
    type Node: Clone;

    fn root(&self) -> Self::Node;

    /// Looks up `name` as a direct child of `dir`. `Ok(None)` means "no such
    /// entry", which the caller turns into `Error::FileNotFound`.
    fn lookup(
        &self,
        core: &Core,
        disk: &mut Disk,
        dir: &Self::Node,
        name: &str,
    ) -> Result<Option<(Self::Node, EntryInfo)>>;

    /// `Ok(Some(target))` if `node` is a symlink; the target is an
    /// already-UTF-8 path, absolute or relative. `Ok(None)` for anything
    /// else.
    fn read_symlink(&self, core: &Core, disk: &mut Disk, node: &Self::Node) -> Result<Option<String>>;
}

/// An open regular file: the format-specific node plus the cursor the
/// generic read advances. Kept separate from `Format::Node` because a file
/// read may need mutable per-open state (e.g. AFFS's block-pointer cache)
/// that a bare directory-walk node does not.
pub struct OpenFile<N> {
    pub node: N,
    pub size: u64,
    pub offset: u64,
}

/// A mounted filesystem, as the dispatcher and `holycore-fsck` see it --
/// format-erased behind a trait object so several formats can be tried in
/// registration order without the caller knowing which one matched.
pub trait MountedFs {
    fn open(&self, core: &Core, disk: &mut Disk, path: &str) -> Result<Box<dyn Any>>;

    fn read(&self, core: &Core, disk: &mut Disk, file: &mut dyn Any, buf: &mut [u8]) -> Result<usize>;

    fn size(&self, file: &dyn Any) -> u64;

    fn dir(
        &self,
        core: &Core,
        disk: &mut Disk,
        path: &str,
        visit: &mut dyn FnMut(&str, EntryInfo) -> bool,
    ) -> Result<()>;

    fn label(&self, _core: &Core, _disk: &mut Disk) -> Result<String> {
        Err(Error::NotImplemented)
    }

    fn uuid(&self, _core: &Core, _disk: &mut Disk) -> Result<String> {
        Err(Error::NotImplemented)
    }

    fn mtime(&self, _core: &Core, _disk: &mut Disk) -> Result<u64> {
        Err(Error::NotImplemented)
    }
}

/// One registered on-disk format. `mount` hands the `Disk` back on failure
/// -- `Disk` is not `Clone`, it owns the backend's private state and an
/// optional read hook -- so the dispatcher can retry the next driver
/// without reopening the device.
pub trait FsDriver {
    fn name(&self) -> &'static str;

    fn mount(&self, core: &Core, disk: Disk) -> std::result::Result<(Box<dyn MountedFs>, Disk), (Error, Disk)>;
}

/// Registered list of filesystem drivers, tried in registration order.
/// Mirrors `holycore_diskfilter::Diskfilter`'s and
/// `holycore_cryptodisk::Cryptodisk`'s "process-wide registry, first match
/// wins" shape.
#[derive(Default)]
pub struct Dispatcher {
    drivers: Vec<Box<dyn FsDriver>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, driver: Box<dyn FsDriver>) {
        self.drivers.push(driver);
    }

    /// Tries every registered driver against `disk` in registration order.
    /// The first driver whose `mount` does not return `Error::BadFs` wins;
    /// any other error aborts the probe immediately.
    pub fn probe(
        &self,
        core: &Core,
        mut disk: Disk,
    ) -> std::result::Result<(&'static str, Box<dyn MountedFs>, Disk), Error> {
        for driver in &self.drivers {
            match driver.mount(core, disk) {
                Ok((mounted, disk)) => return Ok((driver.name(), mounted, disk)),
                Err((Error::BadFs, returned_disk)) => {
                    disk = returned_disk;
                    continue;
                }
                Err((e, _)) => return Err(e),
            }
        }
        Err(Error::BadFs)
    }
}
