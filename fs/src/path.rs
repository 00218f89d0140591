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

//! Generic path walk shared by every format driver: resolve each path
//! component via `Format::lookup`, dereferencing
//! symlinks inline with a loop counter. An absolute symlink target restarts
//! resolution from the filesystem root; a relative one splices its
//! components in front of whatever path remains.

use std::collections::VecDeque;

use holycore_disk::{Core, Disk};
use holycore_err::{Error, Result};

use crate::{EntryInfo, Format, SYMLINK_NEST_MAX};

pub fn find_file<F: Format>(fmt: &F, core: &Core, disk: &mut Disk, path: &str) -> Result<(F::Node, EntryInfo)> {
    let mut node = fmt.root();
    let mut info = EntryInfo { is_dir: true, mtime: 0 };
    let mut components: VecDeque<String> = path.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
    let mut symlink_hops = 0u32;

    while let Some(name) = components.pop_front() {
        if name == "." {
            continue;
        }
        let Some((next_node, next_info)) = fmt.lookup(core, disk, &node, &name)? else {
            return Err(Error::FileNotFound);
        };
        if let Some(target) = fmt.read_symlink(core, disk, &next_node)? {
            symlink_hops += 1;
            if symlink_hops > SYMLINK_NEST_MAX {
                return Err(Error::SymlinkLoop);
            }
            let rest = std::mem::take(&mut components);
            let mut spliced: VecDeque<String> =
                target.split('/').filter(|s| !s.is_empty()).map(String::from).collect();
            spliced.extend(rest);
            components = spliced;
            if target.starts_with('/') {
                node = fmt.root();
                info = EntryInfo { is_dir: true, mtime: 0 };
            }
            continue;
        }
        node = next_node;
        info = next_info;
    }
    Ok((node, info))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashMap;

    /// A tiny in-memory `Format` impl just to exercise the walk and the
    /// symlink-splicing logic without any real disk I/O.
    struct Tree {
        // path (no leading slash) -> (is_dir, symlink target or None)
        entries: RefCell<HashMap<String, (bool, Option<String>)>>,
    }

    impl Format for Tree {
        type Node = String;

        fn root(&self) -> String {
            String::new()
        }

        fn lookup(&self, _c: &Core, _d: &mut Disk, dir: &String, name: &str) -> Result<Option<(String, EntryInfo)>> {
            let full = if dir.is_empty() {
                name.to_string()
            } else {
                format!("{dir}/{name}")
            };
            let entries = self.entries.borrow();
            match entries.get(&full) {
                Some((is_dir, _)) => Ok(Some((full.clone(), EntryInfo { is_dir: *is_dir, mtime: 0 }))),
                None => Ok(None),
            }
        }

        fn read_symlink(&self, _c: &Core, _d: &mut Disk, node: &String) -> Result<Option<String>> {
            Ok(self.entries.borrow().get(node).and_then(|(_, link)| link.clone()))
        }
    }

    struct NullBackend;

    impl holycore_disk::Backend for NullBackend {
        fn dev_id(&self) -> u32 {
            1
        }

        fn open(&self, _name: &str, disk: &mut Disk) -> Result<()> {
            disk.log_sector_size = 9;
            disk.total_sectors = 0;
            Ok(())
        }

        fn read(&self, _core: &Core, _disk: &Disk, _sector_hw: u64, _count_hw: u32, _buf: &mut [u8]) -> Result<()> {
            Err(Error::Io)
        }
    }

    fn core_disk() -> (Core, Disk) {
        let mut core = Core::new();
        core.register_backend(Box::new(NullBackend));
        let disk = core.open("anything").unwrap();
        (core, disk)
    }

    #[test]
    fn walks_plain_path() {
        let mut entries = HashMap::new();
        entries.insert("a".into(), (true, None));
        entries.insert("a/b".into(), (false, None));
        let tree = Tree { entries: RefCell::new(entries) };
        let (core, mut disk) = core_disk();
        let (node, info) = find_file(&tree, &core, &mut disk, "a/b").unwrap();
        assert_eq!(node, "a/b");
        assert!(!info.is_dir);
    }

    #[test]
    fn follows_relative_symlink() {
        let mut entries = HashMap::new();
        entries.insert("a".into(), (true, None));
        entries.insert("a/link".into(), (false, Some("b".into())));
        entries.insert("a/b".into(), (false, None));
        let tree = Tree { entries: RefCell::new(entries) };
        let (core, mut disk) = core_disk();
        let (node, _) = find_file(&tree, &core, &mut disk, "a/link").unwrap();
        assert_eq!(node, "a/b");
    }

    #[test]
    fn rejects_too_many_symlink_hops() {
        let mut entries = HashMap::new();
        entries.insert("loop".into(), (false, Some("loop".into())));
        let tree = Tree { entries: RefCell::new(entries) };
        let (core, mut disk) = core_disk();
        let err = find_file(&tree, &core, &mut disk, "loop").unwrap_err();
        assert_eq!(err, Error::SymlinkLoop);
    }
}
