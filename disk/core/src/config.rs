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

//! Compile-time sizing constants for the disk stack.
//!
//! These are `const`s rather than scattered literals so a host integration
//! can retune them in one place instead of hunting down inlined values.

/// Sectors per cache line (4 KiB at the standard 512-byte sector size).
pub const CACHE_LINE_SECTORS: u64 = 8;
/// `log2(CACHE_LINE_SECTORS)`, used for the line-aligning shifts.
pub const CACHE_LINE_SECTORS_LOG2: u32 = 3;
/// Number of direct-mapped cache slots.
pub const CACHE_NUM: usize = 1024;
/// Bytes held by one cache line.
pub const CACHE_LINE_BYTES: usize = (CACHE_LINE_SECTORS as usize) << STANDARD_SECTOR_BITS;

/// All partition arithmetic and cache addressing is in units of this size,
/// regardless of the backing device's native sector size.
pub const STANDARD_SECTOR_BITS: u32 = 9;
pub const STANDARD_SECTOR_SIZE: u64 = 1 << STANDARD_SECTOR_BITS;

/// Accepted range for `Disk::log_sector_size`.
pub const MIN_LOG_SECTOR_SIZE: u8 = 9;
pub const MAX_LOG_SECTOR_SIZE: u8 = 12;

/// Default largest run of cache lines a backend will be asked to satisfy in
/// one agglomerated read: 1 MiB / (8 sectors * 512 bytes) = 32 lines.
pub const DEFAULT_MAX_AGGLOMERATE: u32 = (1024 * 1024) / (CACHE_LINE_SECTORS as u32 * 512);

/// Maximum number of symlinks resolved while walking a single path.
pub const SYMLINK_NEST_MAX: u32 = 8;

/// Window after `close()` during which a subsequent `open()` still trusts
/// the cache; past this, removable media is assumed to have changed and the
/// whole cache is invalidated.
pub const CACHE_TIMEOUT_MS: u64 = 2000;

/// Sentinel for "total sector count is not known ahead of time".
pub const DISK_SIZE_UNKNOWN: u64 = u64::MAX;

/// Disk sizes are clamped to this many standard sectors (1 EiB) for safety
/// even when the backend reports (or fails to report) something larger.
pub const MAX_DISK_SECTORS: u64 = 1u64 << 51;

/// Each input Latin-1 byte expands to at most this many UTF-8 bytes.
pub const MAX_UTF8_PER_LATIN1: usize = 2;
