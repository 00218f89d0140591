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

//! MS-DOS and GPT partition-table probing, registered as a
//! [`holycore_disk::PartitionResolver`] so the disk facade stays ignorant
//! of any on-disk partitioning format.

mod gpt;
mod msdos;

use holycore_disk::{Core, Disk, Partition, PartitionResolver};
use holycore_err::{Error, Result};

pub use gpt::GptEntry;

/// Splits `"msdos1,bsd1"` into `["msdos1", "bsd1"]`, honoring the same
/// backslash-escape convention the disk facade uses for the drive/spec
/// separator.
fn split_spec(spec: &str) -> Vec<&str> {
    let bytes = spec.as_bytes();
    let mut parts = Vec::new();
    let mut start = 0;
    let mut i = 0;
    while i < bytes.len() {
        match bytes[i] {
            b'\\' if i + 1 < bytes.len() && bytes[i + 1] == b',' => i += 2,
            b',' => {
                parts.push(&spec[start..i]);
                i += 1;
                start = i;
            }
            _ => i += 1,
        }
    }
    parts.push(&spec[start..]);
    parts
}

/// Splits `"msdos1"` into `("msdos", 1)`.
fn split_segment(segment: &str) -> Result<(&str, u32)> {
    let digits_start = segment
        .find(|c: char| c.is_ascii_digit())
        .ok_or(Error::BadFileName)?;
    let (name, digits) = segment.split_at(digits_start);
    let number: u32 = digits.parse().map_err(|_| Error::BadFileName)?;
    Ok((name, number))
}

pub struct BiosPartitionResolver;

impl PartitionResolver for BiosPartitionResolver {
    fn resolve(&self, core: &Core, disk: &mut Disk, spec: &str) -> Result<Partition> {
        let segments = split_spec(spec);
        let mut chain: Option<Partition> = None;

        for segment in segments {
            let (partmap, number) = split_segment(segment)?;
            // Probe against the chain built so far: every nested table is
            // read relative to its enclosing partition, so `disk.partition`
            // must already carry the outer chain while we read through it.
            disk.partition = chain.clone();
            let probed = match partmap {
                msdos::NAME => msdos::probe(core, disk, number),
                gpt::NAME => gpt::probe(core, disk, number),
                other => {
                    log::warn!("partmap: unrecognized partition map `{other}'");
                    Err(Error::BadFileName)
                }
            };
            let partition = probed?;
            chain = Some(match chain.take() {
                Some(parent) => partition.nested(parent),
                None => partition,
            });
        }
        disk.partition = None;

        chain.ok_or(Error::BadFileName)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_plain_spec() {
        assert_eq!(split_spec("msdos1,bsd1"), vec!["msdos1", "bsd1"]);
    }

    #[test]
    fn splits_single_segment() {
        assert_eq!(split_spec("gpt2"), vec!["gpt2"]);
    }

    #[test]
    fn parses_segment_name_and_number() {
        assert_eq!(split_segment("msdos1").unwrap(), ("msdos", 1));
        assert_eq!(split_segment("gpt12").unwrap(), ("gpt", 12));
    }
}
