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

//! Legacy 8-bit name transcoding: label and file names returned to callers
//! are always UTF-8, while on-disk legacy names are Latin-1. AFFS and SFS
//! names and symlink targets both go through here.

/// Each Latin-1 byte is its own Unicode code point, so this never fails;
/// `MAX_UTF8_PER_LATIN1` bounds how many UTF-8 bytes one input byte can
/// expand to.
pub const MAX_UTF8_PER_LATIN1: usize = 2;

pub fn to_utf8(bytes: &[u8]) -> String {
    let mut out = String::with_capacity(bytes.len() * MAX_UTF8_PER_LATIN1);
    out.extend(bytes.iter().map(|&b| b as char));
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ascii_round_trips() {
        assert_eq!(to_utf8(b"readme.txt"), "readme.txt");
    }

    #[test]
    fn high_bytes_expand_to_two_utf8_bytes() {
        let s = to_utf8(&[0xe9]); // Latin-1 'é'
        assert_eq!(s, "\u{e9}");
        assert_eq!(s.len(), 2);
    }
}
