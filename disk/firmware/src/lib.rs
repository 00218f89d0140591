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

//! Firmware disk backends: BIOS `int 0x13` (`hd%d`/`fd%d`/`cd`), IEEE-1275
//! Open Firmware (`ieee1275/<devpath>`), and SCSI/USB mass storage.
//!
//! None of these can do real I/O from hosted Rust — there is no BIOS, no
//! Open Firmware client interface, and no raw SCSI transport to call into
//! outside of a boot-time environment. Each backend still does the part
//! that doesn't need hardware: name grammar, drive-number parsing, and
//! enumeration, so the facade's `open`/`iterate` paths exercise the real
//! code a firmware build would run. `read`/`write` report
//! [`holycore_err::Error::NotImplemented`].

pub mod biosdisk;
pub mod ofdisk;
pub mod scsi;

pub use biosdisk::BiosdiskBackend;
pub use ofdisk::OfdiskBackend;
pub use scsi::ScsiBackend;
