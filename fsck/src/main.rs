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

//! Mounts a disk image, then lists a directory or cats a file -- a small
//! smoke test for the disk and filesystem stack, and a place for `log`
//! output to land when chasing down a `BadFs`/`Inconsistent` report.

use std::process::ExitCode;

use clap::{Parser, Subcommand};
use holycore_disk::Core;
use holycore_err::Result;
use holycore_fs::{Dispatcher, MountedFs};
use log::error;

#[derive(Parser)]
#[command(name = "holycore-fsck", about = "Mount an image and inspect it")]
struct Args {
    /// Path to the disk image, passed straight to `hostdisk//path`.
    image: String,

    /// Partition spec following the drive, e.g. `msdos1` or `msdos1,bsd1`.
    #[arg(long)]
    partition: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List a directory.
    Ls { path: String },
    /// Print a file's contents to stdout.
    Cat { path: String },
}

fn build_core() -> Core {
    let mut core = Core::new();
    core.register_backend(Box::new(holycore_disk_hostdisk::HostdiskBackend));
    core.set_partition_resolver(Box::new(holycore_partmap::BiosPartitionResolver));
    core
}

fn build_dispatcher() -> Dispatcher {
    let mut dispatcher = Dispatcher::new();
    dispatcher.register(Box::new(holycore_fs_affs::AffsDriver));
    dispatcher.register(Box::new(holycore_fs_minix::MinixDriver));
    dispatcher.register(Box::new(holycore_fs_ufs::UfsDriver));
    dispatcher.register(Box::new(holycore_fs_sfs::SfsDriver));
    dispatcher
}

fn run(args: &Args) -> Result<()> {
    let core = build_core();
    let dispatcher = build_dispatcher();

    let name = match &args.partition {
        Some(spec) => format!("hostdisk/{},{spec}", args.image),
        None => format!("hostdisk/{}", args.image),
    };
    let disk = core.open(&name)?;
    let (fs_name, mounted, mut disk) = match dispatcher.probe(&core, disk) {
        Ok(result) => result,
        Err(e) => {
            error!("fsck: no driver could mount `{name}': {e}");
            return Err(e);
        }
    };
    log::info!("fsck: mounted as {fs_name}");

    match &args.command {
        Command::Ls { path } => {
            mounted.dir(&core, &mut disk, path, &mut |name, info| {
                println!("{}{}", name, if info.is_dir { "/" } else { "" });
                true
            })?;
        }
        Command::Cat { path } => {
            let mut file = mounted.open(&core, &mut disk, path)?;
            let size = mounted.size(&*file);
            let mut remaining = size;
            let mut buf = [0u8; 4096];
            use std::io::Write;
            let stdout = std::io::stdout();
            let mut lock = stdout.lock();
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = mounted.read(&core, &mut disk, &mut *file, &mut buf[..want])?;
                if n == 0 {
                    break;
                }
                lock.write_all(&buf[..n]).map_err(|_| holycore_err::Error::Io)?;
                remaining -= n as u64;
            }
        }
    }

    core.close(disk);
    Ok(())
}

fn main() -> ExitCode {
    env_logger::init();
    let args = Args::parse();
    match run(&args) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("fsck: {e}");
            ExitCode::FAILURE
        }
    }
}
