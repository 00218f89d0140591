//! Shared error type for every layer of the disk and filesystem stack:
//! backend drivers, the disk facade, the sector cache, partition and
//! diskfilter probing, and the filesystem drivers.

#[derive(thiserror::Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    #[error("I/O error")]
    Io,
    #[error("attempt to read or write outside of partition or disk")]
    OutOfRange,
    #[error("out of memory")]
    OutOfMemory,
    #[error("unknown device")]
    UnknownDevice,
    #[error("unrecognized filesystem")]
    BadFs,
    #[error("unexpected file type")]
    BadFileType,
    #[error("file not found")]
    FileNotFound,
    #[error("too many levels of symbolic links")]
    SymlinkLoop,
    #[error("bad file name")]
    BadFileName,
    #[error("bad argument")]
    BadArgument,
    #[error("not implemented")]
    NotImplemented,
    #[error("read error")]
    ReadError,
    #[error("write error")]
    WriteError,
}

pub type Result<T> = core::result::Result<T, Error>;
