use std::fs::File;
use std::io;
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// OS-level identity of a file, stable across renames.
///
/// Two values compare equal exactly when the operating system considers them
/// the same underlying object: renaming a file keeps its identity, while
/// deleting it and creating a new file at the same path produces a fresh one.
/// Values are serializable so they can be persisted alongside a read offset,
/// but a persisted identity is only meaningful on the platform family that
/// produced it.
#[cfg(unix)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    device: u64,
    inode: u64,
}

#[cfg(windows)]
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileId {
    volume_serial: u32,
    index_high: u32,
    index_low: u32,
}

/// Error returned when the OS cannot produce an identity for a file.
#[derive(Error, Debug)]
#[error("file identity unavailable")]
pub struct IdentityError(#[from] pub io::Error);

#[cfg(unix)]
impl FileId {
    /// Identity of an open file.
    pub fn from_file(file: &File) -> Result<Self, IdentityError> {
        let metadata = file.metadata()?;
        Ok(Self::from_metadata(&metadata))
    }

    /// Identity of whatever currently exists at `path`, without keeping it open.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let metadata = std::fs::metadata(path)?;
        Ok(Self::from_metadata(&metadata))
    }

    fn from_metadata(metadata: &std::fs::Metadata) -> Self {
        use std::os::unix::fs::MetadataExt;
        Self {
            device: metadata.dev(),
            inode: metadata.ino(),
        }
    }
}

#[cfg(windows)]
impl FileId {
    /// Identity of an open file.
    pub fn from_file(file: &File) -> Result<Self, IdentityError> {
        use std::os::windows::io::AsRawHandle;
        use windows_sys::Win32::Storage::FileSystem::{
            GetFileInformationByHandle, BY_HANDLE_FILE_INFORMATION,
        };

        let mut info: BY_HANDLE_FILE_INFORMATION = unsafe { std::mem::zeroed() };
        let ok = unsafe { GetFileInformationByHandle(file.as_raw_handle() as _, &mut info) };
        if ok == 0 {
            return Err(IdentityError(io::Error::last_os_error()));
        }
        Ok(Self {
            volume_serial: info.dwVolumeSerialNumber,
            index_high: info.nFileIndexHigh,
            index_low: info.nFileIndexLow,
        })
    }

    /// Identity of whatever currently exists at `path`.
    ///
    /// The volume/index triple is only available through an open handle, so
    /// the file is opened briefly for reading.
    pub fn from_path(path: impl AsRef<Path>) -> io::Result<Self> {
        let file = File::open(path)?;
        Self::from_file(&file).map_err(|e| e.0)
    }
}
