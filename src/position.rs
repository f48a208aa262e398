use std::fs::File;
use std::io::{self, Seek};
use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::file_id::FileId;

/// The `(identity, offset)` pair a position store records.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PositionRecord {
    pub file_id: Option<FileId>,
    pub offset: u64,
}

/// Possible errors while reading or updating a position store.
#[derive(Error, Debug)]
pub enum PositionError {
    #[error("while working with the position file")]
    Io(#[from] io::Error),

    #[error("while trying to (de)serialize the position record")]
    Serde(#[from] bincode::Error),
}

/// A cell recording how far into which file a consumer has read.
///
/// Implementations must replace identity and offset together in `set` so an
/// interrupted update never leaves a mixed pair, and must make `set` and
/// `set_offset` durable before returning (where durability applies at all).
/// Callers that need a consistent view use a single mutable reference; the
/// reader owning the store never interleaves updates.
///
/// Ready-made implementations are [`FilePositionStore`] (durable) and
/// [`MemoryPositionStore`] (ephemeral). Anything else, for example a
/// networked registry, can be supplied through
/// [`FollowOptions::with_position_store`](crate::FollowOptions::with_position_store).
pub trait PositionStore: Send {
    /// Identity of the file the offset refers to, if one was recorded.
    fn file_id(&self) -> Option<FileId>;

    /// Recorded offset; 0 when nothing was recorded yet.
    fn offset(&self) -> u64;

    /// Replace identity and offset together.
    fn set(&mut self, file_id: FileId, offset: u64) -> Result<(), PositionError>;

    /// Replace the offset, keeping the recorded identity.
    fn set_offset(&mut self, offset: u64) -> Result<(), PositionError>;

    /// Advance the offset by `delta`.
    fn increase_offset(&mut self, delta: u64) -> Result<(), PositionError> {
        self.set_offset(self.offset() + delta)
    }

    /// Flush anything outstanding. The backing resources are released when
    /// the store is dropped.
    fn close(&mut self) -> Result<(), PositionError>;
}

/// Durable [`PositionStore`] backed by a single file.
///
/// The whole record is re-encoded and written from byte 0 on every update
/// and synced to disk before the update returns, so a crashed process
/// observes its last completed `set` on restart. The encoding has a fixed
/// size once an identity is recorded, which keeps each rewrite a full
/// overwrite of the previous one.
pub struct FilePositionStore {
    file: File,
    record: PositionRecord,
}

impl FilePositionStore {
    /// Open the store at `path`, creating an empty one if the file does not
    /// exist yet. An empty file decodes as an unset record.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, PositionError> {
        let mut file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .open(path)?;
        let record = if file.metadata()?.len() == 0 {
            PositionRecord::default()
        } else {
            file.rewind()?;
            bincode::deserialize_from(&mut file)?
        };
        Ok(Self { file, record })
    }

    fn persist(&mut self) -> Result<(), PositionError> {
        self.file.rewind()?;
        bincode::serialize_into(&mut self.file, &self.record)?;
        self.file.sync_data()?;
        Ok(())
    }
}

impl PositionStore for FilePositionStore {
    fn file_id(&self) -> Option<FileId> {
        self.record.file_id
    }

    fn offset(&self) -> u64 {
        self.record.offset
    }

    fn set(&mut self, file_id: FileId, offset: u64) -> Result<(), PositionError> {
        self.record = PositionRecord {
            file_id: Some(file_id),
            offset,
        };
        self.persist()
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), PositionError> {
        self.record.offset = offset;
        self.persist()
    }

    fn close(&mut self) -> Result<(), PositionError> {
        self.file.sync_data()?;
        Ok(())
    }
}

/// In-memory [`PositionStore`]; nothing survives the process.
pub struct MemoryPositionStore {
    record: PositionRecord,
}

impl MemoryPositionStore {
    pub fn new(file_id: Option<FileId>, offset: u64) -> Self {
        Self {
            record: PositionRecord { file_id, offset },
        }
    }
}

impl PositionStore for MemoryPositionStore {
    fn file_id(&self) -> Option<FileId> {
        self.record.file_id
    }

    fn offset(&self) -> u64 {
        self.record.offset
    }

    fn set(&mut self, file_id: FileId, offset: u64) -> Result<(), PositionError> {
        self.record = PositionRecord {
            file_id: Some(file_id),
            offset,
        };
        Ok(())
    }

    fn set_offset(&mut self, offset: u64) -> Result<(), PositionError> {
        self.record.offset = offset;
        Ok(())
    }

    fn close(&mut self) -> Result<(), PositionError> {
        Ok(())
    }
}
