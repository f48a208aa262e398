#![doc = include_str!("../README.md")]

mod file_id;
mod options;
mod path_utils;
mod position;
mod reader;
mod watch;

pub use file_id::{FileId, IdentityError};
pub use options::{FollowOptions, DEFAULT_DETECT_ROTATE_DELAY, DEFAULT_WATCH_ROTATE_INTERVAL};
pub use position::{
    FilePositionStore, MemoryPositionStore, PositionError, PositionRecord, PositionStore,
};
pub use reader::{open, FollowReader, OpenError};
