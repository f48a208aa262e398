use std::path::PathBuf;
use std::time::Duration;

use crate::position::PositionStore;

/// Default polling period of the rotation watcher.
pub const DEFAULT_WATCH_ROTATE_INTERVAL: Duration = Duration::from_millis(100);

/// Default quiescence window between the first differing stat and the
/// rotation signal.
pub const DEFAULT_DETECT_ROTATE_DELAY: Duration = Duration::from_secs(5);

/// Configuration for [`open`](crate::open).
///
/// ```
/// use std::time::Duration;
/// use ftail::FollowOptions;
///
/// let options = FollowOptions::default()
///     .with_read_from_head(true)
///     .with_watch_rotate_interval(Duration::from_millis(10));
/// ```
pub struct FollowOptions {
    pub(crate) position_file_path: Option<PathBuf>,
    pub(crate) position_store: Option<Box<dyn PositionStore>>,
    pub(crate) rotated_file_globs: Vec<String>,
    pub(crate) follow_rotate: bool,
    pub(crate) watch_rotate_interval: Duration,
    pub(crate) detect_rotate_delay: Duration,
    pub(crate) read_from_head: bool,
}

impl Default for FollowOptions {
    fn default() -> Self {
        Self {
            position_file_path: None,
            position_store: None,
            rotated_file_globs: Vec::new(),
            follow_rotate: true,
            watch_rotate_interval: DEFAULT_WATCH_ROTATE_INTERVAL,
            detect_rotate_delay: DEFAULT_DETECT_ROTATE_DELAY,
            read_from_head: false,
        }
    }
}

impl FollowOptions {
    /// Persist the read position in a file at `path`. Without this (or
    /// [`with_position_store`](Self::with_position_store)) the position is
    /// kept in memory only.
    pub fn with_position_file_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.position_file_path = Some(path.into());
        self
    }

    /// Supply a [`PositionStore`] directly. Takes precedence over
    /// [`with_position_file_path`](Self::with_position_file_path).
    pub fn with_position_store(mut self, store: impl PositionStore + 'static) -> Self {
        self.position_store = Some(Box::new(store));
        self
    }

    /// Glob patterns searched, in order, for a rotated predecessor matching
    /// a stored identity when the watched path holds a different file.
    pub fn with_rotated_file_globs(mut self, patterns: Vec<String>) -> Self {
        self.rotated_file_globs = patterns;
        self
    }

    /// Enable or disable rotation watching. Enabled by default.
    pub fn with_follow_rotate(mut self, follow: bool) -> Self {
        self.follow_rotate = follow;
        self
    }

    /// Polling period of the rotation watcher.
    pub fn with_watch_rotate_interval(mut self, interval: Duration) -> Self {
        self.watch_rotate_interval = interval;
        self
    }

    /// How long to wait after the first differing stat before signaling
    /// rotation, giving rotation utilities time to finish.
    pub fn with_detect_rotate_delay(mut self, delay: Duration) -> Self {
        self.detect_rotate_delay = delay;
        self
    }

    /// When no position was stored yet, start at offset 0 instead of the
    /// current end of the file.
    pub fn with_read_from_head(mut self, read_from_head: bool) -> Self {
        self.read_from_head = read_from_head;
        self
    }
}
