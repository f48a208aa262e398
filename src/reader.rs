use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, warn};
use thiserror::Error;

use crate::file_id::{FileId, IdentityError};
use crate::options::FollowOptions;
use crate::path_utils;
use crate::position::{FilePositionStore, MemoryPositionStore, PositionError, PositionStore};
use crate::watch::RotationWatcher;

/// Possible errors while constructing a [`FollowReader`].
#[derive(Error, Debug)]
pub enum OpenError {
    #[error("while opening the followed file")]
    Io(#[from] io::Error),

    #[error(transparent)]
    Identity(#[from] IdentityError),

    #[error("while working with the position store")]
    Position(#[from] PositionError),

    #[error("invalid rotated-file glob pattern")]
    Pattern(#[from] glob::PatternError),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum State {
    /// Reading the file currently at the watched path.
    Normal,
    /// Rotation happened; residual bytes of the predecessor come first.
    /// `drained` is set once the predecessor returned end-of-input, after
    /// which every read retries the swap to the replacement file.
    DrainResidual { drained: bool },
    /// Mid-swap guard.
    Switching,
}

/// Byte reader over an append-only file that keeps following it across
/// rotations, like `tail -F`, recording its progress in a [`PositionStore`].
///
/// ## Usage
///
/// Construct with [`open`]; consume through [`std::io::Read`]. `Ok(0)` means
/// "no bytes available right now", never "the stream ended". Callers poll:
///
/// ```rust no_run
/// use std::io::Read;
/// # use ftail::{FollowOptions, OpenError};
/// # fn main() -> Result<(), OpenError> {
/// let mut reader = ftail::open(
///     "/var/log/app.log",
///     FollowOptions::default().with_position_file_path("/var/lib/app/position"),
/// )?;
/// let mut buf = [0u8; 4096];
/// loop {
///     match reader.read(&mut buf)? {
///         0 => std::thread::sleep(std::time::Duration::from_millis(200)),
///         n => print!("{}", String::from_utf8_lossy(&buf[..n])),
///     }
/// }
/// # }
/// ```
///
/// When the file at the watched path is replaced, any bytes still trailing
/// in the replaced file are delivered before the reader switches over, so
/// nothing is lost and nothing is read twice.
///
/// ## Positions
///
/// The recorded offset advances only after bytes were handed to the caller.
/// If updating the store fails, the bytes just read are still returned
/// normally and the failure becomes the error of the *next* `read` call, an
/// `io::Error` whose source is a [`PositionError`]: delivery is
/// at-most-once, persistence at-least-once, and no delivered byte is ever
/// thrown away over a bookkeeping problem. Consumers that persist progress
/// externally must reconcile when they see that error.
///
/// ## Cleanup
///
/// * **explicit** via [`close`](Self::close), which reports position-store
///   errors and waits for the rotation watcher to stop;
/// * **implicit** via `Drop`, which does the same but logs errors instead of
///   returning them.
pub struct FollowReader {
    file: File,
    watched_path: PathBuf,
    position: Box<dyn PositionStore>,
    state: State,
    watcher: Option<RotationWatcher>,
    follow_rotate: bool,
    watch_rotate_interval: Duration,
    detect_rotate_delay: Duration,
    /// Store failure held back so the bytes read alongside it could be
    /// returned; reported on the next `read`.
    pending_position_error: Option<PositionError>,
    closed: bool,
}

/// Open `path` for follow reading.
///
/// Reconciles the configured position store with what is on disk:
///
/// * an empty store is initialized to the current file, at offset 0 when
///   `read_from_head` is set and at the current size otherwise;
/// * a stored identity that no longer matches the watched path is looked up
///   through the configured glob patterns, and on a hit the reader starts on
///   that rotated predecessor, draining it before switching to the watched
///   path; on a miss the store is reset to the current file;
/// * a stored offset beyond the size of the file about to be read is treated
///   as truncation and pulled back to that size.
///
/// Any failure closes whatever was acquired and surfaces as [`OpenError`].
pub fn open(path: impl AsRef<Path>, options: FollowOptions) -> Result<FollowReader, OpenError> {
    let path = path.as_ref();
    let FollowOptions {
        position_file_path,
        position_store,
        rotated_file_globs,
        follow_rotate,
        watch_rotate_interval,
        detect_rotate_delay,
        read_from_head,
    } = options;

    let mut position: Box<dyn PositionStore> = match (position_store, position_file_path) {
        (Some(store), _) => store,
        (None, Some(store_path)) => Box::new(FilePositionStore::open(store_path)?),
        (None, None) => {
            debug!("no position file configured, tracking the position in memory only");
            Box::new(MemoryPositionStore::new(None, 0))
        }
    };

    let (file, resuming_rotated) =
        match reconcile(path, position.as_mut(), &rotated_file_globs, read_from_head) {
            Ok(reconciled) => reconciled,
            Err(e) => {
                if let Err(close_err) = position.close() {
                    warn!("failed to close the position store while bailing out: {close_err}");
                }
                return Err(e);
            }
        };

    // A reader resuming on a rotated predecessor already knows a rotation
    // happened; the watcher only makes sense once it is on the watched path.
    let watcher = (follow_rotate && !resuming_rotated).then(|| {
        RotationWatcher::spawn(
            &file,
            path.to_path_buf(),
            watch_rotate_interval,
            detect_rotate_delay,
        )
    });

    Ok(FollowReader {
        file,
        watched_path: path.to_path_buf(),
        position,
        state: if resuming_rotated {
            State::DrainResidual { drained: false }
        } else {
            State::Normal
        },
        watcher,
        follow_rotate,
        watch_rotate_interval,
        detect_rotate_delay,
        pending_position_error: None,
        closed: false,
    })
}

/// Decide which file to start reading and adjust the store to match.
/// Returns the positioned file and whether it is a rotated predecessor of
/// the watched path.
fn reconcile(
    watched_path: &Path,
    position: &mut dyn PositionStore,
    globs: &[String],
    read_from_head: bool,
) -> Result<(File, bool), OpenError> {
    let current = File::open(watched_path)?;
    let current_id = FileId::from_file(&current)?;
    let current_size = current.metadata()?.len();
    let initial_offset = if read_from_head { 0 } else { current_size };

    let (mut file, resuming_rotated) = match position.file_id() {
        None => {
            position.set(current_id, initial_offset)?;
            (current, false)
        }
        Some(stored) if stored == current_id => (current, false),
        Some(stored) => match path_utils::find_by_file_id(globs, stored)? {
            Some(rotated_path) => {
                debug!("resuming on the rotated file {}", rotated_path.display());
                (File::open(rotated_path)?, true)
            }
            None => {
                warn!(
                    "no file matches the stored identity, starting fresh on {}",
                    watched_path.display()
                );
                position.set(current_id, initial_offset)?;
                (current, false)
            }
        },
    };

    let size = file.metadata()?.len();
    if position.offset() > size {
        warn!(
            "stored offset {} exceeds the file size {}, treating as truncation",
            position.offset(),
            size
        );
        position.set_offset(size)?;
    }
    file.seek(SeekFrom::Start(position.offset()))?;

    Ok((file, resuming_rotated))
}

impl FollowReader {
    /// Identity recorded in the position store, normally that of the file
    /// being read.
    pub fn current_file_id(&self) -> Option<FileId> {
        self.position.file_id()
    }

    /// Offset recorded in the position store.
    pub fn offset(&self) -> u64 {
        self.position.offset()
    }

    /// Stop following: cancel the rotation watcher, wait for it to
    /// terminate, and close the position store.
    pub fn close(mut self) -> Result<(), PositionError> {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.cancel();
        }
        self.closed = true;
        self.position.close()
    }

    fn deliver(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.file.read(buf)?;
        if n > 0 {
            // `buf` is already filled and the file cursor has moved past the
            // bytes, so they must reach the caller; hold the store failure
            // back for the next call.
            if let Err(e) = self.position.increase_offset(n as u64) {
                self.pending_position_error = Some(e);
            }
        }
        Ok(n)
    }

    fn swap(&mut self) -> Result<(), OpenError> {
        let file = File::open(&self.watched_path)?;
        let id = FileId::from_file(&file)?;
        self.position.set(id, 0)?;
        self.file = file;
        self.watcher = self.follow_rotate.then(|| {
            RotationWatcher::spawn(
                &self.file,
                self.watched_path.clone(),
                self.watch_rotate_interval,
                self.detect_rotate_delay,
            )
        });
        Ok(())
    }
}

impl Read for FollowReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Some(e) = self.pending_position_error.take() {
            return Err(io::Error::other(e));
        }
        loop {
            match self.state {
                State::Normal => {
                    if self.watcher.as_ref().is_some_and(RotationWatcher::rotated) {
                        self.state = State::DrainResidual { drained: false };
                        continue;
                    }
                    return self.deliver(buf);
                }
                State::DrainResidual { drained: false } => {
                    let n = self.deliver(buf)?;
                    if n > 0 {
                        return Ok(n);
                    }
                    self.state = State::DrainResidual { drained: true };
                }
                State::DrainResidual { drained: true } => {
                    self.state = State::Switching;
                    if let Err(e) = self.swap() {
                        self.state = State::DrainResidual { drained: true };
                        match &e {
                            OpenError::Io(io_err) if io_err.kind() == io::ErrorKind::NotFound => {
                                debug!(
                                    "replacement for {} not present yet",
                                    self.watched_path.display()
                                );
                            }
                            _ => warn!(
                                "failed to swap to the replacement of {}: {e}",
                                self.watched_path.display()
                            ),
                        }
                        return Ok(0);
                    }
                    self.state = State::Normal;
                }
                State::Switching => return Ok(0),
            }
        }
    }
}

impl Drop for FollowReader {
    fn drop(&mut self) {
        if let Some(mut watcher) = self.watcher.take() {
            watcher.cancel();
        }
        if !self.closed {
            if let Err(e) = self.position.close() {
                warn!("failed to close the position store: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::fs::{File, OpenOptions};
    use std::io::{self, Read, Write};
    use std::path::{Path, PathBuf};
    use std::thread;
    use std::time::Duration;

    use rstest::rstest;
    use tempfile::TempDir;

    use crate::file_id::FileId;
    use crate::options::FollowOptions;
    use crate::position::{MemoryPositionStore, PositionError, PositionStore};

    use super::{open, FollowReader};

    /// Store double whose Nth offset update fails, later ones succeed again.
    struct FailingStore {
        inner: MemoryPositionStore,
        fail_on_call: usize,
        calls: usize,
    }

    impl PositionStore for FailingStore {
        fn file_id(&self) -> Option<FileId> {
            self.inner.file_id()
        }

        fn offset(&self) -> u64 {
            self.inner.offset()
        }

        fn set(&mut self, file_id: FileId, offset: u64) -> Result<(), PositionError> {
            self.inner.set(file_id, offset)
        }

        fn set_offset(&mut self, offset: u64) -> Result<(), PositionError> {
            self.calls += 1;
            if self.calls == self.fail_on_call {
                return Err(PositionError::Io(io::Error::other("injected store failure")));
            }
            self.inner.set_offset(offset)
        }

        fn close(&mut self) -> Result<(), PositionError> {
            self.inner.close()
        }
    }

    fn create(dir: &TempDir, name: &str) -> (PathBuf, FileId) {
        let path = dir.path().join(name);
        let file = File::create(&path).unwrap();
        let id = FileId::from_file(&file).unwrap();
        (path, id)
    }

    fn append(path: &Path, data: &str) {
        let mut file = OpenOptions::new().append(true).open(path).unwrap();
        file.write_all(data.as_bytes()).unwrap();
    }

    fn rotate(path: &Path, to: &str) -> PathBuf {
        let rotated = path.with_file_name(to);
        std::fs::rename(path, &rotated).unwrap();
        rotated
    }

    fn fast_options() -> FollowOptions {
        FollowOptions::default()
            .with_watch_rotate_interval(Duration::from_millis(10))
            .with_detect_rotate_delay(Duration::ZERO)
    }

    /// Give the 10ms watcher ample time to notice a rotation.
    fn wait_for_detection() {
        thread::sleep(Duration::from_millis(300));
    }

    fn want_read(reader: &mut FollowReader, want: &str) {
        let mut buf = vec![0u8; want.len()];
        let n = reader.read(&mut buf).unwrap();
        assert_eq!(n, want.len());
        assert_eq!(std::str::from_utf8(&buf[..n]).unwrap(), want);
    }

    fn read_all(reader: &mut FollowReader) -> String {
        let mut out = Vec::new();
        let mut buf = [0u8; 64];
        loop {
            match reader.read(&mut buf).unwrap() {
                0 => break,
                n => out.extend_from_slice(&buf[..n]),
            }
        }
        String::from_utf8(out).unwrap()
    }

    fn want_position(reader: &FollowReader, id: FileId, offset: u64) {
        assert_eq!(reader.current_file_id(), Some(id));
        assert_eq!(reader.offset(), offset);
    }

    #[test]
    fn delivers_appends_and_advances_the_offset() {
        let dir = TempDir::new().unwrap();
        let (path, id) = create(&dir, "test.log");
        let mut reader = open(&path, FollowOptions::default()).unwrap();

        append(&path, "foo");
        want_read(&mut reader, "fo");
        want_position(&reader, id, 2);

        want_read(&mut reader, "o");
        assert_eq!(read_all(&mut reader), "");
        want_position(&reader, id, 3);

        append(&path, "bar");
        assert_eq!(read_all(&mut reader), "bar");
        want_position(&reader, id, 6);

        reader.close().unwrap();
    }

    #[test]
    fn empty_file_reads_nothing_until_appended() {
        let dir = TempDir::new().unwrap();
        let (path, _) = create(&dir, "test.log");
        let mut reader = open(&path, FollowOptions::default()).unwrap();

        assert_eq!(read_all(&mut reader), "");
        append(&path, "x");
        assert_eq!(read_all(&mut reader), "x");
    }

    #[test]
    fn follows_rotation() {
        let dir = TempDir::new().unwrap();
        let (path, _) = create(&dir, "test.log");
        let mut reader = open(&path, fast_options()).unwrap();

        rotate(&path, "test.log.bk");
        let (_, current_id) = create(&dir, "test.log");
        wait_for_detection();

        append(&path, "current");
        assert_eq!(read_all(&mut reader), "current");
        want_position(&reader, current_id, 7);
    }

    #[test]
    fn drains_residual_bytes_before_switching() {
        let dir = TempDir::new().unwrap();
        let (path, old_id) = create(&dir, "test.log");
        append(&path, "old");
        let mut reader = open(&path, fast_options().with_read_from_head(true)).unwrap();

        rotate(&path, "test.log.bk");
        let (_, current_id) = create(&dir, "test.log");
        append(&path, "current");
        wait_for_detection();

        want_read(&mut reader, "ol");
        want_position(&reader, old_id, 2);
        want_read(&mut reader, "d");
        want_position(&reader, old_id, 3);

        assert_eq!(read_all(&mut reader), "current");
        want_position(&reader, current_id, 7);
    }

    #[test]
    fn delivers_bytes_appended_to_the_rotated_file_after_detection() {
        let dir = TempDir::new().unwrap();
        let (path, _) = create(&dir, "test.log");
        append(&path, "old");
        let mut reader = open(&path, fast_options().with_read_from_head(true)).unwrap();

        let rotated = rotate(&path, "test.log.bk");
        let (_, current_id) = create(&dir, "test.log");
        append(&path, "current");
        wait_for_detection();
        append(&rotated, "straggler");

        assert_eq!(read_all(&mut reader), "oldstragglercurrent");
        want_position(&reader, current_id, 7);
    }

    #[test]
    fn retries_the_swap_until_a_replacement_appears() {
        let dir = TempDir::new().unwrap();
        let (path, _) = create(&dir, "test.log");
        append(&path, "old");
        let mut reader = open(&path, fast_options().with_read_from_head(true)).unwrap();

        rotate(&path, "test.log.bk1");
        create(&dir, "test.log");
        wait_for_detection();
        // yank the replacement away again before the reader gets to it
        rotate(&path, "test.log.bk2");

        assert_eq!(read_all(&mut reader), "old");
        assert_eq!(read_all(&mut reader), "");

        let (_, current_id) = create(&dir, "test.log");
        append(&path, "new");
        assert_eq!(read_all(&mut reader), "new");
        want_position(&reader, current_id, 3);
    }

    #[test]
    fn store_failure_does_not_revoke_delivered_bytes() {
        let dir = TempDir::new().unwrap();
        let (path, id) = create(&dir, "test.log");
        append(&path, "foobar");

        let store = FailingStore {
            inner: MemoryPositionStore::new(Some(id), 0),
            fail_on_call: 2,
            calls: 0,
        };
        let mut reader = open(&path, FollowOptions::default().with_position_store(store)).unwrap();

        want_read(&mut reader, "foo");
        want_position(&reader, id, 3);

        // the second advance fails, the bytes still come out unharmed
        want_read(&mut reader, "bar");
        want_position(&reader, id, 3);

        // the held-back failure surfaces on the following call
        let err = reader.read(&mut [0u8; 8]).unwrap_err();
        assert!(err
            .get_ref()
            .is_some_and(|source| source.is::<PositionError>()));

        // and reading keeps working afterwards
        assert_eq!(read_all(&mut reader), "");
        append(&path, "baz");
        assert_eq!(read_all(&mut reader), "baz");
        want_position(&reader, id, 6);
    }

    #[test]
    fn resumes_from_a_stored_position() {
        let dir = TempDir::new().unwrap();
        let (path, id) = create(&dir, "test.log");
        append(&path, "bar");

        let store = MemoryPositionStore::new(Some(id), 2);
        let mut reader = open(&path, FollowOptions::default().with_position_store(store)).unwrap();

        assert_eq!(read_all(&mut reader), "r");
        want_position(&reader, id, 3);

        append(&path, "baz");
        assert_eq!(read_all(&mut reader), "baz");
        want_position(&reader, id, 6);
    }

    #[test]
    fn pulls_the_offset_back_on_truncation() {
        let dir = TempDir::new().unwrap();
        let (path, id) = create(&dir, "test.log");
        append(&path, "bar");

        let store = MemoryPositionStore::new(Some(id), 4);
        let mut reader = open(&path, FollowOptions::default().with_position_store(store)).unwrap();

        assert_eq!(read_all(&mut reader), "");
        want_position(&reader, id, 3);
    }

    #[rstest]
    #[case::from_head(true, "bar")]
    #[case::from_tail(false, "")]
    fn starts_fresh_when_the_stored_identity_is_lost(
        #[case] read_from_head: bool,
        #[case] want: &str,
    ) {
        let dir = TempDir::new().unwrap();
        let (path, old_id) = create(&dir, "test.log");
        append(&path, "foo");
        rotate(&path, "test.log.unfindable");
        let (_, current_id) = create(&dir, "test.log");
        append(&path, "bar");

        // no glob patterns, so the stored identity cannot be located
        let store = MemoryPositionStore::new(Some(old_id), 2);
        let mut reader = open(
            &path,
            FollowOptions::default()
                .with_position_store(store)
                .with_read_from_head(read_from_head),
        )
        .unwrap();

        assert_eq!(read_all(&mut reader), want);
        want_position(&reader, current_id, 3);
    }

    #[test]
    fn resumes_a_rotated_predecessor_via_glob() {
        let dir = TempDir::new().unwrap();
        let (path, old_id) = create(&dir, "test.log");
        append(&path, "foo");
        rotate(&path, "test.log.bk");
        let (_, current_id) = create(&dir, "test.log");
        append(&path, "bar");

        let store = MemoryPositionStore::new(Some(old_id), 2);
        let pattern = dir.path().join("test.log.*").to_string_lossy().into_owned();
        let mut reader = open(
            &path,
            fast_options()
                .with_position_store(store)
                .with_rotated_file_globs(vec![pattern]),
        )
        .unwrap();

        assert_eq!(read_all(&mut reader), "obar");
        want_position(&reader, current_id, 3);
    }

    #[test]
    fn ignores_rotation_when_follow_is_disabled() {
        let dir = TempDir::new().unwrap();
        let (path, old_id) = create(&dir, "test.log");
        let mut reader = open(&path, fast_options().with_follow_rotate(false)).unwrap();

        rotate(&path, "test.log.bk");
        create(&dir, "test.log");
        wait_for_detection();

        append(&path, "foo");
        assert_eq!(read_all(&mut reader), "");
        want_position(&reader, old_id, 0);
    }

    #[test]
    fn durable_position_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let (path, id) = create(&dir, "test.log");
        append(&path, "hello world");
        let store_path = dir.path().join("position");

        let options = || {
            FollowOptions::default()
                .with_position_file_path(&store_path)
                .with_read_from_head(true)
        };

        let mut reader = open(&path, options()).unwrap();
        want_read(&mut reader, "hello");
        want_position(&reader, id, 5);
        reader.close().unwrap();

        let mut reader = open(&path, options()).unwrap();
        assert_eq!(read_all(&mut reader), " world");
        want_position(&reader, id, 11);
        reader.close().unwrap();
    }
}
