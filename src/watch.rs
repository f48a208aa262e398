use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, SyncSender};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::warn;

use crate::file_id::FileId;

/// Background observer that fires once when the file at the watched path is
/// no longer the file the reader holds open.
///
/// The watcher never re-arms. After a swap the reader spawns a fresh one for
/// the replacement file.
pub(crate) struct RotationWatcher {
    rotated: Receiver<()>,
    cancel: Arc<AtomicBool>,
    thread: Option<JoinHandle<()>>,
}

impl RotationWatcher {
    /// Start watching `watched_path` for a file different from `held`.
    pub(crate) fn spawn(
        held: &File,
        watched_path: PathBuf,
        poll_interval: Duration,
        detect_delay: Duration,
    ) -> Self {
        let (tx, rx) = mpsc::sync_channel(1);
        let cancel = Arc::new(AtomicBool::new(false));
        let flag = Arc::clone(&cancel);

        // Snapshot the held file's identity up front. If that fails, keep a
        // duplicate handle around and re-stat it on every tick instead.
        let (held_id, held_file) = match FileId::from_file(held) {
            Ok(id) => (Some(id), None),
            Err(e) => {
                warn!("failed to stat the held file, re-statting per tick: {e}");
                (None, held.try_clone().ok())
            }
        };

        let thread = thread::spawn(move || {
            watch(
                held_id,
                held_file,
                &watched_path,
                poll_interval,
                detect_delay,
                &flag,
                &tx,
            )
        });

        Self {
            rotated: rx,
            cancel,
            thread: Some(thread),
        }
    }

    /// True once the rotation signal has been published. Consumes the signal;
    /// the watcher fires at most once.
    pub(crate) fn rotated(&self) -> bool {
        self.rotated.try_recv().is_ok()
    }

    /// Stop the watcher and wait for its thread to observe the cancel.
    pub(crate) fn cancel(&mut self) {
        self.cancel.store(true, Ordering::Relaxed);
        if let Some(thread) = self.thread.take() {
            if thread.join().is_err() {
                warn!("rotation watcher thread panicked");
            }
        }
    }
}

impl Drop for RotationWatcher {
    fn drop(&mut self) {
        self.cancel();
    }
}

fn watch(
    held_id: Option<FileId>,
    held_file: Option<File>,
    watched_path: &Path,
    poll_interval: Duration,
    detect_delay: Duration,
    cancel: &AtomicBool,
    rotated: &SyncSender<()>,
) {
    loop {
        thread::sleep(poll_interval);
        if cancel.load(Ordering::Relaxed) {
            return;
        }

        let held = match held_id {
            Some(id) => id,
            None => match held_file.as_ref().map(FileId::from_file) {
                Some(Ok(id)) => id,
                Some(Err(e)) => {
                    warn!("failed to stat the held file: {e}");
                    continue;
                }
                None => {
                    warn!("no handle left to stat the held file, giving up watching");
                    return;
                }
            },
        };

        let current = match FileId::from_path(watched_path) {
            Ok(id) => id,
            Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
            Err(e) => {
                warn!(
                    "failed to stat {} while watching for rotation: {e}",
                    watched_path.display()
                );
                continue;
            }
        };
        if current == held {
            continue;
        }

        // Quiescence window so rotation utilities can finish their
        // rename/create sequence before anyone reacts.
        thread::sleep(detect_delay);
        if cancel.load(Ordering::Relaxed) {
            return;
        }
        let _ = rotated.send(());
        return;
    }
}
