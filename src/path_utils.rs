use std::io;
use std::path::PathBuf;

use log::debug;

use crate::file_id::FileId;

/// Search `patterns` in order for a file whose identity equals `file_id`.
///
/// Candidates that disappear or cannot be inspected are skipped; only an
/// invalid pattern is an error.
pub(crate) fn find_by_file_id(
    patterns: &[String],
    file_id: FileId,
) -> Result<Option<PathBuf>, glob::PatternError> {
    for pattern in patterns {
        for entry in glob::glob(pattern)? {
            let path = match entry {
                Ok(path) => path,
                Err(e) => {
                    debug!("skipping unreadable glob entry: {e}");
                    continue;
                }
            };
            match FileId::from_path(&path) {
                Ok(id) if id == file_id => return Ok(Some(path)),
                Ok(_) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => debug!("skipping {}: {e}", path.display()),
            }
        }
    }
    Ok(None)
}
