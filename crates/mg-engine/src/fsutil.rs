//! Filesystem helpers shared by the engine and the rules.

use std::time::SystemTime;

use camino::Utf8Path;

use crate::error::BuildError;

/// Modification time of `path`, or `None` if it does not exist.
pub fn mtime(path: &Utf8Path) -> Option<SystemTime> {
    std::fs::metadata(path).and_then(|m| m.modified()).ok()
}

/// Create `dir` and any missing parents.
pub fn ensure_dir(dir: &Utf8Path) -> Result<(), BuildError> {
    std::fs::create_dir_all(dir).map_err(|source| BuildError::Io {
        action: "create directory",
        path: dir.to_owned(),
        source,
    })
}

/// Set the modification time of `path` to now. Generated outputs get a
/// fresh timestamp after their ledger is written so that on-disk
/// ordering (ledger older than output) holds for staleness checks.
pub fn touch_now(path: &Utf8Path) -> Result<(), BuildError> {
    let io_err = |source| BuildError::Io {
        action: "touch",
        path: path.to_owned(),
        source,
    };

    let file = std::fs::File::options()
        .write(true)
        .open(path)
        .map_err(io_err)?;
    file.set_modified(SystemTime::now()).map_err(io_err)
}

/// Remove `path` if it exists. Returns whether anything was removed.
pub fn remove_file(path: &Utf8Path) -> Result<bool, BuildError> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
        Err(source) => Err(BuildError::Io {
            action: "remove",
            path: path.to_owned(),
            source,
        }),
    }
}
