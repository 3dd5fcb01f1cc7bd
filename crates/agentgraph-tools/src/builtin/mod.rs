pub mod read;
pub mod write;

use std::path::{Path, PathBuf};

/// Resolve a tool-supplied path against the node's working directory.
pub(crate) fn resolve_path(file_path: &str, working_dir: &Path) -> PathBuf {
    let path = PathBuf::from(file_path);
    if path.is_absolute() {
        path
    } else {
        working_dir.join(path)
    }
}
