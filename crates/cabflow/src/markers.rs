//! File suffix markers
//!
//! A source file that has been consumed is renamed in place so the trigger
//! never picks it up again: `trips.csv` becomes `trips.staged.csv` on success
//! or `trips.failed.csv` when staging gave up on it.

use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::PipelineResult;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileMarker {
    Staged,
    Failed,
}

impl FileMarker {
    pub fn suffix(&self) -> &'static str {
        match self {
            FileMarker::Staged => "staged",
            FileMarker::Failed => "failed",
        }
    }

    const ALL: [FileMarker; 2] = [FileMarker::Staged, FileMarker::Failed];
}

/// Path the file takes once it carries `marker`.
pub fn marked_path(path: &Path, marker: FileMarker) -> PathBuf {
    let stem = path
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_default();
    let name = match path.extension() {
        Some(ext) => format!("{stem}.{}.{}", marker.suffix(), ext.to_string_lossy()),
        None => format!("{stem}.{}", marker.suffix()),
    };
    path.with_file_name(name)
}

/// Marker the path already carries, if any.
pub fn marker_of(path: &Path) -> Option<FileMarker> {
    let stem = if path.extension().is_some() {
        path.file_stem()?
    } else {
        path.file_name()?
    };
    let stem = stem.to_string_lossy();

    FileMarker::ALL.into_iter().find(|marker| {
        stem.ends_with(&format!(".{}", marker.suffix())) || path_is_bare_marker(path, *marker)
    })
}

// `trips.staged` (no extension) is the marked form of an extensionless `trips`
fn path_is_bare_marker(path: &Path, marker: FileMarker) -> bool {
    path.extension()
        .map(|ext| ext.to_string_lossy() == marker.suffix())
        .unwrap_or(false)
        && path.file_stem().map(|s| !s.is_empty()).unwrap_or(false)
}

/// Rename `path` to carry `marker` and return the new path.
///
/// If `path` is already gone but its marked sibling exists, the rename has
/// happened before and this is a no-op.
pub async fn apply_marker(path: &Path, marker: FileMarker) -> PipelineResult<PathBuf> {
    let target = marked_path(path, marker);

    match tokio::fs::rename(path, &target).await {
        Ok(()) => {
            debug!(from = %path.display(), to = %target.display(), "Marked source file");
            Ok(target)
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            if tokio::fs::try_exists(&target).await.unwrap_or(false) {
                debug!(path = %target.display(), "Source file already marked");
                Ok(target)
            } else {
                Err(e.into())
            }
        },
        Err(e) => Err(e.into()),
    }
}
