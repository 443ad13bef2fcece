//! Directory trigger
//!
//! Polls the intake directory and enqueues a `new-data` job for every CSV
//! file that has finished being written. A file counts as finished once its
//! size and modification time are unchanged across two consecutive scans.
//! Files carrying a `staged` or `failed` marker are never picked up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::TriggerConfig;
use crate::error::{PipelineError, PipelineResult};
use crate::markers::marker_of;
use crate::queue::{JobQueue, Topic};

/// Size and mtime observed for a file during one scan
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

pub struct DirectoryTrigger {
    root: PathBuf,
    interval: Duration,
    queue: Arc<dyn JobQueue>,
    /// Stamp from the previous scan, per candidate path
    last_seen: HashMap<PathBuf, FileStamp>,
    /// Paths already turned into jobs by this process
    emitted: HashSet<PathBuf>,
}

impl DirectoryTrigger {
    pub fn new(config: &TriggerConfig, queue: Arc<dyn JobQueue>) -> Self {
        Self {
            root: config.intake_dir.clone(),
            interval: config.scan_interval(),
            queue,
            last_seen: HashMap::new(),
            emitted: HashSet::new(),
        }
    }

    /// Scan once and enqueue every file that became ready. Returns the number
    /// of jobs enqueued.
    pub async fn poll_once(&mut self) -> PipelineResult<usize> {
        let root = self.root.clone();
        let current = tokio::task::spawn_blocking(move || scan_candidates(&root))
            .await
            .map_err(|e| PipelineError::Io(std::io::Error::other(e)))?;

        let mut ready = Vec::new();
        for (path, stamp) in &current {
            if self.emitted.contains(path) {
                continue;
            }
            if self.last_seen.get(path) == Some(stamp) {
                ready.push(path.clone());
            }
        }

        // Forget paths that disappeared (typically renamed by the stager), so
        // a new file dropped under the same name triggers again.
        self.emitted.retain(|path| current.contains_key(path));
        self.last_seen = current;

        let mut enqueued = 0;
        for path in ready {
            match self.queue.enqueue(Topic::NewData, &path.to_string_lossy()).await {
                Ok(()) => {
                    info!(path = %path.display(), "New file ready for staging");
                    self.emitted.insert(path);
                    enqueued += 1;
                },
                Err(e) => {
                    // Not marked as emitted; the next scan tries again.
                    warn!(path = %path.display(), error = %e, "Failed to enqueue new file");
                },
            }
        }

        Ok(enqueued)
    }

    /// Poll until `shutdown` fires.
    pub async fn run(mut self, shutdown: CancellationToken) {
        info!(root = %self.root.display(), interval_ms = self.interval.as_millis() as u64, "Watching intake directory");

        loop {
            match self.poll_once().await {
                Ok(0) => {},
                Ok(count) => debug!(count, "Enqueued new files"),
                Err(e) => warn!(root = %self.root.display(), error = %e, "Intake scan failed"),
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("Shutdown requested, trigger stopping");
                    break;
                }
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }
}

/// Whether `path` is a file the trigger should consider at all.
pub fn is_candidate(path: &Path) -> bool {
    let is_csv = path
        .extension()
        .map(|ext| ext.eq_ignore_ascii_case("csv"))
        .unwrap_or(false);
    let hidden = path
        .file_name()
        .map(|name| name.to_string_lossy().starts_with('.'))
        .unwrap_or(true);

    is_csv && !hidden && marker_of(path).is_none()
}

fn scan_candidates(root: &Path) -> HashMap<PathBuf, FileStamp> {
    let mut found = HashMap::new();

    for entry in WalkDir::new(root).follow_links(false) {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(error = %e, "Skipping unreadable intake entry");
                continue;
            },
        };

        if !entry.file_type().is_file() || !is_candidate(entry.path()) {
            continue;
        }

        match entry.metadata() {
            Ok(meta) => {
                found.insert(
                    entry.into_path(),
                    FileStamp {
                        len: meta.len(),
                        modified: meta.modified().ok(),
                    },
                );
            },
            Err(e) => debug!(error = %e, "Skipping intake entry without metadata"),
        }
    }

    found
}
