//! Watched-inbox scanning.
//!
//! The watcher polls the inbox on an interval rather than using inotify:
//! scanner hardware writes over SMB mounts where change notification is
//! unreliable, and a slow poll is plenty for a human-paced pipeline. A
//! file is only surfaced once it has been stable for a full poll cycle
//! (same size on two consecutive scans), so half-written scans are never
//! picked up. Content hashes dedup re-detections across polls and across
//! daemon restarts within one run.

use anyhow::{bail, Context, Result};
use globset::{Glob, GlobSet, GlobSetBuilder};
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::bridge;
use crate::config::WatchConfig;
use crate::models::{DocState, Document};

/// Subdirectories of the inbox that hold settled files; never scanned.
const TERMINAL_DIRS: [&str; 4] = ["done", "manual-review", "failed", "skipped"];

/// Name of the single-instance guard file inside the inbox root.
const GUARD_FILE: &str = ".pdk.lock";

/// A newly detected, size-stable inbox file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Detection {
    pub path: PathBuf,
    pub len: u64,
}

/// Holds the single-instance guard for the watched inbox.
///
/// Two daemons watching the same inbox would race each other on lifecycle
/// moves, so the guard file refuses the second instance. The file records
/// the owning pid; a stale guard (crashed daemon) must be removed by hand,
/// which the error message explains.
pub struct InstanceGuard {
    path: PathBuf,
}

impl InstanceGuard {
    pub fn acquire(watch_root: &Path) -> Result<Self> {
        let path = watch_root.join(GUARD_FILE);
        match std::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(mut f) => {
                use std::io::Write;
                write!(f, "{}", std::process::id())
                    .with_context(|| format!("Failed to write guard file {}", path.display()))?;
                Ok(Self { path })
            }
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                let owner = std::fs::read_to_string(&path).unwrap_or_default();
                bail!(
                    "Another instance is already watching this inbox (pid {} per {}). \
                     Remove the file if that process is no longer running.",
                    owner.trim(),
                    path.display()
                );
            }
            Err(e) => Err(e).with_context(|| {
                format!("Failed to create guard file {}", path.display())
            }),
        }
    }
}

impl Drop for InstanceGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), error = %e, "failed to remove guard file");
        }
    }
}

/// Polls the inbox and emits [`Detection`]s for new, stable files.
pub struct InboxWatcher {
    root: PathBuf,
    include: GlobSet,
    exclude: GlobSet,
    poll_interval: std::time::Duration,
    /// Size observed on the previous scan, per path. A file is emitted
    /// only when the current scan sees the same size again.
    pending: HashMap<PathBuf, u64>,
    /// Content hashes already handed to the pipeline this run.
    seen_hashes: HashSet<String>,
    emitted: HashSet<PathBuf>,
}

fn build_globset(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        builder.add(
            Glob::new(pattern).with_context(|| format!("Invalid glob pattern: {}", pattern))?,
        );
    }
    builder.build().context("Failed to build glob set")
}

impl InboxWatcher {
    pub fn new(config: &WatchConfig) -> Result<Self> {
        Ok(Self {
            root: config.root.clone(),
            include: build_globset(&config.include_globs)?,
            exclude: build_globset(&config.exclude_globs)?,
            poll_interval: std::time::Duration::from_secs(config.poll_interval_secs),
            pending: HashMap::new(),
            seen_hashes: HashSet::new(),
            emitted: HashSet::new(),
        })
    }

    fn wanted(&self, path: &Path) -> bool {
        let Ok(rel) = path.strip_prefix(&self.root) else {
            return false;
        };
        if let Some(first) = rel.components().next() {
            let first = first.as_os_str().to_string_lossy();
            if TERMINAL_DIRS.iter().any(|d| *d == first) {
                return false;
            }
        }
        if rel
            .file_name()
            .map(|n| n.to_string_lossy().starts_with('.'))
            .unwrap_or(false)
        {
            return false;
        }
        self.include.is_match(rel) && !self.exclude.is_match(rel)
    }

    /// One scan pass. Returns files that matched the globs and held the
    /// same size as on the previous pass.
    pub fn scan(&mut self) -> Vec<Detection> {
        let mut current: HashMap<PathBuf, u64> = HashMap::new();

        for entry in WalkDir::new(&self.root)
            .follow_links(false)
            .into_iter()
            .filter_map(|e| e.ok())
        {
            if !entry.file_type().is_file() {
                continue;
            }
            let path = entry.path().to_path_buf();
            if !self.wanted(&path) {
                continue;
            }
            let len = match entry.metadata() {
                Ok(m) => m.len(),
                Err(e) => {
                    debug!(path = %path.display(), error = %e, "stat failed during scan");
                    continue;
                }
            };
            current.insert(path, len);
        }

        let mut stable = Vec::new();
        for (path, len) in &current {
            if self.emitted.contains(path) {
                continue;
            }
            match self.pending.get(path) {
                Some(prev) if *prev == *len => {
                    stable.push(Detection {
                        path: path.clone(),
                        len: *len,
                    });
                    self.emitted.insert(path.clone());
                }
                Some(_) => {
                    debug!(path = %path.display(), "file still growing, deferring");
                }
                None => {}
            }
        }

        // Forget files that disappeared so a same-named rescan is re-detected.
        self.emitted.retain(|p| current.contains_key(p));
        self.pending = current;
        stable
    }

    /// Hash a detection and build a [`Document`] for it, deduplicating on
    /// content: a byte-identical file already handed out this run returns
    /// `None`.
    pub async fn admit(&mut self, detection: &Detection) -> Result<Option<Document>> {
        let hash = bridge::hash_file(&detection.path)
            .await
            .with_context(|| format!("Failed to hash {}", detection.path.display()))?;

        if !self.seen_hashes.insert(hash.clone()) {
            info!(path = %detection.path.display(), "duplicate content, ignoring");
            return Ok(None);
        }

        Ok(Some(Document {
            id: uuid::Uuid::new_v4().to_string(),
            source_path: detection.path.clone(),
            content_hash: hash,
            language: None,
            state: DocState::Detected,
        }))
    }

    /// Admit a batch of detections and send the resulting documents down
    /// `tx`. Returns `false` once the receiver is gone. A detection that
    /// fails to hash (file vanished, transient I/O error) is logged and
    /// skipped; the next scan pass re-detects it if it is still there.
    async fn dispatch(&mut self, detections: Vec<Detection>, tx: &mpsc::Sender<Document>) -> bool {
        for detection in detections {
            match self.admit(&detection).await {
                Ok(Some(document)) => {
                    info!(path = %document.source_path.display(), "new document detected");
                    if tx.send(document).await.is_err() {
                        return false;
                    }
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(path = %detection.path.display(), error = %e, "skipping detection");
                    self.emitted.remove(&detection.path);
                }
            }
        }
        true
    }

    /// Run the poll loop, sending admitted documents down `tx` until the
    /// receiver is dropped.
    pub async fn run(mut self, tx: mpsc::Sender<Document>) -> Result<()> {
        info!(root = %self.root.display(), interval = ?self.poll_interval, "watching inbox");
        loop {
            let detections = self.scan();
            if !self.dispatch(detections, &tx).await {
                return Ok(());
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn watcher(root: &Path) -> InboxWatcher {
        InboxWatcher::new(&WatchConfig {
            root: root.to_path_buf(),
            include_globs: vec!["**/*.pdf".to_string()],
            exclude_globs: vec!["**/drafts/**".to_string()],
            poll_interval_secs: 1,
        })
        .unwrap()
    }

    #[test]
    fn test_file_needs_two_stable_scans() {
        let tmp = TempDir::new().unwrap();
        std::fs::write(tmp.path().join("a.pdf"), b"content").unwrap();

        let mut w = watcher(tmp.path());
        assert!(w.scan().is_empty(), "first sighting must not emit");
        let second = w.scan();
        assert_eq!(second.len(), 1);
        assert_eq!(second[0].len, 7);
        assert!(w.scan().is_empty(), "already emitted, no repeat");
    }

    #[test]
    fn test_growing_file_deferred() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("scan.pdf");
        std::fs::write(&path, b"part").unwrap();

        let mut w = watcher(tmp.path());
        assert!(w.scan().is_empty());
        std::fs::write(&path, b"part and more").unwrap();
        assert!(w.scan().is_empty(), "size changed between scans");
        let third = w.scan();
        assert_eq!(third.len(), 1);
        assert_eq!(third[0].len, 13);
    }

    #[test]
    fn test_terminal_dirs_and_hidden_files_skipped() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("done")).unwrap();
        std::fs::write(tmp.path().join("done/old.pdf"), b"settled").unwrap();
        std::fs::write(tmp.path().join(".partial.pdf"), b"x").unwrap();
        std::fs::write(tmp.path().join("note.txt"), b"not matched").unwrap();

        let mut w = watcher(tmp.path());
        w.scan();
        assert!(w.scan().is_empty());
    }

    #[test]
    fn test_exclude_glob_applies() {
        let tmp = TempDir::new().unwrap();
        std::fs::create_dir_all(tmp.path().join("drafts")).unwrap();
        std::fs::write(tmp.path().join("drafts/wip.pdf"), b"x").unwrap();

        let mut w = watcher(tmp.path());
        w.scan();
        assert!(w.scan().is_empty());
    }

    #[tokio::test]
    async fn test_admit_dedups_identical_content() {
        let tmp = TempDir::new().unwrap();
        let a = tmp.path().join("a.pdf");
        let b = tmp.path().join("b.pdf");
        std::fs::write(&a, b"same bytes").unwrap();
        std::fs::write(&b, b"same bytes").unwrap();

        let mut w = watcher(tmp.path());
        let first = w
            .admit(&Detection { path: a, len: 10 })
            .await
            .unwrap();
        assert!(first.is_some());
        assert_eq!(first.unwrap().state, DocState::Detected);

        let second = w.admit(&Detection { path: b, len: 10 }).await.unwrap();
        assert!(second.is_none());
    }

    #[tokio::test]
    async fn test_dispatch_skips_unreadable_detection() {
        let tmp = TempDir::new().unwrap();
        let good = tmp.path().join("good.pdf");
        std::fs::write(&good, b"readable").unwrap();
        let gone = tmp.path().join("gone.pdf");

        let mut w = watcher(tmp.path());
        let (tx, mut rx) = mpsc::channel::<Document>(4);
        let alive = w
            .dispatch(
                vec![
                    Detection {
                        path: gone.clone(),
                        len: 8,
                    },
                    Detection {
                        path: good.clone(),
                        len: 8,
                    },
                ],
                &tx,
            )
            .await;

        // The vanished file must not take the loop down with it.
        assert!(alive);
        let doc = rx.try_recv().unwrap();
        assert_eq!(doc.source_path, good);
        assert!(rx.try_recv().is_err(), "only the readable file is admitted");
    }

    #[test]
    fn test_guard_refuses_second_instance() {
        let tmp = TempDir::new().unwrap();
        let guard = InstanceGuard::acquire(tmp.path()).unwrap();
        assert!(InstanceGuard::acquire(tmp.path()).is_err());
        drop(guard);
        // Released on drop; a new instance can start.
        assert!(InstanceGuard::acquire(tmp.path()).is_ok());
    }
}
