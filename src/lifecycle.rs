//! Verified, crash-safe file transitions.
//!
//! The core primitive is the verified copy: copy, re-stat both sides,
//! compare length and (when both sides can hash) sha256, and remove the
//! partial destination on any mismatch. The original file is only moved
//! into a terminal directory after the destination copy is verified, so a
//! crash mid-operation leaves the source recoverable in place.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

use crate::bridge::FileBridge;
use crate::error::LifecycleError;
use crate::models::{DocState, Document, ReconciledRecord};

/// Report of one archive attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveReport {
    pub destination: PathBuf,
    /// False when the destination already held identical content and the
    /// operation was a no-op.
    pub copied: bool,
    pub bytes: u64,
}

pub struct FileLifecycleManager {
    bridge: Arc<dyn FileBridge>,
    watch_root: PathBuf,
    archive_root: PathBuf,
    year_subdirs: bool,
}

impl FileLifecycleManager {
    pub fn new(
        bridge: Arc<dyn FileBridge>,
        watch_root: PathBuf,
        archive_root: PathBuf,
        year_subdirs: bool,
    ) -> Self {
        Self {
            bridge,
            watch_root,
            archive_root,
            year_subdirs,
        }
    }

    /// Whether any bridge can reach the archive root. Used by `pdk check`.
    pub async fn archive_accessible(&self) -> bool {
        self.bridge.path_accessible(&self.archive_root).await
    }

    /// Compute the archive destination for a document.
    ///
    /// `{archive}/{year}/{year} - {family} - {title}.{ext}`, degrading
    /// gracefully when fields are missing.
    pub fn destination_for(&self, document: &Document, record: &ReconciledRecord) -> PathBuf {
        let ext = document
            .source_path
            .extension()
            .map(|e| e.to_string_lossy().to_lowercase())
            .unwrap_or_else(|| "pdf".to_string());

        let mut parts: Vec<String> = Vec::new();
        if let Some(year) = record.year {
            parts.push(year.to_string());
        }
        if let Some(first) = record.authors.first() {
            let family = first.split(',').next().unwrap_or(first).trim();
            if !family.is_empty() {
                parts.push(family.to_string());
            }
        }
        if let Some(title) = &record.title {
            parts.push(title.clone());
        }
        if parts.is_empty() {
            // Content hash keeps unnamed scans unique.
            parts.push(document.content_hash[..12].to_string());
        }

        let stem = sanitize_file_stem(&parts.join(" - "));

        let mut dir = self.archive_root.clone();
        if self.year_subdirs {
            if let Some(year) = record.year {
                dir = dir.join(year.to_string());
            }
        }
        dir.join(format!("{}.{}", stem, ext))
    }

    /// Copy the document to `dst` with verification.
    ///
    /// Duplicate policy: an existing destination with identical content is
    /// an already-completed no-op success; differing content requires
    /// `replace_existing`, otherwise `DestinationConflict`.
    pub async fn archive(
        &self,
        document: &Document,
        dst: &Path,
        replace_existing: bool,
    ) -> Result<ArchiveReport, LifecycleError> {
        let src = &document.source_path;
        let src_stat = self
            .bridge
            .stat(src)
            .await?
            .ok_or_else(|| LifecycleError::VerificationFailed {
                src: src.clone(),
                dst: dst.to_path_buf(),
                reason: "source file missing".to_string(),
            })?;

        if let Some(existing) = self.bridge.stat(dst).await? {
            let identical = existing.len == src_stat.len
                && match (&existing.sha256, &src_stat.sha256) {
                    (Some(a), Some(b)) => a == b,
                    // Size match is the best we can do when the backing
                    // store cannot hash.
                    _ => true,
                };
            if identical {
                info!(dst = %dst.display(), "destination already holds identical content");
                return Ok(ArchiveReport {
                    destination: dst.to_path_buf(),
                    copied: false,
                    bytes: existing.len,
                });
            }
            if !replace_existing {
                return Err(LifecycleError::DestinationConflict {
                    dst: dst.to_path_buf(),
                });
            }
            self.bridge.remove(dst).await?;
        }

        if let Some(parent) = dst.parent() {
            self.bridge.ensure_dir(parent).await?;
        }

        let bytes = self.bridge.copy(src, dst).await?;

        // Re-stat both sides before declaring success.
        let src_after = self.bridge.stat(src).await?;
        let dst_after = self.bridge.stat(dst).await?;
        let verify_err = match (&src_after, &dst_after) {
            (Some(s), Some(d)) if s.len != d.len => {
                Some(format!("length mismatch: {} vs {}", s.len, d.len))
            }
            (Some(s), Some(d)) => match (&s.sha256, &d.sha256) {
                (Some(a), Some(b)) if a != b => Some("content hash mismatch".to_string()),
                _ => None,
            },
            _ => Some("file vanished during copy".to_string()),
        };

        if let Some(reason) = verify_err {
            // Never leave a corrupt file behind.
            if let Err(e) = self.bridge.remove(dst).await {
                warn!(dst = %dst.display(), error = %e, "failed to remove partial destination");
            }
            return Err(LifecycleError::VerificationFailed {
                src: src.clone(),
                dst: dst.to_path_buf(),
                reason,
            });
        }

        info!(src = %src.display(), dst = %dst.display(), bytes, "archived");
        Ok(ArchiveReport {
            destination: dst.to_path_buf(),
            copied: true,
            bytes,
        })
    }

    /// Move the original into its terminal directory and record the reason.
    ///
    /// Idempotent: a document whose file already rests in the target
    /// terminal directory is left alone. The terminal directories live
    /// beside the watched root and are created on demand.
    pub async fn settle(
        &self,
        document: &mut Document,
        to: DocState,
        reason: Option<&str>,
    ) -> Result<PathBuf, LifecycleError> {
        let dir_name = to
            .terminal_dir()
            .ok_or_else(|| LifecycleError::IllegalTransition {
                from: document.state.to_string(),
                to: to.to_string(),
            })?;

        if !document.state.can_transition_to(to) {
            return Err(LifecycleError::IllegalTransition {
                from: document.state.to_string(),
                to: to.to_string(),
            });
        }

        let terminal_dir = self.watch_root.join(dir_name);
        let file_name = document
            .source_path
            .file_name()
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(document.id.clone()));
        let mut target = terminal_dir.join(&file_name);

        if document.source_path == target {
            document.state = to;
            return Ok(target);
        }

        tokio::fs::create_dir_all(&terminal_dir).await?;

        // Scanners reuse file names, so an earlier document may already
        // rest under this name. Never rename over a different original;
        // disambiguate with the content hash instead.
        if let Some(existing) = self.bridge.stat(&target).await? {
            let src_stat = self.bridge.stat(&document.source_path).await?;
            let identical = src_stat
                .map(|s| {
                    s.len == existing.len
                        && match (&s.sha256, &existing.sha256) {
                            (Some(a), Some(b)) => a == b,
                            _ => true,
                        }
                })
                .unwrap_or(false);
            if !identical {
                let tag = &document.content_hash[..8.min(document.content_hash.len())];
                warn!(
                    target = %target.display(),
                    "terminal name already taken by a different original, settling as a new name"
                );
                target = terminal_dir.join(disambiguated_name(&file_name, tag));
            }
        }

        // Same filesystem as the inbox, so a rename is atomic. Fall back
        // to verified copy + remove if the rename crosses devices.
        match tokio::fs::rename(&document.source_path, &target).await {
            Ok(()) => {}
            Err(_) => {
                let report = self
                    .archive_path(&document.source_path, &target, true)
                    .await?;
                debug_assert!(report.destination == target);
                tokio::fs::remove_file(&document.source_path).await?;
            }
        }

        if let Some(reason) = reason {
            let sidecar = reason_sidecar(&target);
            if let Err(e) = tokio::fs::write(&sidecar, format!("{}\n", reason)).await {
                warn!(path = %sidecar.display(), error = %e, "failed to write reason sidecar");
            }
        }

        info!(doc = %document.id, state = %to, path = %target.display(), "document settled");
        document.source_path = target.clone();
        document.state = to;
        Ok(target)
    }

    /// Verified copy between two arbitrary paths (used by the cross-device
    /// fallback in [`settle`](Self::settle)).
    async fn archive_path(
        &self,
        src: &Path,
        dst: &Path,
        replace_existing: bool,
    ) -> Result<ArchiveReport, LifecycleError> {
        let doc = Document {
            id: String::new(),
            source_path: src.to_path_buf(),
            content_hash: "000000000000".to_string(),
            language: None,
            state: DocState::Detected,
        };
        self.archive(&doc, dst, replace_existing).await
    }
}

/// Insert a short tag before the extension: `scan0001.pdf` with tag
/// `3b1f02aa` becomes `scan0001-3b1f02aa.pdf`.
fn disambiguated_name(file_name: &Path, tag: &str) -> PathBuf {
    let stem = file_name
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "document".to_string());
    match file_name.extension() {
        Some(ext) => PathBuf::from(format!("{}-{}.{}", stem, tag, ext.to_string_lossy())),
        None => PathBuf::from(format!("{}-{}", stem, tag)),
    }
}

/// Sidecar path for a settled file. Appends to the full file name so
/// `a.pdf` and `a.txt` never share a sidecar.
fn reason_sidecar(target: &Path) -> PathBuf {
    let name = target
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    target.with_file_name(format!("{}.reason.txt", name))
}

/// Strip path separators and control characters from a file stem and cap
/// its length so every backing store accepts it.
pub fn sanitize_file_stem(raw: &str) -> String {
    let mut out: String = raw
        .chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => ' ',
            c if c.is_control() => ' ',
            c => c,
        })
        .collect::<String>()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ");
    if out.chars().count() > 180 {
        out = out.chars().take(180).collect();
    }
    let trimmed = out.trim_end_matches([' ', '.']).to_string();
    if trimmed.is_empty() {
        "document".to_string()
    } else {
        trimmed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::NativeBridge;
    use tempfile::TempDir;

    fn manager(tmp: &TempDir) -> FileLifecycleManager {
        FileLifecycleManager::new(
            Arc::new(NativeBridge),
            tmp.path().join("inbox"),
            tmp.path().join("archive"),
            false,
        )
    }

    async fn doc(tmp: &TempDir, name: &str, content: &[u8]) -> Document {
        let inbox = tmp.path().join("inbox");
        tokio::fs::create_dir_all(&inbox).await.unwrap();
        let path = inbox.join(name);
        tokio::fs::write(&path, content).await.unwrap();
        Document {
            id: "doc-1".to_string(),
            source_path: path.clone(),
            content_hash: crate::bridge::hash_file(&path).await.unwrap(),
            language: None,
            state: DocState::InteractiveReview,
        }
    }

    #[tokio::test]
    async fn test_verified_copy_succeeds() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let d = doc(&tmp, "a.pdf", b"0123456789").await;
        let dst = tmp.path().join("archive").join("a.pdf");

        let report = mgr.archive(&d, &dst, false).await.unwrap();
        assert!(report.copied);
        assert_eq!(report.bytes, 10);
        assert!(dst.exists());
        // Source untouched until settle.
        assert!(d.source_path.exists());
    }

    #[tokio::test]
    async fn test_identical_destination_is_noop() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let d = doc(&tmp, "a.pdf", b"same content").await;
        let dst = tmp.path().join("archive").join("a.pdf");

        let first = mgr.archive(&d, &dst, false).await.unwrap();
        assert!(first.copied);
        let second = mgr.archive(&d, &dst, false).await.unwrap();
        assert!(!second.copied);
        assert_eq!(second.destination, dst);
    }

    #[tokio::test]
    async fn test_differing_destination_conflicts() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let d = doc(&tmp, "a.pdf", b"new content").await;
        let dst = tmp.path().join("archive").join("a.pdf");
        tokio::fs::create_dir_all(dst.parent().unwrap())
            .await
            .unwrap();
        tokio::fs::write(&dst, b"old, different").await.unwrap();

        let err = mgr.archive(&d, &dst, false).await.unwrap_err();
        assert!(matches!(err, LifecycleError::DestinationConflict { .. }));
        // Existing file must be untouched.
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"old, different");

        let report = mgr.archive(&d, &dst, true).await.unwrap();
        assert!(report.copied);
        assert_eq!(tokio::fs::read(&dst).await.unwrap(), b"new content");
    }

    #[tokio::test]
    async fn test_settle_moves_into_terminal_dir() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut d = doc(&tmp, "a.pdf", b"x").await;

        let settled = mgr
            .settle(&mut d, DocState::ManualReview, Some("operator quit"))
            .await
            .unwrap();
        assert_eq!(
            settled,
            tmp.path().join("inbox").join("manual-review").join("a.pdf")
        );
        assert!(settled.exists());
        assert_eq!(d.state, DocState::ManualReview);
        let sidecar = settled.with_file_name("a.pdf.reason.txt");
        let reason = tokio::fs::read_to_string(sidecar).await.unwrap();
        assert!(reason.contains("operator quit"));
    }

    #[tokio::test]
    async fn test_settle_same_name_keeps_both_originals() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        // Scanners reuse names; the watcher admits both because their
        // content differs.
        let mut first = doc(&tmp, "scan0001.pdf", b"FIRST DOCUMENT").await;
        let first_settled = mgr
            .settle(&mut first, DocState::ManualReview, None)
            .await
            .unwrap();

        let mut second = doc(&tmp, "scan0001.pdf", b"SECOND DOCUMENT").await;
        let second_settled = mgr
            .settle(&mut second, DocState::ManualReview, None)
            .await
            .unwrap();

        assert_ne!(first_settled, second_settled);
        assert_eq!(
            tokio::fs::read(&first_settled).await.unwrap(),
            b"FIRST DOCUMENT"
        );
        assert_eq!(
            tokio::fs::read(&second_settled).await.unwrap(),
            b"SECOND DOCUMENT"
        );
        let tag = &second.content_hash[..8];
        assert_eq!(
            second_settled.file_name().unwrap().to_string_lossy(),
            format!("scan0001-{}.pdf", tag)
        );
    }

    #[tokio::test]
    async fn test_settle_same_name_identical_content_reuses_target() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        let mut first = doc(&tmp, "scan0001.pdf", b"same bytes").await;
        let first_settled = mgr
            .settle(&mut first, DocState::ManualReview, None)
            .await
            .unwrap();

        let mut second = doc(&tmp, "scan0001.pdf", b"same bytes").await;
        let second_settled = mgr
            .settle(&mut second, DocState::ManualReview, None)
            .await
            .unwrap();

        assert_eq!(first_settled, second_settled);
        assert_eq!(tokio::fs::read(&second_settled).await.unwrap(), b"same bytes");
    }

    #[tokio::test]
    async fn test_reason_sidecars_distinct_per_extension() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);

        let mut pdf = doc(&tmp, "a.pdf", b"pdf bytes").await;
        let pdf_settled = mgr
            .settle(&mut pdf, DocState::ManualReview, Some("pdf reason"))
            .await
            .unwrap();

        let mut txt = doc(&tmp, "a.txt", b"txt bytes").await;
        let txt_settled = mgr
            .settle(&mut txt, DocState::ManualReview, Some("txt reason"))
            .await
            .unwrap();

        let pdf_sidecar = pdf_settled.with_file_name("a.pdf.reason.txt");
        let txt_sidecar = txt_settled.with_file_name("a.txt.reason.txt");
        assert_ne!(pdf_sidecar, txt_sidecar);
        assert!(tokio::fs::read_to_string(&pdf_sidecar)
            .await
            .unwrap()
            .contains("pdf reason"));
        assert!(tokio::fs::read_to_string(&txt_sidecar)
            .await
            .unwrap()
            .contains("txt reason"));
    }

    #[tokio::test]
    async fn test_settle_is_idempotent() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut d = doc(&tmp, "a.pdf", b"x").await;

        let first = mgr.settle(&mut d, DocState::ManualReview, None).await.unwrap();
        let second = mgr.settle(&mut d, DocState::ManualReview, None).await.unwrap();
        assert_eq!(first, second);
        assert!(first.exists());
    }

    #[tokio::test]
    async fn test_settle_rejects_illegal_transition() {
        let tmp = TempDir::new().unwrap();
        let mgr = manager(&tmp);
        let mut d = doc(&tmp, "a.pdf", b"x").await;
        d.state = DocState::Extracting;

        let err = mgr
            .settle(&mut d, DocState::ManualReview, None)
            .await
            .unwrap_err();
        assert!(matches!(err, LifecycleError::IllegalTransition { .. }));
    }

    #[tokio::test]
    async fn test_destination_naming() {
        let tmp = TempDir::new().unwrap();
        let mgr = FileLifecycleManager::new(
            Arc::new(NativeBridge),
            tmp.path().join("inbox"),
            tmp.path().join("archive"),
            true,
        );
        let d = doc(&tmp, "scan0001.pdf", b"x").await;
        let rec = ReconciledRecord {
            title: Some("Attention Is All You Need".into()),
            authors: vec!["Vaswani, A.".into()],
            year: Some(2017),
            ..Default::default()
        };
        let dst = mgr.destination_for(&d, &rec);
        assert_eq!(
            dst,
            tmp.path()
                .join("archive")
                .join("2017")
                .join("2017 - Vaswani - Attention Is All You Need.pdf")
        );
    }

    #[test]
    fn test_sanitize_file_stem() {
        assert_eq!(sanitize_file_stem("a/b:c*d"), "a b c d");
        assert_eq!(sanitize_file_stem("  spaced   out  "), "spaced out");
        assert_eq!(sanitize_file_stem(""), "document");
    }
}
