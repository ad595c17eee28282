//! Filesystem access abstraction.
//!
//! Some archive volumes are not reachable from the primary runtime. The
//! [`FileBridge`] trait hides that: [`NativeBridge`] uses tokio::fs
//! directly, [`HelperBridge`] delegates the same primitives to an external
//! helper command speaking JSON, and [`RoutedBridge`] picks one per path.
//! Callers cannot tell which path was used; copy, verify, and
//! cleanup-on-failure semantics are identical on both.

use async_trait::async_trait;
use serde::Deserialize;
use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::process::Command;
use tracing::debug;

use crate::error::LifecycleError;

/// Size and optional content hash of a file, as seen by a bridge.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct FileStat {
    pub len: u64,
    /// sha256 hex. `None` when the backing store cannot hash cheaply.
    #[serde(default)]
    pub sha256: Option<String>,
}

/// Primitive filesystem operations behind the bridge boundary.
#[async_trait]
pub trait FileBridge: Send + Sync {
    fn name(&self) -> &str;

    /// Whether this bridge can operate on the given path at all.
    async fn path_accessible(&self, path: &Path) -> bool;

    async fn ensure_dir(&self, path: &Path) -> Result<(), LifecycleError>;

    /// Stat a file; `Ok(None)` means it does not exist.
    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, LifecycleError>;

    /// Raw copy, no verification. Returns bytes written.
    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64, LifecycleError>;

    async fn remove(&self, path: &Path) -> Result<(), LifecycleError>;
}

/// Direct tokio::fs implementation for volumes the runtime can reach.
pub struct NativeBridge;

pub async fn hash_file(path: &Path) -> std::io::Result<String> {
    let bytes = tokio::fs::read(path).await?;
    let mut hasher = Sha256::new();
    hasher.update(&bytes);
    Ok(format!("{:x}", hasher.finalize()))
}

#[async_trait]
impl FileBridge for NativeBridge {
    fn name(&self) -> &str {
        "native"
    }

    async fn path_accessible(&self, path: &Path) -> bool {
        // Walk up to the nearest existing ancestor; the volume is reachable
        // if any ancestor exists.
        let mut cur = Some(path);
        while let Some(p) = cur {
            if tokio::fs::metadata(p).await.is_ok() {
                return true;
            }
            cur = p.parent();
        }
        false
    }

    async fn ensure_dir(&self, path: &Path) -> Result<(), LifecycleError> {
        tokio::fs::create_dir_all(path).await?;
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, LifecycleError> {
        match tokio::fs::metadata(path).await {
            Ok(meta) => {
                let sha256 = hash_file(path).await.ok();
                Ok(Some(FileStat {
                    len: meta.len(),
                    sha256,
                }))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64, LifecycleError> {
        if let Some(parent) = dst.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(tokio::fs::copy(src, dst).await?)
    }

    async fn remove(&self, path: &Path) -> Result<(), LifecycleError> {
        tokio::fs::remove_file(path).await?;
        Ok(())
    }
}

/// Delegates primitives to an external helper command.
///
/// The helper is invoked as `<command...> <op> <args...>` and prints a
/// JSON object on stdout: `{"ok": true, ...}` or `{"ok": false,
/// "error": ".."}`. Ops: `accessible`, `mkdir`, `stat`, `copy`, `rm`.
pub struct HelperBridge {
    command: Vec<String>,
}

impl HelperBridge {
    pub fn new(command: Vec<String>) -> Self {
        Self { command }
    }

    async fn invoke(&self, op: &str, args: &[&Path]) -> Result<serde_json::Value, LifecycleError> {
        let program = self
            .command
            .first()
            .ok_or_else(|| LifecycleError::Bridge("helper command not configured".to_string()))?;

        let mut cmd = Command::new(program);
        cmd.args(&self.command[1..]).arg(op);
        for a in args {
            cmd.arg(a);
        }
        cmd.stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);

        let output = cmd
            .output()
            .await
            .map_err(|e| LifecycleError::Bridge(format!("helper spawn failed: {}", e)))?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(LifecycleError::Bridge(format!(
                "helper {} failed (exit {}): {}",
                op,
                output.status,
                stderr.trim()
            )));
        }

        let json: serde_json::Value = serde_json::from_slice(&output.stdout)
            .map_err(|e| LifecycleError::Bridge(format!("helper produced invalid JSON: {}", e)))?;

        if json.get("ok").and_then(|v| v.as_bool()) != Some(true) {
            let msg = json
                .get("error")
                .and_then(|v| v.as_str())
                .unwrap_or("unspecified helper error");
            return Err(LifecycleError::Bridge(format!("helper {}: {}", op, msg)));
        }

        Ok(json)
    }
}

#[async_trait]
impl FileBridge for HelperBridge {
    fn name(&self) -> &str {
        "helper"
    }

    async fn path_accessible(&self, path: &Path) -> bool {
        match self.invoke("accessible", &[path]).await {
            Ok(json) => json
                .get("accessible")
                .and_then(|v| v.as_bool())
                .unwrap_or(false),
            Err(_) => false,
        }
    }

    async fn ensure_dir(&self, path: &Path) -> Result<(), LifecycleError> {
        self.invoke("mkdir", &[path]).await.map(|_| ())
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, LifecycleError> {
        let json = self.invoke("stat", &[path]).await?;
        if json.get("exists").and_then(|v| v.as_bool()) == Some(false) {
            return Ok(None);
        }
        let stat: FileStat = serde_json::from_value(
            json.get("stat")
                .cloned()
                .ok_or_else(|| LifecycleError::Bridge("stat response missing 'stat'".into()))?,
        )
        .map_err(|e| LifecycleError::Bridge(format!("bad stat payload: {}", e)))?;
        Ok(Some(stat))
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64, LifecycleError> {
        let json = self.invoke("copy", &[src, dst]).await?;
        Ok(json
            .get("bytes_copied")
            .and_then(|v| v.as_u64())
            .unwrap_or(0))
    }

    async fn remove(&self, path: &Path) -> Result<(), LifecycleError> {
        self.invoke("rm", &[path]).await.map(|_| ())
    }
}

/// Routes each destination to the native bridge when the path is reachable
/// and to the helper otherwise. Sources are always read natively (they
/// live in the watched inbox).
pub struct RoutedBridge {
    native: NativeBridge,
    helper: Option<HelperBridge>,
}

impl RoutedBridge {
    pub fn new(helper_command: Vec<String>) -> Self {
        let helper = if helper_command.is_empty() {
            None
        } else {
            Some(HelperBridge::new(helper_command))
        };
        Self {
            native: NativeBridge,
            helper,
        }
    }

    async fn route(&self, path: &Path) -> &dyn FileBridge {
        if self.native.path_accessible(path).await {
            return &self.native;
        }
        if let Some(helper) = &self.helper {
            debug!(path = %path.display(), "routing through helper bridge");
            return helper;
        }
        &self.native
    }
}

#[async_trait]
impl FileBridge for RoutedBridge {
    fn name(&self) -> &str {
        "routed"
    }

    async fn path_accessible(&self, path: &Path) -> bool {
        if self.native.path_accessible(path).await {
            return true;
        }
        match &self.helper {
            Some(h) => h.path_accessible(path).await,
            None => false,
        }
    }

    async fn ensure_dir(&self, path: &Path) -> Result<(), LifecycleError> {
        self.route(path).await.ensure_dir(path).await
    }

    async fn stat(&self, path: &Path) -> Result<Option<FileStat>, LifecycleError> {
        self.route(path).await.stat(path).await
    }

    async fn copy(&self, src: &Path, dst: &Path) -> Result<u64, LifecycleError> {
        self.route(dst).await.copy(src, dst).await
    }

    async fn remove(&self, path: &Path) -> Result<(), LifecycleError> {
        self.route(path).await.remove(path).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_native_stat_missing_is_none() {
        let tmp = TempDir::new().unwrap();
        let stat = NativeBridge
            .stat(&tmp.path().join("nope.pdf"))
            .await
            .unwrap();
        assert!(stat.is_none());
    }

    #[tokio::test]
    async fn test_native_stat_reports_len_and_hash() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("doc.pdf");
        tokio::fs::write(&path, b"hello world").await.unwrap();

        let stat = NativeBridge.stat(&path).await.unwrap().unwrap();
        assert_eq!(stat.len, 11);
        let sha = stat.sha256.unwrap();
        assert_eq!(sha.len(), 64);
        assert_eq!(sha, hash_file(&path).await.unwrap());
    }

    #[tokio::test]
    async fn test_native_copy_creates_parents() {
        let tmp = TempDir::new().unwrap();
        let src = tmp.path().join("a.pdf");
        let dst = tmp.path().join("deep/nested/b.pdf");
        tokio::fs::write(&src, b"content").await.unwrap();

        let n = NativeBridge.copy(&src, &dst).await.unwrap();
        assert_eq!(n, 7);
        assert!(dst.exists());
    }

    #[tokio::test]
    async fn test_accessible_walks_to_existing_ancestor() {
        let tmp = TempDir::new().unwrap();
        assert!(
            NativeBridge
                .path_accessible(&tmp.path().join("not/yet/created/file.pdf"))
                .await
        );
    }

    #[tokio::test]
    async fn test_routed_without_helper_falls_back_native() {
        let tmp = TempDir::new().unwrap();
        let bridge = RoutedBridge::new(Vec::new());
        let path = tmp.path().join("x.pdf");
        tokio::fs::write(&path, b"x").await.unwrap();
        assert!(bridge.stat(&path).await.unwrap().is_some());
    }
}
