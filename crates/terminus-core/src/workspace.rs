//! Workspace manager
//!
//! Makes the logical file tree of a session exist as a real directory tree
//! under `workspace_root/<session_id>/` and keeps the repository and the
//! disk in sync under concurrent access. The shell and the execution engine
//! both run inside the materialized directory, so writes are atomic
//! (temp + rename) and same-path writers are serialized.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::store::FileStore;
use dashmap::DashMap;
use rand::Rng;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;
use terminus_types::{ChangeSet, CodeFile};
use tracing::{debug, warn};

/// Path components and names excluded from both the virtual tree and sync.
const IGNORED_COMPONENTS: &[&str] = &["node_modules", ".npm", ".npmrc"];

pub struct WorkspaceManager {
    config: Arc<Config>,
    store: Arc<dyn FileStore>,
    /// Serializes writers per `(session, path)` so the shell never observes
    /// partial content during sync.
    path_locks: DashMap<String, Arc<tokio::sync::Mutex<()>>>,
}

impl WorkspaceManager {
    pub fn new(config: Arc<Config>, store: Arc<dyn FileStore>) -> Self {
        Self {
            config,
            store,
            path_locks: DashMap::new(),
        }
    }

    /// On-disk root for one session's workspace.
    pub fn session_root(&self, session_id: i64) -> PathBuf {
        self.config.workspace_root.join(session_id.to_string())
    }

    /// Validate a logical path and resolve it inside the session root.
    ///
    /// A valid path starts with `/`, has no `..` components, and resolves
    /// to a strict descendant of the session root.
    pub fn resolve(&self, session_id: i64, path: &str) -> Result<PathBuf> {
        if !path.starts_with('/') {
            return Err(Error::Path(format!("path must be absolute: {}", path)));
        }
        let relative = Path::new(path.trim_start_matches('/'));
        if relative.as_os_str().is_empty() {
            return Err(Error::Path("empty path".to_string()));
        }
        for component in relative.components() {
            match component {
                Component::Normal(_) => {}
                _ => return Err(Error::Path(format!("path traversal rejected: {}", path))),
            }
        }
        let root = self.session_root(session_id);
        let resolved = root.join(relative);
        if !resolved.starts_with(&root) {
            return Err(Error::Path(format!("path escapes workspace: {}", path)));
        }
        Ok(resolved)
    }

    /// Create the workspace directory and write every CodeFile of the
    /// session to disk. Idempotent.
    pub async fn materialize(&self, session_id: i64) -> Result<PathBuf> {
        let root = self.session_root(session_id);
        ensure_root(&self.config.workspace_root).await?;
        tokio::fs::create_dir_all(&root)
            .await
            .map_err(|e| Error::Workspace(format!("create {}: {}", root.display(), e)))?;

        let files = self.store.list_files(session_id).await?;
        for file in latest_per_path(files) {
            if is_ignored(&file.path) {
                continue;
            }
            // Legacy rows can carry invalid paths; skip them rather than
            // failing the whole materialization.
            let target = match self.resolve(session_id, &file.path) {
                Ok(target) => target,
                Err(e) => {
                    warn!(session_id, path = %file.path, %e, "skipping unmappable file row");
                    continue;
                }
            };
            self.write_atomic(session_id, &file.path, &target, file.content.as_bytes())
                .await?;
        }

        debug!(session_id, root = %root.display(), "workspace materialized");
        Ok(root)
    }

    /// Scan the workspace tree and reconcile the repository with it.
    ///
    /// Discovered files are upserted (content compared by SHA-256 so
    /// unchanged rows are not touched); rows whose disk counterpart is gone
    /// are deleted. Bounded by the configured sync budget.
    pub async fn sync_from_disk(&self, session_id: i64) -> Result<ChangeSet> {
        let budget = self.config.workspace_sync_max;
        tokio::time::timeout(budget, self.sync_from_disk_inner(session_id))
            .await
            .map_err(|_| {
                Error::Workspace(format!(
                    "workspace sync exceeded {} ms budget",
                    budget.as_millis()
                ))
            })?
    }

    async fn sync_from_disk_inner(&self, session_id: i64) -> Result<ChangeSet> {
        let root = self.session_root(session_id);
        let mut changes = ChangeSet::default();
        if !root.exists() {
            return Ok(changes);
        }

        let disk_paths = self.scan_tree(&root).await?;
        let rows = self.store.list_files(session_id).await?;
        let mut by_path: HashMap<String, CodeFile> = HashMap::new();
        for row in latest_per_path(rows) {
            by_path.insert(row.path.clone(), row);
        }

        for logical in &disk_paths {
            let on_disk = self.resolve(session_id, logical)?;
            let bytes = tokio::fs::read(&on_disk)
                .await
                .map_err(|e| Error::Workspace(format!("read {}: {}", on_disk.display(), e)))?;
            let content = match String::from_utf8(bytes) {
                Ok(text) => text,
                Err(_) => {
                    warn!(session_id, path = %logical, "skipping non-UTF-8 file during sync");
                    continue;
                }
            };
            match by_path.remove(logical) {
                Some(row) => {
                    if content_hash(row.content.as_bytes()) != content_hash(content.as_bytes()) {
                        self.store.upsert_file(session_id, logical, &content).await?;
                        changes.updated.push(logical.clone());
                    }
                }
                None => {
                    self.store.upsert_file(session_id, logical, &content).await?;
                    changes.created.push(logical.clone());
                }
            }
        }

        // Rows left over have no disk counterpart.
        for (path, _) in by_path {
            self.store.delete_file(session_id, &path).await?;
            changes.deleted.push(path);
        }

        changes.created.sort();
        changes.updated.sort();
        changes.deleted.sort();
        debug!(
            session_id,
            created = changes.created.len(),
            updated = changes.updated.len(),
            deleted = changes.deleted.len(),
            "workspace sync complete"
        );
        Ok(changes)
    }

    /// Atomic write to disk plus upsert to the repository.
    pub async fn write_file(&self, session_id: i64, path: &str, content: &str) -> Result<CodeFile> {
        let target = self.resolve(session_id, path)?;
        tokio::fs::create_dir_all(&self.session_root(session_id))
            .await
            .map_err(|e| Error::Workspace(e.to_string()))?;
        self.write_atomic(session_id, path, &target, content.as_bytes())
            .await?;
        self.store.upsert_file(session_id, path, content).await
    }

    pub async fn read_file(&self, session_id: i64, path: &str) -> Result<String> {
        let target = self.resolve(session_id, path)?;
        tokio::fs::read_to_string(&target)
            .await
            .map_err(|e| Error::Workspace(format!("read {}: {}", target.display(), e)))
    }

    /// Remove a file from both disk and the repository.
    pub async fn delete_file(&self, session_id: i64, path: &str) -> Result<()> {
        let target = self.resolve(session_id, path)?;
        let _guard = self.lock_path(session_id, path).await;
        match tokio::fs::remove_file(&target).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => {
                return Err(Error::Workspace(format!(
                    "remove {}: {}",
                    target.display(),
                    e
                )))
            }
        }
        self.store.delete_file(session_id, path).await
    }

    /// Remove ignored files from disk and the repository. Safe to repeat.
    pub async fn cleanup(&self, session_id: i64) -> Result<usize> {
        let root = self.session_root(session_id);
        let mut removed = 0;

        if root.exists() {
            for logical in self.scan_tree_raw(&root).await? {
                if !is_ignored(&logical) {
                    continue;
                }
                let on_disk = self.resolve(session_id, &logical)?;
                if tokio::fs::remove_file(&on_disk).await.is_ok() {
                    removed += 1;
                }
            }
        }

        for row in self.store.list_files(session_id).await? {
            if is_ignored(&row.path) {
                self.store.delete_file(session_id, &row.path).await?;
                removed += 1;
            }
        }

        Ok(removed)
    }

    /// Logical paths of every non-ignored regular file in the workspace.
    pub async fn list_disk_files(&self, session_id: i64) -> Result<Vec<String>> {
        let root = self.session_root(session_id);
        if !root.exists() {
            return Ok(Vec::new());
        }
        self.scan_tree(&root).await
    }

    /// Delete the on-disk directory. Repository rows are the caller's
    /// responsibility (session deletion cascades them separately).
    pub async fn remove_workspace(&self, session_id: i64) -> Result<()> {
        let root = self.session_root(session_id);
        match tokio::fs::remove_dir_all(&root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Workspace(format!(
                "remove {}: {}",
                root.display(),
                e
            ))),
        }
    }

    async fn lock_path(&self, session_id: i64, path: &str) -> tokio::sync::OwnedMutexGuard<()> {
        let key = format!("{}:{}", session_id, path);
        let lock = self
            .path_locks
            .entry(key)
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        lock.lock_owned().await
    }

    async fn write_atomic(
        &self,
        session_id: i64,
        logical: &str,
        target: &Path,
        content: &[u8],
    ) -> Result<()> {
        let _guard = self.lock_path(session_id, logical).await;
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::Workspace(format!("mkdir {}: {}", parent.display(), e)))?;
        }
        let suffix: u32 = rand::thread_rng().gen();
        let tmp = target.with_extension(format!("tmp-{:08x}", suffix));
        tokio::fs::write(&tmp, content)
            .await
            .map_err(|e| Error::Workspace(format!("write {}: {}", tmp.display(), e)))?;
        tokio::fs::rename(&tmp, target).await.map_err(|e| {
            Error::Workspace(format!(
                "rename {} -> {}: {}",
                tmp.display(),
                target.display(),
                e
            ))
        })?;
        Ok(())
    }

    /// Non-ignored logical paths under `root`.
    async fn scan_tree(&self, root: &Path) -> Result<Vec<String>> {
        let mut paths = self.scan_tree_raw(root).await?;
        paths.retain(|p| !is_ignored(p));
        Ok(paths)
    }

    /// All regular-file logical paths under `root`, including ignored ones.
    async fn scan_tree_raw(&self, root: &Path) -> Result<Vec<String>> {
        let mut stack = vec![root.to_path_buf()];
        let mut paths = Vec::new();

        while let Some(dir) = stack.pop() {
            let mut entries = tokio::fs::read_dir(&dir)
                .await
                .map_err(|e| Error::Workspace(format!("scan {}: {}", dir.display(), e)))?;
            while let Some(entry) = entries
                .next_entry()
                .await
                .map_err(|e| Error::Workspace(e.to_string()))?
            {
                let path = entry.path();
                let file_type = entry
                    .file_type()
                    .await
                    .map_err(|e| Error::Workspace(e.to_string()))?;
                if file_type.is_dir() {
                    stack.push(path);
                } else if file_type.is_file() {
                    if let Ok(relative) = path.strip_prefix(root) {
                        let logical = format!("/{}", relative.to_string_lossy());
                        if !logical.ends_with(".tmp") && !logical.contains(".tmp-") {
                            paths.push(logical);
                        }
                    }
                }
            }
        }

        paths.sort();
        Ok(paths)
    }
}

/// Resolve legacy duplicate rows: keep only the newest row per path.
fn latest_per_path(files: Vec<CodeFile>) -> Vec<CodeFile> {
    let mut newest: HashMap<String, CodeFile> = HashMap::new();
    for file in files {
        match newest.get(&file.path) {
            Some(existing) if existing.updated_at >= file.updated_at => {}
            _ => {
                newest.insert(file.path.clone(), file);
            }
        }
    }
    newest.into_values().collect()
}

/// Whether a logical path is excluded from the virtual tree and sync.
pub fn is_ignored(path: &str) -> bool {
    let name = path.rsplit('/').next().unwrap_or(path);
    if name == "package.json" || name.ends_with(".log") || name.contains("npm-debug") {
        return true;
    }
    path.split('/')
        .any(|component| IGNORED_COMPONENTS.contains(&component))
}

fn content_hash(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

async fn ensure_root(root: &Path) -> Result<()> {
    tokio::fs::create_dir_all(root)
        .await
        .map_err(|e| Error::Workspace(format!("workspace root {}: {}", root.display(), e)))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let perms = std::fs::Permissions::from_mode(0o755);
        tokio::fs::set_permissions(root, perms)
            .await
            .map_err(|e| Error::Workspace(format!("chmod {}: {}", root.display(), e)))?;
    }
    Ok(())
}
