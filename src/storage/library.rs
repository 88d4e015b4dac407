use log::{debug, info, warn};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::sync::RwLock;
use uuid::Uuid;

use crate::core::{FileState, Message, OperationKind, Precedence};
use crate::storage::sync_file::copy_path;
use crate::storage::{ApplyOutcome, FileStatus, SyncFile, SyncHooks, SyncRecord, STAGING_DIR};
use crate::utils::{Result, SyncError};

/// Catalog of every synchronized file under one library root.
pub struct FileLibrary {
    root: PathBuf,
    staging_dir: PathBuf,
    idle_close: Duration,
    files: RwLock<HashMap<Uuid, Arc<SyncFile>>>,
    paths: RwLock<HashMap<String, Uuid>>,
    locked: AtomicBool,
}

impl FileLibrary {
    /// Opens the library at `root`, restoring every persisted record.
    pub async fn load(root: PathBuf, idle_close: Duration) -> Result<Self> {
        async_fs::create_dir_all(&root)
            .await
            .map_err(|e| SyncError::IoError(format!("Failed to create library: {}", e)))?;
        let root = async_fs::canonicalize(&root).await?;
        let staging_dir = root.join(STAGING_DIR);
        async_fs::create_dir_all(&staging_dir).await?;

        let library = Self {
            root,
            staging_dir,
            idle_close,
            files: RwLock::new(HashMap::new()),
            paths: RwLock::new(HashMap::new()),
            locked: AtomicBool::new(false),
        };
        let restored = library.restore_records().await?;
        info!(
            "Library {:?} loaded: {} records restored",
            library.root, restored
        );
        Ok(library)
    }

    async fn restore_records(&self) -> Result<usize> {
        let mut entries = async_fs::read_dir(&self.staging_dir).await?;
        let mut count = 0;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("info") {
                continue;
            }
            let record: SyncRecord = match async_fs::read(&path)
                .await
                .map_err(SyncError::from)
                .and_then(|bytes| Ok(serde_json::from_slice(&bytes)?))
            {
                Ok(record) => record,
                Err(e) => {
                    warn!("Skipping unreadable record {:?}: {}", path, e);
                    continue;
                }
            };

            let removed = record.last_operation.kind == OperationKind::Remove;
            let uuid = record.uuid;
            let rel = record.path.clone();
            let file = Arc::new(SyncFile::restore(
                record,
                &self.root,
                &self.staging_dir,
                self.idle_close,
            ));
            self.files.write().await.insert(uuid, file);
            if !removed {
                self.paths.write().await.insert(rel, uuid);
            }
            count += 1;
        }
        Ok(count)
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn staging_dir(&self) -> &Path {
        &self.staging_dir
    }

    pub async fn len(&self) -> usize {
        self.paths.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.paths.read().await.is_empty()
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Arc<SyncFile>> {
        self.files.read().await.get(uuid).cloned()
    }

    pub async fn get_by_path(&self, rel_path: &str) -> Option<Arc<SyncFile>> {
        let uuid = *self.paths.read().await.get(rel_path)?;
        self.get(&uuid).await
    }

    pub async fn all_files(&self) -> Vec<Arc<SyncFile>> {
        self.files.read().await.values().cloned().collect()
    }

    pub async fn file_states(&self, full: bool) -> Vec<FileState> {
        let mut states = Vec::new();
        for file in self.all_files().await {
            states.push(file.file_state(full).await);
        }
        states.sort_by_key(|s| s.uuid);
        states
    }

    /// Whole-library digest over every file's hash, name, path and version.
    pub async fn calculate_hash(&self) -> String {
        let mut hasher = Sha256::new();
        for state in self.file_states(false).await {
            hasher.update(state.hash.as_bytes());
            hasher.update(state.name.as_bytes());
            hasher.update(state.path.as_bytes());
            hasher.update(state.version.to_be_bytes());
        }
        hex::encode(hasher.finalize())
    }

    pub fn is_locked(&self) -> bool {
        self.locked.load(Ordering::SeqCst)
    }

    /// Takes the local advisory lock; false when it is already held.
    pub fn try_lock(&self) -> bool {
        self.locked
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_ok()
    }

    pub fn unlock(&self) {
        self.locked.store(false, Ordering::SeqCst);
    }

    /// Maps a user path (absolute or library-relative) to `(absolute, relative)`.
    pub fn resolve(&self, path: &Path) -> Result<(PathBuf, String)> {
        let relative = if path.is_absolute() {
            path.strip_prefix(&self.root)
                .map_err(|_| SyncError::OutsideLibrary(path.display().to_string()))?
                .to_path_buf()
        } else {
            path.to_path_buf()
        };

        let mut parts = Vec::new();
        for component in relative.components() {
            match component {
                Component::Normal(part) => parts.push(part.to_string_lossy().to_string()),
                Component::CurDir => {}
                _ => return Err(SyncError::OutsideLibrary(path.display().to_string())),
            }
        }
        if parts.is_empty() || parts[0] == STAGING_DIR {
            return Err(SyncError::OutsideLibrary(path.display().to_string()));
        }

        let rel = parts.join("/");
        Ok((self.root.join(&rel), rel))
    }

    /// Files whose path is `rel` or lives under the directory `rel`.
    async fn files_under(&self, rel: &str) -> Vec<(String, Arc<SyncFile>)> {
        let prefix = format!("{}/", rel);
        let uuids: Vec<(String, Uuid)> = self
            .paths
            .read()
            .await
            .iter()
            .filter(|(path, _)| path.as_str() == rel || path.starts_with(&prefix))
            .map(|(path, uuid)| (path.clone(), *uuid))
            .collect();

        let files = self.files.read().await;
        let mut out: Vec<(String, Arc<SyncFile>)> = uuids
            .into_iter()
            .filter_map(|(path, uuid)| files.get(&uuid).cloned().map(|f| (path, f)))
            .collect();
        out.sort_by(|a, b| a.0.cmp(&b.0));
        out
    }

    async fn register(&self, file: Arc<SyncFile>) {
        let uuid = file.uuid();
        self.paths.write().await.insert(file.rel_path(), uuid);
        self.files.write().await.insert(uuid, file);
    }

    /// Registers a file (or every file under a directory) already on disk.
    pub async fn add(&self, path: &Path, hooks: &dyn SyncHooks) -> Result<Vec<Uuid>> {
        let (abs, rel) = self.resolve(path)?;
        if !abs.exists() {
            return Err(SyncError::FileNotFound(rel));
        }

        let candidates = if abs.is_dir() {
            walk_files(&abs, &self.root).await?
        } else {
            if self.paths.read().await.contains_key(&rel) {
                return Err(SyncError::AlreadyExists(rel));
            }
            vec![rel]
        };

        let mut added = Vec::new();
        for rel in candidates {
            if self.paths.read().await.contains_key(&rel) {
                continue;
            }
            let file = Arc::new(SyncFile::new_local(
                &self.root,
                &self.staging_dir,
                &rel,
                self.idle_close,
            ));
            file.apply_operation_from_me(OperationKind::Create, None, hooks)
                .await?;
            added.push(file.uuid());
            self.register(file).await;
            info!("Added {} to library", rel);
        }
        Ok(added)
    }

    /// Re-hashes a changed file and announces the new version.
    pub async fn modify(&self, path: &Path, hooks: &dyn SyncHooks) -> Result<Uuid> {
        let (abs, rel) = self.resolve(path)?;
        let file = self
            .get_by_path(&rel)
            .await
            .ok_or_else(|| SyncError::NotInLibrary(rel.clone()))?;
        if !abs.is_file() {
            return Err(SyncError::FileNotFound(rel));
        }
        file.apply_operation_from_me(OperationKind::Modify, None, hooks)
            .await?;
        Ok(file.uuid())
    }

    /// Deletes a file or directory from disk and announces each removal.
    pub async fn remove(&self, path: &Path, hooks: &dyn SyncHooks) -> Result<Vec<Uuid>> {
        let (abs, rel) = self.resolve(path)?;
        let targets = self.files_under(&rel).await;
        if targets.is_empty() {
            return Err(SyncError::NotInLibrary(rel));
        }

        let mut removed = Vec::new();
        for (file_rel, file) in targets {
            file.apply_operation_from_me(OperationKind::Remove, None, hooks)
                .await?;
            self.paths.write().await.remove(&file_rel);
            removed.push(file.uuid());
        }

        if abs.is_dir() {
            async_fs::remove_dir_all(&abs).await?;
        }
        info!("Removed {} ({} files)", rel, removed.len());
        Ok(removed)
    }

    /// Moves a file or directory inside the library.
    pub async fn move_path(
        &self,
        source: &Path,
        destination: &Path,
        hooks: &dyn SyncHooks,
    ) -> Result<Vec<Uuid>> {
        let (src_abs, src_rel) = self.resolve(source)?;
        let (dst_abs, dst_rel) = self.resolve(destination)?;
        if dst_abs.exists() || self.paths.read().await.contains_key(&dst_rel) {
            return Err(SyncError::AlreadyExists(dst_rel));
        }
        let targets = self.files_under(&src_rel).await;
        if targets.is_empty() {
            return Err(SyncError::NotInLibrary(src_rel));
        }

        let mut moved = Vec::new();
        for (file_rel, file) in targets {
            let new_rel = format!("{}{}", dst_rel, &file_rel[src_rel.len()..]);
            file.apply_operation_from_me(OperationKind::Move, Some(new_rel.clone()), hooks)
                .await?;
            {
                let mut paths = self.paths.write().await;
                paths.remove(&file_rel);
                paths.insert(new_rel, file.uuid());
            }
            moved.push(file.uuid());
        }

        if src_abs.is_dir() {
            if let Err(e) = async_fs::remove_dir_all(&src_abs).await {
                debug!("Leaving source directory {:?}: {}", src_abs, e);
            }
        }
        info!("Moved {} -> {} ({} files)", src_rel, dst_rel, moved.len());
        Ok(moved)
    }

    /// Registers files that appeared on disk and announces local edits made
    /// while the node was offline.
    pub async fn scan(&self, hooks: &dyn SyncHooks) -> Result<usize> {
        let mut changed = 0;
        for rel in walk_files(&self.root, &self.root).await? {
            match self.get_by_path(&rel).await {
                None => {
                    let file = Arc::new(SyncFile::new_local(
                        &self.root,
                        &self.staging_dir,
                        &rel,
                        self.idle_close,
                    ));
                    match file
                        .apply_operation_from_me(OperationKind::Create, None, hooks)
                        .await
                    {
                        Ok(_) => {
                            self.register(file).await;
                            changed += 1;
                        }
                        Err(e) => warn!("Failed to add {}: {}", rel, e),
                    }
                }
                Some(file) if file.status().await == FileStatus::Full => {
                    if file.real().update_metadata().await.is_err() {
                        continue;
                    }
                    if file.real().hash() != file.hash() {
                        match file
                            .apply_operation_from_me(OperationKind::Modify, None, hooks)
                            .await
                        {
                            Ok(_) => changed += 1,
                            Err(e) => warn!("Failed to update {}: {}", rel, e),
                        }
                    }
                }
                Some(_) => {}
            }
        }
        info!("Library scan: {} files added or changed", changed);
        Ok(changed)
    }

    /// Merges a batch of remote states.
    pub async fn update_library(
        &self,
        states: Vec<FileState>,
        conn: Option<Uuid>,
        hooks: &dyn SyncHooks,
    ) -> Result<()> {
        for state in states {
            let uuid = state.uuid;
            if let Err(e) = self.update_file_state(state, conn, hooks).await {
                warn!("Failed to merge remote state for {}: {}", uuid, e);
            }
        }
        Ok(())
    }

    pub async fn update_file_state(
        &self,
        state: FileState,
        conn: Option<Uuid>,
        hooks: &dyn SyncHooks,
    ) -> Result<ApplyOutcome> {
        if let Some(file) = self.get(&state.uuid).await {
            let outcome = file.update_file(state, conn, hooks).await?;
            self.apply_outcome(&file, &outcome).await;
            return Ok(outcome);
        }

        if state.last_operation.kind == OperationKind::Remove {
            debug!("Ignoring removal of unknown file {}", state.uuid);
            return Ok(ApplyOutcome::Unchanged);
        }

        if let Some(local) = self.get_by_path(&state.path).await {
            let mut incoming_op = state.last_operation.clone();
            incoming_op.version = state.version;
            let local_op = local.last_operation().await;
            if incoming_op.precedence_over(&local_op) != Precedence::Wins {
                debug!(
                    "Path conflict on {}: keeping local {} over {}",
                    state.path,
                    local.uuid(),
                    state.uuid
                );
                if let Some(conn) = conn {
                    hooks
                        .send_to(conn, Message::SendInfo(local.file_state(false).await))
                        .await;
                }
                return Ok(ApplyOutcome::Stale);
            }
            if state.hash_map.is_none() {
                if let Some(conn) = conn {
                    hooks.send_to(conn, Message::AskInfo { uuid: state.uuid }).await;
                }
                return Ok(ApplyOutcome::NeedsInfo);
            }

            info!(
                "Path conflict on {}: adopting remote {} over local {}",
                state.path,
                state.uuid,
                local.uuid()
            );
            self.files.write().await.remove(&local.uuid());
            self.paths.write().await.remove(&state.path);
            hooks.remove_leecher(local.uuid()).await;
            local.purge().await?;
        } else if state.hash_map.is_none() {
            if let Some(conn) = conn {
                hooks.send_to(conn, Message::AskInfo { uuid: state.uuid }).await;
            }
            return Ok(ApplyOutcome::NeedsInfo);
        }

        let file = Arc::new(SyncFile::new_remote(
            state.uuid,
            &self.root,
            &self.staging_dir,
            &state.path,
            self.idle_close,
        ));
        self.register(file.clone()).await;
        let outcome = file.update_file(state, conn, hooks).await?;
        self.apply_outcome(&file, &outcome).await;
        Ok(outcome)
    }

    async fn apply_outcome(&self, file: &Arc<SyncFile>, outcome: &ApplyOutcome) {
        if let ApplyOutcome::Applied {
            moved_from,
            removed,
            ..
        } = outcome
        {
            let mut paths = self.paths.write().await;
            if let Some(from) = moved_from {
                paths.remove(from);
            }
            if *removed {
                paths.remove(&file.rel_path());
            } else if let Some(previous) = paths.insert(file.rel_path(), file.uuid()) {
                if previous != file.uuid() {
                    warn!(
                        "Path {} now maps to {} (was {})",
                        file.rel_path(),
                        file.uuid(),
                        previous
                    );
                }
            }
        }
    }

    /// Staging copy location for `uuid`.
    pub fn copy_path(&self, uuid: Uuid) -> PathBuf {
        copy_path(&self.staging_dir, uuid)
    }
}

/// Every regular file under `dir` as a root-relative `/` path, skipping the
/// staging directory.
async fn walk_files(dir: &Path, root: &Path) -> Result<Vec<String>> {
    let mut out = Vec::new();
    let mut stack = vec![dir.to_path_buf()];
    while let Some(current) = stack.pop() {
        let mut entries = async_fs::read_dir(&current).await?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let file_type = entry.file_type().await?;
            if file_type.is_dir() {
                if path.file_name().and_then(|n| n.to_str()) == Some(STAGING_DIR) {
                    continue;
                }
                stack.push(path);
            } else if file_type.is_file() {
                if let Ok(rel) = path.strip_prefix(root) {
                    let rel: Vec<String> = rel
                        .components()
                        .map(|c| c.as_os_str().to_string_lossy().to_string())
                        .collect();
                    out.push(rel.join("/"));
                }
            }
        }
    }
    out.sort();
    Ok(out)
}
