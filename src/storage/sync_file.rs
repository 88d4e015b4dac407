//! A library-visible file paired with its hidden staging copy.
//!
//! Downloads always land in the staging copy so a half-transferred file never
//! replaces the visible one. The copy's version and hash are the state compared
//! across peers; the last applied [`Operation`] arbitrates concurrent edits.

use async_trait::async_trait;
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::core::{FileState, Message, Operation, OperationKind, Precedence};
use crate::storage::{File, FileMetadata};
use crate::transfer::TransferEvent;
use crate::utils::{Result, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FileStatus {
    Empty,
    Downloading,
    Full,
}

/// Services a SyncFile needs from the transfer layer. The transfer engine is the
/// production implementation; tests plug in a recorder.
#[async_trait]
pub trait SyncHooks: Send + Sync {
    async fn broadcast(&self, message: Message);
    async fn send_to(&self, conn: Uuid, message: Message);
    /// Starts fetching `state`. An error leaves no download running.
    async fn init_leecher(&self, file: Arc<SyncFile>, state: FileState) -> Result<()>;
    async fn remove_leecher(&self, uuid: Uuid);
    async fn notify(&self, event: TransferEvent);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Same operation as the local one.
    Unchanged,
    /// Incoming state is older; the sender was sent our state.
    Stale,
    /// Content differs but no hash map was supplied; full info was requested.
    NeedsInfo,
    Applied {
        moved_from: Option<String>,
        removed: bool,
        downloading: bool,
    },
}

/// Persisted `<uuid>.info` record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncRecord {
    pub uuid: Uuid,
    pub path: String,
    pub status: FileStatus,
    pub last_operation: Operation,
    pub metadata: FileMetadata,
}

struct SyncState {
    status: FileStatus,
    last_operation: Operation,
}

pub struct SyncFile {
    uuid: Uuid,
    root: PathBuf,
    staging_dir: PathBuf,
    real: File,
    copy: File,
    state: Mutex<SyncState>,
}

pub fn copy_path(staging_dir: &Path, uuid: Uuid) -> PathBuf {
    staging_dir.join(format!("{}.data", uuid))
}

pub fn info_path(staging_dir: &Path, uuid: Uuid) -> PathBuf {
    staging_dir.join(format!("{}.info", uuid))
}

fn short_hash(hash: &str) -> &str {
    hash.get(..8).unwrap_or(hash)
}

impl SyncFile {
    fn build(
        uuid: Uuid,
        root: &Path,
        staging_dir: &Path,
        rel_path: &str,
        idle_close: Duration,
        status: FileStatus,
        last_operation: Operation,
    ) -> Self {
        Self {
            uuid,
            root: root.to_path_buf(),
            staging_dir: staging_dir.to_path_buf(),
            real: File::new(root.join(rel_path), rel_path, idle_close),
            copy: File::new(
                copy_path(staging_dir, uuid),
                format!("{}/{}.data", crate::storage::STAGING_DIR, uuid),
                idle_close,
            ),
            state: Mutex::new(SyncState {
                status,
                last_operation,
            }),
        }
    }

    /// Record for a file that exists locally but has never been announced.
    pub fn new_local(
        root: &Path,
        staging_dir: &Path,
        rel_path: &str,
        idle_close: Duration,
    ) -> Self {
        let placeholder = Operation::new(OperationKind::Create, rel_path, None, 0, "");
        Self::build(
            Uuid::new_v4(),
            root,
            staging_dir,
            rel_path,
            idle_close,
            FileStatus::Empty,
            placeholder,
        )
    }

    /// Record for a file first heard of from a peer. Any real operation beats
    /// the version-0 placeholder.
    pub fn new_remote(
        uuid: Uuid,
        root: &Path,
        staging_dir: &Path,
        rel_path: &str,
        idle_close: Duration,
    ) -> Self {
        let placeholder = Operation::new(OperationKind::Create, rel_path, None, 0, "");
        Self::build(
            uuid,
            root,
            staging_dir,
            rel_path,
            idle_close,
            FileStatus::Empty,
            placeholder,
        )
    }

    pub fn restore(
        record: SyncRecord,
        root: &Path,
        staging_dir: &Path,
        idle_close: Duration,
    ) -> Self {
        // An interrupted download restarts from scratch on the next announce.
        let status = match record.status {
            FileStatus::Downloading => FileStatus::Empty,
            other => other,
        };
        let file = Self::build(
            record.uuid,
            root,
            staging_dir,
            &record.path,
            idle_close,
            status,
            record.last_operation,
        );
        file.copy.set_metadata(record.metadata);
        file
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn real(&self) -> &File {
        &self.real
    }

    pub fn copy(&self) -> &File {
        &self.copy
    }

    pub fn rel_path(&self) -> String {
        self.real.rel_path()
    }

    pub fn version(&self) -> u64 {
        self.copy.version()
    }

    pub fn hash(&self) -> String {
        self.copy.hash()
    }

    pub async fn status(&self) -> FileStatus {
        self.state.lock().await.status
    }

    pub async fn last_operation(&self) -> Operation {
        self.state.lock().await.last_operation.clone()
    }

    pub async fn is_removed(&self) -> bool {
        self.state.lock().await.last_operation.kind == OperationKind::Remove
    }

    pub async fn file_state(&self, full: bool) -> FileState {
        let state = self.state.lock().await;
        self.file_state_locked(&state, full)
    }

    fn file_state_locked(&self, state: &SyncState, full: bool) -> FileState {
        let meta = self.copy.metadata();
        FileState {
            uuid: self.uuid,
            name: self.real.name(),
            path: self.real.rel_path(),
            hash: meta.hash,
            version: meta.version,
            size: meta.size,
            piece_size: meta.piece_size,
            last_operation: state.last_operation.clone(),
            hash_map: if full { Some(meta.hash_map) } else { None },
        }
    }

    pub async fn record(&self) -> SyncRecord {
        let state = self.state.lock().await;
        self.record_locked(&state)
    }

    fn record_locked(&self, state: &SyncState) -> SyncRecord {
        SyncRecord {
            uuid: self.uuid,
            path: self.real.rel_path(),
            status: state.status,
            last_operation: state.last_operation.clone(),
            metadata: self.copy.metadata(),
        }
    }

    async fn persist(&self, state: &SyncState) -> Result<()> {
        let record = self.record_locked(state);
        let bytes = serde_json::to_vec_pretty(&record)?;
        async_fs::create_dir_all(&self.staging_dir).await?;

        let path = info_path(&self.staging_dir, self.uuid);
        let tmp = path.with_extension("info.tmp");
        async_fs::write(&tmp, &bytes).await?;
        async_fs::rename(&tmp, &path).await?;
        Ok(())
    }

    pub async fn load_data(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        self.copy.load_data(offset, len).await
    }

    pub async fn write_chunk(&self, bytes: &[u8], offset: u64) -> Result<()> {
        self.copy.write_chunk(bytes, offset).await
    }

    /// Applies a mutation made on this node and announces it. Rejected while a
    /// download is in flight.
    pub async fn apply_operation_from_me(
        &self,
        kind: OperationKind,
        destination: Option<String>,
        hooks: &dyn SyncHooks,
    ) -> Result<Operation> {
        let mut state = self.state.lock().await;
        if state.status == FileStatus::Downloading {
            return Err(SyncError::DownloadInProgress(self.uuid));
        }

        let source = self.real.rel_path();
        match kind {
            OperationKind::Create | OperationKind::Modify => {
                self.real.update_metadata().await?;
                self.copy.copy_from(&self.real).await?;
            }
            OperationKind::Move => {
                let dest = destination.clone().ok_or_else(|| {
                    SyncError::NotInLibrary("move without destination".to_string())
                })?;
                self.real.rename_to(self.root.join(&dest), dest).await?;
            }
            OperationKind::Remove => {
                let path = self.real.path();
                if path.exists() {
                    async_fs::remove_file(&path).await?;
                }
            }
        }

        let version = self.copy.version() + 1;
        self.copy.set_version(version);
        let operation = Operation::new(kind, source, destination, version, self.copy.hash());
        state.last_operation = operation.clone();
        state.status = FileStatus::Full;
        self.persist(&state).await?;

        let announce = self.file_state_locked(&state, false);
        drop(state);

        info!(
            "Local {} on {} -> version {}",
            kind,
            operation.target_path(),
            version
        );
        hooks.broadcast(Message::SendInfo(announce)).await;
        Ok(operation)
    }

    /// Resolves a remote state against the local one. The state lock is always
    /// released before calling into `hooks`.
    pub async fn apply_operation_from_other(
        self: &Arc<Self>,
        incoming: FileState,
        conn: Option<Uuid>,
        hooks: &dyn SyncHooks,
    ) -> Result<ApplyOutcome> {
        let mut state = self.state.lock().await;
        let mut incoming_op = incoming.last_operation.clone();
        incoming_op.version = incoming.version;

        match incoming_op.precedence_over(&state.last_operation) {
            Precedence::Same => {
                // Same operation but no content here: an earlier download
                // never started or was interrupted, so fetch it now.
                let resumable = state.status == FileStatus::Empty
                    && state.last_operation.kind != OperationKind::Remove
                    && incoming.version > 0;
                if !resumable {
                    return Ok(ApplyOutcome::Unchanged);
                }
                if incoming.hash_map.is_none() {
                    drop(state);
                    if let Some(conn) = conn {
                        hooks
                            .send_to(conn, Message::AskInfo { uuid: self.uuid })
                            .await;
                    }
                    return Ok(ApplyOutcome::NeedsInfo);
                }
                state.status = FileStatus::Downloading;
                self.persist(&state).await?;
                drop(state);

                info!("Resuming download of {} v{}", self.rel_path(), incoming.version);
                let downloading = self.start_download(incoming, hooks).await;
                return Ok(ApplyOutcome::Applied {
                    moved_from: None,
                    removed: false,
                    downloading,
                });
            }
            Precedence::Loses => {
                let ours = self.file_state_locked(&state, false);
                drop(state);
                debug!(
                    "Stale state for {} (v{} < v{}), replying with ours",
                    self.uuid, incoming.version, ours.version
                );
                if let Some(conn) = conn {
                    hooks.send_to(conn, Message::SendInfo(ours)).await;
                }
                return Ok(ApplyOutcome::Stale);
            }
            Precedence::Wins => {}
        }

        if incoming_op.kind == OperationKind::Remove {
            let path = self.real.path();
            if path.exists() {
                async_fs::remove_file(&path).await?;
            }
            self.copy.set_version(incoming.version);
            state.last_operation = incoming_op;
            if state.status == FileStatus::Downloading {
                state.status = FileStatus::Empty;
            }
            self.persist(&state).await?;
            drop(state);

            info!("Remote remove of {} ({})", self.rel_path(), self.uuid);
            hooks.remove_leecher(self.uuid).await;
            hooks
                .notify(TransferEvent::FileRemoved {
                    uuid: self.uuid,
                    path: self.rel_path(),
                })
                .await;
            return Ok(ApplyOutcome::Applied {
                moved_from: None,
                removed: true,
                downloading: false,
            });
        }

        let content_changed = incoming.hash != self.copy.hash();
        if content_changed && incoming.hash_map.is_none() {
            drop(state);
            debug!("Missing hash map for {}, asking for full info", self.uuid);
            if let Some(conn) = conn {
                hooks
                    .send_to(conn, Message::AskInfo { uuid: self.uuid })
                    .await;
            }
            return Ok(ApplyOutcome::NeedsInfo);
        }

        let old_path = self.real.rel_path();
        let moved_from = if incoming.path != old_path {
            self.real
                .rename_to(self.root.join(&incoming.path), incoming.path.clone())
                .await?;
            Some(old_path)
        } else {
            None
        };

        state.last_operation = incoming_op;
        self.copy.set_version(incoming.version);

        let downloading = if content_changed {
            state.status = FileStatus::Downloading;
            true
        } else {
            if state.status == FileStatus::Empty {
                if let Err(e) = self.real.copy_from(&self.copy).await {
                    warn!("Failed to publish {}: {}", self.rel_path(), e);
                } else {
                    state.status = FileStatus::Full;
                }
            }
            false
        };
        self.persist(&state).await?;
        drop(state);

        if let Some(from) = &moved_from {
            hooks
                .notify(TransferEvent::FileMoved {
                    uuid: self.uuid,
                    from: from.clone(),
                    to: incoming.path.clone(),
                })
                .await;
        }
        let downloading = downloading && self.start_download(incoming, hooks).await;

        Ok(ApplyOutcome::Applied {
            moved_from,
            removed: false,
            downloading,
        })
    }

    /// Alias used by the library when a known UUID is announced again.
    pub async fn update_file(
        self: &Arc<Self>,
        incoming: FileState,
        conn: Option<Uuid>,
        hooks: &dyn SyncHooks,
    ) -> Result<ApplyOutcome> {
        self.apply_operation_from_other(incoming, conn, hooks).await
    }

    /// Hands `target` to the transfer layer. When no download can start the
    /// file drops back to `Empty` and the next announce retries it.
    async fn start_download(self: &Arc<Self>, target: FileState, hooks: &dyn SyncHooks) -> bool {
        match hooks.init_leecher(self.clone(), target).await {
            Ok(()) => true,
            Err(e) => {
                warn!("Download of {} could not start: {}", self.rel_path(), e);
                if let Err(e) = self.abort_download().await {
                    warn!("Failed to reset {}: {}", self.rel_path(), e);
                }
                false
            }
        }
    }

    /// Leaves the `Downloading` state without publishing anything.
    pub async fn abort_download(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.status != FileStatus::Downloading {
            return Ok(());
        }
        state.status = FileStatus::Empty;
        self.persist(&state).await
    }

    /// Publishes the verified staging copy over the visible file.
    pub async fn finish_download(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.last_operation.kind == OperationKind::Remove {
            return Ok(());
        }
        self.real.copy_from(&self.copy).await?;
        state.status = FileStatus::Full;
        self.persist(&state).await?;
        info!(
            "Download of {} complete (v{}, {})",
            self.rel_path(),
            self.copy.version(),
            short_hash(&self.copy.hash())
        );
        Ok(())
    }

    /// Drops the staging copy and record from disk.
    pub async fn purge(&self) -> Result<()> {
        self.copy.close().await;
        for path in [
            copy_path(&self.staging_dir, self.uuid),
            info_path(&self.staging_dir, self.uuid),
        ] {
            if path.exists() {
                async_fs::remove_file(&path).await?;
            }
        }
        Ok(())
    }
}
