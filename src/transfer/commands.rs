use log::{info, warn};
use std::path::Path;
use std::sync::Arc;
use uuid::Uuid;

use crate::storage::FileLibrary;
use crate::transfer::FileTransfer;
use crate::utils::{Result, SyncError};

/// User-facing mutations of the library. Each one takes the library lock on
/// every connected node first, so two nodes never mutate concurrently.
pub struct ExternalCommands {
    transfer: Arc<FileTransfer>,
    library: Arc<FileLibrary>,
}

impl ExternalCommands {
    pub fn new(transfer: Arc<FileTransfer>) -> Self {
        let library = transfer.library().clone();
        Self { transfer, library }
    }

    /// Locks the local library, then checks that no peer holds its own lock.
    /// The local lock is released again if the check fails.
    pub async fn lock(&self) -> Result<()> {
        if !self.library.try_lock() {
            return Err(SyncError::LibraryLocked("local".to_string()));
        }
        if let Err(e) = self.transfer.ask_library_locked().await {
            warn!("Library lock refused: {}", e);
            self.library.unlock();
            return Err(e);
        }
        info!("Library locked");
        Ok(())
    }

    pub fn unlock(&self) {
        self.library.unlock();
        info!("Library unlocked");
    }

    pub async fn add(&self, path: &Path) -> Result<Vec<Uuid>> {
        self.lock().await?;
        let result = self.library.add(path, self.transfer.as_ref()).await;
        self.unlock();
        result
    }

    pub async fn delete(&self, path: &Path) -> Result<Vec<Uuid>> {
        self.lock().await?;
        let result = self.library.remove(path, self.transfer.as_ref()).await;
        self.unlock();
        result
    }

    pub async fn move_path(&self, from: &Path, to: &Path) -> Result<Vec<Uuid>> {
        self.lock().await?;
        let result = self
            .library
            .move_path(from, to, self.transfer.as_ref())
            .await;
        self.unlock();
        result
    }

    pub async fn modify(&self, path: &Path) -> Result<Uuid> {
        self.lock().await?;
        let result = self.library.modify(path, self.transfer.as_ref()).await;
        self.unlock();
        result
    }
}
