use log::{debug, trace};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::fs as async_fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;
use tokio::time::{sleep, Instant};

use crate::storage::{piece_count, piece_size_for, HashUtils};
use crate::utils::{Result, SyncError};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    pub piece_size: u64,
    pub hash_map: Vec<String>,
    pub hash: String,
    pub version: u64,
}

impl Default for FileMetadata {
    fn default() -> Self {
        Self {
            size: 0,
            piece_size: piece_size_for(0),
            hash_map: Vec::new(),
            hash: HashUtils::hash_piece_hashes(&[]),
            version: 0,
        }
    }
}

#[derive(Debug, Clone)]
struct Location {
    path: PathBuf,
    rel_path: String,
}

struct OpenHandle {
    file: async_fs::File,
    last_used: Instant,
}

/// One on-disk file with its piece hash map. The OS handle is opened lazily and
/// closed again once idle for `idle_close`.
pub struct File {
    location: RwLock<Location>,
    meta: RwLock<FileMetadata>,
    handle: Arc<Mutex<Option<OpenHandle>>>,
    idle_close: Duration,
}

impl File {
    pub fn new(path: PathBuf, rel_path: impl Into<String>, idle_close: Duration) -> Self {
        Self {
            location: RwLock::new(Location {
                path,
                rel_path: rel_path.into(),
            }),
            meta: RwLock::new(FileMetadata::default()),
            handle: Arc::new(Mutex::new(None)),
            idle_close,
        }
    }

    pub async fn open_existing(
        path: PathBuf,
        rel_path: impl Into<String>,
        idle_close: Duration,
    ) -> Result<Self> {
        let file = Self::new(path, rel_path, idle_close);
        file.update_metadata().await?;
        Ok(file)
    }

    pub fn path(&self) -> PathBuf {
        self.location
            .read()
            .map(|l| l.path.clone())
            .unwrap_or_default()
    }

    pub fn rel_path(&self) -> String {
        self.location
            .read()
            .map(|l| l.rel_path.clone())
            .unwrap_or_default()
    }

    pub fn name(&self) -> String {
        let rel = self.rel_path();
        rel.rsplit('/').next().unwrap_or_default().to_string()
    }

    pub fn metadata(&self) -> FileMetadata {
        self.meta.read().map(|m| m.clone()).unwrap_or_default()
    }

    pub fn size(&self) -> u64 {
        self.meta.read().map(|m| m.size).unwrap_or(0)
    }

    pub fn piece_size(&self) -> u64 {
        self.meta.read().map(|m| m.piece_size).unwrap_or(0)
    }

    pub fn hash(&self) -> String {
        self.metadata().hash
    }

    pub fn version(&self) -> u64 {
        self.metadata().version
    }

    pub fn set_version(&self, version: u64) {
        if let Ok(mut meta) = self.meta.write() {
            meta.version = version;
        }
    }

    /// Replaces the cached layout without touching the disk. Used when restoring
    /// a persisted record or adopting a remote layout before download.
    pub fn set_metadata(&self, metadata: FileMetadata) {
        if let Ok(mut meta) = self.meta.write() {
            *meta = metadata;
        }
    }

    pub fn exists(&self) -> bool {
        self.path().exists()
    }

    /// Points this File at a new location. The open handle is dropped.
    pub async fn set_location(&self, path: PathBuf, rel_path: impl Into<String>) {
        self.close().await;
        if let Ok(mut loc) = self.location.write() {
            loc.path = path;
            loc.rel_path = rel_path.into();
        }
    }

    /// Renames the file on disk (if present) and updates its location.
    pub async fn rename_to(&self, path: PathBuf, rel_path: impl Into<String>) -> Result<()> {
        let old = self.path();
        self.close().await;
        if old.exists() && old != path {
            if let Some(parent) = path.parent() {
                async_fs::create_dir_all(parent).await?;
            }
            async_fs::rename(&old, &path).await.map_err(|e| {
                SyncError::IoError(format!(
                    "Failed to rename {} to {}: {}",
                    old.display(),
                    path.display(),
                    e
                ))
            })?;
        }
        self.set_location(path, rel_path).await;
        Ok(())
    }

    pub async fn close(&self) {
        let mut handle = self.handle.lock().await;
        if handle.take().is_some() {
            trace!("Closed handle for {}", self.rel_path());
        }
    }

    pub async fn is_open(&self) -> bool {
        self.handle.lock().await.is_some()
    }

    async fn open_handle(&self) -> Result<()> {
        let mut guard = self.handle.lock().await;
        if guard.is_some() {
            return Ok(());
        }

        let path = self.path();
        if let Some(parent) = path.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let file = async_fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .await
            .map_err(|e| SyncError::IoError(format!("Failed to open {}: {}", path.display(), e)))?;

        *guard = Some(OpenHandle {
            file,
            last_used: Instant::now(),
        });
        drop(guard);

        spawn_idle_closer(Arc::downgrade(&self.handle), self.idle_close);
        Ok(())
    }

    /// Reads up to `len` bytes at `offset`, clipped to the file size. Reading at
    /// or past the end yields an empty buffer.
    pub async fn load_data(&self, offset: u64, len: u64) -> Result<Vec<u8>> {
        let size = self.size();
        if offset >= size || len == 0 {
            return Ok(Vec::new());
        }
        let len = len.min(size - offset) as usize;

        self.open_handle().await?;
        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| SyncError::IoError("File handle closed".to_string()))?;
        handle.last_used = Instant::now();

        let mut buffer = vec![0u8; len];
        handle.file.seek(SeekFrom::Start(offset)).await?;
        handle.file.read_exact(&mut buffer).await?;
        Ok(buffer)
    }

    /// Writes all of `bytes` at `offset`.
    pub async fn write_chunk(&self, bytes: &[u8], offset: u64) -> Result<()> {
        self.open_handle().await?;
        let mut guard = self.handle.lock().await;
        let handle = guard
            .as_mut()
            .ok_or_else(|| SyncError::IoError("File handle closed".to_string()))?;
        handle.last_used = Instant::now();

        handle.file.seek(SeekFrom::Start(offset)).await?;
        handle.file.write_all(bytes).await?;
        handle.file.flush().await?;
        Ok(())
    }

    /// Truncates or extends the file on disk to `size` bytes.
    pub async fn set_len(&self, size: u64) -> Result<()> {
        self.open_handle().await?;
        let mut guard = self.handle.lock().await;
        if let Some(handle) = guard.as_mut() {
            handle.file.set_len(size).await?;
            handle.last_used = Instant::now();
        }
        Ok(())
    }

    /// Streams the file one piece at a time and returns the per-piece hashes.
    pub async fn calculate_hash_map(&self, piece_size: u64) -> Result<Vec<String>> {
        let path = self.path();
        let mut file = async_fs::File::open(&path)
            .await
            .map_err(|_| SyncError::FileNotFound(path.display().to_string()))?;
        let size = file.metadata().await?.len();

        let mut hash_map = Vec::with_capacity(piece_count(size, piece_size));
        let mut buffer = vec![0u8; piece_size as usize];
        let mut remaining = size;
        while remaining > 0 {
            let len = remaining.min(piece_size) as usize;
            file.read_exact(&mut buffer[..len]).await?;
            hash_map.push(HashUtils::hash_data(&buffer[..len]));
            remaining -= len as u64;
        }
        Ok(hash_map)
    }

    /// Re-derives size, piece layout and hashes from disk.
    pub async fn update_metadata(&self) -> Result<()> {
        let path = self.path();
        let stat = async_fs::metadata(&path)
            .await
            .map_err(|_| SyncError::FileNotFound(path.display().to_string()))?;
        let size = stat.len();
        let piece_size = piece_size_for(size);
        let hash_map = self.calculate_hash_map(piece_size).await?;
        let hash = HashUtils::hash_piece_hashes(&hash_map);

        debug!(
            "Metadata for {}: {} bytes, {} pieces, hash {}",
            self.rel_path(),
            size,
            hash_map.len(),
            &hash[..8]
        );

        if let Ok(mut meta) = self.meta.write() {
            meta.size = size;
            meta.piece_size = piece_size;
            meta.hash_map = hash_map;
            meta.hash = hash;
        }
        Ok(())
    }

    /// Copies the full content of `other` over this file's location on disk.
    pub async fn copy_from(&self, other: &File) -> Result<()> {
        self.close().await;
        let target = self.path();
        if let Some(parent) = target.parent() {
            async_fs::create_dir_all(parent).await?;
        }
        let tmp = temp_sibling(&target);
        async_fs::copy(other.path(), &tmp).await?;
        async_fs::rename(&tmp, &target).await?;
        self.update_metadata().await
    }
}

fn temp_sibling(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".part");
    path.with_file_name(name)
}

fn spawn_idle_closer(handle: Weak<Mutex<Option<OpenHandle>>>, idle: Duration) {
    tokio::spawn(async move {
        loop {
            sleep(idle).await;
            let Some(handle) = handle.upgrade() else {
                break;
            };
            let mut guard = handle.lock().await;
            match guard.as_ref() {
                None => break,
                Some(open) if open.last_used.elapsed() >= idle => {
                    *guard = None;
                    break;
                }
                Some(_) => {}
            }
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::MIN_PIECE_SIZE;

    fn pattern(len: usize) -> Vec<u8> {
        (0..len).map(|i| (i % 251) as u8).collect()
    }

    #[tokio::test]
    async fn test_metadata_matches_content() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data.bin");
        let content = pattern(MIN_PIECE_SIZE as usize * 2 + 100);
        std::fs::write(&path, &content).unwrap();

        let file = File::open_existing(path, "data.bin", Duration::from_secs(5))
            .await
            .unwrap();
        let meta = file.metadata();

        assert_eq!(meta.size, content.len() as u64);
        assert_eq!(meta.hash_map.len(), 3);
        assert_eq!(meta.hash, HashUtils::hash_piece_hashes(&meta.hash_map));
        assert_eq!(
            meta.hash_map[2],
            HashUtils::hash_data(&content[MIN_PIECE_SIZE as usize * 2..])
        );
        assert_eq!(file.name(), "data.bin");
    }

    #[tokio::test]
    async fn test_load_data_clips_to_size() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("small.txt");
        std::fs::write(&path, b"hello world").unwrap();
        let file = File::open_existing(path, "small.txt", Duration::from_secs(5))
            .await
            .unwrap();

        assert_eq!(file.load_data(6, 100).await.unwrap(), b"world");
        assert!(file.load_data(11, 4).await.unwrap().is_empty());
        assert!(file.load_data(500, 4).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_write_pieces_then_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let source_path = dir.path().join("source.bin");
        let content = pattern(MIN_PIECE_SIZE as usize * 3 + 7);
        std::fs::write(&source_path, &content).unwrap();
        let source = File::open_existing(source_path, "source.bin", Duration::from_secs(5))
            .await
            .unwrap();
        let meta = source.metadata();

        let target = File::new(dir.path().join("copy.bin"), "copy.bin", Duration::from_secs(5));
        target.set_len(meta.size).await.unwrap();
        // Out-of-order piece delivery.
        for index in (0..meta.hash_map.len()).rev() {
            let offset = index as u64 * meta.piece_size;
            let bytes = source.load_data(offset, meta.piece_size).await.unwrap();
            target.write_chunk(&bytes, offset).await.unwrap();
        }
        target.update_metadata().await.unwrap();

        assert_eq!(target.hash(), source.hash());
        assert_eq!(target.load_data(0, meta.size).await.unwrap(), content);
    }

    #[tokio::test]
    async fn test_update_metadata_missing_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("nope"), "nope", Duration::from_secs(5));
        assert!(matches!(
            file.update_metadata().await,
            Err(SyncError::FileNotFound(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_idle_handle_is_closed() {
        let dir = tempfile::tempdir().unwrap();
        let file = File::new(dir.path().join("idle"), "idle", Duration::from_secs(5));
        file.write_chunk(b"abc", 0).await.unwrap();
        assert!(file.is_open().await);

        sleep(Duration::from_secs(11)).await;
        assert!(!file.is_open().await);
    }
}
