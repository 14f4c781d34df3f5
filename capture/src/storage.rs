use std::io;
use std::path::{Path, PathBuf};

use camdrop_common::config::StorageConfig;
use camdrop_common::frame::FrameId;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Directory-backed frame storage, one file per frame.
///
/// The directory listing is the only index: finished frames are named by
/// [`FrameId::file_name`], and a frame only becomes visible once its temp
/// file has been renamed into place.
#[derive(Debug, Clone)]
pub struct FrameStore {
    dir: PathBuf,
    extension: String,
    jpeg_quality: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub count: usize,
    pub bytes: u64,
}

impl FrameStore {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>, jpeg_quality: u8) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            jpeg_quality,
        }
    }

    /// Create the directory if needed and sweep temp files left behind by an
    /// interrupted save.
    pub async fn open(config: &StorageConfig) -> Result<Self, StorageError> {
        let store = Self::new(&config.dir, &config.extension, config.jpeg_quality);
        store.ensure_dir().await?;
        let removed = store.remove_stale_temp_files().await?;
        if removed > 0 {
            warn!(removed, dir = %store.dir.display(), "removed stale temp files");
        }
        info!(dir = %store.dir.display(), ext = store.extension, "frame store ready");
        Ok(store)
    }

    pub async fn ensure_dir(&self) -> Result<(), StorageError> {
        tokio::fs::create_dir_all(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn extension(&self) -> &str {
        &self.extension
    }

    pub fn path_of(&self, id: &FrameId) -> PathBuf {
        self.dir.join(id.file_name(&self.extension))
    }

    pub fn jpeg_quality(&self) -> u8 {
        self.jpeg_quality
    }

    /// Persist an encoded frame captured at `captured_at` (UTC seconds).
    ///
    /// If a frame from the same second already exists the next free
    /// sequence suffix is used instead of overwriting it.
    pub async fn save(&self, captured_at: i64, encoded: &[u8]) -> Result<FrameId, StorageError> {
        let id = self.next_free_id(captured_at).await?;
        if id.seq > 0 {
            warn!(%id, captured_at, "another frame already saved this second, using sequence suffix");
        }

        let temp = self.dir.join(id.temp_file_name(&self.extension));
        let path = self.path_of(&id);
        tokio::fs::write(&temp, encoded)
            .await
            .map_err(|e| StorageError::io(&temp, e))?;
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(StorageError::io(&path, e));
        }

        debug!(%id, bytes = encoded.len(), path = %path.display(), "stored frame");
        Ok(id)
    }

    async fn next_free_id(&self, captured_at: i64) -> Result<FrameId, StorageError> {
        let mut seq = 0u32;
        loop {
            let id = FrameId::new(captured_at, seq);
            let path = self.path_of(&id);
            let taken = tokio::fs::try_exists(&path)
                .await
                .map_err(|e| StorageError::io(&path, e))?;
            if !taken {
                return Ok(id);
            }
            seq = seq
                .checked_add(1)
                .ok_or_else(|| StorageError::io(&path, io::Error::other("sequence exhausted")))?;
        }
    }

    /// Remove a stored frame.
    pub async fn delete(&self, id: &FrameId) -> Result<(), StorageError> {
        let path = self.path_of(id);
        match tokio::fs::remove_file(&path).await {
            Ok(()) => {
                debug!(%id, "deleted frame");
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(*id)),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// Raw bytes of a stored frame.
    pub async fn read(&self, id: &FrameId) -> Result<Vec<u8>, StorageError> {
        let path = self.path_of(id);
        match tokio::fs::read(&path).await {
            Ok(data) => Ok(data),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StorageError::NotFound(*id)),
            Err(e) => Err(StorageError::io(&path, e)),
        }
    }

    /// All finished frames, oldest first.
    pub async fn list(&self) -> Result<Vec<FrameId>, StorageError> {
        let mut ids: Vec<FrameId> = self
            .entries()
            .await?
            .into_iter()
            .map(|(id, _)| id)
            .collect();
        ids.sort();
        Ok(ids)
    }

    /// The most recently captured frame, if any.
    pub async fn latest(&self) -> Result<Option<FrameId>, StorageError> {
        Ok(self.list().await?.pop())
    }

    pub async fn stats(&self) -> Result<StoreStats, StorageError> {
        let entries = self.entries().await?;
        Ok(StoreStats {
            count: entries.len(),
            bytes: entries.iter().map(|(_, size)| size).sum(),
        })
    }

    async fn entries(&self) -> Result<Vec<(FrameId, u64)>, StorageError> {
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;
        let mut result = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?
        {
            let name = entry.file_name();
            let Some(id) = name
                .to_str()
                .and_then(|n| FrameId::from_file_name(n, &self.extension))
            else {
                continue;
            };
            let size = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.len(),
                Ok(_) => continue,
                // Deleted between listing and stat.
                Err(e) if e.kind() == io::ErrorKind::NotFound => continue,
                Err(e) => return Err(StorageError::io(&entry.path(), e)),
            };
            result.push((id, size));
        }
        Ok(result)
    }

    async fn remove_stale_temp_files(&self) -> Result<usize, StorageError> {
        let suffix = format!("-temp.{}", self.extension);
        let mut dir = tokio::fs::read_dir(&self.dir)
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?;
        let mut removed = 0;
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| StorageError::io(&self.dir, e))?
        {
            let is_temp = entry
                .file_name()
                .to_str()
                .is_some_and(|n| n.ends_with(&suffix));
            if is_temp {
                let path = entry.path();
                tokio::fs::remove_file(&path)
                    .await
                    .map_err(|e| StorageError::io(&path, e))?;
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("storage I/O failed on {path}: {source}")]
    Io { path: String, source: io::Error },
    #[error("frame {0} not found")]
    NotFound(FrameId),
}

impl StorageError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.display().to_string(),
            source,
        }
    }
}
