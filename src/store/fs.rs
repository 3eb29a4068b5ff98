use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Component, Path, PathBuf};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tracing::debug;

use super::SessionStore;
use crate::error::{DownloadError, Result};

/// Store rooted at an explicit directory. Keys are `/`-separated relative
/// paths below it.
#[derive(Debug, Clone)]
pub struct FsStore {
    base: PathBuf,
}

impl FsStore {
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        let mut path = self.base.clone();
        for component in Path::new(key).components() {
            if let Component::Normal(part) = component {
                path.push(part);
            }
        }
        path
    }

    async fn write_atomic(&self, key: &str, path: &Path, data: &[u8]) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .map_err(|e| DownloadError::storage(key, e))?;
        }
        let mut tmp = path.as_os_str().to_os_string();
        tmp.push(".tmp");
        let tmp = PathBuf::from(tmp);

        let mut file = File::create(&tmp)
            .await
            .map_err(|e| DownloadError::storage(key, e))?;
        file.write_all(data)
            .await
            .map_err(|e| DownloadError::storage(key, e))?;
        file.sync_data()
            .await
            .map_err(|e| DownloadError::storage(key, e))?;
        drop(file);

        fs::rename(&tmp, path)
            .await
            .map_err(|e| DownloadError::storage(key, e))
    }
}

#[async_trait]
impl SessionStore for FsStore {
    async fn read_partial(&self, key: &str) -> Result<Option<Bytes>> {
        match fs::read(self.path_for(key)).await {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(DownloadError::storage(key, e)),
        }
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        let path = self.path_for(key);
        let exists = fs::try_exists(&path)
            .await
            .map_err(|e| DownloadError::storage(key, e))?;

        // The first write creates the file atomically, so a crash never
        // leaves a torn single-chunk entry behind.
        if !exists {
            return self.write_atomic(key, &path, data).await;
        }

        let mut file = OpenOptions::new()
            .append(true)
            .open(&path)
            .await
            .map_err(|e| DownloadError::storage(key, e))?;
        file.write_all(data)
            .await
            .map_err(|e| DownloadError::storage(key, e))?;
        file.flush()
            .await
            .map_err(|e| DownloadError::storage(key, e))
    }

    async fn finalize(&self, key: &str) -> Result<Bytes> {
        Ok(self.read_partial(key).await?.unwrap_or_default())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        let result = match fs::metadata(&path).await {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&path).await,
            Ok(_) => fs::remove_file(&path).await,
            Err(e) => Err(e),
        };
        match result {
            Ok(()) => {
                debug!(path = %path.display(), "Removed session data");
                Ok(())
            }
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(DownloadError::storage(key, e)),
        }
    }

    async fn prune(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);
        let mut entries = match fs::read_dir(&path).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(DownloadError::storage(key, e)),
        };
        let occupied = entries
            .next_entry()
            .await
            .map_err(|e| DownloadError::storage(key, e))?
            .is_some();
        if occupied {
            return Ok(());
        }
        fs::remove_dir(&path)
            .await
            .map_err(|e| DownloadError::storage(key, e))
    }

    async fn write_output(&self, path: &str, data: &[u8]) -> Result<String> {
        let target = self.path_for(path);
        self.write_atomic(path, &target, data).await?;
        Ok(target.display().to_string())
    }

    fn name(&self) -> &'static str {
        "filesystem"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn append_then_read_partial() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());

        assert!(store.read_partial("a/1/track.part").await.unwrap().is_none());
        store.append("a/1/track.part", b"hello ").await.unwrap();
        store.append("a/1/track.part", b"world").await.unwrap();

        let partial = store.read_partial("a/1/track.part").await.unwrap().unwrap();
        assert_eq!(&partial[..], b"hello world");
        assert_eq!(&store.finalize("a/1/track.part").await.unwrap()[..], b"hello world");
        assert!(!dir.path().join("a/1/track.part.tmp").exists());
    }

    #[tokio::test]
    async fn remove_drops_whole_session_directory() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        store.append("tmp/42/segment_0000", b"init").await.unwrap();
        store.append("tmp/42/segment_0001", b"media").await.unwrap();

        store.remove("tmp/42").await.unwrap();
        assert!(!dir.path().join("tmp/42").exists());
        // Removing twice is fine.
        store.remove("tmp/42").await.unwrap();
    }

    #[tokio::test]
    async fn prune_keeps_occupied_directories() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        store.append("album/tmp/7/track.part", b"x").await.unwrap();

        store.prune("album/tmp").await.unwrap();
        assert!(dir.path().join("album/tmp/7/track.part").exists());

        store.remove("album/tmp/7").await.unwrap();
        store.prune("album/tmp").await.unwrap();
        assert!(!dir.path().join("album/tmp").exists());
        store.prune("album/tmp").await.unwrap();
    }

    #[tokio::test]
    async fn keys_cannot_escape_base() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        assert_eq!(store.path_for("../../etc/passwd"), dir.path().join("etc/passwd"));
    }

    #[tokio::test]
    async fn write_output_creates_folders() {
        let dir = TempDir::new().unwrap();
        let store = FsStore::new(dir.path());
        let location = store
            .write_output("Artist/Album/01. Song.flac", b"flac")
            .await
            .unwrap();
        let written = dir.path().join("Artist/Album/01. Song.flac");
        assert_eq!(location, written.display().to_string());
        assert_eq!(std::fs::read(written).unwrap(), b"flac");
    }
}
