use async_trait::async_trait;
use bytes::Bytes;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{info, warn};

use super::{FsStore, SessionStore};
use crate::error::{DownloadError, Result};

/// Asks the user where this run's downloads should go.
#[async_trait]
pub trait RootPicker: Send + Sync {
    /// `None` means the user declined.
    async fn pick_root(&self) -> Option<PathBuf>;
}

/// Store whose root directory is chosen lazily, once per run, and reused by
/// every task until the queue drains. Subdirectories are created on demand.
pub struct SessionRootStore {
    picker: Arc<dyn RootPicker>,
    root: Mutex<Option<FsStore>>,
}

impl SessionRootStore {
    pub fn new(picker: Arc<dyn RootPicker>) -> Self {
        Self {
            picker,
            root: Mutex::new(None),
        }
    }

    async fn root(&self) -> Result<FsStore> {
        let mut slot = self.root.lock().await;
        if let Some(store) = slot.as_ref() {
            return Ok(store.clone());
        }

        let Some(path) = self.picker.pick_root().await else {
            warn!("No download folder chosen");
            return Err(DownloadError::Cancelled);
        };
        tokio::fs::create_dir_all(&path)
            .await
            .map_err(|e| DownloadError::storage(path.display().to_string(), e))?;
        info!(root = %path.display(), "Using download folder for this run");

        let store = FsStore::new(path);
        *slot = Some(store.clone());
        Ok(store)
    }
}

#[async_trait]
impl SessionStore for SessionRootStore {
    async fn read_partial(&self, key: &str) -> Result<Option<Bytes>> {
        self.root().await?.read_partial(key).await
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        self.root().await?.append(key, data).await
    }

    async fn finalize(&self, key: &str) -> Result<Bytes> {
        self.root().await?.finalize(key).await
    }

    async fn remove(&self, key: &str) -> Result<()> {
        self.root().await?.remove(key).await
    }

    async fn prune(&self, key: &str) -> Result<()> {
        self.root().await?.prune(key).await
    }

    async fn write_output(&self, path: &str, data: &[u8]) -> Result<String> {
        self.root().await?.write_output(path, data).await
    }

    async fn end_run(&self) {
        *self.root.lock().await = None;
    }

    fn name(&self) -> &'static str {
        "session"
    }
}
