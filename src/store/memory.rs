use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::PathBuf;

use super::{FsStore, SessionStore};
use crate::error::Result;

/// No persistence between runs: partial data lives in memory for the length
/// of a task and nothing is ever resumed. Finished files are still written
/// out, into a plain output directory.
pub struct MemoryStore {
    buffers: Mutex<HashMap<String, BytesMut>>,
    output: FsStore,
}

impl MemoryStore {
    pub fn new(output_dir: impl Into<PathBuf>) -> Self {
        Self {
            buffers: Mutex::new(HashMap::new()),
            output: FsStore::new(output_dir),
        }
    }

    pub fn buffered_keys(&self) -> usize {
        self.buffers.lock().len()
    }
}

#[async_trait]
impl SessionStore for MemoryStore {
    async fn read_partial(&self, _key: &str) -> Result<Option<Bytes>> {
        Ok(None)
    }

    async fn append(&self, key: &str, data: &[u8]) -> Result<()> {
        self.buffers
            .lock()
            .entry(key.to_string())
            .or_default()
            .extend_from_slice(data);
        Ok(())
    }

    async fn finalize(&self, key: &str) -> Result<Bytes> {
        Ok(self
            .buffers
            .lock()
            .remove(key)
            .map(BytesMut::freeze)
            .unwrap_or_default())
    }

    async fn remove(&self, key: &str) -> Result<()> {
        let prefix = format!("{}/", key.trim_end_matches('/'));
        self.buffers
            .lock()
            .retain(|k, _| k != key && !k.starts_with(&prefix));
        Ok(())
    }

    async fn write_output(&self, path: &str, data: &[u8]) -> Result<String> {
        self.output.write_output(path, data).await
    }

    fn keeps_partials(&self) -> bool {
        false
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn never_offers_partial_data() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append("1/track.part", b"abc").await.unwrap();
        assert!(store.read_partial("1/track.part").await.unwrap().is_none());
        assert_eq!(&store.finalize("1/track.part").await.unwrap()[..], b"abc");
        assert_eq!(store.buffered_keys(), 0);
        assert!(!store.keeps_partials());
    }

    #[tokio::test]
    async fn remove_clears_session_prefix_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path());
        store.append("tmp/1/segment_0000", b"a").await.unwrap();
        store.append("tmp/1/segment_0001", b"b").await.unwrap();
        store.append("tmp/10/segment_0000", b"c").await.unwrap();

        store.remove("tmp/1").await.unwrap();
        assert_eq!(store.buffered_keys(), 1);
    }
}
