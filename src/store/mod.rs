//! Partial-download state; the transfer engine only sees [`SessionStore`].

mod fs;
mod memory;
mod session;

pub use fs::FsStore;
pub use memory::MemoryStore;
pub use session::{RootPicker, SessionRootStore};

use async_trait::async_trait;
use bytes::Bytes;

use crate::error::Result;

#[async_trait]
pub trait SessionStore: Send + Sync {
    /// Bytes stored so far under `key`, or `None` when nothing usable exists.
    async fn read_partial(&self, key: &str) -> Result<Option<Bytes>>;

    /// Append a whole chunk. Either the chunk is stored entirely or the
    /// stored length is unchanged.
    async fn append(&self, key: &str, data: &[u8]) -> Result<()>;

    /// Everything stored under `key`.
    async fn finalize(&self, key: &str) -> Result<Bytes>;

    /// Drop `key`, or every key below it when it names a session directory.
    async fn remove(&self, key: &str) -> Result<()>;

    /// Save a finished file at a relative output path and return where it
    /// ended up.
    async fn write_output(&self, path: &str, data: &[u8]) -> Result<String>;

    /// Drop `key` only when it is a directory with nothing left in it.
    async fn prune(&self, _key: &str) -> Result<()> {
        Ok(())
    }

    /// Called by the scheduler when its queue drains.
    async fn end_run(&self) {}

    /// Whether anything appended here can be picked up by a later attempt.
    fn keeps_partials(&self) -> bool {
        true
    }

    fn name(&self) -> &'static str;
}

/// Scopes store keys to one logical download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionHandle {
    scope: String,
    id: String,
}

impl SessionHandle {
    /// `scope` is the directory the session lives under (e.g. an album's
    /// temporary folder); `id` is the download's own id (e.g. a track id).
    pub fn new(scope: impl Into<String>, id: impl ToString) -> Self {
        Self {
            scope: scope.into(),
            id: id.to_string(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn dir(&self) -> String {
        join_key(&self.scope, &self.id)
    }

    pub fn segment_key(&self, prefix: &str, index: usize) -> String {
        join_key(&self.dir(), &format!("{}segment_{:04}", prefix, index))
    }

    pub fn resource_key(&self, name: &str) -> String {
        join_key(&self.dir(), &format!("{}.part", name))
    }
}

pub fn join_key(left: &str, right: &str) -> String {
    match (left.trim_matches('/'), right.trim_matches('/')) {
        ("", r) => r.to_string(),
        (l, "") => l.to_string(),
        (l, r) => format!("{}/{}", l, r),
    }
}
