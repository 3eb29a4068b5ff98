use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::retry::RetryPolicy;

/// Which textual fields get embedded into finished tracks.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct MetadataFields {
    pub title: bool,
    pub artist: bool,
    pub album_artist: bool,
    pub album: bool,
    pub track: bool,
    pub disc: bool,
    pub date: bool,
    pub copyright: bool,
    pub isrc: bool,
    pub lyrics: bool,
}

impl Default for MetadataFields {
    fn default() -> Self {
        Self {
            title: true,
            artist: true,
            album_artist: true,
            album: true,
            track: true,
            disc: true,
            date: true,
            copyright: true,
            isrc: true,
            lyrics: true,
        }
    }
}

#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(default)]
pub struct EngineConfig {
    /// Segment requests in flight per window. 0 means one per logical CPU.
    pub concurrency: usize,
    pub retry_attempts: u32,
    pub retry_delay_ms: u64,
    pub progress_interval_ms: u64,
    /// Global cap in bytes per second.
    pub rate_limit: Option<u32>,
    pub prefer_hires: bool,
    /// Keep partial downloads on disk so interrupted tasks resume.
    pub disk_cache: bool,
    pub folder_format: String,
    pub filename_format: String,
    pub metadata_fields: MetadataFields,
    pub ffmpeg_path: PathBuf,
    pub user_agent: String,
    pub connect_timeout_secs: u64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_attempts: 3,
            retry_delay_ms: 1500,
            progress_interval_ms: 1000,
            rate_limit: None,
            prefer_hires: false,
            disk_cache: true,
            folder_format: "{artist}/{album} ({year})".to_string(),
            filename_format: "{trackNumber}. {title}".to_string(),
            metadata_fields: MetadataFields::default(),
            ffmpeg_path: PathBuf::from("ffmpeg"),
            user_agent: "hifi-dl/0.1.0".to_string(),
            connect_timeout_secs: 10,
        }
    }
}

impl EngineConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {:?}", path))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file {:?}", path))
    }

    pub fn effective_concurrency(&self) -> usize {
        if self.concurrency == 0 {
            num_cpus::get()
        } else {
            self.concurrency
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            attempts: self.retry_attempts.max(1),
            delay: Duration::from_millis(self.retry_delay_ms),
        }
    }

    pub fn progress_interval(&self) -> Duration {
        Duration::from_millis(self.progress_interval_ms)
    }

    pub fn http_client(&self) -> reqwest::Client {
        reqwest::Client::builder()
            .user_agent(self.user_agent.clone())
            .connect_timeout(Duration::from_secs(self.connect_timeout_secs))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new())
    }
}
