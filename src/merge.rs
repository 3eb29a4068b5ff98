//! Reassembles downloaded buffers into one playable file.

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::downloader::Downloader;
use crate::error::{DownloadError, Result};
use crate::progress::ProgressReporter;
use crate::retry::cancellable;

/// Stream-copy media operations. Nothing here may re-encode.
#[async_trait]
pub trait Codec: Send + Sync {
    /// Join whole segment files of one stream, in order.
    async fn concat(&self, parts: &[Bytes], extension: &str) -> Result<Bytes>;

    /// Combine a video and an audio stream; the shorter one bounds the output.
    async fn mux(&self, video: Bytes, audio: Bytes) -> Result<Bytes>;

    /// Copy the audio stream of a fragmented file into a `container` file.
    async fn extract_audio(&self, fragmented: Bytes, container: &str) -> Result<Bytes>;

    /// Embed textual metadata and, when given, cover art.
    async fn tag(
        &self,
        media: Bytes,
        container: &str,
        metadata: &[(String, String)],
        cover: Option<Bytes>,
    ) -> Result<Bytes>;
}

#[derive(Debug, Clone)]
pub enum MergeLayout {
    /// Already a complete file.
    Single(Bytes),
    /// Initialization fragment followed by media fragments of one audio stream.
    FragmentedAudio(Vec<Bytes>),
    /// Video segments plus, when the stream has one, a separate audio rendition.
    Video { video: Vec<Bytes>, audio: Vec<Bytes> },
}

#[derive(Debug, Clone, Default)]
pub struct TagPayload {
    /// Field name and value, in the order they are written.
    pub metadata: Vec<(String, String)>,
    pub cover_url: Option<String>,
}

#[derive(Debug, Clone)]
pub struct MergePlan {
    pub layout: MergeLayout,
    /// Extension of the finished file, e.g. `flac` or `mp4`.
    pub container: String,
    pub tags: Option<TagPayload>,
}

#[derive(Clone)]
pub struct MergePipeline {
    codec: Arc<dyn Codec>,
}

impl MergePipeline {
    pub fn new(codec: Arc<dyn Codec>) -> Self {
        Self { codec }
    }

    /// Merge, then tag. A merge failure fails the plan; a tagging failure
    /// (cover art included) only costs the tags.
    pub async fn run(
        &self,
        plan: MergePlan,
        downloader: &Downloader,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Bytes> {
        let merged = self.merge(plan.layout, &plan.container, token, reporter).await?;

        let Some(tags) = plan.tags else {
            return Ok(merged);
        };
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }

        reporter.status("Writing metadata");
        let cover = match &tags.cover_url {
            Some(url) => match downloader.fetch_optional(url, token).await {
                Some(cover) => Some(cover),
                None if token.is_cancelled() => return Err(DownloadError::Cancelled),
                None => {
                    warn!(url, "Cover art unavailable, keeping the untagged file");
                    reporter.status("Metadata skipped");
                    return Ok(merged);
                }
            },
            None => None,
        };

        let tagged = cancellable(
            token,
            self.codec.tag(merged.clone(), &plan.container, &tags.metadata, cover),
        )
        .await;
        match tagged {
            Ok(tagged) => Ok(tagged),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(error = %e, "Tagging failed, keeping the untagged file");
                reporter.status("Metadata skipped");
                Ok(merged)
            }
        }
    }

    async fn merge(
        &self,
        layout: MergeLayout,
        container: &str,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<Bytes> {
        if token.is_cancelled() {
            return Err(DownloadError::Cancelled);
        }
        match layout {
            MergeLayout::Single(data) => Ok(data),
            MergeLayout::FragmentedAudio(parts) => {
                if parts.is_empty() {
                    return Err(DownloadError::mux("no fragments to merge"));
                }
                reporter.status(format!("Merging {} fragments", parts.len()));
                let combined = concat_bytes(&parts);
                debug!(fragments = parts.len(), bytes = combined.len(), "Fragments joined");
                cancellable(token, self.codec.extract_audio(combined, container)).await
            }
            MergeLayout::Video { video, audio } => {
                if video.is_empty() {
                    return Err(DownloadError::mux("no video segments to merge"));
                }
                reporter.status(format!("Merging {} video segments", video.len()));
                let video = cancellable(token, self.codec.concat(&video, "ts")).await?;
                if audio.is_empty() {
                    return Ok(video);
                }

                reporter.status(format!("Merging {} audio segments", audio.len()));
                let audio = cancellable(token, self.codec.concat(&audio, "ts")).await?;
                reporter.status("Muxing video and audio");
                let muxed = cancellable(token, self.codec.mux(video, audio)).await?;
                info!(bytes = muxed.len(), "Video muxed");
                Ok(muxed)
            }
        }
    }
}

/// Plain byte concatenation, in index order.
pub fn concat_bytes(parts: &[Bytes]) -> Bytes {
    let mut combined = BytesMut::with_capacity(parts.iter().map(Bytes::len).sum());
    for part in parts {
        combined.extend_from_slice(part);
    }
    combined.freeze()
}
