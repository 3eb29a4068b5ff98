//! Turns manifests into ordered segment URL lists.

pub mod dash;
pub mod hls;

pub use dash::parse_mpd;
pub use hls::{parse_master, parse_media, resolve_hls, MasterSelection};

/// Ordered segment URLs produced by one manifest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ManifestDescriptor {
    /// Segments in merge order. For DASH the first entry is the
    /// initialization segment; for HLS these are the video segments.
    pub urls: Vec<String>,
    /// Separate HLS audio rendition, empty when the audio is muxed in.
    pub audio_urls: Vec<String>,
}

impl ManifestDescriptor {
    pub fn total_segments(&self) -> usize {
        self.urls.len() + self.audio_urls.len()
    }

    pub fn has_separate_audio(&self) -> bool {
        !self.audio_urls.is_empty()
    }
}
