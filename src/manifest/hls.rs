use m3u8_rs::{AlternativeMediaType, Playlist};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use url::Url;

use super::ManifestDescriptor;
use crate::downloader::Downloader;
use crate::error::{DownloadError, Result};

/// What a master playlist points at.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterSelection {
    pub video_url: String,
    pub audio_url: Option<String>,
}

fn parse(content: &str) -> Result<Playlist> {
    m3u8_rs::parse_playlist_res(content.as_bytes())
        .map_err(|e| DownloadError::manifest(format!("invalid M3U8 playlist: {:?}", e)))
}

fn parse_url(url: &str) -> Result<Url> {
    Url::parse(url).map_err(|e| DownloadError::manifest(format!("bad playlist URL {}: {}", url, e)))
}

fn join(base: &Url, reference: &str) -> Result<Url> {
    base.join(reference.trim())
        .map_err(|e| DownloadError::manifest(format!("cannot resolve {}: {}", reference, e)))
}

/// Pick the highest-bandwidth variant and the first audio rendition.
///
/// A playlist that already lists media segments is its own video variant.
pub fn parse_master(content: &str, url: &str) -> Result<MasterSelection> {
    let base = parse_url(url)?;
    match parse(content)? {
        Playlist::MasterPlaylist(master) => {
            let audio_url = master
                .alternatives
                .iter()
                .filter(|alt| matches!(alt.media_type, AlternativeMediaType::Audio))
                .find_map(|alt| alt.uri.as_deref())
                .map(|uri| join(&base, uri))
                .transpose()?
                .map(String::from);

            let mut best: Option<&m3u8_rs::VariantStream> = None;
            for variant in master.variants.iter().filter(|v| !v.is_i_frame) {
                if best.map_or(true, |b| variant.bandwidth > b.bandwidth) {
                    best = Some(variant);
                }
            }
            let video = best.ok_or_else(|| DownloadError::manifest("master playlist has no video variant"))?;

            Ok(MasterSelection {
                video_url: join(&base, &video.uri)?.to_string(),
                audio_url,
            })
        }
        Playlist::MediaPlaylist(media) if !media.segments.is_empty() => Ok(MasterSelection {
            video_url: base.to_string(),
            audio_url: None,
        }),
        Playlist::MediaPlaylist(_) => Err(DownloadError::manifest("playlist has no video stream")),
    }
}

/// Resolve the segment URLs of a media playlist.
///
/// Segments resolve against the directory of the `EXT-X-MAP` URI when one is
/// declared, otherwise against the playlist's own directory. The map itself
/// is not part of the result.
pub fn parse_media(content: &str, url: &str) -> Result<Vec<String>> {
    let playlist_url = parse_url(url)?;
    let media = match parse(content)? {
        Playlist::MediaPlaylist(media) => media,
        Playlist::MasterPlaylist(_) => {
            return Err(DownloadError::manifest(format!(
                "expected a media playlist at {}",
                url
            )))
        }
    };

    let base = match media.segments.iter().find_map(|s| s.map.as_ref()) {
        Some(map) => join(&join(&playlist_url, &map.uri)?, "./")?,
        None => join(&playlist_url, "./")?,
    };

    media
        .segments
        .iter()
        .map(|segment| join(&base, &segment.uri).map(String::from))
        .collect()
}

/// Fetch a master playlist and its media playlists, returning the video
/// segments and, when the master declares one, the separate audio segments.
pub async fn resolve_hls(
    downloader: &Downloader,
    master_url: &str,
    token: &CancellationToken,
) -> Result<ManifestDescriptor> {
    let master = downloader.fetch_text(master_url, token).await?;
    let selection = parse_master(&master, master_url)?;
    debug!(video = %selection.video_url, audio = ?selection.audio_url, "Resolved HLS master");

    let video_playlist = if selection.video_url == parse_url(master_url)?.as_str() {
        master
    } else {
        downloader.fetch_text(&selection.video_url, token).await?
    };
    let urls = parse_media(&video_playlist, &selection.video_url)?;
    if urls.is_empty() {
        return Err(DownloadError::manifest("video playlist has no segments"));
    }

    let audio_urls = match &selection.audio_url {
        Some(audio_url) => match downloader.fetch_text(audio_url, token).await {
            Ok(text) => parse_media(&text, audio_url).unwrap_or_else(|e| {
                warn!(error = %e, "Ignoring unreadable audio playlist");
                Vec::new()
            }),
            Err(e) if e.is_cancelled() => return Err(e),
            Err(e) => {
                warn!(error = %e, "Audio playlist unavailable, continuing without separate audio");
                Vec::new()
            }
        },
        None => Vec::new(),
    };

    Ok(ManifestDescriptor { urls, audio_urls })
}

#[cfg(test)]
mod tests {
    use super::*;

    const MASTER: &str = "#EXTM3U
#EXT-X-VERSION:4
#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"aud\",NAME=\"Main\",DEFAULT=YES,URI=\"audio/main.m3u8\"
#EXT-X-STREAM-INF:BANDWIDTH=800000,RESOLUTION=640x360,AUDIO=\"aud\"
low/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720,AUDIO=\"aud\"
mid/index.m3u8
#EXT-X-STREAM-INF:BANDWIDTH=2400000,RESOLUTION=1280x720,AUDIO=\"aud\"
mid-dup/index.m3u8
#EXT-X-I-FRAME-STREAM-INF:BANDWIDTH=9000000,URI=\"iframes.m3u8\"
";

    #[test]
    fn master_picks_highest_bandwidth_first_on_ties() {
        let selection = parse_master(MASTER, "https://video.example/v/1/master.m3u8?t=1").unwrap();
        assert_eq!(selection.video_url, "https://video.example/v/1/mid/index.m3u8");
        assert_eq!(
            selection.audio_url.as_deref(),
            Some("https://video.example/v/1/audio/main.m3u8")
        );
    }

    #[test]
    fn media_playlist_is_its_own_variant() {
        let media = "#EXTM3U\n#EXT-X-TARGETDURATION:10\n#EXTINF:10.0,\nseg0.ts\n#EXT-X-ENDLIST\n";
        let selection = parse_master(media, "https://video.example/v/1/index.m3u8").unwrap();
        assert_eq!(selection.video_url, "https://video.example/v/1/index.m3u8");
        assert!(selection.audio_url.is_none());
    }

    #[test]
    fn master_without_variants_is_an_error() {
        let empty = "#EXTM3U\n#EXT-X-MEDIA:TYPE=AUDIO,GROUP-ID=\"a\",NAME=\"A\",URI=\"a.m3u8\"\n";
        assert!(matches!(
            parse_master(empty, "https://x.example/master.m3u8"),
            Err(DownloadError::Manifest { .. })
        ));
    }

    #[test]
    fn segments_resolve_against_map_directory() {
        let media = "#EXTM3U
#EXT-X-TARGETDURATION:6
#EXT-X-MAP:URI=\"https://cdn.example/frag/init.mp4\"
#EXTINF:6.0,
seg1.m4s
#EXTINF:6.0,
seg2.m4s
#EXT-X-ENDLIST
";
        let urls = parse_media(media, "https://video.example/v/1/index.m3u8").unwrap();
        assert_eq!(
            urls,
            vec!["https://cdn.example/frag/seg1.m4s", "https://cdn.example/frag/seg2.m4s"]
        );
    }

    #[test]
    fn segments_resolve_against_playlist_directory() {
        let media = "#EXTM3U
#EXT-X-TARGETDURATION:10
#EXTINF:10.0,
seg0.ts
#EXTINF:10.0,
https://other.example/abs.ts
#EXT-X-ENDLIST
";
        let urls = parse_media(media, "https://video.example/v/1/index.m3u8?token=x").unwrap();
        assert_eq!(
            urls,
            vec!["https://video.example/v/1/seg0.ts", "https://other.example/abs.ts"]
        );
    }
}
