use bytes::Bytes;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::config::EngineConfig;
use crate::descriptor::{AlbumDescriptor, AlbumRef, Descriptor, TrackDescriptor, VideoDescriptor};
use crate::downloader::Downloader;
use crate::error::{DownloadError, Result};
use crate::manifest::{parse_mpd, resolve_hls, ManifestDescriptor};
use crate::merge::{MergeLayout, MergePipeline, MergePlan, TagPayload};
use crate::progress::ProgressReporter;
use crate::scheduler::{TaskContext, TaskKind, TaskSpec};
use crate::store::{join_key, SessionHandle, SessionStore};
use crate::utils::{format_path_parts, format_track_filename, get_filename_from_url, join_path, sanitize_filename};

const TMP_DIR: &str = "tmp";
const AUDIO_CONTAINER: &str = "flac";
const VIDEO_CONTAINER: &str = "mp4";

/// What a bare URL points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlKind {
    /// One complete audio file.
    Lossless,
    /// A DASH manifest of fragmented audio.
    Hires,
    /// An HLS master or media playlist.
    Video,
}

impl UrlKind {
    pub fn infer(url: &str) -> Self {
        let path = url::Url::parse(url)
            .map(|u| u.path().to_ascii_lowercase())
            .unwrap_or_else(|_| url.to_ascii_lowercase());
        if path.ends_with(".mpd") {
            Self::Hires
        } else if path.ends_with(".m3u8") {
            Self::Video
        } else {
            Self::Lossless
        }
    }
}

/// Build a minimal descriptor for a URL given on the command line or in a
/// task list. The session id is derived from the name so reruns resume.
pub fn descriptor_from_url(url: &str, name: Option<&str>, kind: UrlKind) -> Descriptor {
    let name = name
        .map(str::trim)
        .filter(|n| !n.is_empty())
        .map(str::to_string)
        .unwrap_or_else(|| {
            let file = get_filename_from_url(url).unwrap_or_else(|_| "download".to_string());
            match file.rsplit_once('.') {
                Some((stem, _)) if !stem.is_empty() => stem.to_string(),
                _ => file,
            }
        });
    let id = sanitize_filename(&name).replace(' ', "_");

    match kind {
        UrlKind::Video => Descriptor::Video(VideoDescriptor {
            id,
            title: name,
            url: url.to_string(),
            ..Default::default()
        }),
        UrlKind::Hires => Descriptor::Track(TrackDescriptor {
            id,
            title: name,
            manifest_url: Some(url.to_string()),
            ..Default::default()
        }),
        UrlKind::Lossless => Descriptor::Track(TrackDescriptor {
            id,
            title: name,
            url: Some(url.to_string()),
            ..Default::default()
        }),
    }
}

#[derive(Clone)]
pub struct Engine {
    inner: Arc<EngineInner>,
}

struct EngineInner {
    downloader: Downloader,
    pipeline: MergePipeline,
    config: EngineConfig,
}

impl Engine {
    pub fn new(downloader: Downloader, pipeline: MergePipeline, config: EngineConfig) -> Self {
        Self {
            inner: Arc::new(EngineInner {
                downloader,
                pipeline,
                config,
            }),
        }
    }

    pub fn task_for(&self, descriptor: Descriptor) -> TaskSpec {
        match descriptor {
            Descriptor::Track(track) => self.track_task(track),
            Descriptor::Album(album) => self.album_task(album),
            Descriptor::Video(video) => self.video_task(video),
        }
    }

    pub fn track_task(&self, track: TrackDescriptor) -> TaskSpec {
        let engine = self.inner.clone();
        TaskSpec::new(track.title.clone(), TaskKind::Track, move |ctx| async move {
            engine.download_track(track, ctx).await
        })
    }

    pub fn album_task(&self, album: AlbumDescriptor) -> TaskSpec {
        let engine = self.inner.clone();
        TaskSpec::new(album.album.title.clone(), TaskKind::Album, move |ctx| async move {
            engine.download_album(album, ctx).await
        })
    }

    pub fn video_task(&self, video: VideoDescriptor) -> TaskSpec {
        let engine = self.inner.clone();
        TaskSpec::new(video.title.clone(), TaskKind::Video, move |ctx| async move {
            engine.download_video(video, ctx).await
        })
    }
}

impl EngineInner {
    fn store(&self) -> &Arc<dyn SessionStore> {
        self.downloader.store()
    }

    async fn download_track(&self, track: TrackDescriptor, ctx: TaskContext) -> Result<()> {
        let folder = format_path_parts(&self.config.folder_format, track.album.as_ref(), track.artist_name());
        let tmp = join_key(&folder.join("/"), TMP_DIR);

        let location = self.save_track(&track, &folder, &tmp, &ctx.token, &ctx.reporter).await?;
        ctx.reporter.complete_unit();
        ctx.reporter.status(format!("Saved {}", location));
        self.store().prune(&tmp).await
    }

    async fn download_album(&self, descriptor: AlbumDescriptor, ctx: TaskContext) -> Result<()> {
        let AlbumDescriptor { album, tracks } = descriptor;
        if tracks.is_empty() {
            return Err(DownloadError::manifest(format!("album {} has no tracks", album.id)));
        }
        let token = &ctx.token;
        let reporter = &ctx.reporter;
        let total = tracks.len();
        reporter.set_total_units(total as u64);

        let folder = format_path_parts(&self.config.folder_format, Some(&album), album.artist_name());
        let album_dir = folder.join("/");
        let tmp = join_key(&album_dir, TMP_DIR);
        info!(album = %album.title, tracks = total, folder = %album_dir, "Downloading album");

        self.save_cover(&album, &album_dir, token, reporter).await?;

        let mut failures = 0usize;
        for (i, mut track) in tracks.into_iter().enumerate() {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            if track.album.is_none() {
                track.album = Some(album.clone());
            }
            reporter.status(format!("({}/{}) Preparing {}", i + 1, total, track.title));

            match self.save_track(&track, &folder, &tmp, token, reporter).await {
                Ok(_) => reporter.complete_unit(),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) => {
                    failures += 1;
                    warn!(track = %track.title, error = %e, "Track failed, continuing with the album");
                    reporter.status(format!("Failed: {} - {}", track.title, e));
                    self.record_failure(&album, i, &track, &e, &tmp).await;
                }
            }
        }

        if failures == 0 {
            self.store().remove(&tmp).await?;
            info!(album = %album.title, "Album complete");
        } else {
            warn!(album = %album.title, failures, "Album finished with failures");
            reporter.status(format!("{} of {} tracks failed", failures, total));
            // Nothing in a store without partials would help the next run.
            if !self.store().keeps_partials() {
                self.store().remove(&tmp).await?;
            }
        }
        Ok(())
    }

    async fn download_video(&self, video: VideoDescriptor, ctx: TaskContext) -> Result<()> {
        let token = &ctx.token;
        let reporter = &ctx.reporter;

        let artist = sanitize_filename(video.artist_name().unwrap_or("Unknown Artist"));
        let folder = join_key(&artist, "Videos");
        let title = match video.title.trim() {
            "" => "video",
            title => title,
        };
        let tmp = join_key(&folder, TMP_DIR);
        let session = SessionHandle::new(tmp.as_str(), &video.id);

        if let Err(e) = self.transfer_video(&video, title, &folder, &session, token, reporter).await {
            self.discard_unresumable(&session.dir()).await;
            return Err(e);
        }
        reporter.complete_unit();

        self.store().remove(&session.dir()).await?;
        self.store().prune(&tmp).await
    }

    async fn transfer_video(
        &self,
        video: &VideoDescriptor,
        title: &str,
        folder: &str,
        session: &SessionHandle,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let file_name = format!("{}.{}", sanitize_filename(title), VIDEO_CONTAINER);
        reporter.status(format!("Resolving playlists for {}", title));
        let manifest = resolve_hls(&self.downloader, &video.url, token).await?;
        if manifest.total_segments() == 0 {
            return Err(DownloadError::manifest("video has no segments"));
        }
        info!(
            video = %title,
            video_segments = manifest.urls.len(),
            audio_segments = manifest.audio_urls.len(),
            "Downloading video"
        );

        let video_parts = self
            .downloader
            .fetch_segments(session, "v_", &manifest.urls, token, reporter, "Downloading video segments")
            .await?;
        let audio_parts = if manifest.has_separate_audio() {
            self.downloader
                .fetch_segments(session, "a_", &manifest.audio_urls, token, reporter, "Downloading audio segments")
                .await?
        } else {
            Vec::new()
        };

        let plan = MergePlan {
            layout: MergeLayout::Video {
                video: video_parts,
                audio: audio_parts,
            },
            container: VIDEO_CONTAINER.to_string(),
            tags: None,
        };
        let data = self.pipeline.run(plan, &self.downloader, token, reporter).await?;

        reporter.status(format!("Saving {}", file_name));
        let location = self
            .store()
            .write_output(&join_key(folder, &file_name), &data)
            .await?;
        info!(location = %location, bytes = data.len(), "Video saved");
        Ok(())
    }

    /// Download, merge and save one track below `folder`, then drop its
    /// session data. Returns where the file was written.
    async fn save_track(
        &self,
        track: &TrackDescriptor,
        folder: &[String],
        tmp: &str,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<String> {
        let session = SessionHandle::new(tmp, &track.id);
        match self.transfer_track(track, folder, &session, token, reporter).await {
            Ok(location) => {
                self.store().remove(&session.dir()).await?;
                Ok(location)
            }
            Err(e) => {
                self.discard_unresumable(&session.dir()).await;
                Err(e)
            }
        }
    }

    async fn transfer_track(
        &self,
        track: &TrackDescriptor,
        folder: &[String],
        session: &SessionHandle,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<String> {
        let file_name = format_track_filename(&self.config.filename_format, track, AUDIO_CONTAINER);

        let layout = match self.hires_manifest(track, token).await? {
            Some(manifest) => {
                reporter.status(format!("[Hi-Res] Downloading {}", track.title));
                let parts = self
                    .downloader
                    .fetch_segments(session, "", &manifest.urls, token, reporter, "Downloading segments")
                    .await?;
                MergeLayout::FragmentedAudio(parts)
            }
            None => {
                let url = track.url.as_deref().ok_or_else(|| {
                    DownloadError::manifest(format!("track {} has no downloadable URL", track.id))
                })?;
                reporter.status(format!("[Lossless] Downloading {}", track.title));
                let data: Bytes = self
                    .downloader
                    .fetch_resource(session, &file_name, url, token, reporter, "Downloading")
                    .await?;
                MergeLayout::Single(data)
            }
        };

        let plan = MergePlan {
            layout,
            container: AUDIO_CONTAINER.to_string(),
            tags: Some(TagPayload {
                metadata: track.tags(&self.config.metadata_fields),
                cover_url: track.album.as_ref().and_then(AlbumRef::cover_url),
            }),
        };
        let data = self.pipeline.run(plan, &self.downloader, token, reporter).await?;

        let path = track_output_path(folder, track, &file_name);
        reporter.status(format!("Saving {}", file_name));
        let location = self.store().write_output(&path, &data).await?;
        info!(track = %track.title, location = %location, bytes = data.len(), "Track saved");
        Ok(location)
    }

    /// A failed download's session data is only worth keeping when a later
    /// attempt can resume from it.
    async fn discard_unresumable(&self, dir: &str) {
        if self.store().keeps_partials() {
            return;
        }
        if let Err(e) = self.store().remove(dir).await {
            warn!(dir, error = %e, "Could not drop session data");
        }
    }

    /// The Hi-Res segment list, when this track should and can use it. A
    /// manifest that cannot be fetched or parsed falls back to the lossless
    /// URL if the track has one.
    async fn hires_manifest(
        &self,
        track: &TrackDescriptor,
        token: &CancellationToken,
    ) -> Result<Option<ManifestDescriptor>> {
        let has_fallback = track.url.is_some();
        if !track.has_hires() || (has_fallback && !self.config.prefer_hires) {
            return Ok(None);
        }

        let fallback = |e: DownloadError| {
            if e.is_cancelled() || !has_fallback {
                Err(e)
            } else {
                warn!(track = %track.title, error = %e, "Hi-Res unavailable, falling back to lossless");
                Ok(None)
            }
        };

        let text = match (&track.manifest, &track.manifest_url) {
            (Some(inline), _) => inline.clone(),
            (None, Some(url)) => match self.downloader.fetch_text(url, token).await {
                Ok(text) => text,
                Err(e) => return fallback(e),
            },
            (None, None) => return Ok(None),
        };

        match parse_mpd(&text) {
            Ok(manifest) => Ok(Some(manifest)),
            Err(e) => fallback(e),
        }
    }

    /// Best effort; only cancellation escapes.
    async fn save_cover(
        &self,
        album: &AlbumRef,
        album_dir: &str,
        token: &CancellationToken,
        reporter: &ProgressReporter,
    ) -> Result<()> {
        let Some(url) = album.cover_url() else {
            return Ok(());
        };
        reporter.status("Downloading cover.jpg");
        let Some(cover) = self.downloader.fetch_optional(&url, token).await else {
            if token.is_cancelled() {
                return Err(DownloadError::Cancelled);
            }
            return Ok(());
        };
        match self.store().write_output(&join_key(album_dir, "cover.jpg"), &cover).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_cancelled() => Err(e),
            Err(e) => {
                warn!(error = %e, "Could not save album cover");
                Ok(())
            }
        }
    }

    /// Append a failure entry to the album's `tmp/error.txt`.
    async fn record_failure(
        &self,
        album: &AlbumRef,
        index: usize,
        track: &TrackDescriptor,
        error: &DownloadError,
        tmp: &str,
    ) {
        let entry = format!(
            "\n-----------------------------------------\n\
             Album: {}\n\
             Album URL: https://tidal.com/album/{}\n\
             Track: {:02}. {}\n\
             Track URL: https://tidal.com/track/{}\n\
             Error: {}\n\
             -----------------------------------------\n",
            album.title,
            album.id,
            index + 1,
            track.title,
            track.id,
            error
        );
        if let Err(e) = self.store().append(&join_key(tmp, "error.txt"), entry.as_bytes()).await {
            warn!(error = %e, "Could not record track failure");
        }
    }
}

/// `folder[/CD{n}]/file_name`; the disc folder only exists for multi-volume
/// albums.
fn track_output_path(folder: &[String], track: &TrackDescriptor, file_name: &str) -> String {
    let disc = match (track.album.as_ref(), track.volume_number) {
        (Some(album), Some(volume)) if album.is_multi_volume() => format!("CD{}", volume),
        _ => String::new(),
    };
    let mut parts: Vec<&str> = folder.iter().map(String::as_str).collect();
    parts.push(&disc);
    parts.push(file_name);
    join_path(&parts)
}
