use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Local};
use indicatif::{HumanBytes, MultiProgress, ProgressBar, ProgressStyle};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::fs;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::{broadcast, oneshot};
use tracing::{debug, warn};

use hifi_dl::config::EngineConfig;
use hifi_dl::descriptor::Descriptor;
use hifi_dl::downloader::Downloader;
use hifi_dl::ffmpeg::FfmpegCodec;
use hifi_dl::jobs::{descriptor_from_url, Engine};
use hifi_dl::merge::MergePipeline;
use hifi_dl::progress::QueueEvent;
use hifi_dl::scheduler::{Scheduler, TaskId};
use hifi_dl::store::{FsStore, MemoryStore, RootPicker, SessionRootStore, SessionStore};

use crate::cli::{JobKind, StoreMode};

pub enum Source {
    Url(String),
    TasksFile(PathBuf),
    Descriptor(PathBuf),
}

pub struct RunOptions {
    pub download_dir: PathBuf,
    pub store: StoreMode,
    pub kind: JobKind,
}

/// One `<url>[|<name>]` line of a task list.
pub fn parse_task_line(line: &str, kind: JobKind) -> Option<Descriptor> {
    let raw = line.trim();
    if raw.is_empty() || raw.starts_with('#') {
        return None;
    }
    let mut parts = raw.splitn(2, '|');
    let url = parts.next().unwrap_or_default().trim();
    let name = parts.next().map(str::trim).filter(|s| !s.is_empty());
    if url.is_empty() {
        return None;
    }
    Some(descriptor_from_url(url, name, kind.url_kind(url)))
}

pub async fn load_descriptors(source: &Source, kind: JobKind) -> Result<Vec<Descriptor>> {
    match source {
        Source::Url(url) => Ok(parse_task_line(url, kind).into_iter().collect()),
        Source::TasksFile(path) => {
            let file = fs::File::open(path)
                .await
                .context(format!("Failed to open tasks file: {:?}", path))?;
            let mut lines = BufReader::new(file).lines();
            let mut descriptors = vec![];
            while let Some(line) = lines.next_line().await? {
                if let Some(descriptor) = parse_task_line(&line, kind) {
                    descriptors.push(descriptor);
                }
            }
            Ok(descriptors)
        }
        Source::Descriptor(path) => {
            let content = fs::read_to_string(path)
                .await
                .context(format!("Failed to read descriptor file: {:?}", path))?;
            parse_descriptors(&content).context(format!("Failed to parse descriptor file: {:?}", path))
        }
    }
}

/// A descriptor file holds one descriptor or an array of them.
pub fn parse_descriptors(content: &str) -> serde_json::Result<Vec<Descriptor>> {
    match serde_json::from_str::<Vec<Descriptor>>(content) {
        Ok(list) => Ok(list),
        Err(_) => serde_json::from_str::<Descriptor>(content).map(|d| vec![d]),
    }
}

/// Asks on stdin where this run's downloads go. End of input declines.
struct PromptRootPicker {
    default: PathBuf,
    multi: MultiProgress,
}

#[async_trait]
impl RootPicker for PromptRootPicker {
    async fn pick_root(&self) -> Option<PathBuf> {
        let default = self.default.clone();
        let multi = self.multi.clone();
        tokio::task::spawn_blocking(move || {
            multi.suspend(|| {
                print!("Download folder for this run [{}]: ", default.display());
                let _ = std::io::stdout().flush();
                let mut line = String::new();
                match std::io::stdin().read_line(&mut line) {
                    Ok(0) | Err(_) => None,
                    Ok(_) => match line.trim() {
                        "" => Some(default),
                        path => Some(PathBuf::from(path)),
                    },
                }
            })
        })
        .await
        .ok()
        .flatten()
    }
}

fn build_store(options: &RunOptions, disk_cache: bool, multi: &MultiProgress) -> Arc<dyn SessionStore> {
    match options.store {
        StoreMode::Fs if disk_cache => Arc::new(FsStore::new(&options.download_dir)),
        StoreMode::Fs | StoreMode::Memory => Arc::new(MemoryStore::new(&options.download_dir)),
        StoreMode::Session => Arc::new(SessionRootStore::new(Arc::new(PromptRootPicker {
            default: options.download_dir.clone(),
            multi: multi.clone(),
        }))),
    }
}

pub async fn run_queue(source: Source, options: RunOptions, config: EngineConfig) -> Result<()> {
    let descriptors = load_descriptors(&source, options.kind).await?;
    if descriptors.is_empty() {
        bail!("Nothing to download");
    }
    if options.store != StoreMode::Session && !options.download_dir.exists() {
        fs::create_dir_all(&options.download_dir)
            .await
            .context("Failed to create download directory")?;
    }

    let multi = MultiProgress::new();
    let store = build_store(&options, config.disk_cache, &multi);
    debug!(store = store.name(), "Session store ready");

    let downloader = Downloader::new(config.http_client(), store.clone(), &config);
    let pipeline = MergePipeline::new(Arc::new(FfmpegCodec::new(config.ffmpeg_path.clone())));
    let scheduler = Scheduler::new(store, 1024, config.progress_interval());
    let engine = Engine::new(downloader, pipeline, config);

    let (stop_tx, stop_rx) = oneshot::channel();
    let view = QueueView::new(multi);
    let renderer = tokio::spawn(view.run(scheduler.subscribe(), stop_rx));

    for descriptor in descriptors {
        scheduler.enqueue(engine.task_for(descriptor));
    }

    let interrupt = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                warn!("Interrupted, cancelling all tasks");
                scheduler.cancel_all();
            }
        })
    };

    scheduler.wait_idle().await;
    interrupt.abort();
    let _ = stop_tx.send(());
    let summary = renderer.await?;

    println!(
        "Completed: {} | Failed: {} | Cancelled: {}",
        summary.completed, summary.failed, summary.cancelled
    );
    if summary.failed > 0 {
        bail!("{} task(s) failed", summary.failed);
    }
    Ok(())
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct Summary {
    completed: usize,
    failed: usize,
    cancelled: usize,
}

/// Renders queue events as one progress bar per task.
struct QueueView {
    multi: MultiProgress,
    bars: HashMap<TaskId, (ProgressBar, String)>,
    summary: Summary,
}

impl QueueView {
    fn new(multi: MultiProgress) -> Self {
        Self {
            multi,
            bars: HashMap::new(),
            summary: Summary::default(),
        }
    }

    async fn run(mut self, mut events: broadcast::Receiver<QueueEvent>, mut stop: oneshot::Receiver<()>) -> Summary {
        loop {
            tokio::select! {
                event = events.recv() => match event {
                    Ok(event) => self.handle(event),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        debug!(skipped, "Progress view lagged behind");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                _ = &mut stop => {
                    while let Ok(event) = events.try_recv() {
                        self.handle(event);
                    }
                    break;
                }
            }
        }
        self.summary
    }

    fn handle(&mut self, event: QueueEvent) {
        match event {
            QueueEvent::Enqueued { id, name, .. } => {
                let pb = self.multi.add(ProgressBar::new(100));
                pb.set_style(
                    ProgressStyle::default_bar()
                        .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {percent:>3}% {msg}")
                        .unwrap_or_else(|_| ProgressStyle::default_bar())
                        .progress_chars("=>-"),
                );
                pb.set_message(format!("Queued      {}", name));
                self.bars.insert(id, (pb, name));
            }
            QueueEvent::Started { id, .. } => {
                if let Some((pb, name)) = self.bars.get(&id) {
                    pb.enable_steady_tick(Duration::from_millis(120));
                    pb.set_message(format!("Starting    {}", name));
                }
            }
            QueueEvent::Status { id, text } => {
                if let Some((pb, name)) = self.bars.get(&id) {
                    pb.set_message(format!("{}: {}", name, text));
                }
            }
            QueueEvent::Progress { id, progress } => {
                if let Some((pb, _)) = self.bars.get(&id) {
                    pb.set_position(progress.overall_percent.round() as u64);
                }
            }
            QueueEvent::Completed { id } => {
                self.summary.completed += 1;
                if let Some((pb, name)) = self.bars.remove(&id) {
                    pb.set_position(100);
                    pb.finish_with_message(format!("Completed   {}", name));
                }
            }
            QueueEvent::Failed { id, error } => {
                self.summary.failed += 1;
                if let Some((pb, name)) = self.bars.remove(&id) {
                    pb.abandon_with_message(format!("Failed      {}: {}", name, error));
                }
            }
            QueueEvent::Cancelled { id } => {
                self.summary.cancelled += 1;
                if let Some((pb, name)) = self.bars.remove(&id) {
                    pb.abandon_with_message(format!("Cancelled   {}", name));
                }
            }
            QueueEvent::Removed { id } => {
                if let Some((pb, name)) = self.bars.remove(&id) {
                    pb.abandon_with_message(format!("Removed     {}", name));
                }
            }
            QueueEvent::Drained => {}
        }
    }
}

/// Session data left behind by an interrupted or partly failed download.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PartialSession {
    /// Path relative to the download directory, e.g. `Artist/Album/tmp/123`.
    pub path: String,
    pub files: usize,
    pub bytes: u64,
    pub modified: Option<SystemTime>,
}

/// Every session directory below a `tmp` folder under `root`, sorted by path.
pub async fn find_partials(root: &Path) -> Result<Vec<PartialSession>> {
    let mut sessions = vec![];
    let mut pending = vec![root.to_path_buf()];

    while let Some(dir) = pending.pop() {
        let mut entries = match fs::read_dir(&dir).await {
            Ok(entries) => entries,
            Err(e) if dir == root => return Err(e).context(format!("Failed to read {:?}", root)),
            Err(_) => continue,
        };
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            if !entry.file_type().await?.is_dir() {
                continue;
            }
            if entry.file_name() == "tmp" {
                let mut sessions_in_tmp = fs::read_dir(&path).await?;
                while let Some(session) = sessions_in_tmp.next_entry().await? {
                    if session.file_type().await?.is_dir() {
                        sessions.push(summarize_session(root, &session.path()).await?);
                    }
                }
            } else {
                pending.push(path);
            }
        }
    }

    sessions.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(sessions)
}

async fn summarize_session(root: &Path, dir: &Path) -> Result<PartialSession> {
    let mut session = PartialSession {
        path: dir
            .strip_prefix(root)
            .unwrap_or(dir)
            .to_string_lossy()
            .replace('\\', "/"),
        files: 0,
        bytes: 0,
        modified: None,
    };
    let mut entries = fs::read_dir(dir).await?;
    while let Some(entry) = entries.next_entry().await? {
        let metadata = entry.metadata().await?;
        if !metadata.is_file() {
            continue;
        }
        session.files += 1;
        session.bytes += metadata.len();
        if let Ok(modified) = metadata.modified() {
            session.modified = session.modified.max(Some(modified));
        }
    }
    Ok(session)
}

pub async fn list_partials(download_dir: PathBuf) -> Result<()> {
    let sessions = find_partials(&download_dir).await?;
    let total_bytes: u64 = sessions.iter().map(|s| s.bytes).sum();

    println!("Partial sessions: {} | Stored: {}", sessions.len(), HumanBytes(total_bytes));
    println!();

    if sessions.is_empty() {
        println!("No partial downloads found in '{:?}'.", download_dir);
        return Ok(());
    }

    println!("{:<60} {:<10} {:<15} {:<20}", "Session", "Files", "Size", "Last write");
    println!("{:-<60} {:-<10} {:-<15} {:-<20}", "", "", "", "");
    for session in &sessions {
        let modified = session
            .modified
            .map(|t| DateTime::<Local>::from(t).format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<60} {:<10} {:<15} {:<20}",
            session.path,
            session.files,
            format!("{}", HumanBytes(session.bytes)),
            modified
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn task_lines_carry_optional_names() {
        let descriptor = parse_task_line("https://cdn.example/t/manifest.mpd | Night Drive", JobKind::Auto).unwrap();
        match descriptor {
            Descriptor::Track(track) => {
                assert_eq!(track.title, "Night Drive");
                assert!(track.manifest_url.is_some());
                assert!(track.url.is_none());
            }
            other => panic!("unexpected {:?}", other),
        }

        assert!(parse_task_line("   ", JobKind::Auto).is_none());
        assert!(parse_task_line("# comment", JobKind::Auto).is_none());
        assert!(matches!(
            parse_task_line("https://cdn.example/a.flac", JobKind::Video),
            Some(Descriptor::Video(_))
        ));
    }

    #[test]
    fn descriptor_file_accepts_one_or_many() {
        let one = r#"{"type": "track", "id": 1, "title": "A", "url": "https://cdn.example/a.flac"}"#;
        assert_eq!(parse_descriptors(one).unwrap().len(), 1);
        let many = format!("[{one}, {one}]");
        assert_eq!(parse_descriptors(&many).unwrap().len(), 2);
        assert!(parse_descriptors("{}").is_err());
    }

    #[tokio::test]
    async fn partial_sessions_are_found_below_tmp_folders() {
        let dir = TempDir::new().unwrap();
        let session = dir.path().join("Band/Record (2019)/tmp/42");
        std::fs::create_dir_all(&session).unwrap();
        std::fs::write(session.join("segment_0000"), b"init").unwrap();
        std::fs::write(session.join("segment_0001"), b"media").unwrap();
        std::fs::write(dir.path().join("Band/Record (2019)/tmp/error.txt"), b"failed").unwrap();
        std::fs::write(dir.path().join("Band/Record (2019)/01. Done.flac"), b"flac").unwrap();

        let sessions = find_partials(dir.path()).await.unwrap();
        assert_eq!(sessions.len(), 1);
        assert_eq!(sessions[0].path, "Band/Record (2019)/tmp/42");
        assert_eq!(sessions[0].files, 2);
        assert_eq!(sessions[0].bytes, 9);
        assert!(sessions[0].modified.is_some());
    }

    #[tokio::test]
    async fn missing_download_dir_is_an_error() {
        let dir = TempDir::new().unwrap();
        assert!(find_partials(&dir.path().join("absent")).await.is_err());
    }
}
