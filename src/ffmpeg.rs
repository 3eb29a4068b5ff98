use async_trait::async_trait;
use bytes::Bytes;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

use crate::error::{DownloadError, Result};
use crate::merge::Codec;

/// [`Codec`] backed by an external `ffmpeg` binary. Every call stages its
/// inputs in a fresh temporary directory that is removed afterwards.
#[derive(Debug, Clone)]
pub struct FfmpegCodec {
    binary: PathBuf,
}

impl FfmpegCodec {
    pub fn new(binary: impl Into<PathBuf>) -> Self {
        Self {
            binary: binary.into(),
        }
    }

    async fn run(&self, dir: &Path, args: Vec<String>, output: &str) -> Result<Bytes> {
        debug!("FFmpeg args: {:?}", args);
        let result = Command::new(&self.binary)
            .args(&args)
            .current_dir(dir)
            .env("LC_ALL", "C")
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| DownloadError::mux(format!("failed to spawn {}: {}", self.binary.display(), e)))?;

        if !result.status.success() {
            let stderr = String::from_utf8_lossy(&result.stderr);
            let last = stderr
                .lines()
                .rev()
                .find(|l| !l.trim().is_empty())
                .unwrap_or("unknown ffmpeg error");
            return Err(DownloadError::mux(format!(
                "ffmpeg exited with code {}: {}",
                result.status.code().unwrap_or(-1),
                last
            )));
        }

        read(dir, output).await
    }
}

fn workdir() -> Result<tempfile::TempDir> {
    tempfile::Builder::new()
        .prefix("hifi-dl-")
        .tempdir()
        .map_err(|e| DownloadError::storage("ffmpeg workdir", e))
}

async fn write(dir: &Path, name: &str, data: &[u8]) -> Result<()> {
    tokio::fs::write(dir.join(name), data)
        .await
        .map_err(|e| DownloadError::storage(name, e))
}

async fn read(dir: &Path, name: &str) -> Result<Bytes> {
    tokio::fs::read(dir.join(name))
        .await
        .map(Bytes::from)
        .map_err(|e| DownloadError::storage(name, e))
}

fn base_args() -> Vec<String> {
    ["-hide_banner", "-nostdin", "-loglevel", "error", "-y"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

pub fn concat_args(list: &str, output: &str) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-f", "concat", "-safe", "0", "-i", list, "-c", "copy", output].map(String::from));
    args
}

pub fn mux_args(video: &str, audio: &str, output: &str) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i", video, "-i", audio, "-c", "copy", "-shortest", output].map(String::from));
    args
}

pub fn extract_audio_args(input: &str, output: &str) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i", input, "-c:a", "copy", output].map(String::from));
    args
}

pub fn tag_args(input: &str, cover: Option<&str>, metadata: &str, output: &str) -> Vec<String> {
    let mut args = base_args();
    args.extend(["-i", input].map(String::from));
    match cover {
        Some(cover) => {
            args.extend(["-i", cover, "-i", metadata].map(String::from));
            args.extend(["-map", "0:a", "-map", "1:v", "-map_metadata", "2"].map(String::from));
            args.extend(["-c", "copy", "-disposition:v", "attached_pic"].map(String::from));
        }
        None => {
            args.extend(["-i", metadata, "-map", "0:a", "-map_metadata", "1"].map(String::from));
            args.extend(["-c", "copy"].map(String::from));
        }
    }
    args.push(output.to_string());
    args
}

/// Concat demuxer list, one `file '<name>'` line per segment.
pub fn concat_list(names: &[String]) -> String {
    names
        .iter()
        .map(|name| format!("file '{}'\n", name.replace('\'', "'\\''")))
        .collect()
}

/// Render an FFMETADATA1 document. Blank values are left out.
pub fn ffmetadata(fields: &[(String, String)]) -> String {
    let mut doc = String::from(";FFMETADATA1\n");
    for (key, value) in fields {
        if value.trim().is_empty() {
            continue;
        }
        doc.push_str(key);
        doc.push('=');
        doc.push_str(&escape_metadata(value));
        doc.push('\n');
    }
    doc
}

fn escape_metadata(value: &str) -> String {
    let mut escaped = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ';' | '#' | '=' | '\n') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

#[async_trait]
impl Codec for FfmpegCodec {
    async fn concat(&self, parts: &[Bytes], extension: &str) -> Result<Bytes> {
        let dir = workdir()?;
        let mut names = Vec::with_capacity(parts.len());
        for (i, part) in parts.iter().enumerate() {
            let name = format!("part{:04}.{}", i, extension);
            write(dir.path(), &name, part).await?;
            names.push(name);
        }
        write(dir.path(), "concat.txt", concat_list(&names).as_bytes()).await?;

        let output = format!("output.{}", extension);
        self.run(dir.path(), concat_args("concat.txt", &output), &output)
            .await
    }

    async fn mux(&self, video: Bytes, audio: Bytes) -> Result<Bytes> {
        let dir = workdir()?;
        write(dir.path(), "video.ts", &video).await?;
        write(dir.path(), "audio.ts", &audio).await?;
        self.run(dir.path(), mux_args("video.ts", "audio.ts", "output.mp4"), "output.mp4")
            .await
    }

    async fn extract_audio(&self, fragmented: Bytes, container: &str) -> Result<Bytes> {
        let dir = workdir()?;
        write(dir.path(), "combined.m4a", &fragmented).await?;
        let output = format!("output.{}", container);
        self.run(dir.path(), extract_audio_args("combined.m4a", &output), &output)
            .await
    }

    async fn tag(
        &self,
        media: Bytes,
        container: &str,
        metadata: &[(String, String)],
        cover: Option<Bytes>,
    ) -> Result<Bytes> {
        let dir = workdir()?;
        let input = format!("input.{}", container);
        let output = format!("output.{}", container);
        write(dir.path(), &input, &media).await?;
        write(dir.path(), "metadata.txt", ffmetadata(metadata).as_bytes()).await?;
        let cover_name = match &cover {
            Some(cover) => {
                write(dir.path(), "cover.jpg", cover).await?;
                Some("cover.jpg")
            }
            None => None,
        };

        self.run(
            dir.path(),
            tag_args(&input, cover_name, "metadata.txt", &output),
            &output,
        )
        .await
    }
}
