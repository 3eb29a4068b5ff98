mod cli;
mod commands;

use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use crate::cli::{JobKind, StoreMode};
use crate::commands::{RunOptions, Source};
use hifi_dl::config::EngineConfig;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Single URL to download (takes precedence over --descriptor and --tasks-file)
    #[arg(index = 1)]
    url: Option<String>,

    /// Path to the file containing `<url>[|<name>]` lines
    #[arg(short = 't', long = "tasks-file", default_value = "download.txt")]
    tasks_file: PathBuf,

    /// JSON file with a track, album or video descriptor (or an array of them)
    #[arg(short = 'D', long)]
    descriptor: Option<PathBuf>,

    /// Directory to save downloaded files
    #[arg(short = 'd', long = "download-dir", default_value = "downloads")]
    download_dir: PathBuf,

    /// Where partial downloads are kept
    #[arg(short = 's', long, value_enum, default_value = "fs")]
    store: StoreMode,

    /// How to treat URLs
    #[arg(short = 'k', long, value_enum, default_value = "auto")]
    kind: JobKind,

    /// Segment requests in flight at once (0 = number of logical CPUs)
    #[arg(short = 'c', long)]
    concurrency: Option<usize>,

    /// Global rate limit in bytes per second (e.g., 1048576 for 1MB/s)
    #[arg(short = 'r', long)]
    rate_limit: Option<u32>,

    /// Prefer Hi-Res manifests over the lossless file when both exist
    #[arg(long)]
    hires: bool,

    /// Keep nothing on disk between runs
    #[arg(long)]
    no_cache: bool,

    /// Path to the ffmpeg binary
    #[arg(long)]
    ffmpeg: Option<PathBuf>,

    /// JSON config file; flags override its values
    #[arg(long)]
    config: Option<PathBuf>,

    /// List partial downloads left in the download directory
    #[arg(short = 'l', long)]
    list: bool,

    /// Debug logging
    #[arg(short = 'v', long, conflicts_with = "quiet")]
    verbose: bool,

    /// Only log errors
    #[arg(short = 'q', long)]
    quiet: bool,
}

fn init_logging(verbose: bool, quiet: bool) {
    let filter = if quiet {
        EnvFilter::new("error")
    } else if verbose {
        EnvFilter::new("debug")
    } else {
        EnvFilter::from_default_env().add_directive(Level::INFO.into())
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_target(false).with_writer(std::io::stderr))
        .init();
}

fn build_config(args: &Args) -> Result<EngineConfig> {
    let mut config = match &args.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(concurrency) = args.concurrency {
        config.concurrency = concurrency;
    }
    if args.rate_limit.is_some() {
        config.rate_limit = args.rate_limit;
    }
    if args.hires {
        config.prefer_hires = true;
    }
    if args.no_cache {
        config.disk_cache = false;
    }
    if let Some(ffmpeg) = &args.ffmpeg {
        config.ffmpeg_path = ffmpeg.clone();
    }
    Ok(config)
}

fn main() -> Result<()> {
    let mut args = Args::parse();
    init_logging(args.verbose, args.quiet);

    // Output dir might not exist yet, so we resolve it relative to current dir
    if args.download_dir.is_relative() {
        if let Ok(cwd) = std::env::current_dir() {
            args.download_dir = cwd.join(&args.download_dir);
        }
    }

    let rt = tokio::runtime::Runtime::new()?;
    if args.list {
        return rt.block_on(commands::list_partials(args.download_dir));
    }

    let config = build_config(&args)?;
    let source = match (args.url, args.descriptor) {
        (Some(url), _) => Source::Url(url),
        (None, Some(path)) => Source::Descriptor(path),
        (None, None) => Source::TasksFile(args.tasks_file),
    };
    let options = RunOptions {
        download_dir: args.download_dir,
        store: args.store,
        kind: args.kind,
    };

    rt.block_on(commands::run_queue(source, options, config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags_override_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"concurrency": 2, "prefer_hires": false, "rate_limit": 100}"#).unwrap();

        let args = Args::parse_from([
            "hifi-dl",
            "--config",
            path.to_str().unwrap(),
            "-c",
            "8",
            "--hires",
            "--no-cache",
        ]);
        let config = build_config(&args).unwrap();
        assert_eq!(config.concurrency, 8);
        assert_eq!(config.rate_limit, Some(100));
        assert!(config.prefer_hires);
        assert!(!config.disk_cache);
    }

    #[test]
    fn store_and_kind_parse_from_flags() {
        let args = Args::parse_from(["hifi-dl", "https://cdn.example/v.m3u8", "--store", "session", "-k", "video"]);
        assert_eq!(args.store, StoreMode::Session);
        assert_eq!(args.kind, JobKind::Video);
        assert_eq!(args.url.as_deref(), Some("https://cdn.example/v.m3u8"));
    }
}
