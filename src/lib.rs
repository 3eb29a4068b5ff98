//! Single-flight, resumable downloader for segmented audio and HLS video.

pub mod config;
pub mod descriptor;
pub mod downloader;
pub mod error;
pub mod ffmpeg;
pub mod jobs;
pub mod manifest;
pub mod merge;
pub mod progress;
pub mod retry;
pub mod scheduler;
pub mod store;
pub mod utils;
