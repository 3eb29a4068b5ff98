use clap::ValueEnum;
use hifi_dl::jobs::UrlKind;

/// Where partial downloads live.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreMode {
    /// Below --download-dir, resumable across runs
    Fs,
    /// In a folder asked for once per run
    Session,
    /// In memory only; nothing resumes
    Memory,
}

/// How to treat URLs without a descriptor.
#[derive(ValueEnum, Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobKind {
    /// From the extension: .mpd is Hi-Res, .m3u8 is video, anything else a plain file
    Auto,
    Track,
    Hires,
    Video,
}

impl JobKind {
    pub fn url_kind(self, url: &str) -> UrlKind {
        match self {
            Self::Auto => UrlKind::infer(url),
            Self::Track => UrlKind::Lossless,
            Self::Hires => UrlKind::Hires,
            Self::Video => UrlKind::Video,
        }
    }
}
