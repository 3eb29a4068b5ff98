use anyhow::Result;
use url::Url;

use crate::descriptor::{AlbumRef, TrackDescriptor};

pub fn get_filename_from_url(url_str: &str) -> Result<String> {
    let url = Url::parse(url_str)?;

    if let Some(segments) = url.path_segments() {
        if let Some(filename) = segments.last() {
            if !filename.is_empty() {
                return Ok(filename.to_string());
            }
        }
    }

    // Fallback if no filename found in path
    Ok(format!("download_{}", uuid::Uuid::new_v4()))
}

/// Replace characters that are illegal in file names on common platforms.
pub fn sanitize_filename(name: &str) -> String {
    name.replace(
        |c: char| matches!(c, '\\' | '/' | ':' | '*' | '?' | '"' | '<' | '>' | '|'),
        "_",
    )
}

/// Expand a folder format such as `{artist}/{album} ({year})` into
/// sanitized, non-empty path components. Separators inside the values
/// themselves never create extra folders.
pub fn format_path_parts(format: &str, album: Option<&AlbumRef>, artist: Option<&str>) -> Vec<String> {
    let album_title = album
        .map(|a| a.title.as_str())
        .filter(|t| !t.is_empty())
        .unwrap_or("Unknown Album");
    let populated = format
        .replacen("{artist}", &sanitize_filename(artist.unwrap_or("Unknown Artist")), 1)
        .replacen("{album}", &sanitize_filename(album_title), 1)
        .replacen("{year}", album.map(AlbumRef::year).unwrap_or_default(), 1);

    populated
        .split(|c: char| c == '/' || c == '\\')
        .map(|part| sanitize_filename(part.trim()))
        .filter(|part| !part.is_empty())
        .collect()
}

/// File name of a track from a format such as `{trackNumber}. {title}`,
/// with the given extension.
pub fn format_track_filename(format: &str, track: &TrackDescriptor, extension: &str) -> String {
    let number = format!("{:02}", track.track_number.unwrap_or(0));
    let stem = format
        .replacen("{trackNumber}", &number, 1)
        .replacen("{title}", &sanitize_filename(&track.title), 1)
        .replacen("{artist}", &sanitize_filename(track.artist_name().unwrap_or_default()), 1)
        .replacen(
            "{album}",
            &sanitize_filename(track.album.as_ref().map(|a| a.title.as_str()).unwrap_or_default()),
            1,
        );
    let stem = stem.trim();
    let stem = if stem.is_empty() { "download" } else { stem };
    format!("{}.{}", stem, extension)
}

/// Join relative path components with `/`, skipping empty ones.
pub fn join_path(parts: &[&str]) -> String {
    parts
        .iter()
        .filter(|p| !p.is_empty())
        .copied()
        .collect::<Vec<_>>()
        .join("/")
}
