use serde::{Deserialize, Deserializer, Serialize};

use crate::config::MetadataFields;

const COVER_BASE: &str = "https://resources.tidal.com/images";

/// Catalogue ids arrive as numbers or strings; both become strings.
fn flexible_id<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum RawId {
        Number(u64),
        Text(String),
    }

    Ok(match Option::<RawId>::deserialize(deserializer)? {
        Some(RawId::Number(n)) => n.to_string(),
        Some(RawId::Text(s)) => s,
        None => String::new(),
    })
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(default)]
pub struct ArtistRef {
    pub name: String,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AlbumRef {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    pub title: String,
    /// Image id in `xxxxxxxx-xxxx-...` form.
    pub cover: Option<String>,
    pub release_date: Option<String>,
    pub number_of_tracks: Option<u32>,
    pub number_of_volumes: Option<u32>,
    pub artist: Option<ArtistRef>,
    pub artists: Vec<ArtistRef>,
}

impl AlbumRef {
    pub fn cover_url(&self) -> Option<String> {
        self.cover
            .as_deref()
            .filter(|c| !c.trim().is_empty())
            .map(|c| format!("{}/{}/1280x1280.jpg", COVER_BASE, c.replace('-', "/")))
    }

    pub fn year(&self) -> &str {
        let date = self.release_date.as_deref().unwrap_or_default();
        date.get(..4).unwrap_or(date)
    }

    pub fn artist_name(&self) -> Option<&str> {
        self.artist
            .as_ref()
            .or_else(|| self.artists.first())
            .map(|a| a.name.as_str())
            .filter(|n| !n.is_empty())
    }

    pub fn is_multi_volume(&self) -> bool {
        self.number_of_volumes.unwrap_or(1) > 1
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackDescriptor {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    pub title: String,
    pub track_number: Option<u32>,
    pub volume_number: Option<u32>,
    pub artist: Option<ArtistRef>,
    pub artists: Vec<ArtistRef>,
    pub album: Option<AlbumRef>,
    pub copyright: Option<String>,
    pub isrc: Option<String>,
    pub lyrics: Option<String>,
    /// Direct URL of the lossless file.
    pub url: Option<String>,
    /// Inline Hi-Res DASH manifest.
    pub manifest: Option<String>,
    /// Where to fetch the Hi-Res DASH manifest from, when not inline.
    pub manifest_url: Option<String>,
}

impl TrackDescriptor {
    pub fn artist_names(&self) -> String {
        self.artists
            .iter()
            .map(|a| a.name.as_str())
            .filter(|n| !n.is_empty())
            .collect::<Vec<_>>()
            .join("/")
    }

    pub fn artist_name(&self) -> Option<&str> {
        self.artist
            .as_ref()
            .or_else(|| self.artists.first())
            .map(|a| a.name.as_str())
            .filter(|n| !n.is_empty())
    }

    pub fn has_hires(&self) -> bool {
        self.manifest.is_some() || self.manifest_url.is_some()
    }

    /// Metadata to embed, limited to the selected fields, in write order.
    pub fn tags(&self, fields: &MetadataFields) -> Vec<(String, String)> {
        let album = self.album.as_ref();
        let mut tags = Vec::new();
        let mut push = |key: &str, value: Option<String>| {
            if let Some(value) = value.filter(|v| !v.trim().is_empty()) {
                tags.push((key.to_string(), value));
            }
        };

        if fields.title {
            push("title", Some(self.title.clone()));
        }
        if fields.artist {
            push("artist", Some(self.artist_names()));
        }
        if fields.album_artist {
            let album_artist = album
                .and_then(|a| a.artist.as_ref())
                .map(|a| a.name.clone())
                .filter(|n| !n.is_empty())
                .unwrap_or_else(|| self.artist_names());
            push("album_artist", Some(album_artist));
        }
        if fields.album {
            push("album", album.map(|a| a.title.clone()));
        }
        if fields.track {
            if let Some(total) = album.and_then(|a| a.number_of_tracks) {
                let number = self.track_number.map(|n| n.to_string()).unwrap_or_default();
                push("track", Some(format!("{}/{}", number, total)));
            }
        }
        if fields.disc {
            if let Some(volume) = self.volume_number {
                let value = match album.and_then(|a| a.number_of_volumes) {
                    Some(total) => format!("{}/{}", volume, total),
                    None => volume.to_string(),
                };
                push("disc", Some(value));
            }
        }
        if fields.date {
            push("date", album.and_then(|a| a.release_date.clone()));
        }
        if fields.copyright {
            push("copyright", self.copyright.clone());
        }
        if fields.isrc {
            push("isrc", self.isrc.clone());
        }
        if fields.lyrics {
            push("lyrics", self.lyrics.clone());
        }
        tags
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct AlbumDescriptor {
    #[serde(flatten)]
    pub album: AlbumRef,
    pub tracks: Vec<TrackDescriptor>,
}

#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoDescriptor {
    #[serde(deserialize_with = "flexible_id")]
    pub id: String,
    pub title: String,
    pub artist: Option<ArtistRef>,
    pub artists: Vec<ArtistRef>,
    /// HLS master playlist.
    pub url: String,
    pub quality: Option<String>,
}

impl VideoDescriptor {
    pub fn artist_name(&self) -> Option<&str> {
        self.artist
            .as_ref()
            .or_else(|| self.artists.first())
            .map(|a| a.name.as_str())
            .filter(|n| !n.is_empty())
    }
}

/// Any of the three descriptor shapes, tagged by `type` in JSON.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Descriptor {
    Track(TrackDescriptor),
    Album(AlbumDescriptor),
    Video(VideoDescriptor),
}

impl Descriptor {
    pub fn name(&self) -> &str {
        match self {
            Self::Track(t) => &t.title,
            Self::Album(a) => &a.album.title,
            Self::Video(v) => &v.title,
        }
    }
}
