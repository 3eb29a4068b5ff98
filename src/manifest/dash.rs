// Fragmented (DASH) manifests: one SegmentTemplate plus a SegmentTimeline.

use serde::Deserialize;
use url::Url;

use super::ManifestDescriptor;
use crate::error::{DownloadError, Result};

#[derive(Debug, Deserialize)]
struct Mpd {
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "Period", default)]
    periods: Vec<Period>,
}

#[derive(Debug, Deserialize)]
struct Period {
    #[serde(rename = "BaseURL")]
    base_url: Option<String>,
    #[serde(rename = "AdaptationSet", default)]
    adaptation_sets: Vec<AdaptationSet>,
}

#[derive(Debug, Deserialize)]
struct AdaptationSet {
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
    #[serde(rename = "Representation", default)]
    representations: Vec<Representation>,
}

#[derive(Debug, Deserialize)]
struct Representation {
    #[serde(rename = "@id")]
    id: Option<String>,
    #[serde(rename = "SegmentTemplate")]
    segment_template: Option<SegmentTemplate>,
}

#[derive(Debug, Deserialize)]
struct SegmentTemplate {
    #[serde(rename = "@initialization")]
    initialization: Option<String>,
    #[serde(rename = "@media")]
    media: Option<String>,
    #[serde(rename = "@startNumber")]
    start_number: Option<u64>,
    #[serde(rename = "SegmentTimeline")]
    timeline: Option<SegmentTimeline>,
}

#[derive(Debug, Deserialize)]
struct SegmentTimeline {
    #[serde(rename = "S", default)]
    entries: Vec<TimelineEntry>,
}

#[derive(Debug, Deserialize)]
struct TimelineEntry {
    /// Repeat count: this entry stands for `1 + r` segments. Negative values
    /// ("repeat until the period ends") count as zero.
    #[serde(rename = "@r")]
    repeat: Option<i64>,
}

/// Expand an MPD into `[initialization, media 1, media 2, ...]`.
///
/// The media count is `Σ (1 + rᵢ)` over all timeline entries, numbered from
/// the template's `startNumber` (1 when absent).
pub fn parse_mpd(xml: &str) -> Result<ManifestDescriptor> {
    let mpd: Mpd = quick_xml::de::from_str(xml)
        .map_err(|e| DownloadError::manifest(format!("MPD is not valid XML: {}", e)))?;

    let period = mpd
        .periods
        .first()
        .ok_or_else(|| DownloadError::manifest("MPD has no Period"))?;
    let adaptation = period
        .adaptation_sets
        .first()
        .ok_or_else(|| DownloadError::manifest("MPD has no AdaptationSet"))?;
    let representation = adaptation.representations.first();
    let template = representation
        .and_then(|r| r.segment_template.as_ref())
        .or(adaptation.segment_template.as_ref())
        .ok_or_else(|| DownloadError::manifest("MPD has no SegmentTemplate"))?;
    let representation_id = representation.and_then(|r| r.id.as_deref());

    let initialization = template
        .initialization
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DownloadError::manifest("SegmentTemplate has no initialization URL"))?;
    let media = template
        .media
        .as_deref()
        .filter(|s| !s.is_empty())
        .ok_or_else(|| DownloadError::manifest("SegmentTemplate has no media template"))?;
    let entries = template
        .timeline
        .as_ref()
        .map(|t| t.entries.as_slice())
        .unwrap_or_default();
    if entries.is_empty() {
        return Err(DownloadError::manifest("SegmentTimeline has no entries"));
    }

    let base = mpd
        .base_url
        .as_deref()
        .or(period.base_url.as_deref())
        .and_then(|b| Url::parse(b.trim()).ok());

    let media_count: u64 = entries
        .iter()
        .map(|s| 1 + s.repeat.unwrap_or(0).max(0) as u64)
        .sum();
    let start = template.start_number.unwrap_or(1);

    let mut urls = Vec::with_capacity(media_count as usize + 1);
    urls.push(resolve(
        base.as_ref(),
        &substitute(initialization, representation_id, None),
    ));
    for number in start..start + media_count {
        urls.push(resolve(
            base.as_ref(),
            &substitute(media, representation_id, Some(number)),
        ));
    }

    Ok(ManifestDescriptor {
        urls,
        audio_urls: Vec::new(),
    })
}

fn substitute(template: &str, representation_id: Option<&str>, number: Option<u64>) -> String {
    let mut out = template.to_string();
    if let Some(id) = representation_id {
        out = out.replace("$RepresentationID$", id);
    }
    if let Some(number) = number {
        out = out.replace("$Number$", &number.to_string());
    }
    out
}

fn resolve(base: Option<&Url>, candidate: &str) -> String {
    match (base, Url::parse(candidate)) {
        (_, Ok(absolute)) => absolute.to_string(),
        (Some(base), Err(url::ParseError::RelativeUrlWithoutBase)) => base
            .join(candidate)
            .map(|u| u.to_string())
            .unwrap_or_else(|_| candidate.to_string()),
        _ => candidate.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MPD: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<MPD xmlns="urn:mpeg:dash:schema:mpd:2011" profiles="urn:mpeg:dash:profile:isoff-main:2011" type="static" mediaPresentationDuration="PT3M1.2S" minBufferTime="PT3.993S">
  <Period id="0">
    <AdaptationSet id="0" contentType="audio" mimeType="audio/mp4" segmentAlignment="true">
      <Representation id="FLAC,192000,24" codecs="flac" bandwidth="4650931" audioSamplingRate="192000">
        <SegmentTemplate timescale="192000" initialization="https://cdn.example/t/0.mp4?token=a&amp;b=1" media="https://cdn.example/t/$Number$.mp4?token=a&amp;b=1" startNumber="1">
          <SegmentTimeline>
            <S d="786432" r="9"/>
            <S d="500000"/>
          </SegmentTimeline>
        </SegmentTemplate>
      </Representation>
    </AdaptationSet>
  </Period>
</MPD>"#;

    #[test]
    fn timeline_repeats_expand_to_segment_count() {
        let manifest = parse_mpd(MPD).unwrap();
        assert_eq!(manifest.urls.len(), 12);
        assert_eq!(manifest.urls[0], "https://cdn.example/t/0.mp4?token=a&b=1");
        assert_eq!(manifest.urls[1], "https://cdn.example/t/1.mp4?token=a&b=1");
        assert_eq!(manifest.urls[11], "https://cdn.example/t/11.mp4?token=a&b=1");
        assert!(manifest.audio_urls.is_empty());
    }

    #[test]
    fn start_number_and_representation_id_are_substituted() {
        let xml = r#"<MPD><BaseURL>https://cdn.example/audio/</BaseURL><Period><AdaptationSet>
            <SegmentTemplate initialization="$RepresentationID$/init.mp4" media="$RepresentationID$/$Number$.m4s" startNumber="5">
              <SegmentTimeline><S d="10" r="1"/><S d="10" r="-1"/></SegmentTimeline>
            </SegmentTemplate>
            <Representation id="hq"/>
        </AdaptationSet></Period></MPD>"#;
        let manifest = parse_mpd(xml).unwrap();
        assert_eq!(
            manifest.urls,
            vec![
                "https://cdn.example/audio/hq/init.mp4",
                "https://cdn.example/audio/hq/5.m4s",
                "https://cdn.example/audio/hq/6.m4s",
                "https://cdn.example/audio/hq/7.m4s",
            ]
        );
    }

    #[test]
    fn missing_pieces_are_manifest_errors() {
        let no_init = r#"<MPD><Period><AdaptationSet><Representation id="a">
            <SegmentTemplate media="$Number$.mp4"><SegmentTimeline><S d="1"/></SegmentTimeline></SegmentTemplate>
        </Representation></AdaptationSet></Period></MPD>"#;
        let no_timeline = r#"<MPD><Period><AdaptationSet><Representation id="a">
            <SegmentTemplate initialization="0.mp4" media="$Number$.mp4"/>
        </Representation></AdaptationSet></Period></MPD>"#;
        let no_template = r#"<MPD><Period><AdaptationSet><Representation id="a"/></AdaptationSet></Period></MPD>"#;

        for xml in [no_init, no_timeline, no_template, "not xml at all <"] {
            let err = parse_mpd(xml).unwrap_err();
            assert!(matches!(err, DownloadError::Manifest { .. }), "{xml}: {err}");
        }
    }
}
