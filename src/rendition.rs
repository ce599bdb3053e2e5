//! Rendition model and the "best stream" selection rules.
//!
//! A rendition is one concrete encoding yt-dlp reports for a source (an audio
//! only m4a, a muxed 720p mp4, a video only 1080p webm...). Selection is pure:
//! no I/O, no clocks, and ties always resolve to the first rendition scanned.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Placeholder for a codec the extractor did not report.
pub const UNKNOWN_CODEC: &str = "unknown";

/// One encoded variant of a source media item.
///
/// Codec fields are `None` when the stream is absent. yt-dlp spells that as the
/// literal string `"none"`; the parser normalizes it away before a `Rendition`
/// is built. Extractors that omit a codec entirely get [`UNKNOWN_CODEC`], so
/// the stream still counts as present.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Rendition {
    pub format_id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ext: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub acodec: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub vcodec: Option<String>,
    /// Audio bitrate in kbit/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub abr: Option<f64>,
    /// Total bitrate in kbit/s.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tbr: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub width: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub height: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fps: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filesize: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resolution: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub format_note: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Headers the upstream CDN expects when fetching `url` directly.
    #[serde(default, skip_serializing)]
    pub http_headers: BTreeMap<String, String>,
}

impl Rendition {
    pub fn has_audio(&self) -> bool {
        self.acodec.is_some()
    }

    pub fn has_video(&self) -> bool {
        self.vcodec.is_some()
    }

    pub fn is_audio_only(&self) -> bool {
        self.has_audio() && !self.has_video()
    }

    pub fn is_muxed(&self) -> bool {
        self.has_audio() && self.has_video()
    }
}

/// Result of running both selectors over the same rendition list.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct Selection<'a> {
    pub audio: Option<&'a Rendition>,
    pub video: Option<&'a Rendition>,
}

pub fn select(renditions: &[Rendition]) -> Selection<'_> {
    Selection {
        audio: best_audio(renditions),
        video: best_video(renditions),
    }
}

/// Highest-bitrate audio-only rendition. Missing bitrates rank as zero.
pub fn best_audio(renditions: &[Rendition]) -> Option<&Rendition> {
    first_max_by(
        renditions.iter().filter(|rendition| rendition.is_audio_only()),
        |rendition| rendition.abr.unwrap_or(0.0),
    )
}

/// Tallest muxed rendition, or the tallest video-carrying rendition when the
/// source has no muxed streams at all.
pub fn best_video(renditions: &[Rendition]) -> Option<&Rendition> {
    let height = |rendition: &Rendition| f64::from(rendition.height.unwrap_or(0));
    first_max_by(
        renditions.iter().filter(|rendition| rendition.is_muxed()),
        height,
    )
    .or_else(|| {
        first_max_by(
            renditions.iter().filter(|rendition| rendition.has_video()),
            height,
        )
    })
}

// Only a strictly greater key replaces the current pick, so equal keys keep the
// earliest rendition.
fn first_max_by<'a, I>(candidates: I, key: impl Fn(&Rendition) -> f64) -> Option<&'a Rendition>
where
    I: Iterator<Item = &'a Rendition>,
{
    let mut best: Option<(&'a Rendition, f64)> = None;
    for candidate in candidates {
        let score = key(candidate);
        let replace = match best {
            None => true,
            Some((_, current)) => score > current,
        };
        if replace {
            best = Some((candidate, score));
        }
    }
    best.map(|(rendition, _)| rendition)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn audio(id: &str, abr: f64) -> Rendition {
        Rendition {
            format_id: id.into(),
            ext: Some("m4a".into()),
            acodec: Some("mp4a.40.2".into()),
            abr: Some(abr),
            ..Rendition::default()
        }
    }

    fn muxed(id: &str, height: u32) -> Rendition {
        Rendition {
            format_id: id.into(),
            ext: Some("mp4".into()),
            acodec: Some("mp4a.40.2".into()),
            vcodec: Some("avc1.64001F".into()),
            height: Some(height),
            ..Rendition::default()
        }
    }

    fn video_only(id: &str, height: u32) -> Rendition {
        Rendition {
            format_id: id.into(),
            ext: Some("webm".into()),
            vcodec: Some("vp9".into()),
            height: Some(height),
            ..Rendition::default()
        }
    }

    #[test]
    fn prefers_muxed_video_over_taller_video_only() {
        let renditions = vec![
            audio("a128", 128.0),
            audio("a256", 256.0),
            muxed("av720", 720),
            video_only("v1080", 1080),
        ];
        let selection = select(&renditions);
        assert_eq!(selection.audio.unwrap().abr, Some(256.0));
        assert_eq!(selection.video.unwrap().height, Some(720));
    }

    #[test]
    fn empty_set_selects_nothing() {
        let selection = select(&[]);
        assert!(selection.audio.is_none());
        assert!(selection.video.is_none());
    }

    #[test]
    fn falls_back_to_video_only_streams() {
        let renditions = vec![audio("a", 64.0), video_only("v480", 480), video_only("v1080", 1080)];
        assert_eq!(best_video(&renditions).unwrap().format_id, "v1080");
    }

    #[test]
    fn ties_keep_first_scanned() {
        let renditions = vec![
            audio("first", 160.0),
            audio("second", 160.0),
            muxed("m1", 360),
            muxed("m2", 360),
        ];
        assert_eq!(best_audio(&renditions).unwrap().format_id, "first");
        assert_eq!(best_video(&renditions).unwrap().format_id, "m1");
    }

    #[test]
    fn best_audio_never_carries_video() {
        let renditions = vec![muxed("m", 1080), video_only("v", 2160)];
        assert!(best_audio(&renditions).is_none());

        let mut with_audio = renditions.clone();
        with_audio.push(audio("a", 48.0));
        let picked = best_audio(&with_audio).unwrap();
        assert!(!picked.has_video());
        assert_eq!(picked.format_id, "a");
    }

    #[test]
    fn missing_bitrate_and_height_rank_lowest() {
        let mut unknown_abr = audio("unknown", 0.0);
        unknown_abr.abr = None;
        let renditions = vec![unknown_abr, audio("known", 32.0)];
        assert_eq!(best_audio(&renditions).unwrap().format_id, "known");

        let mut unknown_height = muxed("unknown", 0);
        unknown_height.height = None;
        let renditions = vec![unknown_height, muxed("sd", 240)];
        assert_eq!(best_video(&renditions).unwrap().format_id, "sd");
    }

    #[test]
    fn streamless_renditions_are_ignored() {
        let storyboard = Rendition {
            format_id: "sb0".into(),
            ext: Some("mhtml".into()),
            ..Rendition::default()
        };
        let selection = select(std::slice::from_ref(&storyboard));
        assert_eq!(selection, Selection::default());
    }

    #[test]
    fn unknown_codecs_count_as_muxed() {
        let hls = |id: &str, height: u32| Rendition {
            format_id: id.into(),
            acodec: Some(UNKNOWN_CODEC.into()),
            vcodec: Some(UNKNOWN_CODEC.into()),
            height: Some(height),
            ..Rendition::default()
        };
        let renditions = vec![hls("hls-360", 360), video_only("v1080", 1080), hls("hls-720", 720)];
        let selection = select(&renditions);
        assert_eq!(selection.video.unwrap().format_id, "hls-720");
        assert!(selection.audio.is_none());
    }

    #[test]
    fn http_headers_are_not_serialized() {
        let mut rendition = muxed("m", 720);
        rendition
            .http_headers
            .insert("User-Agent".into(), "Mozilla/5.0".into());
        let value = serde_json::to_value(&rendition).unwrap();
        assert!(value.get("http_headers").is_none());
        assert_eq!(value["height"], 720);
    }
}
