//! Deterministic stream selection.
//!
//! Video streams are ranked by quality id first and codec second, both looked
//! up in ordered priority tables (best first). Audio streams are ranked by
//! their quality id only, and the dedicated lossless / spatial tracks take
//! over only when they are ranked strictly better than the standard track.

use std::fmt;

use crate::manifest::{DashStreams, StreamDescriptor};

/// Rank given to ids and codecs missing from a priority table.
const UNRANKED: usize = usize::MAX;

/// Ordered priority tables, best first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Priorities {
    pub video_quality: Vec<u32>,
    /// Substrings matched case-insensitively against the codec string.
    pub codec: Vec<String>,
    pub audio_quality: Vec<u32>,
}

impl Default for Priorities {
    fn default() -> Self {
        Self {
            // 8K, Dolby Vision, HDR, 4K, 1080P60, 1080P+, 1080P, 720P60,
            // 720P, 480P, 360P
            video_quality: vec![127, 126, 125, 120, 116, 112, 80, 74, 64, 32, 16],
            // HEVC, AV1, AVC
            codec: vec!["hev".into(), "av01".into(), "avc".into()],
            // Hi-Res, Dolby Atmos, 192K, 132K, 64K
            audio_quality: vec![30251, 30250, 30280, 30232, 30216],
        }
    }
}

impl Priorities {
    fn quality_rank(&self, id: u32) -> usize {
        self.video_quality
            .iter()
            .position(|&q| q == id)
            .unwrap_or(UNRANKED)
    }

    fn codec_rank(&self, codec: &str) -> usize {
        let codec = codec.to_lowercase();
        self.codec
            .iter()
            .position(|c| codec.contains(&c.to_lowercase()))
            .unwrap_or(UNRANKED)
    }

    fn audio_rank(&self, id: u32) -> Option<usize> {
        self.audio_quality.iter().position(|&q| q == id)
    }
}

/// Requested video quality.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum Quality {
    #[default]
    Auto,
    Id(u32),
}

impl Quality {
    /// Map a quality name such as `1080p` or `4k` (or `auto`/`max`) to a
    /// quality, case-insensitively. Plain numeric ids are accepted too.
    pub fn from_name(name: &str) -> Option<Self> {
        let name = name.trim().to_lowercase();
        let id = match name.as_str() {
            "auto" | "max" => return Some(Quality::Auto),
            "240p" => 6,
            "360p" => 16,
            "480p" => 32,
            "720p" => 64,
            "720p60" => 74,
            "1080p" => 80,
            "1080p+" => 112,
            "1080p60" => 116,
            "4k" => 120,
            "hdr" => 125,
            "dolby_vision" => 126,
            "8k" => 127,
            other => return other.parse().ok().map(Quality::Id),
        };

        Some(Quality::Id(id))
    }
}

impl fmt::Display for Quality {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Quality::Auto => write!(f, "auto"),
            Quality::Id(id) => write!(f, "{}", video_quality_name(*id)),
        }
    }
}

pub fn video_quality_name(id: u32) -> String {
    let name = match id {
        6 => "240P",
        16 => "360P",
        32 => "480P",
        64 => "720P",
        74 => "720P60",
        80 => "1080P",
        112 => "1080P+",
        116 => "1080P60",
        120 => "4K",
        125 => "HDR",
        126 => "Dolby Vision",
        127 => "8K",
        _ => return format!("qn={}", id),
    };

    name.to_string()
}

pub fn audio_quality_name(id: u32) -> String {
    let name = match id {
        30216 => "64K",
        30232 => "132K",
        30280 => "192K",
        30250 => "Dolby Atmos",
        30251 => "Hi-Res",
        _ => return format!("qn={}", id),
    };

    name.to_string()
}

/// Pick the best video stream, honouring a requested quality when any stream
/// offers it.
pub fn select_video<'a>(
    streams: &'a [StreamDescriptor],
    requested: Quality,
    priorities: &Priorities,
) -> Option<&'a StreamDescriptor> {
    if let Quality::Id(id) = requested {
        let matching = streams
            .iter()
            .filter(|s| s.quality_id == id)
            .min_by_key(|s| priorities.codec_rank(&s.codec));
        if matching.is_some() {
            return matching;
        }
        debug!("Quality {} not offered, selecting automatically", id);
    }

    streams.iter().min_by_key(|s| {
        (
            priorities.quality_rank(s.quality_id),
            priorities.codec_rank(&s.codec),
        )
    })
}

/// Pick the best audio stream across the standard, lossless and spatial
/// tracks.
pub fn select_audio<'a>(
    dash: &'a DashStreams,
    priorities: &Priorities,
) -> Option<&'a StreamDescriptor> {
    let mut best = None;
    let mut best_rank = UNRANKED;

    for stream in &dash.audio {
        match priorities.audio_rank(stream.quality_id) {
            Some(rank) if rank < best_rank => {
                best = Some(stream);
                best_rank = rank;
            }
            Some(_) => (),
            None if best.is_none() => best = Some(stream),
            None => (),
        }
    }

    let special = dash
        .lossless
        .iter()
        .chain(dash.spatial.as_ref().and_then(|s| s.first()));
    for stream in special {
        if let Some(rank) = priorities.audio_rank(stream.quality_id) {
            if rank < best_rank {
                best = Some(stream);
                best_rank = rank;
            }
        }
    }

    best
}

/// Distinct video quality ids offered by a manifest, best first.
pub fn available_qualities(dash: &DashStreams, priorities: &Priorities) -> Vec<u32> {
    let mut ids: Vec<u32> = Vec::new();
    for stream in &dash.video {
        if !ids.contains(&stream.quality_id) {
            ids.push(stream.quality_id);
        }
    }
    ids.sort_by_key(|&id| priorities.quality_rank(id));
    ids
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stream(quality_id: u32, codec: &str) -> StreamDescriptor {
        StreamDescriptor {
            quality_id,
            codec: codec.to_string(),
            primary_url: format!("https://cdn/{}/{}", quality_id, codec),
            backup_urls: Vec::new(),
        }
    }

    #[test]
    fn video_prefers_quality_then_codec() {
        let p = Priorities::default();
        let streams = vec![
            stream(80, "avc1.640032"),
            stream(116, "avc1.640032"),
            stream(116, "av01.0.08M.08"),
            stream(116, "hev1.1.6.L120.90"),
            stream(64, "hev1.1.6.L120.90"),
        ];

        let best = select_video(&streams, Quality::Auto, &p).unwrap();
        assert_eq!(best.quality_id, 116);
        assert!(best.codec.starts_with("hev"));
    }

    #[test]
    fn video_unknown_never_outranks_known() {
        let p = Priorities::default();
        let streams = vec![stream(999, "hev1"), stream(16, "mystery"), stream(16, "avc1")];

        let best = select_video(&streams, Quality::Auto, &p).unwrap();
        assert_eq!(best.quality_id, 16);
        assert_eq!(best.codec, "avc1");

        // Only unknowns: the first one wins
        let streams = vec![stream(999, "x"), stream(998, "y")];
        assert_eq!(select_video(&streams, Quality::Auto, &p).unwrap().quality_id, 999);

        assert!(select_video(&[], Quality::Auto, &p).is_none());
    }

    #[test]
    fn video_codec_match_is_case_insensitive() {
        let p = Priorities::default();
        let streams = vec![stream(80, "AVC1.640032"), stream(80, "HEV1.1.6")];
        assert_eq!(
            select_video(&streams, Quality::Auto, &p).unwrap().codec,
            "HEV1.1.6"
        );
    }

    #[test]
    fn video_requested_quality() {
        let p = Priorities::default();
        let streams = vec![
            stream(120, "hev1"),
            stream(80, "avc1"),
            stream(80, "av01"),
        ];

        let best = select_video(&streams, Quality::Id(80), &p).unwrap();
        assert_eq!(best.quality_id, 80);
        assert_eq!(best.codec, "av01");

        // Not offered: falls back to automatic selection
        let best = select_video(&streams, Quality::Id(64), &p).unwrap();
        assert_eq!(best.quality_id, 120);
    }

    #[test]
    fn audio_picks_best_ranked() {
        let p = Priorities::default();
        let dash = DashStreams {
            audio: vec![stream(30216, "mp4a"), stream(30280, "mp4a"), stream(30232, "mp4a")],
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().quality_id, 30280);
    }

    #[test]
    fn audio_unknown_is_only_a_fallback() {
        let p = Priorities::default();
        let dash = DashStreams {
            audio: vec![stream(1, "first"), stream(2, "second")],
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "first");

        let dash = DashStreams {
            audio: vec![stream(1, "first"), stream(30216, "mp4a")],
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().quality_id, 30216);

        assert!(select_audio(&DashStreams::default(), &p).is_none());
    }

    #[test]
    fn audio_lossless_and_spatial_need_strictly_better_rank() {
        let p = Priorities::default();
        let dash = DashStreams {
            audio: vec![stream(30280, "mp4a")],
            lossless: Some(stream(30251, "flac")),
            spatial: Some(vec![stream(30250, "ec-3")]),
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "flac");

        let dash = DashStreams {
            audio: vec![stream(30280, "mp4a")],
            spatial: Some(vec![stream(30250, "ec-3"), stream(30251, "ignored")]),
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "ec-3");

        // A tie keeps the standard track
        let dash = DashStreams {
            audio: vec![stream(30250, "mp4a")],
            spatial: Some(vec![stream(30250, "ec-3")]),
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "mp4a");

        // Unknown special tracks never displace anything
        let dash = DashStreams {
            audio: vec![stream(7, "odd")],
            lossless: Some(stream(8, "flac")),
            spatial: Some(Vec::new()),
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "odd");
    }

    #[test]
    fn audio_special_tracks_alone() {
        let p = Priorities::default();
        let dash = DashStreams {
            lossless: Some(stream(30251, "flac")),
            ..Default::default()
        };
        assert_eq!(select_audio(&dash, &p).unwrap().codec, "flac");
    }

    #[test]
    fn available_qualities_sorted_best_first() {
        let p = Priorities::default();
        let dash = DashStreams {
            video: vec![
                stream(32, "avc1"),
                stream(999, "avc1"),
                stream(80, "avc1"),
                stream(80, "hev1"),
                stream(120, "hev1"),
            ],
            ..Default::default()
        };
        assert_eq!(available_qualities(&dash, &p), vec![120, 80, 32, 999]);
    }

    #[test]
    fn quality_names() {
        assert_eq!(Quality::from_name("1080P"), Some(Quality::Id(80)));
        assert_eq!(Quality::from_name("dolby_vision"), Some(Quality::Id(126)));
        assert_eq!(Quality::from_name("max"), Some(Quality::Auto));
        assert_eq!(Quality::from_name("112"), Some(Quality::Id(112)));
        assert_eq!(Quality::from_name("potato"), None);

        assert_eq!(video_quality_name(120), "4K");
        assert_eq!(audio_quality_name(30251), "Hi-Res");
        assert_eq!(audio_quality_name(1), "qn=1");
    }
}
