use serde::{Deserialize, Serialize};

use crate::codec::{AudioDecoderConfig, Codec, SubtitleConfig, VideoDecoderConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TrackKind {
    Video,
    Audio,
    Subtitle,
}

/// Rotation or an explicit 9-element transformation matrix for a video
/// track, per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum VideoTransform {
    Rotation(u16),
    Matrix([i32; 9]),
}

impl VideoTransform {
    pub fn rotation_degrees(candidate: u16) -> crate::error::Result<Self> {
        match candidate {
            0 | 90 | 180 | 270 => Ok(VideoTransform::Rotation(candidate)),
            other => Err(crate::error::MuxError::invalid_argument(format!(
                "unsupported rotation {other}, expected one of 0/90/180/270"
            ))),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct VideoTrackMetadata {
    pub transform: Option<VideoTransform>,
    pub frame_rate: Option<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AudioTrackMetadata;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SubtitleTrackMetadata;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum TrackMetadata {
    Video(VideoTrackMetadata),
    Audio(AudioTrackMetadata),
    Subtitle(SubtitleTrackMetadata),
}

/// The decoder configuration known for a track. `None` until the first unit
/// arrives for it.
#[derive(Debug, Clone)]
pub enum TrackConfig {
    Video(VideoDecoderConfig),
    Audio(AudioDecoderConfig),
    Subtitle(SubtitleConfig),
    Unset,
}

/// A registered track, owned by the [`crate::Muxer`] front-end and shared
/// (by id) with whichever format back-end is active.
///
/// Track ids are 1-indexed and strictly increasing with insertion order
/// (spec.md §3 invariant 1).
#[derive(Debug, Clone)]
pub struct Track {
    pub id: u32,
    pub kind: TrackKind,
    pub metadata: TrackMetadata,
    pub config: TrackConfig,
    /// ISO 639-2 language code, default `b"und"` (spec.md §9 open question 4,
    /// resolved per-track in SPEC_FULL.md).
    pub language: [u8; 3],
    pub closed: bool,
}

impl Track {
    pub fn new(id: u32, kind: TrackKind, metadata: TrackMetadata) -> Self {
        Track {
            id,
            kind,
            metadata,
            config: TrackConfig::Unset,
            language: *b"und",
            closed: false,
        }
    }

    pub fn codec(&self) -> Option<Codec> {
        match &self.config {
            TrackConfig::Video(c) => Some(c.codec),
            TrackConfig::Audio(c) => Some(c.codec),
            TrackConfig::Subtitle(_) => Some(Codec::WebVtt),
            TrackConfig::Unset => None,
        }
    }
}
