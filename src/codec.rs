use serde::{Deserialize, Serialize};

/// Codec identifiers supported by either back-end.
///
/// WebM restricts this to `{Vp8, Vp9, Av1, Opus, Vorbis, WebVtt}` via
/// [`crate::output::OutputFormat::WebM`]; the ISOBMFF back-end accepts the
/// full set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    Avc,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Aac,
    Opus,
    Vorbis,
    WebVtt,
}

impl Codec {
    pub fn is_video(self) -> bool {
        matches!(
            self,
            Codec::Avc | Codec::Hevc | Codec::Vp8 | Codec::Vp9 | Codec::Av1
        )
    }

    pub fn is_audio(self) -> bool {
        matches!(self, Codec::Aac | Codec::Opus | Codec::Vorbis)
    }

    pub fn is_subtitle(self) -> bool {
        matches!(self, Codec::WebVtt)
    }

    /// The four-character-code used by the `stsd` sample entry for this
    /// codec, e.g. `avc1` for AVC, `Opus` for Opus.
    pub fn sample_entry_fourcc(self) -> &'static [u8; 4] {
        match self {
            Codec::Avc => b"avc1",
            Codec::Hevc => b"hvc1",
            Codec::Vp8 => b"vp08",
            Codec::Vp9 => b"vp09",
            Codec::Av1 => b"av01",
            Codec::Aac => b"mp4a",
            Codec::Opus => b"Opus",
            Codec::Vorbis => b"vorb",
            Codec::WebVtt => b"wvtt",
        }
    }

    /// Matroska `CodecID` string, per spec.md §4.5.2's fixed map.
    pub fn matroska_codec_id(self) -> &'static str {
        match self {
            Codec::Avc => "V_MPEG4/ISO/AVC",
            Codec::Hevc => "V_MPEGH/ISO/HEVC",
            Codec::Vp8 => "V_VP8",
            Codec::Vp9 => "V_VP9",
            Codec::Av1 => "V_AV1",
            Codec::Aac => "A_AAC",
            Codec::Opus => "A_OPUS",
            Codec::Vorbis => "A_VORBIS",
            Codec::WebVtt => "D_WEBVTT/SUBTITLES",
        }
    }

    pub fn webm_allowed(self) -> bool {
        matches!(
            self,
            Codec::Vp8 | Codec::Vp9 | Codec::Av1 | Codec::Opus | Codec::Vorbis | Codec::WebVtt
        )
    }
}

/// CICP-style color description, shared verbatim between `colr` (ISOBMFF),
/// `vpcC`'s color fields, and Matroska's `Colour` element — see
/// SPEC_FULL.md §4.1–4.7 on the §9 open-question-3 resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoColorSpace {
    pub primaries: ColorPrimaries,
    pub transfer: TransferCharacteristics,
    pub matrix: MatrixCoefficients,
    pub full_range: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ColorPrimaries {
    Bt709,
    Bt470Bg,
    Smpte170M,
    Rgb,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferCharacteristics {
    Bt709,
    Smpte170M,
    Iec61966_2_1,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MatrixCoefficients {
    Bt709,
    Bt470Bg,
    Smpte170M,
    Rgb,
}

/// Decoder configuration for a video track, mirroring WebCodecs'
/// `VideoDecoderConfig` per spec.md §3.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VideoDecoderConfig {
    pub codec: Codec,
    pub coded_width: u32,
    pub coded_height: u32,
    /// Codec-private data: an AVC/HEVC decoder configuration record for
    /// those codecs, unused for VP8/VP9/AV1.
    pub description: Option<Vec<u8>>,
    pub color_space: Option<VideoColorSpace>,
}

/// Decoder configuration for an audio track.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioDecoderConfig {
    pub codec: Codec,
    pub sample_rate: u32,
    pub number_of_channels: u16,
    pub description: Option<Vec<u8>>,
}

impl AudioDecoderConfig {
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.sample_rate == 0 {
            return Err(crate::error::MuxError::invalid_argument(
                "audio sampleRate must be positive",
            ));
        }
        if self.number_of_channels == 0 {
            return Err(crate::error::MuxError::invalid_argument(
                "audio numberOfChannels must be positive",
            ));
        }
        if self.codec == Codec::Opus {
            if let Some(desc) = &self.description {
                if desc.len() < 18 {
                    return Err(crate::error::MuxError::descriptor_required(
                        "Opus description must be at least 18 bytes",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// A single `description` string: the WebVTT preamble text.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtitleConfig {
    pub description: String,
}

/// The kind of a single encoded unit, per spec.md §3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SampleKind {
    Key,
    Delta,
}

/// A pre-encoded media unit handed to the muxer by a producer.
#[derive(Debug, Clone)]
pub struct EncodedUnit {
    pub data: Vec<u8>,
    /// Microseconds.
    pub timestamp: i64,
    /// Microseconds.
    pub duration: u64,
    pub kind: SampleKind,
}

/// A single WebVTT cue handed to [`crate::isobmff::IsobmffMuxer::add_subtitle_cue`]
/// or the Matroska equivalent, per spec.md §4.4.5/§4.5.4.
#[derive(Debug, Clone)]
pub struct SubtitleCue {
    pub text: String,
    /// Microseconds.
    pub timestamp: i64,
    /// Microseconds.
    pub duration: u64,
    pub identifier: Option<String>,
    pub settings: Option<String>,
    pub notes: Option<String>,
}

impl SubtitleCue {
    pub fn end(&self) -> i64 {
        self.timestamp + self.duration as i64
    }
}
