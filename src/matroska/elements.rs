//! EBML IDs and element builders for the Matroska/WebM back-end, per
//! spec.md §4.5/§6.3.

use crate::codec::{Codec, VideoColorSpace};
use crate::isobmff::colorspace::cicp_mapping;
use crate::matroska::ebml::Element;
use crate::track::{Track, TrackConfig, TrackKind, VideoTrackMetadata};

pub mod ids {
    pub const EBML: u32 = 0x1A45DFA3;
    pub const EBML_VERSION: u32 = 0x4286;
    pub const EBML_READ_VERSION: u32 = 0x42F7;
    pub const EBML_MAX_ID_LENGTH: u32 = 0x42F2;
    pub const EBML_MAX_SIZE_LENGTH: u32 = 0x42F3;
    pub const DOC_TYPE: u32 = 0x4282;
    pub const DOC_TYPE_VERSION: u32 = 0x4287;
    pub const DOC_TYPE_READ_VERSION: u32 = 0x4285;

    pub const SEGMENT: u32 = 0x18538067;

    pub const SEEK_HEAD: u32 = 0x114D9B74;
    pub const SEEK: u32 = 0x4DBB;
    pub const SEEK_ID: u32 = 0x53AB;
    pub const SEEK_POSITION: u32 = 0x53AC;

    pub const INFO: u32 = 0x1549A966;
    pub const TIMESTAMP_SCALE: u32 = 0x2AD7B1;
    pub const DURATION: u32 = 0x4489;
    pub const MUXING_APP: u32 = 0x4D80;
    pub const WRITING_APP: u32 = 0x5741;

    pub const TRACKS: u32 = 0x1654AE6B;
    pub const TRACK_ENTRY: u32 = 0xAE;
    pub const TRACK_NUMBER: u32 = 0xD7;
    pub const TRACK_UID: u32 = 0x73C5;
    pub const TRACK_TYPE: u32 = 0x83;
    pub const FLAG_LACING: u32 = 0x9C;
    pub const LANGUAGE: u32 = 0x22B59C;
    pub const CODEC_ID: u32 = 0x86;
    pub const CODEC_PRIVATE: u32 = 0x63A2;
    pub const DEFAULT_DURATION: u32 = 0x23E383;
    pub const VIDEO: u32 = 0xE0;
    pub const PIXEL_WIDTH: u32 = 0xB0;
    pub const PIXEL_HEIGHT: u32 = 0xBA;
    pub const COLOUR: u32 = 0x55B0;
    pub const MATRIX_COEFFICIENTS: u32 = 0x55B1;
    pub const RANGE: u32 = 0x55B9;
    pub const TRANSFER_CHARACTERISTICS: u32 = 0x55BA;
    pub const PRIMARIES: u32 = 0x55BB;
    pub const AUDIO: u32 = 0xE1;
    pub const SAMPLING_FREQUENCY: u32 = 0xB5;
    pub const CHANNELS: u32 = 0x9F;

    pub const CLUSTER: u32 = 0x1F43B675;
    pub const TIMESTAMP: u32 = 0xE7;
    pub const SIMPLE_BLOCK: u32 = 0xA3;
    pub const BLOCK_GROUP: u32 = 0xA0;
    pub const BLOCK: u32 = 0xA1;
    pub const BLOCK_ADDITIONS: u32 = 0x75A1;
    pub const BLOCK_MORE: u32 = 0xA6;
    pub const BLOCK_ADD_ID: u32 = 0xEE;
    pub const BLOCK_ADDITIONAL: u32 = 0xA5;
    pub const BLOCK_DURATION: u32 = 0x9B;
    pub const REFERENCE_BLOCK: u32 = 0xFB;

    pub const CUES: u32 = 0x1C53BB6B;
    pub const CUE_POINT: u32 = 0xBB;
    pub const CUE_TIME: u32 = 0xB3;
    pub const CUE_TRACK_POSITIONS: u32 = 0xB7;
    pub const CUE_TRACK: u32 = 0xF7;
    pub const CUE_CLUSTER_POSITION: u32 = 0xF1;
}

/// Matroska `TrackType` codes (spec.md §4.5.2: 1/2/17 for video/audio/
/// subtitle).
pub fn track_type(kind: TrackKind) -> u64 {
    match kind {
        TrackKind::Video => 1,
        TrackKind::Audio => 2,
        TrackKind::Subtitle => 17,
    }
}

pub fn ebml_header(doc_type: &str) -> Element {
    Element::children(
        ids::EBML,
        vec![
            Element::uint(ids::EBML_VERSION, 1),
            Element::uint(ids::EBML_READ_VERSION, 1),
            Element::uint(ids::EBML_MAX_ID_LENGTH, 4),
            Element::uint(ids::EBML_MAX_SIZE_LENGTH, 8),
            Element::ascii(ids::DOC_TYPE, doc_type),
            Element::uint(ids::DOC_TYPE_VERSION, 2),
            Element::uint(ids::DOC_TYPE_READ_VERSION, 2),
        ],
    )
}

/// `Info` element. `duration_ms` is `None` in streamable mode (spec.md
/// §4.5.5); otherwise a placeholder `0.0` is written and patched later.
pub fn info(duration_ns_per_unit: u64, duration_scaled: Option<f64>) -> Element {
    let mut children = vec![
        Element::uint(ids::TIMESTAMP_SCALE, duration_ns_per_unit),
        Element::ascii(ids::MUXING_APP, "remuxer"),
        Element::ascii(ids::WRITING_APP, "remuxer"),
    ];
    if let Some(d) = duration_scaled {
        children.push(Element::float64(ids::DURATION, d));
    }
    Element::children(ids::INFO, children)
}

fn colour_element(cs: &VideoColorSpace) -> Element {
    let (primaries, transfer, matrix) = cicp_mapping(cs);
    Element::children(
        ids::COLOUR,
        vec![
            Element::uint(ids::MATRIX_COEFFICIENTS, matrix as u64),
            Element::uint(ids::RANGE, if cs.full_range { 2 } else { 1 }),
            Element::uint(ids::TRANSFER_CHARACTERISTICS, transfer as u64),
            Element::uint(ids::PRIMARIES, primaries as u64),
        ],
    )
}

/// Builds a `TrackEntry`, per spec.md §4.5.2. Requires a resolved codec
/// (callers only invoke this once the track's first unit has established
/// one).
pub fn track_entry(track: &Track, codec: Codec) -> Element {
    let mut children = vec![
        Element::uint(ids::TRACK_NUMBER, track.id as u64),
        Element::uint(ids::TRACK_UID, track.id as u64),
        Element::uint(ids::TRACK_TYPE, track_type(track.kind)),
        Element::uint(ids::FLAG_LACING, 0),
        Element::bytes(ids::LANGUAGE, track.language.to_vec()),
        Element::ascii(ids::CODEC_ID, codec.matroska_codec_id()),
    ];

    match &track.config {
        TrackConfig::Video(cfg) => {
            if let Some(desc) = &cfg.description {
                children.push(Element::bytes(ids::CODEC_PRIVATE, desc.clone()));
            }
            let frame_rate = match &track.metadata {
                crate::track::TrackMetadata::Video(VideoTrackMetadata { frame_rate, .. }) => *frame_rate,
                _ => None,
            };
            if let Some(fps) = frame_rate {
                children.push(Element::uint(ids::DEFAULT_DURATION, 1_000_000_000 / fps as u64));
            }
            let mut video_children = vec![
                Element::uint(ids::PIXEL_WIDTH, cfg.coded_width as u64),
                Element::uint(ids::PIXEL_HEIGHT, cfg.coded_height as u64),
            ];
            if let Some(cs) = &cfg.color_space {
                video_children.push(colour_element(cs));
            }
            children.push(Element::children(ids::VIDEO, video_children));
        }
        TrackConfig::Audio(cfg) => {
            if let Some(desc) = &cfg.description {
                children.push(Element::bytes(ids::CODEC_PRIVATE, desc.clone()));
            }
            children.push(Element::children(
                ids::AUDIO,
                vec![
                    Element::float32(ids::SAMPLING_FREQUENCY, cfg.sample_rate as f32),
                    Element::uint(ids::CHANNELS, cfg.number_of_channels as u64),
                ],
            ));
        }
        TrackConfig::Subtitle(cfg) => {
            children.push(Element::bytes(ids::CODEC_PRIVATE, cfg.description.clone().into_bytes()));
        }
        TrackConfig::Unset => {}
    }

    Element::children(ids::TRACK_ENTRY, children)
}

fn block_prelude(track_id: u32, time_offset: i16, flags: u8) -> Vec<u8> {
    let mut prelude = Vec::with_capacity(4);
    prelude.push(0x80 | (track_id as u8 & 0x7f));
    prelude.extend_from_slice(&time_offset.to_be_bytes());
    prelude.push(flags);
    prelude
}

/// `SimpleBlock`, used when `duration == 0` and there are no additions
/// (spec.md §4.5.3).
pub fn simple_block(track_id: u32, time_offset: i16, is_key_frame: bool, data: &[u8]) -> Element {
    let flags = if is_key_frame { 0x80 } else { 0x00 };
    let mut payload = block_prelude(track_id, time_offset, flags);
    payload.extend_from_slice(data);
    Element::bytes(ids::SIMPLE_BLOCK, payload)
}

/// `BlockGroup`, used when a duration or additions must be carried (spec.md
/// §4.5.3/§4.5.4).
pub fn block_group(
    track_id: u32,
    time_offset: i16,
    data: &[u8],
    reference_block_ms: Option<i64>,
    duration_ms: Option<u64>,
    additions: Option<String>,
) -> Element {
    let mut block_payload = block_prelude(track_id, time_offset, 0x00);
    block_payload.extend_from_slice(data);

    let mut children = vec![Element::bytes(ids::BLOCK, block_payload)];
    if let Some(ref_ms) = reference_block_ms {
        children.push(Element::sint(ids::REFERENCE_BLOCK, ref_ms));
    }
    if let Some(text) = additions {
        children.push(Element::children(
            ids::BLOCK_ADDITIONS,
            vec![Element::children(
                ids::BLOCK_MORE,
                vec![
                    Element::uint(ids::BLOCK_ADD_ID, 1),
                    Element::bytes(ids::BLOCK_ADDITIONAL, text.into_bytes()),
                ],
            )],
        ));
    }
    if let Some(dur) = duration_ms {
        children.push(Element::uint(ids::BLOCK_DURATION, dur));
    }
    Element::children(ids::BLOCK_GROUP, children)
}

pub fn cue_point(time_ms: u64, positions: &[(u32, u64)]) -> Element {
    let mut children = vec![Element::uint(ids::CUE_TIME, time_ms)];
    for (track_id, segment_relative_position) in positions {
        children.push(Element::children(
            ids::CUE_TRACK_POSITIONS,
            vec![
                Element::uint(ids::CUE_TRACK, *track_id as u64),
                Element::uint(ids::CUE_CLUSTER_POSITION, *segment_relative_position),
            ],
        ));
    }
    Element::children(ids::CUE_POINT, children)
}

/// A `SeekHead` entry pointing at a top-level Segment child. `position` is
/// filled with a placeholder (patched at finalize; spec.md §4.5.5).
pub fn seek_entry(target_id: u32, position: u64) -> Element {
    Element::children(
        ids::SEEK,
        vec![
            Element::bytes(ids::SEEK_ID, crate::matroska::ebml::id_bytes(target_id)),
            Element::uint(ids::SEEK_POSITION, position),
        ],
    )
}
