//! Box construction for `ftyp`, `moov`, and the `stbl` family, per spec.md
//! §4.4.4 and §6.2.

use crate::codec::{AudioDecoderConfig, Codec, VideoColorSpace, VideoDecoderConfig};
use crate::isobmff::boxwriter::{explicit_matrix, prim, rotation_matrix, Box};
use crate::isobmff::colorspace::cicp_mapping;
use crate::isobmff::sample_table::TrackData;
use crate::track::{Track, TrackKind, VideoTransform};

pub fn ftyp(fragmented: bool, has_avc: bool) -> Box {
    let major = if fragmented { *b"iso5" } else { *b"isom" };
    let mut compatible = vec![major];
    if has_avc {
        compatible.push(*b"avc1");
    }
    compatible.push(*b"mp41");

    let mut bytes = Vec::new();
    bytes.extend(major);
    bytes.extend(prim::u32(0));
    for brand in compatible {
        bytes.extend(brand);
    }
    Box::leaf(b"ftyp", bytes)
}

fn hdlr(kind: TrackKind) -> Box {
    let (handler, name): (&[u8; 4], &[u8]) = match kind {
        TrackKind::Video => (b"vide", b"VideoHandler\0"),
        TrackKind::Audio => (b"soun", b"SoundHandler\0"),
        TrackKind::Subtitle => (b"text", b"SubtitleHandler\0"),
    };
    let mut bytes = Vec::new();
    bytes.extend(prim::u32(0)); // pre_defined
    bytes.extend(*handler);
    bytes.extend([0u8; 12]);
    bytes.extend(name);
    Box::full_leaf(b"hdlr", 0, 0, bytes)
}

fn mdhd(timescale: u32, duration: u64, language: &[u8; 3]) -> Box {
    let mut bytes = Vec::new();
    bytes.extend(prim::u32(0)); // creation_time
    bytes.extend(prim::u32(0)); // modification_time
    bytes.extend(prim::u32(timescale));
    bytes.extend(prim::u32(duration as u32));
    let lang_code: u16 = ((language[0] as u16 & 31) << 10)
        | ((language[1] as u16 & 31) << 5)
        | (language[2] as u16 & 31);
    bytes.extend(prim::u16(lang_code));
    bytes.extend([0u8; 2]);
    Box::full_leaf(b"mdhd", 0, 0, bytes)
}

fn vmhd() -> Box {
    Box::full_leaf(b"vmhd", 0, 1, vec![0u8; 8])
}

fn smhd() -> Box {
    let bytes = vec![0u8; 4];
    Box::full_leaf(b"smhd", 0, 0, bytes)
}

fn sthd() -> Box {
    Box::full_leaf(b"sthd", 0, 0, vec![])
}

fn url_box() -> Box {
    Box::full_leaf(b"url ", 0, 1, vec![])
}

fn dref() -> Box {
    Box::full_prefixed(b"dref", 0, 0, prim::u32(1), vec![Some(url_box())])
}

fn dinf() -> Box {
    Box::container(b"dinf", vec![Some(dref())])
}

fn stsd(entry: Box) -> Box {
    Box::full_prefixed(b"stsd", 0, 0, prim::u32(1), vec![Some(entry)])
}

fn avcc(description: &[u8]) -> Box {
    Box::leaf(b"avcC", description.to_vec())
}

fn hvcc(description: &[u8]) -> Box {
    Box::leaf(b"hvcC", description.to_vec())
}

fn vpcc(description: Option<&[u8]>, color_space: Option<&VideoColorSpace>) -> Box {
    let mut bytes = Vec::new();
    bytes.extend(prim::u8(0)); // profile
    bytes.extend(prim::u8(0)); // level
    let (primaries, transfer, matrix) = color_space
        .map(cicp_mapping)
        .unwrap_or((2, 2, 2)); // 2 = unspecified when no color space is known
    bytes.push(8u8 << 4); // bitDepth(4)/chromaSubsampling(3)/videoFullRangeFlag(1)
    bytes.extend(prim::u8(primaries as u8));
    bytes.extend(prim::u8(transfer as u8));
    bytes.extend(prim::u8(matrix as u8));
    let codec_init = description.unwrap_or(&[]);
    bytes.extend(prim::u16(codec_init.len() as u16));
    bytes.extend(codec_init);
    Box::full_leaf(b"vpcC", 1, 0, bytes)
}

fn av1c(description: &[u8]) -> Box {
    Box::leaf(b"av1C", description.to_vec())
}

fn colr(color_space: &VideoColorSpace) -> Box {
    let (primaries, transfer, matrix) = cicp_mapping(color_space);
    let mut bytes = Vec::new();
    bytes.extend(*b"nclx");
    bytes.extend(prim::u16(primaries));
    bytes.extend(prim::u16(transfer));
    bytes.extend(prim::u16(matrix));
    bytes.push(if color_space.full_range { 0x80 } else { 0x00 });
    Box::leaf(b"colr", bytes)
}

fn video_sample_entry(fourcc: &[u8; 4], width: u16, height: u16, config_children: Vec<Box>) -> Box {
    let mut prefix = Vec::new();
    prefix.extend([0u8; 6]); // reserved
    prefix.extend(prim::u16(1)); // data_reference_index
    prefix.extend([0u8; 16]); // pre_defined + reserved
    prefix.extend(prim::u16(width));
    prefix.extend(prim::u16(height));
    prefix.extend(prim::fixed_16_16(72.0)); // horizresolution
    prefix.extend(prim::fixed_16_16(72.0)); // vertresolution
    prefix.extend([0u8; 4]); // reserved
    prefix.extend(prim::u16(1)); // frame_count
    prefix.extend([0u8; 32]); // compressorname
    prefix.extend(prim::u16(0x18)); // depth
    prefix.extend(prim::i16(-1)); // pre_defined

    Box::prefixed(fourcc, prefix, config_children.into_iter().map(Some).collect())
}

fn dops(channels: u16, sample_rate: u32) -> Box {
    let mut bytes = Vec::new();
    bytes.push(0); // version
    bytes.push(channels as u8);
    bytes.extend(prim::u16(0)); // pre-skip
    bytes.extend(prim::u32(sample_rate));
    bytes.extend(prim::i16(0)); // output gain
    bytes.push(0); // channel mapping family
    Box::leaf(b"dOps", bytes)
}

fn esds(channel_count: u16, audio_specific_config: &[u8]) -> Box {
    fn od_len_bytes(mut size: u32) -> Vec<u8> {
        let mut out = Vec::new();
        while size > 0x7f {
            out.push(0xff);
            size -= 0x7f;
        }
        out.push(size as u8);
        out
    }
    fn size_of_len(size: u32) -> u32 {
        od_len_bytes(size).len() as u32
    }

    let dsi_bytes = audio_specific_config.len() as u32;
    let dcd_body_len = 1 + 1 + 3 + 4 + 4 + 1 + size_of_len(dsi_bytes) + dsi_bytes;
    let esd_body_len = 3 + 1 + size_of_len(dcd_body_len) + dcd_body_len;

    let mut bytes = Vec::new();
    bytes.push(0x03);
    bytes.extend(od_len_bytes(esd_body_len));
    bytes.extend([0u8; 2]); // ES_ID
    bytes.push(0); // flags
    bytes.push(0x04);
    bytes.extend(od_len_bytes(dcd_body_len));
    bytes.push(0x40); // object type: AAC
    bytes.push(5 << 2); // stream type = 5 (audio), upstream=0, reserved=1
    bytes.extend([0u8; 3]); // buffer size db
    bytes.extend(prim::u32((channel_count as u32) * 6144 / 8)); // max bitrate (approx)
    bytes.extend(prim::u32(0)); // avg bitrate
    bytes.push(0x05);
    bytes.extend(od_len_bytes(dsi_bytes));
    bytes.extend(audio_specific_config);
    Box::full_leaf(b"esds", 0, 0, bytes)
}

fn audio_sample_entry(fourcc: &[u8; 4], channels: u16, sample_rate: u32, config: Box) -> Box {
    let mut prefix = Vec::new();
    prefix.extend([0u8; 6]);
    prefix.extend(prim::u16(1));
    prefix.extend([0u8; 8]);
    prefix.extend(prim::u16(channels));
    prefix.extend(prim::u16(16)); // samplesize
    prefix.extend([0u8; 4]);
    prefix.extend(prim::u32(sample_rate << 16));
    Box::prefixed(fourcc, prefix, vec![Some(config)])
}

fn subtitle_sample_entry(description: &str) -> Box {
    let config = Box::leaf(b"vttC", description.as_bytes().to_vec());
    let mut prefix = vec![0u8; 6];
    prefix.extend(prim::u16(1));
    Box::prefixed(b"wvtt", prefix, vec![Some(config)])
}

/// Builds the single `stsd` sample entry for a track, dispatching on codec,
/// per spec.md §4.4.4/§6.2's codec-box-name table.
pub fn stsd_for_track(track: &Track, width: u32, height: u32) -> crate::error::Result<Box> {
    use crate::error::MuxError;
    use crate::track::TrackConfig;

    let entry = match (&track.config, track.kind) {
        (TrackConfig::Video(cfg), TrackKind::Video) => video_sample_entry_for(cfg, width, height)?,
        (TrackConfig::Audio(cfg), TrackKind::Audio) => audio_sample_entry_for(cfg)?,
        (TrackConfig::Subtitle(cfg), TrackKind::Subtitle) => {
            subtitle_sample_entry(&cfg.description)
        }
        _ => return Err(MuxError::internal("track kind/config mismatch in stsd")),
    };
    Ok(stsd(entry))
}

fn video_sample_entry_for(
    cfg: &VideoDecoderConfig,
    width: u32,
    height: u32,
) -> crate::error::Result<Box> {
    use crate::error::MuxError;
    let w = width as u16;
    let h = height as u16;
    match cfg.codec {
        Codec::Avc => {
            let desc = cfg.description.as_ref().ok_or_else(|| {
                MuxError::descriptor_required("AVC video track requires a decoder description")
            })?;
            let mut children = vec![avcc(desc)];
            if let Some(cs) = &cfg.color_space {
                children.push(colr(cs));
            }
            Ok(video_sample_entry(b"avc1", w, h, children))
        }
        Codec::Hevc => {
            let desc = cfg.description.as_ref().ok_or_else(|| {
                MuxError::descriptor_required("HEVC video track requires a decoder description")
            })?;
            let mut children = vec![hvcc(desc)];
            if let Some(cs) = &cfg.color_space {
                children.push(colr(cs));
            }
            Ok(video_sample_entry(b"hvc1", w, h, children))
        }
        Codec::Vp8 | Codec::Vp9 => {
            let cs = cfg.color_space.as_ref().ok_or_else(|| {
                MuxError::descriptor_required("VP8/VP9 video track requires a complete colorSpace")
            })?;
            let fourcc = if cfg.codec == Codec::Vp8 { b"vp08" } else { b"vp09" };
            let children = vec![vpcc(cfg.description.as_deref(), Some(cs)), colr(cs)];
            Ok(video_sample_entry(fourcc, w, h, children))
        }
        Codec::Av1 => {
            let desc = cfg.description.as_ref().ok_or_else(|| {
                MuxError::descriptor_required("AV1 video track requires a decoder description")
            })?;
            let mut children = vec![av1c(desc)];
            if let Some(cs) = &cfg.color_space {
                children.push(colr(cs));
            }
            Ok(video_sample_entry(b"av01", w, h, children))
        }
        other => Err(MuxError::invalid_argument(format!(
            "{other:?} is not a video codec usable in ISOBMFF"
        ))),
    }
}

fn audio_sample_entry_for(cfg: &AudioDecoderConfig) -> crate::error::Result<Box> {
    use crate::error::MuxError;
    match cfg.codec {
        Codec::Aac => {
            let desc = cfg.description.as_ref().ok_or_else(|| {
                MuxError::descriptor_required("AAC audio track requires a decoder description")
            })?;
            Ok(audio_sample_entry(
                b"mp4a",
                cfg.number_of_channels,
                cfg.sample_rate,
                esds(cfg.number_of_channels, desc),
            ))
        }
        Codec::Opus => {
            if let Some(desc) = &cfg.description {
                if desc.len() < 18 {
                    return Err(MuxError::descriptor_required(
                        "Opus description must be at least 18 bytes",
                    ));
                }
            }
            Ok(audio_sample_entry(
                b"Opus",
                cfg.number_of_channels,
                cfg.sample_rate,
                dops(cfg.number_of_channels, cfg.sample_rate),
            ))
        }
        other => Err(MuxError::invalid_argument(format!(
            "{other:?} is not an audio codec usable in ISOBMFF"
        ))),
    }
}

fn stts(data: &TrackData) -> Box {
    let mut bytes = prim::u32(data.time_to_sample.entries.len() as u32);
    for e in &data.time_to_sample.entries {
        bytes.extend(prim::u32(e.sample_count));
        bytes.extend(prim::u32(e.value as u32));
    }
    Box::full_leaf(b"stts", 0, 0, bytes)
}

fn ctts(data: &TrackData) -> Option<Box> {
    if !data.composition_offset.has_any_nonzero() {
        return None;
    }
    let mut bytes = prim::u32(data.composition_offset.entries.len() as u32);
    for e in &data.composition_offset.entries {
        bytes.extend(prim::u32(e.sample_count));
        bytes.extend(prim::i32(e.value as i32));
    }
    Some(Box::full_leaf(b"ctts", 1, 0, bytes))
}

fn stsc(data: &TrackData) -> Box {
    let mut bytes = prim::u32(data.chunk_table.runs.len() as u32);
    for r in &data.chunk_table.runs {
        bytes.extend(prim::u32(r.first_chunk));
        bytes.extend(prim::u32(r.samples_per_chunk));
        bytes.extend(prim::u32(1)); // sample_description_index
    }
    Box::full_leaf(b"stsc", 0, 0, bytes)
}

fn stsz(data: &TrackData) -> Box {
    let mut bytes = prim::u32(0); // sample_size = 0 (variable)
    bytes.extend(prim::u32(data.samples.len() as u32));
    for s in &data.samples {
        bytes.extend(prim::u32(s.size));
    }
    Box::full_leaf(b"stsz", 0, 0, bytes)
}

fn stco(offsets: &[u64]) -> Box {
    let mut bytes = prim::u32(offsets.len() as u32);
    for o in offsets {
        bytes.extend(prim::u32(*o as u32));
    }
    Box::full_leaf(b"stco", 0, 0, bytes)
}

fn co64(offsets: &[u64]) -> Box {
    let mut bytes = prim::u32(offsets.len() as u32);
    for o in offsets {
        bytes.extend(prim::u64(*o));
    }
    Box::full_leaf(b"co64", 0, 0, bytes)
}

fn stss(data: &TrackData) -> Option<Box> {
    use crate::codec::SampleKind;
    if data.samples.iter().all(|s| s.kind == SampleKind::Key) {
        return None; // degenerate: every sample is a key frame
    }
    let indices: Vec<u32> = data
        .samples
        .iter()
        .enumerate()
        .filter(|(_, s)| s.kind == SampleKind::Key)
        .map(|(i, _)| i as u32 + 1)
        .collect();
    let mut bytes = prim::u32(indices.len() as u32);
    for i in indices {
        bytes.extend(prim::u32(i));
    }
    Some(Box::full_leaf(b"stss", 0, 0, bytes))
}

pub fn stbl(track: &Track, data: &TrackData, width: u32, height: u32) -> crate::error::Result<Box> {
    let mut children = vec![Some(stsd_for_track(track, width, height)?)];
    children.push(Some(stts(data)));
    children.push(ctts(data));
    children.push(Some(stsc(data)));
    children.push(Some(stsz(data)));
    let uses_co64 = data.chunk_offsets.iter().any(|o| *o >= 1 << 32);
    children.push(Some(if uses_co64 {
        co64(&data.chunk_offsets)
    } else {
        stco(&data.chunk_offsets)
    }));
    if matches!(track.kind, TrackKind::Video) {
        children.push(stss(data));
    }
    Ok(Box::container(b"stbl", children))
}

fn minf(track: &Track, stbl_box: Box) -> Box {
    let header = match track.kind {
        TrackKind::Video => vmhd(),
        TrackKind::Audio => smhd(),
        TrackKind::Subtitle => sthd(),
    };
    Box::container(b"minf", vec![Some(header), Some(dinf()), Some(stbl_box)])
}

fn mdia(track: &Track, timescale: u32, duration: u64, stbl_box: Box) -> Box {
    Box::container(
        b"mdia",
        vec![
            Some(mdhd(timescale, duration, &track.language)),
            Some(hdlr(track.kind)),
            Some(minf(track, stbl_box)),
        ],
    )
}

fn matrix_bytes(track: &Track) -> [u8; 36] {
    if let crate::track::TrackMetadata::Video(vm) = &track.metadata {
        match &vm.transform {
            Some(VideoTransform::Rotation(deg)) => return rotation_matrix(*deg),
            Some(VideoTransform::Matrix(m)) => return explicit_matrix(m),
            None => {}
        }
    }
    rotation_matrix(0)
}

fn tkhd(track: &Track, timescale: u32, duration: u64, width: u32, height: u32) -> Box {
    let mut bytes = Vec::new();
    bytes.extend(prim::u32(0)); // creation_time
    bytes.extend(prim::u32(0)); // modification_time
    bytes.extend(prim::u32(track.id));
    bytes.extend(prim::u32(0)); // reserved
    let movie_duration = duration.saturating_mul(1000) / timescale.max(1) as u64;
    bytes.extend(prim::u32(movie_duration as u32));
    bytes.extend([0u8; 8]); // reserved
    bytes.extend(prim::u16(0)); // layer
    bytes.extend(prim::u16(0)); // alternate_group
    bytes.extend(prim::fixed_8_8(if matches!(track.kind, TrackKind::Audio) {
        1.0
    } else {
        0.0
    }));
    bytes.extend([0u8; 2]); // reserved
    bytes.extend(matrix_bytes(track));
    if matches!(track.kind, TrackKind::Video) {
        bytes.extend(prim::fixed_16_16(width as f64));
        bytes.extend(prim::fixed_16_16(height as f64));
    } else {
        bytes.extend([0u8; 8]);
    }
    Box::full_leaf(b"tkhd", 0, 7, bytes)
}

pub fn trak(track: &Track, timescale: u32, duration: u64, width: u32, height: u32, stbl_box: Box) -> Box {
    Box::container(
        b"trak",
        vec![
            Some(tkhd(track, timescale, duration, width, height)),
            Some(mdia(track, timescale, duration, stbl_box)),
        ],
    )
}

fn mvhd(duration_1000hz: u64, next_track_id: u32) -> Box {
    let mut bytes = Vec::new();
    bytes.extend(prim::u32(0)); // creation_time
    bytes.extend(prim::u32(0)); // modification_time
    bytes.extend(prim::u32(1000)); // global timescale
    bytes.extend(prim::u32(duration_1000hz as u32));
    bytes.extend(prim::fixed_16_16(1.0)); // rate
    bytes.extend(prim::fixed_8_8(1.0)); // volume
    bytes.extend([0u8; 10]); // reserved
    bytes.extend(rotation_matrix(0));
    bytes.extend([0u8; 24]); // pre_defined
    bytes.extend(prim::u32(next_track_id));
    Box::full_leaf(b"mvhd", 0, 0, bytes)
}

fn trex(track_id: u32) -> Box {
    let mut bytes = Vec::new();
    bytes.extend(prim::u32(track_id));
    bytes.extend(prim::u32(1)); // default_sample_description_index
    bytes.extend(prim::u32(0)); // default_sample_duration
    bytes.extend(prim::u32(0)); // default_sample_size
    bytes.extend(prim::u32(0)); // default_sample_flags
    Box::full_leaf(b"trex", 0, 0, bytes)
}

fn mvex(track_ids: &[u32]) -> Box {
    Box::container(b"mvex", track_ids.iter().map(|id| Some(trex(*id))).collect())
}

pub fn moov(
    track_boxes: Vec<Box>,
    track_ids: &[u32],
    duration_1000hz: u64,
    next_track_id: u32,
    fragmented: bool,
) -> Box {
    let mut children: Vec<Option<Box>> = vec![Some(mvhd(duration_1000hz, next_track_id))];
    for t in track_boxes {
        children.push(Some(t));
    }
    if fragmented {
        children.push(Some(mvex(track_ids)));
    }
    Box::container(b"moov", children)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::isobmff::sample_table::TrackData;
    use crate::track::{Track, TrackConfig};

    fn opus_track() -> Track {
        let mut track = Track::new(1, TrackKind::Audio, crate::track::TrackMetadata::Audio(Default::default()));
        track.config = TrackConfig::Audio(AudioDecoderConfig {
            codec: Codec::Opus,
            sample_rate: 48_000,
            number_of_channels: 1,
            description: None,
        });
        track
    }

    #[test]
    fn chunk_offset_under_4gib_uses_stco() {
        let track = opus_track();
        let mut data = TrackData::new(48_000);
        data.chunk_offsets = vec![0, 4096];
        let stbl_box = stbl(&track, &data, 0, 0).unwrap();
        let bytes = stbl_box.to_bytes().unwrap();
        assert!(bytes.windows(4).any(|w| w == b"stco"));
        assert!(!bytes.windows(4).any(|w| w == b"co64"));
    }

    // The >=4GiB promotion to co64 is exercised as an integration test under
    // tests/mux_scenarios.rs (chunk_offset_past_4gib_promotes_stco_to_co64).
}
