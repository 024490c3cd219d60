//! End-to-end scenarios against the public `Output` façade, covering the
//! seeds in spec.md §8.4.

use remuxer::isobmff::boxes::stbl;
use remuxer::isobmff::boxwriter::prim;
use remuxer::isobmff::sample_table::TrackData;
use remuxer::track::{Track, TrackConfig, TrackKind, TrackMetadata};
use remuxer::{
    AudioDecoderConfig, BufferTarget, Codec, EncodedUnit, FastStart, MkvOutputFormat,
    Mp4OutputFormat, MuxError, Output, OutputFormat, SampleKind, VideoDecoderConfig,
    VideoTrackMetadata, WebMOutputFormat,
};

fn mp4_bytes(out: Output) -> Vec<u8> {
    let writer = out.finalize().unwrap();
    writer.get_slice(0, writer.end_pos()).unwrap()
}

#[test]
fn empty_finalize_produces_a_valid_ftyp() {
    let mut out = Output::new(OutputFormat::Mp4(Mp4OutputFormat::default()), Box::new(BufferTarget::new()));
    out.add_video_track(Some(VideoTrackMetadata::default()));
    out.start().unwrap();
    let bytes = mp4_bytes(out);
    assert_eq!(&bytes[4..8], b"ftyp");
}

#[test]
fn single_key_frame_streaming_layout_orders_ftyp_mdat_moov() {
    let mut out = Output::new(OutputFormat::Mp4(Mp4OutputFormat::default()), Box::new(BufferTarget::new()));
    let track = out.add_video_track(Some(VideoTrackMetadata { frame_rate: Some(25), ..Default::default() }));
    out.start().unwrap();
    let cfg = VideoDecoderConfig {
        codec: Codec::Avc,
        coded_width: 640,
        coded_height: 480,
        description: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        color_space: None,
    };
    out.add_video_chunk(
        track,
        Some(cfg),
        EncodedUnit { data: vec![0x01, 0x02], timestamp: 0, duration: 40_000, kind: SampleKind::Key },
    )
    .unwrap();
    out.close_track(track).unwrap();
    let bytes = mp4_bytes(out);

    assert_eq!(&bytes[4..8], b"ftyp");
    let ftyp_size = u32::from_be_bytes(bytes[0..4].try_into().unwrap()) as usize;
    // Streaming-layout mdat always reserves the 16-byte extended-size header
    // (size=1 marker, "mdat", 8-byte real size) since its length isn't known
    // until finalize.
    assert_eq!(&bytes[ftyp_size + 4..ftyp_size + 8], b"mdat");
    let mdat_data_start = ftyp_size + 16;
    assert_eq!(&bytes[mdat_data_start..mdat_data_start + 2], &[0x01, 0x02]);
    assert!(bytes.windows(4).any(|w| w == b"moov"));
    assert!(bytes.windows(4).any(|w| w == b"avcC"));
}

#[test]
fn matroska_cluster_boundaries_track_video_key_frames() {
    let mut out = Output::new(OutputFormat::Mkv(MkvOutputFormat::default()), Box::new(BufferTarget::new()));
    let video = out.add_video_track(Some(VideoTrackMetadata { frame_rate: Some(1), ..Default::default() }));
    let audio = out.add_audio_track(None);
    out.start().unwrap();

    let video_cfg = VideoDecoderConfig {
        codec: Codec::Vp9,
        coded_width: 320,
        coded_height: 240,
        description: None,
        color_space: Some(remuxer::VideoColorSpace {
            primaries: remuxer::ColorPrimaries::Bt709,
            transfer: remuxer::TransferCharacteristics::Bt709,
            matrix: remuxer::MatrixCoefficients::Bt709,
            full_range: false,
        }),
    };
    let audio_cfg = remuxer::AudioDecoderConfig { codec: Codec::Opus, sample_rate: 48_000, number_of_channels: 1, description: None };

    for i in 0..3i64 {
        let ts_ms = i * 1000;
        out.add_video_chunk(
            video,
            if i == 0 { Some(video_cfg.clone()) } else { None },
            EncodedUnit { data: vec![0xAA], timestamp: ts_ms * 1000, duration: 1_000_000, kind: SampleKind::Key },
        )
        .unwrap();
        out.add_audio_chunk(
            audio,
            if i == 0 { Some(audio_cfg.clone()) } else { None },
            EncodedUnit { data: vec![0xBB], timestamp: ts_ms * 1000, duration: 1_000_000, kind: SampleKind::Key },
        )
        .unwrap();
    }
    out.close_track(video).unwrap();
    out.close_track(audio).unwrap();
    let writer = out.finalize().unwrap();
    let bytes = writer.get_slice(0, writer.end_pos()).unwrap();
    assert_eq!(&bytes[0..4], &[0x1A, 0x45, 0xDF, 0xA3]);

    // Three 1-second-apart key frames give two full 1s clusters.
    let cluster_id = [0x1F, 0x43, 0xB6, 0x75];
    let cluster_count = bytes.windows(4).filter(|w| *w == cluster_id).count();
    assert!(cluster_count >= 2, "expected at least 2 clusters, saw {cluster_count}");
}

#[test]
fn matroska_cluster_overflow_fails_with_format_constraint() {
    let mut out = Output::new(OutputFormat::WebM(WebMOutputFormat::default()), Box::new(BufferTarget::new()));
    let track = out.add_video_track(Some(VideoTrackMetadata { frame_rate: Some(1), ..Default::default() }));
    out.start().unwrap();
    let cfg = VideoDecoderConfig {
        codec: Codec::Vp8,
        coded_width: 320,
        coded_height: 240,
        description: None,
        color_space: Some(remuxer::VideoColorSpace {
            primaries: remuxer::ColorPrimaries::Bt709,
            transfer: remuxer::TransferCharacteristics::Bt709,
            matrix: remuxer::MatrixCoefficients::Bt709,
            full_range: false,
        }),
    };
    // First key frame opens cluster 0; a second key frame 40 seconds later
    // forces the same cluster to carry a block far past the signed 16-bit
    // millisecond offset limit, since no third frame ever supplies another
    // cluster-closing key frame for every currently-open track.
    out.add_video_chunk(
        track,
        Some(cfg),
        EncodedUnit { data: vec![0xAA], timestamp: 0, duration: 1_000_000, kind: SampleKind::Key },
    )
    .unwrap();
    let err = out
        .add_video_chunk(
            track,
            None,
            EncodedUnit { data: vec![0xAA], timestamp: 40_000_000, duration: 1_000_000, kind: SampleKind::Delta },
        )
        .unwrap_err();
    assert!(matches!(err, MuxError::FormatConstraint(_)));
}

#[test]
fn fragmented_mp4_layout_finalizes_cleanly() {
    let mut out = Output::new(
        OutputFormat::Mp4(Mp4OutputFormat { fast_start: FastStart::Fragmented }),
        Box::new(BufferTarget::new()),
    );
    let track = out.add_audio_track(None);
    out.start().unwrap();
    let cfg = remuxer::AudioDecoderConfig { codec: Codec::Aac, sample_rate: 44_100, number_of_channels: 2, description: Some(vec![0x12, 0x10]) };
    for i in 0..4i64 {
        out.add_audio_chunk(
            track,
            if i == 0 { Some(cfg.clone()) } else { None },
            EncodedUnit { data: vec![0; 16], timestamp: i * 250_000, duration: 250_000, kind: SampleKind::Key },
        )
        .unwrap();
    }
    out.close_track(track).unwrap();
    let bytes = mp4_bytes(out);
    assert!(bytes.windows(4).any(|w| w == b"moof"));
    assert!(bytes.windows(4).any(|w| w == b"mfra"));
}

#[test]
fn b_frame_pts_reordering_reconstructs_ctts() {
    let mut out = Output::new(OutputFormat::Mp4(Mp4OutputFormat::default()), Box::new(BufferTarget::new()));
    let track = out.add_video_track(Some(VideoTrackMetadata::default()));
    out.start().unwrap();
    let cfg = VideoDecoderConfig {
        codec: Codec::Avc,
        coded_width: 320,
        coded_height: 240,
        description: Some(vec![0xDE, 0xAD, 0xBE, 0xEF]),
        color_space: None,
    };
    // Arrival-order PTS 0,80,40,120,80 sorts to DTS 0,40,80,80,120 — the
    // canonical B-frame reordering case (spec.md §4.4.3).
    let arrival_pts = [0i64, 80, 40, 120, 80];
    for (i, pts) in arrival_pts.iter().enumerate() {
        out.add_video_chunk(
            track,
            if i == 0 { Some(cfg.clone()) } else { None },
            EncodedUnit {
                data: vec![0; 4],
                timestamp: *pts,
                duration: 40,
                kind: if i == 0 { SampleKind::Key } else { SampleKind::Delta },
            },
        )
        .unwrap();
    }
    out.close_track(track).unwrap();
    let bytes = mp4_bytes(out);

    assert!(bytes.windows(4).any(|w| w == b"ctts"));

    // offset[i] = pts[i] - dts[i] for dts = [0,40,80,80,120]:
    // [0, 40, -40, 40, -40] — five singleton runs since no two consecutive
    // offsets repeat.
    let mut expected = prim::u32(5);
    for v in [0i32, 40, -40, 40, -40] {
        expected.extend(prim::u32(1));
        expected.extend(prim::i32(v));
    }
    assert!(
        bytes.windows(expected.len()).any(|w| w == expected.as_slice()),
        "ctts body did not match the expected run-length-encoded composition offsets"
    );
}

#[test]
fn three_overlapping_webvtt_cues_synthesize_six_vttc_boxes() {
    let mut out = Output::new(OutputFormat::Mp4(Mp4OutputFormat::default()), Box::new(BufferTarget::new()));
    let track = out.add_subtitle_track(None);
    out.start().unwrap();
    let cfg = remuxer::SubtitleConfig { description: String::new() };

    let cues = [(0i64, 2_000_000u64, "long"), (1_000_000, 500_000, "short"), (1_500_000, 1_500_000, "tail")];
    for (i, (start, duration, text)) in cues.iter().enumerate() {
        out.add_subtitle_cue(
            track,
            if i == 0 { Some(cfg.clone()) } else { None },
            remuxer::SubtitleCue {
                text: text.to_string(),
                timestamp: *start,
                duration: *duration,
                identifier: None,
                settings: None,
                notes: None,
            },
        )
        .unwrap();
    }
    out.close_track(track).unwrap();
    let bytes = mp4_bytes(out);

    // [0,1e6): "long" alone (vsid). [1e6,1.5e6): "long"+"short". [1.5e6,2e6):
    // "long"+"tail". [2e6,3e6): "tail" alone — six vttc boxes, no gaps so no
    // vtte, per spec.md §4.4.5.
    let vttc_count = bytes.windows(4).filter(|w| *w == b"vttc").count();
    assert_eq!(vttc_count, 6);
    assert!(bytes.windows(4).any(|w| w == b"vsid"));
}

#[test]
fn chunk_offset_past_4gib_promotes_stco_to_co64() {
    let mut track = Track::new(1, TrackKind::Audio, TrackMetadata::Audio(Default::default()));
    track.config = TrackConfig::Audio(AudioDecoderConfig {
        codec: Codec::Opus,
        sample_rate: 48_000,
        number_of_channels: 1,
        description: None,
    });
    let mut data = TrackData::new(48_000);
    // A real >4GiB in-memory fast-start file would place this track's chunk
    // past the 32-bit offset limit; exercising the threshold directly avoids
    // allocating gigabytes of sample data just to reach it.
    data.chunk_offsets = vec![0, 1u64 << 32];

    let stbl_box = stbl(&track, &data, 0, 0).unwrap();
    let bytes = stbl_box.to_bytes().unwrap();
    assert!(bytes.windows(4).any(|w| w == b"co64"));
    assert!(!bytes.windows(4).any(|w| w == b"stco"));
}
