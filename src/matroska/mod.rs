//! Matroska/WebM back-end: EBML element construction and cluster formation,
//! per spec.md §4.5.
//!
//! Unlike the ISOBMFF fragmented layout, there's only one Matroska layout:
//! a single `Segment` written straight through, optionally with an unknown
//! size for streaming (spec.md §4.5.5/§6.3). Cross-track interleaving uses
//! the same "pull smallest pending timestamp, stall if any open track is
//! empty" shape as the fragmented MP4 muxer (spec.md §4.4.7), generalized
//! to cluster boundaries instead of fragment boundaries (§4.5.3).

pub mod ebml;
pub mod elements;

use std::collections::{HashMap, VecDeque};

use crate::codec::{
    AudioDecoderConfig, Codec, EncodedUnit, SampleKind, SubtitleConfig, SubtitleCue, VideoDecoderConfig,
};
use crate::error::{MuxError, Result};
use crate::subtitle::rewrite_inline_timestamps;
use crate::timestamp::{validate_and_normalize_timestamp, TimestampState, ZeroStartPolicy};
use crate::track::{Track, TrackConfig, TrackKind, TrackMetadata};
use crate::writer::Writer;

use ebml::Element;
use elements::ids;

const CLUSTER_DURATION_MS: i64 = 1_000;
/// A block's cluster-relative time offset is a signed 16-bit integer
/// (spec.md §3 invariant 7).
const MAX_CLUSTER_OFFSET_MS: i64 = 1 << 15;

struct StagedUnit {
    timestamp_us: i64,
    duration_us: u64,
    data: Vec<u8>,
    kind: SampleKind,
    block_additions: Option<String>,
}

#[derive(Default)]
struct TrackQueue {
    pending: VecDeque<StagedUnit>,
    last_written_ms: Option<i64>,
}

struct ClusterState {
    header_offset: u64,
    base_ms: i64,
    tracks_present: Vec<u32>,
}

pub struct MatroskaMuxer {
    writer: Writer,
    tracks: Vec<Track>,
    queues: HashMap<u32, TrackQueue>,
    timestamps: HashMap<u32, TimestampState>,
    next_track_id: u32,
    streamable: bool,
    doc_type: &'static str,
    webm: bool,
    started: bool,
    finalized: bool,
    tracks_written: bool,
    max_end_ms: i64,

    segment_header_offset: u64,
    segment_data_start: u64,
    info_duration_offset: Option<u64>,
    seek_positions: Option<HashMap<&'static str, u64>>,

    current_cluster: Option<ClusterState>,
    cues: Vec<Element>,
}

impl MatroskaMuxer {
    pub fn new(writer: Writer, streamable: bool, webm: bool) -> Self {
        MatroskaMuxer {
            writer,
            tracks: Vec::new(),
            queues: HashMap::new(),
            timestamps: HashMap::new(),
            next_track_id: 1,
            streamable,
            doc_type: if webm { "webm" } else { "matroska" },
            webm,
            started: false,
            finalized: false,
            tracks_written: false,
            max_end_ms: 0,
            segment_header_offset: 0,
            segment_data_start: 0,
            info_duration_offset: None,
            seek_positions: None,
            current_cluster: None,
            cues: Vec::new(),
        }
    }

    pub fn add_track(&mut self, kind: TrackKind, metadata: TrackMetadata) -> u32 {
        let id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks.push(Track::new(id, kind, metadata));
        self.queues.insert(id, TrackQueue::default());
        self.timestamps.insert(id, TimestampState::default());
        id
    }

    fn track(&self, id: u32) -> Result<&Track> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| MuxError::invalid_argument(format!("unknown track {id}")))
    }

    fn track_mut(&mut self, id: u32) -> Result<&mut Track> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| MuxError::invalid_argument(format!("unknown track {id}")))
    }

    fn ensure_started(&self) -> Result<()> {
        if !self.started {
            return Err(MuxError::lifecycle_misuse("digest called before start"));
        }
        if self.finalized {
            return Err(MuxError::lifecycle_misuse("digest called after finalize"));
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(MuxError::lifecycle_misuse("start called twice"));
        }
        self.started = true;

        elements::ebml_header(self.doc_type).write(&mut self.writer)?;

        self.segment_header_offset =
            ebml::write_container_header(&mut self.writer, ids::SEGMENT, self.streamable)?;
        self.segment_data_start = self.writer.get_pos();

        self.seek_positions = if self.streamable {
            None
        } else {
            let mut positions = HashMap::new();
            let seek_head_offset = ebml::write_container_header(&mut self.writer, ids::SEEK_HEAD, false)?;
            for (name, target_id) in [("info", ids::INFO), ("tracks", ids::TRACKS), ("cues", ids::CUES)] {
                let seek_offset = ebml::write_container_header(&mut self.writer, ids::SEEK, false)?;
                Element::bytes(ids::SEEK_ID, ebml::id_bytes(target_id)).write(&mut self.writer)?;
                let pos_element = Element::uint_fixed(ids::SEEK_POSITION, 0, 8);
                let pos_header_offset = pos_element.write(&mut self.writer)?;
                positions.insert(name, pos_element.data_offset(pos_header_offset));
                ebml::close_container(&mut self.writer, seek_offset, ids::SEEK, false)?;
            }
            ebml::close_container(&mut self.writer, seek_head_offset, ids::SEEK_HEAD, false)?;
            Some(positions)
        };

        let info_header_offset = ebml::write_container_header(&mut self.writer, ids::INFO, false)?;
        // TimestampScale = 1,000,000 ns/unit, i.e. one unit per millisecond.
        Element::uint(ids::TIMESTAMP_SCALE, 1_000_000).write(&mut self.writer)?;
        Element::ascii(ids::MUXING_APP, "remuxer").write(&mut self.writer)?;
        Element::ascii(ids::WRITING_APP, "remuxer").write(&mut self.writer)?;
        self.info_duration_offset = if self.streamable {
            None
        } else {
            let duration_element = Element::float64(ids::DURATION, 0.0);
            let duration_header_offset = duration_element.write(&mut self.writer)?;
            Some(duration_element.data_offset(duration_header_offset))
        };
        ebml::close_container(&mut self.writer, info_header_offset, ids::INFO, false)?;

        if let Some(positions) = &self.seek_positions {
            let relative = info_header_offset - self.segment_data_start;
            self.writer.patch(positions["info"], &relative.to_be_bytes())?;
        }

        Ok(())
    }

    pub fn add_video_chunk(
        &mut self,
        track_id: u32,
        config: Option<VideoDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        self.ensure_started()?;
        if matches!(self.track(track_id)?.config, TrackConfig::Unset) {
            let cfg = config.ok_or_else(|| {
                MuxError::descriptor_required("first video chunk for a track requires a decoderConfig")
            })?;
            if matches!(cfg.codec, Codec::Avc | Codec::Hevc) && cfg.description.is_none() {
                return Err(MuxError::descriptor_required(
                    "AVC/HEVC requires a decoderConfig.description",
                ));
            }
            if matches!(cfg.codec, Codec::Vp8 | Codec::Vp9) && cfg.color_space.is_none() {
                return Err(MuxError::descriptor_required(
                    "VP8/VP9 requires a complete decoderConfig.colorSpace",
                ));
            }
            if self.webm && !cfg.codec.webm_allowed() {
                return Err(MuxError::format_constraint(format!(
                    "{:?} is not an allowed WebM codec",
                    cfg.codec
                )));
            }
            self.track_mut(track_id)?.config = TrackConfig::Video(cfg);
        }
        self.ingest(track_id, unit.timestamp, unit.duration, unit.data, unit.kind, None)
    }

    pub fn add_audio_chunk(
        &mut self,
        track_id: u32,
        config: Option<AudioDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        self.ensure_started()?;
        if matches!(self.track(track_id)?.config, TrackConfig::Unset) {
            let cfg = config.ok_or_else(|| {
                MuxError::descriptor_required("first audio chunk for a track requires a decoderConfig")
            })?;
            cfg.validate()?;
            if self.webm && !cfg.codec.webm_allowed() {
                return Err(MuxError::format_constraint(format!(
                    "{:?} is not an allowed WebM codec",
                    cfg.codec
                )));
            }
            self.track_mut(track_id)?.config = TrackConfig::Audio(cfg);
        }
        self.ingest(track_id, unit.timestamp, unit.duration, unit.data, unit.kind, None)
    }

    pub fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        config: Option<SubtitleConfig>,
        cue: SubtitleCue,
    ) -> Result<()> {
        self.ensure_started()?;
        if matches!(self.track(track_id)?.config, TrackConfig::Unset) {
            let cfg = config.ok_or_else(|| {
                MuxError::descriptor_required("first subtitle cue for a track requires a config.description")
            })?;
            self.track_mut(track_id)?.config = TrackConfig::Subtitle(cfg);
        }
        let rewritten = rewrite_inline_timestamps(&cue.text, cue.timestamp);
        let additions = join_additions(cue.settings.as_deref(), cue.identifier.as_deref(), cue.notes.as_deref());
        self.ingest(
            track_id,
            cue.timestamp,
            cue.duration,
            rewritten.into_bytes(),
            SampleKind::Key,
            additions,
        )
    }

    pub fn close_track(&mut self, track_id: u32) -> Result<()> {
        self.track_mut(track_id)?.closed = true;
        self.drive_clusters()
    }

    fn ingest(
        &mut self,
        track_id: u32,
        raw_ts: i64,
        duration: u64,
        data: Vec<u8>,
        kind: SampleKind,
        block_additions: Option<String>,
    ) -> Result<()> {
        if self.track(track_id)?.closed {
            return Err(MuxError::lifecycle_misuse("digest called on a closed track"));
        }
        let is_key = matches!(kind, SampleKind::Key);
        let state = self
            .timestamps
            .get_mut(&track_id)
            .ok_or_else(|| MuxError::invalid_argument(format!("unknown track {track_id}")))?;
        let ts = validate_and_normalize_timestamp(
            track_id,
            state,
            raw_ts,
            is_key,
            false,
            ZeroStartPolicy::Unconstrained,
        )?;
        self.queues.get_mut(&track_id).unwrap().pending.push_back(StagedUnit {
            timestamp_us: ts,
            duration_us: duration,
            data,
            kind,
            block_additions,
        });
        self.drive_clusters()
    }

    fn open_track_ids(&self) -> Vec<u32> {
        self.tracks.iter().filter(|t| !t.closed).map(|t| t.id).collect()
    }

    fn drive_clusters(&mut self) -> Result<()> {
        loop {
            let blocked = self
                .open_track_ids()
                .iter()
                .any(|id| self.queues[id].pending.is_empty());
            if blocked {
                break;
            }

            let mut candidate: Option<(u32, i64)> = None;
            for track in &self.tracks {
                if let Some(front) = self.queues[&track.id].pending.front() {
                    if candidate.map(|(_, ts)| front.timestamp_us < ts).unwrap_or(true) {
                        candidate = Some((track.id, front.timestamp_us));
                    }
                }
            }
            let Some((track_id, _)) = candidate else {
                break;
            };
            self.emit_one(track_id)?;
        }
        Ok(())
    }

    fn all_open_tracks_have_key_at_head(&self, candidate_track: u32) -> bool {
        self.tracks.iter().filter(|t| !t.closed).all(|t| {
            if t.id == candidate_track {
                true
            } else {
                self.queues[&t.id]
                    .pending
                    .front()
                    .is_some_and(|u| matches!(u.kind, SampleKind::Key))
            }
        })
    }

    fn emit_one(&mut self, track_id: u32) -> Result<()> {
        let unit = self.queues.get_mut(&track_id).unwrap().pending.pop_front().unwrap();
        let ts_ms = unit.timestamp_us / 1000;
        let is_key = matches!(unit.kind, SampleKind::Key);
        self.max_end_ms = self.max_end_ms.max(ts_ms + (unit.duration_us / 1000) as i64);

        let needs_new_cluster = match &self.current_cluster {
            None => true,
            Some(cluster) => {
                (ts_ms - cluster.base_ms) >= CLUSTER_DURATION_MS
                    && is_key
                    && self.all_open_tracks_have_key_at_head(track_id)
            }
        };

        if needs_new_cluster {
            self.close_current_cluster()?;
        }
        self.write_tracks_if_needed()?;
        if needs_new_cluster {
            self.open_cluster(ts_ms)?;
        }

        let base_ms = self.current_cluster.as_ref().unwrap().base_ms;
        let offset_ms = ts_ms - base_ms;
        if offset_ms < 0 {
            // A block arriving after its cluster's base was already fixed
            // cannot be represented; spec.md §4.5.3 drops it silently.
            return Ok(());
        }
        if offset_ms >= MAX_CLUSTER_OFFSET_MS {
            return Err(MuxError::format_constraint(
                "Matroska cluster exceeded maximum length; supply key frames more frequently",
            ));
        }
        let offset_i16 = offset_ms as i16;

        let track_kind = self.track(track_id)?.kind;
        let zero_duration = unit.duration_us == 0 && unit.block_additions.is_none();
        let use_simple = zero_duration && track_kind != TrackKind::Subtitle;
        let last_written_ms = self.queues[&track_id].last_written_ms;

        let element = if use_simple {
            elements::simple_block(track_id, offset_i16, is_key, &unit.data)
        } else {
            let reference_ms = if matches!(unit.kind, SampleKind::Delta) {
                last_written_ms.map(|last| last - ts_ms)
            } else {
                None
            };
            elements::block_group(
                track_id,
                offset_i16,
                &unit.data,
                reference_ms,
                Some((unit.duration_us / 1000) as u64),
                unit.block_additions.clone(),
            )
        };
        element.write(&mut self.writer)?;

        self.queues.get_mut(&track_id).unwrap().last_written_ms = Some(ts_ms);
        let cluster = self.current_cluster.as_mut().unwrap();
        if !cluster.tracks_present.contains(&track_id) {
            cluster.tracks_present.push(track_id);
        }
        Ok(())
    }

    fn write_tracks_if_needed(&mut self) -> Result<()> {
        if self.tracks_written {
            return Ok(());
        }
        self.tracks_written = true;
        let entries: Vec<Element> = self
            .tracks
            .iter()
            .filter_map(|t| t.codec().map(|codec| elements::track_entry(t, codec)))
            .collect();
        let header_offset = Element::children(ids::TRACKS, entries).write(&mut self.writer)?;
        if let Some(positions) = &self.seek_positions {
            let relative = header_offset - self.segment_data_start;
            self.writer.patch(positions["tracks"], &relative.to_be_bytes())?;
        }
        Ok(())
    }

    fn open_cluster(&mut self, base_ms: i64) -> Result<()> {
        let header_offset = ebml::write_container_header(&mut self.writer, ids::CLUSTER, self.streamable)?;
        Element::uint(ids::TIMESTAMP, base_ms.max(0) as u64).write(&mut self.writer)?;
        self.current_cluster = Some(ClusterState { header_offset, base_ms, tracks_present: Vec::new() });
        Ok(())
    }

    fn close_current_cluster(&mut self) -> Result<()> {
        let Some(cluster) = self.current_cluster.take() else {
            return Ok(());
        };
        ebml::close_container(&mut self.writer, cluster.header_offset, ids::CLUSTER, self.streamable)?;
        if !cluster.tracks_present.is_empty() {
            let cluster_relative = cluster.header_offset - self.segment_data_start;
            let positions: Vec<(u32, u64)> =
                cluster.tracks_present.iter().map(|id| (*id, cluster_relative)).collect();
            self.cues.push(elements::cue_point(cluster.base_ms.max(0) as u64, &positions));
        }
        Ok(())
    }

    pub fn finalize(mut self) -> Result<Writer> {
        if self.finalized {
            return Err(MuxError::lifecycle_misuse("finalize called twice"));
        }
        self.finalized = true;
        for track in &mut self.tracks {
            track.closed = true;
        }
        self.drive_clusters()?;
        self.close_current_cluster()?;
        self.write_tracks_if_needed()?;

        let cues_header_offset =
            Element::children(ids::CUES, std::mem::take(&mut self.cues)).write(&mut self.writer)?;
        if let Some(positions) = &self.seek_positions {
            let relative = cues_header_offset - self.segment_data_start;
            self.writer.patch(positions["cues"], &relative.to_be_bytes())?;
        }

        if !self.streamable {
            if let Some(duration_offset) = self.info_duration_offset {
                self.writer.patch(duration_offset, &(self.max_end_ms as f64).to_be_bytes())?;
            }
            ebml::close_container(&mut self.writer, self.segment_header_offset, ids::SEGMENT, false)?;
        }

        self.writer.finalize()?;
        Ok(self.writer)
    }
}

fn join_additions(settings: Option<&str>, identifier: Option<&str>, notes: Option<&str>) -> Option<String> {
    let parts: Vec<&str> = [settings, identifier, notes].into_iter().flatten().collect();
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{AudioDecoderConfig, SampleKind};
    use crate::track::AudioTrackMetadata;
    use crate::writer::BufferTarget;

    fn audio_unit(ts: i64, dur: u64, kind: SampleKind) -> EncodedUnit {
        EncodedUnit { data: vec![0xAB; 4], timestamp: ts, duration: dur, kind }
    }

    #[test]
    fn single_track_emits_simple_blocks_for_zero_duration() {
        let mut m = MatroskaMuxer::new(Writer::new(Box::new(BufferTarget::new())), false, false);
        let track = m.add_track(TrackKind::Audio, TrackMetadata::Audio(AudioTrackMetadata));
        m.start().unwrap();
        let cfg = AudioDecoderConfig { codec: Codec::Opus, sample_rate: 48_000, number_of_channels: 2, description: None };
        m.add_audio_chunk(track, Some(cfg), audio_unit(0, 0, SampleKind::Key)).unwrap();
        m.close_track(track).unwrap();
        let writer = m.finalize().unwrap();
        assert!(writer.end_pos() > 0);
    }

    #[test]
    fn webm_rejects_disallowed_codec() {
        let mut m = MatroskaMuxer::new(Writer::new(Box::new(BufferTarget::new())), false, true);
        let track = m.add_track(TrackKind::Audio, TrackMetadata::Audio(AudioTrackMetadata));
        m.start().unwrap();
        let cfg = AudioDecoderConfig { codec: Codec::Aac, sample_rate: 44_100, number_of_channels: 2, description: None };
        let err = m.add_audio_chunk(track, Some(cfg), audio_unit(0, 0, SampleKind::Key)).unwrap_err();
        assert!(matches!(err, MuxError::FormatConstraint(_)));
    }

    #[test]
    fn streamable_mode_omits_duration_patch() {
        let mut m = MatroskaMuxer::new(Writer::new(Box::new(BufferTarget::new())), true, true);
        let track = m.add_track(TrackKind::Audio, TrackMetadata::Audio(AudioTrackMetadata));
        m.start().unwrap();
        let cfg = AudioDecoderConfig { codec: Codec::Opus, sample_rate: 48_000, number_of_channels: 1, description: None };
        m.add_audio_chunk(track, Some(cfg), audio_unit(0, 20_000, SampleKind::Key)).unwrap();
        m.close_track(track).unwrap();
        assert!(m.finalize().is_ok());
    }
}
