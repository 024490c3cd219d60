//! ISOBMFF (MP4) back-end: box construction, sample tables, fragmentation,
//! and WebVTT sample synthesis, tied together by [`IsobmffMuxer`]'s three
//! layout strategies (spec.md §4.4).
//!
//! Fragmented mode stages each track's samples in arrival order and does
//! not re-sort them to decode order before building `trun` — B-frame PTS
//! reordering (handled for the streaming/in-memory layouts by
//! [`sample_table::process_timestamps`]) is not applied here. A producer
//! feeding a fragmented output is expected to deliver samples already in
//! decode order.

pub mod boxes;
pub mod boxwriter;
pub mod colorspace;
pub mod fragmented;
pub mod sample_table;
pub mod vp9;
pub mod vtt;

use std::collections::{HashMap, VecDeque};

use crate::codec::{AudioDecoderConfig, Codec, EncodedUnit, SampleKind, SubtitleConfig, SubtitleCue, VideoDecoderConfig};
use crate::error::{MuxError, Result};
use crate::timestamp::{validate_and_normalize_timestamp, TimestampState, ZeroStartPolicy};
use crate::track::{Track, TrackConfig, TrackKind, TrackMetadata};
use crate::writer::Writer;

use boxwriter::Box;
use fragmented::{FragSample, TfraEntry, TrackFragment};
use sample_table::{process_timestamps, Chunk, Sample, TrackData};
use vtt::VttSynthesizer;

const DEFAULT_VIDEO_TIMESCALE: u32 = 57_600;
const SUBTITLE_TIMESCALE: u32 = 1_000;
const CHUNK_DURATION_MICROS: i64 = 500_000;
const FRAGMENT_DURATION_MICROS: i64 = 1_000_000;

/// Which of the three layout strategies `start()` commits to, per spec.md
/// §4.4.2. Chosen from [`crate::output::OutputFormat::Mp4`]'s `fast_start`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// Single `mdat` reserved up front, `moov` written at `finalize()`.
    Streaming,
    /// All sample bytes buffered; `moov` written before `mdat`.
    InMemory,
    /// `moov`(fragmented) followed by repeated `moof`+`mdat`, `mfra` at the end.
    Fragmented,
}

struct PendingFragSample {
    pts: i64,
    duration: u64,
    data: Vec<u8>,
    kind: SampleKind,
}

#[derive(Default)]
struct FragQueue {
    pending: VecDeque<PendingFragSample>,
    staged: Vec<PendingFragSample>,
    chunk_start: Option<i64>,
}

/// Multi-track ISOBMFF muxer. Mirrors spec.md §4.4.1's public contract:
/// `add_video_chunk`/`add_audio_chunk`/`add_subtitle_cue`/`close_track`/
/// `start`/`finalize`.
pub struct IsobmffMuxer {
    layout: Layout,
    writer: Writer,
    tracks: Vec<Track>,
    track_data: HashMap<u32, TrackData>,
    frag_queues: HashMap<u32, FragQueue>,
    vtt: HashMap<u32, VttSynthesizer>,
    timestamps: HashMap<u32, TimestampState>,
    next_track_id: u32,
    started: bool,
    finalized: bool,
    moov_written: bool,
    mdat_header_offset: u64,
    fragment_sequence: u32,
    tfra: HashMap<u32, Vec<TfraEntry>>,
}

impl IsobmffMuxer {
    pub fn new(writer: Writer, layout: Layout) -> Self {
        let mut writer = writer;
        writer.set_ensure_monotonicity(!matches!(layout, Layout::Streaming));
        IsobmffMuxer {
            layout,
            writer,
            tracks: Vec::new(),
            track_data: HashMap::new(),
            frag_queues: HashMap::new(),
            vtt: HashMap::new(),
            timestamps: HashMap::new(),
            next_track_id: 1,
            started: false,
            finalized: false,
            moov_written: false,
            mdat_header_offset: 0,
            fragment_sequence: 0,
            tfra: HashMap::new(),
        }
    }

    pub fn add_track(&mut self, kind: TrackKind, metadata: TrackMetadata) -> u32 {
        let id = self.next_track_id;
        self.next_track_id += 1;
        self.tracks.push(Track::new(id, kind, metadata));
        self.timestamps.insert(id, TimestampState::default());
        if matches!(self.layout, Layout::Fragmented) {
            self.frag_queues.insert(id, FragQueue::default());
        }
        if matches!(kind, TrackKind::Subtitle) {
            self.vtt.insert(id, VttSynthesizer::default());
        }
        id
    }

    fn track_mut(&mut self, id: u32) -> Result<&mut Track> {
        self.tracks
            .iter_mut()
            .find(|t| t.id == id)
            .ok_or_else(|| MuxError::invalid_argument(format!("unknown track {id}")))
    }

    fn track(&self, id: u32) -> Result<&Track> {
        self.tracks
            .iter()
            .find(|t| t.id == id)
            .ok_or_else(|| MuxError::invalid_argument(format!("unknown track {id}")))
    }

    fn track_timescale(&self, id: u32) -> Result<u32> {
        let track = self.track(id)?;
        Ok(match (&track.config, track.kind) {
            (TrackConfig::Video(_), TrackKind::Video) => {
                if let TrackMetadata::Video(vm) = &track.metadata {
                    vm.frame_rate.unwrap_or(DEFAULT_VIDEO_TIMESCALE)
                } else {
                    DEFAULT_VIDEO_TIMESCALE
                }
            }
            (TrackConfig::Audio(cfg), TrackKind::Audio) => cfg.sample_rate,
            _ => SUBTITLE_TIMESCALE,
        })
    }

    fn ensure_started(&mut self) -> Result<()> {
        if !self.started {
            return Err(MuxError::lifecycle_misuse(
                "start() must be called before adding media",
            ));
        }
        if self.finalized {
            return Err(MuxError::lifecycle_misuse("muxer already finalized"));
        }
        Ok(())
    }

    pub fn start(&mut self) -> Result<()> {
        if self.started {
            return Err(MuxError::lifecycle_misuse("start() called twice"));
        }
        log::debug!("starting ISOBMFF output with layout {:?}", self.layout);
        let has_avc = self
            .tracks
            .iter()
            .any(|t| matches!(t.codec(), Some(Codec::Avc)));
        boxes::ftyp(matches!(self.layout, Layout::Fragmented), has_avc).write(&mut self.writer)?;

        if matches!(self.layout, Layout::Streaming) {
            self.mdat_header_offset = self.writer.get_pos();
            self.writer.write(&1u32.to_be_bytes())?;
            self.writer.write(b"mdat")?;
            self.writer.write(&0u64.to_be_bytes())?;
        }
        self.started = true;
        Ok(())
    }

    // -- ingestion -----------------------------------------------------

    pub fn add_video_chunk(
        &mut self,
        track_id: u32,
        config: Option<VideoDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        self.ensure_started()?;
        {
            let track = self.track_mut(track_id)?;
            if matches!(track.config, TrackConfig::Unset) {
                let cfg = config.ok_or_else(|| {
                    MuxError::descriptor_required("first video chunk requires a decoderConfig")
                })?;
                match cfg.codec {
                    Codec::Avc | Codec::Hevc if cfg.description.is_none() => {
                        return Err(MuxError::descriptor_required(
                            "AVC/HEVC require a decoder description",
                        ));
                    }
                    Codec::Vp8 | Codec::Vp9 if cfg.color_space.is_none() => {
                        return Err(MuxError::descriptor_required(
                            "VP8/VP9 require a complete colorSpace",
                        ));
                    }
                    _ => {}
                }
                track.config = TrackConfig::Video(cfg);
            }
        }
        let is_key = unit.kind == SampleKind::Key;
        let color_space = match &self.track(track_id)?.config {
            TrackConfig::Video(cfg) => cfg.color_space.clone(),
            _ => None,
        };
        let codec = self.track(track_id)?.codec();
        let data = if codec == Some(Codec::Vp9) && is_key {
            vp9::patch_key_frame_color_space(&unit.data, color_space.as_ref())
        } else {
            unit.data
        };
        self.ingest(track_id, unit.timestamp, unit.duration, data, unit.kind)
    }

    pub fn add_audio_chunk(
        &mut self,
        track_id: u32,
        config: Option<AudioDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        self.ensure_started()?;
        {
            let track = self.track_mut(track_id)?;
            if matches!(track.config, TrackConfig::Unset) {
                let cfg = config.ok_or_else(|| {
                    MuxError::descriptor_required(
                        "first audio chunk requires sampleRate/numberOfChannels",
                    )
                })?;
                cfg.validate()?;
                track.config = TrackConfig::Audio(cfg);
            }
        }
        self.ingest(track_id, unit.timestamp, unit.duration, unit.data, unit.kind)
    }

    fn ingest(
        &mut self,
        track_id: u32,
        raw_ts: i64,
        duration: u64,
        data: Vec<u8>,
        kind: SampleKind,
    ) -> Result<()> {
        let is_key = kind == SampleKind::Key;
        let mut state = self.timestamps.remove(&track_id).unwrap_or_default();
        let ts = validate_and_normalize_timestamp(
            track_id,
            &mut state,
            raw_ts,
            is_key,
            false,
            ZeroStartPolicy::MustStartAtZero,
        );
        self.timestamps.insert(track_id, state);
        let ts = ts?;

        match self.layout {
            Layout::Streaming | Layout::InMemory => self.ingest_buffered(track_id, ts, duration, data, kind),
            Layout::Fragmented => self.ingest_fragmented(track_id, ts, duration, data, kind),
        }
    }

    fn ingest_buffered(
        &mut self,
        track_id: u32,
        ts: i64,
        duration: u64,
        data: Vec<u8>,
        kind: SampleKind,
    ) -> Result<()> {
        let timescale = self.track_timescale(track_id)?;
        let td = self
            .track_data
            .entry(track_id)
            .or_insert_with(|| TrackData::new(timescale));

        let needs_new_chunk = td
            .current_chunk
            .as_ref()
            .map(|c| ts - c.start_timestamp >= CHUNK_DURATION_MICROS)
            .unwrap_or(true);
        if needs_new_chunk {
            if let Some(prev) = td.current_chunk.take() {
                let chunk_index = td.finalized_chunks.len() as u32 + 1;
                td.chunk_table.push_chunk(chunk_index, prev.sample_indices.len() as u32);
                td.finalized_chunks.push(prev);
            }
            let offset = match self.layout {
                Layout::Streaming => self.writer.get_pos(),
                _ => 0, // reassigned at finalize for the in-memory layout
            };
            td.current_chunk = Some(Chunk {
                start_timestamp: ts,
                sample_indices: Vec::new(),
                offset: Some(offset),
                moof_offset: None,
            });
            td.chunk_offsets.push(offset);
        }

        let size = data.len() as u32;
        let sample_index = td.samples.len();
        if matches!(self.layout, Layout::Streaming) {
            self.writer.write(&data)?;
        }
        td.samples.push(Sample {
            timestamp: ts,
            decode_timestamp: ts,
            duration,
            data: if matches!(self.layout, Layout::InMemory) {
                Some(data)
            } else {
                None
            },
            size,
            kind,
        });
        td.current_chunk
            .as_mut()
            .expect("chunk just ensured above")
            .sample_indices
            .push(sample_index);
        Ok(())
    }

    fn ingest_fragmented(
        &mut self,
        track_id: u32,
        ts: i64,
        duration: u64,
        data: Vec<u8>,
        kind: SampleKind,
    ) -> Result<()> {
        let q = self.frag_queues.entry(track_id).or_insert_with(FragQueue::default);
        q.pending.push_back(PendingFragSample {
            pts: ts,
            duration,
            data,
            kind,
        });
        self.drive_fragments()
    }

    pub fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        config: Option<SubtitleConfig>,
        cue: SubtitleCue,
    ) -> Result<()> {
        self.ensure_started()?;
        {
            let track = self.track_mut(track_id)?;
            if matches!(track.config, TrackConfig::Unset) {
                let cfg = config.ok_or_else(|| {
                    MuxError::descriptor_required("first subtitle cue requires a WebVTT preamble")
                })?;
                track.config = TrackConfig::Subtitle(cfg);
            }
        }
        let synth = self
            .vtt
            .get_mut(&track_id)
            .ok_or_else(|| MuxError::invalid_argument(format!("track {track_id} is not a subtitle track")))?;
        synth.push_cue(cue);
        let samples = synth.drain_ready(false)?;
        for s in samples {
            self.ingest(track_id, s.timestamp, s.duration, s.data, SampleKind::Key)?;
        }
        Ok(())
    }

    pub fn close_track(&mut self, track_id: u32) -> Result<()> {
        if self.vtt.contains_key(&track_id) {
            let samples = self.vtt.get_mut(&track_id).unwrap().drain_ready(true)?;
            for s in samples {
                self.ingest(track_id, s.timestamp, s.duration, s.data, SampleKind::Key)?;
            }
        }
        self.track_mut(track_id)?.closed = true;
        if matches!(self.layout, Layout::Fragmented) {
            self.drive_fragments()?;
        }
        Ok(())
    }

    // -- fragmented-mode interleaving (spec.md §4.4.7) ------------------

    fn open_track_ids(&self) -> Vec<u32> {
        self.tracks.iter().filter(|t| !t.closed).map(|t| t.id).collect()
    }

    /// Pulls samples across tracks in smallest-head-timestamp order,
    /// flushing a fragment whenever the boundary rule is satisfied. Stops
    /// (without erroring) once any still-open track's queue runs dry — more
    /// input is required before progress can continue.
    fn drive_fragments(&mut self) -> Result<()> {
        loop {
            let ids = self.open_track_ids();
            for id in &ids {
                let q = self.frag_queues.get(id).unwrap();
                if q.pending.is_empty() {
                    return Ok(());
                }
            }
            let candidate = ids
                .iter()
                .copied()
                .min_by_key(|id| self.frag_queues[id].pending.front().unwrap().pts);
            let Some(track_id) = candidate else {
                break;
            };

            let q = self.frag_queues.get_mut(&track_id).unwrap();
            let sample = q.pending.pop_front().unwrap();
            if q.chunk_start.is_none() {
                q.chunk_start = Some(sample.pts);
            }
            let chunk_elapsed = sample.pts - q.chunk_start.unwrap();
            q.staged.push(sample);

            let all_staged_key = ids.iter().all(|id| {
                self.frag_queues[id]
                    .staged
                    .first()
                    .map(|s| s.kind == SampleKind::Key)
                    .unwrap_or(false)
            });

            if all_staged_key && chunk_elapsed >= FRAGMENT_DURATION_MICROS {
                self.flush_fragment()?;
            }
        }
        Ok(())
    }

    fn flush_fragment(&mut self) -> Result<()> {
        self.write_init_segment_if_needed()?;

        let ids = self.open_track_ids();
        let mut fragments = Vec::new();
        let mut chunk_starts = HashMap::new();
        for id in &ids {
            let q = self.frag_queues.get_mut(id).unwrap();
            if q.staged.is_empty() {
                continue;
            }
            if let Some(start) = q.chunk_start {
                chunk_starts.insert(*id, start);
            }
            let staged = std::mem::take(&mut q.staged);
            q.chunk_start = None;
            fragments.push((*id, staged));
        }
        if fragments.is_empty() {
            return Ok(());
        }

        self.fragment_sequence += 1;
        let track_fragments: Vec<TrackFragment> = fragments
            .iter()
            .map(|(id, staged)| TrackFragment {
                track_id: *id,
                samples: staged
                    .iter()
                    .map(|s| FragSample {
                        duration: s.duration as u32,
                        size: s.data.len() as u32,
                        composition_offset: 0,
                        kind: s.kind,
                    })
                    .collect(),
            })
            .collect();
        let moof = fragmented::build_moof(self.fragment_sequence, &track_fragments);
        let moof_offset = moof.write(&mut self.writer)?;

        let mut mdat_bytes = Vec::new();
        for (_, staged) in &fragments {
            for s in staged {
                mdat_bytes.extend_from_slice(&s.data);
            }
        }
        Box::leaf(b"mdat", mdat_bytes).write(&mut self.writer)?;

        for (id, _) in &fragments {
            if let Some(start) = chunk_starts.get(id) {
                self.tfra.entry(*id).or_default().push(TfraEntry {
                    time: *start as u64,
                    moof_offset,
                });
            }
        }
        Ok(())
    }

    /// Writes the fragmented layout's initial `moov` (empty `stbl` tables,
    /// plus `mvex`/`trex`) the first time it's needed. By the time any
    /// fragment is ready to flush, every open track already has its first
    /// sample staged, so its decoder config is already resolved.
    fn write_init_segment_if_needed(&mut self) -> Result<()> {
        if self.moov_written {
            return Ok(());
        }
        let track_ids: Vec<u32> = self
            .tracks
            .iter()
            .filter(|t| !matches!(t.config, TrackConfig::Unset))
            .map(|t| t.id)
            .collect();
        let mut track_boxes = Vec::new();
        for id in &track_ids {
            let timescale = self.track_timescale(*id)?;
            let empty = TrackData::new(timescale);
            let track = self.track(*id)?.clone();
            let (width, height) = if let TrackConfig::Video(cfg) = &track.config {
                (cfg.coded_width, cfg.coded_height)
            } else {
                (0, 0)
            };
            let stbl = boxes::stbl(&track, &empty, width, height)?;
            track_boxes.push(boxes::trak(&track, timescale, 0, width, height, stbl));
        }
        let moov = boxes::moov(track_boxes, &track_ids, 0, self.next_track_id, true);
        moov.write(&mut self.writer)?;
        self.moov_written = true;
        Ok(())
    }

    // -- finalize --------------------------------------------------------

    pub fn finalize(mut self) -> Result<Writer> {
        if self.finalized {
            return Err(MuxError::lifecycle_misuse("finalize() called twice"));
        }
        log::debug!("finalizing ISOBMFF output");
        match self.layout {
            Layout::Streaming => self.finalize_streaming()?,
            Layout::InMemory => self.finalize_in_memory()?,
            Layout::Fragmented => self.finalize_fragmented()?,
        }
        self.finalized = true;
        self.writer.finalize()?;
        Ok(self.writer)
    }

    /// Builds every track's `trak` box from its accumulated `TrackData`,
    /// resolving PTS/DTS and chunk tables in the process. Tracks that never
    /// received a single unit are omitted. Idempotent — calling it twice
    /// (the in-memory layout's two-pass `moov` sizing) reproduces the same
    /// tables, since the per-track chunk/timestamp bookkeeping is only
    /// mutated the first time through.
    fn track_boxes(&mut self) -> Result<(Vec<Box>, u64)> {
        let mut duration = 0u64;
        let mut boxes = Vec::new();
        let track_ids: Vec<u32> = self
            .tracks
            .iter()
            .filter(|t| !matches!(t.config, TrackConfig::Unset))
            .map(|t| t.id)
            .collect();
        for id in track_ids {
            let timescale = self.track_timescale(id)?;
            let mut td = self
                .track_data
                .remove(&id)
                .unwrap_or_else(|| TrackData::new(timescale));

            let (stts, ctts, dts) = process_timestamps(&td.samples);
            for (s, d) in td.samples.iter_mut().zip(dts.iter()) {
                s.decode_timestamp = *d;
            }
            td.time_to_sample = stts;
            td.composition_offset = ctts;
            if let Some(prev) = td.current_chunk.take() {
                let chunk_index = td.finalized_chunks.len() as u32 + 1;
                td.chunk_table.push_chunk(chunk_index, prev.sample_indices.len() as u32);
                td.finalized_chunks.push(prev);
            }

            let track_duration = td.duration();
            duration = duration.max(track_duration.saturating_mul(1000) / timescale.max(1) as u64);
            let track = self.track(id)?.clone();
            let (width, height) = if let TrackConfig::Video(cfg) = &track.config {
                (cfg.coded_width, cfg.coded_height)
            } else {
                (0, 0)
            };
            let stbl = boxes::stbl(&track, &td, width, height)?;
            boxes.push(boxes::trak(&track, timescale, track_duration, width, height, stbl));
            self.track_data.insert(id, td);
        }
        Ok((boxes, duration))
    }

    fn finalize_streaming(&mut self) -> Result<()> {
        let end_pos = self.writer.get_pos();
        let mdat_size = end_pos - self.mdat_header_offset;
        self.writer.patch(self.mdat_header_offset + 8, &mdat_size.to_be_bytes())?;

        let track_ids: Vec<u32> = self.tracks.iter().map(|t| t.id).collect();
        let (track_boxes, duration) = self.track_boxes()?;
        let moov = boxes::moov(track_boxes, &track_ids, duration, self.next_track_id, false);
        moov.write(&mut self.writer)?;
        Ok(())
    }

    /// Buffers every sample in memory and writes `moov` ahead of `mdat`
    /// (spec.md §4.4.2's fast-start layout). `moov`'s size — and thus every
    /// chunk offset, and thus whether `stco` must be promoted to `co64` —
    /// depends on `moov` itself, so offsets are assigned in a short
    /// fixed-point loop: measure, assign, and repeat only if assignment
    /// changed anything (it converges in at most two passes in practice,
    /// since `stco`→`co64` promotion is the only thing that can perturb
    /// `moov`'s size between iterations).
    fn finalize_in_memory(&mut self) -> Result<()> {
        let track_ids: Vec<u32> = self.tracks.iter().map(|t| t.id).collect();
        let ftyp_end = self.writer.get_pos();

        loop {
            let (track_boxes, duration) = self.track_boxes()?;
            let moov = boxes::moov(track_boxes, &track_ids, duration, self.next_track_id, false);
            let moov_size = moov.measure();

            let total_bytes: u64 = self
                .track_data
                .values()
                .flat_map(|td| td.samples.iter())
                .map(|s| s.size as u64)
                .sum();
            let mdat_header_len = if total_bytes + 8 >= 1 << 32 { 16 } else { 8 };
            let data_start = ftyp_end + moov_size + mdat_header_len;

            let mut assigned = 0u64;
            let mut changed = false;
            for id in &track_ids {
                if let Some(td) = self.track_data.get_mut(id) {
                    let mut new_offsets = Vec::with_capacity(td.finalized_chunks.len());
                    for chunk in &td.finalized_chunks {
                        new_offsets.push(data_start + assigned);
                        for &idx in &chunk.sample_indices {
                            assigned += td.samples[idx].size as u64;
                        }
                    }
                    if new_offsets != td.chunk_offsets {
                        changed = true;
                    }
                    td.chunk_offsets = new_offsets;
                }
            }
            if !changed {
                break;
            }
        }

        let (track_boxes, duration) = self.track_boxes()?;
        let moov = boxes::moov(track_boxes, &track_ids, duration, self.next_track_id, false);
        moov.write(&mut self.writer)?;

        let mut mdat_bytes = Vec::new();
        for id in &track_ids {
            if let Some(td) = self.track_data.get(id) {
                for chunk in &td.finalized_chunks {
                    for &idx in &chunk.sample_indices {
                        if let Some(data) = &td.samples[idx].data {
                            mdat_bytes.extend_from_slice(data);
                        }
                    }
                }
            }
        }
        let total_bytes = mdat_bytes.len() as u64;
        let mdat = if total_bytes + 8 >= 1 << 32 {
            Box::leaf(b"mdat", mdat_bytes).with_large_size()
        } else {
            Box::leaf(b"mdat", mdat_bytes)
        };
        mdat.write(&mut self.writer)?;
        Ok(())
    }

    fn finalize_fragmented(&mut self) -> Result<()> {
        self.write_init_segment_if_needed()?;
        for id in self.open_track_ids() {
            self.track_mut(id)?.closed = true;
        }
        self.drive_fragments()?;
        // Force a final fragment from whatever remains staged, even if the
        // 1-second/all-tracks-keyed boundary rule was never satisfied.
        self.flush_fragment()?;

        let per_track: Vec<(u32, Vec<TfraEntry>)> = self
            .tracks
            .iter()
            .map(|t| (t.id, self.tfra.get(&t.id).cloned().unwrap_or_default()))
            .collect();
        let mfra = fragmented::build_mfra(&per_track);
        mfra.write(&mut self.writer)?;
        Ok(())
    }
}
