//! `Output`: the public façade over both format back-ends, per spec.md §4.7/
//! §6.1.
//!
//! Dispatch is a flat `match` over a two-variant enum rather than a trait
//! object — there are exactly two back-ends and they don't share a common
//! ingestion signature (`MatroskaMuxer` threads a WebM allow-list through
//! its config checks that `IsobmffMuxer` has no use for), so a trait would
//! just be a thin, single-purpose indirection.

use crate::codec::{AudioDecoderConfig, EncodedUnit, SubtitleConfig, SubtitleCue, VideoDecoderConfig};
use crate::error::{MuxError, Result};
use crate::isobmff::{IsobmffMuxer, Layout};
use crate::matroska::MatroskaMuxer;
use crate::track::{AudioTrackMetadata, SubtitleTrackMetadata, TrackKind, TrackMetadata, VideoTrackMetadata};
use crate::writer::{Target, Writer};

/// `Mp4OutputFormat`'s `fastStart` option (spec.md §6.1), selecting one of
/// [`IsobmffMuxer`]'s three layout strategies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FastStart {
    /// Single reserved `mdat`, `moov` written last.
    #[default]
    Off,
    /// Every sample buffered; `moov` precedes `mdat`.
    InMemory,
    /// Fragmented `moof`/`mdat` pairs, `mfra` at the end.
    Fragmented,
}

impl From<FastStart> for Layout {
    fn from(value: FastStart) -> Self {
        match value {
            FastStart::Off => Layout::Streaming,
            FastStart::InMemory => Layout::InMemory,
            FastStart::Fragmented => Layout::Fragmented,
        }
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Mp4OutputFormat {
    pub fast_start: FastStart,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MkvOutputFormat {
    pub streamable: bool,
}

/// Matroska with the WebM codec allow-list enforced (spec.md §6.1):
/// `{vp8, vp9, av1, opus, vorbis, webvtt}`.
#[derive(Debug, Clone, Copy, Default)]
pub struct WebMOutputFormat {
    pub streamable: bool,
}

#[derive(Debug, Clone, Copy)]
pub enum OutputFormat {
    Mp4(Mp4OutputFormat),
    Mkv(MkvOutputFormat),
    WebM(WebMOutputFormat),
}

enum Backend {
    Isobmff(IsobmffMuxer),
    Matroska(MatroskaMuxer),
}

/// Attaches tracks, then drives one format back-end from `start()` through
/// `finalize()`.
pub struct Output {
    format: OutputFormat,
    backend: Backend,
    track_count: u32,
    finalized: bool,
}

impl Output {
    pub fn new(format: OutputFormat, target: Box<dyn Target>) -> Self {
        let writer = Writer::new(target);
        let backend = match format {
            OutputFormat::Mp4(cfg) => Backend::Isobmff(IsobmffMuxer::new(writer, cfg.fast_start.into())),
            OutputFormat::Mkv(cfg) => Backend::Matroska(MatroskaMuxer::new(writer, cfg.streamable, false)),
            OutputFormat::WebM(cfg) => Backend::Matroska(MatroskaMuxer::new(writer, cfg.streamable, true)),
        };
        Output { format, backend, track_count: 0, finalized: false }
    }

    pub fn add_video_track(&mut self, metadata: Option<VideoTrackMetadata>) -> u32 {
        self.track_count += 1;
        let metadata = TrackMetadata::Video(metadata.unwrap_or_default());
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_track(TrackKind::Video, metadata),
            Backend::Matroska(m) => m.add_track(TrackKind::Video, metadata),
        }
    }

    pub fn add_audio_track(&mut self, metadata: Option<AudioTrackMetadata>) -> u32 {
        self.track_count += 1;
        let metadata = TrackMetadata::Audio(metadata.unwrap_or_default());
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_track(TrackKind::Audio, metadata),
            Backend::Matroska(m) => m.add_track(TrackKind::Audio, metadata),
        }
    }

    pub fn add_subtitle_track(&mut self, metadata: Option<SubtitleTrackMetadata>) -> u32 {
        self.track_count += 1;
        let metadata = TrackMetadata::Subtitle(metadata.unwrap_or_default());
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_track(TrackKind::Subtitle, metadata),
            Backend::Matroska(m) => m.add_track(TrackKind::Subtitle, metadata),
        }
    }

    pub fn start(&mut self) -> Result<()> {
        match &mut self.backend {
            Backend::Isobmff(m) => m.start(),
            Backend::Matroska(m) => m.start(),
        }
    }

    pub fn add_video_chunk(
        &mut self,
        track_id: u32,
        config: Option<VideoDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_video_chunk(track_id, config, unit),
            Backend::Matroska(m) => m.add_video_chunk(track_id, config, unit),
        }
    }

    pub fn add_audio_chunk(
        &mut self,
        track_id: u32,
        config: Option<AudioDecoderConfig>,
        unit: EncodedUnit,
    ) -> Result<()> {
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_audio_chunk(track_id, config, unit),
            Backend::Matroska(m) => m.add_audio_chunk(track_id, config, unit),
        }
    }

    pub fn add_subtitle_cue(
        &mut self,
        track_id: u32,
        config: Option<SubtitleConfig>,
        cue: SubtitleCue,
    ) -> Result<()> {
        match &mut self.backend {
            Backend::Isobmff(m) => m.add_subtitle_cue(track_id, config, cue),
            Backend::Matroska(m) => m.add_subtitle_cue(track_id, config, cue),
        }
    }

    pub fn close_track(&mut self, track_id: u32) -> Result<()> {
        match &mut self.backend {
            Backend::Isobmff(m) => m.close_track(track_id),
            Backend::Matroska(m) => m.close_track(track_id),
        }
    }

    pub fn finalize(mut self) -> Result<Writer> {
        if self.finalized {
            return Err(MuxError::lifecycle_misuse("finalize() called twice"));
        }
        self.finalized = true;
        match self.backend {
            Backend::Isobmff(m) => m.finalize(),
            Backend::Matroska(m) => m.finalize(),
        }
    }

    pub fn track_count(&self) -> u32 {
        self.track_count
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn format(&self) -> &OutputFormat {
        &self.format
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{Codec, SampleKind};
    use crate::writer::BufferTarget;

    #[test]
    fn mp4_round_trip_introspection() {
        let mut out = Output::new(OutputFormat::Mp4(Mp4OutputFormat::default()), Box::new(BufferTarget::new()));
        assert!(!out.is_finalized());
        let track = out.add_audio_track(None);
        assert_eq!(out.track_count(), 1);
        out.start().unwrap();
        let cfg = AudioDecoderConfig { codec: Codec::Aac, sample_rate: 44_100, number_of_channels: 2, description: Some(vec![1, 2]) };
        out.add_audio_chunk(track, Some(cfg), EncodedUnit { data: vec![0u8; 8], timestamp: 0, duration: 20_000, kind: SampleKind::Key }).unwrap();
        out.close_track(track).unwrap();
        let writer = out.finalize().unwrap();
        assert!(writer.end_pos() > 0);
    }

    #[test]
    fn webm_rejects_avc() {
        let mut out = Output::new(OutputFormat::WebM(WebMOutputFormat::default()), Box::new(BufferTarget::new()));
        let track = out.add_video_track(None);
        out.start().unwrap();
        let cfg = VideoDecoderConfig { codec: Codec::Avc, coded_width: 640, coded_height: 480, description: Some(vec![1]), color_space: None };
        let err = out
            .add_video_chunk(track, Some(cfg), EncodedUnit { data: vec![0u8; 8], timestamp: 0, duration: 0, kind: SampleKind::Key })
            .unwrap_err();
        assert!(matches!(err, MuxError::FormatConstraint(_)));
    }
}
