//! A multi-track media container muxer: accepts pre-encoded audio, video,
//! and subtitle units from producers and assembles them into byte-exact
//! ISOBMFF (MP4) or Matroska/WebM files. Encoding and demuxing are external
//! collaborators — see [`Output`] for the entry point.

pub mod codec;
pub mod error;
pub mod isobmff;
pub mod matroska;
mod output;
pub mod subtitle;
mod timestamp;
pub mod track;
pub mod writer;

pub use codec::{
    AudioDecoderConfig, Codec, ColorPrimaries, EncodedUnit, MatrixCoefficients, SampleKind,
    SubtitleConfig, SubtitleCue, TransferCharacteristics, VideoColorSpace, VideoDecoderConfig,
};
pub use error::{MuxError, Result};
pub use output::{FastStart, MkvOutputFormat, Mp4OutputFormat, Output, OutputFormat, WebMOutputFormat};
pub use track::{AudioTrackMetadata, SubtitleTrackMetadata, TrackKind, VideoTrackMetadata, VideoTransform};
pub use writer::{BufferTarget, FileSystemWritableFileStreamTarget, StreamTarget, Target, Writer};
