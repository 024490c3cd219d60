//! Sequential+seekable byte sink, per spec.md §4.1.
//!
//! A [`Writer`] wraps one concrete [`Target`] and exposes the primitives the
//! two format back-ends need: sequential writes, seeks for box/element size
//! patching, and a monotonicity guard used by the fast-start and fragmented
//! MP4 layouts (spec.md §8.1's "no seeks backward" property).

mod buffer_target;
mod fs_target;
mod stream_target;

pub use buffer_target::BufferTarget;
pub use fs_target::FileSystemWritableFileStreamTarget;
pub use stream_target::StreamTarget;

use crate::error::{MuxError, Result};

/// A concrete byte sink. Implemented by the four targets named in spec.md
/// §4.1/§6.1.
pub trait Target: Send {
    fn write(&mut self, data: &[u8], position: u64) -> Result<()>;
    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
    /// Only meaningful for in-memory targets; used by the in-memory
    /// fast-start layout to re-measure `moov` before committing offsets.
    fn get_slice(&self, _start: u64, _end: u64) -> Option<Vec<u8>> {
        None
    }
}

/// The seekable writer every back-end drives.
///
/// `ensure_monotonicity`, when set, forbids any write whose start position is
/// not exactly the writer's current end-of-stream position — i.e. no patch
/// seeks at all. The in-memory and fragmented MP4 layouts set this because
/// their targets (a streaming consumer) cannot rewrite bytes already
/// delivered; the streaming (non-fast-start) layout leaves it unset because
/// it patches `mdat`'s size in place before ever reading past it.
pub struct Writer {
    target: Box<dyn Target>,
    pos: u64,
    end: u64,
    ensure_monotonicity: bool,
}

impl Writer {
    pub fn new(target: Box<dyn Target>) -> Self {
        Writer {
            target,
            pos: 0,
            end: 0,
            ensure_monotonicity: false,
        }
    }

    pub fn set_ensure_monotonicity(&mut self, value: bool) {
        self.ensure_monotonicity = value;
    }

    pub fn get_pos(&self) -> u64 {
        self.pos
    }

    pub fn end_pos(&self) -> u64 {
        self.end
    }

    pub fn seek(&mut self, pos: u64) -> Result<()> {
        if self.ensure_monotonicity && pos != self.end {
            return Err(MuxError::internal(format!(
                "monotonicity violation: seek to {pos} while end-of-stream is {}",
                self.end
            )));
        }
        self.pos = pos;
        Ok(())
    }

    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let start = self.pos;
        self.target.write(data, start)?;
        self.pos += data.len() as u64;
        if self.pos > self.end {
            self.end = self.pos;
        }
        Ok(())
    }

    /// Writes at an already-recorded patch offset, then restores the cursor.
    /// Allowed even under `ensure_monotonicity` provided `at` is not beyond
    /// `end` (the bytes being patched were pre-registered before the stream
    /// advanced past them) — see spec.md §9 "Monotonicity invariants".
    pub fn patch(&mut self, at: u64, data: &[u8]) -> Result<()> {
        if at + data.len() as u64 > self.end {
            return Err(MuxError::internal(
                "patch would write past already-flushed end of stream",
            ));
        }
        let resume = self.pos;
        self.target.write(data, at)?;
        self.pos = resume;
        Ok(())
    }

    pub fn flush(&mut self) -> Result<()> {
        self.target.flush()
    }

    pub fn finalize(&mut self) -> Result<()> {
        self.target.finalize()
    }

    pub fn get_slice(&self, start: u64, end: u64) -> Option<Vec<u8>> {
        self.target.get_slice(start, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn monotonic_writer_rejects_backward_writes() {
        let mut w = Writer::new(Box::new(BufferTarget::new()));
        w.set_ensure_monotonicity(true);
        w.write(b"hello").unwrap();
        assert!(w.seek(0).is_err());
        assert!(w.seek(5).is_ok());
    }

    #[test]
    fn patch_rewrites_in_place_without_moving_cursor() {
        let mut w = Writer::new(Box::new(BufferTarget::new()));
        w.write(b"\x00\x00\x00\x00rest").unwrap();
        let pos_before = w.get_pos();
        w.patch(0, &9u32.to_be_bytes()).unwrap();
        assert_eq!(w.get_pos(), pos_before);
    }
}
