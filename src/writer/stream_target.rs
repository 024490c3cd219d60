use super::Target;
use crate::error::Result;

/// Default chunk size for [`StreamTarget::chunked`]: 16 MiB.
pub const DEFAULT_CHUNK_SIZE: u64 = 1 << 24;
const MIN_CHUNK_SIZE: u64 = 1024;
/// How many of the most-recently-touched chunks are kept open before the
/// oldest is forced out, per spec.md §4.1.
const MAX_CHUNKS_AT_ONCE: usize = 2;

type OnData = Box<dyn FnMut(&[u8], u64) + Send>;

struct PendingSpan {
    data: Vec<u8>,
    start: u64,
}

struct Chunk {
    start: u64,
    data: Vec<u8>,
    /// Sorted, merged `(relative_start, relative_end)` intervals written so
    /// far within this chunk.
    written: Vec<(u64, u64)>,
}

impl Chunk {
    fn new(start: u64, size: u64) -> Self {
        Chunk {
            start,
            data: vec![0u8; size as usize],
            written: Vec::new(),
        }
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn mark_written(&mut self, rel_start: u64, rel_end: u64) {
        self.written.push((rel_start, rel_end));
        self.written.sort_by_key(|s| s.0);
        let mut merged: Vec<(u64, u64)> = Vec::with_capacity(self.written.len());
        for span in self.written.drain(..) {
            if let Some(last) = merged.last_mut() {
                if span.0 <= last.1 {
                    last.1 = last.1.max(span.1);
                    continue;
                }
            }
            merged.push(span);
        }
        self.written = merged;
    }

    fn is_fully_written(&self) -> bool {
        self.written.len() == 1 && self.written[0] == (0, self.size())
    }
}

enum Mode {
    Unchunked { pending: Vec<PendingSpan> },
    Chunked {
        chunk_size: u64,
        chunks: std::collections::BTreeMap<u64, Chunk>,
        /// Chunk indices in most-recently-touched-first order.
        recency: Vec<u64>,
    },
}

/// Stream target delivering written bytes to a consumer callback, either as
/// coalesced append-order spans (unchunked) or as fixed-size chunks flushed
/// once complete or evicted (chunked), per spec.md §4.1.
pub struct StreamTarget {
    on_data: OnData,
    mode: Mode,
}

impl StreamTarget {
    pub fn unchunked(on_data: impl FnMut(&[u8], u64) + Send + 'static) -> Self {
        StreamTarget {
            on_data: Box::new(on_data),
            mode: Mode::Unchunked {
                pending: Vec::new(),
            },
        }
    }

    pub fn chunked(on_data: impl FnMut(&[u8], u64) + Send + 'static, chunk_size: u64) -> Self {
        let chunk_size = chunk_size.max(MIN_CHUNK_SIZE);
        StreamTarget {
            on_data: Box::new(on_data),
            mode: Mode::Chunked {
                chunk_size,
                chunks: std::collections::BTreeMap::new(),
                recency: Vec::new(),
            },
        }
    }

    pub fn chunked_default(on_data: impl FnMut(&[u8], u64) + Send + 'static) -> Self {
        Self::chunked(on_data, DEFAULT_CHUNK_SIZE)
    }

    fn flush_unchunked(on_data: &mut OnData, pending: &mut Vec<PendingSpan>) {
        if pending.is_empty() {
            return;
        }
        pending.sort_by_key(|s| s.start);
        let mut merged: Vec<PendingSpan> = Vec::with_capacity(pending.len());
        for span in pending.drain(..) {
            if let Some(last) = merged.last_mut() {
                if span.start <= last.start + last.data.len() as u64 {
                    let overlap_from = (span.start - last.start) as usize;
                    let needed_len = overlap_from + span.data.len();
                    if needed_len > last.data.len() {
                        last.data.resize(needed_len, 0);
                    }
                    last.data[overlap_from..overlap_from + span.data.len()]
                        .copy_from_slice(&span.data);
                    continue;
                }
            }
            merged.push(span);
        }
        for span in &merged {
            on_data(&span.data, span.start);
        }
    }

    fn flush_chunked(
        on_data: &mut OnData,
        chunk_size: u64,
        chunks: &mut std::collections::BTreeMap<u64, Chunk>,
        recency: &mut Vec<u64>,
        force_all: bool,
    ) {
        let flushable_indices: Vec<u64> = chunks
            .keys()
            .copied()
            .filter(|idx| {
                if force_all {
                    return true;
                }
                let chunk = &chunks[idx];
                if chunk.is_fully_written() {
                    return true;
                }
                let rank = recency.iter().position(|r| r == idx).unwrap_or(usize::MAX);
                rank >= MAX_CHUNKS_AT_ONCE
            })
            .collect();

        for idx in flushable_indices {
            if let Some(chunk) = chunks.remove(&idx) {
                for (rel_start, rel_end) in &chunk.written {
                    let abs_pos = chunk.start + rel_start;
                    on_data(&chunk.data[*rel_start as usize..*rel_end as usize], abs_pos);
                }
                recency.retain(|r| *r != idx);
            }
        }
        let _ = chunk_size;
    }
}

impl Target for StreamTarget {
    fn write(&mut self, data: &[u8], position: u64) -> Result<()> {
        match &mut self.mode {
            Mode::Unchunked { pending } => {
                pending.push(PendingSpan {
                    data: data.to_vec(),
                    start: position,
                });
            }
            Mode::Chunked {
                chunk_size,
                chunks,
                recency,
            } => {
                let mut remaining = data;
                let mut pos = position;
                while !remaining.is_empty() {
                    let idx = pos / *chunk_size;
                    let chunk_start = idx * *chunk_size;
                    let rel = pos - chunk_start;
                    let room = (*chunk_size - rel) as usize;
                    let take = room.min(remaining.len());

                    let chunk = chunks
                        .entry(idx)
                        .or_insert_with(|| Chunk::new(chunk_start, *chunk_size));
                    chunk.data[rel as usize..rel as usize + take]
                        .copy_from_slice(&remaining[..take]);
                    chunk.mark_written(rel, rel + take as u64);

                    recency.retain(|r| *r != idx);
                    recency.insert(0, idx);

                    remaining = &remaining[take..];
                    pos += take as u64;
                }
                Self::flush_chunked(&mut self.on_data, *chunk_size, chunks, recency, false);
            }
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Unchunked { pending } => Self::flush_unchunked(&mut self.on_data, pending),
            Mode::Chunked {
                chunk_size,
                chunks,
                recency,
            } => Self::flush_chunked(&mut self.on_data, *chunk_size, chunks, recency, false),
        }
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        match &mut self.mode {
            Mode::Unchunked { pending } => {
                Self::flush_unchunked(&mut self.on_data, pending);
            }
            Mode::Chunked {
                chunk_size,
                chunks,
                recency,
            } => {
                Self::flush_chunked(&mut self.on_data, *chunk_size, chunks, recency, true);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Mutex};

    #[test]
    fn unchunked_coalesces_adjacent_spans() {
        let events: Arc<Mutex<Vec<(Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let mut t = StreamTarget::unchunked(move |data, pos| {
            events2.lock().unwrap().push((data.to_vec(), pos));
        });
        t.write(b"abc", 0).unwrap();
        t.write(b"def", 3).unwrap();
        t.finalize().unwrap();
        let got = events.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (b"abcdef".to_vec(), 0));
    }

    #[test]
    fn chunked_forces_all_on_finalize() {
        let events: Arc<Mutex<Vec<(Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let mut t = StreamTarget::chunked(
            move |data, pos| {
                events2.lock().unwrap().push((data.to_vec(), pos));
            },
            1024,
        );
        t.write(b"partial", 0).unwrap();
        t.finalize().unwrap();
        let got = events.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].0, b"partial".to_vec());
        assert_eq!(got[0].1, 0);
    }

    #[test]
    fn chunked_flushes_full_chunk_eagerly() {
        let events: Arc<Mutex<Vec<(Vec<u8>, u64)>>> = Arc::new(Mutex::new(Vec::new()));
        let events2 = events.clone();
        let mut t = StreamTarget::chunked(
            move |data, pos| {
                events2.lock().unwrap().push((data.to_vec(), pos));
            },
            4,
        );
        t.write(&[1, 2, 3, 4], 0).unwrap();
        // fully written chunk flushes without needing finalize
        let got = events.lock().unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0], (vec![1, 2, 3, 4], 0));
    }
}
