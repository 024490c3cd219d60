//! Sample timing, chunking, and the run-length-encoded sample tables, per
//! spec.md §3 ("Sample (ISOBMFF internal)", "Chunk", "TrackData") and §4.4.3.

use crate::codec::SampleKind;

/// A run in the `stts`/`ctts` tables: `sample_count` consecutive samples
/// all sharing `value` (a decode delta or a composition-time offset).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RleEntry {
    pub sample_count: u32,
    pub value: i64,
}

/// Append-only run-length table per spec.md §4.4.3: a new value extends the
/// trailing run when it matches, otherwise it starts a new run. Only the
/// immediately preceding run is ever a merge candidate — a singleton run
/// sandwiched between equal-valued runs on either side stays its own entry,
/// since folding it into a neighbor would silently drop its value.
#[derive(Debug, Default, Clone)]
pub struct RleTable {
    pub entries: Vec<RleEntry>,
}

impl RleTable {
    pub fn push(&mut self, value: i64) {
        if let Some(last) = self.entries.last_mut() {
            if last.value == value {
                last.sample_count += 1;
                return;
            }
        }
        self.entries.push(RleEntry {
            sample_count: 1,
            value,
        });
    }

    pub fn has_any_nonzero(&self) -> bool {
        self.entries.iter().any(|e| e.value != 0)
    }

    /// Expands the table back into the original per-sample sequence
    /// (spec.md §8.2's round-trip property), used by tests.
    pub fn expand(&self) -> Vec<i64> {
        let mut out = Vec::new();
        for e in &self.entries {
            out.extend(std::iter::repeat(e.value).take(e.sample_count as usize));
        }
        out
    }
}

/// `(first_chunk, samples_per_chunk)` run from `stsc`; chunk indices are
/// 1-based per spec.md §4.4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRun {
    pub first_chunk: u32,
    pub samples_per_chunk: u32,
}

#[derive(Debug, Default, Clone)]
pub struct ChunkTable {
    pub runs: Vec<ChunkRun>,
}

impl ChunkTable {
    pub fn push_chunk(&mut self, chunk_index_1based: u32, sample_count: u32) {
        if let Some(last) = self.runs.last() {
            if last.samples_per_chunk == sample_count {
                return;
            }
        }
        self.runs.push(ChunkRun {
            first_chunk: chunk_index_1based,
            samples_per_chunk: sample_count,
        });
    }
}

/// An ingested sample, derived from an [`crate::codec::EncodedUnit`].
#[derive(Debug, Clone)]
pub struct Sample {
    pub timestamp: i64,
    pub decode_timestamp: i64,
    pub duration: u64,
    pub data: Option<Vec<u8>>,
    pub size: u32,
    pub kind: SampleKind,
}

/// A contiguous run of samples sharing one file region.
#[derive(Debug, Default)]
pub struct Chunk {
    pub start_timestamp: i64,
    pub sample_indices: Vec<usize>,
    pub offset: Option<u64>,
    pub moof_offset: Option<u64>,
}

/// Per-track accumulator for the non-fragmented and in-memory layouts.
#[derive(Debug, Default)]
pub struct TrackData {
    pub timescale: u32,
    pub samples: Vec<Sample>,
    pub time_to_sample: RleTable,
    pub composition_offset: RleTable,
    pub chunk_table: ChunkTable,
    pub chunk_offsets: Vec<u64>,
    pub current_chunk: Option<Chunk>,
    pub finalized_chunks: Vec<Chunk>,
}

impl TrackData {
    pub fn new(timescale: u32) -> Self {
        TrackData {
            timescale,
            ..Default::default()
        }
    }

    pub fn duration(&self) -> u64 {
        self.samples
            .iter()
            .map(|s| (s.timestamp as i64 + s.duration as i64) as u64)
            .max()
            .unwrap_or(0)
    }
}

/// Reorders arrival-order presentation timestamps into a lawful, monotonic
/// decode-timestamp sequence (spec.md §4.4.3): this reconstructs DTS for
/// streams whose B-frames arrive with PTS out of order.
pub fn derive_decode_timestamps(pts_in_arrival_order: &[i64]) -> Vec<i64> {
    let mut sorted = pts_in_arrival_order.to_vec();
    sorted.sort_unstable();
    sorted
}

/// Builds the `stts`/`ctts` run-length tables and the per-sample
/// `(dts, composition_offset)` pairs for one track's full sample list,
/// given the samples' PTS in arrival (ingest) order.
pub fn process_timestamps(samples: &[Sample]) -> (RleTable, RleTable, Vec<i64>) {
    let pts: Vec<i64> = samples.iter().map(|s| s.timestamp).collect();
    let dts = derive_decode_timestamps(&pts);

    let mut stts = RleTable::default();
    for i in 0..dts.len() {
        let delta = if i + 1 < dts.len() {
            dts[i + 1] - dts[i]
        } else if i > 0 {
            dts[i] - dts[i - 1]
        } else {
            0
        };
        stts.push(delta.max(0));
    }

    let mut ctts = RleTable::default();
    for (i, pts_i) in pts.iter().enumerate() {
        let offset = pts_i - dts[i];
        ctts.push(offset);
    }

    (stts, ctts, dts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn b_frame_pts_sequence_sorts_to_monotonic_dts() {
        let pts = vec![0, 80, 40, 120, 80];
        let dts = derive_decode_timestamps(&pts);
        assert_eq!(dts, vec![0, 40, 80, 80, 120]);
    }

    #[test]
    fn rle_table_keeps_singleton_run_between_equal_neighbors() {
        let mut t = RleTable::default();
        for v in [10, 10, 20, 10, 10] {
            t.push(v);
        }
        assert_eq!(
            t.entries,
            vec![
                RleEntry { sample_count: 2, value: 10 },
                RleEntry { sample_count: 1, value: 20 },
                RleEntry { sample_count: 2, value: 10 },
            ]
        );
        assert_eq!(t.expand(), vec![10, 10, 20, 10, 10]);
    }

    #[test]
    fn stts_expansion_reproduces_deltas_exactly() {
        let samples: Vec<Sample> = [0i64, 40, 80, 120]
            .iter()
            .map(|&ts| Sample {
                timestamp: ts,
                decode_timestamp: ts,
                duration: 40,
                data: Some(vec![]),
                size: 0,
                kind: SampleKind::Delta,
            })
            .collect();
        let (stts, _ctts, _dts) = process_timestamps(&samples);
        assert_eq!(stts.expand(), vec![40, 40, 40, 40]);
    }
}
