//! Fragment (`moof`/`traf`/`tfhd`/`trun`) and random-access index
//! (`mfra`/`tfra`) construction, per spec.md §4.4.2/§4.4.4/§4.4.7.
//!
//! `trun`'s per-sample `data_offset` is relative to the enclosing `moof`
//! (the `default-base-is-moof` flag, 0x20000, set on every `tfhd` here), and
//! since every sample in a fragment is already known before any of it is
//! written, the offset is computed by measuring the fragment's `moof` once
//! with a placeholder offset and rebuilding it with the real one — the same
//! two-pass approach the in-memory layout uses for `moov`, rather than a
//! `Writer::patch()` call after the fact.

use crate::codec::SampleKind;
use crate::isobmff::boxwriter::{prim, Box};

/// One sample queued for emission inside a single track fragment.
#[derive(Debug, Clone)]
pub struct FragSample {
    pub duration: u32,
    pub size: u32,
    pub composition_offset: i32,
    pub kind: SampleKind,
}

const SAMPLE_FLAGS_KEY: u32 = 0x0200_0000; // sample_depends_on = 2 (I-frame), not redundant
const SAMPLE_FLAGS_DELTA: u32 = 0x0101_0000; // sample_depends_on = 1, sample_is_non_sync = 1

fn sample_flags(kind: SampleKind) -> u32 {
    match kind {
        SampleKind::Key => SAMPLE_FLAGS_KEY,
        SampleKind::Delta => SAMPLE_FLAGS_DELTA,
    }
}

fn tfhd(track_id: u32, default_duration: u32, default_size: u32, default_flags: u32) -> Box {
    // flags: default-base-is-moof (0x20000) | default-sample-duration-present (0x8)
    // | default-sample-size-present (0x10) | default-sample-flags-present (0x20)
    let flags = 0x02_0000 | 0x08 | 0x10 | 0x20;
    let mut bytes = prim::u32(track_id);
    bytes.extend(prim::u32(default_duration));
    bytes.extend(prim::u32(default_size));
    bytes.extend(prim::u32(default_flags));
    Box::full_leaf(b"tfhd", 0, flags, bytes)
}

fn trun(samples: &[FragSample], data_offset: i32) -> Box {
    let present_duration = samples.windows(2).any(|w| w[0].duration != w[1].duration);
    let present_size = samples.windows(2).any(|w| w[0].size != w[1].size);
    let any_nonzero_offset = samples.iter().any(|s| s.composition_offset != 0);

    let first_flags = samples.first().map(|s| sample_flags(s.kind)).unwrap_or(0);
    let rest_uniform = samples
        .get(1..)
        .unwrap_or(&[])
        .windows(2)
        .all(|w| sample_flags(w[0].kind) == sample_flags(w[1].kind));
    let first_differs_from_rest = samples.len() > 1
        && rest_uniform
        && sample_flags(samples[1].kind) != first_flags;
    // Per-sample flags are only needed when the rest of the run isn't uniform
    // (first-sample-flags covers a lone differing leading sample).
    let present_flags = !rest_uniform;

    let mut flags: u32 = 0x01; // data-offset-present
    if first_differs_from_rest {
        flags |= 0x04;
    }
    if present_duration {
        flags |= 0x100;
    }
    if present_size {
        flags |= 0x200;
    }
    if present_flags {
        flags |= 0x400;
    }
    if any_nonzero_offset {
        flags |= 0x800;
    }

    let mut bytes = prim::u32(samples.len() as u32);
    bytes.extend(data_offset.to_be_bytes());
    if first_differs_from_rest {
        bytes.extend(prim::u32(first_flags));
    }
    for s in samples {
        if present_duration {
            bytes.extend(prim::u32(s.duration));
        }
        if present_size {
            bytes.extend(prim::u32(s.size));
        }
        if present_flags {
            bytes.extend(prim::u32(sample_flags(s.kind)));
        }
        if any_nonzero_offset {
            bytes.extend(prim::i32(s.composition_offset));
        }
    }
    Box::full_leaf(b"trun", if any_nonzero_offset { 1 } else { 0 }, flags, bytes)
}

fn traf(track_id: u32, samples: &[FragSample], data_offset: i32) -> Box {
    let default_duration = samples.first().map(|s| s.duration).unwrap_or(0);
    let default_size = samples.first().map(|s| s.size).unwrap_or(0);
    let default_flags = samples.first().map(|s| sample_flags(s.kind)).unwrap_or(0);
    Box::container(
        b"traf",
        vec![
            Some(tfhd(track_id, default_duration, default_size, default_flags)),
            Some(trun(samples, data_offset)),
        ],
    )
}

fn mfhd(sequence_number: u32) -> Box {
    Box::full_leaf(b"mfhd", 0, 0, prim::u32(sequence_number))
}

/// One track's sample batch contributed to a single fragment.
pub struct TrackFragment {
    pub track_id: u32,
    pub samples: Vec<FragSample>,
}

/// Builds a fragment's `moof`, with every `trun.data_offset` already
/// resolved relative to the `moof`'s own start (the `mdat` header
/// immediately follows, unpadded, so `data_offset = moof_size + 8`).
pub fn build_moof(sequence_number: u32, tracks: &[TrackFragment]) -> Box {
    let placeholder: Vec<Option<Box>> = std::iter::once(Some(mfhd(sequence_number)))
        .chain(tracks.iter().map(|t| Some(traf(t.track_id, &t.samples, 0))))
        .collect();
    let placeholder_moof = Box::container(b"moof", placeholder);
    let moof_size = placeholder_moof.measure();
    let data_offset = (moof_size + 8) as i32;

    let real: Vec<Option<Box>> = std::iter::once(Some(mfhd(sequence_number)))
        .chain(
            tracks
                .iter()
                .map(|t| Some(traf(t.track_id, &t.samples, data_offset))),
        )
        .collect();
    Box::container(b"moof", real)
}

/// One `(time, moof_offset)` row of a track's `tfra` table.
#[derive(Debug, Clone, Copy)]
pub struct TfraEntry {
    pub time: u64,
    pub moof_offset: u64,
}

fn tfra(track_id: u32, entries: &[TfraEntry]) -> Box {
    let mut bytes = prim::u32(track_id);
    // length_size_of_traf_num, length_size_of_trun_num, length_size_of_sample_num: all 0 (1 byte each)
    bytes.extend(prim::u32(0));
    bytes.extend(prim::u32(entries.len() as u32));
    for e in entries {
        bytes.extend(prim::u64(e.time));
        bytes.extend(prim::u64(e.moof_offset));
        bytes.push(1); // traf_number
        bytes.push(1); // trun_number
        bytes.push(1); // sample_number
    }
    Box::full_leaf(b"tfra", 1, 0, bytes)
}

fn mfro(mfra_size: u32) -> Box {
    Box::full_leaf(b"mfro", 0, 0, prim::u32(mfra_size))
}

/// Builds the trailing `mfra` box (spec.md §4.4.2's finalize step), with
/// `mfro`'s size field patched to the real measured size of the whole box.
pub fn build_mfra(per_track: &[(u32, Vec<TfraEntry>)]) -> Box {
    let mut children: Vec<Option<Box>> = per_track
        .iter()
        .map(|(id, entries)| Some(tfra(*id, entries)))
        .collect();

    // mfro's own size (16 bytes: 8-byte header + 4-byte version/flags + 4-byte
    // size field) doesn't depend on the value written into it, so one
    // measurement pass is enough to know the whole mfra's final size.
    let tfra_len: u64 = children.iter().flatten().map(Box::measure).sum();
    let mfra_total = 8 + tfra_len + 16;
    children.push(Some(mfro(mfra_total as u32)));
    Box::container(b"mfra", children)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn moof_write_length_matches_its_own_measurement() {
        use crate::writer::{BufferTarget, Writer};

        let tracks = vec![TrackFragment {
            track_id: 1,
            samples: vec![
                FragSample {
                    duration: 40,
                    size: 100,
                    composition_offset: 0,
                    kind: SampleKind::Key,
                },
                FragSample {
                    duration: 40,
                    size: 50,
                    composition_offset: 0,
                    kind: SampleKind::Delta,
                },
            ],
        }];
        let moof = build_moof(1, &tracks);
        let measured = moof.measure();
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        moof.write(&mut w).unwrap();
        w.finalize().unwrap();
        // Rebuilding with the real data_offset must not change moof's size,
        // since data_offset is a fixed-width field regardless of its value.
        assert_eq!(measured, w.end_pos());
    }

    #[test]
    fn trun_omits_uniform_duration_field() {
        let samples = vec![
            FragSample {
                duration: 40,
                size: 10,
                composition_offset: 0,
                kind: SampleKind::Key,
            },
            FragSample {
                duration: 40,
                size: 20,
                composition_offset: 0,
                kind: SampleKind::Delta,
            },
        ];
        let t = trun(&samples, 0);
        // sample-size-present bit (0x200) set, sample-duration-present (0x100) not.
        if let Some((_, flags)) = t.full {
            assert_eq!(flags & 0x100, 0);
            assert_eq!(flags & 0x200, 0x200);
        } else {
            panic!("trun must be a FullBox");
        }
    }

    #[test]
    fn mfra_size_field_accounts_for_mfro_itself() {
        let mfra = build_mfra(&[(1, vec![TfraEntry { time: 0, moof_offset: 100 }])]);
        assert!(mfra.measure() > 0);
    }
}
