use crate::error::{MuxError, Result};

/// Per-track timestamp bookkeeping for [`validate_and_normalize_timestamp`],
/// per spec.md §4.7.
#[derive(Debug, Default)]
pub struct TimestampState {
    offset: Option<i64>,
    max_timestamp: i64,
    last_key_frame_timestamp: i64,
    seen_any: bool,
}

/// Whether a format requires every track's first (normalized) timestamp to
/// be exactly zero. ISOBMFF does; Matroska/WebM do not (spec.md §4.7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ZeroStartPolicy {
    MustStartAtZero,
    Unconstrained,
}

/// Validates and normalizes a raw producer timestamp for one track,
/// enforcing spec.md §3 invariants 2–4 and §4.7's rules.
///
/// `offset_to_first` models "live capture sources opt into offsetting":
/// when true, the track's first observed timestamp is subtracted from every
/// subsequent one so the stream starts at (or near) zero.
pub fn validate_and_normalize_timestamp(
    track_id: u32,
    state: &mut TimestampState,
    raw_micros: i64,
    is_key_frame: bool,
    offset_to_first: bool,
    zero_start: ZeroStartPolicy,
) -> Result<i64> {
    if !state.seen_any && !is_key_frame {
        return Err(MuxError::timestamp_ordering(
            track_id,
            "first encoded unit for a track must be a key frame",
        ));
    }

    if !state.seen_any && offset_to_first {
        state.offset = Some(raw_micros);
    }

    let ts = raw_micros - state.offset.unwrap_or(0);

    if ts < 0 {
        return Err(MuxError::timestamp_ordering(
            track_id,
            format!("timestamp {ts} is negative after offsetting"),
        ));
    }

    if zero_start == ZeroStartPolicy::MustStartAtZero && !state.seen_any && ts != 0 {
        return Err(MuxError::timestamp_ordering(
            track_id,
            format!("first timestamp must be 0 for this format, got {ts}"),
        ));
    }

    if state.seen_any && ts < state.last_key_frame_timestamp {
        return Err(MuxError::timestamp_ordering(
            track_id,
            format!(
                "timestamp {ts} precedes last key frame timestamp {}",
                state.last_key_frame_timestamp
            ),
        ));
    }

    if is_key_frame && state.seen_any && ts < state.max_timestamp {
        return Err(MuxError::timestamp_ordering(
            track_id,
            format!(
                "key frame timestamp {ts} rewinds past max seen timestamp {}",
                state.max_timestamp
            ),
        ));
    }

    if !state.seen_any || ts > state.max_timestamp {
        state.max_timestamp = ts;
    }
    if is_key_frame {
        state.last_key_frame_timestamp = ts;
    }
    state.seen_any = true;

    Ok(ts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_unit_must_be_key_frame() {
        let mut st = TimestampState::default();
        let err = validate_and_normalize_timestamp(
            1,
            &mut st,
            0,
            false,
            false,
            ZeroStartPolicy::MustStartAtZero,
        )
        .unwrap_err();
        assert!(matches!(err, MuxError::TimestampOrdering { .. }));
    }

    #[test]
    fn offsetting_shifts_stream_to_zero() {
        let mut st = TimestampState::default();
        let ts = validate_and_normalize_timestamp(
            1,
            &mut st,
            5_000,
            true,
            true,
            ZeroStartPolicy::MustStartAtZero,
        )
        .unwrap();
        assert_eq!(ts, 0);
        let ts2 =
            validate_and_normalize_timestamp(1, &mut st, 6_000, false, true, ZeroStartPolicy::MustStartAtZero)
                .unwrap();
        assert_eq!(ts2, 1_000);
    }

    #[test]
    fn b_frames_may_reorder_but_key_frames_may_not_rewind() {
        let mut st = TimestampState::default();
        validate_and_normalize_timestamp(1, &mut st, 0, true, false, ZeroStartPolicy::Unconstrained)
            .unwrap();
        // delta frame may arrive "behind" the key frame's presentation time
        validate_and_normalize_timestamp(1, &mut st, 0, false, false, ZeroStartPolicy::Unconstrained)
            .unwrap();
        // a key frame may not precede any previously seen timestamp
        let err = validate_and_normalize_timestamp(
            1,
            &mut st,
            -1,
            true,
            false,
            ZeroStartPolicy::Unconstrained,
        );
        assert!(err.is_err());
    }

    #[test]
    fn mp4_requires_zero_start_mkv_does_not() {
        let mut st = TimestampState::default();
        assert!(validate_and_normalize_timestamp(
            1,
            &mut st,
            10,
            true,
            false,
            ZeroStartPolicy::MustStartAtZero
        )
        .is_err());

        let mut st2 = TimestampState::default();
        assert!(validate_and_normalize_timestamp(
            1,
            &mut st2,
            10,
            true,
            false,
            ZeroStartPolicy::Unconstrained
        )
        .is_ok());
    }
}
