//! WebVTT-in-MP4 sample synthesis, per spec.md §4.4.5.
//!
//! Cues may overlap; the `wvtt` sample stream demands non-overlapping
//! samples. Each synthesized sample is a flat run of `vttc`/`vtte` boxes
//! covering `[start, end)`, built by repeatedly taking the two earliest
//! distinct cue-boundary timestamps still queued.
//!
//! §4.4.5 step 2 says "if `until < sampleEnd`, wait for more input" without
//! defining `until`. This reads it as the synthesizer's boundary horizon:
//! with cues arriving start-ordered, a third distinct timestamp beyond
//! `sampleEnd` is what proves no not-yet-arrived cue can still start before
//! it — so we hold back until either a third timestamp appears or the track
//! closes.

use std::collections::{BTreeSet, HashMap};

use crate::codec::SubtitleCue;
use crate::error::Result;
use crate::isobmff::boxwriter::Box;

struct QueuedCue {
    id: u64,
    cue: SubtitleCue,
}

/// Per-track WebVTT sample synthesizer state (spec.md §3's "subtitle cue
/// queue with `lastCueEndTimestamp`, `nextSourceId`, and a cue→sourceId
/// map").
#[derive(Default)]
pub struct VttSynthesizer {
    queue: Vec<QueuedCue>,
    next_id: u64,
    last_cue_end_timestamp: i64,
    next_source_id: u32,
    source_ids: HashMap<u64, u32>,
}

/// One synthesized subtitle sample, ready to hand to the track's sample
/// table as an ordinary encoded unit.
pub struct VttSample {
    pub timestamp: i64,
    pub duration: u64,
    pub data: Vec<u8>,
}

impl VttSynthesizer {
    pub fn push_cue(&mut self, cue: SubtitleCue) {
        let id = self.next_id;
        self.next_id += 1;
        self.queue.push(QueuedCue { id, cue });
    }

    fn distinct_boundaries(&self) -> Vec<i64> {
        let mut set = BTreeSet::new();
        for qc in &self.queue {
            let start = qc.cue.timestamp.max(self.last_cue_end_timestamp);
            let end = qc.cue.end();
            if end > self.last_cue_end_timestamp {
                set.insert(start);
                set.insert(end);
            }
        }
        set.into_iter().collect()
    }

    /// Drains as many samples as can be produced without more input. Pass
    /// `closing = true` from `onTrackClose` to drain everything regardless
    /// of the lookahead requirement.
    pub fn drain_ready(&mut self, closing: bool) -> Result<Vec<VttSample>> {
        let mut out = Vec::new();
        loop {
            let boundaries = self.distinct_boundaries();
            if boundaries.len() < 2 {
                break;
            }
            if !closing && boundaries.len() < 3 {
                break;
            }
            let sample_start = boundaries[0];
            let sample_end = boundaries[1];
            out.extend(self.emit_interval(sample_start, sample_end)?);
        }
        Ok(out)
    }

    fn emit_interval(&mut self, start: i64, end: i64) -> Result<Vec<VttSample>> {
        let mut out = Vec::new();

        if self.last_cue_end_timestamp < start {
            out.push(VttSample {
                timestamp: self.last_cue_end_timestamp,
                duration: (start - self.last_cue_end_timestamp) as u64,
                data: Box::leaf(b"vtte", vec![]).to_bytes()?,
            });
        }

        let mut boxes: Vec<Box> = Vec::new();
        let mut still_pending = Vec::new();
        for qc in self.queue.drain(..) {
            let overlaps = qc.cue.timestamp < end && qc.cue.end() > start;
            if !overlaps {
                still_pending.push(qc);
                continue;
            }
            let crosses_boundary = qc.cue.end() > end;
            let source_id = if crosses_boundary {
                Some(*self.source_ids.entry(qc.id).or_insert_with(|| {
                    self.next_source_id += 1;
                    self.next_source_id
                }))
            } else {
                self.source_ids.remove(&qc.id)
            };
            boxes.extend(vttc_boxes(&qc.cue, source_id));
            if crosses_boundary {
                still_pending.push(qc);
            }
        }
        self.queue = still_pending;

        let mut data = Vec::new();
        for b in &boxes {
            data.extend(b.to_bytes()?);
        }
        out.push(VttSample {
            timestamp: start,
            duration: (end - start) as u64,
            data,
        });

        self.last_cue_end_timestamp = end;
        Ok(out)
    }
}

/// A cue's boxes in sample order: `vtta` (per ISO/IEC 14496-30, a cue's
/// interstitial notes are a box preceding `vttc`, never nested inside it)
/// followed by the `vttc` cue box itself.
fn vttc_boxes(cue: &SubtitleCue, source_id: Option<u32>) -> Vec<Box> {
    let mut out = Vec::new();
    if let Some(notes) = &cue.notes {
        out.push(Box::leaf(b"vtta", notes.as_bytes().to_vec()));
    }
    out.push(vttc_box(cue, source_id));
    out
}

fn vttc_box(cue: &SubtitleCue, source_id: Option<u32>) -> Box {
    let mut children = vec![Some(Box::leaf(b"payl", cue.text.as_bytes().to_vec()))];
    if let Some(identifier) = &cue.identifier {
        children.push(Some(Box::leaf(b"iden", identifier.as_bytes().to_vec())));
    }
    if let Some(settings) = &cue.settings {
        children.push(Some(Box::leaf(b"sttg", settings.as_bytes().to_vec())));
    }
    if cue.text.contains('<') {
        children.push(Some(Box::leaf(
            b"ctim",
            format_vtt_timestamp(cue.timestamp).into_bytes(),
        )));
    }
    if let Some(id) = source_id {
        children.push(Some(Box::leaf(b"vsid", id.to_be_bytes().to_vec())));
    }
    Box::container(b"vttc", children)
}

fn format_vtt_timestamp(micros: i64) -> String {
    let total_ms = micros / 1000;
    let ms = total_ms % 1000;
    let total_s = total_ms / 1000;
    let s = total_s % 60;
    let total_m = total_s / 60;
    let m = total_m % 60;
    let h = total_m / 60;
    format!("{h:02}:{m:02}:{s:02}.{ms:03}")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cue(start_ms: i64, end_ms: i64, text: &str) -> SubtitleCue {
        SubtitleCue {
            text: text.to_string(),
            timestamp: start_ms * 1000,
            duration: (end_ms - start_ms) as u64 * 1000,
            identifier: None,
            settings: None,
            notes: None,
        }
    }

    #[test]
    fn non_overlapping_cues_wait_for_third_boundary() {
        let mut s = VttSynthesizer::default();
        s.push_cue(cue(0, 1000, "hello"));
        assert!(s.drain_ready(false).unwrap().is_empty());
        s.push_cue(cue(1000, 2000, "world"));
        let samples = s.drain_ready(false).unwrap();
        assert_eq!(samples.len(), 1);
        assert_eq!(samples[0].timestamp, 0);
        assert_eq!(samples[0].duration, 1_000_000);
    }

    #[test]
    fn gap_before_first_cue_emits_vtte() {
        let mut s = VttSynthesizer::default();
        s.last_cue_end_timestamp = 0;
        s.push_cue(cue(500, 1000, "late"));
        s.push_cue(cue(1000, 1500, "next"));
        let samples = s.drain_ready(false).unwrap();
        assert_eq!(samples.len(), 2);
        assert_eq!(samples[0].duration, 500_000);
    }

    #[test]
    fn three_overlapping_cues_split_into_four_exact_intervals() {
        let mut s = VttSynthesizer::default();
        s.push_cue(cue(0, 2000, "long"));
        s.push_cue(cue(1000, 1500, "short"));
        s.push_cue(cue(1500, 3000, "tail"));
        let samples = s.drain_ready(true).unwrap();

        // [0,1000): "long" alone, crossing the boundary so it carries a vsid.
        // [1000,1500): "long" (same vsid) + "short" (fully consumed, no vsid).
        // [1500,2000): "long" closes out (vsid reused) + "tail" opens (new vsid).
        // [2000,3000): "tail" alone, fully consumed.
        assert_eq!(samples.len(), 4);
        assert_eq!((samples[0].timestamp, samples[0].duration), (0, 1_000_000));
        assert_eq!((samples[1].timestamp, samples[1].duration), (1_000_000, 500_000));
        assert_eq!((samples[2].timestamp, samples[2].duration), (1_500_000, 500_000));
        assert_eq!((samples[3].timestamp, samples[3].duration), (2_000_000, 1_000_000));

        assert!(samples[0].data.windows(4).any(|w| w == b"vsid"));
        assert!(samples[0].data.windows(4).any(|w| w == b"long"));
        assert!(samples[1].data.windows(4).any(|w| w == b"long"));
        assert!(samples[1].data.windows(5).any(|w| w == b"short"));
        assert!(samples[1].data.windows(4).any(|w| w == b"vsid"));
        assert!(samples[2].data.windows(4).any(|w| w == b"long"));
        assert!(samples[2].data.windows(4).any(|w| w == b"tail"));
        assert!(samples[3].data.windows(4).any(|w| w == b"tail"));
        // No more cues and no gap, so nothing further is produced.
        assert!(s.drain_ready(true).unwrap().is_empty());
    }

    #[test]
    fn notes_emit_as_a_sibling_box_preceding_vttc() {
        let mut c = cue(0, 1000, "hi");
        c.notes = Some("side note".to_string());
        let boxes = vttc_boxes(&c, None);
        assert_eq!(boxes.len(), 2);
        assert_eq!(&boxes[0].kind, b"vtta");
        assert_eq!(&boxes[1].kind, b"vttc");
        if let crate::isobmff::boxwriter::BoxPayload::Children(children) = &boxes[1].payload {
            assert!(!children
                .iter()
                .flatten()
                .any(|child| &child.kind == b"vtta"));
        } else {
            panic!("vttc box should carry a children payload");
        }
    }

    #[test]
    fn closing_drains_without_third_boundary() {
        let mut s = VttSynthesizer::default();
        s.push_cue(cue(0, 1000, "only"));
        let samples = s.drain_ready(true).unwrap();
        assert_eq!(samples.len(), 1);
    }
}
