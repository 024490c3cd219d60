//! VP9 uncompressed-header color-space patching, per spec.md §4.4.6.
//!
//! VP9 key frames frequently omit color-space information the container
//! side already knows from the caller's `VideoDecoderConfig`. When the
//! bitstream's header shape matches what we expect for a key frame, this
//! patches the 3-bit color-space field in place; anything else (inter
//! frames, unexpected profile bits, a non-matching sync code) passes
//! through untouched. The patch is idempotent (spec.md §8.3): re-running it
//! re-derives and re-writes the same bits.

use crate::codec::VideoColorSpace;
use crate::isobmff::colorspace::vp9_color_space_field;

struct BitCursor<'a> {
    data: &'a [u8],
    bit_pos: usize,
}

impl<'a> BitCursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        BitCursor { data, bit_pos: 0 }
    }

    fn read(&mut self, bits: usize) -> Option<u32> {
        let mut value = 0u32;
        for _ in 0..bits {
            let byte_index = self.bit_pos / 8;
            if byte_index >= self.data.len() {
                return None;
            }
            let bit_index = 7 - (self.bit_pos % 8);
            let bit = (self.data[byte_index] >> bit_index) & 1;
            value = (value << 1) | bit as u32;
            self.bit_pos += 1;
        }
        Some(value)
    }
}

/// Attempts to patch the color-space field of a VP9 key frame's
/// uncompressed header in place. Returns the possibly-patched bytes;
/// returns the input unchanged if the shape doesn't match or `color_space`
/// is `None`.
pub fn patch_key_frame_color_space(data: &[u8], color_space: Option<&VideoColorSpace>) -> Vec<u8> {
    let Some(cs) = color_space else {
        return data.to_vec();
    };
    let mut out = data.to_vec();
    let Some(bit_offset) = color_space_bit_offset(data) else {
        return out;
    };
    let field = vp9_color_space_field(cs);
    write_3_bits(&mut out, bit_offset, field);
    out
}

/// Locates the bit offset of the 3-bit color-space field in a VP9
/// key-frame uncompressed header, if this looks like one: 2-bit frame
/// marker `0b10`, profile bits, `show_existing_frame = 0`, `frame_type = 0`
/// (key frame), and the 24-bit sync code `0x498342`.
fn color_space_bit_offset(data: &[u8]) -> Option<usize> {
    let mut cur = BitCursor::new(data);
    let marker = cur.read(2)?;
    if marker != 0b10 {
        return None;
    }
    let profile_low = cur.read(1)?;
    let profile_high = cur.read(1)?;
    let profile = profile_low | (profile_high << 1);
    if profile == 3 {
        // reserved zero bit only present for profile 3
        cur.read(1)?;
    }
    let show_existing_frame = cur.read(1)?;
    if show_existing_frame != 0 {
        return None;
    }
    let frame_type = cur.read(1)?;
    if frame_type != 0 {
        return None;
    }
    // show_frame, error_resilient_mode
    cur.read(1)?;
    cur.read(1)?;

    let mut sync = 0u32;
    for _ in 0..3 {
        sync = (sync << 8) | cur.read(8)?;
    }
    if sync != 0x498342 {
        return None;
    }

    if profile >= 2 {
        // ten_or_twelve_bit, present only for profile >= 2
        cur.read(1)?;
    }

    Some(cur.bit_pos)
}

fn write_3_bits(data: &mut [u8], bit_offset: usize, value: u8) {
    for i in 0..3 {
        let bit = (value >> (2 - i)) & 1;
        let pos = bit_offset + i;
        let byte_index = pos / 8;
        if byte_index >= data.len() {
            return;
        }
        let bit_index = 7 - (pos % 8);
        if bit == 1 {
            data[byte_index] |= 1 << bit_index;
        } else {
            data[byte_index] &= !(1 << bit_index);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::{ColorPrimaries, MatrixCoefficients, TransferCharacteristics};

    fn sample_profile0_key_frame() -> Vec<u8> {
        // marker=10, profile_low=0, profile_high=0, show_existing=0,
        // frame_type=0 (key), show_frame=1, error_resilient=0,
        // sync=0x498342, then 3 color-space bits + rest padding.
        // bits: 10 0 0 0 0 1 0  | 0100 1001 1000 0011 0100 0010 | 000 (cs) ...
        let bits = "10000010\
                     010010011000001101000010\
                     000";
        bits_to_bytes(bits)
    }

    fn bits_to_bytes(bits: &str) -> Vec<u8> {
        let mut bytes = Vec::new();
        let mut acc = 0u8;
        let mut count = 0;
        for c in bits.chars() {
            acc = (acc << 1) | if c == '1' { 1 } else { 0 };
            count += 1;
            if count == 8 {
                bytes.push(acc);
                acc = 0;
                count = 0;
            }
        }
        if count > 0 {
            acc <<= 8 - count;
            bytes.push(acc);
        }
        bytes
    }

    #[test]
    fn patch_is_idempotent() {
        let data = sample_profile0_key_frame();
        let cs = VideoColorSpace {
            primaries: ColorPrimaries::Bt709,
            transfer: TransferCharacteristics::Bt709,
            matrix: MatrixCoefficients::Bt709,
            full_range: false,
        };
        let once = patch_key_frame_color_space(&data, Some(&cs));
        let twice = patch_key_frame_color_space(&once, Some(&cs));
        assert_eq!(once, twice);
    }

    #[test]
    fn non_key_frame_passes_through() {
        // marker=10, profile bits = 00, show_existing=0, frame_type=1 (inter)
        let data = bits_to_bytes("1000001");
        let out = patch_key_frame_color_space(
            &data,
            Some(&VideoColorSpace {
                primaries: ColorPrimaries::Bt709,
                transfer: TransferCharacteristics::Bt709,
                matrix: MatrixCoefficients::Bt709,
                full_range: false,
            }),
        );
        assert_eq!(out, data);
    }
}
