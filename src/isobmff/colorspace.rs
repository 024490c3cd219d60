//! Shared CICP-ish color mapping used by `colr`, `vpcC`'s color fields, and
//! Matroska's `Colour` element.
//!
//! `vpcC` previously always wrote "unspecified" (2) instead of deriving its
//! color fields from the supplied color space; all three call sites now go
//! through [`cicp_mapping`] so they never disagree.

use crate::codec::{ColorPrimaries, MatrixCoefficients, TransferCharacteristics, VideoColorSpace};

/// `(primaries, transfer, matrix)` CICP codepoints for a [`VideoColorSpace`].
pub fn cicp_mapping(cs: &VideoColorSpace) -> (u16, u16, u16) {
    let primaries = match cs.primaries {
        ColorPrimaries::Bt709 => 1,
        ColorPrimaries::Bt470Bg => 5,
        ColorPrimaries::Smpte170M => 6,
        ColorPrimaries::Rgb => 1,
    };
    let transfer = match cs.transfer {
        TransferCharacteristics::Bt709 => 1,
        TransferCharacteristics::Smpte170M => 6,
        TransferCharacteristics::Iec61966_2_1 => 13,
    };
    let matrix = match cs.matrix {
        MatrixCoefficients::Bt709 => 1,
        MatrixCoefficients::Bt470Bg => 5,
        MatrixCoefficients::Smpte170M => 6,
        MatrixCoefficients::Rgb => 0,
    };
    (primaries, transfer, matrix)
}

/// The 3-bit VP9 uncompressed-header color-space field value for a
/// [`VideoColorSpace`], per spec.md §4.4.6's `{rgb, bt709, bt470bg,
/// smpte170m}` mapping.
pub fn vp9_color_space_field(cs: &VideoColorSpace) -> u8 {
    match cs.primaries {
        ColorPrimaries::Rgb => 7,
        ColorPrimaries::Bt709 => 2,
        ColorPrimaries::Bt470Bg => 1,
        ColorPrimaries::Smpte170M => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bt709_maps_to_cicp_1_1_1() {
        let cs = VideoColorSpace {
            primaries: ColorPrimaries::Bt709,
            transfer: TransferCharacteristics::Bt709,
            matrix: MatrixCoefficients::Bt709,
            full_range: false,
        };
        assert_eq!(cicp_mapping(&cs), (1, 1, 1));
        assert_eq!(vp9_color_space_field(&cs), 2);
    }
}
