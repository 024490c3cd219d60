//! Box/element primitives and the nested Box tree model, per spec.md §4.2.
//!
//! Rather than writing directly into a `Write + Seek` cursor and patching by
//! seeking back, this crate builds an explicit [`Box`] tree first and
//! measures/writes/patches it against a [`crate::writer::Writer`] — the
//! "ad-hoc arrays" shape DESIGN NOTES §9 calls for, needed because the
//! fragmented and in-memory layouts must measure a box's size before any of
//! its bytes reach the target.

use crate::error::Result;
use crate::writer::Writer;

/// The body of a [`Box`]: nested children, a raw byte payload, or (for
/// `dref`/`stsd`-shaped boxes) a fixed byte prefix followed by children.
pub enum BoxPayload {
    Children(Vec<Option<Box>>),
    Bytes(Vec<u8>),
    PrefixedChildren(Vec<u8>, Vec<Option<Box>>),
}

/// A nested, size-prefixed, four-character-type-tagged ISOBMFF box.
///
/// `full` carries `(version, flags)` for `FullBox`-family boxes (prefixed
/// ahead of the payload). `large_size` forces the 8-byte 64-bit size form
/// even when the value would fit in 32 bits (spec.md §4.2).
pub struct Box {
    pub kind: [u8; 4],
    pub payload: BoxPayload,
    pub full: Option<(u8, u32)>,
    pub large_size: bool,
}

impl Box {
    pub fn leaf(kind: &[u8; 4], bytes: Vec<u8>) -> Self {
        Box {
            kind: *kind,
            payload: BoxPayload::Bytes(bytes),
            full: None,
            large_size: false,
        }
    }

    pub fn full_leaf(kind: &[u8; 4], version: u8, flags: u32, bytes: Vec<u8>) -> Self {
        Box {
            kind: *kind,
            payload: BoxPayload::Bytes(bytes),
            full: Some((version, flags)),
            large_size: false,
        }
    }

    pub fn container(kind: &[u8; 4], children: Vec<Option<Box>>) -> Self {
        Box {
            kind: *kind,
            payload: BoxPayload::Children(children),
            full: None,
            large_size: false,
        }
    }

    /// A `FullBox` whose payload is a fixed prefix (e.g. an entry count)
    /// followed by nested children, like `dref` or `stsd`.
    pub fn full_prefixed(
        kind: &[u8; 4],
        version: u8,
        flags: u32,
        prefix: Vec<u8>,
        children: Vec<Option<Box>>,
    ) -> Self {
        Box {
            kind: *kind,
            payload: BoxPayload::PrefixedChildren(prefix, children),
            full: Some((version, flags)),
            large_size: false,
        }
    }

    /// A plain box whose payload is a fixed prefix (sample-entry reserved
    /// fields) followed by nested children (codec configuration boxes).
    pub fn prefixed(kind: &[u8; 4], prefix: Vec<u8>, children: Vec<Option<Box>>) -> Self {
        Box {
            kind: *kind,
            payload: BoxPayload::PrefixedChildren(prefix, children),
            full: None,
            large_size: false,
        }
    }

    pub fn with_large_size(mut self) -> Self {
        self.large_size = true;
        self
    }

    fn payload_len(&self) -> u64 {
        let body_len = match &self.payload {
            BoxPayload::Bytes(b) => b.len() as u64,
            BoxPayload::Children(children) => {
                children.iter().flatten().map(Box::measure).sum::<u64>()
            }
            BoxPayload::PrefixedChildren(prefix, children) => {
                prefix.len() as u64 + children.iter().flatten().map(Box::measure).sum::<u64>()
            }
        };
        let full_len = if self.full.is_some() { 4 } else { 0 };
        body_len + full_len
    }

    /// Total encoded size of this box, without writing it anywhere.
    pub fn measure(&self) -> u64 {
        let header_len = if self.large_size { 16 } else { 8 };
        header_len + self.payload_len()
    }

    /// Writes this box (header + payload) to `writer`, returning the
    /// absolute offset its size-field header started at (used by callers
    /// that need to patch it later, e.g. a reserved-size `mdat`).
    pub fn write(&self, writer: &mut Writer) -> Result<u64> {
        let header_offset = writer.get_pos();
        let total = self.measure();
        if self.large_size {
            writer.write(&1u32.to_be_bytes())?;
            writer.write(&self.kind)?;
            writer.write(&total.to_be_bytes())?;
        } else {
            writer.write(&(total as u32).to_be_bytes())?;
            writer.write(&self.kind)?;
        }
        if let Some((version, flags)) = self.full {
            writer.write(&[version])?;
            writer.write(&flags.to_be_bytes()[1..4])?;
        }
        match &self.payload {
            BoxPayload::Bytes(b) => writer.write(b)?,
            BoxPayload::Children(children) => {
                for child in children.iter().flatten() {
                    child.write(writer)?;
                }
            }
            BoxPayload::PrefixedChildren(prefix, children) => {
                writer.write(prefix)?;
                for child in children.iter().flatten() {
                    child.write(writer)?;
                }
            }
        }
        Ok(header_offset)
    }

    /// Encodes this box standalone, for callers that need its bytes as an
    /// opaque blob rather than writing it as part of a larger tree — e.g. a
    /// synthesized WebVTT sample's `mdat` payload.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use crate::writer::{BufferTarget, Writer};
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        self.write(&mut w)?;
        w.finalize()?;
        Ok(w.get_slice(0, w.end_pos()).unwrap_or_default())
    }
}

/// Big-endian primitive encoders, per spec.md §4.2.
pub mod prim {
    pub fn u8(v: u8) -> Vec<u8> {
        vec![v]
    }
    pub fn u16(v: u16) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
    pub fn u24(v: u32) -> Vec<u8> {
        v.to_be_bytes()[1..4].to_vec()
    }
    pub fn u32(v: u32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
    pub fn i16(v: i16) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
    pub fn i32(v: i32) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }
    pub fn u64(v: u64) -> Vec<u8> {
        v.to_be_bytes().to_vec()
    }

    /// 8.8 fixed point.
    pub fn fixed_8_8(v: f64) -> Vec<u8> {
        u16(((v * 256.0).round() as i64) as u16)
    }

    /// 16.16 fixed point.
    pub fn fixed_16_16(v: f64) -> Vec<u8> {
        u32(((v * 65536.0).round() as i64) as u32)
    }

    /// 2.30 fixed point, used by the third column of each `tkhd`/`mvhd`
    /// transformation matrix row.
    pub fn fixed_2_30(v: f64) -> Vec<u8> {
        u32(((v * 1_073_741_824.0).round() as i64) as u32)
    }

    /// ISOBMFF variable-length unsigned integer: 7 payload bits per byte,
    /// high bit set on every non-terminal byte. `min_len`, when given, pads
    /// with leading continuation bytes carrying zero payload.
    pub fn var_uint(mut v: u64, min_len: Option<usize>) -> Vec<u8> {
        let mut bytes = Vec::new();
        loop {
            bytes.push((v & 0x7f) as u8);
            v >>= 7;
            if v == 0 {
                break;
            }
        }
        while bytes.len() < min_len.unwrap_or(0) {
            bytes.push(0);
        }
        bytes.reverse();
        let last = bytes.len() - 1;
        for b in &mut bytes[..last] {
            *b |= 0x80;
        }
        bytes
    }
}

/// The 3x3 transformation matrix for a video track, per spec.md §4.2/§6.2:
/// columns are fixed-16.16 except the third entry of each row, which is
/// fixed-2.30. Identity is emitted when no rotation is requested.
pub fn rotation_matrix(degrees: u16) -> [u8; 36] {
    let radians = (degrees as f64) * std::f64::consts::PI / 180.0;
    let (sin, cos) = radians.sin_cos();
    let mut out = Vec::with_capacity(36);
    out.extend(prim::fixed_16_16(cos));
    out.extend(prim::fixed_16_16(sin));
    out.extend(prim::fixed_2_30(0.0));
    out.extend(prim::fixed_16_16(-sin));
    out.extend(prim::fixed_16_16(cos));
    out.extend(prim::fixed_2_30(0.0));
    out.extend(prim::fixed_16_16(0.0));
    out.extend(prim::fixed_16_16(0.0));
    out.extend(prim::fixed_2_30(1.0));
    out.try_into().unwrap()
}

/// Encodes an explicit caller-supplied 9-element integer matrix in the same
/// fixed-point layout as [`rotation_matrix`].
pub fn explicit_matrix(m: &[i32; 9]) -> [u8; 36] {
    let mut out = Vec::with_capacity(36);
    for (i, v) in m.iter().enumerate() {
        if i % 3 == 2 {
            out.extend(prim::u32(*v as u32));
        } else {
            out.extend(prim::u32(*v as u32));
        }
    }
    out.try_into().unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{BufferTarget, Writer};

    #[test]
    fn measure_matches_write_length() {
        let b = Box::full_leaf(b"tst1", 0, 0, vec![1, 2, 3, 4]);
        let measured = b.measure();
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        b.write(&mut w).unwrap();
        w.finalize().unwrap();
        assert_eq!(measured, w.end_pos());
    }

    #[test]
    fn large_size_uses_16_byte_header() {
        let b = Box::leaf(b"big1", vec![0; 10]).with_large_size();
        assert_eq!(b.measure(), 16 + 10);
    }

    #[test]
    fn var_uint_roundtrips_widths() {
        assert_eq!(prim::var_uint(0x7f, None), vec![0x7f]);
        assert_eq!(prim::var_uint(0x80, None), vec![0x81, 0x00]);
    }

    #[test]
    fn identity_matrix_has_unity_diagonal() {
        let m = rotation_matrix(0);
        assert_eq!(&m[0..4], &prim::fixed_16_16(1.0)[..]);
        assert_eq!(&m[16..20], &prim::fixed_16_16(1.0)[..]);
        assert_eq!(&m[32..36], &prim::fixed_2_30(1.0)[..]);
    }
}
