//! EBML element/varint primitives and the nested Element tree model, per
//! spec.md §4.3.
//!
//! Mirrors [`crate::isobmff::boxwriter`]'s shape (measure a tree before any
//! of its bytes reach the target, write it, patch a reserved size field
//! afterward) but for EBML's width-prefixed varints instead of ISOBMFF's
//! fixed 32/64-bit box sizes.

use crate::error::Result;
use crate::writer::Writer;

/// The body of an [`Element`]: nested children or one of EBML's scalar data
/// types.
pub enum ElementData {
    Children(Vec<Element>),
    UInt(u64),
    /// An unsigned int forced to a fixed byte width regardless of its
    /// current value — used for `SeekPosition`/similar fields that are
    /// written as a placeholder and patched once the real value is known,
    /// so the patch can never change the element's overall size.
    FixedUInt(u64, usize),
    SInt(i64),
    Float32(f32),
    Float64(f64),
    Ascii(String),
    Bytes(Vec<u8>),
}

/// A single EBML element. `id` is the element's raw ID value (the class
/// marker bits are already folded into its leading byte, e.g. `0x1A45DFA3`
/// for `EBML`, `0x80` for a single-byte id); [`id_bytes`] trims it to its
/// natural width.
///
/// `unknown_size`, when set on a `Children` element, writes the single-byte
/// `0xFF` "unknown size" marker instead of a patchable 4-byte size field —
/// used for streamable-mode `Segment`/`Cluster` (spec.md §4.5.5/§6.3).
pub struct Element {
    pub id: u32,
    pub data: ElementData,
    pub unknown_size: bool,
}

impl Element {
    pub fn children(id: u32, children: Vec<Element>) -> Self {
        Element { id, data: ElementData::Children(children), unknown_size: false }
    }

    pub fn unknown_size_children(id: u32, children: Vec<Element>) -> Self {
        Element { id, data: ElementData::Children(children), unknown_size: true }
    }

    pub fn uint(id: u32, v: u64) -> Self {
        Element { id, data: ElementData::UInt(v), unknown_size: false }
    }

    pub fn uint_fixed(id: u32, v: u64, width: usize) -> Self {
        Element { id, data: ElementData::FixedUInt(v, width), unknown_size: false }
    }

    pub fn sint(id: u32, v: i64) -> Self {
        Element { id, data: ElementData::SInt(v), unknown_size: false }
    }

    pub fn float32(id: u32, v: f32) -> Self {
        Element { id, data: ElementData::Float32(v), unknown_size: false }
    }

    pub fn float64(id: u32, v: f64) -> Self {
        Element { id, data: ElementData::Float64(v), unknown_size: false }
    }

    pub fn ascii(id: u32, s: impl Into<String>) -> Self {
        Element { id, data: ElementData::Ascii(s.into()), unknown_size: false }
    }

    pub fn bytes(id: u32, b: Vec<u8>) -> Self {
        Element { id, data: ElementData::Bytes(b), unknown_size: false }
    }

    fn data_len(&self) -> u64 {
        match &self.data {
            ElementData::Children(children) => children.iter().map(Element::measure).sum(),
            ElementData::UInt(v) => uint_bytes(*v).len() as u64,
            ElementData::FixedUInt(_, width) => *width as u64,
            ElementData::SInt(v) => sint_bytes(*v).len() as u64,
            ElementData::Float32(_) => 4,
            ElementData::Float64(_) => 8,
            ElementData::Ascii(s) => s.len() as u64,
            ElementData::Bytes(b) => b.len() as u64,
        }
    }

    fn size_field_len(&self) -> u64 {
        if self.unknown_size {
            1
        } else if matches!(self.data, ElementData::Children(_)) {
            4
        } else {
            vint(self.data_len(), None).len() as u64
        }
    }

    /// Total encoded size of this element, without writing it anywhere.
    pub fn measure(&self) -> u64 {
        id_bytes(self.id).len() as u64 + self.size_field_len() + self.data_len()
    }

    /// Writes id + size + payload to `writer`, returning the absolute offset
    /// the id field started at (needed to later patch a reserved size field
    /// via [`patch_size`]).
    pub fn write(&self, writer: &mut Writer) -> Result<u64> {
        let header_offset = writer.get_pos();
        writer.write(&id_bytes(self.id))?;
        if self.unknown_size {
            writer.write(&[0xFF])?;
        } else if matches!(self.data, ElementData::Children(_)) {
            writer.write(&vint(self.data_len(), Some(4)))?;
        } else {
            writer.write(&vint(self.data_len(), None))?;
        }
        match &self.data {
            ElementData::Children(children) => {
                for child in children {
                    child.write(writer)?;
                }
            }
            ElementData::UInt(v) => writer.write(&uint_bytes(*v))?,
            ElementData::FixedUInt(v, width) => writer.write(&v.to_be_bytes()[8 - width..])?,
            ElementData::SInt(v) => writer.write(&sint_bytes(*v))?,
            ElementData::Float32(v) => writer.write(&v.to_be_bytes())?,
            ElementData::Float64(v) => writer.write(&v.to_be_bytes())?,
            ElementData::Ascii(s) => writer.write(s.as_bytes())?,
            ElementData::Bytes(b) => writer.write(b)?,
        }
        Ok(header_offset)
    }

    /// Absolute offset this element's payload starts at, given the header
    /// offset [`Element::write`] returned for it. Used to locate a
    /// `FixedUInt`/`Float64` placeholder field for later patching.
    pub fn data_offset(&self, header_offset: u64) -> u64 {
        header_offset + id_bytes(self.id).len() as u64 + self.size_field_len()
    }

    /// Encodes this element standalone, for callers that need its bytes as
    /// an opaque blob (e.g. assembling a `BlockAdditional` payload before it
    /// is wrapped further).
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        use crate::writer::BufferTarget;
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        self.write(&mut w)?;
        w.finalize()?;
        Ok(w.get_slice(0, w.end_pos()).unwrap_or_default())
    }
}

/// Patches a `Children` element's reserved 4-byte size field once its actual
/// encoded length is known, given the absolute offset [`Element::write`]
/// returned for it.
pub fn patch_size(writer: &mut Writer, header_offset: u64, id: u32, actual_data_len: u64) -> Result<()> {
    let size_offset = header_offset + id_bytes(id).len() as u64;
    writer.patch(size_offset, &vint(actual_data_len, Some(4)))
}

/// Opens a container element whose content is written incrementally by
/// direct `Writer` calls rather than as a pre-built [`Element`] tree (used
/// for `Segment`/`Cluster`, whose children accrue over time). Returns the
/// header offset, to be passed to [`close_container`].
pub fn write_container_header(writer: &mut Writer, id: u32, unknown_size: bool) -> Result<u64> {
    let header_offset = writer.get_pos();
    writer.write(&id_bytes(id))?;
    if unknown_size {
        writer.write(&[0xFF])?;
    } else {
        writer.write(&vint(0, Some(4)))?;
    }
    Ok(header_offset)
}

/// Patches the reserved size field opened by [`write_container_header`] now
/// that every child has been written. A no-op for `unknown_size` containers
/// (streamable-mode `Segment`/`Cluster`), which stay unbounded by design.
pub fn close_container(writer: &mut Writer, header_offset: u64, id: u32, unknown_size: bool) -> Result<()> {
    if unknown_size {
        return Ok(());
    }
    let data_start = header_offset + id_bytes(id).len() as u64 + 4;
    let actual_len = writer.end_pos() - data_start;
    patch_size(writer, header_offset, id, actual_len)
}

/// Trims an EBML ID's natural big-endian width: the leading class-marker
/// bit (already folded into the id's value) determines the width, so this
/// is just "drop the leading zero bytes".
pub fn id_bytes(id: u32) -> Vec<u8> {
    let b = id.to_be_bytes();
    let first = b.iter().position(|&x| x != 0).unwrap_or(3);
    b[first..].to_vec()
}

/// EBML variable-width size descriptor: `width` top zero bits are implied by
/// the position of the leading `1` marker bit in the first byte, followed by
/// `7*width` payload bits (spec.md §4.3). `min_width` forces a wider-than-
/// necessary encoding, used to reserve space for later patching.
pub fn vint(value: u64, min_width: Option<usize>) -> Vec<u8> {
    let mut width = 1usize;
    while width < 8 && value > (1u64 << (7 * width)) - 2 {
        width += 1;
    }
    width = width.max(min_width.unwrap_or(1));
    let mut bytes = vec![0u8; width];
    for i in (0..width).rev() {
        bytes[i] = ((value >> (8 * (width - 1 - i))) & 0xff) as u8;
    }
    bytes[0] |= 1 << (8 - width);
    bytes
}

/// Minimal big-endian unsigned encoding (at least one byte).
fn uint_bytes(v: u64) -> Vec<u8> {
    let b = v.to_be_bytes();
    let first = b.iter().position(|&x| x != 0).unwrap_or(7);
    b[first..].to_vec()
}

/// Minimal two's-complement encoding that round-trips `v` under sign
/// extension (at least one byte).
fn sint_bytes(v: i64) -> Vec<u8> {
    for width in 1..8 {
        let shift = 64 - 8 * width;
        if (v << shift) >> shift == v {
            return v.to_be_bytes()[8 - width..].to_vec();
        }
    }
    v.to_be_bytes().to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::BufferTarget;

    #[test]
    fn vint_widths_match_spec_examples() {
        assert_eq!(vint(0x7e, None).len(), 1);
        assert_eq!(vint(0x7f, None).len(), 2);
        assert_eq!(vint(0x3ffe, None).len(), 2);
    }

    #[test]
    fn id_bytes_trims_leading_zeros() {
        assert_eq!(id_bytes(0x1A45DFA3), vec![0x1A, 0x45, 0xDF, 0xA3]);
        assert_eq!(id_bytes(0x80), vec![0x80]);
        assert_eq!(id_bytes(0x4286), vec![0x42, 0x86]);
    }

    #[test]
    fn measure_matches_write_length() {
        let e = Element::children(0x1654AE6B, vec![Element::uint(0xD7, 1)]);
        let measured = e.measure();
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        e.write(&mut w).unwrap();
        w.finalize().unwrap();
        assert_eq!(measured, w.end_pos());
    }

    #[test]
    fn patch_size_rewrites_reserved_field() {
        let mut w = Writer::new(std::boxed::Box::new(BufferTarget::new()));
        let inner = Element::children(0x1F43B675, vec![Element::uint(0xE7, 0)]);
        let offset = inner.write(&mut w).unwrap();
        let actual = inner.measure() - id_bytes(inner.id).len() as u64 - 4;
        patch_size(&mut w, offset, inner.id, actual).unwrap();
        w.finalize().unwrap();
        assert!(w.end_pos() > 0);
    }

    #[test]
    fn sint_negative_round_trips_minimally() {
        assert_eq!(sint_bytes(-1), vec![0xff]);
        assert_eq!(sint_bytes(127), vec![0x7f]);
        assert_eq!(sint_bytes(128), vec![0x00, 0x80]);
    }
}
