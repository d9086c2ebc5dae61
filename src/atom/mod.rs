/// `atom/` — Atom model
///
/// Atoms are size-prefixed, type-tagged values laid out the LV2 way: an
/// 8-byte header `{ size: u32, type: u32 }` followed by `size` bytes of body.
/// Inside containers every atom is padded to the next 8-byte boundary.
/// All multi-byte fields use native byte order.
pub mod driver;
pub mod urid;

use std::fmt;

/// Integer identifier a URI maps to. `0` is reserved for "none".
pub type Urid = u32;

pub const HEADER_SIZE: usize = 8;
pub const ALIGN: usize = 8;

/// Rounds `size` up to the atom alignment.
pub fn pad_size(size: usize) -> usize {
    (size + (ALIGN - 1)) & !(ALIGN - 1)
}

pub(crate) fn read_u32(bytes: &[u8], offset: usize) -> Option<u32> {
    let raw = bytes.get(offset..offset.checked_add(4)?)?;
    Some(u32::from_ne_bytes([raw[0], raw[1], raw[2], raw[3]]))
}

pub(crate) fn read_i32(bytes: &[u8], offset: usize) -> Option<i32> {
    read_u32(bytes, offset).map(|v| v as i32)
}

pub(crate) fn read_f32(bytes: &[u8], offset: usize) -> Option<f32> {
    read_u32(bytes, offset).map(f32::from_bits)
}

pub(crate) fn read_u64(bytes: &[u8], offset: usize) -> Option<u64> {
    let raw = bytes.get(offset..offset.checked_add(8)?)?;
    let mut arr = [0u8; 8];
    arr.copy_from_slice(raw);
    Some(u64::from_ne_bytes(arr))
}

pub(crate) fn read_i64(bytes: &[u8], offset: usize) -> Option<i64> {
    read_u64(bytes, offset).map(|v| v as i64)
}

pub(crate) fn read_f64(bytes: &[u8], offset: usize) -> Option<f64> {
    read_u64(bytes, offset).map(f64::from_bits)
}

// ── Borrowed view ────────────────────────────────────────────────────────────

/// A borrowed atom: its type and exactly `size` bytes of body.
///
/// The header need not be contiguous with the body, which lets vector
/// elements (which carry no header of their own) be viewed as atoms too.
#[derive(Clone, Copy, PartialEq)]
pub struct AtomRef<'a> {
    pub urid: Urid,
    pub body: &'a [u8],
}

impl fmt::Debug for AtomRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomRef")
            .field("urid", &self.urid)
            .field("size", &self.body.len())
            .finish()
    }
}

impl<'a> AtomRef<'a> {
    pub fn new(urid: Urid, body: &'a [u8]) -> Self {
        Self { urid, body }
    }

    /// Parses the header at the start of `bytes`. Returns `None` when the
    /// declared size runs past the end of the slice.
    pub fn parse(bytes: &'a [u8]) -> Option<Self> {
        let size = read_u32(bytes, 0)? as usize;
        let urid = read_u32(bytes, 4)?;
        let body = bytes.get(HEADER_SIZE..HEADER_SIZE.checked_add(size)?)?;
        Some(Self { urid, body })
    }

    pub fn size(&self) -> u32 {
        self.body.len() as u32
    }

    /// Header plus body, without trailing padding.
    pub fn total_size(&self) -> usize {
        HEADER_SIZE + self.body.len()
    }

    /// Byte offset of the body inside `buffer`, if the body lives there.
    pub fn offset_in(&self, buffer: &[u8]) -> Option<usize> {
        let start = buffer.as_ptr() as usize;
        let body = self.body.as_ptr() as usize;
        if body < start || body + self.body.len() > start + buffer.len() {
            return None;
        }
        Some(body - start)
    }

    pub fn as_i32(&self) -> Option<i32> {
        read_i32(self.body, 0)
    }

    pub fn as_i64(&self) -> Option<i64> {
        read_i64(self.body, 0)
    }

    pub fn as_f32(&self) -> Option<f32> {
        read_f32(self.body, 0)
    }

    pub fn as_f64(&self) -> Option<f64> {
        read_f64(self.body, 0)
    }

    pub fn as_u32(&self) -> Option<u32> {
        read_u32(self.body, 0)
    }

    /// String payload without the NUL terminator.
    pub fn string_bytes(&self) -> &'a [u8] {
        let end = self.body.iter().position(|b| *b == 0).unwrap_or(self.body.len());
        &self.body[..end]
    }

    pub fn as_str(&self) -> Option<&'a str> {
        std::str::from_utf8(self.string_bytes()).ok()
    }

    /// `(datatype, lang, text)` of a literal body.
    pub fn literal(&self) -> Option<(Urid, Urid, &'a [u8])> {
        let datatype = read_u32(self.body, 0)?;
        let lang = read_u32(self.body, 4)?;
        let text = self.body.get(8..)?;
        let end = text.iter().position(|b| *b == 0).unwrap_or(text.len());
        Some((datatype, lang, &text[..end]))
    }

    pub fn tuple_items(&self) -> AtomIter<'a> {
        AtomIter { rest: self.body }
    }

    pub fn object_header(&self) -> Option<ObjectHeader> {
        Some(ObjectHeader {
            id: read_u32(self.body, 0)?,
            otype: read_u32(self.body, 4)?,
        })
    }

    pub fn properties(&self) -> PropertyIter<'a> {
        PropertyIter {
            rest: self.body.get(8..).unwrap_or(&[]),
        }
    }

    /// Value of the first property with `key`.
    pub fn property(&self, key: Urid) -> Option<AtomRef<'a>> {
        self.properties().find(|p| p.key == key).map(|p| p.value)
    }

    pub fn vector_header(&self) -> Option<VectorHeader> {
        Some(VectorHeader {
            child_size: read_u32(self.body, 0)?,
            child_type: read_u32(self.body, 4)?,
        })
    }

    pub fn vector_items(&self) -> VectorIter<'a> {
        match self.vector_header() {
            Some(h) if h.child_size > 0 => VectorIter {
                child_type: h.child_type,
                child_size: h.child_size as usize,
                rest: self.body.get(8..).unwrap_or(&[]),
            },
            _ => VectorIter {
                child_type: 0,
                child_size: 1,
                rest: &[],
            },
        }
    }

    pub fn vector_len(&self) -> usize {
        match self.vector_header() {
            Some(h) if h.child_size > 0 => self.body.len().saturating_sub(8) / h.child_size as usize,
            _ => 0,
        }
    }

    pub fn sequence_unit(&self) -> Option<Urid> {
        read_u32(self.body, 0)
    }

    pub fn events(&self) -> EventIter<'a> {
        EventIter {
            rest: self.body.get(8..).unwrap_or(&[]),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ObjectHeader {
    pub id: Urid,
    pub otype: Urid,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VectorHeader {
    pub child_size: u32,
    pub child_type: Urid,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Property<'a> {
    pub key: Urid,
    pub context: Urid,
    pub value: AtomRef<'a>,
}

/// Event timestamp, interpreted through the sequence unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum TimeStamp {
    Frames(i64),
    Beats(f64),
}

impl TimeStamp {
    pub fn to_bits(self) -> u64 {
        match self {
            Self::Frames(f) => f as u64,
            Self::Beats(b) => b.to_bits(),
        }
    }

    /// Position on a common frame axis; beats are scaled by `frames_per_beat`.
    pub fn on_frame_axis(self, frames_per_beat: f64) -> f64 {
        match self {
            Self::Frames(f) => f as f64,
            Self::Beats(b) => b * frames_per_beat,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Event<'a> {
    raw_time: u64,
    pub atom: AtomRef<'a>,
}

impl<'a> Event<'a> {
    pub fn frames(&self) -> i64 {
        self.raw_time as i64
    }

    pub fn beats(&self) -> f64 {
        f64::from_bits(self.raw_time)
    }

    pub fn stamp(&self, beats: bool) -> TimeStamp {
        if beats {
            TimeStamp::Beats(self.beats())
        } else {
            TimeStamp::Frames(self.frames())
        }
    }
}

// ── Iterators ────────────────────────────────────────────────────────────────
//
// All iterators stop at the first header that does not fit the remaining
// bytes, so malformed containers end early instead of reading out of bounds.

pub(crate) fn split_atom(rest: &[u8]) -> Option<(AtomRef<'_>, &[u8])> {
    let atom = AtomRef::parse(rest)?;
    let next = pad_size(atom.total_size()).min(rest.len());
    Some((atom, &rest[next..]))
}

#[derive(Debug, Clone)]
pub struct AtomIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for AtomIter<'a> {
    type Item = AtomRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let (atom, rest) = split_atom(self.rest)?;
        self.rest = rest;
        Some(atom)
    }
}

#[derive(Debug, Clone)]
pub struct PropertyIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for PropertyIter<'a> {
    type Item = Property<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let key = read_u32(self.rest, 0)?;
        let context = read_u32(self.rest, 4)?;
        let (value, rest) = split_atom(&self.rest[8..])?;
        self.rest = rest;
        Some(Property { key, context, value })
    }
}

#[derive(Debug, Clone)]
pub struct VectorIter<'a> {
    child_type: Urid,
    child_size: usize,
    rest: &'a [u8],
}

impl<'a> Iterator for VectorIter<'a> {
    type Item = AtomRef<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.rest.len() < self.child_size {
            return None;
        }
        let (item, rest) = self.rest.split_at(self.child_size);
        self.rest = rest;
        Some(AtomRef::new(self.child_type, item))
    }
}

#[derive(Debug, Clone)]
pub struct EventIter<'a> {
    rest: &'a [u8],
}

impl<'a> Iterator for EventIter<'a> {
    type Item = Event<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let raw_time = read_u64(self.rest, 0)?;
        let (atom, rest) = split_atom(&self.rest[8..])?;
        self.rest = rest;
        Some(Event { raw_time, atom })
    }
}

// ── Owned atom ───────────────────────────────────────────────────────────────

/// An owned, complete atom (header + body).
#[derive(Clone, PartialEq, Eq)]
pub struct AtomBuf {
    bytes: Vec<u8>,
}

impl fmt::Debug for AtomBuf {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AtomBuf").field("len", &self.bytes.len()).finish()
    }
}

impl AtomBuf {
    pub fn from_atom(atom: AtomRef<'_>) -> Self {
        let mut bytes = Vec::with_capacity(atom.total_size());
        bytes.extend_from_slice(&atom.size().to_ne_bytes());
        bytes.extend_from_slice(&atom.urid.to_ne_bytes());
        bytes.extend_from_slice(atom.body);
        Self { bytes }
    }

    /// Takes ownership of serialized atom bytes, validating the header.
    pub fn from_bytes(bytes: Vec<u8>) -> Option<Self> {
        let total = AtomRef::parse(&bytes)?.total_size();
        let mut bytes = bytes;
        bytes.truncate(total);
        Some(Self { bytes })
    }

    pub fn as_atom(&self) -> AtomRef<'_> {
        // Validated on construction.
        AtomRef::parse(&self.bytes).unwrap_or(AtomRef::new(0, &[]))
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}
