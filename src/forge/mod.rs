/// `forge/` — Forge builder
///
/// A `Forge` appends well-formed atoms to a caller-owned byte buffer. Composite
/// atoms (tuple, object, sequence, vector) are opened with a `push_*` call that
/// returns a `FrameRef`, and closed with `pop`, strictly last-in first-out.
/// Every write checks capacity before touching the buffer, so a failed call
/// leaves the bytes written so far intact and never truncates an atom.
pub mod osc;
pub mod patch;

use crate::atom::driver::{DriverTable, Element};
use crate::atom::urid::Uris;
use crate::atom::{pad_size, AtomRef, TimeStamp, Urid, HEADER_SIZE};

/// Nesting limit of open frames per cursor.
pub const MAX_DEPTH: usize = 32;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ForgeError {
    #[error("forge buffer overflow")]
    Overflow,
    #[error("invalid frame time, must not decrease")]
    FrameTimeDecrease,
    #[error("invalid beat time, must not decrease")]
    BeatTimeDecrease,
    #[error("forge frame mismatch")]
    FrameMismatch,
    #[error("timestamp outside of a sequence")]
    NotInSequence,
    #[error("sequence time unit mismatch")]
    UnitMismatch,
    #[error("forge frame depth exceeded")]
    DepthExceeded,
    #[error("vector supports only fixed sized atoms (e.g. Int, Long, Float, Double, URID, Bool)")]
    UnsupportedVector,
}

pub type ForgeResult<T> = Result<T, ForgeError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FrameKind {
    #[default]
    Tuple,
    Object,
    Sequence,
    Vector,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
struct Frame {
    kind: FrameKind,
    /// Offset of the frame's atom header.
    offset: usize,
    /// Sequence timed in beats rather than frames.
    beats: bool,
    /// Vector element encoding.
    element: Option<Element>,
    last: Option<TimeStamp>,
}

/// Marker for an open frame. Only the marker on top of the stack can be popped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRef {
    depth: usize,
    offset: usize,
}

impl FrameRef {
    pub fn depth(&self) -> usize {
        self.depth
    }
}

/// Write position and open-frame stack for one destination buffer.
#[derive(Debug, Clone)]
pub struct ForgeCursor {
    offset: usize,
    depth: usize,
    frames: [Frame; MAX_DEPTH],
}

impl Default for ForgeCursor {
    fn default() -> Self {
        Self {
            offset: 0,
            depth: 0,
            frames: [Frame::default(); MAX_DEPTH],
        }
    }
}

impl ForgeCursor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn offset(&self) -> usize {
        self.offset
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn reset(&mut self) {
        self.offset = 0;
        self.depth = 0;
    }

    pub fn top(&self) -> Option<FrameRef> {
        self.frame(self.depth.checked_sub(1)?)
    }

    /// Marker of the open frame at `depth`, counted from the outermost.
    pub fn frame(&self, depth: usize) -> Option<FrameRef> {
        if depth >= self.depth {
            return None;
        }
        Some(FrameRef {
            depth,
            offset: self.frames[depth].offset,
        })
    }
}

/// Element value for vector frames; converted to the frame's element type.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum VectorValue {
    Integer(i64),
    Number(f64),
    Bool(bool),
}

impl VectorValue {
    fn as_i64(self) -> i64 {
        match self {
            Self::Integer(v) => v,
            Self::Number(v) => v as i64,
            Self::Bool(b) => b as i64,
        }
    }

    fn as_f64(self) -> f64 {
        match self {
            Self::Integer(v) => v as f64,
            Self::Number(v) => v,
            Self::Bool(b) => b as i64 as f64,
        }
    }
}

pub struct Forge<'a> {
    buf: &'a mut [u8],
    cursor: &'a mut ForgeCursor,
    uris: &'a Uris,
}

impl<'a> Forge<'a> {
    pub fn new(buf: &'a mut [u8], cursor: &'a mut ForgeCursor, uris: &'a Uris) -> Self {
        Self { buf, cursor, uris }
    }

    pub fn uris(&self) -> &Uris {
        self.uris
    }

    pub fn offset(&self) -> usize {
        self.cursor.offset
    }

    pub fn depth(&self) -> usize {
        self.cursor.depth
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn remaining(&self) -> usize {
        self.buf.len().saturating_sub(self.cursor.offset)
    }

    /// Bytes written so far.
    pub fn written(&self) -> &[u8] {
        &self.buf[..self.cursor.offset.min(self.buf.len())]
    }

    pub fn top_frame(&self) -> Option<FrameRef> {
        self.cursor.top()
    }

    /// Drops everything written and every open frame.
    pub fn clear(&mut self) {
        self.cursor.reset();
    }

    // ── Raw writes ───────────────────────────────────────────────────────────

    fn ensure(&self, len: usize) -> ForgeResult<()> {
        match self.cursor.offset.checked_add(len) {
            Some(end) if end <= self.buf.len() => Ok(()),
            _ => Err(ForgeError::Overflow),
        }
    }

    fn put_bytes(&mut self, bytes: &[u8]) {
        let start = self.cursor.offset;
        self.buf[start..start + bytes.len()].copy_from_slice(bytes);
        self.cursor.offset += bytes.len();
    }

    fn put_zeros(&mut self, len: usize) {
        let start = self.cursor.offset;
        self.buf[start..start + len].fill(0);
        self.cursor.offset += len;
    }

    fn pad(&mut self) {
        let padded = pad_size(self.cursor.offset);
        let len = padded.min(self.buf.len()) - self.cursor.offset;
        self.put_zeros(len);
    }

    fn put_header(&mut self, size: u32, urid: Urid) {
        self.put_bytes(&size.to_ne_bytes());
        self.put_bytes(&urid.to_ne_bytes());
    }

    fn patch_u32(&mut self, at: usize, value: u32) {
        self.buf[at..at + 4].copy_from_slice(&value.to_ne_bytes());
    }

    /// Appends one atom whose body is the concatenation of `parts`, padded.
    fn write_atom(&mut self, urid: Urid, parts: &[&[u8]]) -> ForgeResult<()> {
        let size: usize = parts.iter().map(|p| p.len()).sum();
        self.ensure(pad_size(HEADER_SIZE + size))?;
        self.put_header(size as u32, urid);
        for part in parts {
            self.put_bytes(part);
        }
        self.pad();
        Ok(())
    }

    /// Appends raw, unpadded bytes (header-less payloads such as property keys).
    pub fn raw(&mut self, bytes: &[u8]) -> ForgeResult<()> {
        self.ensure(bytes.len())?;
        self.put_bytes(bytes);
        Ok(())
    }

    // ── Scalars ──────────────────────────────────────────────────────────────

    /// Copies an existing atom verbatim.
    pub fn atom(&mut self, atom: AtomRef<'_>) -> ForgeResult<()> {
        self.write_atom(atom.urid, &[atom.body])
    }

    /// Copies `len` bytes starting at `from` of this same buffer as a new atom.
    pub fn duplicate(&mut self, urid: Urid, from: usize, len: usize) -> ForgeResult<()> {
        from.checked_add(len)
            .filter(|end| *end <= self.cursor.offset)
            .ok_or(ForgeError::Overflow)?;
        self.ensure(pad_size(HEADER_SIZE + len))?;
        self.put_header(len as u32, urid);
        let start = self.cursor.offset;
        self.buf.copy_within(from..from + len, start);
        self.cursor.offset += len;
        self.pad();
        Ok(())
    }

    pub fn typed_raw(&mut self, urid: Urid, body: &[u8]) -> ForgeResult<()> {
        self.write_atom(urid, &[body])
    }

    pub fn int(&mut self, value: i32) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.int, &[&value.to_ne_bytes()])
    }

    pub fn long(&mut self, value: i64) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.long, &[&value.to_ne_bytes()])
    }

    pub fn float(&mut self, value: f32) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.float, &[&value.to_ne_bytes()])
    }

    pub fn double(&mut self, value: f64) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.double, &[&value.to_ne_bytes()])
    }

    pub fn bool(&mut self, value: bool) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.bool_, &[&(value as i32).to_ne_bytes()])
    }

    pub fn urid(&mut self, value: Urid) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.urid, &[&value.to_ne_bytes()])
    }

    /// String-like atom of type `urid` with a NUL terminator.
    pub fn text(&mut self, urid: Urid, text: &[u8]) -> ForgeResult<()> {
        self.write_atom(urid, &[text, &[0]])
    }

    pub fn string(&mut self, text: &str) -> ForgeResult<()> {
        self.text(self.uris.atom.string, text.as_bytes())
    }

    pub fn uri(&mut self, text: &str) -> ForgeResult<()> {
        self.text(self.uris.atom.uri, text.as_bytes())
    }

    pub fn path(&mut self, text: &str) -> ForgeResult<()> {
        self.text(self.uris.atom.path, text.as_bytes())
    }

    pub fn literal(&mut self, text: &[u8], datatype: Urid, lang: Urid) -> ForgeResult<()> {
        self.write_atom(
            self.uris.atom.literal,
            &[&datatype.to_ne_bytes(), &lang.to_ne_bytes(), text, &[0]],
        )
    }

    pub fn chunk(&mut self, bytes: &[u8]) -> ForgeResult<()> {
        self.write_atom(self.uris.atom.chunk, &[bytes])
    }

    pub fn midi(&mut self, bytes: &[u8]) -> ForgeResult<()> {
        self.write_atom(self.uris.midi_event, &[bytes])
    }

    /// Header-only atom (nil and impulse style markers).
    pub fn empty(&mut self, urid: Urid) -> ForgeResult<()> {
        self.write_atom(urid, &[])
    }

    // ── Timestamps ───────────────────────────────────────────────────────────

    fn sequence_frame(&mut self) -> ForgeResult<&mut Frame> {
        let depth = self.cursor.depth.checked_sub(1).ok_or(ForgeError::NotInSequence)?;
        let frame = &mut self.cursor.frames[depth];
        if frame.kind != FrameKind::Sequence {
            return Err(ForgeError::NotInSequence);
        }
        Ok(frame)
    }

    pub fn frame_time(&mut self, frames: i64) -> ForgeResult<()> {
        self.ensure(8)?;
        let frame = self.sequence_frame()?;
        if frame.beats {
            return Err(ForgeError::UnitMismatch);
        }
        if let Some(TimeStamp::Frames(last)) = frame.last {
            if frames < last {
                return Err(ForgeError::FrameTimeDecrease);
            }
        }
        frame.last = Some(TimeStamp::Frames(frames));
        self.put_bytes(&frames.to_ne_bytes());
        Ok(())
    }

    pub fn beat_time(&mut self, beats: f64) -> ForgeResult<()> {
        self.ensure(8)?;
        let frame = self.sequence_frame()?;
        if !frame.beats {
            return Err(ForgeError::UnitMismatch);
        }
        if let Some(TimeStamp::Beats(last)) = frame.last {
            if beats < last {
                return Err(ForgeError::BeatTimeDecrease);
            }
        }
        frame.last = Some(TimeStamp::Beats(beats));
        self.put_bytes(&beats.to_bits().to_ne_bytes());
        Ok(())
    }

    pub fn time(&mut self, stamp: TimeStamp) -> ForgeResult<()> {
        match stamp {
            TimeStamp::Frames(f) => self.frame_time(f),
            TimeStamp::Beats(b) => self.beat_time(b),
        }
    }

    /// Last timestamp written into the innermost sequence frame.
    pub fn last_time(&self) -> Option<TimeStamp> {
        let depth = self.cursor.depth.checked_sub(1)?;
        let frame = &self.cursor.frames[depth];
        (frame.kind == FrameKind::Sequence).then_some(frame.last).flatten()
    }

    /// Property header inside an object frame.
    pub fn key(&mut self, key: Urid, context: Urid) -> ForgeResult<()> {
        self.ensure(8)?;
        self.put_bytes(&key.to_ne_bytes());
        self.put_bytes(&context.to_ne_bytes());
        Ok(())
    }

    // ── Frames ───────────────────────────────────────────────────────────────

    fn push(&mut self, frame: Frame, body_header: &[u8]) -> ForgeResult<FrameRef> {
        if self.cursor.depth >= MAX_DEPTH {
            return Err(ForgeError::DepthExceeded);
        }
        self.ensure(HEADER_SIZE + body_header.len())?;
        let offset = self.cursor.offset;
        let urid = match frame.kind {
            FrameKind::Tuple => self.uris.atom.tuple,
            FrameKind::Object => self.uris.atom.object,
            FrameKind::Sequence => self.uris.atom.sequence,
            FrameKind::Vector => self.uris.atom.vector,
        };
        self.put_header(0, urid);
        self.put_bytes(body_header);
        let depth = self.cursor.depth;
        self.cursor.frames[depth] = Frame { offset, ..frame };
        self.cursor.depth += 1;
        Ok(FrameRef { depth, offset })
    }

    pub fn push_tuple(&mut self) -> ForgeResult<FrameRef> {
        self.push(
            Frame {
                kind: FrameKind::Tuple,
                ..Frame::default()
            },
            &[],
        )
    }

    pub fn push_object(&mut self, id: Urid, otype: Urid) -> ForgeResult<FrameRef> {
        let mut head = [0u8; 8];
        head[..4].copy_from_slice(&id.to_ne_bytes());
        head[4..].copy_from_slice(&otype.to_ne_bytes());
        self.push(
            Frame {
                kind: FrameKind::Object,
                ..Frame::default()
            },
            &head,
        )
    }

    /// Opens a sequence; `unit` is `0`, `atom:frameTime` or `atom:beatTime`.
    pub fn push_sequence(&mut self, unit: Urid) -> ForgeResult<FrameRef> {
        let mut head = [0u8; 8];
        head[..4].copy_from_slice(&unit.to_ne_bytes());
        self.push(
            Frame {
                kind: FrameKind::Sequence,
                beats: unit != 0 && unit == self.uris.atom.beat_time,
                ..Frame::default()
            },
            &head,
        )
    }

    /// Opens a vector of `child_type`, whose driver must describe a
    /// fixed-size element.
    pub fn push_vector(&mut self, drivers: &DriverTable, child_type: Urid) -> ForgeResult<FrameRef> {
        let element = drivers
            .resolve(child_type)
            .vector_element()
            .ok_or(ForgeError::UnsupportedVector)?;
        let mut head = [0u8; 8];
        head[..4].copy_from_slice(&element.size().to_ne_bytes());
        head[4..].copy_from_slice(&child_type.to_ne_bytes());
        self.push(
            Frame {
                kind: FrameKind::Vector,
                element: Some(element),
                ..Frame::default()
            },
            &head,
        )
    }

    /// Appends one element to the innermost vector frame.
    pub fn vector_push(&mut self, value: VectorValue) -> ForgeResult<()> {
        let depth = self.cursor.depth.checked_sub(1).ok_or(ForgeError::FrameMismatch)?;
        let frame = self.cursor.frames[depth];
        if frame.kind != FrameKind::Vector {
            return Err(ForgeError::FrameMismatch);
        }
        match frame.element.ok_or(ForgeError::UnsupportedVector)? {
            Element::I32 => self.raw(&(value.as_i64() as i32).to_ne_bytes()),
            Element::U32 => self.raw(&(value.as_i64() as u32).to_ne_bytes()),
            Element::I64 => self.raw(&value.as_i64().to_ne_bytes()),
            Element::F32 => self.raw(&(value.as_f64() as f32).to_ne_bytes()),
            Element::F64 => self.raw(&value.as_f64().to_ne_bytes()),
        }
    }

    /// Writes a complete vector in one call.
    pub fn vector<I>(&mut self, drivers: &DriverTable, child_type: Urid, items: I) -> ForgeResult<()>
    where
        I: IntoIterator<Item = VectorValue>,
    {
        let frame = self.push_vector(drivers, child_type)?;
        for item in items {
            self.vector_push(item)?;
        }
        self.pop(frame)
    }

    /// Closes `frame`, which must be the innermost open frame.
    pub fn pop(&mut self, frame: FrameRef) -> ForgeResult<()> {
        match self.cursor.top() {
            Some(top) if top == frame => {}
            _ => return Err(ForgeError::FrameMismatch),
        }
        let body_start = frame.offset + HEADER_SIZE;
        let size = self.cursor.offset - body_start;
        let padded = pad_size(self.cursor.offset);
        if padded > self.buf.len() {
            return Err(ForgeError::Overflow);
        }
        self.patch_u32(frame.offset, size as u32);
        self.pad();
        self.cursor.depth -= 1;
        Ok(())
    }

    /// Closes the innermost frame, whichever it is.
    pub fn pop_top(&mut self) -> ForgeResult<()> {
        let top = self.cursor.top().ok_or(ForgeError::FrameMismatch)?;
        self.pop(top)
    }
}
