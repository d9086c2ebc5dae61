/// `atom/driver.rs` — Type-Driver Table
///
/// One `AtomDriver` per atom type, held in a table sorted by URID and looked
/// up by binary search. The binding layer asks the table once per handle
/// operation and never branches on type ids itself. Types without a driver
/// resolve to the opaque driver, which only exposes raw bytes.
use std::fmt;

use super::urid::Uris;
use super::{read_u32, read_u64, split_atom, AtomRef, TimeStamp, Urid};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AtomKind {
    Nil,
    Bool,
    Int,
    Long,
    Float,
    Double,
    Urid,
    String,
    Uri,
    Path,
    Literal,
    Chunk,
    Midi,
    Tuple,
    Object,
    Vector,
    Sequence,
    Opaque,
}

/// Script-facing value of an atom.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Scalar<'a> {
    Nil,
    Bool(bool),
    Integer(i64),
    Number(f64),
    Text(&'a [u8]),
    Bytes(&'a [u8]),
    /// A list of child values; the caller collects them via `child_at`.
    Items,
}

/// Result of a named field lookup (`id`, `otype`, `unit`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Field {
    Urid(Urid),
    Integer(i64),
}

/// Result of a positional lookup.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Indexed<'a> {
    Atom(AtomRef<'a>),
    Integer(i64),
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Key {
    Position(usize),
    Urid(Urid),
    Time(TimeStamp),
}

/// One step of an iteration.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Child<'a> {
    pub key: Key,
    pub atom: AtomRef<'a>,
    /// Property context for object children, `0` otherwise.
    pub context: Urid,
}

/// Iteration state. `offset` is relative to the first child.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Cursor {
    pub offset: usize,
    pub index: usize,
}

/// Fixed-size encoding of a vector element.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Element {
    I32,
    U32,
    I64,
    F32,
    F64,
}

impl Element {
    pub fn size(self) -> u32 {
        match self {
            Self::I32 | Self::U32 | Self::F32 => 4,
            Self::I64 | Self::F64 => 8,
        }
    }
}

/// How `unpack` treats its arguments.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnpackStyle {
    None,
    /// Positional children in a clamped `[min, max]` range.
    Children,
    /// Raw bytes as integers in a clamped range.
    Bytes,
    /// Arguments are property keys; returns the matching values.
    Properties,
    /// `(text, datatype, lang)`.
    Literal,
}

pub trait AtomDriver: Send + Sync {
    fn kind(&self) -> AtomKind;

    fn name(&self) -> &'static str;

    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.body.len()
    }

    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a>;

    /// Writes the value part of the string representation.
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result;

    fn field(&self, _atom: &AtomRef<'_>, _name: &str) -> Option<Field> {
        None
    }

    /// 1-based positional access.
    fn child_at<'a>(&self, _atom: &AtomRef<'a>, _pos: usize) -> Option<Indexed<'a>> {
        None
    }

    fn child_by_key<'a>(&self, _atom: &AtomRef<'a>, _key: Urid) -> Option<AtomRef<'a>> {
        None
    }

    fn iterable(&self) -> bool {
        false
    }

    fn next<'a>(&self, _atom: &AtomRef<'a>, _cursor: &mut Cursor) -> Option<Child<'a>> {
        None
    }

    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::None
    }

    /// Element encoding when this type can live inside a vector.
    fn vector_element(&self) -> Option<Element> {
        None
    }
}

// ── Scalars ──────────────────────────────────────────────────────────────────

struct NilDriver;

impl AtomDriver for NilDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Nil
    }
    fn name(&self) -> &'static str {
        "nil"
    }
    fn scalar<'a>(&self, _atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Nil
    }
    fn describe(&self, _atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str("nil")
    }
}

struct IntDriver;

impl AtomDriver for IntDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::I32)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Int
    }
    fn name(&self) -> &'static str {
        "int"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_i32().map_or(Scalar::Nil, |v| Scalar::Integer(v as i64))
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_i32().unwrap_or_default())
    }
}

struct LongDriver;

impl AtomDriver for LongDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::I64)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Long
    }
    fn name(&self) -> &'static str {
        "long"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_i64().map_or(Scalar::Nil, Scalar::Integer)
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_i64().unwrap_or_default())
    }
}

struct FloatDriver;

impl AtomDriver for FloatDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::F32)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Float
    }
    fn name(&self) -> &'static str {
        "float"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_f32().map_or(Scalar::Nil, |v| Scalar::Number(v as f64))
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_f32().unwrap_or_default())
    }
}

struct DoubleDriver;

impl AtomDriver for DoubleDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::F64)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Double
    }
    fn name(&self) -> &'static str {
        "double"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_f64().map_or(Scalar::Nil, Scalar::Number)
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_f64().unwrap_or_default())
    }
}

struct BoolDriver;

impl AtomDriver for BoolDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::I32)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Bool
    }
    fn name(&self) -> &'static str {
        "bool"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_i32().map_or(Scalar::Nil, |v| Scalar::Bool(v != 0))
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_i32().unwrap_or_default() != 0)
    }
}

struct UridDriver;

impl AtomDriver for UridDriver {
    fn vector_element(&self) -> Option<Element> {
        Some(Element::U32)
    }
    fn kind(&self) -> AtomKind {
        AtomKind::Urid
    }
    fn name(&self) -> &'static str {
        "urid"
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.as_u32().map_or(Scalar::Nil, |v| Scalar::Integer(v as i64))
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{}", atom.as_u32().unwrap_or_default())
    }
}

/// String, URI and Path share a layout: UTF-8 bytes plus a terminator.
struct StringDriver {
    kind: AtomKind,
    name: &'static str,
}

impl AtomDriver for StringDriver {
    fn kind(&self) -> AtomKind {
        self.kind
    }
    fn name(&self) -> &'static str {
        self.name
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.string_bytes().len()
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Text(atom.string_bytes())
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        out.write_str(&String::from_utf8_lossy(atom.string_bytes()))
    }
}

struct LiteralDriver;

impl AtomDriver for LiteralDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Literal
    }
    fn name(&self) -> &'static str {
        "literal"
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.literal().map_or(0, |(_, _, text)| text.len())
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        atom.literal().map_or(Scalar::Nil, |(_, _, text)| Scalar::Text(text))
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        let text = atom.literal().map_or(&[][..], |(_, _, t)| t);
        out.write_str(&String::from_utf8_lossy(text))
    }
    fn field(&self, atom: &AtomRef<'_>, name: &str) -> Option<Field> {
        let (datatype, lang, _) = atom.literal()?;
        match name {
            "datatype" => Some(Field::Urid(datatype)),
            "lang" => Some(Field::Urid(lang)),
            _ => None,
        }
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Literal
    }
}

/// Chunk, MIDI and unknown types: opaque bytes indexed per byte.
struct ChunkDriver {
    kind: AtomKind,
    name: &'static str,
}

impl AtomDriver for ChunkDriver {
    fn kind(&self) -> AtomKind {
        self.kind
    }
    fn name(&self) -> &'static str {
        self.name
    }
    fn scalar<'a>(&self, atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Bytes(atom.body)
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "{} bytes", atom.body.len())
    }
    fn child_at<'a>(&self, atom: &AtomRef<'a>, pos: usize) -> Option<Indexed<'a>> {
        let byte = atom.body.get(pos.checked_sub(1)?)?;
        Some(Indexed::Integer(*byte as i64))
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Bytes
    }
}

// ── Containers ───────────────────────────────────────────────────────────────

struct TupleDriver;

impl AtomDriver for TupleDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Tuple
    }
    fn name(&self) -> &'static str {
        "tuple"
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.tuple_items().count()
    }
    fn scalar<'a>(&self, _atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Nil
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "#{}", self.len(atom))
    }
    fn child_at<'a>(&self, atom: &AtomRef<'a>, pos: usize) -> Option<Indexed<'a>> {
        atom.tuple_items().nth(pos.checked_sub(1)?).map(Indexed::Atom)
    }
    fn iterable(&self) -> bool {
        true
    }
    fn next<'a>(&self, atom: &AtomRef<'a>, cursor: &mut Cursor) -> Option<Child<'a>> {
        let rest = atom.body.get(cursor.offset..)?;
        let (child, tail) = split_atom(rest)?;
        cursor.offset += rest.len() - tail.len();
        cursor.index += 1;
        Some(Child {
            key: Key::Position(cursor.index),
            atom: child,
            context: 0,
        })
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Children
    }
}

struct ObjectDriver;

impl AtomDriver for ObjectDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Object
    }
    fn name(&self) -> &'static str {
        "object"
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.properties().count()
    }
    fn scalar<'a>(&self, _atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Nil
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        let otype = atom.object_header().map_or(0, |h| h.otype);
        write!(out, "{}, #{}", otype, self.len(atom))
    }
    fn field(&self, atom: &AtomRef<'_>, name: &str) -> Option<Field> {
        let header = atom.object_header()?;
        match name {
            "id" => Some(Field::Urid(header.id)),
            "otype" => Some(Field::Urid(header.otype)),
            _ => None,
        }
    }
    fn child_by_key<'a>(&self, atom: &AtomRef<'a>, key: Urid) -> Option<AtomRef<'a>> {
        atom.property(key)
    }
    fn iterable(&self) -> bool {
        true
    }
    fn next<'a>(&self, atom: &AtomRef<'a>, cursor: &mut Cursor) -> Option<Child<'a>> {
        let rest = atom.body.get(8 + cursor.offset..)?;
        let key = read_u32(rest, 0)?;
        let context = read_u32(rest, 4)?;
        let (value, tail) = split_atom(&rest[8..])?;
        cursor.offset += rest.len() - tail.len();
        cursor.index += 1;
        Some(Child {
            key: Key::Urid(key),
            atom: value,
            context,
        })
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Properties
    }
}

struct VectorDriver;

impl AtomDriver for VectorDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Vector
    }
    fn name(&self) -> &'static str {
        "vector"
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.vector_len()
    }
    fn scalar<'a>(&self, _atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Items
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        let child_type = atom.vector_header().map_or(0, |h| h.child_type);
        write!(out, "{}, #{}", child_type, atom.vector_len())
    }
    fn field(&self, atom: &AtomRef<'_>, name: &str) -> Option<Field> {
        let header = atom.vector_header()?;
        match name {
            "childType" => Some(Field::Urid(header.child_type)),
            "childSize" => Some(Field::Integer(header.child_size as i64)),
            _ => None,
        }
    }
    fn child_at<'a>(&self, atom: &AtomRef<'a>, pos: usize) -> Option<Indexed<'a>> {
        atom.vector_items().nth(pos.checked_sub(1)?).map(Indexed::Atom)
    }
    fn iterable(&self) -> bool {
        true
    }
    fn next<'a>(&self, atom: &AtomRef<'a>, cursor: &mut Cursor) -> Option<Child<'a>> {
        let item = atom.vector_items().nth(cursor.index)?;
        cursor.index += 1;
        Some(Child {
            key: Key::Position(cursor.index),
            atom: item,
            context: 0,
        })
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Children
    }
}

struct SequenceDriver {
    beat_time: Urid,
}

impl SequenceDriver {
    fn is_beats(&self, atom: &AtomRef<'_>) -> bool {
        atom.sequence_unit() == Some(self.beat_time)
    }
}

impl AtomDriver for SequenceDriver {
    fn kind(&self) -> AtomKind {
        AtomKind::Sequence
    }
    fn name(&self) -> &'static str {
        "sequence"
    }
    fn len(&self, atom: &AtomRef<'_>) -> usize {
        atom.events().count()
    }
    fn scalar<'a>(&self, _atom: &AtomRef<'a>) -> Scalar<'a> {
        Scalar::Nil
    }
    fn describe(&self, atom: &AtomRef<'_>, out: &mut dyn fmt::Write) -> fmt::Result {
        write!(out, "#{}", self.len(atom))
    }
    fn field(&self, atom: &AtomRef<'_>, name: &str) -> Option<Field> {
        match name {
            "unit" => atom.sequence_unit().map(Field::Urid),
            _ => None,
        }
    }
    fn child_at<'a>(&self, atom: &AtomRef<'a>, pos: usize) -> Option<Indexed<'a>> {
        atom.events()
            .nth(pos.checked_sub(1)?)
            .map(|ev| Indexed::Atom(ev.atom))
    }
    fn iterable(&self) -> bool {
        true
    }
    fn next<'a>(&self, atom: &AtomRef<'a>, cursor: &mut Cursor) -> Option<Child<'a>> {
        let beats = self.is_beats(atom);
        let rest = atom.body.get(8 + cursor.offset..)?;
        let raw = read_u64(rest, 0)?;
        let (event, tail) = split_atom(&rest[8..])?;
        cursor.offset += rest.len() - tail.len();
        cursor.index += 1;
        let stamp = if beats {
            TimeStamp::Beats(f64::from_bits(raw))
        } else {
            TimeStamp::Frames(raw as i64)
        };
        Some(Child {
            key: Key::Time(stamp),
            atom: event,
            context: 0,
        })
    }
    fn unpack_style(&self) -> UnpackStyle {
        UnpackStyle::Children
    }
}

// ── Table ────────────────────────────────────────────────────────────────────

static OPAQUE: ChunkDriver = ChunkDriver {
    kind: AtomKind::Opaque,
    name: "atom",
};

/// Sorted `(urid, driver)` pairs.
pub struct DriverTable {
    entries: Vec<(Urid, Box<dyn AtomDriver>)>,
}

impl DriverTable {
    pub fn new(uris: &Uris) -> Self {
        let a = &uris.atom;
        let mut entries: Vec<(Urid, Box<dyn AtomDriver>)> = vec![
            (0, Box::new(NilDriver)),
            (a.bool_, Box::new(BoolDriver)),
            (a.int, Box::new(IntDriver)),
            (a.long, Box::new(LongDriver)),
            (a.float, Box::new(FloatDriver)),
            (a.double, Box::new(DoubleDriver)),
            (a.urid, Box::new(UridDriver)),
            (a.string, Box::new(StringDriver { kind: AtomKind::String, name: "string" })),
            (a.uri, Box::new(StringDriver { kind: AtomKind::Uri, name: "uri" })),
            (a.path, Box::new(StringDriver { kind: AtomKind::Path, name: "path" })),
            (a.literal, Box::new(LiteralDriver)),
            (a.chunk, Box::new(ChunkDriver { kind: AtomKind::Chunk, name: "chunk" })),
            (uris.midi_event, Box::new(ChunkDriver { kind: AtomKind::Midi, name: "midi" })),
            (a.tuple, Box::new(TupleDriver)),
            (a.object, Box::new(ObjectDriver)),
            (a.vector, Box::new(VectorDriver)),
            (a.sequence, Box::new(SequenceDriver { beat_time: a.beat_time })),
        ];
        entries.sort_by_key(|(urid, _)| *urid);
        entries.dedup_by_key(|(urid, _)| *urid);
        Self { entries }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn lookup(&self, urid: Urid) -> Option<&dyn AtomDriver> {
        self.entries
            .binary_search_by_key(&urid, |(u, _)| *u)
            .ok()
            .map(|idx| self.entries[idx].1.as_ref())
    }

    /// Like `lookup`, falling back to the opaque raw-bytes driver.
    pub fn resolve(&self, urid: Urid) -> &dyn AtomDriver {
        self.lookup(urid).unwrap_or(&OPAQUE)
    }

    pub fn kind_of(&self, urid: Urid) -> AtomKind {
        self.resolve(urid).kind()
    }
}

impl fmt::Debug for DriverTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list()
            .entries(self.entries.iter().map(|(u, d)| (u, d.name())))
            .finish()
    }
}
