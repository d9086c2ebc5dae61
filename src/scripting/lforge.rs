/// `scripting/lforge.rs` — Forge handles
///
/// A `LuaForge` names its destination slot; the write position and the open
/// frame stack live in the slot's `ForgeCursor`, shared by every forge handle
/// pointing at that slot. Scalar writers return the same forge for chaining.
/// Composite openers return a derived forge that remembers the frames it
/// opened, and `pop` on that derived forge closes exactly those frames.
use std::cell::Cell;
use std::io::Write as _;

use mlua::{
    AnyUserData, FromLua, Function, Lua, MetaMethod, Result as LuaResult, UserData, UserDataMethods, Value,
    Variadic,
};

use super::arena::{BufferKey, INPUT, OUTPUT, SCRATCH};
use super::handle::forge_handle;
use super::latom::{snapshot, AtomView, Source};
use super::{bindings, bindings_mut, BindingError};
use crate::atom::driver::AtomKind;
use crate::atom::{TimeStamp, Urid};
use crate::forge::osc::{OscArg, IMMEDIATE};
use crate::forge::{Forge, ForgeResult, FrameRef, VectorValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum AutoPop {
    Begin,
    End,
}

pub struct LuaForge {
    pub(crate) target: BufferKey,
    frames: [Option<FrameRef>; 2],
    pub(crate) cached: bool,
    autopop: Cell<AutoPop>,
}

impl LuaForge {
    pub fn new(target: BufferKey, cached: bool) -> Self {
        Self {
            target,
            frames: [None; 2],
            cached,
            autopop: Cell::new(AutoPop::Begin),
        }
    }

    fn derived(&self, frames: [Option<FrameRef>; 2]) -> Self {
        Self {
            frames,
            ..Self::new(self.target, self.cached)
        }
    }
}

struct AutoPopFn(Function);

pub(crate) fn register(lua: &Lua) -> LuaResult<()> {
    let next = lua.create_function(autopop_next)?;
    lua.set_app_data(AutoPopFn(next));
    Ok(())
}

// ── Write helpers ────────────────────────────────────────────────────────────

fn target(ud: &AnyUserData) -> LuaResult<BufferKey> {
    Ok(ud.borrow::<LuaForge>()?.target)
}

/// Runs `f` against the slot behind `target`. `f` must not call into Lua.
pub(crate) fn write<R>(lua: &Lua, target: BufferKey, f: impl FnOnce(&mut Forge<'_>) -> ForgeResult<R>) -> LuaResult<R> {
    write_with(lua, target, |forge| Ok(f(forge)?))
}

fn write_with<R>(lua: &Lua, target: BufferKey, f: impl FnOnce(&mut Forge<'_>) -> LuaResult<R>) -> LuaResult<R> {
    let mut guard = bindings_mut(lua)?;
    let b = &mut *guard;
    let (buf, cursor) = b.arena.forge_parts(target)?;
    let mut forge = Forge::new(buf, cursor, &b.uris);
    f(&mut forge)
}

/// Copies the atom behind `view` into `target`, optionally preceded by an
/// event timestamp.
pub(crate) fn append_atom(lua: &Lua, target: BufferKey, stamp: Option<TimeStamp>, view: &AtomView) -> LuaResult<()> {
    let mut guard = bindings_mut(lua)?;
    let b = &mut *guard;
    match &view.source {
        Source::Owned(bytes) => {
            let atom = view.resolve(bytes)?;
            let (buf, cursor) = b.arena.forge_parts(target)?;
            let mut forge = Forge::new(buf, cursor, &b.uris);
            if let Some(stamp) = stamp {
                forge.time(stamp)?;
            }
            forge.atom(atom)?;
        }
        Source::Slot(key) if key.slot() == target.slot() => {
            view.resolve(b.arena.bytes(*key)?)?;
            let (buf, cursor) = b.arena.forge_parts(target)?;
            let mut forge = Forge::new(buf, cursor, &b.uris);
            if let Some(stamp) = stamp {
                forge.time(stamp)?;
            }
            forge.duplicate(view.urid, view.start as usize, view.len as usize)?;
        }
        Source::Slot(key) => {
            let (src, buf, cursor) = b.arena.split(*key, target)?;
            let atom = view.resolve(src)?;
            let mut forge = Forge::new(buf, cursor, &b.uris);
            if let Some(stamp) = stamp {
                forge.time(stamp)?;
            }
            forge.atom(atom)?;
        }
    }
    Ok(())
}

fn derive(lua: &Lua, ud: &AnyUserData, frames: [Option<FrameRef>; 2]) -> LuaResult<AnyUserData> {
    let child = ud.borrow::<LuaForge>()?.derived(frames);
    forge_handle(lua, child)
}

fn time_stamp(value: &Value) -> LuaResult<TimeStamp> {
    match value {
        Value::Integer(f) => Ok(TimeStamp::Frames(*f)),
        Value::Number(b) => Ok(TimeStamp::Beats(*b)),
        _ => Err(BindingError::ExpectedTime.into()),
    }
}

/// Loose arguments for which the leading ones come straight off the Lua
/// stack. Only arguments past `LOOSE` land in a heap-backed `Variadic`.
pub(crate) struct Trailing {
    head: [Value; LOOSE],
    rest: Variadic<Value>,
}

const LOOSE: usize = 8;

impl Trailing {
    pub(crate) fn new(head: [Value; LOOSE], rest: Variadic<Value>) -> Self {
        Self { head, rest }
    }

    /// Count up to the last non-nil argument.
    pub(crate) fn len(&self) -> usize {
        if !self.rest.is_empty() {
            return LOOSE + self.rest.len();
        }
        self.head.iter().rposition(|v| !v.is_nil()).map_or(0, |i| i + 1)
    }

    pub(crate) fn get(&self, i: usize) -> Option<&Value> {
        if i >= self.len() {
            return None;
        }
        self.head.get(i).or_else(|| self.rest.get(i - LOOSE))
    }

    fn arg(&self, i: usize) -> Value {
        self.get(i).cloned().unwrap_or(Value::Nil)
    }

    fn iter(&self) -> impl Iterator<Item = &Value> {
        self.head.iter().chain(self.rest.iter()).take(self.len())
    }

    /// Drops the first argument.
    fn shift(&mut self) {
        self.head.rotate_left(1);
        self.head[LOOSE - 1] = if self.rest.is_empty() {
            Value::Nil
        } else {
            self.rest.remove(0)
        };
    }
}

/// Forge method arguments ending in a loose list.
pub(crate) type LooseArgs = (
    AnyUserData,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Variadic<Value>,
);

fn loose((ud, a, b, c, d, e, f, g, h, rest): LooseArgs) -> (AnyUserData, Trailing) {
    (ud, Trailing::new([a, b, c, d, e, f, g, h], rest))
}

fn byte(v: &Value) -> LuaResult<u8> {
    match v {
        Value::Integer(i) => Ok(*i as u8),
        Value::Number(n) => Ok(*n as u8),
        _ => Err(BindingError::ExpectedByte.into()),
    }
}

fn push_byte(buf: &mut Vec<u8>, v: &Value) -> LuaResult<()> {
    if buf.len() == buf.capacity() {
        return Err(BindingError::TooManyBytes(buf.capacity()).into());
    }
    buf.push(byte(v)?);
    Ok(())
}

/// Byte payload given as a string, a table of integers or integer varargs.
/// Tables and varargs are staged in the context's preallocated byte buffer.
fn with_bytes<R>(lua: &Lua, args: &Trailing, f: impl FnOnce(&[u8]) -> LuaResult<R>) -> LuaResult<R> {
    if args.len() == 1 {
        if let Some(Value::String(s)) = args.get(0) {
            return f(&s.as_bytes());
        }
    }
    let mut buf = std::mem::take(&mut bindings_mut(lua)?.bytes);
    buf.clear();
    let filled = match (args.len(), args.get(0)) {
        (1, Some(Value::Table(t))) => (1..=t.raw_len()).try_for_each(|i| push_byte(&mut buf, &t.raw_get::<Value>(i)?)),
        _ => args.iter().try_for_each(|v| push_byte(&mut buf, v)),
    };
    let result = filled.and_then(|()| f(&buf));
    bindings_mut(lua)?.bytes = buf;
    result
}

fn vector_value(v: &Value) -> LuaResult<VectorValue> {
    match v {
        Value::Integer(i) => Ok(VectorValue::Integer(*i)),
        Value::Number(n) => Ok(VectorValue::Number(*n)),
        Value::Boolean(b) => Ok(VectorValue::Bool(*b)),
        _ => Err(BindingError::VectorElement.into()),
    }
}

// ── Timestamps ───────────────────────────────────────────────────────────────

fn frame_time(lua: &Lua, (ud, frames): (AnyUserData, i64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.frame_time(frames))?;
    Ok(ud)
}

fn beat_time(lua: &Lua, (ud, beats): (AnyUserData, f64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.beat_time(beats))?;
    Ok(ud)
}

fn time(lua: &Lua, (ud, t): (AnyUserData, Value)) -> LuaResult<AnyUserData> {
    let stamp = time_stamp(&t)?;
    write(lua, target(&ud)?, |f| f.time(stamp))?;
    Ok(ud)
}

// ── Scalars ──────────────────────────────────────────────────────────────────

fn atom(lua: &Lua, (ud, atom): (AnyUserData, Option<AnyUserData>)) -> LuaResult<AnyUserData> {
    if let Some(atom) = atom {
        let (view, _) = snapshot(&atom)?;
        append_atom(lua, target(&ud)?, None, &view)?;
    }
    Ok(ud)
}

fn int(lua: &Lua, (ud, v): (AnyUserData, i64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.int(v as i32))?;
    Ok(ud)
}

fn long(lua: &Lua, (ud, v): (AnyUserData, i64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.long(v))?;
    Ok(ud)
}

fn float(lua: &Lua, (ud, v): (AnyUserData, f64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.float(v as f32))?;
    Ok(ud)
}

fn double(lua: &Lua, (ud, v): (AnyUserData, f64)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.double(v))?;
    Ok(ud)
}

fn boolean(lua: &Lua, (ud, v): (AnyUserData, bool)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.bool(v))?;
    Ok(ud)
}

fn urid(lua: &Lua, (ud, v): (AnyUserData, Urid)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.urid(v))?;
    Ok(ud)
}

fn text(lua: &Lua, ud: AnyUserData, s: mlua::String, pick: fn(&Forge<'_>) -> Urid) -> LuaResult<AnyUserData> {
    let bytes = s.as_bytes();
    write(lua, target(&ud)?, |f| {
        let urid = pick(f);
        f.text(urid, &bytes)
    })?;
    Ok(ud)
}

fn string(lua: &Lua, (ud, s): (AnyUserData, mlua::String)) -> LuaResult<AnyUserData> {
    text(lua, ud, s, |f| f.uris().atom.string)
}

fn uri(lua: &Lua, (ud, s): (AnyUserData, mlua::String)) -> LuaResult<AnyUserData> {
    text(lua, ud, s, |f| f.uris().atom.uri)
}

fn path(lua: &Lua, (ud, s): (AnyUserData, mlua::String)) -> LuaResult<AnyUserData> {
    text(lua, ud, s, |f| f.uris().atom.path)
}

fn literal(
    lua: &Lua,
    (ud, s, datatype, lang): (AnyUserData, mlua::String, Option<Urid>, Option<Urid>),
) -> LuaResult<AnyUserData> {
    let bytes = s.as_bytes();
    write(lua, target(&ud)?, |f| {
        f.literal(&bytes, datatype.unwrap_or(0), lang.unwrap_or(0))
    })?;
    Ok(ud)
}

fn chunk(lua: &Lua, args: LooseArgs) -> LuaResult<AnyUserData> {
    let (ud, args) = loose(args);
    let key = target(&ud)?;
    with_bytes(lua, &args, |bytes| write(lua, key, |f| f.chunk(bytes)))?;
    Ok(ud)
}

fn midi(lua: &Lua, args: LooseArgs) -> LuaResult<AnyUserData> {
    let (ud, args) = loose(args);
    let key = target(&ud)?;
    with_bytes(lua, &args, |bytes| write(lua, key, |f| f.midi(bytes)))?;
    Ok(ud)
}

fn raw(lua: &Lua, (ud, urid, body): (AnyUserData, Urid, Option<mlua::String>)) -> LuaResult<AnyUserData> {
    let key = target(&ud)?;
    match body {
        Some(body) => {
            let bytes = body.as_bytes();
            write(lua, key, |f| f.typed_raw(urid, &bytes))?
        }
        None => write(lua, key, |f| f.empty(urid))?,
    }
    Ok(ud)
}

fn key(lua: &Lua, (ud, key, context): (AnyUserData, Urid, Option<Urid>)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.key(key, context.unwrap_or(0)))?;
    Ok(ud)
}

/// Items given as one table or as varargs. Every item is checked before
/// the vector is opened, so a bad item leaves the buffer untouched.
fn write_vector(lua: &Lua, key: BufferKey, child_type: Urid, items: &Trailing) -> LuaResult<()> {
    let table = match (items.len(), items.get(0)) {
        (1, Some(Value::Table(t))) => Some(t),
        _ => None,
    };
    let count = table.map_or(items.len(), |t| t.raw_len());
    let item = |i: usize| -> LuaResult<VectorValue> {
        match table {
            Some(t) => vector_value(&t.raw_get::<Value>(i + 1)?),
            None => vector_value(items.get(i).unwrap_or(&Value::Nil)),
        }
    };
    for i in 0..count {
        item(i)?;
    }
    let mut guard = bindings_mut(lua)?;
    let b = &mut *guard;
    let (buf, cursor) = b.arena.forge_parts(key)?;
    let mut forge = Forge::new(buf, cursor, &b.uris);
    let frame = forge.push_vector(&b.drivers, child_type)?;
    for i in 0..count {
        forge.vector_push(item(i)?)?;
    }
    forge.pop(frame)?;
    Ok(())
}

fn vector(lua: &Lua, args: LooseArgs) -> LuaResult<AnyUserData> {
    let (ud, mut items) = loose(args);
    let child_type = Urid::from_lua(items.arg(0), lua)?;
    items.shift();
    write_vector(lua, target(&ud)?, child_type, &items)?;
    Ok(ud)
}

/// Dispatches on the driver kind of the first argument, forwarding the
/// remaining arguments to the matching writer.
fn typed(lua: &Lua, args: LooseArgs) -> LuaResult<AnyUserData> {
    let (ud, mut args) = loose(args);
    let urid = Urid::from_lua(args.arg(0), lua)?;
    args.shift();
    let kind = bindings(lua)?.drivers.kind_of(urid);
    let arg = |i: usize| args.arg(i);
    match kind {
        AtomKind::Int => int(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Long => long(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Float => float(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Double => double(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Bool => boolean(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Urid => self::urid(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::String => string(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Uri => uri(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Path => path(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Literal => literal(
            lua,
            (
                ud,
                FromLua::from_lua(arg(0), lua)?,
                FromLua::from_lua(arg(1), lua)?,
                FromLua::from_lua(arg(2), lua)?,
            ),
        ),
        AtomKind::Chunk => {
            let key = target(&ud)?;
            with_bytes(lua, &args, |bytes| write(lua, key, |f| f.chunk(bytes)))?;
            Ok(ud)
        }
        AtomKind::Midi => {
            let key = target(&ud)?;
            with_bytes(lua, &args, |bytes| write(lua, key, |f| f.midi(bytes)))?;
            Ok(ud)
        }
        AtomKind::Tuple => tuple(lua, ud),
        AtomKind::Object => object(lua, (ud, FromLua::from_lua(arg(0), lua)?, FromLua::from_lua(arg(1), lua)?)),
        AtomKind::Vector => {
            let child_type = Urid::from_lua(args.arg(0), lua)?;
            args.shift();
            write_vector(lua, target(&ud)?, child_type, &args)?;
            Ok(ud)
        }
        AtomKind::Sequence => sequence(lua, (ud, FromLua::from_lua(arg(0), lua)?)),
        AtomKind::Nil | AtomKind::Opaque => Err(BindingError::UnknownType.into()),
    }
}

/// Writes `value` as an atom of type `range`, as `typed` would. Vectors
/// take their element type from `child_type`. A zero range picks the type
/// from the Lua value.
pub(crate) fn typed_value(
    lua: &Lua,
    ud: AnyUserData,
    range: Urid,
    child_type: Urid,
    value: Value,
) -> LuaResult<AnyUserData> {
    let a = bindings(lua)?.uris.atom;
    let range = match (range, &value) {
        (0, Value::Integer(_)) => a.long,
        (0, Value::Number(_)) => a.double,
        (0, Value::Boolean(_)) => a.bool_,
        (0, Value::String(_)) => a.string,
        (0, _) => return Err(BindingError::UnknownType.into()),
        (range, _) => range,
    };
    let (first, second) = if range == a.vector {
        (Value::Integer(i64::from(child_type)), value)
    } else {
        (value, Value::Nil)
    };
    let nil = || Value::Nil;
    typed(
        lua,
        (
            ud,
            Value::Integer(i64::from(range)),
            first,
            second,
            nil(),
            nil(),
            nil(),
            nil(),
            nil(),
            Variadic::new(),
        ),
    )
}

// ── Composites ───────────────────────────────────────────────────────────────

fn tuple(lua: &Lua, ud: AnyUserData) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.push_tuple())?;
    derive(lua, &ud, [Some(frame), None])
}

fn object(lua: &Lua, (ud, id, otype): (AnyUserData, Option<Urid>, Option<Urid>)) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.push_object(id.unwrap_or(0), otype.unwrap_or(0)))?;
    derive(lua, &ud, [Some(frame), None])
}

fn sequence(lua: &Lua, (ud, unit): (AnyUserData, Option<Urid>)) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.push_sequence(unit.unwrap_or(0)))?;
    derive(lua, &ud, [Some(frame), None])
}

/// Closes the frames this forge opened. They must be the innermost open
/// frames; on a mismatch nothing is closed and the forge keeps its frames.
fn pop(lua: &Lua, ud: AnyUserData) -> LuaResult<()> {
    let frames = ud.borrow::<LuaForge>()?.frames;
    let key = target(&ud)?;
    match frames {
        [None, None] => return Ok(()),
        [Some(outer), Some(inner)] => write(lua, key, |f| f.pop_frames(&[outer, inner]))?,
        [Some(only), None] | [None, Some(only)] => write(lua, key, |f| f.pop_frames(&[only]))?,
    }
    ud.borrow_mut::<LuaForge>()?.frames = [None; 2];
    Ok(())
}

fn autopop(lua: &Lua, ud: AnyUserData) -> LuaResult<(Function, AnyUserData)> {
    ud.borrow::<LuaForge>()?.autopop.set(AutoPop::Begin);
    let next = lua
        .app_data_ref::<AutoPopFn>()
        .ok_or(BindingError::NoContext)?
        .0
        .clone();
    Ok((next, ud))
}

/// First call yields the forge itself, the second closes its frames and ends
/// the loop.
fn autopop_next(lua: &Lua, (ud, _): (AnyUserData, Value)) -> LuaResult<Option<AnyUserData>> {
    let state = ud.borrow::<LuaForge>()?.autopop.get();
    match state {
        AutoPop::Begin => {
            ud.borrow::<LuaForge>()?.autopop.set(AutoPop::End);
            Ok(Some(ud))
        }
        AutoPop::End => {
            pop(lua, ud)?;
            Ok(None)
        }
    }
}

// ── OSC ──────────────────────────────────────────────────────────────────────

fn timetag(value: Option<Value>) -> LuaResult<u64> {
    match value {
        None | Some(Value::Nil) => Ok(IMMEDIATE),
        Some(Value::Integer(t)) => Ok(t as u64),
        Some(Value::Number(seconds)) => {
            let integral = seconds.trunc();
            let fraction = ((seconds - integral) * 4_294_967_296.0) as u64;
            Ok(((integral as u64) << 32) | (fraction & 0xffff_ffff))
        }
        Some(_) => Err(BindingError::InvalidTimetag.into()),
    }
}

fn bundle(lua: &Lua, (ud, tag): (AnyUserData, Option<Value>)) -> LuaResult<AnyUserData> {
    let tag = timetag(tag)?;
    let frames = write(lua, target(&ud)?, |f| f.push_bundle(tag))?;
    derive(lua, &ud, frames.map(Some))
}

/// `message(path, format, ...)` arguments.
type MessageArgs = (
    AnyUserData,
    mlua::String,
    Option<mlua::String>,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Variadic<Value>,
);

fn osc_int(tag: char, v: &Value) -> LuaResult<i64> {
    match v {
        Value::Integer(i) => Ok(*i),
        Value::Number(n) => Ok(*n as i64),
        _ => Err(BindingError::OscNumber(tag).into()),
    }
}

fn osc_num(tag: char, v: &Value) -> LuaResult<f64> {
    match v {
        Value::Integer(i) => Ok(*i as f64),
        Value::Number(n) => Ok(*n),
        _ => Err(BindingError::OscNumber(tag).into()),
    }
}

fn next_arg<'a>(args: &'a Trailing, index: &mut usize, tag: char) -> LuaResult<&'a Value> {
    let value = args.get(*index).ok_or(BindingError::MissingOscArgument(tag))?;
    *index += 1;
    Ok(value)
}

fn message(lua: &Lua, (ud, path, fmt, a1, a2, a3, a4, a5, a6, a7, a8, rest): MessageArgs) -> LuaResult<AnyUserData> {
    let args = Trailing::new([a1, a2, a3, a4, a5, a6, a7, a8], rest);
    let path = path.to_str()?;
    let fmt = fmt.as_ref().map(|fmt| fmt.as_bytes());
    let tags: &[u8] = fmt.as_deref().unwrap_or(&[]);
    let mapper = bindings(lua)?.mapper.clone();
    write_with(lua, target(&ud)?, |f| {
        let frames = f.push_message(&path)?;
        let mut index = 0;
        let mut take = |tag: char| next_arg(&args, &mut index, tag);
        for tag in tags.iter().map(|b| char::from(*b)) {
            match tag {
                'i' => f.osc_arg(OscArg::Int(osc_int(tag, take(tag)?)? as i32))?,
                'f' => f.osc_arg(OscArg::Float(osc_num(tag, take(tag)?)? as f32))?,
                'h' => f.osc_arg(OscArg::Long(osc_int(tag, take(tag)?)?))?,
                'd' => f.osc_arg(OscArg::Double(osc_num(tag, take(tag)?)?))?,
                't' => f.osc_arg(OscArg::Timetag(timetag(Some(take(tag)?.clone()))?))?,
                'r' => f.osc_arg(OscArg::Rgba(osc_int(tag, take(tag)?)? as u32))?,
                'T' => f.osc_arg(OscArg::Bool(true))?,
                'F' => f.osc_arg(OscArg::Bool(false))?,
                'N' => f.osc_arg(OscArg::Nil)?,
                'I' => f.osc_arg(OscArg::Impulse)?,
                's' | 'b' | 'm' | 'S' | 'c' => match (tag, take(tag)?) {
                    ('S', Value::Integer(u)) => f.osc_arg(OscArg::Symbol(*u as Urid))?,
                    ('c', Value::Integer(c)) => {
                        f.osc_arg(OscArg::Char(char::from_u32(*c as u32).unwrap_or('\u{fffd}')))?
                    }
                    (_, Value::String(s)) => {
                        let bytes = s.as_bytes();
                        let text = || std::str::from_utf8(&bytes).map_err(|_| BindingError::InvalidUtf8(tag));
                        let arg = match tag {
                            's' => OscArg::String(text()?),
                            'S' => OscArg::Symbol(mapper.map(text()?)),
                            'c' => OscArg::Char(text()?.chars().next().unwrap_or('\0')),
                            'm' => OscArg::Midi(&bytes),
                            _ => OscArg::Blob(&bytes),
                        };
                        f.osc_arg(arg)?
                    }
                    _ => return Err(BindingError::OscString(tag).into()),
                },
                other => return Err(BindingError::UnknownOscTag(other).into()),
            }
        }
        f.pop_frames(&frames)?;
        Ok(())
    })?;
    Ok(ud)
}

// ── Patch vocabulary ─────────────────────────────────────────────────────────

fn get(
    lua: &Lua,
    (ud, subject, property, seq): (AnyUserData, Option<Urid>, Option<Urid>, Option<i32>),
) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.get(subject, seq, property))?;
    Ok(ud)
}

fn set(
    lua: &Lua,
    (ud, subject, property, seq): (AnyUserData, Option<Urid>, Urid, Option<i32>),
) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.set(subject, seq, property))?;
    derive(lua, &ud, [Some(frame), None])
}

fn put(lua: &Lua, (ud, subject, seq): (AnyUserData, Option<Urid>, Option<i32>)) -> LuaResult<AnyUserData> {
    let frames = write(lua, target(&ud)?, |f| f.put(subject, seq))?;
    derive(lua, &ud, frames.map(Some))
}

fn patch(lua: &Lua, (ud, subject, seq): (AnyUserData, Option<Urid>, Option<i32>)) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.patch(subject, seq))?;
    derive(lua, &ud, [Some(frame), None])
}

fn remove(lua: &Lua, ud: AnyUserData) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.patch_remove())?;
    derive(lua, &ud, [Some(frame), None])
}

fn add(lua: &Lua, ud: AnyUserData) -> LuaResult<AnyUserData> {
    let frame = write(lua, target(&ud)?, |f| f.patch_add())?;
    derive(lua, &ud, [Some(frame), None])
}

fn insert(lua: &Lua, (ud, subject, seq): (AnyUserData, Option<Urid>, Option<i32>)) -> LuaResult<AnyUserData> {
    let frames = write(lua, target(&ud)?, |f| f.insert(subject, seq))?;
    derive(lua, &ud, frames.map(Some))
}

fn ack(lua: &Lua, (ud, subject, seq): (AnyUserData, Option<Urid>, Option<i32>)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.ack(subject, seq))?;
    Ok(ud)
}

fn error(lua: &Lua, (ud, subject, seq): (AnyUserData, Option<Urid>, Option<i32>)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.error(subject, seq))?;
    Ok(ud)
}

fn delete(lua: &Lua, (ud, subject, seq): (AnyUserData, Urid, Option<i32>)) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.delete(subject, seq))?;
    Ok(ud)
}

fn copy(
    lua: &Lua,
    (ud, subject, destination, seq): (AnyUserData, Urid, Urid, Option<i32>),
) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.copy(subject, seq, destination))?;
    Ok(ud)
}

fn move_to(
    lua: &Lua,
    (ud, subject, destination, seq): (AnyUserData, Urid, Urid, Option<i32>),
) -> LuaResult<AnyUserData> {
    write(lua, target(&ud)?, |f| f.move_to(subject, seq, destination))?;
    Ok(ud)
}

impl UserData for LuaForge {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("frameTime", frame_time);
        methods.add_function("beatTime", beat_time);
        methods.add_function("time", time);

        methods.add_function("atom", atom);
        methods.add_function("int", int);
        methods.add_function("long", long);
        methods.add_function("float", float);
        methods.add_function("double", double);
        methods.add_function("bool", boolean);
        methods.add_function("urid", urid);
        methods.add_function("string", string);
        methods.add_function("uri", uri);
        methods.add_function("path", path);
        methods.add_function("literal", literal);
        methods.add_function("chunk", chunk);
        methods.add_function("midi", midi);
        methods.add_function("raw", raw);
        methods.add_function("typed", typed);
        methods.add_function("key", key);
        methods.add_function("vector", vector);

        methods.add_function("tuple", tuple);
        methods.add_function("object", object);
        methods.add_function("sequence", sequence);
        methods.add_function("pop", pop);
        methods.add_function("autopop", autopop);

        methods.add_function("bundle", bundle);
        methods.add_function("message", message);

        methods.add_function("get", get);
        methods.add_function("set", set);
        methods.add_function("put", put);
        methods.add_function("patch", patch);
        methods.add_function("remove", remove);
        methods.add_function("add", add);
        methods.add_function("insert", insert);
        methods.add_function("ack", ack);
        methods.add_function("error", error);
        methods.add_function("delete", delete);
        methods.add_function("copy", copy);
        methods.add_function("move", move_to);

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let name = match this.target.slot() {
                INPUT => "input",
                OUTPUT => "output",
                SCRATCH => "scratch",
                _ => "stash",
            };
            let offset = bindings(lua)?.arena.bytes(this.target).map_or(0, |bytes| bytes.len());
            let mut line = [0u8; 40];
            let mut out = &mut line[..];
            let _ = write!(out, "(forge: {}:{})", name, offset);
            let remaining = out.len();
            let len = line.len() - remaining;
            lua.create_string(&line[..len])
        });
    }
}
