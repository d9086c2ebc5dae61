/// `scripting/responder.rs` — Transport, OSC and state responders
///
/// `TimeResponder` follows the host transport and calls handlers keyed by
/// `Time.*` URIDs as positions arrive and whole beats go by.
/// `OSCResponder` routes OSC messages to handlers keyed by path, with OSC
/// address patterns. `StateResponder` answers `patch:Get`, `patch:Set` and
/// `patch:Put` for a table of parameters. `Parameter` is a callable table
/// holding one value under `RDF.value`.
///
/// Handlers receive their own table as `self`, like `MIDIResponder`.
use mlua::{
    AnyUserData, Function, Lua, MaybeSend, MetaMethod, Result as LuaResult, Table, UserData, UserDataMethods,
    Value, Variadic,
};

use super::arena::BufferKey;
use super::latom::{scalar_value, snapshot, AtomView};
use super::lforge::{self, typed_value, LuaForge};
use super::{bindings, BindingError, Bindings};
use crate::atom::driver::{AtomKind, Scalar};
use crate::atom::urid::{ParameterUris, PatchUris, TimeUris};
use crate::atom::{AtomRef, TimeStamp, Urid};

// ── Transport ─────────────────────────────────────────────────────────────────

/// Musical position tracked between `time:Position` updates.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Transport {
    pub bar_beat: f64,
    pub bar: i64,
    pub beat_unit: i64,
    pub beats_per_bar: f64,
    pub beats_per_minute: f64,
    pub frame: i64,
    pub frames_per_second: f64,
    pub speed: f64,
    /// Next whole beat to announce, on the same axis as `bar_beat`.
    next_beat: f64,
}

/// A whole beat reached while advancing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Beat {
    pub frames: i64,
    pub bar_started: bool,
}

impl Transport {
    pub fn new(frames_per_second: f64) -> Self {
        Self {
            bar_beat: 0.0,
            bar: 0,
            beat_unit: 4,
            beats_per_bar: 4.0,
            beats_per_minute: 120.0,
            frame: 0,
            frames_per_second,
            speed: 0.0,
            next_beat: 1.0,
        }
    }

    pub fn frames_per_beat(&self) -> f64 {
        240.0 / (self.beats_per_minute * self.beat_unit as f64) * self.frames_per_second
    }

    fn rolling(&self) -> bool {
        let per_beat = self.frames_per_beat();
        self.speed > 0.0 && per_beat.is_finite() && per_beat > 0.0 && self.beats_per_bar > 0.0
    }

    pub fn get(&self, t: &TimeUris, key: Urid) -> Value {
        match key {
            k if k == t.bar_beat => Value::Number(self.bar_beat),
            k if k == t.bar => Value::Integer(self.bar),
            k if k == t.beat_unit => Value::Integer(self.beat_unit),
            k if k == t.beats_per_bar => Value::Number(self.beats_per_bar),
            k if k == t.beats_per_minute => Value::Number(self.beats_per_minute),
            k if k == t.frame => Value::Integer(self.frame),
            k if k == t.frames_per_second => Value::Number(self.frames_per_second),
            k if k == t.speed => Value::Number(self.speed),
            _ => Value::Nil,
        }
    }

    /// Stores `value` under `key`; false for keys the transport ignores.
    pub fn set(&mut self, t: &TimeUris, key: Urid, value: f64) -> bool {
        match key {
            k if k == t.bar_beat => {
                self.bar_beat = value;
                self.next_beat = value.floor() + 1.0;
            }
            k if k == t.bar => self.bar = value as i64,
            k if k == t.beat_unit => self.beat_unit = value as i64,
            k if k == t.beats_per_bar => self.beats_per_bar = value,
            k if k == t.beats_per_minute => self.beats_per_minute = value,
            k if k == t.frame => self.frame = value as i64,
            k if k == t.frames_per_second => self.frames_per_second = value,
            k if k == t.speed => self.speed = value,
            _ => return false,
        }
        true
    }

    /// Moves `at` toward `to`. Stops at the next whole beat when one falls
    /// before `to` and returns it; a beat landing exactly on `to` belongs to
    /// the next block.
    pub fn step(&mut self, at: &mut f64, to: f64) -> Option<Beat> {
        if !self.rolling() || *at >= to {
            return None;
        }
        let per_beat = self.frames_per_beat() / self.speed;
        let crossing = (*at + (self.next_beat - self.bar_beat) * per_beat).max(*at);
        if crossing >= to {
            self.bar_beat += (to - *at) / per_beat;
            *at = to;
            return None;
        }
        *at = crossing;
        self.bar_beat = self.next_beat;
        self.next_beat += 1.0;
        let bar_started = self.bar_beat >= self.beats_per_bar;
        if bar_started {
            self.bar_beat -= self.beats_per_bar;
            self.next_beat -= self.beats_per_bar;
            self.bar += 1;
        }
        Some(Beat {
            frames: crossing.round() as i64,
            bar_started,
        })
    }

    pub fn advance_frame(&mut self, from: i64, to: i64) {
        if self.speed != 0.0 {
            self.frame += ((to - from) as f64 * self.speed).round() as i64;
        }
    }
}

// ── TimeResponder ─────────────────────────────────────────────────────────────

pub struct TimeResponder {
    transport: Transport,
}

/// Position properties applied per call; further ones are ignored.
const POSITION_FIELDS: usize = 16;

fn number(b: &Bindings, atom: &AtomRef<'_>) -> Option<f64> {
    match b.drivers.resolve(atom.urid).scalar(atom) {
        Scalar::Integer(v) => Some(v as f64),
        Scalar::Number(v) => Some(v),
        Scalar::Bool(v) => Some(f64::from(u8::from(v))),
        _ => None,
    }
}

fn notify(handlers: &Table, key: Urid, frames: i64, forge: &Value, value: Value) -> LuaResult<()> {
    match handlers.get::<Value>(key)? {
        Value::Nil => Ok(()),
        Value::Function(handler) => handler.call::<()>((handlers.clone(), frames, forge.clone(), value)),
        _ => Err(BindingError::HandlerNotFunction.into()),
    }
}

fn time_call(
    lua: &Lua,
    (ud, from, to, forge, atom): (AnyUserData, i64, i64, Value, Option<AnyUserData>),
) -> LuaResult<bool> {
    let t = bindings(lua)?.uris.time;
    let mut updates = [(0 as Urid, 0.0f64); POSITION_FIELDS];
    let mut count = 0;
    let handled = match &atom {
        Some(atom) => {
            let (view, _) = snapshot(atom)?;
            view.with(lua, |atom, _, b| {
                let is_position = atom.urid == b.uris.atom.object
                    && atom.object_header().is_some_and(|h| h.otype == t.position);
                if !is_position {
                    return Ok(false);
                }
                for prop in atom.properties() {
                    if count == updates.len() {
                        break;
                    }
                    if let Some(value) = number(b, &prop.value) {
                        updates[count] = (prop.key, value);
                        count += 1;
                    }
                }
                Ok(true)
            })?
        }
        None => false,
    };

    let handlers: Table = ud.user_value()?;
    for &(key, value) in &updates[..count] {
        let value = {
            let mut this = ud.borrow_mut::<TimeResponder>()?;
            if !this.transport.set(&t, key, value) {
                continue;
            }
            this.transport.get(&t, key)
        };
        notify(&handlers, key, from, &forge, value)?;
    }

    let mut at = from as f64;
    loop {
        let step = {
            let mut this = ud.borrow_mut::<TimeResponder>()?;
            let beat = this.transport.step(&mut at, to as f64);
            beat.map(|beat| (beat, this.transport.bar, this.transport.bar_beat))
        };
        let Some((beat, bar, bar_beat)) = step else {
            break;
        };
        if beat.bar_started {
            notify(&handlers, t.bar, beat.frames, &forge, Value::Integer(bar))?;
        }
        notify(&handlers, t.bar_beat, beat.frames, &forge, Value::Number(bar_beat))?;
    }
    ud.borrow_mut::<TimeResponder>()?.transport.advance_frame(from, to);
    Ok(handled)
}

fn time_index(lua: &Lua, (ud, key): (AnyUserData, Value)) -> LuaResult<Value> {
    let Value::Integer(key) = key else {
        return Ok(Value::Nil);
    };
    let Ok(key) = Urid::try_from(key) else {
        return Ok(Value::Nil);
    };
    let t = bindings(lua)?.uris.time;
    Ok(ud.borrow::<TimeResponder>()?.transport.get(&t, key))
}

/// Writes the full transport as a `time:Position` object.
fn time_stash(lua: &Lua, (ud, forge): (AnyUserData, AnyUserData)) -> LuaResult<AnyUserData> {
    let tr = ud.borrow::<TimeResponder>()?.transport;
    let key = forge.borrow::<LuaForge>()?.target;
    lforge::write(lua, key, |f| {
        let t = f.uris().time;
        let frame = f.push_object(0, t.position)?;
        f.key(t.bar_beat, 0)?;
        f.float(tr.bar_beat as f32)?;
        f.key(t.bar, 0)?;
        f.long(tr.bar)?;
        f.key(t.beat_unit, 0)?;
        f.int(tr.beat_unit as i32)?;
        f.key(t.beats_per_bar, 0)?;
        f.float(tr.beats_per_bar as f32)?;
        f.key(t.beats_per_minute, 0)?;
        f.float(tr.beats_per_minute as f32)?;
        f.key(t.frame, 0)?;
        f.long(tr.frame)?;
        f.key(t.frames_per_second, 0)?;
        f.float(tr.frames_per_second as f32)?;
        f.key(t.speed, 0)?;
        f.float(tr.speed as f32)?;
        f.pop(frame)
    })?;
    Ok(forge)
}

fn time_apply(lua: &Lua, (ud, atom): (AnyUserData, AnyUserData)) -> LuaResult<bool> {
    time_call(lua, (ud, 0, 0, Value::Nil, Some(atom)))
}

impl UserData for TimeResponder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_function("stash", time_stash);
        methods.add_function("apply", time_apply);
        methods.add_meta_function(MetaMethod::Call, time_call);
        methods.add_meta_function(MetaMethod::Index, time_index);
    }
}

// ── OSCResponder ──────────────────────────────────────────────────────────────

pub struct OscResponder;

/// Type tags accepted per message.
pub const MAX_OSC_ARGS: usize = 64;
/// Arguments passed in fixed slots; the rest go through a `Variadic`.
const OSC_SLOTS: usize = 8;

fn has_wildcards(path: &[u8]) -> bool {
    path.iter().any(|c| b"?*[{".contains(c))
}

fn in_set(set: &[u8], c: u8) -> bool {
    let (negate, set) = match set.split_first() {
        Some((b'!', rest)) => (true, rest),
        _ => (false, set),
    };
    let mut found = false;
    let mut i = 0;
    while i < set.len() {
        if i + 2 < set.len() && set[i + 1] == b'-' {
            found |= (set[i]..=set[i + 2]).contains(&c);
            i += 3;
        } else {
            found |= set[i] == c;
            i += 1;
        }
    }
    found != negate
}

/// OSC 1.0 address pattern match: `?`, `*`, `[abc]`, `[a-z]`, `[!a]` and
/// `{foo,bar}`. Only `{..}` alternatives may span a `/`.
pub fn osc_match(pattern: &[u8], address: &[u8]) -> bool {
    match pattern.split_first() {
        None => address.is_empty(),
        Some((b'*', rest)) => (0..=address.len())
            .take_while(|&i| i == 0 || address[i - 1] != b'/')
            .any(|i| osc_match(rest, &address[i..])),
        Some((b'?', rest)) => matches!(address.split_first(), Some((c, tail)) if *c != b'/' && osc_match(rest, tail)),
        Some((b'[', rest)) => {
            let Some(end) = rest.iter().position(|&c| c == b']') else {
                return false;
            };
            matches!(address.split_first(),
                Some((c, tail)) if *c != b'/' && in_set(&rest[..end], *c) && osc_match(&rest[end + 1..], tail))
        }
        Some((b'{', rest)) => {
            let Some(end) = rest.iter().position(|&c| c == b'}') else {
                return false;
            };
            let tail = &rest[end + 1..];
            rest[..end]
                .split(|&c| c == b',')
                .any(|alt| address.starts_with(alt) && osc_match(tail, &address[alt.len()..]))
        }
        Some((c, rest)) => matches!(address.split_first(), Some((a, tail)) if a == c && osc_match(rest, tail)),
    }
}

struct OscMessage {
    path: mlua::String,
    fmt: mlua::String,
    slots: [Value; OSC_SLOTS],
    count: usize,
    rest: Variadic<Value>,
}

enum OscItem {
    Message(OscMessage),
    Bundle(usize),
    Other,
}

fn byte_table(lua: &Lua, bytes: &[u8]) -> LuaResult<Value> {
    Ok(Value::Table(lua.create_sequence_from(bytes.iter().copied())?))
}

/// Type tag and handler value of one stored argument. `None` for atoms
/// that are not OSC arguments; flags like `T` carry no value.
fn osc_argument(lua: &Lua, b: &Bindings, arg: &AtomRef<'_>) -> LuaResult<Option<(u8, Option<Value>)>> {
    let osc = b.uris.osc;
    let integer = |v: Option<i64>| v.map(Value::Integer);
    Ok(Some(match b.drivers.kind_of(arg.urid) {
        AtomKind::Int => (b'i', integer(arg.as_i32().map(i64::from))),
        AtomKind::Float => (b'f', arg.as_f32().map(|v| Value::Number(f64::from(v)))),
        AtomKind::String => (b's', Some(Value::String(lua.create_string(arg.string_bytes())?))),
        AtomKind::Urid => (b'S', integer(arg.as_u32().map(i64::from))),
        AtomKind::Chunk => (b'b', Some(byte_table(lua, arg.body)?)),
        AtomKind::Bool => (if arg.as_i32().unwrap_or(0) != 0 { b'T' } else { b'F' }, None),
        AtomKind::Long => (b'h', integer(arg.as_i64())),
        AtomKind::Double => (b'd', arg.as_f64().map(Value::Number)),
        AtomKind::Midi => (b'm', Some(byte_table(lua, arg.body)?)),
        AtomKind::Object if arg.object_header().is_some_and(|h| h.otype == osc.timetag) => {
            let part = |key| arg.property(key).and_then(|v| v.as_i64()).unwrap_or(0) as u64;
            let timetag = (part(osc.timetag_integral) << 32) | (part(osc.timetag_fraction) & 0xffff_ffff);
            (b't', Some(Value::Integer(timetag as i64)))
        }
        AtomKind::Literal => {
            let Some((datatype, _, text)) = arg.literal() else {
                return Ok(None);
            };
            let text = std::str::from_utf8(text).ok();
            if datatype == osc.char_ {
                let c = text.and_then(|t| t.chars().next()).map_or(0, u32::from);
                (b'c', Some(Value::Integer(i64::from(c))))
            } else if datatype == osc.rgba {
                let rgba = text.and_then(|t| u32::from_str_radix(t, 16).ok()).unwrap_or(0);
                (b'r', Some(Value::Integer(i64::from(rgba))))
            } else {
                return Ok(None);
            }
        }
        _ if arg.urid == osc.nil => (b'N', None),
        _ if arg.urid == osc.impulse => (b'I', None),
        _ => return Ok(None),
    }))
}

fn read_osc(lua: &Lua, b: &Bindings, atom: AtomRef<'_>) -> LuaResult<OscItem> {
    let osc = b.uris.osc;
    let Some(header) = atom.object_header().filter(|_| atom.urid == b.uris.atom.object) else {
        return Ok(OscItem::Other);
    };
    if header.otype == osc.bundle {
        let items = atom.property(osc.bundle_items).map_or(0, |items| items.tuple_items().count());
        return Ok(OscItem::Bundle(items));
    }
    if header.otype != osc.message {
        return Ok(OscItem::Other);
    }
    let Some(path) = atom.property(osc.message_path) else {
        return Ok(OscItem::Other);
    };

    let mut fmt = [0u8; MAX_OSC_ARGS];
    let mut len = 0;
    let mut slots: [Value; OSC_SLOTS] = std::array::from_fn(|_| Value::Nil);
    let mut count = 0;
    let mut rest = Variadic::new();
    let args = atom.property(osc.message_arguments);
    for arg in args.into_iter().flat_map(|args| args.tuple_items()) {
        let Some((tag, value)) = osc_argument(lua, b, &arg)? else {
            continue;
        };
        if len == fmt.len() {
            return Err(BindingError::TooManyOscArguments(MAX_OSC_ARGS).into());
        }
        fmt[len] = tag;
        len += 1;
        if let Some(value) = value {
            match slots.get_mut(count) {
                Some(slot) => *slot = value,
                None => rest.push(value),
            }
            count += 1;
        }
    }
    Ok(OscItem::Message(OscMessage {
        path: lua.create_string(path.string_bytes())?,
        fmt: lua.create_string(&fmt[..len])?,
        slots,
        count,
        rest,
    }))
}

/// Calls `handler` with exactly the arguments the message carries.
fn call_osc(handler: &Function, handlers: &Table, frames: i64, forge: &Value, msg: &OscMessage) -> LuaResult<()> {
    let (t, fr, fo, fmt) = (handlers.clone(), frames, forge.clone(), msg.fmt.clone());
    let [a, b, c, d, e, f, g, h] = msg.slots.clone();
    match msg.count {
        0 => handler.call::<()>((t, fr, fo, fmt)),
        1 => handler.call::<()>((t, fr, fo, fmt, a)),
        2 => handler.call::<()>((t, fr, fo, fmt, a, b)),
        3 => handler.call::<()>((t, fr, fo, fmt, a, b, c)),
        4 => handler.call::<()>((t, fr, fo, fmt, a, b, c, d)),
        5 => handler.call::<()>((t, fr, fo, fmt, a, b, c, d, e)),
        6 => handler.call::<()>((t, fr, fo, fmt, a, b, c, d, e, f)),
        7 => handler.call::<()>((t, fr, fo, fmt, a, b, c, d, e, f, g)),
        8 => handler.call::<()>((t, fr, fo, fmt, a, b, c, d, e, f, g, h)),
        _ => handler.call::<()>((t, fr, fo, fmt, a, b, c, d, e, f, g, h, msg.rest.clone())),
    }
}

fn deliver(handlers: &Table, frames: i64, forge: &Value, msg: &OscMessage) -> LuaResult<()> {
    let path = msg.path.as_bytes();
    if !has_wildcards(&path) {
        return match handlers.get::<Value>(msg.path.clone())? {
            Value::Nil => Ok(()),
            Value::Function(handler) => call_osc(&handler, handlers, frames, forge, msg),
            _ => Err(BindingError::HandlerNotFunction.into()),
        };
    }
    handlers.for_each(|key: Value, handler: Value| {
        let Value::String(key) = key else {
            return Ok(());
        };
        if !osc_match(&path, &key.as_bytes()) {
            return Ok(());
        }
        match handler {
            Value::Function(handler) => call_osc(&handler, handlers, frames, forge, msg),
            _ => Err(BindingError::HandlerNotFunction.into()),
        }
    })
}

fn dispatch_osc(lua: &Lua, handlers: &Table, frames: i64, forge: &Value, view: &AtomView) -> LuaResult<bool> {
    match view.with(lua, |atom, _, b| read_osc(lua, b, atom))? {
        OscItem::Other => Ok(false),
        OscItem::Message(msg) => {
            deliver(handlers, frames, forge, &msg)?;
            Ok(true)
        }
        OscItem::Bundle(items) => {
            for i in 0..items {
                let child = view.with(lua, |atom, bytes, b| {
                    let item = atom
                        .property(b.uris.osc.bundle_items)
                        .and_then(|items| items.tuple_items().nth(i));
                    Ok(item.and_then(|item| view.child(item, bytes)))
                })?;
                if let Some(child) = child {
                    dispatch_osc(lua, handlers, frames, forge, &child)?;
                }
            }
            Ok(true)
        }
    }
}

fn osc_call(
    lua: &Lua,
    (ud, frames, forge, atom): (AnyUserData, i64, Value, Option<AnyUserData>),
) -> LuaResult<bool> {
    let Some(atom) = atom else {
        return Ok(false);
    };
    let (view, _) = snapshot(&atom)?;
    let handlers: Table = ud.user_value()?;
    dispatch_osc(lua, &handlers, frames, &forge, &view)
}

impl UserData for OscResponder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Call, osc_call);
    }
}

// ── StateResponder ────────────────────────────────────────────────────────────

/// Answers property patches for `props[Patch.writable]` and
/// `props[Patch.readable]`, tables of parameters keyed by property URID.
///
/// Parameter descriptions carry label, range, comment, minimum, maximum
/// and child type. Units, colours, syntax and scale points are not
/// announced.
pub struct StateResponder;

#[derive(Clone, Copy)]
struct Keys {
    patch: PatchUris,
    param: ParameterUris,
    vector: Urid,
    string: Urid,
}

impl Keys {
    fn load(lua: &Lua) -> LuaResult<Self> {
        let b = bindings(lua)?;
        Ok(Self {
            patch: b.uris.patch,
            param: b.uris.param,
            vector: b.uris.atom.vector,
            string: b.uris.atom.string,
        })
    }
}

/// Where and how a reply is addressed.
#[derive(Clone, Copy)]
struct Reply {
    frames: i64,
    subject: Option<Urid>,
    seq: Option<i32>,
}

enum Request {
    Ignored,
    Register { subject: Option<Urid>, seq: Option<i32> },
    Get { subject: Option<Urid>, seq: Option<i32>, property: Option<Urid> },
    Set { seq: Option<i32>, property: Option<Urid>, value: Value },
    Put { seq: Option<i32>, body: Option<usize> },
}

fn read_request(lua: &Lua, b: &Bindings, atom: AtomRef<'_>) -> LuaResult<Request> {
    let (a, p) = (b.uris.atom, b.uris.patch);
    let Some(header) = atom.object_header().filter(|_| atom.urid == a.object) else {
        return Ok(Request::Ignored);
    };
    let urid_at = |key| atom.property(key).filter(|v| v.urid == a.urid).and_then(|v| v.as_u32());
    let subject = urid_at(p.subject);
    let addressed = atom.property(p.subject).is_none() || subject == Some(p.self_);
    let seq = atom
        .property(p.sequence_number)
        .filter(|v| v.urid == a.int)
        .and_then(|v| v.as_i32())
        .filter(|seq| *seq != 0);

    Ok(match header.otype {
        o if o == p.get && addressed => match atom.property(p.property) {
            None => Request::Register { subject, seq },
            Some(_) => Request::Get {
                subject,
                seq,
                property: urid_at(p.property),
            },
        },
        o if o == p.set && addressed => Request::Set {
            seq,
            property: urid_at(p.property),
            value: match atom.property(p.value) {
                Some(value) => scalar_value(lua, b, &value)?,
                None => Value::Nil,
            },
        },
        o if o == p.put => Request::Put {
            seq,
            body: atom
                .property(p.body)
                .filter(|body| body.urid == a.object)
                .map(|body| body.properties().count()),
        },
        _ => Request::Ignored,
    })
}

fn access(props: &Table, key: Urid) -> LuaResult<Option<Table>> {
    Ok(match props.get::<Value>(key)? {
        Value::Table(t) => Some(t),
        _ => None,
    })
}

fn param_of(params: Option<&Table>, property: Urid) -> LuaResult<Option<Table>> {
    let Some(params) = params else {
        return Ok(None);
    };
    Ok(match params.get::<Value>(property)? {
        Value::Table(t) => Some(t),
        _ => None,
    })
}

fn urid_field(param: &Table, key: Urid) -> LuaResult<Urid> {
    Ok(match param.get::<Value>(key)? {
        Value::Integer(v) => Urid::try_from(v).unwrap_or(0),
        _ => 0,
    })
}

fn string_field(param: &Table, key: Urid) -> LuaResult<Option<mlua::String>> {
    Ok(match param.get::<Value>(key)? {
        Value::String(s) => Some(s),
        _ => None,
    })
}

fn target(forge: &AnyUserData) -> LuaResult<BufferKey> {
    Ok(forge.borrow::<LuaForge>()?.target)
}

/// `patch:Ack` or `patch:Error` for requests that carry a sequence number.
fn answer(lua: &Lua, forge: &AnyUserData, frames: i64, seq: Option<i32>, ok: bool) -> LuaResult<()> {
    let Some(seq) = seq else {
        return Ok(());
    };
    lforge::write(lua, target(forge)?, |f| {
        f.time(TimeStamp::Frames(frames))?;
        if ok {
            f.ack(None, Some(seq))
        } else {
            f.error(None, Some(seq))
        }
    })
}

/// Writes `param`'s value under its property key, typed by its range.
fn write_value(lua: &Lua, keys: &Keys, forge: &AnyUserData, property: Urid, param: &Table) -> LuaResult<()> {
    let value: Value = param.get(keys.param.value)?;
    if value.is_nil() {
        return Ok(());
    }
    let range = urid_field(param, keys.param.range)?;
    let child_type = urid_field(param, keys.param.child_type)?;
    lforge::write(lua, target(forge)?, |f| f.key(property, 0))?;
    typed_value(lua, forge.clone(), range, child_type, value)?;
    Ok(())
}

fn write_values(lua: &Lua, keys: &Keys, forge: &AnyUserData, params: &Table) -> LuaResult<()> {
    params.for_each(|property: Value, param: Value| match (property, param) {
        (Value::Integer(property), Value::Table(param)) => match Urid::try_from(property) {
            Ok(property) => write_value(lua, keys, forge, property, &param),
            Err(_) => Ok(()),
        },
        _ => Ok(()),
    })
}

/// Announces one parameter: its access, then its description.
fn announce(
    lua: &Lua,
    keys: &Keys,
    forge: &AnyUserData,
    reply: Reply,
    (access, property): (Urid, Urid),
    param: &Table,
) -> LuaResult<()> {
    let Reply { frames, subject, seq } = reply;
    let (pk, patch) = (keys.param, keys.patch);
    let key = target(forge)?;
    lforge::write(lua, key, |f| {
        f.time(TimeStamp::Frames(frames))?;
        let outer = f.patch(subject, seq)?;
        let remove = f.patch_remove()?;
        f.key(access, 0)?;
        f.urid(property)?;
        f.pop(remove)?;
        let add = f.patch_add()?;
        f.key(access, 0)?;
        f.urid(property)?;
        f.pop(add)?;
        f.pop(outer)
    })?;

    let label = string_field(param, pk.label)?;
    let comment = string_field(param, pk.comment)?;
    let range = urid_field(param, pk.range)?;
    let child_type = urid_field(param, pk.child_type)?;
    let bound_type = if range == keys.vector { child_type } else { range };
    let label = label.as_ref().map(|s| s.as_bytes());
    let comment = comment.as_ref().map(|s| s.as_bytes());

    let [outer, add] = lforge::write(lua, key, |f| {
        f.time(TimeStamp::Frames(frames))?;
        let outer = f.patch(Some(property), seq)?;
        let remove = f.patch_remove()?;
        for described in [pk.label, pk.range, pk.comment, pk.minimum, pk.maximum] {
            f.key(described, 0)?;
            f.urid(patch.wildcard)?;
        }
        f.pop(remove)?;
        let add = f.patch_add()?;
        f.key(pk.label, 0)?;
        f.text(keys.string, label.as_deref().unwrap_or_default())?;
        f.key(pk.range, 0)?;
        f.urid(range)?;
        if let Some(comment) = comment.as_deref() {
            f.key(pk.comment, 0)?;
            f.text(keys.string, comment)?;
        }
        Ok([outer, add])
    })?;
    for bound in [pk.minimum, pk.maximum] {
        let value: Value = param.get(bound)?;
        if !value.is_nil() {
            lforge::write(lua, key, |f| f.key(bound, 0))?;
            typed_value(lua, forge.clone(), bound_type, 0, value)?;
        }
    }
    lforge::write(lua, key, |f| f.pop_frames(&[outer, add]))
}

fn register(lua: &Lua, props: &Table, forge: &AnyUserData, reply: Reply) -> LuaResult<()> {
    let keys = Keys::load(lua)?;
    let Reply { frames, subject, seq } = reply;
    let patch = keys.patch;
    lforge::write(lua, target(forge)?, |f| {
        f.time(TimeStamp::Frames(frames))?;
        let outer = f.patch(subject, seq)?;
        let remove = f.patch_remove()?;
        f.key(patch.writable, 0)?;
        f.urid(patch.wildcard)?;
        f.key(patch.readable, 0)?;
        f.urid(patch.wildcard)?;
        f.pop(remove)?;
        let add = f.patch_add()?;
        f.pop(add)?;
        f.pop(outer)
    })?;
    for access_key in [patch.writable, patch.readable] {
        let Some(params) = access(props, access_key)? else {
            continue;
        };
        params.for_each(|property: Value, param: Value| match (property, param) {
            (Value::Integer(property), Value::Table(param)) => match Urid::try_from(property) {
                Ok(property) => announce(lua, &keys, forge, reply, (access_key, property), &param),
                Err(_) => Ok(()),
            },
            _ => Ok(()),
        })?;
    }
    Ok(())
}

fn reply_value(lua: &Lua, keys: &Keys, forge: &AnyUserData, reply: Reply, property: Urid, param: &Table) -> LuaResult<()> {
    let key = target(forge)?;
    let value_key = keys.patch.value;
    let frame = lforge::write(lua, key, |f| {
        f.time(TimeStamp::Frames(reply.frames))?;
        f.set_property(reply.subject, reply.seq, property)
    })?;
    write_value(lua, keys, forge, value_key, param)?;
    lforge::write(lua, key, |f| f.pop(frame))
}

fn state_call(
    lua: &Lua,
    (ud, frames, forge, atom): (AnyUserData, i64, AnyUserData, AnyUserData),
) -> LuaResult<bool> {
    let (view, _) = snapshot(&atom)?;
    let request = view.with(lua, |atom, _, b| read_request(lua, b, atom))?;
    let props: Table = ud.user_value()?;
    let keys = Keys::load(lua)?;
    let writable = access(&props, keys.patch.writable)?;

    match request {
        Request::Ignored => Ok(false),
        Request::Register { subject, seq } => {
            register(lua, &props, &forge, Reply { frames, subject, seq })?;
            Ok(true)
        }
        Request::Get { subject, seq, property } => {
            let found = match property {
                Some(property) => {
                    let readable = access(&props, keys.patch.readable)?;
                    let param = match param_of(writable.as_ref(), property)? {
                        Some(param) => Some(param),
                        None => param_of(readable.as_ref(), property)?,
                    };
                    param.map(|param| (property, param))
                }
                None => None,
            };
            match found {
                Some((property, param)) => {
                    reply_value(lua, &keys, &forge, Reply { frames, subject, seq }, property, &param)?;
                    Ok(true)
                }
                None => {
                    answer(lua, &forge, frames, seq, false)?;
                    Ok(false)
                }
            }
        }
        Request::Set { seq, property, value } => {
            let param = match property {
                Some(property) if !value.is_nil() => param_of(writable.as_ref(), property)?,
                _ => None,
            };
            let Some(param) = param else {
                answer(lua, &forge, frames, seq, false)?;
                return Ok(false);
            };
            param.set(keys.param.value, value)?;
            answer(lua, &forge, frames, seq, true)?;
            Ok(true)
        }
        Request::Put { seq, body: None } => {
            answer(lua, &forge, frames, seq, false)?;
            Ok(false)
        }
        Request::Put { seq, body: Some(count) } => {
            for i in 0..count {
                let entry = view.with(lua, |atom, _, b| {
                    let prop = atom
                        .property(b.uris.patch.body)
                        .and_then(|body| body.properties().nth(i));
                    match prop {
                        Some(prop) => Ok(Some((prop.key, scalar_value(lua, b, &prop.value)?))),
                        None => Ok(None),
                    }
                })?;
                let Some((property, value)) = entry else {
                    continue;
                };
                if let Some(param) = param_of(writable.as_ref(), property)? {
                    param.set(keys.param.value, value)?;
                }
            }
            answer(lua, &forge, frames, seq, true)?;
            Ok(true)
        }
    }
}

fn state_register(lua: &Lua, (ud, frames, forge): (AnyUserData, i64, AnyUserData)) -> LuaResult<AnyUserData> {
    let props: Table = ud.user_value()?;
    let this = bindings(lua)?.uris.patch.self_;
    let reply = Reply {
        frames,
        subject: Some(this),
        seq: None,
    };
    register(lua, &props, &forge, reply)?;
    Ok(forge)
}

/// Sends every value, writable and readable, in one `patch:Put`.
fn state_sync(lua: &Lua, (ud, frames, forge): (AnyUserData, i64, AnyUserData)) -> LuaResult<AnyUserData> {
    let props: Table = ud.user_value()?;
    let keys = Keys::load(lua)?;
    let key = target(&forge)?;
    let this = keys.patch.self_;
    let frames_open = lforge::write(lua, key, |f| {
        f.time(TimeStamp::Frames(frames))?;
        f.put(Some(this), None)
    })?;
    for access_key in [keys.patch.writable, keys.patch.readable] {
        if let Some(params) = access(&props, access_key)? {
            write_values(lua, &keys, &forge, &params)?;
        }
    }
    lforge::write(lua, key, |f| f.pop_frames(&frames_open))?;
    Ok(forge)
}

/// Writes the writable values as a plain object.
fn state_stash(lua: &Lua, (ud, forge): (AnyUserData, AnyUserData)) -> LuaResult<AnyUserData> {
    let props: Table = ud.user_value()?;
    let keys = Keys::load(lua)?;
    let Some(params) = access(&props, keys.patch.writable)? else {
        return Ok(forge);
    };
    let key = target(&forge)?;
    let frame = lforge::write(lua, key, |f| f.push_object(0, 0))?;
    write_values(lua, &keys, &forge, &params)?;
    lforge::write(lua, key, |f| f.pop(frame))?;
    Ok(forge)
}

/// Loads writable values from an object written by `stash`.
fn state_apply(lua: &Lua, (ud, atom): (AnyUserData, AnyUserData)) -> LuaResult<bool> {
    let (view, _) = snapshot(&atom)?;
    let count = view.with(lua, |atom, _, b| {
        Ok((atom.urid == b.uris.atom.object).then(|| atom.properties().count()))
    })?;
    let Some(count) = count else {
        return Ok(false);
    };
    let props: Table = ud.user_value()?;
    let keys = Keys::load(lua)?;
    let Some(writable) = access(&props, keys.patch.writable)? else {
        return Ok(true);
    };
    for i in 0..count {
        let entry = view.with(lua, |atom, _, b| match atom.properties().nth(i) {
            Some(prop) => Ok(Some((prop.key, scalar_value(lua, b, &prop.value)?))),
            None => Ok(None),
        })?;
        if let Some((property, value)) = entry {
            if let Some(param) = param_of(Some(&writable), property)? {
                param.set(keys.param.value, value)?;
            }
        }
    }
    Ok(true)
}

impl UserData for StateResponder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Call, state_call);
        methods.add_function("register", state_register);
        methods.add_function("sync", state_sync);
        methods.add_function("stash", state_stash);
        methods.add_function("apply", state_apply);
    }
}

// ── Registration ──────────────────────────────────────────────────────────────

fn responder<T: UserData + MaybeSend + 'static>(lua: &Lua, value: T, handlers: Option<Table>) -> LuaResult<AnyUserData> {
    let handlers = match handlers {
        Some(handlers) => handlers,
        None => lua.create_table()?,
    };
    let ud = lua.create_userdata(value)?;
    ud.set_user_value(handlers)?;
    Ok(ud)
}

pub(crate) fn register_all(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    globals.set(
        "TimeResponder",
        lua.create_function(|lua, handlers: Option<Table>| {
            let rate = f64::from(bindings(lua)?.sample_rate);
            let transport = Transport::new(rate);
            responder(lua, TimeResponder { transport }, handlers)
        })?,
    )?;
    globals.set(
        "OSCResponder",
        lua.create_function(|lua, handlers: Option<Table>| responder(lua, OscResponder, handlers))?,
    )?;
    globals.set(
        "StateResponder",
        lua.create_function(|lua, props: Option<Table>| responder(lua, StateResponder, props))?,
    )?;

    // `p()` reads `p[RDF.value]`, `p(v)` stores `v` and returns the old value.
    let meta = lua.create_table()?;
    meta.set(
        "__call",
        lua.create_function(|lua, (this, value): (Table, Value)| {
            let key = bindings(lua)?.uris.param.value;
            let old: Value = this.get(key)?;
            if !value.is_nil() {
                this.set(key, value)?;
            }
            Ok(old)
        })?,
    )?;
    globals.set(
        "Parameter",
        lua.create_function(move |lua, this: Option<Table>| {
            let this = match this {
                Some(this) => this,
                None => lua.create_table()?,
            };
            this.set_metatable(Some(meta.clone()));
            Ok(this)
        })?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::urid::Uris;
    use crate::atom::AtomRef;
    use crate::forge::osc::OscArg;
    use crate::scripting::arena::OUTPUT;
    use crate::scripting::handle::forge_handle;
    use crate::scripting::latom::tests::bind_input;
    use crate::scripting::bindings_mut;
    use crate::scripting::tests::lua_with_bindings;
    use std::sync::Arc;

    fn time_uris() -> (Arc<Uris>, TimeUris) {
        let map = crate::atom::urid::UridMap::new();
        let uris = Arc::new(Uris::new(&map));
        let t = uris.time;
        (uris, t)
    }

    /// Binds a fresh output slot and exposes its forge as the global `f`.
    fn bind_output(lua: &Lua) -> BufferKey {
        let out = bindings_mut(lua).unwrap().arena.bind_output(OUTPUT, 2048).unwrap();
        let forge = forge_handle(lua, LuaForge::new(out, false)).unwrap();
        lua.globals().set("f", forge).unwrap();
        out
    }

    fn output(lua: &Lua, out: BufferKey) -> Vec<u8> {
        bindings(lua).unwrap().arena.bytes(out).unwrap().to_vec()
    }

    #[test]
    fn transport_announces_beats_and_wraps_bars() {
        let (_, t) = time_uris();
        let mut tr = Transport::new(48_000.0);
        tr.set(&t, t.beats_per_bar, 2.0);
        tr.set(&t, t.speed, 1.0);
        assert_eq!(tr.frames_per_beat(), 24_000.0);

        let mut at = 0.0;
        assert_eq!(tr.step(&mut at, 24_000.0), None);
        assert_eq!(tr.bar_beat, 1.0);

        let mut at = 24_000.0;
        let beat = tr.step(&mut at, 48_000.0).unwrap();
        assert_eq!(beat, Beat { frames: 24_000, bar_started: false });
        assert_eq!(tr.step(&mut at, 48_000.0), None);

        let mut at = 48_000.0;
        let beat = tr.step(&mut at, 72_000.0).unwrap();
        assert!(beat.bar_started);
        assert_eq!((tr.bar, tr.bar_beat), (1, 0.0));
    }

    #[test]
    fn stopped_or_degenerate_transport_never_steps() {
        let (_, t) = time_uris();
        let mut tr = Transport::new(48_000.0);
        let mut at = 0.0;
        assert_eq!(tr.step(&mut at, 1e9), None);

        tr.set(&t, t.speed, 1.0);
        tr.set(&t, t.beats_per_minute, 0.0);
        assert_eq!(tr.step(&mut at, 1e9), None);
        tr.set(&t, t.beats_per_minute, 120.0);
        tr.set(&t, t.frames_per_second, f64::NAN);
        assert_eq!(tr.step(&mut at, 1e9), None);
        assert!(!tr.set(&t, t.position, 1.0));
    }

    #[test]
    fn time_responder_applies_positions_and_fires_beats() {
        let lua = lua_with_bindings();
        bind_input(&lua, |f| {
            let t = f.uris().time;
            let frame = f.push_object(0, t.position).unwrap();
            f.key(t.beats_per_minute, 0).unwrap();
            f.float(120.0).unwrap();
            f.key(t.speed, 0).unwrap();
            f.float(1.0).unwrap();
            f.key(t.bar_beat, 0).unwrap();
            f.float(3.5).unwrap();
            f.pop(frame).unwrap();
        });
        lua.load(
            "events = {}
             local function log(name)
                 return function(self, frames, data, value)
                     events[#events + 1] = {name, frames, value}
                 end
             end
             tr = TimeResponder({
                 [Time.speed] = log('speed'),
                 [Time.barBeat] = log('barBeat'),
                 [Time.bar] = log('bar'),
             })
             assert(tr(0, 24000, nil, a) == true)
             assert(tr(24000, 48000) == false)",
        )
        .exec()
        .unwrap();
        let events: Vec<(String, i64, f64)> = lua
            .load("return events")
            .eval::<Vec<Table>>()
            .unwrap()
            .into_iter()
            .map(|e| (e.get(1).unwrap(), e.get(2).unwrap(), e.get(3).unwrap()))
            .collect();
        assert_eq!(
            events,
            vec![
                ("speed".to_string(), 0, 1.0),
                ("barBeat".to_string(), 0, 3.5),
                ("bar".to_string(), 12_000, 1.0),
                ("barBeat".to_string(), 12_000, 0.0),
                ("barBeat".to_string(), 36_000, 1.0),
            ]
        );
        let (bpm, bar, frame): (f64, i64, i64) = lua
            .load("return tr[Time.beatsPerMinute], tr[Time.bar], tr[Time.frame]")
            .eval()
            .unwrap();
        assert_eq!((bpm, bar, frame), (120.0, 1, 48_000));
    }

    #[test]
    fn time_responder_stash_round_trips_through_apply() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        bind_input(&lua, |f| {
            let t = f.uris().time;
            let frame = f.push_object(0, t.position).unwrap();
            f.key(t.beats_per_bar, 0).unwrap();
            f.float(3.0).unwrap();
            f.key(t.bar, 0).unwrap();
            f.long(7).unwrap();
            f.pop(frame).unwrap();
        });
        lua.load("tr = TimeResponder(); assert(tr:apply(a)); assert(tr:stash(f) == f)").exec().unwrap();
        let bytes = output(&lua, out);
        let t = bindings(&lua).unwrap().uris.time;
        let stashed = AtomRef::parse(&bytes).unwrap();
        assert_eq!(stashed.object_header().unwrap().otype, t.position);
        assert_eq!(stashed.property(t.bar).unwrap().as_i64(), Some(7));
        assert_eq!(stashed.property(t.beats_per_bar).unwrap().as_f32(), Some(3.0));
        assert_eq!(stashed.property(t.beats_per_minute).unwrap().as_f32(), Some(120.0));
        let other: bool = lua.load("return tr.apply ~= nil and tr[Atom.Int] == nil").eval().unwrap();
        assert!(other);
    }

    #[test]
    fn osc_patterns_follow_address_rules() {
        assert!(osc_match(b"/synth/*/freq", b"/synth/1/freq"));
        assert!(!osc_match(b"/synth/*", b"/synth/1/freq"));
        assert!(osc_match(b"/ch/?", b"/ch/3"));
        assert!(osc_match(b"/ch/[0-4]", b"/ch/3"));
        assert!(!osc_match(b"/ch/[!0-4]", b"/ch/3"));
        assert!(osc_match(b"/{foo,bar}/x", b"/bar/x"));
        assert!(!osc_match(b"/{foo,bar}/x", b"/baz/x"));
        assert!(!osc_match(b"/ch/[0-4", b"/ch/3"));
        assert!(has_wildcards(b"/a/{b,c}") && !has_wildcards(b"/a/b"));
    }

    #[test]
    fn osc_responder_routes_messages_and_bundles() {
        let lua = lua_with_bindings();
        bind_input(&lua, |f| {
            let [bundle, items] = f.push_bundle(1).unwrap();
            f.message("/ping", &[OscArg::Int(3), OscArg::String("hi"), OscArg::Bool(true), OscArg::Double(0.5)])
                .unwrap();
            f.message("/synth/2/freq", &[OscArg::Float(440.0), OscArg::Midi(&[0x90, 60, 1])]).unwrap();
            f.message("/unheard", &[]).unwrap();
            f.pop_frames(&[bundle, items]).unwrap();
        });
        lua.load(
            "seen = {}
             osc = OSCResponder({
                 ['/ping'] = function(self, frames, data, fmt, ...)
                     seen.ping = {frames, fmt, select('#', ...), ...}
                 end,
                 ['/synth/*/freq'] = function(self, frames, data, fmt, freq, midi)
                     seen.freq = {fmt, freq, midi[1], midi[3]}
                 end,
             })
             assert(osc(4, nil, a) == true)",
        )
        .exec()
        .unwrap();
        let ping: (i64, String, i64, i64, String, f64) = lua
            .load("local p = seen.ping return p[1], p[2], p[3], p[4], p[5], p[6]")
            .eval()
            .unwrap();
        assert_eq!(ping, (4, "isTd".to_string(), 3, 3, "hi".to_string(), 0.5));
        let freq: (String, f64, i64, i64) = lua
            .load("local p = seen.freq return p[1], p[2], p[3], p[4]")
            .eval()
            .unwrap();
        assert_eq!(freq, ("fm".to_string(), 440.0, 0x90, 1));

        bind_input(&lua, |f| f.int(1).unwrap());
        let handled: bool = lua.load("return osc(0, nil, a)").eval().unwrap();
        assert!(!handled);
    }

    #[test]
    fn osc_arguments_beyond_the_slots_are_passed_through() {
        let lua = lua_with_bindings();
        let args: Vec<OscArg<'_>> = (0..10).map(OscArg::Int).collect();
        bind_input(&lua, |f| f.message("/many", &args).unwrap());
        let (n, last): (i64, i64) = lua
            .load(
                "local n, last
                 OSCResponder({ ['/many'] = function(self, frames, data, fmt, ...)
                     n = select('#', ...)
                     last = select(n, ...)
                 end })(0, nil, a)
                 return n, last",
            )
            .eval()
            .unwrap();
        assert_eq!((n, last), (10, 9));
    }

    #[test]
    fn osc_handlers_must_be_functions() {
        let lua = lua_with_bindings();
        bind_input(&lua, |f| f.message("/x", &[]).unwrap());
        let err = lua.load("OSCResponder({ ['/x'] = 1 })(0, nil, a)").exec().unwrap_err();
        assert!(err.to_string().contains("responder handler must be a function"), "{}", err);
    }

    const STATE: &str = "
        gain = Parameter({
            [RDFS.label] = 'Gain',
            [RDFS.range] = Atom.Float,
            [RDFS.comment] = 'output gain',
            [Core.minimum] = 0.0,
            [Core.maximum] = 2.0,
            [RDF.value] = 1.0,
        })
        meter = Parameter({
            [RDFS.label] = 'Meter',
            [RDFS.range] = Atom.Int,
            [RDF.value] = 5,
        })
        state = StateResponder({
            [Patch.writable] = { [Map['urn:gain']] = gain },
            [Patch.readable] = { [Map['urn:meter']] = meter },
        })";

    fn patch_objects(bytes: &[u8]) -> Vec<(i64, Urid, Vec<u8>)> {
        let seq = AtomRef::parse(bytes).unwrap();
        seq.events()
            .map(|e| {
                let otype = e.atom.object_header().map_or(0, |h| h.otype);
                (e.frames(), otype, e.atom.body.to_vec())
            })
            .collect()
    }

    #[test]
    fn parameter_reads_and_swaps_its_value() {
        let lua = lua_with_bindings();
        let (before, old, after): (Value, f64, f64) = lua
            .load("local p = Parameter() local a = p() p(0.5) local old = p(0.75) return a, old, p()")
            .eval()
            .unwrap();
        assert!(before.is_nil());
        assert_eq!((old, after), (0.5, 0.75));
    }

    #[test]
    fn state_set_stores_writable_values_and_acks() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        lua.load(STATE).exec().unwrap();
        let gain = bindings(&lua).unwrap().mapper.map("urn:gain");
        let meter = bindings(&lua).unwrap().mapper.map("urn:meter");

        bind_input(&lua, |f| {
            let frame = f.set(None, Some(9), gain).unwrap();
            f.float(0.25).unwrap();
            f.pop(frame).unwrap();
        });
        lua.load("s = f:sequence(); assert(state(3, s, a) == true)").exec().unwrap();
        bind_input(&lua, |f| {
            let frame = f.set(None, Some(10), meter).unwrap();
            f.int(1).unwrap();
            f.pop(frame).unwrap();
        });
        lua.load("assert(state(4, s, a) == false); s:pop()").exec().unwrap();

        let value: f64 = lua.load("return gain()").eval().unwrap();
        assert_eq!(value, 0.25);
        let meter_value: i64 = lua.load("return meter()").eval().unwrap();
        assert_eq!(meter_value, 5);

        let patch = bindings(&lua).unwrap().uris.patch;
        let replies = patch_objects(&output(&lua, out));
        assert_eq!(replies.len(), 2);
        assert_eq!((replies[0].0, replies[0].1), (3, patch.ack));
        assert_eq!((replies[1].0, replies[1].1), (4, patch.error));
    }

    #[test]
    fn state_get_replies_with_the_typed_value() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        lua.load(STATE).exec().unwrap();
        let meter = bindings(&lua).unwrap().mapper.map("urn:meter");
        bind_input(&lua, |f| f.get(None, Some(2), Some(meter)).unwrap());
        lua.load("s = f:sequence(); assert(state(0, s, a) == true); s:pop()").exec().unwrap();

        let uris = bindings(&lua).unwrap().uris.clone();
        let bytes = output(&lua, out);
        let seq = AtomRef::parse(&bytes).unwrap();
        let reply = seq.events().next().unwrap().atom;
        assert_eq!(reply.object_header().unwrap().otype, uris.patch.set);
        assert_eq!(reply.property(uris.patch.property).unwrap().as_u32(), Some(meter));
        assert_eq!(reply.property(uris.patch.sequence_number).unwrap().as_i32(), Some(2));
        let value = reply.property(uris.patch.value).unwrap();
        assert_eq!((value.urid, value.as_i32()), (uris.atom.int, Some(5)));
    }

    #[test]
    fn state_get_without_property_registers_every_parameter() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        lua.load(STATE).exec().unwrap();
        bind_input(&lua, |f| f.get(None, None, None).unwrap());
        lua.load("s = f:sequence(); assert(state(0, s, a) == true); s:pop()").exec().unwrap();

        let uris = bindings(&lua).unwrap().uris.clone();
        let gain = bindings(&lua).unwrap().mapper.map("urn:gain");
        let bytes = output(&lua, out);
        let seq = AtomRef::parse(&bytes).unwrap();
        let patches: Vec<_> = seq.events().map(|e| e.atom).collect();
        // clear, then access and description per parameter
        assert_eq!(patches.len(), 5);
        assert!(patches.iter().all(|p| p.object_header().unwrap().otype == uris.patch.patch));

        let described = patches
            .iter()
            .find(|p| p.property(uris.patch.subject).and_then(|s| s.as_u32()) == Some(gain))
            .unwrap();
        let add = described.property(uris.patch.add).unwrap();
        assert_eq!(add.property(uris.param.label).unwrap().as_str(), Some("Gain"));
        assert_eq!(add.property(uris.param.comment).unwrap().as_str(), Some("output gain"));
        assert_eq!(add.property(uris.param.range).unwrap().as_u32(), Some(uris.atom.float));
        let max = add.property(uris.param.maximum).unwrap();
        assert_eq!((max.urid, max.as_f32()), (uris.atom.float, Some(2.0)));
    }

    #[test]
    fn state_put_sync_stash_and_apply() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        lua.load(STATE).exec().unwrap();
        let uris = bindings(&lua).unwrap().uris.clone();
        let gain = bindings(&lua).unwrap().mapper.map("urn:gain");
        let meter = bindings(&lua).unwrap().mapper.map("urn:meter");

        bind_input(&lua, |f| {
            let frames = f.put(None, None).unwrap();
            f.key(gain, 0).unwrap();
            f.float(1.5).unwrap();
            f.key(meter, 0).unwrap();
            f.int(99).unwrap();
            f.pop_frames(&frames).unwrap();
        });
        lua.load("s = f:sequence(); assert(state(0, s, a) == true); state:sync(1, s); s:pop()")
            .exec()
            .unwrap();
        let (g, m): (f64, i64) = lua.load("return gain(), meter()").eval().unwrap();
        assert_eq!((g, m), (1.5, 5));

        let bytes = output(&lua, out);
        let seq = AtomRef::parse(&bytes).unwrap();
        let put = seq.events().next().unwrap().atom;
        assert_eq!(put.object_header().unwrap().otype, uris.patch.put);
        assert_eq!(put.property(uris.patch.subject).unwrap().as_u32(), Some(uris.patch.self_));
        let body = put.property(uris.patch.body).unwrap();
        assert_eq!(body.property(gain).unwrap().as_f32(), Some(1.5));
        assert_eq!(body.property(meter).unwrap().as_i32(), Some(5));

        let out = bind_output(&lua);
        lua.load("state:stash(f); gain(0.0)").exec().unwrap();
        let stashed = output(&lua, out);
        let object = AtomRef::parse(&stashed).unwrap();
        assert!(object.property(meter).is_none());
        assert_eq!(object.property(gain).unwrap().as_f32(), Some(1.5));

        let key = bindings_mut(&lua).unwrap().arena.bind_copy(crate::scripting::arena::INPUT, &stashed).unwrap();
        let view = AtomView::slot(key, object.urid, 8, object.body.len());
        let handle = crate::scripting::handle::atom_handle(&lua, view, false).unwrap();
        lua.globals().set("a", handle).unwrap();
        let applied: (bool, f64) = lua.load("return state:apply(a), gain()").eval().unwrap();
        assert_eq!(applied, (true, 1.5));
    }

    #[test]
    fn state_ignores_patches_for_other_subjects() {
        let lua = lua_with_bindings();
        let out = bind_output(&lua);
        lua.load(STATE).exec().unwrap();
        let gain = bindings(&lua).unwrap().mapper.map("urn:gain");
        let elsewhere = bindings(&lua).unwrap().mapper.map("urn:elsewhere");
        bind_input(&lua, |f| {
            let frame = f.set(Some(elsewhere), Some(4), gain).unwrap();
            f.float(0.0).unwrap();
            f.pop(frame).unwrap();
        });
        lua.load("s = f:sequence(); assert(state(0, s, a) == false); s:pop()").exec().unwrap();
        let value: f64 = lua.load("return gain()").eval().unwrap();
        assert_eq!(value, 1.0);
        assert!(patch_objects(&output(&lua, out)).is_empty());
    }
}
