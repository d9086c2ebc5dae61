/// `scripting/latom.rs` — Atom handles
///
/// A `LuaAtom` is a read-only view: which buffer, where the body starts, how
/// long it is and which type it has. Every operation re-reads the bytes from
/// the arena, so a handle kept past its callback raises a stale-handle error
/// instead of reading a reused buffer.
use std::cell::Cell;
use std::fmt::Write as _;
use std::sync::Arc;

use mlua::{
    AnyUserData, Lua, MetaMethod, MultiValue, Result as LuaResult, UserData, UserDataMethods, Value,
    Variadic,
};

use super::arena::{BufferKey, INPUT, OUTPUT, SCRATCH};
use super::handle::atom_handle;
use super::{bindings, BindingError, Bindings};
use crate::atom::driver::{Cursor, Field, Indexed, Scalar, UnpackStyle};
use crate::atom::{AtomRef, Urid};

#[derive(Debug, Clone)]
pub(crate) enum Source {
    Slot(BufferKey),
    /// Private copy made by `clone()`.
    Owned(Arc<[u8]>),
}

#[derive(Debug, Clone)]
pub struct AtomView {
    pub(crate) source: Source,
    pub(crate) urid: Urid,
    pub(crate) start: u32,
    pub(crate) len: u32,
}

impl AtomView {
    pub(crate) fn slot(key: BufferKey, urid: Urid, start: usize, len: usize) -> Self {
        Self {
            source: Source::Slot(key),
            urid,
            start: start as u32,
            len: len as u32,
        }
    }

    /// Placeholder for prefilled handles; reads through it are stale.
    pub(crate) fn detached() -> Self {
        Self::slot(BufferKey::detached(), 0, 0, 0)
    }

    /// View of `atom`, which must live inside `bytes` of slot `key`.
    pub(crate) fn within(key: BufferKey, atom: AtomRef<'_>, bytes: &[u8]) -> Option<Self> {
        let start = atom.offset_in(bytes)?;
        Some(Self::slot(key, atom.urid, start, atom.body.len()))
    }

    pub(crate) fn owned(atom: AtomRef<'_>) -> Self {
        Self {
            source: Source::Owned(Arc::from(atom.body)),
            urid: atom.urid,
            start: 0,
            len: atom.body.len() as u32,
        }
    }

    pub fn urid(&self) -> Urid {
        self.urid
    }

    pub(crate) fn resolve<'a>(&self, bytes: &'a [u8]) -> Result<AtomRef<'a>, BindingError> {
        let start = self.start as usize;
        let end = start + self.len as usize;
        bytes
            .get(start..end)
            .map(|body| AtomRef::new(self.urid, body))
            .ok_or(BindingError::StaleHandle)
    }

    /// Runs `f` with the atom, the bytes it lives in and the context.
    /// `f` must not call back into Lua.
    pub(crate) fn with<R>(
        &self,
        lua: &Lua,
        f: impl FnOnce(AtomRef<'_>, &[u8], &Bindings) -> LuaResult<R>,
    ) -> LuaResult<R> {
        let b = bindings(lua)?;
        let bytes: &[u8] = match &self.source {
            Source::Slot(key) => b.arena.bytes(*key)?,
            Source::Owned(bytes) => bytes,
        };
        let atom = self.resolve(bytes)?;
        f(atom, bytes, &b)
    }

    /// View of a nested atom found while reading this one.
    pub(crate) fn child(&self, child: AtomRef<'_>, bytes: &[u8]) -> Option<Self> {
        let start = child.offset_in(bytes)?;
        Some(Self {
            source: self.source.clone(),
            urid: child.urid,
            start: start as u32,
            len: child.body.len() as u32,
        })
    }

    fn location(&self, out: &mut String) {
        let name = match &self.source {
            Source::Slot(key) => match key.slot() {
                INPUT => "input",
                OUTPUT => "output",
                SCRATCH => "scratch",
                _ => "stash",
            },
            Source::Owned(_) => "clone",
        };
        let _ = write!(out, "{}:{}", name, self.start);
    }
}

pub struct LuaAtom {
    pub(crate) view: AtomView,
    pub(crate) cached: bool,
    pub(crate) cursor: Cell<Cursor>,
}

impl LuaAtom {
    pub fn new(view: AtomView, cached: bool) -> Self {
        Self {
            view,
            cached,
            cursor: Cell::new(Cursor::default()),
        }
    }
}

/// View and caching flavour of a handle, copied out so no borrow is held
/// while new handles are created.
pub(crate) fn snapshot(ud: &AnyUserData) -> LuaResult<(AtomView, bool)> {
    let this = ud.borrow::<LuaAtom>()?;
    Ok((this.view.clone(), this.cached))
}

// ── Values ───────────────────────────────────────────────────────────────────

pub(crate) fn scalar_value(lua: &Lua, b: &Bindings, atom: &AtomRef<'_>) -> LuaResult<Value> {
    let driver = b.drivers.resolve(atom.urid);
    Ok(match driver.scalar(atom) {
        Scalar::Nil => Value::Nil,
        Scalar::Bool(v) => Value::Boolean(v),
        Scalar::Integer(v) => Value::Integer(v),
        Scalar::Number(v) => Value::Number(v),
        Scalar::Text(bytes) | Scalar::Bytes(bytes) => Value::String(lua.create_string(bytes)?),
        Scalar::Items => {
            let table = lua.create_table_with_capacity(driver.len(atom), 0)?;
            for (i, item) in atom.vector_items().enumerate() {
                table.raw_set(i + 1, scalar_value(lua, b, &item)?)?;
            }
            Value::Table(table)
        }
    })
}

fn field_value(field: Field) -> Value {
    match field {
        Field::Urid(u) => Value::Integer(u as i64),
        Field::Integer(v) => Value::Integer(v),
    }
}

/// Either a ready value or a nested atom still waiting for its handle.
enum Out {
    Value(Value),
    View(AtomView),
}

impl Out {
    fn into_value(self, lua: &Lua, cached: bool) -> LuaResult<Value> {
        match self {
            Out::Value(v) => Ok(v),
            Out::View(view) => Ok(Value::UserData(atom_handle(lua, view, cached)?)),
        }
    }
}

fn position(key: &Value) -> Option<i64> {
    match key {
        Value::Integer(i) => Some(*i),
        Value::Number(n) if n.fract() == 0.0 => Some(*n as i64),
        _ => None,
    }
}

// ── Metamethods ──────────────────────────────────────────────────────────────

fn index(lua: &Lua, (ud, key): (AnyUserData, Value)) -> LuaResult<Value> {
    let (view, cached) = snapshot(&ud)?;
    let out = view.with(lua, |atom, bytes, b| {
        let driver = b.drivers.resolve(atom.urid);
        if let Some(pos) = position(&key) {
            if pos >= 1 {
                match driver.child_at(&atom, pos as usize) {
                    Some(Indexed::Atom(child)) => {
                        return Ok(view.child(child, bytes).map_or(Out::Value(Value::Nil), Out::View))
                    }
                    Some(Indexed::Integer(v)) => return Ok(Out::Value(Value::Integer(v))),
                    None => {}
                }
            }
            let found = u32::try_from(pos)
                .ok()
                .and_then(|k| driver.child_by_key(&atom, k))
                .and_then(|child| view.child(child, bytes));
            return Ok(found.map_or(Out::Value(Value::Nil), Out::View));
        }
        let Value::String(name) = &key else {
            return Ok(Out::Value(Value::Nil));
        };
        let name = name.to_str()?;
        Ok(Out::Value(match &*name {
            "type" => Value::Integer(atom.urid as i64),
            "body" => scalar_value(lua, b, &atom)?,
            "raw" => Value::String(lua.create_string(atom.body)?),
            other => driver.field(&atom, other).map_or(Value::Nil, field_value),
        }))
    })?;
    out.into_value(lua, cached)
}

fn unpack(lua: &Lua, (ud, args): (AnyUserData, Variadic<Value>)) -> LuaResult<MultiValue> {
    let (view, cached) = snapshot(&ud)?;
    let outs = view.with(lua, |atom, bytes, b| {
        let driver = b.drivers.resolve(atom.urid);
        let len = driver.len(&atom);
        let range = || -> (usize, usize) {
            let clamp = |v: Option<i64>, default: usize| -> usize {
                v.map_or(default, |v| v.clamp(1, len.max(1) as i64) as usize)
            };
            let min = clamp(args.first().and_then(position), 1);
            let max = clamp(args.get(1).and_then(position), len);
            (min, max)
        };
        let mut outs = Vec::new();
        match driver.unpack_style() {
            UnpackStyle::Children | UnpackStyle::Bytes => {
                if len == 0 {
                    return Ok(outs);
                }
                let (min, max) = range();
                for pos in min..=max {
                    outs.push(match driver.child_at(&atom, pos) {
                        Some(Indexed::Atom(child)) => {
                            view.child(child, bytes).map_or(Out::Value(Value::Nil), Out::View)
                        }
                        Some(Indexed::Integer(v)) => Out::Value(Value::Integer(v)),
                        None => Out::Value(Value::Nil),
                    });
                }
            }
            UnpackStyle::Properties if args.is_empty() => {
                for prop in atom.properties() {
                    outs.push(view.child(prop.value, bytes).map_or(Out::Value(Value::Nil), Out::View));
                }
            }
            UnpackStyle::Properties => {
                for key in args.iter() {
                    let found = position(key)
                        .and_then(|k| u32::try_from(k).ok())
                        .and_then(|k| driver.child_by_key(&atom, k))
                        .and_then(|child| view.child(child, bytes));
                    outs.push(found.map_or(Out::Value(Value::Nil), Out::View));
                }
            }
            UnpackStyle::Literal => {
                if let Some((datatype, lang, text)) = atom.literal() {
                    outs.push(Out::Value(Value::String(lua.create_string(text)?)));
                    outs.push(Out::Value(Value::Integer(datatype as i64)));
                    outs.push(Out::Value(Value::Integer(lang as i64)));
                }
            }
            UnpackStyle::None => outs.push(Out::Value(scalar_value(lua, b, &atom)?)),
        }
        Ok(outs)
    })?;
    outs.into_iter().map(|out| out.into_value(lua, cached)).collect()
}

fn to_string(lua: &Lua, ud: AnyUserData) -> LuaResult<String> {
    let (view, _) = snapshot(&ud)?;
    view.with(lua, |atom, _, b| {
        let driver = b.drivers.resolve(atom.urid);
        let mut out = String::new();
        out.push('(');
        out.push_str(driver.name());
        out.push_str(": ");
        view.location(&mut out);
        out.push_str(", ");
        let _ = driver.describe(&atom, &mut out);
        out.push(')');
        Ok(out)
    })
}

fn equals(lua: &Lua, (a, b): (AnyUserData, Value)) -> LuaResult<bool> {
    let Value::UserData(b) = b else {
        return Ok(false);
    };
    let (Ok((left, _)), Ok((right, _))) = (snapshot(&a), snapshot(&b)) else {
        return Ok(false);
    };
    left.with(lua, |x, _, _| {
        right.with(lua, |y, _, _| Ok(x.urid == y.urid && x.body == y.body))
    })
}

impl UserData for LuaAtom {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Index, index);
        methods.add_meta_function(MetaMethod::ToString, to_string);
        methods.add_meta_function(MetaMethod::Eq, equals);
        methods.add_meta_function(MetaMethod::Len, |lua, ud: AnyUserData| {
            let (view, _) = snapshot(&ud)?;
            view.with(lua, |atom, _, b| Ok(b.drivers.resolve(atom.urid).len(&atom) as i64))
        });

        methods.add_function("foreach", super::iter::foreach);
        methods.add_function("multiplex", super::iter::multiplex);
        methods.add_function("unpack", unpack);
        methods.add_function("clone", |lua, ud: AnyUserData| {
            let (view, _) = snapshot(&ud)?;
            let owned = view.with(lua, |atom, _, _| Ok(AtomView::owned(atom)))?;
            atom_handle(lua, owned, false)
        });
    }
}
