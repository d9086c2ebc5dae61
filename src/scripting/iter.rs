/// `scripting/iter.rs` — Stateful iteration over container atoms
///
/// `atom:foreach()` resets the handle's cursor and returns the shared
/// iterator function, so `for k, v in atom:foreach() do` walks the children
/// once and stops with `nil`. Passing further sequences,
/// `seq:foreach(other, ...)`, merges them by timestamp: each step scans every
/// lane's next event and yields the earliest, lower lanes first on ties.
/// `seq:multiplex(...)` always takes the merging path, even for one lane.
use mlua::{AnyUserData, Function, Lua, Result as LuaResult, UserData, Value, Variadic};

use super::handle::{atom_handle, merge_handle};
use super::latom::{snapshot, AtomView, LuaAtom};
use super::{bindings, BindingError};
use crate::atom::driver::{AtomKind, Cursor, Key};
use crate::atom::TimeStamp;

/// Most sequences one multiplexed loop can merge.
pub const MAX_LANES: usize = 8;

/// Iterator functions, created once per VM.
struct IterFns {
    single: Function,
    multiplex: Function,
}

pub(crate) fn register(lua: &Lua) -> LuaResult<()> {
    let fns = IterFns {
        single: lua.create_function(next_child)?,
        multiplex: lua.create_function(next_merged)?,
    };
    lua.set_app_data(fns);
    Ok(())
}

fn time_value(stamp: TimeStamp) -> Value {
    match stamp {
        TimeStamp::Frames(f) => Value::Integer(f),
        TimeStamp::Beats(b) => Value::Number(b),
    }
}

fn key_value(key: Key) -> Value {
    match key {
        Key::Position(p) => Value::Integer(p as i64),
        Key::Urid(u) => Value::Integer(u as i64),
        Key::Time(t) => time_value(t),
    }
}

/// The receiver plus up to `MAX_LANES - 1` further sequences, taken as
/// fixed arguments so a call reads them straight off the Lua stack.
pub(crate) type LaneArgs = (
    AnyUserData,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Value,
    Variadic<Value>,
);

fn split_lanes(args: LaneArgs) -> LuaResult<(AnyUserData, [Value; MAX_LANES - 1])> {
    let (ud, a, b, c, d, e, f, g, rest) = args;
    if !rest.is_empty() {
        return Err(BindingError::TooManySequences(MAX_LANES).into());
    }
    Ok((ud, [a, b, c, d, e, f, g]))
}

pub(crate) fn foreach(lua: &Lua, args: LaneArgs) -> LuaResult<(Function, Value)> {
    let (ud, others) = split_lanes(args)?;
    if !others[0].is_nil() {
        return start_merge(lua, ud, others);
    }
    let single = lua
        .app_data_ref::<IterFns>()
        .ok_or(BindingError::NoContext)?
        .single
        .clone();
    ud.borrow::<LuaAtom>()?.cursor.set(Cursor::default());
    Ok((single, Value::UserData(ud)))
}

pub(crate) fn multiplex(lua: &Lua, args: LaneArgs) -> LuaResult<(Function, Value)> {
    let (ud, others) = split_lanes(args)?;
    start_merge(lua, ud, others)
}

fn start_merge(lua: &Lua, ud: AnyUserData, others: [Value; MAX_LANES - 1]) -> LuaResult<(Function, Value)> {
    let next = lua
        .app_data_ref::<IterFns>()
        .ok_or(BindingError::NoContext)?
        .multiplex
        .clone();
    let mut merge = Multiplex {
        cached: true,
        ..Multiplex::default()
    };
    let lanes = std::iter::once(Value::UserData(ud)).chain(others).take_while(|v| !v.is_nil());
    for (lane, value) in lanes.enumerate() {
        let Value::UserData(seq) = value else {
            return Err(BindingError::NotASequence.into());
        };
        let (view, cached) = snapshot(&seq).map_err(|_| BindingError::NotASequence)?;
        let is_sequence = view.with(lua, |atom, _, b| Ok(b.drivers.kind_of(atom.urid) == AtomKind::Sequence))?;
        if !is_sequence {
            return Err(BindingError::NotASequence.into());
        }
        merge.cached &= cached;
        merge.lanes[lane] = Some(Lane {
            view,
            cursor: Cursor::default(),
            handle: seq,
        });
    }
    let state = merge_handle(lua, merge)?;
    Ok((next, Value::UserData(state)))
}

fn next_child(lua: &Lua, (ud, _): (AnyUserData, Value)) -> LuaResult<(Value, Value, Value)> {
    let (view, cached) = snapshot(&ud)?;
    let mut cursor = ud.borrow::<LuaAtom>()?.cursor.get();
    let step = view.with(lua, |atom, bytes, b| {
        let driver = b.drivers.resolve(atom.urid);
        if !driver.iterable() {
            return Ok(None);
        }
        Ok(driver
            .next(&atom, &mut cursor)
            .and_then(|child| Some((child.key, view.child(child.atom, bytes)?, child.context))))
    })?;
    ud.borrow::<LuaAtom>()?.cursor.set(cursor);

    let Some((key, child, context)) = step else {
        return Ok((Value::Nil, Value::Nil, Value::Nil));
    };
    let handle = Value::UserData(atom_handle(lua, child, cached)?);
    let context = match key {
        Key::Urid(_) => Value::Integer(context as i64),
        _ => Value::Nil,
    };
    Ok((key_value(key), handle, context))
}

// ── Multiplex ────────────────────────────────────────────────────────────────

struct Lane {
    view: AtomView,
    cursor: Cursor,
    /// The sequence handle, yielded with every event so the loop body can
    /// tell the sources apart.
    handle: AnyUserData,
}

#[derive(Default)]
pub(crate) struct Multiplex {
    lanes: [Option<Lane>; MAX_LANES],
    pub(crate) cached: bool,
}

impl UserData for Multiplex {}

fn next_merged(lua: &Lua, (ud, _): (AnyUserData, Value)) -> LuaResult<(Value, Value, Value)> {
    let winner = {
        let merge = ud.borrow::<Multiplex>()?;
        let frames_per_beat = bindings(lua)?.frames_per_beat;
        let mut winner: Option<(usize, f64, TimeStamp, AtomView, Cursor)> = None;
        for (idx, lane) in merge.lanes.iter().enumerate() {
            let Some(lane) = lane else { continue };
            let mut cursor = lane.cursor;
            let peek = lane.view.with(lua, |atom, bytes, b| {
                let driver = b.drivers.resolve(atom.urid);
                Ok(driver.next(&atom, &mut cursor).and_then(|child| match child.key {
                    Key::Time(stamp) => Some((stamp, lane.view.child(child.atom, bytes)?)),
                    _ => None,
                }))
            })?;
            let Some((stamp, view)) = peek else { continue };
            let at = stamp.on_frame_axis(frames_per_beat);
            // Strict comparison keeps the lower lane on equal times.
            if winner.as_ref().map_or(true, |w| at < w.1) {
                winner = Some((idx, at, stamp, view, cursor));
            }
        }
        winner
    };

    let Some((idx, _, stamp, view, cursor)) = winner else {
        return Ok((Value::Nil, Value::Nil, Value::Nil));
    };
    let (seq, cached) = {
        let mut merge = ud.borrow_mut::<Multiplex>()?;
        let cached = merge.cached;
        let lane = merge.lanes[idx].as_mut().ok_or(BindingError::NotASequence)?;
        lane.cursor = cursor;
        (lane.handle.clone(), cached)
    };
    let handle = atom_handle(lua, view, cached)?;
    Ok((time_value(stamp), Value::UserData(handle), Value::UserData(seq)))
}
