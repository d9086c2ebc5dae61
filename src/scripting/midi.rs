/// `scripting/midi.rs` — MIDI helpers for scripts
///
/// Pitch conversion (`midi2cps`, `cps2midi`) and `MIDIResponder`, a callable
/// that routes MIDI events to handlers keyed by status byte.
use mlua::{AnyUserData, Lua, MetaMethod, Result as LuaResult, Table, UserData, UserDataMethods, Value, Variadic};

use super::latom::snapshot;
use super::lforge::{append_atom, LuaForge};
use super::BindingError;
use crate::atom::TimeStamp;

pub const A4_NOTE: f64 = 69.0;
pub const A4_CPS: f64 = 440.0;

pub fn midi_to_cps(note: f64, base: f64, cps: f64) -> f64 {
    ((note - base) / 12.0).exp2() * cps
}

pub fn cps_to_midi(freq: f64, base: f64, cps: f64) -> f64 {
    (freq / cps).log2() * 12.0 + base
}

/// Routes MIDI events to the handler table stored as its user value.
/// Unhandled events are copied to the forge when `through` is set.
pub struct MidiResponder {
    through: bool,
}

/// Arguments a handler receives after `frames` and `forge`: the channel
/// (nil for system messages), two data bytes and any further bytes.
struct Message {
    key: u8,
    chan: Value,
    data: [Value; 2],
    extra: Variadic<Value>,
}

fn byte(body: &[u8], at: usize) -> Value {
    body.get(at).map_or(Value::Nil, |b| Value::Integer(i64::from(*b)))
}

fn respond(
    lua: &Lua,
    (ud, frames, forge, atom): (AnyUserData, i64, AnyUserData, AnyUserData),
) -> LuaResult<bool> {
    let through = ud.borrow::<MidiResponder>()?.through;
    let (view, _) = snapshot(&atom)?;

    let message = view.with(lua, |atom, _, b| {
        if atom.urid != b.uris.midi_event || atom.body.is_empty() {
            return Ok(None);
        }
        let body = atom.body;
        let status = body[0];
        let is_system = status & 0xf0 == 0xf0;
        let extra = match body.get(3..) {
            Some(rest) if !rest.is_empty() => rest.iter().map(|b| Value::Integer(i64::from(*b))).collect(),
            _ => Variadic::new(),
        };
        Ok(Some(Message {
            key: if is_system { status } else { status & 0xf0 },
            chan: if is_system {
                Value::Nil
            } else {
                Value::Integer(i64::from(status & 0x0f))
            },
            data: [byte(body, 1), byte(body, 2)],
            extra,
        }))
    })?;
    let Some(Message { key, chan, data: [d1, d2], extra }) = message else {
        return Ok(false);
    };

    let handlers: Table = ud.user_value()?;
    match handlers.get::<Value>(key)? {
        Value::Nil => {
            if through {
                let target = forge.borrow::<LuaForge>()?.target;
                append_atom(lua, target, Some(TimeStamp::Frames(frames)), &view)?;
            }
        }
        Value::Function(handler) => {
            handler.call::<()>((handlers, frames, forge, chan, d1, d2, extra))?;
        }
        _ => return Err(BindingError::HandlerNotFunction.into()),
    }
    Ok(true)
}

impl UserData for MidiResponder {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_meta_function(MetaMethod::Call, respond);
    }
}

pub(crate) fn register(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();

    globals.set(
        "midi2cps",
        lua.create_function(|_, (note, base, cps): (f64, Option<f64>, Option<f64>)| {
            Ok(midi_to_cps(note, base.unwrap_or(A4_NOTE), cps.unwrap_or(A4_CPS)))
        })?,
    )?;
    globals.set(
        "cps2midi",
        lua.create_function(|_, (freq, base, cps): (f64, Option<f64>, Option<f64>)| {
            Ok(cps_to_midi(freq, base.unwrap_or(A4_NOTE), cps.unwrap_or(A4_CPS)))
        })?,
    )?;
    globals.set(
        "MIDIResponder",
        lua.create_function(|lua, (handlers, through): (Table, Option<bool>)| {
            let ud = lua.create_userdata(MidiResponder {
                through: through.unwrap_or(false),
            })?;
            ud.set_user_value(handlers)?;
            Ok(ud)
        })?,
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::AtomRef;
    use crate::scripting::arena::OUTPUT;
    use crate::scripting::handle::forge_handle;
    use crate::scripting::latom::tests::bind_input;
    use crate::scripting::tests::lua_with_bindings;
    use crate::scripting::{bindings, bindings_mut};

    #[test]
    fn pitch_conversion_is_inverse() {
        assert!((midi_to_cps(69.0, A4_NOTE, A4_CPS) - 440.0).abs() < 1e-9);
        assert!((midi_to_cps(81.0, A4_NOTE, A4_CPS) - 880.0).abs() < 1e-9);
        assert!((cps_to_midi(220.0, A4_NOTE, A4_CPS) - 57.0).abs() < 1e-9);

        let lua = lua_with_bindings();
        let n: f64 = lua.load("return cps2midi(midi2cps(60.5))").eval().unwrap();
        assert!((n - 60.5).abs() < 1e-9);
        let shifted: f64 = lua.load("return midi2cps(60, 60, 100)").eval().unwrap();
        assert!((shifted - 100.0).abs() < 1e-9);
    }

    #[test]
    fn responder_dispatches_by_command_and_passes_through() {
        let lua = lua_with_bindings();
        let out = bindings_mut(&lua).unwrap().arena.bind_output(OUTPUT, 256).unwrap();
        let forge = forge_handle(&lua, LuaForge::new(out, false)).unwrap();
        lua.globals().set("f", forge).unwrap();

        bind_input(&lua, |f| f.midi(&[0x93, 60, 100]).unwrap());
        lua.load(
            "seen = {}
             r = MIDIResponder({
                 [0x90] = function(self, frames, forge, chan, note, vel)
                     seen = {frames, chan, note, vel}
                 end,
             }, true)
             local s = f:sequence()
             assert(r(5, s, a) == true)
             handled = s",
        )
        .exec()
        .unwrap();
        let seen: Vec<i64> = lua.load("return seen").eval().unwrap();
        assert_eq!(seen, vec![5, 3, 60, 100]);

        bind_input(&lua, |f| f.midi(&[0xb0, 7, 64]).unwrap());
        lua.load("assert(r(9, handled, a) == true); handled:pop()").exec().unwrap();
        let bytes = bindings(&lua).unwrap().arena.bytes(out).unwrap().to_vec();
        let seq = AtomRef::parse(&bytes).unwrap();
        let events: Vec<_> = seq.events().collect();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].frames(), 9);
        assert_eq!(events[0].atom.body, &[0xb0, 7, 64]);

        bind_input(&lua, |f| f.int(1).unwrap());
        let handled: bool = lua.load("return r(0, f, a)").eval().unwrap();
        assert!(!handled);
    }

    #[test]
    fn system_messages_pass_every_data_byte() {
        let lua = lua_with_bindings();
        let out = bindings_mut(&lua).unwrap().arena.bind_output(OUTPUT, 256).unwrap();
        lua.globals().set("f", forge_handle(&lua, LuaForge::new(out, false)).unwrap()).unwrap();
        bind_input(&lua, |f| f.midi(&[0xf0, 0x7e, 0x01, 0x02, 0xf7]).unwrap());
        let seen: Vec<i64> = lua
            .load(
                "local seen
                 local r = MIDIResponder({
                     [0xf0] = function(self, frames, forge, chan, ...)
                         assert(chan == nil)
                         seen = {...}
                     end,
                 })
                 r(0, f, a)
                 return seen",
            )
            .eval()
            .unwrap();
        assert_eq!(seen, vec![0x7e, 0x01, 0x02, 0xf7]);

        bind_input(&lua, |f| f.midi(&[0x80, 60, 0]).unwrap());
        let err = lua
            .load("MIDIResponder({[0x80] = 42})(0, f, a)")
            .exec()
            .unwrap_err();
        assert!(err.to_string().contains("responder handler must be a function"), "{}", err);
    }
}
