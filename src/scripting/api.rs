/// `scripting/api.rs` — registers all Lua globals
///
/// Provides the script-facing surface of each VM:
///   print, Map, Unmap, Atom, MIDI, Patch, OSC, Time, Core, RDF, RDFS, Stash,
///   midi2cps, cps2midi, MIDIResponder, TimeResponder, OSCResponder,
///   StateResponder, Parameter
use mlua::{Function, Lua, Result as LuaResult, Table};

use super::{bindings, bindings_mut, midi, responder, stash};
use crate::atom::urid::ns;

/// Register every global on `lua`. The binding context must be installed.
pub fn register_all(lua: &Lua) -> LuaResult<()> {
    register_print(lua)?;
    register_map(lua)?;
    register_unmap(lua)?;
    register_atom(lua)?;
    register_midi(lua)?;
    register_patch(lua)?;
    register_osc(lua)?;
    register_time(lua)?;
    register_core(lua)?;
    register_rdf(lua)?;
    midi::register(lua)?;
    responder::register_all(lua)?;
    stash::register(lua)?;
    Ok(())
}

// ── print ─────────────────────────────────────────────────────────────────────

/// Joins its arguments in Lua, so the line is built on the VM heap.
const PRINT: &str = r#"
local trace, tostring, select, concat = ...
return function(...)
    local n = select('#', ...)
    if n == 0 then return end
    local parts = { ... }
    for i = 1, n do parts[i] = tostring(parts[i]) end
    trace(concat(parts, '\t', 1, n))
end
"#;

/// `print` writes into the capped trace buffer instead of stdout; the host
/// drains it off the audio thread.
fn register_print(lua: &Lua) -> LuaResult<()> {
    let trace = lua.create_function(|lua, line: mlua::String| {
        let bytes = line.as_bytes();
        bindings_mut(lua)?.trace.push_line(&String::from_utf8_lossy(&bytes));
        Ok(())
    })?;
    let tostring: Function = lua.globals().get("tostring")?;
    let concat: Function = lua.globals().get::<Table>("table")?.get("concat")?;
    let select: Function = lua.globals().get("select")?;
    let print: Function = lua
        .load(PRINT)
        .set_name("=print")
        .call((trace, tostring, select, concat))?;
    lua.globals().set("print", print)
}

// ── Map / Unmap ───────────────────────────────────────────────────────────────

/// `Map[uri]` returns the URID of `uri`, memoised in the table itself.
fn register_map(lua: &Lua) -> LuaResult<()> {
    let map = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(|lua, (this, uri): (Table, mlua::String)| {
            let urid = {
                let uri = uri.to_str()?;
                bindings(lua)?.mapper.map(&uri)
            };
            this.raw_set(uri, urid)?;
            Ok(urid)
        })?,
    )?;
    map.set_metatable(Some(meta));
    lua.globals().set("Map", map)
}

/// `Unmap[urid]` returns the URI of `urid` or nil.
fn register_unmap(lua: &Lua) -> LuaResult<()> {
    let unmap = lua.create_table()?;
    let meta = lua.create_table()?;
    meta.set(
        "__index",
        lua.create_function(|lua, (this, urid): (Table, u32)| {
            let uri = bindings(lua)?.mapper.unmap(urid);
            if let Some(uri) = &uri {
                this.raw_set(urid, uri.as_str())?;
            }
            Ok(uri)
        })?,
    )?;
    unmap.set_metatable(Some(meta));
    lua.globals().set("Unmap", unmap)
}

// ── Constant tables ──────────────────────────────────────────────────────────

fn constants(lua: &Lua, name: &str, entries: &[(&str, u32)]) -> LuaResult<Table> {
    let tbl = lua.create_table_with_capacity(0, entries.len())?;
    for (key, value) in entries {
        tbl.raw_set(*key, *value)?;
    }
    lua.globals().set(name, tbl.clone())?;
    Ok(tbl)
}

fn register_atom(lua: &Lua) -> LuaResult<()> {
    let a = bindings(lua)?.uris.atom;
    let atom = constants(
        lua,
        "Atom",
        &[
            ("Bool", a.bool_),
            ("Int", a.int),
            ("Long", a.long),
            ("Float", a.float),
            ("Double", a.double),
            ("URID", a.urid),
            ("String", a.string),
            ("URI", a.uri),
            ("Path", a.path),
            ("Literal", a.literal),
            ("Chunk", a.chunk),
            ("Tuple", a.tuple),
            ("Object", a.object),
            ("Property", a.property),
            ("Vector", a.vector),
            ("Sequence", a.sequence),
            ("frameTime", a.frame_time),
            ("beatTime", a.beat_time),
        ],
    )?;
    let child_type = bindings(lua)?.uris.param.child_type;
    atom.raw_set("childType", child_type)?;
    Ok(())
}

const MIDI_MESSAGES: &[(&str, u32)] = &[
    ("NoteOff", 0x80),
    ("NoteOn", 0x90),
    ("NotePressure", 0xa0),
    ("Controller", 0xb0),
    ("ProgramChange", 0xc0),
    ("ChannelPressure", 0xd0),
    ("Bender", 0xe0),
    ("SystemExclusive", 0xf0),
    ("QuarterFrame", 0xf1),
    ("SongPosition", 0xf2),
    ("SongSelect", 0xf3),
    ("TuneRequest", 0xf6),
    ("EndOfExclusive", 0xf7),
    ("Clock", 0xf8),
    ("Start", 0xfa),
    ("Continue", 0xfb),
    ("Stop", 0xfc),
    ("ActiveSense", 0xfe),
    ("Reset", 0xff),
];

const MIDI_CONTROLLERS: &[(&str, u32)] = &[
    ("BankSelection_MSB", 0x00),
    ("Modulation_MSB", 0x01),
    ("Breath_MSB", 0x02),
    ("Foot_MSB", 0x04),
    ("PortamentoTime_MSB", 0x05),
    ("DataEntry_MSB", 0x06),
    ("MainVolume_MSB", 0x07),
    ("Balance_MSB", 0x08),
    ("Panpot_MSB", 0x0a),
    ("Expression_MSB", 0x0b),
    ("BankSelection_LSB", 0x20),
    ("Modulation_LSB", 0x21),
    ("MainVolume_LSB", 0x27),
    ("SustainPedal", 0x40),
    ("Portamento", 0x41),
    ("Sostenuto", 0x42),
    ("SoftPedal", 0x43),
    ("LegatoFootSwitch", 0x44),
    ("Hold2", 0x45),
    ("ReverbDepth", 0x5b),
    ("ChorusDepth", 0x5d),
    ("DataIncrement", 0x60),
    ("DataDecrement", 0x61),
    ("NRPN_LSB", 0x62),
    ("NRPN_MSB", 0x63),
    ("RPN_LSB", 0x64),
    ("RPN_MSB", 0x65),
    ("AllSoundsOff", 0x78),
    ("ResetControllers", 0x79),
    ("LocalControlSwitch", 0x7a),
    ("AllNotesOff", 0x7b),
    ("OmniOff", 0x7c),
    ("OmniOn", 0x7d),
    ("Mono1", 0x7e),
    ("Mono2", 0x7f),
];

/// `MIDI` holds the event type, status bytes by name and the reverse
/// lookup `MIDI[0x90] == "NoteOn"`; controller numbers live in `Controller`.
fn register_midi(lua: &Lua) -> LuaResult<()> {
    let event = bindings(lua)?.uris.midi_event;
    let tbl = constants(lua, "MIDI", MIDI_MESSAGES)?;
    for (name, status) in MIDI_MESSAGES {
        tbl.raw_set(*status, *name)?;
    }
    tbl.raw_set("MidiEvent", event)?;

    let controllers = lua.create_table_with_capacity(MIDI_CONTROLLERS.len(), MIDI_CONTROLLERS.len())?;
    for (name, number) in MIDI_CONTROLLERS {
        controllers.raw_set(*name, *number)?;
        controllers.raw_set(*number, *name)?;
    }
    lua.globals().set("Controller", controllers)?;
    Ok(())
}

fn register_patch(lua: &Lua) -> LuaResult<()> {
    let p = bindings(lua)?.uris.patch;
    constants(
        lua,
        "Patch",
        &[
            ("Get", p.get),
            ("Set", p.set),
            ("Put", p.put),
            ("Patch", p.patch),
            ("Ack", p.ack),
            ("Error", p.error),
            ("Delete", p.delete),
            ("Copy", p.copy),
            ("Move", p.move_),
            ("Insert", p.insert),
            ("subject", p.subject),
            ("property", p.property),
            ("value", p.value),
            ("body", p.body),
            ("add", p.add),
            ("remove", p.remove),
            ("sequenceNumber", p.sequence_number),
            ("destination", p.destination),
            ("wildcard", p.wildcard),
            ("writable", p.writable),
            ("readable", p.readable),
            ("self", p.self_),
        ],
    )?;
    Ok(())
}

fn register_osc(lua: &Lua) -> LuaResult<()> {
    let o = bindings(lua)?.uris.osc;
    constants(
        lua,
        "OSC",
        &[
            ("Bundle", o.bundle),
            ("Message", o.message),
            ("Timetag", o.timetag),
            ("bundleTimetag", o.bundle_timetag),
            ("bundleItems", o.bundle_items),
            ("messagePath", o.message_path),
            ("messageArguments", o.message_arguments),
            ("timetagIntegral", o.timetag_integral),
            ("timetagFraction", o.timetag_fraction),
            ("Nil", o.nil),
            ("Impulse", o.impulse),
            ("Char", o.char_),
            ("RGBA", o.rgba),
        ],
    )?;
    Ok(())
}

fn register_time(lua: &Lua) -> LuaResult<()> {
    let t = bindings(lua)?.uris.time;
    constants(
        lua,
        "Time",
        &[
            ("Position", t.position),
            ("bar", t.bar),
            ("barBeat", t.bar_beat),
            ("beat", t.beat),
            ("beatUnit", t.beat_unit),
            ("beatsPerBar", t.beats_per_bar),
            ("beatsPerMinute", t.beats_per_minute),
            ("frame", t.frame),
            ("framesPerSecond", t.frames_per_second),
            ("speed", t.speed),
        ],
    )?;
    Ok(())
}

fn register_core(lua: &Lua) -> LuaResult<()> {
    let mapper = bindings(lua)?.mapper.clone();
    let core = |name: &str| mapper.map(&format!("{}{}", ns::CORE, name));
    constants(
        lua,
        "Core",
        &[
            ("sampleRate", core("sampleRate")),
            ("minimum", core("minimum")),
            ("maximum", core("maximum")),
            ("scalePoint", core("scalePoint")),
            ("minorVersion", core("minorVersion")),
            ("microVersion", core("microVersion")),
        ],
    )?;
    Ok(())
}

/// Parameter description keys.
fn register_rdf(lua: &Lua) -> LuaResult<()> {
    let p = bindings(lua)?.uris.param;
    constants(lua, "RDF", &[("value", p.value)])?;
    constants(
        lua,
        "RDFS",
        &[("label", p.label), ("range", p.range), ("comment", p.comment)],
    )?;
    Ok(())
}
