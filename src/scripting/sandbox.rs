/// `scripting/sandbox.rs` — Lua sandbox restrictions per VM
///
/// Every script VM is created with a restricted set of standard libraries.
/// Libraries that block or touch the filesystem (io, os, package, debug) are
/// omitted by default, and the base loaders `dofile`/`loadfile` are removed.
use mlua::{Lua, LuaOptions, Result as LuaResult, StdLib, Value};
use serde::{Deserialize, Serialize};

/// Controls which Lua standard libraries are available to a script.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum TrustLevel {
    /// Default: string, table, math, coroutine, utf8
    #[default]
    Basic,
    /// Adds io and os. Only for scripts the user wrote themselves
    Elevated,
}

impl TrustLevel {
    pub fn libs(self) -> StdLib {
        let basic = StdLib::TABLE | StdLib::STRING | StdLib::MATH | StdLib::COROUTINE | StdLib::UTF8;
        match self {
            TrustLevel::Basic => basic,
            TrustLevel::Elevated => basic | StdLib::IO | StdLib::OS,
        }
    }
}

/// Creates a new Lua VM with sandbox restrictions applied.
pub fn create_sandboxed_vm(trust: TrustLevel) -> LuaResult<Lua> {
    let lua = Lua::new_with(trust.libs(), LuaOptions::default())?;
    remove_loaders(&lua)?;
    Ok(lua)
}

/// Opens the libraries `trust` allows on a state that only has the base
/// library, then removes the file loaders.
pub fn restrict(lua: &Lua, trust: TrustLevel) -> LuaResult<()> {
    lua.load_std_libs(trust.libs())?;
    remove_loaders(lua)
}

fn remove_loaders(lua: &Lua) -> LuaResult<()> {
    let globals = lua.globals();
    globals.set("dofile", Value::Nil)?;
    globals.set("loadfile", Value::Nil)
}
