/// `scripting/stash.rs` — Script-owned atom buffers
///
/// `Stash()` hands the script a private buffer that survives across
/// callbacks. `write()` rewinds it and returns a forge on it, `read()`
/// returns the first atom written. Stashes draw from the arena's fixed slot
/// pool; a slot returns to the pool once its stash object is collected.
use mlua::{Lua, MetaMethod, Result as LuaResult, UserData, UserDataMethods, Value};

use super::arena::{BufferKey, Lease};
use super::handle::{atom_handle, forge_handle};
use super::latom::AtomView;
use super::lforge::LuaForge;
use super::{bindings, bindings_mut};
use crate::atom::AtomRef;

pub struct LuaStash {
    key: BufferKey,
    _lease: Lease,
}

impl UserData for LuaStash {
    fn add_methods<M: UserDataMethods<Self>>(methods: &mut M) {
        methods.add_method("write", |lua, this, ()| {
            bindings_mut(lua)?.arena.rewind(this.key)?;
            forge_handle(lua, LuaForge::new(this.key, false))
        });

        methods.add_method("read", |lua, this, ()| {
            let view = {
                let b = bindings(lua)?;
                let bytes = b.arena.bytes(this.key)?;
                AtomRef::parse(bytes).and_then(|atom| AtomView::within(this.key, atom, bytes))
            };
            match view {
                Some(view) => Ok(Value::UserData(atom_handle(lua, view, false)?)),
                None => Ok(Value::Nil),
            }
        });

        methods.add_meta_method(MetaMethod::ToString, |lua, this, ()| {
            let used = bindings(lua)?.arena.bytes(this.key).map_or(0, |b| b.len());
            Ok(format!("(stash: {} bytes)", used))
        });
    }
}

pub(crate) fn register(lua: &Lua) -> LuaResult<()> {
    let stash = lua.create_function(|lua, ()| {
        let (key, lease) = bindings_mut(lua)?.arena.alloc_owned()?;
        lua.create_userdata(LuaStash { key, _lease: lease })
    })?;
    lua.globals().set("Stash", stash)
}
