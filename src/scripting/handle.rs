/// `scripting/handle.rs` — Cached and uncached script handles
///
/// Cached handles are recycled: a fixed number of userdata objects per kind
/// is created on the worker when the binding layer is installed, and every
/// callback hands them out again, in order, from the start of the list. A
/// callback that needs more handles than the list holds gets uncached ones.
/// Uncached handles are plain userdata left to the Lua collector, for values
/// that must outlive a callback.
use mlua::{AnyUserData, Lua, MaybeSend, Result as LuaResult, UserData};

use super::arena::BufferKey;
use super::iter::Multiplex;
use super::latom::{AtomView, LuaAtom};
use super::lforge::LuaForge;
use super::{bindings_mut, BindingError};

/// Multiplex states kept per VM; nested merging loops past this are uncached.
const MERGES: usize = 4;

pub struct HandleCache {
    atoms: Vec<AnyUserData>,
    next_atom: usize,
    forges: Vec<AnyUserData>,
    next_forge: usize,
    merges: Vec<AnyUserData>,
    next_merge: usize,
}

fn fill<T: UserData + MaybeSend + 'static>(
    lua: &Lua,
    count: usize,
    make: impl Fn() -> T,
) -> LuaResult<Vec<AnyUserData>> {
    (0..count).map(|_| lua.create_userdata(make())).collect()
}

impl HandleCache {
    /// Creates `capacity` atom and forge handles. Worker thread only.
    pub fn prefill(lua: &Lua, capacity: usize) -> LuaResult<Self> {
        Ok(Self {
            atoms: fill(lua, capacity, || LuaAtom::new(AtomView::detached(), true))?,
            next_atom: 0,
            forges: fill(lua, capacity, || LuaForge::new(BufferKey::detached(), true))?,
            next_forge: 0,
            merges: fill(lua, MERGES.min(capacity), Multiplex::default)?,
            next_merge: 0,
        })
    }

    pub fn atoms(&self) -> usize {
        self.atoms.len()
    }

    pub fn forges(&self) -> usize {
        self.forges.len()
    }

    /// Cached atom handles handed out since the last rewind.
    pub fn atoms_in_use(&self) -> usize {
        self.next_atom
    }
}

/// Rewinds the cache and reclaims stash slots whose owner was collected.
/// Called once before every callback into the script.
pub fn begin_invocation(lua: &Lua) -> LuaResult<()> {
    if let Some(mut cache) = lua.app_data_mut::<HandleCache>() {
        cache.next_atom = 0;
        cache.next_forge = 0;
        cache.next_merge = 0;
    }
    bindings_mut(lua)?.arena.sweep();
    Ok(())
}

fn recycle<T: UserData + MaybeSend + 'static>(
    lua: &Lua,
    value: T,
    pick: fn(&mut HandleCache) -> (&[AnyUserData], &mut usize),
) -> LuaResult<AnyUserData> {
    let reuse = {
        let mut cache = lua
            .app_data_mut::<HandleCache>()
            .ok_or(BindingError::NoContext)?;
        let (list, next) = pick(&mut *cache);
        let found = list.get(*next).cloned();
        if found.is_some() {
            *next += 1;
        }
        found
    };
    match reuse {
        Some(ud) => {
            *ud.borrow_mut::<T>()? = value;
            Ok(ud)
        }
        None => lua.create_userdata(value),
    }
}

pub fn atom_handle(lua: &Lua, view: AtomView, cached: bool) -> LuaResult<AnyUserData> {
    let atom = LuaAtom::new(view, cached);
    if !cached {
        return lua.create_userdata(atom);
    }
    recycle(lua, atom, |c| (&c.atoms, &mut c.next_atom))
}

pub fn forge_handle(lua: &Lua, forge: LuaForge) -> LuaResult<AnyUserData> {
    if !forge.cached {
        return lua.create_userdata(forge);
    }
    recycle(lua, forge, |c| (&c.forges, &mut c.next_forge))
}

pub(crate) fn merge_handle(lua: &Lua, merge: Multiplex) -> LuaResult<AnyUserData> {
    if !merge.cached {
        return lua.create_userdata(merge);
    }
    recycle(lua, merge, |c| (&c.merges, &mut c.next_merge))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scripting::arena::INPUT;
    use crate::scripting::tests::{lua_with_bindings, test_config};

    fn same(a: &AnyUserData, b: &AnyUserData) -> bool {
        mlua::Value::UserData(a.clone()).to_pointer() == mlua::Value::UserData(b.clone()).to_pointer()
    }

    fn view(lua: &Lua) -> AtomView {
        let key = bindings_mut(lua)
            .unwrap()
            .arena
            .bind_copy(INPUT, &[4, 0, 0, 0, 0, 0, 0, 0, 1, 0, 0, 0, 0, 0, 0, 0])
            .unwrap();
        AtomView::slot(key, 0, 8, 4)
    }

    #[test]
    fn cached_handles_are_reused_across_invocations() {
        let lua = lua_with_bindings();
        let view = view(&lua);
        let capacity = test_config().handle_cache;

        begin_invocation(&lua).unwrap();
        let a = atom_handle(&lua, view.clone(), true).unwrap();
        let b = atom_handle(&lua, view.clone(), true).unwrap();
        assert!(!same(&a, &b));
        assert_eq!(lua.app_data_ref::<HandleCache>().unwrap().atoms_in_use(), 2);

        begin_invocation(&lua).unwrap();
        let again = atom_handle(&lua, view.clone(), true).unwrap();
        assert!(same(&again, &a));
        assert_eq!(lua.app_data_ref::<HandleCache>().unwrap().atoms(), capacity);

        let loose = atom_handle(&lua, view, false).unwrap();
        assert!(!same(&loose, &a) && !same(&loose, &b));
        assert_eq!(lua.app_data_ref::<HandleCache>().unwrap().atoms_in_use(), 1);
    }

    #[test]
    fn overflow_handles_are_uncached_and_the_list_stays_fixed() {
        let lua = lua_with_bindings();
        let view = view(&lua);
        let capacity = test_config().handle_cache;

        begin_invocation(&lua).unwrap();
        let handles: Vec<AnyUserData> = (0..capacity + 2)
            .map(|_| atom_handle(&lua, view.clone(), true).unwrap())
            .collect();
        let cache = lua.app_data_ref::<HandleCache>().unwrap();
        assert_eq!(cache.atoms(), capacity);
        assert_eq!(cache.atoms_in_use(), capacity);
        assert_eq!(cache.forges(), capacity);
        drop(cache);
        assert!(!same(&handles[capacity], &handles[capacity + 1]));
        assert!(handles[..capacity].iter().all(|h| !same(h, &handles[capacity])));

        lua.globals().set("h", handles[capacity + 1].clone()).unwrap();
        let body: i64 = lua.load("return h.body").eval().unwrap();
        assert_eq!(body, 1);
    }

    #[test]
    fn prefilled_handles_start_detached() {
        let lua = lua_with_bindings();
        begin_invocation(&lua).unwrap();
        let list = lua.app_data_ref::<HandleCache>().unwrap().atoms[0].clone();
        lua.globals().set("h", list).unwrap();
        let err = lua.load("return h.body").exec().unwrap_err();
        assert!(err.to_string().contains("atom handle used after its buffer was released"), "{}", err);
    }
}
