/// `scripting/` — Lua binding layer
///
/// Every VM instance carries one `Bindings` value in its app data: the buffer
/// arena, the resolved URIDs and the driver table. Atom and forge handles
/// only hold arena keys and offsets; each operation looks the bytes up again
/// and dispatches through the driver table.
pub mod api;
pub mod arena;
pub mod handle;
pub mod iter;
pub mod latom;
pub mod lforge;
pub mod midi;
pub mod responder;
pub mod sandbox;
pub mod stash;

use std::sync::Arc;

use mlua::{AppDataRef, AppDataRefMut, Lua, Result as LuaResult};

use crate::atom::driver::DriverTable;
use crate::atom::urid::{UridMapper, Uris};
use crate::config::EngineConfig;
use crate::forge::ForgeError;
use arena::BufferArena;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum BindingError {
    #[error("atom handle used after its buffer was released")]
    StaleHandle,
    #[error("atom of {0} bytes does not fit the scripted buffer")]
    Capacity(usize),
    #[error("multiplex iteration supports at most {0} sequences")]
    TooManySequences(usize),
    #[error("multiplex iteration expects sequence atoms")]
    NotASequence,
    #[error("unknown atom type")]
    UnknownType,
    #[error("scripting context is not installed")]
    NoContext,
    #[error("all {0} stash slots are in use")]
    StashSlots(usize),
    #[error("byte list longer than {0} bytes")]
    TooManyBytes(usize),
    #[error("expected a byte (integer)")]
    ExpectedByte,
    #[error("expected frame (integer) or beat (number) time")]
    ExpectedTime,
    #[error("vector element must be a number or boolean")]
    VectorElement,
    #[error("invalid timetag")]
    InvalidTimetag,
    #[error("missing argument for '{0}'")]
    MissingOscArgument(char),
    #[error("'{0}' expects a number")]
    OscNumber(char),
    #[error("'{0}' expects a string")]
    OscString(char),
    #[error("'{0}' argument is not valid UTF-8")]
    InvalidUtf8(char),
    #[error("unknown OSC type tag '{0}'")]
    UnknownOscTag(char),
    #[error("responder handler must be a function")]
    HandlerNotFunction,
    #[error("OSC message has more than {0} arguments")]
    TooManyOscArguments(usize),
}

impl From<BindingError> for mlua::Error {
    fn from(err: BindingError) -> Self {
        mlua::Error::external(err)
    }
}

impl From<ForgeError> for mlua::Error {
    fn from(err: ForgeError) -> Self {
        mlua::Error::external(err)
    }
}

// ── Trace buffer ─────────────────────────────────────────────────────────────

/// Output of `print`, preallocated so the audio thread never grows it.
#[derive(Debug)]
pub struct Trace {
    text: String,
    limit: usize,
    dropped: usize,
}

impl Trace {
    pub fn with_limit(limit: usize) -> Self {
        Self {
            text: String::with_capacity(limit),
            limit,
            dropped: 0,
        }
    }

    /// Appends one line; lines past the limit are clipped or counted as dropped.
    pub fn push_line(&mut self, line: &str) {
        let room = self.limit.saturating_sub(self.text.len());
        if room < 2 {
            self.dropped += 1;
            return;
        }
        self.text.push_str(clip(line, room - 1));
        self.text.push('\n');
    }

    pub fn is_empty(&self) -> bool {
        self.text.is_empty()
    }

    pub fn as_str(&self) -> &str {
        &self.text
    }

    pub fn dropped(&self) -> usize {
        self.dropped
    }

    /// Empties the buffer, keeping its allocation.
    pub fn clear(&mut self) {
        self.text.clear();
        self.dropped = 0;
    }
}

/// Longest prefix of `text` that fits `max` bytes on a char boundary.
pub(crate) fn clip(text: &str, max: usize) -> &str {
    if text.len() <= max {
        return text;
    }
    let mut end = max;
    while !text.is_char_boundary(end) {
        end -= 1;
    }
    &text[..end]
}

// ── Per-VM context ───────────────────────────────────────────────────────────

pub struct Bindings {
    pub arena: BufferArena,
    pub uris: Arc<Uris>,
    pub drivers: Arc<DriverTable>,
    pub mapper: Arc<dyn UridMapper>,
    /// Scales beat-timed events onto the frame axis for multiplexing.
    pub frames_per_beat: f64,
    pub sample_rate: u32,
    pub trace: Trace,
    /// Staging area for byte lists given as tables or varargs.
    pub(crate) bytes: Vec<u8>,
    /// Handles of each kind created up front by `install`.
    pub handle_cache: usize,
}

impl Bindings {
    pub fn new(uris: Arc<Uris>, drivers: Arc<DriverTable>, mapper: Arc<dyn UridMapper>, config: &EngineConfig) -> Self {
        Self {
            arena: BufferArena::new(config.event_capacity, config.stash_capacity, config.stash_slots),
            uris,
            drivers,
            mapper,
            frames_per_beat: config.frames_per_beat(),
            sample_rate: config.sample_rate,
            trace: Trace::with_limit(config.max_error_len),
            bytes: Vec::with_capacity(config.event_capacity),
            handle_cache: config.handle_cache,
        }
    }
}

/// Shared borrow of the context. Never hold it across a call back into Lua.
pub(crate) fn bindings(lua: &Lua) -> LuaResult<AppDataRef<'_, Bindings>> {
    lua.app_data_ref::<Bindings>()
        .ok_or_else(|| BindingError::NoContext.into())
}

pub(crate) fn bindings_mut(lua: &Lua) -> LuaResult<AppDataRefMut<'_, Bindings>> {
    lua.app_data_mut::<Bindings>()
        .ok_or_else(|| BindingError::NoContext.into())
}

/// Installs the context, the prefilled handle cache and every global into
/// `lua`. Worker thread only.
pub fn install(lua: &Lua, bindings: Bindings) -> LuaResult<()> {
    let handles = bindings.handle_cache;
    lua.set_app_data(bindings);
    let cache = handle::HandleCache::prefill(lua, handles)?;
    lua.set_app_data(cache);
    iter::register(lua)?;
    lforge::register(lua)?;
    api::register_all(lua)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::atom::urid::UridMap;

    /// Capacities of the test context; 24000 frames per beat.
    pub(crate) fn test_config() -> EngineConfig {
        EngineConfig {
            event_capacity: 4096,
            stash_capacity: 4096,
            stash_slots: 4,
            handle_cache: 8,
            max_error_len: 1024,
            ..Default::default()
        }
    }

    /// A sandboxed VM with the full binding layer installed.
    pub(crate) fn lua_with_bindings() -> Lua {
        let map: Arc<dyn UridMapper> = Arc::new(UridMap::new());
        let uris = Arc::new(Uris::new(map.as_ref()));
        let drivers = Arc::new(DriverTable::new(&uris));
        let lua = sandbox::create_sandboxed_vm(sandbox::TrustLevel::Basic).unwrap();
        let bindings = Bindings::new(uris, drivers, map, &test_config());
        install(&lua, bindings).unwrap();
        lua
    }

    #[test]
    fn clip_respects_char_boundaries() {
        assert_eq!(clip("hello", 10), "hello");
        assert_eq!(clip("hello", 3), "hel");
        assert_eq!(clip("héllo", 2), "h");
    }

    #[test]
    fn trace_is_capped() {
        let mut trace = Trace::with_limit(8);
        trace.push_line("abc");
        trace.push_line("defghij");
        assert_eq!(trace.as_str(), "abc\ndef\n");
        trace.push_line("x");
        assert_eq!(trace.dropped(), 1);
        trace.clear();
        assert!(trace.is_empty());
    }
}
