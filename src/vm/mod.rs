/// `vm/` — One interpreter instance and its heap pool
///
/// A `Vm` is built and destroyed on the worker; the audio thread only runs
/// it. Each entry point (`run`, `stash`, `apply`, `save`, `restore`) binds
/// the caller's bytes into the arena, calls the matching script global if it
/// exists, copies the forged result out and invalidates every handle created
/// during the call.
///
/// The interpreter allocates from the instance's heap pool once the binding
/// layer is being installed. Blocks allocated before that, by the standard
/// library and the interpreter itself, stay with the process allocator and
/// are returned to it when freed.
pub mod pool;

use std::fmt::Write as _;
use std::mem::ManuallyDrop;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use mlua::{Function, Lua, Value};

use crate::atom::driver::DriverTable;
use crate::atom::urid::{UridMapper, Uris};
use crate::atom::{AtomRef, Urid, HEADER_SIZE};
use crate::config::EngineConfig;
use crate::error::{Error, Result};
use crate::forge::FrameRef;
use crate::scripting::arena::{BufferKey, INPUT, OUTPUT, SCRATCH};
use crate::scripting::handle::{atom_handle, begin_invocation, forge_handle};
use crate::scripting::latom::AtomView;
use crate::scripting::lforge::{self, LuaForge};
use crate::scripting::sandbox::create_sandboxed_vm;
use crate::scripting::{bindings, bindings_mut, install, Bindings};
use pool::{HeapPool, Region, RegionRequest};

/// Chunk name of every script; error locations read `script:<line>:`.
const CHUNK_NAME: &str = "=script";

static NEXT_VM_ID: AtomicU64 = AtomicU64::new(1);

// ── VmContext ─────────────────────────────────────────────────────────────────

/// Everything a new instance is built from. Created once per engine and
/// shared by every instance it compiles.
#[derive(Clone)]
pub struct VmContext {
    pub uris: Arc<Uris>,
    pub drivers: Arc<DriverTable>,
    pub mapper: Arc<dyn UridMapper>,
    pub config: Arc<EngineConfig>,
}

impl VmContext {
    pub fn new(mapper: Arc<dyn UridMapper>, config: EngineConfig) -> Self {
        let uris = Arc::new(Uris::new(mapper.as_ref()));
        let drivers = Arc::new(DriverTable::new(&uris));
        Self {
            uris,
            drivers,
            mapper,
            config: Arc::new(config),
        }
    }
}

// ── Vm ────────────────────────────────────────────────────────────────────────

pub struct Vm {
    id: u64,
    lua: ManuallyDrop<Lua>,
    /// Allocator of `lua`; freed in `Drop` after the state is closed.
    heap: NonNull<HeapPool>,
    code: String,
    once_pending: bool,
}

// SAFETY: `heap` is reached only through `&mut self` or from inside `lua`,
// and both move between threads together.
unsafe impl Send for Vm {}

impl Vm {
    /// A fresh instance with the binding layer installed and no script.
    /// Worker thread only.
    pub fn new(ctx: &VmContext) -> Result<Self> {
        let config = &ctx.config;
        let id = NEXT_VM_ID.fetch_add(1, Ordering::Relaxed);

        let mut pool = HeapPool::new(id, config.initial_pool_bytes, config.max_regions);
        let first = Region::allocate(id, 0, pool.region_size(0))
            .ok_or_else(|| Error::Worker("cannot allocate the initial pool region".into()))?;
        pool.attach(first)
            .map_err(|_| Error::Worker("initial pool region rejected".into()))?;

        let lua = create_sandboxed_vm(config.trust)?;
        lua.gc_collect()?;
        let vm = Self {
            id,
            lua: ManuallyDrop::new(lua),
            heap: NonNull::from(Box::leak(Box::new(pool))),
            code: String::new(),
            once_pending: true,
        };
        let heap = vm.heap;
        // SAFETY: the pool is boxed and outlives the state, see `Drop`.
        unsafe {
            vm.lua
                .exec_raw::<()>((), |state| (*heap.as_ptr()).take_over(state))?;
        }

        let bindings = Bindings::new(
            Arc::clone(&ctx.uris),
            Arc::clone(&ctx.drivers),
            Arc::clone(&ctx.mapper),
            config,
        );
        install(&vm.lua, bindings)?;
        vm.lua.gc_stop();
        Ok(vm)
    }

    /// Builds an instance and executes `code` in it. Worker thread only.
    pub fn compile(ctx: &VmContext, code: &str) -> Result<Self> {
        if code.len() > ctx.config.max_chunk_len {
            return Err(Error::Script(format!(
                "script of {} bytes exceeds the {} byte limit",
                code.len(),
                ctx.config.max_chunk_len
            )));
        }
        let mut vm = Self::new(ctx)?;
        vm.lua
            .load(code)
            .set_name(CHUNK_NAME)
            .exec()
            .map_err(|e| {
                let mut msg = String::new();
                describe_error(&e, false, &mut msg, ctx.config.max_error_len);
                Error::Script(msg)
            })?;
        vm.code = code.to_owned();
        Ok(vm)
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn code(&self) -> &str {
        &self.code
    }

    pub fn lua(&self) -> &Lua {
        &self.lua
    }

    pub fn pool(&self) -> &HeapPool {
        // SAFETY: the interpreter is not running while `self` is borrowed.
        unsafe { self.heap.as_ref() }
    }

    fn pool_mut(&mut self) -> &mut HeapPool {
        // SAFETY: as in `pool`, and `&mut self` excludes other readers.
        unsafe { self.heap.as_mut() }
    }

    /// Bytes the interpreter holds in its heap pool.
    pub fn used_memory(&self) -> usize {
        self.pool().used()
    }

    // ── Heap growth ───────────────────────────────────────────────────────────

    /// The region to request next, if the heap is past half its budget.
    pub fn request_region(&mut self) -> Option<RegionRequest> {
        let pool = self.pool_mut();
        let used = pool.used();
        pool.request(used)
    }

    /// Adds a region delivered by the worker to the interpreter heap.
    pub fn attach_region(&mut self, region: Region) -> std::result::Result<(), Region> {
        self.pool_mut().attach(region)
    }

    pub fn region_failed(&mut self, index: usize) {
        self.pool_mut().fail(index);
    }

    // ── Callbacks ─────────────────────────────────────────────────────────────

    /// Runs `once` (first block only) and `run` over `input`, forging into
    /// `output`. Returns the bytes written. On error `output` holds an empty
    /// sequence.
    pub fn run(&mut self, nsamples: u32, input: &[u8], output: &mut [u8]) -> mlua::Result<usize> {
        let result = self.run_callbacks(nsamples, input, output);
        if result.is_err() {
            let sequence = bindings(&self.lua)?.uris.atom.sequence;
            write_empty_sequence(output, sequence);
        }
        self.finish_invocation()?;
        result
    }

    fn run_callbacks(&mut self, nsamples: u32, input: &[u8], output: &mut [u8]) -> mlua::Result<usize> {
        let lua = &self.lua;
        begin_invocation(lua)?;

        let (seq_view, out_key) = {
            let mut b = bindings_mut(lua)?;
            let sequence = b.uris.atom.sequence;
            let empty = empty_sequence(sequence);
            let bytes = match AtomRef::parse(input) {
                Some(atom) if atom.urid == sequence => &input[..atom.total_size()],
                _ => &empty[..],
            };
            let body_len = bytes.len() - HEADER_SIZE;
            let in_key = b.arena.bind_copy(INPUT, bytes)?;
            let out_key = b.arena.bind_output(OUTPUT, output.len())?;
            (AtomView::slot(in_key, sequence, HEADER_SIZE, body_len), out_key)
        };

        let seq = atom_handle(lua, seq_view, true)?;
        let forge = forge_handle(lua, LuaForge::new(out_key, true))?;
        let frame = lforge::write(lua, out_key, |f| f.push_sequence(0))?;

        if self.once_pending {
            self.once_pending = false;
            if let Some(once) = callback(lua, "once")? {
                once.call::<()>((nsamples, seq.clone(), forge.clone()))?;
            }
        }
        if let Some(run) = callback(lua, "run")? {
            run.call::<()>((nsamples, seq, forge))?;
        }

        close_base_frame(lua, out_key, frame)?;
        let b = bindings(lua)?;
        let bytes = b.arena.bytes(out_key)?;
        output[..bytes.len()].copy_from_slice(bytes);
        Ok(bytes.len())
    }

    /// Calls `stash(forge)` and copies the forged atom into `out`, whose
    /// capacity bounds the atom size. False if the script has no `stash`.
    pub fn stash(&mut self, out: &mut Vec<u8>) -> mlua::Result<bool> {
        self.forge_callback("stash", out)
    }

    /// Calls `save(forge)`; see `stash`.
    pub fn save(&mut self, out: &mut Vec<u8>) -> mlua::Result<bool> {
        self.forge_callback("save", out)
    }

    /// Calls `apply(atom)` with the atom in `bytes`.
    pub fn apply(&mut self, bytes: &[u8]) -> mlua::Result<bool> {
        self.atom_callback("apply", bytes)
    }

    /// Calls `restore(atom)` with the atom in `bytes`.
    pub fn restore(&mut self, bytes: &[u8]) -> mlua::Result<bool> {
        self.atom_callback("restore", bytes)
    }

    fn forge_callback(&mut self, name: &str, out: &mut Vec<u8>) -> mlua::Result<bool> {
        out.clear();
        let lua = &self.lua;
        let Some(f) = callback(lua, name)? else {
            return Ok(false);
        };
        begin_invocation(lua)?;
        let key = {
            let mut b = bindings_mut(lua)?;
            let len = out.capacity().min(b.arena.capacity(SCRATCH));
            b.arena.bind_output(SCRATCH, len)?
        };
        let forge = forge_handle(lua, LuaForge::new(key, true))?;
        let result = f.call::<()>(forge).and_then(|()| {
            let depth = lforge::write(lua, key, |f| Ok(f.depth()))?;
            if depth != 0 {
                return Err(unclosed(depth));
            }
            let b = bindings(lua)?;
            let bytes = b.arena.bytes(key)?;
            let len = AtomRef::parse(bytes).map_or(0, |a| a.total_size());
            out.extend_from_slice(&bytes[..len]);
            Ok(len > 0)
        });
        self.finish_invocation()?;
        result
    }

    fn atom_callback(&mut self, name: &str, bytes: &[u8]) -> mlua::Result<bool> {
        let lua = &self.lua;
        let Some(f) = callback(lua, name)? else {
            return Ok(false);
        };
        let Some(atom) = AtomRef::parse(bytes) else {
            return Ok(false);
        };
        begin_invocation(lua)?;
        let view = {
            let mut b = bindings_mut(lua)?;
            let key = b.arena.bind_copy(SCRATCH, &bytes[..atom.total_size()])?;
            AtomView::slot(key, atom.urid, HEADER_SIZE, atom.body.len())
        };
        let handle = atom_handle(lua, view, true)?;
        let result = f.call::<()>(handle).map(|()| true);
        self.finish_invocation()?;
        result
    }

    /// Invalidates the per-call slots and advances the collector one step.
    fn finish_invocation(&mut self) -> mlua::Result<()> {
        {
            let mut b = bindings_mut(&self.lua)?;
            b.arena.release(INPUT);
            b.arena.release(OUTPUT);
            b.arena.release(SCRATCH);
        }
        self.lua.gc_step()?;
        Ok(())
    }

    /// Hands every pending `print` line to `f`, then empties the trace.
    pub fn drain_trace(&self, mut f: impl FnMut(&str)) -> mlua::Result<()> {
        let mut b = bindings_mut(&self.lua)?;
        if !b.trace.is_empty() {
            f(b.trace.as_str());
        }
        b.trace.clear();
        Ok(())
    }
}

impl Drop for Vm {
    fn drop(&mut self) {
        #[cfg(test)]
        audit::record_free();
        // SAFETY: the state is closed first; it frees its blocks into the
        // pool. Nothing else holds a strong reference to it.
        unsafe {
            ManuallyDrop::drop(&mut self.lua);
            drop(Box::from_raw(self.heap.as_ptr()));
        }
    }
}

fn callback(lua: &Lua, name: &str) -> mlua::Result<Option<Function>> {
    match lua.globals().get::<Value>(name)? {
        Value::Function(f) => Ok(Some(f)),
        _ => Ok(None),
    }
}

fn unclosed(depth: usize) -> mlua::Error {
    mlua::Error::runtime(format!("{depth} forge frame(s) left open"))
}

/// Pops the sequence frame opened around `run`; it must be the only one left.
fn close_base_frame(lua: &Lua, key: BufferKey, frame: FrameRef) -> mlua::Result<()> {
    let depth = lforge::write(lua, key, |f| Ok(f.depth()))?;
    if depth != 1 {
        return Err(unclosed(depth.saturating_sub(1)));
    }
    lforge::write(lua, key, |f| f.pop(frame))
}

fn empty_sequence(sequence: Urid) -> [u8; 16] {
    let mut bytes = [0u8; 16];
    bytes[..4].copy_from_slice(&8u32.to_ne_bytes());
    bytes[4..8].copy_from_slice(&sequence.to_ne_bytes());
    bytes
}

/// Writes an empty frame-timed sequence to the front of `output`.
pub fn write_empty_sequence(output: &mut [u8], sequence: Urid) -> usize {
    let bytes = empty_sequence(sequence);
    match output.get_mut(..bytes.len()) {
        Some(head) => {
            head.copy_from_slice(&bytes);
            bytes.len()
        }
        None => 0,
    }
}

// ── Error text ────────────────────────────────────────────────────────────────

/// `fmt::Write` sink that keeps the first line only, clipped to `max` bytes.
struct FirstLine<'a> {
    out: &'a mut String,
    max: usize,
    done: bool,
}

impl std::fmt::Write for FirstLine<'_> {
    fn write_str(&mut self, s: &str) -> std::fmt::Result {
        if self.done {
            return Ok(());
        }
        let s = match s.find('\n') {
            Some(end) => {
                self.done = true;
                &s[..end]
            }
            None => s,
        };
        let room = self.max.saturating_sub(self.out.len());
        let clipped = crate::scripting::clip(s, room);
        if clipped.len() < s.len() {
            self.done = true;
        }
        self.out.push_str(clipped);
        Ok(())
    }
}

/// Writes the first line of `err` into `out` (cleared first, never grown
/// past `max`), dropping the error class prefix and, if `strip_location`,
/// the `script:<line>:` location.
pub fn describe_error(err: &mlua::Error, strip_location: bool, out: &mut String, max: usize) {
    out.clear();
    let mut sink = FirstLine { out, max, done: false };
    let _ = write!(sink, "{err}");

    let mut cut = ["runtime error: ", "syntax error: "]
        .iter()
        .find_map(|p| out.starts_with(p).then_some(p.len()))
        .unwrap_or(0);
    if strip_location {
        cut += location_len(&out[cut..]);
    }
    out.drain(..cut);
}

fn location_len(text: &str) -> usize {
    let Some(rest) = text.strip_prefix("script:") else {
        return 0;
    };
    let digits = rest.bytes().take_while(u8::is_ascii_digit).count();
    match rest[digits..].strip_prefix(": ") {
        Some(_) if digits > 0 => "script:".len() + digits + 2,
        _ => 0,
    }
}

// ── Free audit ────────────────────────────────────────────────────────────────


#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::atom::urid::UridMap;
    use crate::atom::TimeStamp;
    use crate::forge::{Forge, ForgeCursor};

    pub(crate) fn context() -> VmContext {
        let config = EngineConfig {
            event_capacity: 4096,
            stash_capacity: 1024,
            ..Default::default()
        };
        VmContext::new(Arc::new(UridMap::new()), config)
    }

    /// A frame-timed sequence of MIDI events.
    pub(crate) fn midi_sequence(uris: &Uris, events: &[(i64, [u8; 3])]) -> Vec<u8> {
        let mut buf = vec![0u8; 1024];
        let mut cursor = ForgeCursor::new();
        let len = {
            let mut forge = Forge::new(&mut buf, &mut cursor, uris);
            let frame = forge.push_sequence(0).unwrap();
            for (frames, msg) in events {
                forge.time(TimeStamp::Frames(*frames)).unwrap();
                forge.midi(msg).unwrap();
            }
            forge.pop(frame).unwrap();
            forge.offset()
        };
        buf.truncate(len);
        buf
    }

    fn events(bytes: &[u8]) -> Vec<(i64, Vec<u8>)> {
        let seq = AtomRef::parse(bytes).unwrap();
        seq.events().map(|e| (e.frames(), e.atom.body.to_vec())).collect()
    }

    #[test]
    fn echo_script_offsets_events() {
        let ctx = context();
        let mut vm = Vm::compile(
            &ctx,
            "function run(n, seq, forge)
                 for frames, atom in seq:foreach() do
                     forge:time(frames + 5):atom(atom)
                 end
             end",
        )
        .unwrap();
        let input = midi_sequence(
            &ctx.uris,
            &[(0, [0x90, 60, 100]), (10, [0x90, 64, 100]), (20, [0x80, 60, 0])],
        );
        let mut output = vec![0u8; 1024];
        let len = vm.run(64, &input, &mut output).unwrap();
        assert_eq!(
            events(&output[..len]),
            vec![
                (5, vec![0x90, 60, 100]),
                (15, vec![0x90, 64, 100]),
                (25, vec![0x80, 60, 0]),
            ]
        );
    }

    #[test]
    fn earlier_event_after_echo_is_rejected() {
        let ctx = context();
        let mut vm = Vm::compile(
            &ctx,
            "function run(n, seq, forge)
                 for frames, atom in seq:foreach() do
                     forge:time(frames + 5):atom(atom)
                 end
                 forge:time(3):int(1)
             end",
        )
        .unwrap();
        let input = midi_sequence(&ctx.uris, &[(0, [0x90, 60, 100]), (20, [0x80, 60, 0])]);
        let mut output = vec![0xffu8; 1024];
        let err = vm.run(64, &input, &mut output).unwrap_err();
        assert!(err.to_string().contains("invalid frame time, must not decrease"));
        assert!(events(&output).is_empty());
    }

    #[test]
    fn once_runs_on_the_first_block_only() {
        let ctx = context();
        let mut vm = Vm::compile(
            &ctx,
            "count = 0
             function once(n, seq, forge) count = count + 10 end
             function run(n, seq, forge) count = count + 1 end",
        )
        .unwrap();
        let mut output = vec![0u8; 256];
        vm.run(32, &[], &mut output).unwrap();
        vm.run(32, &[], &mut output).unwrap();
        let count: i64 = vm.lua().globals().get("count").unwrap();
        assert_eq!(count, 12);
    }

    #[test]
    fn missing_run_yields_empty_sequence() {
        let ctx = context();
        let mut vm = Vm::compile(&ctx, "x = 1").unwrap();
        let mut output = vec![0u8; 64];
        let len = vm.run(32, &[], &mut output).unwrap();
        assert_eq!(len, 16);
        assert!(events(&output).is_empty());
    }

    #[test]
    fn open_frames_abandon_the_block() {
        let ctx = context();
        let mut vm = Vm::compile(&ctx, "function run(n, seq, forge) forge:time(0):tuple():int(1) end").unwrap();
        let mut output = vec![0u8; 256];
        let err = vm.run(32, &[], &mut output).unwrap_err();
        assert!(err.to_string().contains("left open"));
        assert!(events(&output).is_empty());
    }

    #[test]
    fn overflow_is_reported_and_output_cleared() {
        let ctx = context();
        let mut vm = Vm::compile(
            &ctx,
            "function run(n, seq, forge) for i = 1, 100 do forge:time(i):long(i) end end",
        )
        .unwrap();
        let mut output = vec![0u8; 64];
        let err = vm.run(32, &[], &mut output).unwrap_err();
        assert!(crate::error::is_overflow(&err));
        assert!(events(&output).is_empty());
    }

    #[test]
    fn compile_errors_are_script_errors() {
        let ctx = context();
        let err = Vm::compile(&ctx, "function run(").err().unwrap();
        assert!(matches!(err, Error::Script(_)));
        let err = Vm::compile(&ctx, "error('bad top level')").err().unwrap();
        assert!(err.to_string().contains("bad top level"));
    }

    #[test]
    fn stash_and_apply_carry_state() {
        let ctx = context();
        let mut old = Vm::compile(
            &ctx,
            "level = 42
             function stash(forge) forge:int(level) end",
        )
        .unwrap();
        let mut new = Vm::compile(&ctx, "function apply(atom) level = atom.body end").unwrap();

        let mut buf = Vec::with_capacity(256);
        assert!(old.stash(&mut buf).unwrap());
        assert!(new.apply(&buf).unwrap());
        let level: i64 = new.lua().globals().get("level").unwrap();
        assert_eq!(level, 42);

        assert!(!new.stash(&mut buf).unwrap());
        assert!(buf.is_empty());
        assert!(!old.apply(&[]).unwrap());
    }

    #[test]
    fn save_and_restore_use_their_own_globals() {
        let ctx = context();
        let mut vm = Vm::compile(
            &ctx,
            "value = 'x'
             function save(forge) forge:string(value) end
             function restore(atom) value = atom.body end",
        )
        .unwrap();
        let mut buf = Vec::with_capacity(256);
        assert!(vm.save(&mut buf).unwrap());
        vm.lua().globals().set("value", "changed").unwrap();
        assert!(vm.restore(&buf).unwrap());
        let value: String = vm.lua().globals().get("value").unwrap();
        assert_eq!(value, "x");
    }

    #[test]
    fn runtime_error_text_drops_location() {
        let ctx = context();
        let mut vm = Vm::compile(&ctx, "function run() error('boom') end").unwrap();
        let mut output = vec![0u8; 64];
        let err = vm.run(1, &[], &mut output).unwrap_err();
        let mut text = String::with_capacity(64);
        describe_error(&err, true, &mut text, 64);
        assert_eq!(text, "boom");
        describe_error(&err, false, &mut text, 64);
        assert!(text.starts_with("script:1: boom"));
        describe_error(&err, true, &mut text, 2);
        assert!(text.len() <= 2);
    }

    #[test]
    fn print_is_drained_from_trace() {
        let ctx = context();
        let mut vm = Vm::compile(&ctx, "function run() print('tick') end").unwrap();
        let mut output = vec![0u8; 64];
        vm.run(1, &[], &mut output).unwrap();
        let mut lines = String::new();
        vm.drain_trace(|t| lines.push_str(t)).unwrap();
        assert_eq!(lines, "tick\n");
        vm.drain_trace(|_| panic!("trace not cleared")).unwrap();
    }

    #[test]
    fn region_requests_follow_heap_use() {
        let ctx = context();
        let mut vm = Vm::compile(&ctx, "x = 1").unwrap();
        assert!(vm.request_region().is_none());

        let mut n = 0;
        while vm.used_memory() <= 128 * 1024 {
            vm.lua()
                .load(format!("junk{n} = string.rep('x', 1000) .. {n}"))
                .exec()
                .unwrap();
            n += 1;
        }
        let req = vm.request_region().unwrap();
        assert_eq!((req.owner, req.index, req.size), (vm.id(), 1, 256 * 1024));
        assert!(vm.request_region().is_none());

        vm.attach_region(Region::allocate(vm.id(), 1, req.size).unwrap()).unwrap();
        assert_eq!(vm.pool().space(), 512 * 1024);
    }

    #[test]
    fn interpreter_heap_is_bounded_by_the_pool() {
        let ctx = context();
        let vm = Vm::compile(&ctx, "function grow(n) return string.rep('x', n) end").unwrap();
        let before = vm.used_memory();
        let grow: Function = vm.lua().globals().get("grow").unwrap();
        let kept: mlua::String = grow.call(64 * 1024).unwrap();
        assert!(vm.used_memory() >= before + 64 * 1024);
        drop(kept);

        let space = vm.pool().space();
        let err = grow.call::<mlua::String>(space).unwrap_err();
        assert!(matches!(err, mlua::Error::MemoryError(_)), "{err}");
        assert!(vm.used_memory() < space);
    }
}
