//! A warm engine serves blocks without touching the process allocator.

use std::alloc::{GlobalAlloc, Layout, System};
use std::cell::Cell;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use lunatom::atom::TimeStamp;
use lunatom::forge::{Forge, ForgeCursor};
use lunatom::{build, EngineConfig, Phase, UridMap, Uris};

struct Counting;

static CALLS: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static ARMED: Cell<bool> = const { Cell::new(false) };
}

fn record() {
    if ARMED.try_with(Cell::get).unwrap_or(false) {
        CALLS.fetch_add(1, Ordering::Relaxed);
    }
}

unsafe impl GlobalAlloc for Counting {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        record();
        System.alloc(layout)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, layout: Layout) {
        record();
        System.dealloc(ptr, layout)
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        record();
        System.realloc(ptr, layout, new_size)
    }
}

#[global_allocator]
static GLOBAL: Counting = Counting;

/// Allocator calls made by `f` on this thread.
fn count(f: impl FnOnce()) -> usize {
    let before = CALLS.load(Ordering::Relaxed);
    ARMED.with(|a| a.set(true));
    f();
    ARMED.with(|a| a.set(false));
    CALLS.load(Ordering::Relaxed) - before
}

fn midi_sequence(uris: &Uris, events: &[(i64, [u8; 3])]) -> Vec<u8> {
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

const SCRIPT: &str = "
    count = 0
    local held = {}
    function run(n, seq, forge)
        count = count + 1
        for frames, atom in seq:foreach() do
            held[#held % 8 + 1] = frames
            forge:time(frames + 1):atom(atom)
        end
        forge:time(n - 1):tuple():int(count):float(count / 2):string('tick'):pop()
    end";

#[test]
fn warm_blocks_do_not_allocate() {
    let config = EngineConfig {
        event_capacity: 4096,
        stash_capacity: 1024,
        max_chunk_len: 4096,
        ..Default::default()
    };
    let (mut engine, mut handle, mut worker) = build(config, Arc::new(UridMap::new())).unwrap();
    let input = midi_sequence(handle.uris(), &[(0, [0x90, 60, 100]), (7, [0x80, 60, 0])]);
    let mut output = vec![0u8; 4096];
    let mut notify = vec![0u8; 4096];

    handle.compile(SCRIPT).unwrap();
    worker.poll();
    for _ in 0..500 {
        engine.process(64, &[], &input, &mut output, &mut notify);
        worker.poll();
    }
    assert_eq!(engine.phase(), Phase::Warm);
    assert!(!engine.is_bypassed(), "{}", engine.last_error());

    let calls = count(|| {
        for _ in 0..200 {
            engine.process(64, &[], &input, &mut output, &mut notify);
        }
    });
    assert_eq!(calls, 0);
    assert!(!engine.is_bypassed(), "{}", engine.last_error());
}
