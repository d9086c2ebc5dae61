/// `audio/engine.rs` — Real-time engine and its host handle
///
/// `Engine::process` is the audio callback. It never blocks, never calls
/// `log` and never frees an instance, a region or a hand-off buffer: all of
/// those leave through the job ring and die on the worker. Each block it
///   1. retries jobs the ring refused last time and attaches new regions,
///   2. installs a freshly compiled instance (stash → swap → restore/apply)
///      and replays restored state into the live one,
///   3. reads the control port and serves a pending save,
///   4. runs the script, or writes an empty sequence while bypassed,
///   5. asks for more heap if needed and writes the notify port.
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use ringbuf::{traits::Split, HeapCons, HeapProd, HeapRb};

use super::control::{self, ControlRequest, Pending};
use super::jobs::{Garbage, HostRequest, Instance, Job, Reply, SaveSlot};
use super::worker::Worker;
use super::{Phase, Shared};
use crate::atom::urid::{UridMapper, Uris};
use crate::atom::{AtomBuf, AtomRef};
use crate::config::EngineConfig;
use crate::diagnostics::{self, Diagnostic, DiagnosticKind, DiagnosticsReader, DiagnosticsWriter};
use crate::error::{Error, Result};
use crate::forge::{Forge, ForgeCursor, ForgeResult};
use crate::scripting::clip;
use crate::state::PersistedState;
use crate::vm::{describe_error, write_empty_sequence, VmContext};

/// Bytes written to each port by one block.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BlockSizes {
    pub output: usize,
    pub notify: usize,
}

/// Builds the three parts of an engine: the audio-thread side, the host
/// handle and the worker (spawn it with `EngineHandle::spawn_worker`, or
/// poll it directly).
pub fn build(config: EngineConfig, mapper: Arc<dyn UridMapper>) -> Result<(Engine, EngineHandle, Worker)> {
    config.validate()?;
    let ctx = VmContext::new(mapper, config);
    let config = Arc::clone(&ctx.config);
    let shared = Arc::new(Shared::default());

    let (jobs_tx, jobs_rx) = HeapRb::<Job>::new(config.job_capacity).split();
    let (replies_tx, replies_rx) = HeapRb::<Reply>::new(config.job_capacity).split();
    let (requests_tx, requests_rx) = HeapRb::<HostRequest>::new(config.job_capacity).split();
    let (diag_tx, diag_rx) = diagnostics::channel(config.diagnostics_capacity, config.log_history);

    shared.code_spare.put(Box::new(String::with_capacity(config.max_chunk_len)));

    let engine = Engine {
        uris: Arc::clone(&ctx.uris),
        config: Arc::clone(&config),
        shared: Arc::clone(&shared),
        jobs: jobs_tx,
        replies: replies_rx,
        backlog: Vec::with_capacity(config.job_capacity),
        diagnostics: diag_tx,
        live: None,
        spare_code: Some(Box::new(String::with_capacity(config.max_chunk_len))),
        stash: Vec::with_capacity(config.stash_capacity),
        error: String::with_capacity(config.max_error_len),
        trace: String::with_capacity(config.max_error_len),
        bypass: false,
        pending: Pending::default(),
        leaked: 0,
    };
    let handle = EngineHandle {
        uris: Arc::clone(&ctx.uris),
        config,
        shared: Arc::clone(&shared),
        requests: requests_tx,
        diagnostics: diag_rx,
        worker: None,
    };
    let worker = Worker::new(ctx, jobs_rx, requests_rx, replies_tx, shared);
    Ok((engine, handle, worker))
}

// ── Engine (audio thread) ─────────────────────────────────────────────────────

pub struct Engine {
    uris: Arc<Uris>,
    config: Arc<EngineConfig>,
    shared: Arc<Shared>,
    jobs: HeapProd<Job>,
    replies: HeapCons<Reply>,
    /// Jobs the ring refused; preallocated, retried every block.
    backlog: Vec<Job>,
    diagnostics: DiagnosticsWriter,
    live: Option<Box<Instance>>,
    spare_code: Option<Box<String>>,
    // Preallocated scratch, never grown on this thread.
    stash: Vec<u8>,
    error: String,
    trace: String,
    bypass: bool,
    pending: Pending,
    /// Jobs dropped without freeing because ring and backlog were full.
    leaked: usize,
}

impl Engine {
    /// One audio block. `control` and `input` hold sequence atoms (empty
    /// slices count as empty sequences); `output` and `notify` receive one
    /// sequence atom each.
    pub fn process(
        &mut self,
        nsamples: u32,
        control: &[u8],
        input: &[u8],
        output: &mut [u8],
        notify: &mut [u8],
    ) -> BlockSizes {
        #[cfg(test)]
        crate::vm::audit::enter();

        self.flush_backlog();
        self.collect_replies();
        self.install_candidate();
        self.replay_state();
        self.collect_error();
        self.handle_control(control);
        self.serve_save();
        let output = self.run_script(nsamples, input, output);
        self.grow_heap();
        let notify = self.write_notify(notify);
        self.shared.set_phase(self.phase());

        #[cfg(test)]
        crate::vm::audit::leave();
        BlockSizes { output, notify }
    }

    pub fn phase(&self) -> Phase {
        match (&self.live, self.shared.candidate.is_empty()) {
            (None, _) => Phase::Cold,
            (Some(_), false) => Phase::Swapping,
            (Some(_), true) => Phase::Warm,
        }
    }

    /// True while a runtime error keeps the script from running.
    pub fn is_bypassed(&self) -> bool {
        self.bypass
    }

    pub fn last_error(&self) -> &str {
        &self.error
    }

    pub fn leaked(&self) -> usize {
        self.leaked
    }

    // ── Job ring ──────────────────────────────────────────────────────────────

    fn defer(&mut self, job: Job) {
        use ringbuf::traits::Producer as _;

        let job = match self.jobs.try_push(job) {
            Ok(()) => return,
            Err(job) => job,
        };
        if self.backlog.len() < self.backlog.capacity() {
            self.backlog.push(job);
        } else {
            std::mem::forget(job);
            self.leaked += 1;
            self.diagnostics
                .push(DiagnosticKind::Error, "job queue full, memory leaked");
        }
    }

    fn flush_backlog(&mut self) {
        use ringbuf::traits::{Observer as _, Producer as _};

        while !self.backlog.is_empty() && !self.jobs.is_full() {
            let job = self.backlog.remove(0);
            if let Err(job) = self.jobs.try_push(job) {
                self.backlog.insert(0, job);
                break;
            }
        }
    }

    fn collect_replies(&mut self) {
        use ringbuf::traits::Consumer as _;

        while let Some(reply) = self.replies.try_pop() {
            match reply {
                Reply::RegionReady(region) => {
                    let rejected = match self.live.as_mut() {
                        Some(live) if live.vm.id() == region.owner() => live.vm.attach_region(region).err(),
                        _ => Some(region),
                    };
                    if let Some(region) = rejected {
                        self.defer(Job::FreeRegion(region));
                    }
                }
                Reply::RegionFailed(req) => {
                    if let Some(live) = self.live.as_mut().filter(|l| l.vm.id() == req.owner) {
                        live.vm.region_failed(req.index);
                        self.diagnostics
                            .push(DiagnosticKind::Error, "interpreter heap could not grow");
                    }
                }
            }
        }
    }

    // ── Lifecycle ─────────────────────────────────────────────────────────────

    fn install_candidate(&mut self) {
        let Some(mut next) = self.shared.candidate.take() else {
            return;
        };

        let stashed = match self.live.as_mut() {
            Some(old) => match old.vm.stash(&mut self.stash) {
                Ok(stashed) => stashed,
                Err(e) => {
                    describe_error(&e, true, &mut self.trace, self.config.max_error_len);
                    self.diagnostics.push(DiagnosticKind::Error, &self.trace);
                    false
                }
            },
            None => false,
        };

        let Instance { vm, restore } = &mut *next;
        let result = match restore.as_deref() {
            Some(state) => vm.restore(state),
            None if stashed => vm.apply(&self.stash),
            None => Ok(false),
        };
        if let Err(e) = result {
            describe_error(&e, true, &mut self.trace, self.config.max_error_len);
            self.diagnostics.push(DiagnosticKind::Error, &self.trace);
        }
        self.trace.clear();

        if let Some(old) = self.live.replace(next) {
            self.defer(Job::FreeInstance(old));
        }
        self.shared.count_install();
        self.bypass = false;
        self.error.clear();
        self.pending.code = true;
        self.pending.error = true;
        self.drain_trace();
    }

    /// Passes state restored without a script to the live instance.
    fn replay_state(&mut self) {
        let Some(state) = self.shared.replay.take() else {
            return;
        };
        match self.live.as_mut() {
            Some(live) => {
                if let Err(e) = live.vm.restore(&state) {
                    describe_error(&e, true, &mut self.trace, self.config.max_error_len);
                    self.diagnostics.push(DiagnosticKind::Error, &self.trace);
                    self.trace.clear();
                }
                self.drain_trace();
            }
            None => self
                .diagnostics
                .push(DiagnosticKind::Error, "no live instance to restore state into"),
        }
        self.defer(Job::FreePointer(Garbage::State(state)));
    }

    fn collect_error(&mut self) {
        let Some(text) = self.shared.error.take() else {
            return;
        };
        self.error.clear();
        self.error.push_str(clip(&text, self.config.max_error_len));
        self.diagnostics.push(DiagnosticKind::Error, &self.error);
        self.pending.error = true;
        self.defer(Job::FreePointer(Garbage::Text(text)));
    }

    fn handle_control(&mut self, control: &[u8]) {
        let Some(seq) = AtomRef::parse(control).filter(|a| a.urid == self.uris.atom.sequence) else {
            return;
        };
        for event in seq.events() {
            match control::parse(event.atom, &self.uris) {
                Some(ControlRequest::Get(property)) => self.pending.request(property, &self.uris),
                Some(ControlRequest::SetCode(code)) => self.submit_code(code),
                None => {}
            }
        }
    }

    fn submit_code(&mut self, code: &str) {
        if self.spare_code.is_none() {
            self.spare_code = self.shared.code_spare.take();
        }
        let Some(mut buf) = self.spare_code.take() else {
            self.diagnostics
                .push(DiagnosticKind::Error, "compile request dropped, worker busy");
            return;
        };
        if code.len() > buf.capacity() {
            self.spare_code = Some(buf);
            self.diagnostics
                .push(DiagnosticKind::Error, "script exceeds the maximum chunk length");
            return;
        }
        buf.clear();
        buf.push_str(code);
        self.defer(Job::Compile(buf));
    }

    fn serve_save(&mut self) {
        let Some(mut slot) = self.shared.save_request.take() else {
            return;
        };
        slot.code.clear();
        slot.state.clear();
        slot.complete = false;
        if let Some(live) = self.live.as_mut() {
            let code = live.vm.code();
            if code.len() <= slot.code.capacity() {
                slot.code.push_str(code);
                match live.vm.save(&mut slot.state) {
                    Ok(_) => slot.complete = true,
                    Err(e) => {
                        describe_error(&e, true, &mut self.trace, self.config.max_error_len);
                        self.diagnostics.push(DiagnosticKind::Error, &self.trace);
                        self.trace.clear();
                    }
                }
            }
        }
        if let Some(unclaimed) = self.shared.saved.put(slot) {
            self.defer(Job::FreePointer(Garbage::Save(unclaimed)));
        }
    }

    // ── Script ────────────────────────────────────────────────────────────────

    fn run_script(&mut self, nsamples: u32, input: &[u8], output: &mut [u8]) -> usize {
        let result = match self.live.as_mut() {
            Some(live) if !self.bypass => Some(live.vm.run(nsamples, input, output)),
            _ => None,
        };
        let written = match result {
            Some(Ok(written)) => written,
            Some(Err(e)) => {
                describe_error(&e, true, &mut self.error, self.config.max_error_len);
                self.bypass = true;
                self.pending.error = true;
                self.diagnostics.push(DiagnosticKind::Error, &self.error);
                write_empty_sequence(output, self.uris.atom.sequence)
            }
            None => write_empty_sequence(output, self.uris.atom.sequence),
        };
        self.drain_trace();
        written
    }

    /// Moves the live instance's `print` output into `self.trace` and the
    /// diagnostics ring.
    fn drain_trace(&mut self) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let trace = &mut self.trace;
        let diagnostics = &mut self.diagnostics;
        let drained = live.vm.drain_trace(|text| {
            diagnostics.push_lines(DiagnosticKind::Trace, text);
            let room = trace.capacity() - trace.len();
            trace.push_str(clip(text, room));
        });
        if drained.is_err() {
            diagnostics.push(DiagnosticKind::Error, "script trace unavailable");
        }
    }

    fn grow_heap(&mut self) {
        let request = self.live.as_mut().and_then(|live| live.vm.request_region());
        if let Some(request) = request {
            self.defer(Job::AllocateRegion(request));
        }
    }

    fn write_notify(&mut self, notify: &mut [u8]) -> usize {
        let result = {
            let code = self.live.as_ref().map_or("", |live| live.vm.code());
            let mut cursor = ForgeCursor::new();
            let mut forge = Forge::new(notify, &mut cursor, &self.uris);
            forge_notify(&mut forge, &self.uris, self.pending, code, &self.error, &self.trace)
                .map(|()| forge.offset())
        };
        self.pending = Pending::default();
        self.trace.clear();
        match result {
            Ok(written) => written,
            Err(_) => {
                self.diagnostics.push(DiagnosticKind::Error, "notify buffer overflow");
                write_empty_sequence(notify, self.uris.atom.sequence)
            }
        }
    }
}

fn forge_notify(
    forge: &mut Forge<'_>,
    uris: &Uris,
    pending: Pending,
    code: &str,
    error: &str,
    trace: &str,
) -> ForgeResult<()> {
    let seq = forge.push_sequence(0)?;
    if pending.code {
        control::set_text(forge, 0, uris.engine.code, code)?;
    }
    if pending.error {
        control::set_text(forge, 0, uris.engine.error, error)?;
    }
    if !trace.is_empty() {
        control::set_text(forge, 0, uris.engine.trace, trace.trim_end_matches('\n'))?;
    }
    forge.pop(seq)
}

// ── EngineHandle (host side) ──────────────────────────────────────────────────

pub struct EngineHandle {
    uris: Arc<Uris>,
    config: Arc<EngineConfig>,
    shared: Arc<Shared>,
    requests: HeapProd<HostRequest>,
    diagnostics: DiagnosticsReader,
    worker: Option<JoinHandle<()>>,
}

impl EngineHandle {
    pub fn uris(&self) -> &Arc<Uris> {
        &self.uris
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn phase(&self) -> Phase {
        self.shared.phase()
    }

    pub fn installs(&self) -> u64 {
        self.shared.installs()
    }

    pub fn spawn_worker(&mut self, worker: Worker) -> Result<()> {
        if self.worker.is_some() {
            return Err(Error::Worker("worker already running".into()));
        }
        self.worker = Some(worker.spawn()?);
        log::info!("Script worker started");
        Ok(())
    }

    /// Queues `code` for compilation; the new instance is installed at the
    /// start of a later block.
    pub fn compile(&mut self, code: impl Into<String>) -> Result<()> {
        let code = code.into();
        if code.len() > self.config.max_chunk_len {
            return Err(Error::Script(format!(
                "script of {} bytes exceeds the {} byte limit",
                code.len(),
                self.config.max_chunk_len
            )));
        }
        self.push(HostRequest::Compile(code))
    }

    /// Decodes a persisted-state blob and queues its script; the saved
    /// state is passed to `restore` once the instance is installed. A blob
    /// without a script replays its state into the live instance.
    pub fn restore(&mut self, blob: &[u8]) -> Result<()> {
        let state = PersistedState::decode(blob, &self.uris)?;
        if !state.is_compatible() {
            log::warn!(
                "Restoring state from minor version {:?}, current is {}",
                state.minor_version,
                crate::state::MINOR_VERSION
            );
        }
        if state.code.is_some() {
            return self.push(HostRequest::Restore(state));
        }
        let Some(atom) = state.state else {
            return Err(Error::State("state carries neither script nor state".into()));
        };
        if self.shared.replay.put(Box::new(atom.into_bytes())).is_some() {
            log::warn!("Replaced a restored state the audio thread had not picked up");
        }
        Ok(())
    }

    fn push(&mut self, request: HostRequest) -> Result<()> {
        use ringbuf::traits::Producer as _;

        self.requests
            .try_push(request)
            .map_err(|_| Error::Worker("request queue full".into()))
    }

    /// Asks the audio thread to save the live instance during its next block.
    pub fn request_save(&self) {
        let slot = SaveSlot::with_capacity(self.config.max_chunk_len, self.config.stash_capacity);
        drop(self.shared.save_request.put(Box::new(slot)));
    }

    /// The encoded state of the last served save request, if one is ready.
    pub fn take_saved(&self) -> Option<Result<Vec<u8>>> {
        let slot = *self.shared.saved.take()?;
        if !slot.complete {
            return Some(Err(Error::State("no live instance to save".into())));
        }
        let state = AtomBuf::from_bytes(slot.state);
        Some(PersistedState::new(slot.code, state).encode(&self.uris))
    }

    /// Requests a save and waits up to `timeout` for the audio thread to
    /// serve it.
    pub fn save(&self, timeout: Duration) -> Result<Vec<u8>> {
        self.request_save();
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(saved) = self.take_saved() {
                return saved;
            }
            if Instant::now() >= deadline {
                return Err(Error::State("save timed out".into()));
            }
            std::thread::sleep(Duration::from_millis(self.config.worker_poll_ms.max(1)));
        }
    }

    /// Drains script output and errors; each message is also logged.
    pub fn diagnostics(&mut self) -> Vec<Diagnostic> {
        self.diagnostics.drain()
    }

    pub fn history(&self) -> impl Iterator<Item = &Diagnostic> {
        self.diagnostics.history()
    }

    pub fn dropped_diagnostics(&self) -> usize {
        self.diagnostics.dropped()
    }

    /// Stops and joins the worker thread.
    pub fn shutdown(&mut self) {
        self.shared.stop.store(true, std::sync::atomic::Ordering::Release);
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Script worker panicked");
            }
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::atom::urid::UridMap;
    use crate::atom::TimeStamp;
    use crate::vm::audit;
    use crate::vm::tests::midi_sequence;

    const ECHO: &str = "function run(n, seq, forge)
        for frames, atom in seq:foreach() do
            forge:time(frames + 5):atom(atom)
        end
    end";

    fn setup(config: EngineConfig) -> (Engine, EngineHandle, Worker) {
        let _ = env_logger::builder().is_test(true).try_init();
        build(config, Arc::new(UridMap::new())).unwrap()
    }

    fn small() -> EngineConfig {
        EngineConfig {
            event_capacity: 4096,
            stash_capacity: 1024,
            max_chunk_len: 4096,
            ..Default::default()
        }
    }

    struct Ports {
        output: Vec<u8>,
        notify: Vec<u8>,
    }

    impl Ports {
        fn new() -> Self {
            Self {
                output: vec![0; 4096],
                notify: vec![0; 4096],
            }
        }

        fn block(&mut self, engine: &mut Engine, control: &[u8], input: &[u8]) -> BlockSizes {
            engine.process(64, control, input, &mut self.output, &mut self.notify)
        }
    }

    fn events(bytes: &[u8]) -> Vec<(i64, Vec<u8>)> {
        AtomRef::parse(bytes)
            .map(|seq| seq.events().map(|e| (e.frames(), e.atom.body.to_vec())).collect())
            .unwrap_or_default()
    }

    /// `(property, text)` of every patch:Set on the notify port.
    fn notifications(uris: &Uris, bytes: &[u8]) -> Vec<(u32, String)> {
        let Some(seq) = AtomRef::parse(bytes) else {
            return Vec::new();
        };
        seq.events()
            .filter_map(|e| {
                let property = e.atom.property(uris.patch.property)?.as_u32()?;
                let text = e.atom.property(uris.patch.value)?.as_str()?.to_owned();
                Some((property, text))
            })
            .collect()
    }

    fn control_sequence(uris: &Uris, build: impl FnOnce(&mut Forge<'_>)) -> Vec<u8> {
        let mut buf = vec![0u8; 4096];
        let mut cursor = ForgeCursor::new();
        let len = {
            let mut forge = Forge::new(&mut buf, &mut cursor, uris);
            let seq = forge.push_sequence(0).unwrap();
            forge.time(TimeStamp::Frames(0)).unwrap();
            build(&mut forge);
            forge.pop(seq).unwrap();
            forge.offset()
        };
        buf.truncate(len);
        buf
    }

    #[test]
    fn cold_engine_outputs_empty_sequences() {
        let (mut engine, handle, _worker) = setup(small());
        let mut ports = Ports::new();
        let sizes = ports.block(&mut engine, &[], &[]);
        assert_eq!(sizes.output, 16);
        assert!(events(&ports.output).is_empty());
        assert_eq!(engine.phase(), Phase::Cold);
        assert_eq!(handle.phase(), Phase::Cold);
    }

    #[test]
    fn compiled_script_is_installed_and_echoes() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();

        handle.compile(ECHO).unwrap();
        worker.poll();
        assert_eq!(engine.phase(), Phase::Cold);
        let input = midi_sequence(
            &uris,
            &[(0, [0x90, 60, 100]), (10, [0x90, 64, 100]), (20, [0x80, 60, 0])],
        );
        let sizes = ports.block(&mut engine, &[], &input);
        assert_eq!(engine.phase(), Phase::Warm);
        assert_eq!(
            events(&ports.output[..sizes.output]),
            vec![
                (5, vec![0x90, 60, 100]),
                (15, vec![0x90, 64, 100]),
                (25, vec![0x80, 60, 0]),
            ]
        );
        let notes = notifications(&uris, &ports.notify[..sizes.notify]);
        assert!(notes.contains(&(uris.engine.code, ECHO.to_owned())));
        assert!(notes.contains(&(uris.engine.error, String::new())));
        assert_eq!(handle.installs(), 1);
    }

    #[test]
    fn runtime_error_bypasses_until_next_install() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();

        handle
            .compile(format!("{ECHO}\nlocal r = run\nfunction run(n, s, f) r(n, s, f); f:time(3):int(1) end"))
            .unwrap();
        worker.poll();
        let input = midi_sequence(&uris, &[(0, [0x90, 60, 100])]);
        let sizes = ports.block(&mut engine, &[], &input);
        assert!(engine.is_bypassed());
        assert!(engine.last_error().contains("invalid frame time, must not decrease"));
        assert!(!engine.last_error().starts_with("script:"));
        assert!(events(&ports.output[..sizes.output]).is_empty());
        let notes = notifications(&uris, &ports.notify[..sizes.notify]);
        assert!(notes.contains(&(uris.engine.error, engine.last_error().to_owned())));

        let sizes = ports.block(&mut engine, &[], &input);
        assert!(events(&ports.output[..sizes.output]).is_empty());

        handle.compile(ECHO).unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &input);
        assert!(!engine.is_bypassed());
        assert_eq!(events(&ports.output[..sizes.output]), vec![(5, vec![0x90, 60, 100])]);
        let errors = handle.diagnostics();
        assert!(errors.iter().any(|d| d.kind == DiagnosticKind::Error));
    }

    #[test]
    fn compile_errors_keep_the_live_instance() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();

        handle.compile(ECHO).unwrap();
        worker.poll();
        ports.block(&mut engine, &[], &[]);

        handle.compile("function run(").unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &[]);
        assert_eq!(engine.phase(), Phase::Warm);
        assert!(!engine.last_error().is_empty());
        let notes = notifications(&uris, &ports.notify[..sizes.notify]);
        assert!(notes.iter().any(|(p, t)| *p == uris.engine.error && !t.is_empty()));

        let input = midi_sequence(&uris, &[(1, [0x90, 1, 1])]);
        let sizes = ports.block(&mut engine, &[], &input);
        assert_eq!(events(&ports.output[..sizes.output]), vec![(6, vec![0x90, 1, 1])]);
    }

    #[test]
    fn control_port_compiles_and_answers_gets() {
        let (mut engine, handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();

        let set = control_sequence(&uris, |f| {
            let frame = f.set(None, None, uris.engine.code).unwrap();
            f.string(ECHO).unwrap();
            f.pop(frame).unwrap();
        });
        ports.block(&mut engine, &set, &[]);
        assert_eq!(worker.poll(), 1);
        ports.block(&mut engine, &[], &[]);
        assert_eq!(engine.phase(), Phase::Warm);

        let get = control_sequence(&uris, |f| f.get(None, None, Some(uris.engine.code)).unwrap());
        let sizes = ports.block(&mut engine, &get, &[]);
        let notes = notifications(&uris, &ports.notify[..sizes.notify]);
        assert_eq!(notes, vec![(uris.engine.code, ECHO.to_owned())]);

        let sizes = ports.block(&mut engine, &[], &[]);
        assert!(notifications(&uris, &ports.notify[..sizes.notify]).is_empty());
    }

    #[test]
    fn print_reaches_notify_and_diagnostics() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();

        handle.compile("function run(n) print('block', n) end").unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &[]);
        let notes = notifications(&uris, &ports.notify[..sizes.notify]);
        assert!(notes.contains(&(uris.engine.trace, "block\t64".to_owned())));
        let traces: Vec<_> = handle
            .diagnostics()
            .into_iter()
            .filter(|d| d.kind == DiagnosticKind::Trace)
            .map(|d| d.text)
            .collect();
        assert_eq!(traces, vec!["block\t64".to_owned()]);
    }

    #[test]
    fn stash_survives_a_swap() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();

        handle
            .compile("count = 0 function run() count = count + 1 end function stash(f) f:int(count) end")
            .unwrap();
        worker.poll();
        for _ in 0..3 {
            ports.block(&mut engine, &[], &[]);
        }
        handle
            .compile("function apply(a) carried = a.body end function run(n, s, f) f:time(0):int(carried) end")
            .unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &[]);
        let out = events(&ports.output[..sizes.output]);
        assert_eq!(out, vec![(0, 3i32.to_ne_bytes().to_vec())]);
    }

    #[test]
    fn save_and_restore_round_trip() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();
        let script = "level = 1
            function run(n, s, f) f:time(0):int(level) end
            function save(f) f:int(level * 7) end
            function restore(a) level = a.body end";

        handle.compile(script).unwrap();
        worker.poll();
        ports.block(&mut engine, &[], &[]);

        handle.request_save();
        ports.block(&mut engine, &[], &[]);
        let blob = handle.take_saved().unwrap().unwrap();
        let state = PersistedState::decode(&blob, handle.uris()).unwrap();
        assert_eq!(state.code.as_deref(), Some(script));

        handle.restore(&blob).unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &[]);
        assert_eq!(events(&ports.output[..sizes.output]), vec![(0, 7i32.to_ne_bytes().to_vec())]);
        assert_eq!(handle.installs(), 2);
    }

    #[test]
    fn state_without_script_is_replayed_into_the_live_instance() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();
        handle
            .compile(
                "level = 1
                 function run(n, s, f) f:time(0):int(level) end
                 function restore(a) level = a.body print('restored', level) end",
            )
            .unwrap();
        worker.poll();
        ports.block(&mut engine, &[], &[]);

        let state = PersistedState {
            code: None,
            minor_version: None,
            micro_version: None,
            state: Some(AtomBuf::from_atom(AtomRef::new(uris.atom.int, &9i32.to_ne_bytes()))),
        };
        handle.restore(&state.encode(&uris).unwrap()).unwrap();
        assert_eq!(worker.poll(), 0);

        let sizes = ports.block(&mut engine, &[], &[]);
        assert_eq!(events(&ports.output[..sizes.output]), vec![(0, 9i32.to_ne_bytes().to_vec())]);
        assert_eq!(handle.installs(), 1);
        assert!(handle
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::Trace && d.text == "restored\t9"));
        assert_eq!(worker.poll(), 1);

        let empty = PersistedState { state: None, ..state };
        assert!(matches!(handle.restore(&empty.encode(&uris).unwrap()), Err(Error::State(_))));
    }

    #[test]
    fn replayed_state_without_an_instance_is_reported() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let uris = Arc::clone(handle.uris());
        let mut ports = Ports::new();
        let state = PersistedState {
            code: None,
            minor_version: None,
            micro_version: None,
            state: Some(AtomBuf::from_atom(AtomRef::new(uris.atom.int, &1i32.to_ne_bytes()))),
        };
        handle.restore(&state.encode(&uris).unwrap()).unwrap();

        let before = audit::frees();
        ports.block(&mut engine, &[], &[]);
        assert_eq!(audit::frees(), before);
        assert!(handle
            .diagnostics()
            .iter()
            .any(|d| d.text == "no live instance to restore state into"));
        assert_eq!(worker.poll(), 1);
    }

    #[test]
    fn unreadable_trace_is_reported() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();
        handle.compile("function run() print('x') end").unwrap();
        worker.poll();
        ports.block(&mut engine, &[], &[]);
        handle.diagnostics();

        let live = engine.live.as_ref().unwrap();
        assert!(live.vm.lua().remove_app_data::<crate::scripting::Bindings>().is_some());
        ports.block(&mut engine, &[], &[]);
        assert!(handle
            .diagnostics()
            .iter()
            .any(|d| d.kind == DiagnosticKind::Error && d.text == "script trace unavailable"));
    }

    #[test]
    fn save_without_instance_reports_error() {
        let (mut engine, handle, _worker) = setup(small());
        let mut ports = Ports::new();
        handle.request_save();
        ports.block(&mut engine, &[], &[]);
        assert!(matches!(handle.take_saved(), Some(Err(Error::State(_)))));
        assert!(handle.take_saved().is_none());
    }

    #[test]
    fn superseded_candidate_never_reaches_the_audio_thread() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();
        handle.compile("which = 'first'").unwrap();
        handle.compile("which = 'second' function run(n, s, f) f:time(0):int(2) end").unwrap();
        worker.poll();
        let sizes = ports.block(&mut engine, &[], &[]);
        assert_eq!(events(&ports.output[..sizes.output]), vec![(0, 2i32.to_ne_bytes().to_vec())]);
        assert_eq!(handle.installs(), 1);
    }

    #[test]
    fn heap_grows_through_the_worker() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();
        handle
            .compile(
                "junk = {}
                 function run()
                     for i = 1, 40 do junk[#junk + 1] = string.rep('x', 1000) .. #junk end
                 end",
            )
            .unwrap();
        worker.poll();
        let space = |engine: &Engine| engine.live.as_ref().map_or(0, |l| l.vm.pool().space());

        let initial = small().initial_pool_bytes;
        let mut grown = false;
        for _ in 0..10 {
            ports.block(&mut engine, &[], &[]);
            worker.poll();
            if space(&engine) > initial {
                grown = true;
                break;
            }
        }
        assert!(grown);
        assert!(!engine.is_bypassed());
    }

    #[test]
    fn full_job_ring_defers_then_leaks() {
        let (mut engine, mut handle, mut worker) = setup(EngineConfig { job_capacity: 2, ..small() });
        let mut ports = Ports::new();
        let garbage = || Job::FreePointer(Garbage::Text(Box::new(String::from("x"))));

        audit::enter();
        for _ in 0..4 {
            engine.defer(garbage());
        }
        audit::leave();
        assert_eq!(engine.backlog.len(), 2);
        assert_eq!(engine.leaked(), 0);

        assert_eq!(worker.poll(), 2);
        ports.block(&mut engine, &[], &[]);
        assert!(engine.backlog.is_empty());
        assert_eq!(worker.poll(), 2);

        for _ in 0..5 {
            engine.defer(garbage());
        }
        assert_eq!(engine.leaked(), 1);
        let errors = handle.diagnostics();
        assert!(errors.iter().any(|d| d.text == "job queue full, memory leaked"));
    }

    #[test]
    fn ten_thousand_swaps_free_nothing_on_the_audio_thread() {
        let (mut engine, mut handle, mut worker) = setup(small());
        let mut ports = Ports::new();
        let before = audit::frees();
        for i in 0..10_000 {
            handle.compile(format!("function run(n, s, f) f:time(0):int({i}) end")).unwrap();
            worker.poll();
            let sizes = ports.block(&mut engine, &[], &[]);
            assert_eq!(events(&ports.output[..sizes.output]), vec![(0, (i as i32).to_ne_bytes().to_vec())]);
            worker.poll();
        }
        assert_eq!(audit::frees(), before);
        assert_eq!(handle.installs(), 10_000);
        assert_eq!(engine.leaked(), 0);
    }

    #[test]
    fn spawned_worker_serves_compiles() {
        let (mut engine, mut handle, worker) = setup(small());
        handle.spawn_worker(worker).unwrap();
        handle.compile(ECHO).unwrap();
        let mut ports = Ports::new();
        let deadline = Instant::now() + Duration::from_secs(5);
        while engine.phase() != Phase::Warm && Instant::now() < deadline {
            ports.block(&mut engine, &[], &[]);
            std::thread::sleep(Duration::from_millis(1));
        }
        assert_eq!(engine.phase(), Phase::Warm);
        let saved = handle.save(Duration::from_millis(0));
        assert!(saved.is_err());
        ports.block(&mut engine, &[], &[]);
        assert!(handle.take_saved().unwrap().is_ok());
        handle.shutdown();
    }
}
