/// `audio/worker.rs` — Non-real-time side of the engine
///
/// Drains host requests and audio-thread jobs: compiles scripts into new
/// instances, allocates and frees pool regions, and destroys everything the
/// audio thread hands back. `poll` does one pass and is what tests drive;
/// `spawn` runs it on a dedicated thread until the handle shuts it down.
use std::collections::VecDeque;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use ringbuf::{HeapCons, HeapProd};

use super::jobs::{Garbage, HostRequest, Instance, Job, Reply};
use super::Shared;
use crate::error::{Error, Result};
use crate::scripting::clip;
use crate::vm::pool::Region;
use crate::vm::{Vm, VmContext};

pub struct Worker {
    ctx: VmContext,
    jobs: HeapCons<Job>,
    requests: HeapCons<HostRequest>,
    replies: HeapProd<Reply>,
    shared: Arc<Shared>,
    /// Replies the ring had no room for.
    backlog: VecDeque<Reply>,
    /// Code buffers waiting for the spare mailbox to empty.
    spares: Vec<Box<String>>,
}

impl Worker {
    pub(crate) fn new(
        ctx: VmContext,
        jobs: HeapCons<Job>,
        requests: HeapCons<HostRequest>,
        replies: HeapProd<Reply>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            ctx,
            jobs,
            requests,
            replies,
            shared,
            backlog: VecDeque::new(),
            spares: Vec::new(),
        }
    }

    /// Handles everything queued right now. Returns the number of messages
    /// processed.
    pub fn poll(&mut self) -> usize {
        use ringbuf::traits::Consumer as _;

        self.flush_replies();
        self.offer_spare();
        let mut handled = 0;
        while let Some(request) = self.requests.try_pop() {
            self.handle_request(request);
            handled += 1;
        }
        while let Some(job) = self.jobs.try_pop() {
            self.handle_job(job);
            handled += 1;
        }
        handled
    }

    fn handle_request(&mut self, request: HostRequest) {
        match request {
            HostRequest::Compile(code) => self.compile(&code, None),
            HostRequest::Restore(state) => {
                let Some(code) = state.code else {
                    log::warn!("Restore skipped: state carries no script");
                    return;
                };
                let restore = state.state.map(|s| s.into_bytes());
                self.compile(&code, restore);
            }
        }
    }

    fn handle_job(&mut self, job: Job) {
        log::trace!("Worker job: {}", job.kind());
        match job {
            Job::AllocateRegion(req) => match Region::allocate(req.owner, req.index, req.size) {
                Some(region) => {
                    log::debug!(
                        "Allocated region {} ({} bytes) for instance {}",
                        req.index,
                        req.size,
                        req.owner
                    );
                    self.reply(Reply::RegionReady(region));
                }
                None => {
                    log::warn!("Region allocation of {} bytes failed", req.size);
                    self.reply(Reply::RegionFailed(req));
                }
            },
            Job::FreeRegion(region) => {
                log::debug!("Freed region {} of instance {}", region.index(), region.owner());
            }
            Job::Compile(mut code) => {
                self.compile(&code, None);
                code.clear();
                self.spares.push(code);
                self.offer_spare();
            }
            Job::FreeInstance(instance) => {
                log::info!("Reclaimed instance {}", instance.vm.id());
            }
            Job::FreePointer(garbage) => match garbage {
                Garbage::Text(_) => log::trace!("Freed error text"),
                Garbage::Save(_) => log::trace!("Freed unclaimed save"),
                Garbage::State(_) => log::trace!("Freed replayed state"),
            },
        }
    }

    fn offer_spare(&mut self) {
        if !self.shared.code_spare.is_empty() {
            return;
        }
        if let Some(spare) = self.spares.pop() {
            if let Some(back) = self.shared.code_spare.put(spare) {
                self.spares.push(back);
            }
        }
    }

    fn compile(&mut self, code: &str, restore: Option<Vec<u8>>) {
        match Vm::compile(&self.ctx, code) {
            Ok(vm) => {
                log::info!("Compiled script into instance {}", vm.id());
                let instance = Box::new(Instance { vm, restore });
                if let Some(old) = self.shared.candidate.put(instance) {
                    log::info!("Instance {} superseded before install", old.vm.id());
                }
            }
            Err(e) => {
                log::warn!("Script rejected: {e}");
                let text = match e {
                    Error::Script(msg) => msg,
                    other => other.to_string(),
                };
                let text = clip(&text, self.ctx.config.max_error_len).to_owned();
                drop(self.shared.error.put(Box::new(text)));
            }
        }
    }

    fn reply(&mut self, reply: Reply) {
        use ringbuf::traits::Producer as _;

        if !self.backlog.is_empty() {
            self.backlog.push_back(reply);
            return;
        }
        if let Err(reply) = self.replies.try_push(reply) {
            self.backlog.push_back(reply);
        }
    }

    fn flush_replies(&mut self) {
        use ringbuf::traits::Producer as _;

        while let Some(reply) = self.backlog.pop_front() {
            if let Err(reply) = self.replies.try_push(reply) {
                self.backlog.push_front(reply);
                break;
            }
        }
    }

    /// Polls until the handle raises the stop flag, sleeping between idle
    /// passes.
    pub fn run(mut self) {
        let idle = Duration::from_millis(self.ctx.config.worker_poll_ms.max(1));
        while !self.shared.stop.load(Ordering::Acquire) {
            if self.poll() == 0 {
                thread::sleep(idle);
            }
        }
        self.poll();
        log::info!("Script worker stopped");
    }

    pub fn spawn(self) -> Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("lunatom-worker".into())
            .spawn(move || self.run())
            .map_err(|e| Error::Worker(format!("Failed to spawn worker thread: {e}")))
    }
}
