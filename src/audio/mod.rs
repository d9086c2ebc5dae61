/// `audio/` — Lifecycle manager and the threads around it
///
/// `Engine` lives on the audio thread, `Worker` on its own thread and
/// `EngineHandle` with the host. They share one `Shared` value: the typed
/// mailboxes for compiled instances, error text, spare code buffers, saves
/// and replayed state, plus a few flags. Everything else moves over `ringbuf` queues.
pub mod control;
pub mod engine;
pub mod jobs;
pub mod mailbox;
pub mod worker;

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};

use serde::Serialize;

use jobs::{Instance, SaveSlot};
use mailbox::Mailbox;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Phase {
    /// No instance installed.
    Cold,
    /// One live instance.
    Warm,
    /// A compiled replacement is waiting for the next block.
    Swapping,
}

#[derive(Debug, Default)]
pub struct Shared {
    pub candidate: Mailbox<Instance>,
    pub error: Mailbox<String>,
    pub code_spare: Mailbox<String>,
    pub save_request: Mailbox<SaveSlot>,
    pub saved: Mailbox<SaveSlot>,
    /// State atom to hand to the live instance's `restore`.
    pub replay: Mailbox<Vec<u8>>,
    pub stop: AtomicBool,
    phase: AtomicU8,
    installs: AtomicU64,
}

impl Shared {
    pub fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            0 => Phase::Cold,
            1 => Phase::Warm,
            _ => Phase::Swapping,
        }
    }

    pub(crate) fn set_phase(&self, phase: Phase) {
        let raw = match phase {
            Phase::Cold => 0,
            Phase::Warm => 1,
            Phase::Swapping => 2,
        };
        self.phase.store(raw, Ordering::Release);
    }

    /// Instances installed since the engine started.
    pub fn installs(&self) -> u64 {
        self.installs.load(Ordering::Relaxed)
    }

    pub(crate) fn count_install(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }
}
