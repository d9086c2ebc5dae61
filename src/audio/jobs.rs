/// `audio/jobs.rs` — Messages between the audio thread, worker and host
///
/// `Job` travels audio → worker over a fixed-capacity ring, `Reply` travels
/// back over a second ring, `HostRequest` comes from the host handle.
/// Payloads are boxed or owned so a job only moves ownership: whatever the
/// audio thread gives up is freed by the worker.
use crate::state::PersistedState;
use crate::vm::pool::{Region, RegionRequest};
use crate::vm::Vm;

pub enum Job {
    /// Allocate a pool region and reply with it.
    AllocateRegion(RegionRequest),
    /// A region the audio thread could not attach.
    FreeRegion(Region),
    /// Script text received on the control port. The buffer goes back to the
    /// audio thread's spare pool after compilation.
    Compile(Box<String>),
    /// An instance replaced by a newer one.
    FreeInstance(Box<Instance>),
    FreePointer(Garbage),
}

impl Job {
    pub fn kind(&self) -> &'static str {
        match self {
            Job::AllocateRegion(_) => "allocate-region",
            Job::FreeRegion(_) => "free-region",
            Job::Compile(_) => "compile-and-install",
            Job::FreeInstance(_) => "free-instance",
            Job::FreePointer(_) => "free-pointer",
        }
    }
}

/// Buffers the audio thread is done with.
pub enum Garbage {
    Text(Box<String>),
    Save(Box<SaveSlot>),
    State(Box<Vec<u8>>),
}

pub enum Reply {
    RegionReady(Region),
    RegionFailed(RegionRequest),
}

pub enum HostRequest {
    Compile(String),
    /// Compile the saved script and replay its state after install.
    Restore(PersistedState),
}

/// A compiled script. Boxed once on the worker and moved as a whole from
/// mailbox to live slot to free job.
pub struct Instance {
    pub vm: Vm,
    /// State atom to pass to `restore` right after install.
    pub restore: Option<Vec<u8>>,
}

/// A save in flight: the host preallocates both buffers, the audio thread
/// fills them from the live instance and sends the slot back.
#[derive(Debug)]
pub struct SaveSlot {
    pub code: String,
    pub state: Vec<u8>,
    /// False if no instance was live or the script failed to save.
    pub complete: bool,
}

impl SaveSlot {
    pub fn with_capacity(code: usize, state: usize) -> Self {
        Self {
            code: String::with_capacity(code),
            state: Vec::with_capacity(state),
            complete: false,
        }
    }
}
