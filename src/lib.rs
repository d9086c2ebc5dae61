pub mod atom;
pub mod audio;
pub mod config;
pub mod diagnostics;
pub mod error;
pub mod forge;
pub mod scripting;
pub mod state;
pub mod vm;

use std::sync::Arc;

pub use atom::urid::{UridMap, UridMapper, Uris};
pub use audio::engine::{build, BlockSizes, Engine, EngineHandle};
pub use audio::Phase;
pub use config::EngineConfig;
pub use error::{Error, Result};
pub use state::PersistedState;

/// Installs `env_logger` with `info` as the default level. Safe to call more
/// than once; later calls are ignored.
pub fn init_logging() {
    let env = env_logger::Env::default().default_filter_or("info");
    let _ = env_logger::Builder::from_env(env).try_init();
}

// ── Startup ───────────────────────────────────────────────────────────────────

/// Builds an engine and starts its worker thread. The `Engine` goes to the
/// audio callback, the handle stays with the host.
pub fn start(config: EngineConfig, mapper: Arc<dyn UridMapper>) -> Result<(Engine, EngineHandle)> {
    let (engine, mut handle, worker) = build(config, mapper)?;
    handle.spawn_worker(worker)?;
    log::info!(
        "[startup] engine ready: {} Hz, {} BPM, {} byte initial heap",
        handle.config().sample_rate,
        handle.config().tempo_bpm,
        handle.config().initial_pool_bytes
    );
    Ok((engine, handle))
}
