/// `config.rs` — Engine configuration
///
/// Every capacity the audio thread relies on is fixed here, before the
/// engine starts: buffers are allocated once from these numbers and never
/// grown on the audio thread.
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::scripting::sandbox::TrustLevel;

// ── EngineConfig ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub sample_rate: u32,
    /// Relates beat-timed to frame-timed events in multiplex iteration.
    pub tempo_bpm: f64,

    // Interpreter heap
    pub initial_pool_bytes: usize,
    pub max_regions: usize,

    // Buffer capacities
    pub max_chunk_len: usize,
    pub max_error_len: usize,
    pub event_capacity: usize,
    pub stash_capacity: usize,
    /// Stash buffers a script may hold at once.
    pub stash_slots: usize,
    /// Atom and forge handles per kind created before the first callback.
    pub handle_cache: usize,
    pub job_capacity: usize,
    pub diagnostics_capacity: usize,

    // Worker / host
    pub worker_poll_ms: u64,
    pub log_history: usize,
    pub trust: TrustLevel,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            tempo_bpm: 120.0,
            initial_pool_bytes: 256 * 1024,
            max_regions: 8,
            max_chunk_len: 128 * 1024,
            max_error_len: 2 * 1024,
            event_capacity: 64 * 1024,
            stash_capacity: 64 * 1024,
            stash_slots: 4,
            handle_cache: 64,
            job_capacity: 64,
            diagnostics_capacity: 8 * 1024,
            worker_poll_ms: 1,
            log_history: 200,
            trust: TrustLevel::Basic,
        }
    }
}

impl EngineConfig {
    /// Parses a JSON document; absent fields keep their defaults.
    pub fn from_json(text: &str) -> Result<Self> {
        let config: Self =
            serde_json::from_str(text).map_err(|e| Error::Config(format!("invalid config: {e}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("sample_rate", self.sample_rate as usize),
            ("initial_pool_bytes", self.initial_pool_bytes),
            ("max_regions", self.max_regions),
            ("max_chunk_len", self.max_chunk_len),
            ("max_error_len", self.max_error_len),
            ("event_capacity", self.event_capacity),
            ("stash_capacity", self.stash_capacity),
            ("handle_cache", self.handle_cache),
            ("job_capacity", self.job_capacity),
            ("diagnostics_capacity", self.diagnostics_capacity),
        ];
        if let Some((name, _)) = positive.iter().find(|(_, v)| *v == 0) {
            return Err(Error::Config(format!("{name} must be greater than zero")));
        }
        if !(self.tempo_bpm.is_finite() && self.tempo_bpm > 0.0) {
            return Err(Error::Config(format!("tempo_bpm must be positive, got {}", self.tempo_bpm)));
        }
        if self.max_regions > usize::BITS as usize - 1 {
            return Err(Error::Config(format!("max_regions {} is too large", self.max_regions)));
        }
        if self.event_capacity < 16 {
            return Err(Error::Config("event_capacity must hold an empty sequence".into()));
        }
        Ok(())
    }

    pub fn frames_per_beat(&self) -> f64 {
        f64::from(self.sample_rate) * 60.0 / self.tempo_bpm
    }
}
