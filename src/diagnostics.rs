/// `diagnostics.rs` — Size-capped diagnostics channel
///
/// The audio thread never logs. It frames trace lines and error messages
/// into a fixed byte ring; the host side drains the ring, timestamps each
/// message, forwards it to `log` and keeps a bounded history for the UI.
///
/// Frame layout: `[kind: u8][len: u16 LE][text: len bytes]`, committed with a
/// single `push_slice` so the reader never sees half a message.
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use ringbuf::{traits::Split, HeapCons, HeapProd, HeapRb};
use serde::Serialize;

use crate::scripting::clip;

const FRAME_HEADER: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DiagnosticKind {
    Trace,
    Error,
    Info,
}

impl DiagnosticKind {
    fn tag(self) -> u8 {
        match self {
            DiagnosticKind::Trace => 0,
            DiagnosticKind::Error => 1,
            DiagnosticKind::Info => 2,
        }
    }

    fn from_tag(tag: u8) -> Self {
        match tag {
            0 => DiagnosticKind::Trace,
            1 => DiagnosticKind::Error,
            _ => DiagnosticKind::Info,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Diagnostic {
    pub kind: DiagnosticKind,
    pub text: String,
    pub at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct Counters {
    dropped: AtomicUsize,
}

/// Creates a channel holding at most `capacity` bytes of framed messages.
/// The reader keeps the last `history` drained messages.
pub fn channel(capacity: usize, history: usize) -> (DiagnosticsWriter, DiagnosticsReader) {
    let capacity = capacity.max(FRAME_HEADER + 1);
    let (prod, cons) = HeapRb::<u8>::new(capacity).split();
    let counters = Arc::new(Counters::default());
    (
        DiagnosticsWriter {
            prod,
            frame: Vec::with_capacity(capacity),
            max_text: (capacity - FRAME_HEADER).min(u16::MAX as usize),
            counters: Arc::clone(&counters),
        },
        DiagnosticsReader {
            cons,
            counters,
            history: VecDeque::with_capacity(history),
            history_cap: history,
        },
    )
}

// ── Writer (audio thread) ─────────────────────────────────────────────────────

pub struct DiagnosticsWriter {
    prod: HeapProd<u8>,
    /// Preallocated staging buffer for one frame.
    frame: Vec<u8>,
    max_text: usize,
    counters: Arc<Counters>,
}

impl DiagnosticsWriter {
    /// Queues one message, clipped to what a frame can carry. A message that
    /// does not fit the ring is counted as dropped.
    pub fn push(&mut self, kind: DiagnosticKind, text: &str) {
        use ringbuf::traits::{Observer as _, Producer as _};

        let text = clip(text, self.max_text);
        if self.prod.vacant_len() < FRAME_HEADER + text.len() {
            self.counters.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let len = text.len() as u16;
        self.frame.clear();
        self.frame.push(kind.tag());
        self.frame.extend_from_slice(&len.to_le_bytes());
        self.frame.extend_from_slice(text.as_bytes());
        self.prod.push_slice(&self.frame);
    }

    /// Queues every line of `text` as a separate trace message.
    pub fn push_lines(&mut self, kind: DiagnosticKind, text: &str) {
        for line in text.lines() {
            self.push(kind, line);
        }
    }
}

// ── Reader (host side) ────────────────────────────────────────────────────────

pub struct DiagnosticsReader {
    cons: HeapCons<u8>,
    counters: Arc<Counters>,
    history: VecDeque<Diagnostic>,
    history_cap: usize,
}

impl DiagnosticsReader {
    /// Pops every complete message, logs it and appends it to the history.
    pub fn drain(&mut self) -> Vec<Diagnostic> {
        use ringbuf::traits::{Consumer as _, Observer as _};

        let mut out = Vec::new();
        while self.cons.occupied_len() >= FRAME_HEADER {
            let mut header = [0u8; FRAME_HEADER];
            self.cons.pop_slice(&mut header);
            let len = u16::from_le_bytes([header[1], header[2]]) as usize;
            let mut text = vec![0u8; len];
            let got = self.cons.pop_slice(&mut text);
            text.truncate(got);

            let entry = Diagnostic {
                kind: DiagnosticKind::from_tag(header[0]),
                text: String::from_utf8_lossy(&text).into_owned(),
                at: Utc::now(),
            };
            match entry.kind {
                DiagnosticKind::Error => log::warn!("[script] {}", entry.text),
                _ => log::info!("[script] {}", entry.text),
            }
            out.push(entry);
        }

        for entry in &out {
            if self.history.len() == self.history_cap {
                self.history.pop_front();
            }
            if self.history_cap > 0 {
                self.history.push_back(entry.clone());
            }
        }
        out
    }

    pub fn history(&self) -> impl Iterator<Item = &Diagnostic> {
        self.history.iter()
    }

    /// Messages refused because the ring was full.
    pub fn dropped(&self) -> usize {
        self.counters.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn messages_round_trip_in_order() {
        let (mut w, mut r) = channel(256, 10);
        w.push(DiagnosticKind::Trace, "hello");
        w.push(DiagnosticKind::Error, "boom");
        let got = r.drain();
        assert_eq!(got.len(), 2);
        assert_eq!((got[0].kind, got[0].text.as_str()), (DiagnosticKind::Trace, "hello"));
        assert_eq!((got[1].kind, got[1].text.as_str()), (DiagnosticKind::Error, "boom"));
        assert!(r.drain().is_empty());
    }

    #[test]
    fn full_ring_drops_whole_messages() {
        let (mut w, mut r) = channel(16, 10);
        w.push(DiagnosticKind::Trace, "0123456789");
        w.push(DiagnosticKind::Trace, "abc");
        assert_eq!(r.dropped(), 1);
        let got = r.drain();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].text, "0123456789");
    }

    #[test]
    fn long_text_is_clipped_to_capacity() {
        let (mut w, mut r) = channel(8, 10);
        w.push(DiagnosticKind::Info, "abcdefghij");
        assert_eq!(r.drain()[0].text, "abcde");
    }

    #[test]
    fn history_is_bounded() {
        let (mut w, mut r) = channel(256, 2);
        w.push_lines(DiagnosticKind::Trace, "a\nb\nc\n");
        r.drain();
        let kept: Vec<_> = r.history().map(|d| d.text.as_str()).collect();
        assert_eq!(kept, vec!["b", "c"]);
    }
}
