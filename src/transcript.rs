//! Live-call transcript store
//!
//! Append-only per-call log with tail reads, held in process memory.
//! Sequences expire 30 minutes after the last append; entries are for live
//! observation only and are lost on restart.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// How long a sequence survives after its last append
pub const TRANSCRIPT_TTL: Duration = Duration::from_secs(30 * 60);

/// Interval of the background expiry sweep
const SWEEP_INTERVAL: Duration = Duration::from_secs(60);

/// One transcript line
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entry {
    /// Milliseconds since the store was created; monotonic per process
    pub ts_ms: u64,
    pub kind: EntryKind,
    pub text: String,
}

/// What produced the line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryKind {
    AudioTranscriptDelta,
    TextDelta,
}

struct Sequence {
    entries: Vec<Entry>,
    expires_at: Instant,
}

/// Shared append-only transcript log keyed by call id
pub struct TranscriptStore {
    epoch: Instant,
    sequences: Mutex<HashMap<String, Sequence>>,
}

impl TranscriptStore {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            epoch: Instant::now(),
            sequences: Mutex::new(HashMap::new()),
        })
    }

    /// Current monotonic timestamp for new entries
    pub fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// Append a line and refresh the key's TTL
    pub fn append(&self, key: &str, kind: EntryKind, text: impl Into<String>) {
        let entry = Entry {
            ts_ms: self.now_ms(),
            kind,
            text: text.into(),
        };
        let mut sequences = self.sequences.lock().expect("transcript lock");
        let seq = sequences.entry(key.to_string()).or_insert_with(|| Sequence {
            entries: Vec::new(),
            expires_at: Instant::now() + TRANSCRIPT_TTL,
        });
        seq.entries.push(entry);
        seq.expires_at = Instant::now() + TRANSCRIPT_TTL;
    }

    /// Entries from `cursor` to the end, plus the next cursor.
    ///
    /// The returned cursor is the sequence length; passing it back yields
    /// only entries appended since, with no gaps or duplicates.
    pub fn range(&self, key: &str, cursor: usize) -> (Vec<Entry>, usize) {
        let mut sequences = self.sequences.lock().expect("transcript lock");
        match sequences.get(key) {
            Some(seq) if seq.expires_at > Instant::now() => {
                let len = seq.entries.len();
                let start = cursor.min(len);
                (seq.entries[start..].to_vec(), len)
            }
            Some(_) => {
                sequences.remove(key);
                (Vec::new(), cursor)
            }
            None => (Vec::new(), cursor),
        }
    }

    /// Whether a live sequence exists for the key
    pub fn contains(&self, key: &str) -> bool {
        let sequences = self.sequences.lock().expect("transcript lock");
        sequences
            .get(key)
            .map(|s| s.expires_at > Instant::now())
            .unwrap_or(false)
    }

    /// Drop expired sequences
    pub fn sweep(&self) {
        let now = Instant::now();
        let mut sequences = self.sequences.lock().expect("transcript lock");
        let before = sequences.len();
        sequences.retain(|_, seq| seq.expires_at > now);
        let dropped = before - sequences.len();
        if dropped > 0 {
            debug!("Expired {} transcript sequence(s)", dropped);
        }
    }

    /// Spawn the periodic expiry sweep for a shared store
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(SWEEP_INTERVAL);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                store.sweep();
            }
        })
    }
}
