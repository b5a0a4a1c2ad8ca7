//! Recorder: persists one turn's event stream as it happens
//!
//! Persistence failures are logged and swallowed: a broken disk must never
//! interrupt a running agent.

use adafstore::{RecordedEventKind, Store};
use tracing::warn;

/// Append-only recorder for a single turn
#[derive(Debug, Clone)]
pub struct Recorder {
    store: Store,
    turn_id: u64,
}

impl Recorder {
    pub fn new(store: Store, turn_id: u64) -> Self {
        Self { store, turn_id }
    }

    pub fn turn_id(&self) -> u64 {
        self.turn_id
    }

    pub fn record_stdout(&self, chunk: &str) {
        self.record(RecordedEventKind::Stdout, chunk);
    }

    pub fn record_stderr(&self, chunk: &str) {
        self.record(RecordedEventKind::Stderr, chunk);
    }

    pub fn record_stdin(&self, chunk: &str) {
        self.record(RecordedEventKind::Stdin, chunk);
    }

    pub fn record_meta(&self, note: &str) {
        self.record(RecordedEventKind::Meta, note);
    }

    pub fn record_agent_stream(&self, line: &str) {
        self.record(RecordedEventKind::AgentStream, line);
    }

    fn record(&self, kind: RecordedEventKind, data: &str) {
        if let Err(e) = self.store.append_event(self.turn_id, kind, data) {
            warn!(turn_id = self.turn_id, ?kind, error = %e, "recording event failed; continuing");
        }
    }
}
