//! Signal marker files
//!
//! A signal is pending iff its marker file exists. Content is optional
//! payload; existence is the source of truth. Reading never consumes;
//! consumption is an explicit `take` or `clear`.

use std::fs;
use std::io::Write;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::error::{Result, StoreError};
use crate::store::Store;

/// The four control signal kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SignalKind {
    /// Stop the loop run (id = run hex)
    Stop,
    /// Suspend after the current turn until owned spawns settle (id = turn id)
    Wait,
    /// Truncate the remaining turns of the current step (id = turn id)
    Interrupt,
    /// Fast-forward the run to its supervisor step (id = run hex)
    CallSupervisor,
}

impl SignalKind {
    pub const ALL: &'static [SignalKind] = &[Self::Stop, Self::Wait, Self::Interrupt, Self::CallSupervisor];

    /// Directory name under `<root>/signals/`
    pub fn dir_name(self) -> &'static str {
        match self {
            Self::Stop => "stop",
            Self::Wait => "wait",
            Self::Interrupt => "interrupt",
            Self::CallSupervisor => "call-supervisor",
        }
    }
}

impl Store {
    /// Raise a signal; `Conflict` if it is already pending
    ///
    /// Exclusive-create semantics make raise safe across processes.
    pub fn raise_signal(&self, kind: SignalKind, id: &str, payload: Option<&str>) -> Result<()> {
        debug!(?kind, id, "raise_signal: called");
        let path = self.signal_dir(kind).join(id);
        let mut file = match fs::OpenOptions::new().write(true).create_new(true).open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                return Err(StoreError::Conflict(format!(
                    "{} signal already pending for {}",
                    kind.dir_name(),
                    id
                )));
            }
            Err(e) => return Err(StoreError::io(format!("raising {} signal", kind.dir_name()), e)),
        };
        if let Some(payload) = payload {
            file.write_all(payload.as_bytes())
                .map_err(|e| StoreError::io(format!("writing {} signal payload", kind.dir_name()), e))?;
        }
        Ok(())
    }

    /// True iff the signal is pending
    pub fn signal_set(&self, kind: SignalKind, id: &str) -> bool {
        self.signal_dir(kind).join(id).exists()
    }

    /// Consume a pending signal, returning its payload
    ///
    /// Returns `Ok(None)` when the signal was not pending; the remove is the
    /// atomic consumption point, so concurrent takers see it at most once.
    pub fn take_signal(&self, kind: SignalKind, id: &str) -> Result<Option<String>> {
        let path = self.signal_dir(kind).join(id);
        let payload = match fs::read_to_string(&path) {
            Ok(p) => p,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(StoreError::io(format!("reading {} signal", kind.dir_name()), e)),
        };
        match fs::remove_file(&path) {
            Ok(()) => {
                debug!(?kind, id, "take_signal: consumed");
                Ok(Some(payload))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StoreError::io(format!("consuming {} signal", kind.dir_name()), e)),
        }
    }

    /// Remove a signal without reading it; absent is fine
    pub fn clear_signal(&self, kind: SignalKind, id: &str) -> Result<()> {
        let path = self.signal_dir(kind).join(id);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(StoreError::io(format!("clearing {} signal", kind.dir_name()), e)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (TempDir, Store) {
        let temp = TempDir::new().unwrap();
        let store = Store::open(temp.path().join(".adaf")).unwrap();
        (temp, store)
    }

    #[test]
    fn test_raise_then_take() {
        let (_t, store) = store();

        assert!(!store.signal_set(SignalKind::Stop, "ab12cd34"));
        store.raise_signal(SignalKind::Stop, "ab12cd34", None).unwrap();
        assert!(store.signal_set(SignalKind::Stop, "ab12cd34"));

        let payload = store.take_signal(SignalKind::Stop, "ab12cd34").unwrap();
        assert_eq!(payload, Some(String::new()));
        assert!(!store.signal_set(SignalKind::Stop, "ab12cd34"));
    }

    #[test]
    fn test_double_raise_is_conflict() {
        let (_t, store) = store();
        store.raise_signal(SignalKind::Wait, "7", None).unwrap();
        let err = store.raise_signal(SignalKind::Wait, "7", None).unwrap_err();
        assert!(err.is_conflict());
    }

    #[test]
    fn test_payload_round_trip() {
        let (_t, store) = store();
        store
            .raise_signal(SignalKind::Interrupt, "3", Some("after current turn"))
            .unwrap();
        assert_eq!(
            store.take_signal(SignalKind::Interrupt, "3").unwrap(),
            Some("after current turn".to_string())
        );
    }

    #[test]
    fn test_reading_does_not_consume() {
        let (_t, store) = store();
        store.raise_signal(SignalKind::CallSupervisor, "beef0001", None).unwrap();
        assert!(store.signal_set(SignalKind::CallSupervisor, "beef0001"));
        assert!(store.signal_set(SignalKind::CallSupervisor, "beef0001"));
        store.clear_signal(SignalKind::CallSupervisor, "beef0001").unwrap();
        assert!(!store.signal_set(SignalKind::CallSupervisor, "beef0001"));
    }

    #[test]
    fn test_take_absent_is_none() {
        let (_t, store) = store();
        assert_eq!(store.take_signal(SignalKind::Stop, "nope").unwrap(), None);
        store.clear_signal(SignalKind::Stop, "nope").unwrap();
    }
}
