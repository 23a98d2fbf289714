//! In-process evidence store.
//!
//! Same contract as the file ledger without durability. The write-fault
//! switch lets drills exercise the fail-closed paths of every monitor.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use tracing::warn;

use super::ledger::{check_entry, envelope, EvidenceStore, StoredRecord};
use super::record::LedgerRecord;
use crate::error::StorageError;

struct MemoryState<R> {
    entries: Vec<StoredRecord<R>>,
    snapshot: Option<serde_json::Value>,
}

pub struct MemoryLedger<R> {
    state: Mutex<MemoryState<R>>,
    fail_writes: AtomicBool,
}

impl<R: LedgerRecord> Default for MemoryLedger<R> {
    fn default() -> Self {
        Self::new()
    }
}

impl<R: LedgerRecord> MemoryLedger<R> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(MemoryState {
                entries: Vec::new(),
                snapshot: None,
            }),
            fail_writes: AtomicBool::new(false),
        }
    }

    /// Reject every subsequent write until switched back off.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn len(&self) -> usize {
        self.state.lock().map(|s| s.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn check_writable(&self) -> Result<(), StorageError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            warn!("Rejecting {} write: fault injection active", R::FAMILY);
            return Err(StorageError::FaultInjected(format!(
                "{} ledger is refusing writes",
                R::FAMILY
            )));
        }
        Ok(())
    }
}

impl<R: LedgerRecord> EvidenceStore<R> for MemoryLedger<R> {
    fn append_batch(&self, records: &[R]) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        let entries = envelope(records, state.entries.len() as u64)?;
        state.entries.extend(entries);
        Ok(())
    }

    fn history(&self) -> Result<Vec<StoredRecord<R>>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        for (i, entry) in state.entries.iter().enumerate() {
            check_entry(i + 1, entry)?;
        }
        Ok(state.entries.clone())
    }

    fn snapshot(&self, value: &serde_json::Value) -> Result<(), StorageError> {
        self.check_writable()?;
        let mut state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        state.snapshot = Some(value.clone());
        Ok(())
    }

    fn read_snapshot(&self) -> Result<Option<serde_json::Value>, StorageError> {
        let state = self.state.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(state.snapshot.clone())
    }
}
