//! Persistence Layer for Tamper-Evident Evidence
//!
//! This module provides the storage every escalation component writes through:
//! - Record contract with content hashing and fixed timestamp format
//! - File-backed append-only ledger with atomic writes, snapshot and compaction
//! - In-memory ledger with write-fault injection for fail-closed drills

pub mod ledger;
pub mod memory;
pub mod record;

pub use ledger::{fold_latest, EvidenceLedger, EvidenceStore, IntegrityReport, StoredRecord};
pub use memory::MemoryLedger;
pub use record::{content_hash, timestamp, LedgerRecord};
