//! Evidence ledger: append-only record log plus a "latest" snapshot.
//!
//! One JSON line per stored record version, wrapped in a [`StoredRecord`]
//! envelope. Updating a record (closing a black-swan event, clearing a
//! blocking issue) appends a new version with the same id; replay folds
//! versions so the latest one wins.
//!
//! Appends go to the end of the log and are synced before returning. Each
//! envelope says how many entries of its batch still follow, so a batch cut
//! short by a crash is recognised and dropped when the ledger is reopened.
//! Compaction and snapshots write a temp file that is fsynced and renamed
//! over the target.

use chrono::{DateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::marker::PhantomData;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use tracing::{debug, info, warn};

use super::record::{timestamp, LedgerRecord};
use crate::error::StorageError;

/// Envelope around every stored record version
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredRecord<R> {
    pub seq: u64,
    /// Record type tag
    pub family: String,
    pub record_id: String,
    #[serde(with = "timestamp")]
    pub stored_at: DateTime<Utc>,
    /// Entries of the same batch still to follow; the last one carries 0
    #[serde(default)]
    pub batch_remaining: u32,
    pub record: R,
}

/// Storage contract shared by every escalation component.
///
/// Any transactional store can stand in for the file ledger as long as it
/// keeps `append_batch` all-or-nothing and preserves the open-record
/// convention (`recovered_at`/`cleared_at` null means active).
pub trait EvidenceStore<R: LedgerRecord>: Send + Sync {
    /// Persist `records` atomically, in order.
    fn append_batch(&self, records: &[R]) -> Result<(), StorageError>;

    /// Every stored version, hash-verified, in write order.
    fn history(&self) -> Result<Vec<StoredRecord<R>>, StorageError>;

    /// Overwrite the secondary "latest state" view.
    fn snapshot(&self, state: &serde_json::Value) -> Result<(), StorageError>;

    fn read_snapshot(&self) -> Result<Option<serde_json::Value>, StorageError>;

    fn append(&self, record: &R) -> Result<(), StorageError> {
        self.append_batch(std::slice::from_ref(record))
    }

    /// Current view of every record: latest version per id, ordered by first
    /// appearance.
    fn load_all(&self) -> Result<Vec<R>, StorageError> {
        Ok(fold_latest(self.history()?))
    }
}

/// Collapse record versions to the latest one per id.
pub fn fold_latest<R: LedgerRecord>(entries: Vec<StoredRecord<R>>) -> Vec<R> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut folded: Vec<R> = Vec::new();
    for entry in entries {
        match index.get(&entry.record_id) {
            Some(&i) => folded[i] = entry.record,
            None => {
                index.insert(entry.record_id.clone(), folded.len());
                folded.push(entry.record);
            }
        }
    }
    folded
}

/// Seal a copy of each record and wrap it in an envelope.
pub(crate) fn envelope<R: LedgerRecord>(
    records: &[R],
    first_seq: u64,
) -> Result<Vec<StoredRecord<R>>, StorageError> {
    let stored_at = Utc::now().trunc_subsecs(6);
    records
        .iter()
        .enumerate()
        .map(|(i, record)| {
            let mut sealed = record.clone();
            sealed.seal()?;
            Ok(StoredRecord {
                seq: first_seq + i as u64,
                family: R::FAMILY.to_string(),
                record_id: sealed.record_id().to_string(),
                stored_at,
                batch_remaining: (records.len() - 1 - i) as u32,
                record: sealed,
            })
        })
        .collect()
}

/// Reject entries whose family, id or hash does not match their content.
pub(crate) fn check_entry<R: LedgerRecord>(
    line: usize,
    entry: &StoredRecord<R>,
) -> Result<(), StorageError> {
    if entry.family != R::FAMILY {
        return Err(StorageError::FamilyMismatch {
            line,
            expected: R::FAMILY.to_string(),
            found: entry.family.clone(),
        });
    }
    if entry.record_id != entry.record.record_id() {
        return Err(StorageError::Corrupt {
            line,
            reason: format!(
                "envelope id {} does not match record id {}",
                entry.record_id,
                entry.record.record_id()
            ),
        });
    }
    if !entry.record.verify() {
        return Err(StorageError::Tampered {
            seq: entry.seq,
            record_id: entry.record_id.clone(),
        });
    }
    Ok(())
}

/// Result of a non-failing integrity scan
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct IntegrityReport {
    pub family: String,
    pub versions: usize,
    pub records: usize,
    pub open_records: usize,
    pub problems: Vec<String>,
}

impl IntegrityReport {
    pub fn healthy(&self) -> bool {
        self.problems.is_empty()
    }
}

impl std::fmt::Display for IntegrityReport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let status = if self.healthy() { "OK" } else { "FAIL" };
        writeln!(
            f,
            "[{:>4}] {}: {} records, {} versions, {} open",
            status, self.family, self.records, self.versions, self.open_records
        )?;
        for problem in &self.problems {
            writeln!(f, "       - {}", problem)?;
        }
        Ok(())
    }
}

/// File-backed evidence ledger for one record family
pub struct EvidenceLedger<R> {
    log_path: PathBuf,
    snapshot_path: PathBuf,
    /// Next sequence number; the lock also serializes writers
    next_seq: Mutex<u64>,
    _record: PhantomData<fn() -> R>,
}

impl<R: LedgerRecord> EvidenceLedger<R> {
    /// Open (or create) the ledger for `R::FAMILY` under `dir`.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, StorageError> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir).map_err(|e| StorageError::io(dir, e))?;

        let log_path = dir.join(format!("{}.jsonl", R::FAMILY));
        let snapshot_path = dir.join(format!("{}.latest.json", R::FAMILY));

        let body = read_log(&log_path)?;
        let committed = committed_len(&body);
        if committed < body.len() {
            warn!(
                "Dropping {} bytes of unfinished batch at the end of {}",
                body.len() - committed,
                log_path.display()
            );
            truncate_log(&log_path, committed as u64)?;
        }

        // Lenient scan: a damaged log must still open so it can be verified.
        let next_seq = body[..committed]
            .lines()
            .filter_map(|line| serde_json::from_str::<serde_json::Value>(line).ok())
            .filter_map(|v| v.get("seq").and_then(|s| s.as_u64()))
            .max()
            .map(|seq| seq + 1)
            .unwrap_or(0);

        debug!(
            "Opened evidence ledger {} (next seq {})",
            log_path.display(),
            next_seq
        );

        Ok(Self {
            log_path,
            snapshot_path,
            next_seq: Mutex::new(next_seq),
            _record: PhantomData,
        })
    }

    pub fn log_path(&self) -> &Path {
        &self.log_path
    }

    pub fn snapshot_path(&self) -> &Path {
        &self.snapshot_path
    }

    fn read_entries(&self) -> Result<Vec<StoredRecord<R>>, StorageError> {
        let body = read_log(&self.log_path)?;
        let mut entries = Vec::new();
        for (i, line) in body[..committed_len(&body)].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            let entry: StoredRecord<R> =
                serde_json::from_str(line).map_err(|e| StorageError::Corrupt {
                    line: i + 1,
                    reason: e.to_string(),
                })?;
            check_entry(i + 1, &entry)?;
            entries.push(entry);
        }
        Ok(entries)
    }

    /// Rewrite the log as its folded view. Returns the number of superseded
    /// versions dropped.
    pub fn compact(&self) -> Result<usize, StorageError> {
        let mut next_seq = self.next_seq.lock().map_err(|_| StorageError::Poisoned)?;
        let entries = self.read_entries()?;
        let before = entries.len();

        let mut stored_at: HashMap<String, DateTime<Utc>> = HashMap::new();
        for entry in &entries {
            stored_at.entry(entry.record_id.clone()).or_insert(entry.stored_at);
        }

        let mut body = Vec::new();
        let folded = fold_latest(entries);
        for (seq, record) in folded.into_iter().enumerate() {
            let record_id = record.record_id().to_string();
            let entry = StoredRecord {
                seq: seq as u64,
                family: R::FAMILY.to_string(),
                stored_at: stored_at
                    .get(&record_id)
                    .copied()
                    .unwrap_or_else(|| Utc::now().trunc_subsecs(6)),
                batch_remaining: 0,
                record_id,
                record,
            };
            serde_json::to_writer(&mut body, &entry)?;
            body.push(b'\n');
            *next_seq = seq as u64 + 1;
        }
        if before == 0 {
            return Ok(0);
        }
        write_atomic(&self.log_path, &body)?;

        let dropped = before - *next_seq as usize;
        info!(
            "Compacted {}: dropped {} superseded versions",
            self.log_path.display(),
            dropped
        );
        Ok(dropped)
    }

    /// Scan the whole log and report every problem instead of stopping at the
    /// first one.
    pub fn verify(&self) -> Result<IntegrityReport, StorageError> {
        let body = read_log(&self.log_path)?;
        let mut problems = Vec::new();
        let mut good = Vec::new();
        for (i, line) in body[..committed_len(&body)].lines().enumerate() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<StoredRecord<R>>(line) {
                Ok(entry) => match check_entry(i + 1, &entry) {
                    Ok(()) => good.push(entry),
                    Err(e) => problems.push(e.to_string()),
                },
                Err(e) => problems.push(format!("line {}: {}", i + 1, e)),
            }
        }

        let versions = good.len();
        let folded = fold_latest(good);
        let report = IntegrityReport {
            family: R::FAMILY.to_string(),
            versions,
            records: folded.len(),
            open_records: folded.iter().filter(|r| r.is_open()).count(),
            problems,
        };
        if !report.healthy() {
            warn!(
                "Integrity problems in {}: {}",
                self.log_path.display(),
                report.problems.len()
            );
        }
        Ok(report)
    }
}

impl<R: LedgerRecord> EvidenceStore<R> for EvidenceLedger<R> {
    fn append_batch(&self, records: &[R]) -> Result<(), StorageError> {
        if records.is_empty() {
            return Ok(());
        }
        let mut next_seq = self.next_seq.lock().map_err(|_| StorageError::Poisoned)?;

        let entries = envelope(records, *next_seq)?;
        let mut body = Vec::new();
        for entry in &entries {
            serde_json::to_writer(&mut body, entry)?;
            body.push(b'\n');
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(|e| StorageError::io(&self.log_path, e))?;
        let committed = file
            .metadata()
            .map_err(|e| StorageError::io(&self.log_path, e))?
            .len();
        if let Err(e) = file.write_all(&body).and_then(|()| file.sync_data()) {
            // Cut the partial batch so the next append starts on a clean line
            if let Err(rollback) = file.set_len(committed) {
                warn!(
                    "Could not roll back partial append to {}: {}",
                    self.log_path.display(),
                    rollback
                );
            }
            return Err(StorageError::io(&self.log_path, e));
        }
        *next_seq += entries.len() as u64;

        debug!(
            "Appended {} {} record(s), last seq {}",
            entries.len(),
            R::FAMILY,
            *next_seq - 1
        );
        Ok(())
    }

    fn history(&self) -> Result<Vec<StoredRecord<R>>, StorageError> {
        let _guard = self.next_seq.lock().map_err(|_| StorageError::Poisoned)?;
        self.read_entries()
    }

    fn snapshot(&self, state: &serde_json::Value) -> Result<(), StorageError> {
        let body = serde_json::to_vec_pretty(state)?;
        write_atomic(&self.snapshot_path, &body)
    }

    fn read_snapshot(&self) -> Result<Option<serde_json::Value>, StorageError> {
        match fs::read_to_string(&self.snapshot_path) {
            Ok(s) => Ok(Some(serde_json::from_str(&s)?)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::io(&self.snapshot_path, e)),
        }
    }
}

fn read_log(path: &Path) -> Result<String, StorageError> {
    match fs::read_to_string(path) {
        Ok(s) => Ok(s),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(String::new()),
        Err(e) => Err(StorageError::io(path, e)),
    }
}

/// Byte length of the committed part of `body`.
///
/// An interrupted append leaves either an unterminated last line or complete
/// lines whose batch never reached its final entry. Both are cut.
fn committed_len(body: &str) -> usize {
    let mut end = body.rfind('\n').map_or(0, |i| i + 1);
    while end > 0 {
        let start = body[..end - 1].rfind('\n').map_or(0, |i| i + 1);
        let unfinished = serde_json::from_str::<serde_json::Value>(&body[start..end - 1])
            .ok()
            .and_then(|v| v.get("batch_remaining").and_then(|n| n.as_u64()))
            .is_some_and(|n| n > 0);
        if !unfinished {
            break;
        }
        end = start;
    }
    end
}

fn truncate_log(path: &Path, len: u64) -> Result<(), StorageError> {
    let file = OpenOptions::new()
        .write(true)
        .open(path)
        .map_err(|e| StorageError::io(path, e))?;
    file.set_len(len).map_err(|e| StorageError::io(path, e))?;
    file.sync_all().map_err(|e| StorageError::io(path, e))
}

/// Write `bytes` to a sibling temp file, fsync it, then rename over `path`.
fn write_atomic(path: &Path, bytes: &[u8]) -> Result<(), StorageError> {
    let Some(file_name) = path.file_name() else {
        return Err(StorageError::io(
            path,
            std::io::Error::new(ErrorKind::InvalidInput, "ledger path has no file name"),
        ));
    };
    let mut tmp_name = file_name.to_os_string();
    tmp_name.push(".tmp");
    let tmp = path.with_file_name(tmp_name);

    let mut file = File::create(&tmp).map_err(|e| StorageError::io(&tmp, e))?;
    file.write_all(bytes).map_err(|e| StorageError::io(&tmp, e))?;
    file.sync_all().map_err(|e| StorageError::io(&tmp, e))?;
    drop(file);
    fs::rename(&tmp, path).map_err(|e| StorageError::io(path, e))?;
    Ok(())
}
