//! NetGuard Journal: tamper-evident record of scan cycles.
//!
//! Every cycle the engine runs can leave a journal entry: the scope it
//! scanned, how each probe fared, every lifecycle change the classifier
//! made and the final summary (or the failure that ended the cycle).
//! Each entry is content-hashed with BLAKE3 so later edits are detectable.

pub mod hash;
pub mod session;
pub mod store;

use std::path::PathBuf;
use std::time::Duration;

use chrono::{DateTime, Utc};
use netguard_core::{DiscoveryProtocol, ProbeWarning, ScanSummary, StateTransition};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

pub use session::JournalSession;
pub use store::{FileJournalStore, JournalError, JournalQuery, JournalStore, Result};

// ── Core Types ───────────────────────────────────────────────────

/// Identifier of a journal entry. Equal to the scan id of its cycle.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct JournalId(pub Uuid);

impl std::fmt::Display for JournalId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// How one probe fared during a cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ProbeOutcome {
    pub protocol: DiscoveryProtocol,
    /// Records the probe contributed to fusion.
    pub records: usize,
    pub elapsed_ms: u64,
    pub warning: Option<ProbeWarning>,
}

/// The journal entry of one scan cycle.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JournalEntry {
    pub id: JournalId,
    /// Scanned network, or the requested override if resolution failed.
    pub scope: String,
    pub probes: Vec<ProbeOutcome>,
    /// Lifecycle changes made by the classifier this cycle.
    pub decisions: Vec<StateTransition>,
    pub summary: Option<ScanSummary>,
    /// Set when the cycle ended in an error.
    pub failure: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    /// BLAKE3 content hash (hex), set on finalization.
    pub content_hash: Option<String>,
}

impl JournalEntry {
    /// BLAKE3 hash of every field except `content_hash`.
    pub fn compute_hash(&self) -> std::result::Result<String, serde_json::Error> {
        hash::compute_entry_hash(self)
    }

    /// True when the stored hash matches the entry's content.
    pub fn verify_integrity(&self) -> bool {
        match (&self.content_hash, self.compute_hash()) {
            (Some(stored), Ok(fresh)) => stored == &fresh,
            _ => false,
        }
    }

    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }
}

/// An entry as listed, with the outcome of its integrity check.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct JournalListing {
    #[serde(flatten)]
    pub entry: JournalEntry,
    /// False when the content no longer matches the stored hash.
    pub intact: bool,
}

// ── Journal facade ───────────────────────────────────────────────

/// Opens sessions and stores their entries.
///
/// Recording is best effort: a failed write is logged and never reported
/// to the caller, so the journal cannot fail a scan cycle.
pub struct CycleJournal {
    store: Box<dyn JournalStore + Send + Sync>,
}

impl CycleJournal {
    pub fn new(store: impl JournalStore + Send + Sync + 'static) -> Self {
        Self {
            store: Box::new(store),
        }
    }

    /// Journal backed by a [`FileJournalStore`] rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self::new(FileJournalStore::new(root)?))
    }

    /// Start recording the cycle identified by `scan_id`.
    pub fn begin(&self, scan_id: Uuid, scope: &str) -> JournalSession {
        JournalSession::new(scan_id, scope)
    }

    /// Finalize `session` and store it, returning the sealed entry.
    pub fn commit(&self, session: JournalSession) -> Option<JournalEntry> {
        let entry = match session.finalize() {
            Ok(entry) => entry,
            Err(e) => {
                tracing::warn!(error = %e, "Failed to seal journal entry");
                return None;
            }
        };

        match self.store.save(&entry) {
            Ok(()) => {
                tracing::info!(journal_id = %entry.id, "Cycle journaled");
            }
            Err(e) => {
                tracing::warn!(journal_id = %entry.id, error = %e, "Failed to store journal entry");
            }
        }
        Some(entry)
    }

    pub fn get(&self, id: JournalId) -> Result<JournalEntry> {
        self.store.get(id)
    }

    pub fn list(&self, query: &JournalQuery) -> Result<Vec<JournalListing>> {
        self.store.list(query)
    }
}

pub(crate) fn millis(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use netguard_core::WarningKind;

    #[test]
    fn commit_stores_entry_that_can_be_read_back() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CycleJournal::open(dir.path()).unwrap();

        let mut session = journal.begin(Uuid::new_v4(), "10.0.0.0/24");
        session.record_probe(
            DiscoveryProtocol::Ssdp,
            0,
            Duration::from_millis(3000),
            Some(ProbeWarning {
                protocol: DiscoveryProtocol::Ssdp,
                kind: WarningKind::DeadlineExceeded,
                message: "cycle deadline reached".to_string(),
            }),
        );
        let id = session.id();

        let entry = journal.commit(session).unwrap();
        assert!(entry.verify_integrity());

        let read = journal.get(id).unwrap();
        assert_eq!(read, entry);
        assert_eq!(read.probes[0].elapsed_ms, 3000);
    }

    #[test]
    fn commit_survives_unwritable_store() {
        let dir = tempfile::tempdir().unwrap();
        let journal = CycleJournal::open(dir.path()).unwrap();
        // A file where the date directory should go makes every save fail.
        let today = Utc::now().format("%Y").to_string();
        std::fs::write(dir.path().join(today), b"not a directory").unwrap();

        let session = journal.begin(Uuid::new_v4(), "10.0.0.0/24");
        let entry = journal.commit(session);
        assert!(entry.is_some());
    }
}
