//! BLAKE3 content hashing for tamper evidence.

use chrono::{DateTime, Utc};
use netguard_core::{ScanSummary, StateTransition};
use serde::Serialize;

use crate::{JournalEntry, JournalId, ProbeOutcome};

/// Hashable view of an entry (excludes `content_hash`).
#[derive(Serialize)]
struct HashableEntry<'a> {
    id: &'a JournalId,
    scope: &'a str,
    probes: &'a [ProbeOutcome],
    decisions: &'a [StateTransition],
    summary: &'a Option<ScanSummary>,
    failure: &'a Option<String>,
    started_at: &'a DateTime<Utc>,
    completed_at: &'a Option<DateTime<Utc>>,
}

/// Serialize the entry without its hash to JSON and hash the bytes.
/// Returns the hex digest.
pub fn compute_entry_hash(entry: &JournalEntry) -> Result<String, serde_json::Error> {
    let hashable = HashableEntry {
        id: &entry.id,
        scope: &entry.scope,
        probes: &entry.probes,
        decisions: &entry.decisions,
        summary: &entry.summary,
        failure: &entry.failure,
        started_at: &entry.started_at,
        completed_at: &entry.completed_at,
    };

    let json = serde_json::to_vec(&hashable)?;
    Ok(blake3::hash(&json).to_hex().to_string())
}

#[cfg(test)]
mod tests {
    use crate::JournalSession;
    use uuid::Uuid;

    #[test]
    fn hash_ignores_stored_hash_but_covers_content() {
        let mut session = JournalSession::new(Uuid::new_v4(), "192.168.0.0/24");
        session.record_failure("scope undetermined");
        let entry = session.finalize().unwrap();

        let mut rehashed = entry.clone();
        rehashed.content_hash = Some("bogus".to_string());
        assert_eq!(rehashed.compute_hash().unwrap(), entry.compute_hash().unwrap());

        let mut edited = entry.clone();
        edited.scope = "10.0.0.0/8".to_string();
        assert_ne!(edited.compute_hash().unwrap(), entry.compute_hash().unwrap());
    }
}
