//! Incremental recorder for one cycle's journal entry.
//!
//! ```no_run
//! # use netguard_journal::JournalSession;
//! # use netguard_core::DiscoveryProtocol;
//! # use std::time::Duration;
//! # use uuid::Uuid;
//! let mut session = JournalSession::new(Uuid::new_v4(), "192.168.1.0/24");
//! session.record_probe(DiscoveryProtocol::Arp, 12, Duration::from_millis(2100), None);
//! let entry = session.finalize().unwrap();
//! assert!(entry.verify_integrity());
//! ```

use std::time::Duration;

use chrono::Utc;
use netguard_core::{DiscoveryProtocol, ProbeWarning, ScanSummary, StateTransition};
use uuid::Uuid;

use crate::{millis, JournalEntry, JournalId, ProbeOutcome};

pub struct JournalSession {
    entry: JournalEntry,
}

impl JournalSession {
    pub fn new(scan_id: Uuid, scope: &str) -> Self {
        Self {
            entry: JournalEntry {
                id: JournalId(scan_id),
                scope: scope.to_string(),
                probes: Vec::new(),
                decisions: Vec::new(),
                summary: None,
                failure: None,
                started_at: Utc::now(),
                completed_at: None,
                content_hash: None,
            },
        }
    }

    /// Replace the scope once it has been resolved.
    pub fn set_scope(&mut self, scope: &str) {
        self.entry.scope = scope.to_string();
    }

    pub fn record_probe(
        &mut self,
        protocol: DiscoveryProtocol,
        records: usize,
        elapsed: Duration,
        warning: Option<ProbeWarning>,
    ) {
        self.entry.probes.push(ProbeOutcome {
            protocol,
            records,
            elapsed_ms: millis(elapsed),
            warning,
        });
    }

    pub fn record_decision(&mut self, transition: &StateTransition) {
        self.entry.decisions.push(transition.clone());
    }

    pub fn record_summary(&mut self, summary: &ScanSummary) {
        self.entry.summary = Some(summary.clone());
    }

    pub fn record_failure(&mut self, error: &str) {
        self.entry.failure = Some(error.to_string());
    }

    pub fn id(&self) -> JournalId {
        self.entry.id
    }

    /// Stamp completion and seal the entry with its content hash.
    pub fn finalize(mut self) -> Result<JournalEntry, serde_json::Error> {
        self.entry.completed_at = Some(Utc::now());
        let hash = self.entry.compute_hash()?;
        self.entry.content_hash = Some(hash);
        Ok(self.entry)
    }
}
