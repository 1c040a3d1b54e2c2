//! Journal helpers for scan cycles.

use std::sync::Arc;

use netguard_journal::{CycleJournal, JournalEntry, JournalSession};
use uuid::Uuid;

use crate::engine::ScanOutcome;
use crate::probe::ProbeReport;

/// Scope label used until the real scope is resolved.
const UNRESOLVED_SCOPE: &str = "auto";

/// Open a journal session for a cycle.
pub fn start_cycle_session(journal: &CycleJournal, scan_id: Uuid, requested: Option<&str>) -> JournalSession {
    journal.begin(scan_id, requested.unwrap_or(UNRESOLVED_SCOPE))
}

/// Record how each probe fared.
pub fn record_probe_reports(session: &mut JournalSession, reports: &[ProbeReport]) {
    for report in reports {
        session.record_probe(
            report.protocol,
            report.records.len(),
            report.elapsed,
            report.warning.clone(),
        );
    }
}

/// Record the classifier's decisions and the summary of a committed cycle.
pub fn record_cycle_results(session: &mut JournalSession, outcome: &ScanOutcome) {
    for transition in &outcome.transitions {
        session.record_decision(transition);
    }
    session.record_summary(&outcome.summary);
}

/// Record the error that ended a cycle.
pub fn record_cycle_error(session: &mut JournalSession, error: &str) {
    session.record_failure(error);
}

/// Journal session of a cycle awaiting commit.
///
/// Dropped without [`PendingJournal::finish`], the session is stored as a
/// discarded cycle.
pub(crate) struct PendingJournal {
    journal: Arc<CycleJournal>,
    session: Option<JournalSession>,
}

impl PendingJournal {
    pub fn new(journal: Arc<CycleJournal>, session: JournalSession) -> Self {
        Self {
            journal,
            session: Some(session),
        }
    }

    /// Seal and store the session after `record` has filled it in.
    pub fn finish(mut self, record: impl FnOnce(&mut JournalSession)) -> Option<JournalEntry> {
        let mut session = self.session.take()?;
        record(&mut session);
        self.journal.commit(session)
    }
}

impl Drop for PendingJournal {
    fn drop(&mut self) {
        if let Some(mut session) = self.session.take() {
            record_cycle_error(&mut session, "cycle discarded before commit");
            self.journal.commit(session);
        }
    }
}
