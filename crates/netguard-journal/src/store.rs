//! Where journal entries live.

use std::fs;
use std::path::{Path, PathBuf};

use crate::{JournalEntry, JournalId, JournalListing};

#[derive(Debug, thiserror::Error)]
pub enum JournalError {
    #[error("Journal entry not found: {0}")]
    NotFound(JournalId),

    #[error("Integrity check failed for journal entry {0}: stored hash does not match content")]
    IntegrityViolation(JournalId),

    #[error("Journal entry has no content hash (not finalized)")]
    NotFinalized,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, JournalError>;

/// Filters for listing entries.
#[derive(Debug, Default)]
pub struct JournalQuery {
    /// Only entries for this scope.
    pub scope: Option<String>,
    /// Only cycles that ended in an error.
    pub failed_only: bool,
    pub limit: Option<usize>,
}

impl JournalQuery {
    fn admits(&self, entry: &JournalEntry) -> bool {
        let scope_ok = self.scope.as_ref().map_or(true, |s| *s == entry.scope);
        scope_ok && !(self.failed_only && entry.succeeded())
    }
}

pub trait JournalStore {
    /// Store a finalized entry.
    fn save(&self, entry: &JournalEntry) -> Result<()>;

    /// Read an entry back. Fails on a hash mismatch.
    fn get(&self, id: JournalId) -> Result<JournalEntry>;

    /// Entries matching `query`, newest first, each with its integrity
    /// verdict. Tampered entries are listed, not dropped.
    fn list(&self, query: &JournalQuery) -> Result<Vec<JournalListing>>;
}

/// One file per entry, grouped by the day its cycle started:
/// `{root}/YYYY/MM/DD/{scan_id}.json`.
pub struct FileJournalStore {
    root: PathBuf,
}

impl FileJournalStore {
    /// Creates `root` if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(Self { root })
    }

    fn entry_path(&self, entry: &JournalEntry) -> PathBuf {
        self.root
            .join(entry.started_at.format("%Y/%m/%d").to_string())
            .join(file_name(entry.id))
    }

    /// Every `.json` file three directory levels below the root.
    fn entry_files(&self) -> Result<Vec<PathBuf>> {
        let mut level = vec![self.root.clone()];
        for _ in 0..3 {
            let mut next = Vec::new();
            for dir in &level {
                next.extend(subdirs(dir)?);
            }
            level = next;
        }

        let mut files = Vec::new();
        for day in level {
            for item in fs::read_dir(&day)?.flatten() {
                let path = item.path();
                if path.is_file() && path.extension().is_some_and(|e| e == "json") {
                    files.push(path);
                }
            }
        }
        Ok(files)
    }
}

impl JournalStore for FileJournalStore {
    fn save(&self, entry: &JournalEntry) -> Result<()> {
        if entry.content_hash.is_none() {
            return Err(JournalError::NotFinalized);
        }

        let path = self.entry_path(entry);
        if let Some(day) = path.parent() {
            fs::create_dir_all(day)?;
        }
        fs::write(&path, serde_json::to_vec_pretty(entry)?)?;

        tracing::debug!(journal_id = %entry.id, path = %path.display(), "Journal entry saved");
        Ok(())
    }

    fn get(&self, id: JournalId) -> Result<JournalEntry> {
        let wanted = file_name(id);
        let path = self
            .entry_files()?
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == wanted.as_str()))
            .ok_or(JournalError::NotFound(id))?;

        let entry = read_entry(&path)?;
        if entry.verify_integrity() {
            Ok(entry)
        } else {
            Err(JournalError::IntegrityViolation(id))
        }
    }

    fn list(&self, query: &JournalQuery) -> Result<Vec<JournalListing>> {
        let mut listings = Vec::new();
        for path in self.entry_files()? {
            let entry = match read_entry(&path) {
                Ok(entry) => entry,
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "Unreadable journal entry");
                    continue;
                }
            };
            if !query.admits(&entry) {
                continue;
            }
            let intact = entry.verify_integrity();
            if !intact {
                tracing::warn!(journal_id = %entry.id, "Journal entry fails integrity check");
            }
            listings.push(JournalListing { entry, intact });
        }

        listings.sort_by(|a, b| b.entry.started_at.cmp(&a.entry.started_at));
        if let Some(limit) = query.limit {
            listings.truncate(limit);
        }
        Ok(listings)
    }
}

fn file_name(id: JournalId) -> String {
    format!("{}.json", id.0)
}

fn subdirs(dir: &Path) -> Result<Vec<PathBuf>> {
    Ok(fs::read_dir(dir)?
        .flatten()
        .map(|item| item.path())
        .filter(|path| path.is_dir())
        .collect())
}

fn read_entry(path: &Path) -> Result<JournalEntry> {
    Ok(serde_json::from_slice(&fs::read(path)?)?)
}
