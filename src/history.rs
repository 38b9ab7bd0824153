//! Session history of completed analyses.
//!
//! Records live in memory for the lifetime of the process only; nothing is
//! written to disk unless a caller explicitly exports it.

use crate::model::HistoryRecord;
use anyhow::{Context, Result};
use std::collections::VecDeque;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

/// Append-only, newest-first list of history records.
///
/// Cloning the store shares the same underlying list.
#[derive(Debug, Clone, Default)]
pub struct HistoryStore {
    records: Arc<RwLock<VecDeque<Arc<HistoryRecord>>>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn append(&self, record: HistoryRecord) {
        let mut records = self
            .records
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        records.push_front(Arc::new(record));
    }

    /// Snapshot of all records, newest first.
    pub fn list(&self) -> Vec<Arc<HistoryRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().cloned().collect()
    }

    pub fn get(&self, id: &str) -> Option<Arc<HistoryRecord>> {
        let records = self.records.read().unwrap_or_else(PoisonError::into_inner);
        records.iter().find(|r| r.id == id).cloned()
    }

    pub fn len(&self) -> usize {
        self.records
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Write records as a pretty JSON array.
pub fn export_json(path: &Path, records: &[Arc<HistoryRecord>]) -> Result<()> {
    let records: Vec<&HistoryRecord> = records.iter().map(|r| r.as_ref()).collect();
    let out = serde_json::to_string_pretty(&records).context("serialize history records")?;
    std::fs::write(path, out).with_context(|| format!("write {}", path.display()))?;
    Ok(())
}
