//! Run-scoped data-quality ledger.
//!
//! Normalizers, fetch stages, the city loop and the reconciler append
//! [`QualityWarning`]s; the whole collection is written once at the end of the
//! run, replacing the previous report. An empty ledger still writes `[]`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;
use std::sync::Mutex;
use tracing::info;

use crate::storage::write_atomically;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord)]
#[serde(rename_all = "UPPERCASE")]
pub enum Level {
    Info,
    Warning,
    Error,
    Critical,
}

/// One anomaly. `file` identifies the source (provider, city and window).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct QualityWarning {
    pub file: String,
    pub check: String,
    pub level: Level,
    pub message: String,
    pub details: Value,
}

impl QualityWarning {
    pub fn new(
        file: impl Into<String>,
        check: impl Into<String>,
        level: Level,
        message: impl Into<String>,
        details: Value,
    ) -> Self {
        Self {
            file: file.into(),
            check: check.into(),
            level,
            message: message.into(),
            details,
        }
    }
}

#[derive(Debug, Default)]
pub struct QualityLedger {
    entries: Mutex<Vec<QualityWarning>>,
}

impl QualityLedger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&self, warning: QualityWarning) {
        self.lock().push(warning);
    }

    pub fn extend(&self, warnings: impl IntoIterator<Item = QualityWarning>) {
        self.lock().extend(warnings);
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Vec<QualityWarning> {
        self.lock().clone()
    }

    pub fn count_at_least(&self, level: Level) -> usize {
        self.lock().iter().filter(|w| w.level >= level).count()
    }

    /// Overwrite `path` with the full ledger as a pretty-printed JSON array.
    pub fn write_report(&self, path: &Path) -> Result<()> {
        let entries = self.snapshot();
        if entries.is_empty() {
            info!("No data quality issues found. Writing an empty report to {:?}", path);
        } else {
            info!("Saving {} data quality entries to {:?}", entries.len(), path);
        }

        let json = serde_json::to_vec_pretty(&entries).context("Failed to serialize quality report")?;
        write_atomically(path, &json).with_context(|| format!("Failed to write report {:?}", path))
    }

    // A panic while holding the lock leaves a valid Vec behind.
    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<QualityWarning>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}
