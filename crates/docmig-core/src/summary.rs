use std::fmt;
use std::ops::AddAssign;

use serde::{Deserialize, Serialize};

use crate::value::Value;
use crate::RecordId;

/// Two sources disagreed on a populated field; `kept` won by precedence.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldConflict {
    pub record_id: RecordId,
    pub field: String,
    pub kept: Value,
    pub discarded: Value,
}

impl fmt::Display for FieldConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}: {} kept {}, discarded {}",
            self.record_id, self.field, self.kept, self.discarded
        )
    }
}

/// Structured result of one run, returned alongside the human-readable summary.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunSummary {
    pub inserted: usize,
    pub patched: usize,
    pub deleted: usize,
    pub skipped_errors: usize,
    pub unresolved: usize,
    pub conflicts: usize,
    pub ambiguous: usize,
}

impl RunSummary {
    pub fn is_clean(&self) -> bool {
        self.skipped_errors == 0
    }

    /// Records the store acknowledged writing.
    pub fn writes(&self) -> usize {
        self.inserted + self.patched + self.deleted
    }
}

impl AddAssign for RunSummary {
    fn add_assign(&mut self, rhs: Self) {
        self.inserted += rhs.inserted;
        self.patched += rhs.patched;
        self.deleted += rhs.deleted;
        self.skipped_errors += rhs.skipped_errors;
        self.unresolved += rhs.unresolved;
        self.conflicts += rhs.conflicts;
        self.ambiguous += rhs.ambiguous;
    }
}

impl fmt::Display for RunSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "inserted={} patched={} deleted={} skipped={} unresolved={} conflicts={} ambiguous={}",
            self.inserted,
            self.patched,
            self.deleted,
            self.skipped_errors,
            self.unresolved,
            self.conflicts,
            self.ambiguous
        )
    }
}
