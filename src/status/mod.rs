//! Per-entity, per-day status: grouping runs and classifying each group.

pub mod aggregate;
pub mod report;

use serde::{Deserialize, Serialize};

use crate::history::Run;

pub use self::aggregate::{aggregate, RunGroup, StatusMap};
pub use self::report::{Report, ReportBuilder};

/// Health of one entity on one day.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Classification {
    /// No runs.
    Empty,
    /// Runs present, none failed.
    Good,
    /// Runs present, all failed.
    Bad,
    /// Both failed and non-failed runs.
    Other,
}

impl Classification {
    pub fn as_str(&self) -> &'static str {
        match self {
            Classification::Empty => "empty",
            Classification::Good => "good",
            Classification::Bad => "bad",
            Classification::Other => "other",
        }
    }
}

impl std::fmt::Display for Classification {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classify a set of runs. Failure follows [`Run::is_failure`].
pub fn classify<'a>(runs: impl IntoIterator<Item = &'a Run>) -> Classification {
    let mut has_success = false;
    let mut has_failure = false;
    for run in runs {
        if run.is_failure() {
            has_failure = true;
        } else {
            has_success = true;
        }
        if has_success && has_failure {
            break;
        }
    }
    match (has_success, has_failure) {
        (true, true) => Classification::Other,
        (true, false) => Classification::Good,
        (false, true) => Classification::Bad,
        (false, false) => Classification::Empty,
    }
}
