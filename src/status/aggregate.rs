use std::collections::BTreeMap;
use std::sync::OnceLock;

use chrono::{FixedOffset, NaiveDate};
use serde::ser::SerializeStruct;
use serde::{Serialize, Serializer};

use super::{classify, Classification};
use crate::history::Run;

/// entity -> calendar day -> runs
pub type StatusMap = BTreeMap<String, BTreeMap<NaiveDate, RunGroup>>;

/// Runs for one entity on one calendar day, in the order they were added.
#[derive(Debug, Clone, Default)]
pub struct RunGroup {
    runs: Vec<Run>,
    classification: OnceLock<Classification>,
}

impl RunGroup {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, run: Run) {
        self.runs.push(run);
        // membership changed
        self.classification = OnceLock::new();
    }

    pub fn runs(&self) -> &[Run] {
        &self.runs
    }

    pub fn len(&self) -> usize {
        self.runs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.runs.is_empty()
    }

    /// Computed on first call, then cached.
    pub fn classification(&self) -> Classification {
        *self.classification.get_or_init(|| classify(&self.runs))
    }
}

impl Serialize for RunGroup {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut state = serializer.serialize_struct("RunGroup", 2)?;
        state.serialize_field("status", &self.classification())?;
        state.serialize_field("runs", &self.runs)?;
        state.end()
    }
}

/// Bucket runs by entity and by start day in the `tz` offset.
///
/// Buckets keep input order and nothing is deduplicated.
pub fn aggregate(runs: impl IntoIterator<Item = Run>, tz: &FixedOffset) -> StatusMap {
    let mut map = StatusMap::new();
    for run in runs {
        let day = run.started_at.with_timezone(tz).date_naive();
        map.entry(run.entity.clone())
            .or_default()
            .entry(day)
            .or_default()
            .add(run);
    }
    map
}
