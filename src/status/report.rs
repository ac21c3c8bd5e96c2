//! Trailing-window status report: query, aggregate, classify.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Days, Duration, FixedOffset, NaiveDate, TimeZone, Utc};
use serde::Serialize;
use tracing::{debug, info};

use super::{aggregate, Classification, RunGroup, StatusMap};
use crate::storage::{RunFilter, Storage, StorageError, StorageResult};

/// Longest window a report may cover (ten years).
pub const MAX_REPORT_DAYS: u32 = 3660;

/// Builds status reports from an explicitly supplied storage backend.
#[derive(Clone)]
pub struct ReportBuilder {
    storage: Arc<dyn Storage>,
    tz: FixedOffset,
}

impl ReportBuilder {
    /// `tz` fixes which calendar day a run belongs to.
    pub fn new(storage: Arc<dyn Storage>, tz: FixedOffset) -> Self {
        Self { storage, tz }
    }

    pub fn timezone(&self) -> FixedOffset {
        self.tz
    }

    /// Report on the trailing `days` days ending now.
    pub async fn build(&self, days: u32) -> StorageResult<Report> {
        self.build_at(Utc::now(), days).await
    }

    /// Report on the trailing `days` days ending at `now`.
    ///
    /// Storage errors abort the report; there is no partial result.
    pub async fn build_at(&self, now: DateTime<Utc>, days: u32) -> StorageResult<Report> {
        if days == 0 || days > MAX_REPORT_DAYS {
            return Err(StorageError::InvalidFilter(format!(
                "report window must cover 1 to {} days, got {}",
                MAX_REPORT_DAYS, days
            )));
        }

        let today = now.with_timezone(&self.tz).date_naive();
        let window: Vec<NaiveDate> = (0..u64::from(days))
            .map(|n| today.checked_sub_days(Days::new(n)))
            .collect::<Option<_>>()
            .ok_or_else(out_of_range)?;

        // Midnight of the earliest listed day; the filter bound is exclusive,
        // so step back one nanosecond to include runs starting at midnight.
        let lower_bound = window
            .last()
            .and_then(|day| day.and_hms_opt(0, 0, 0))
            .and_then(|midnight| self.tz.from_local_datetime(&midnight).single())
            .and_then(|start| {
                start
                    .with_timezone(&Utc)
                    .checked_sub_signed(Duration::nanoseconds(1))
            })
            .ok_or_else(out_of_range)?;

        debug!(%lower_bound, days, "Fetching report window");
        let mut runs = self
            .storage
            .get_runs(&RunFilter::new().started_after(lower_bound))
            .await?;
        // newest first within each day; stable for equal start times
        runs.sort_by(|a, b| b.started_at.cmp(&a.started_at));
        let run_count = runs.len();

        let mut entities = aggregate(runs, &self.tz);
        for by_day in entities.values_mut() {
            for day in &window {
                by_day.entry(*day).or_default();
            }
            for group in by_day.values().filter(|g| !g.is_empty()) {
                group.classification();
            }
        }

        info!(
            days,
            runs = run_count,
            entities = entities.len(),
            "Status report built"
        );

        Ok(Report {
            generated_at: now,
            days: window,
            entities,
        })
    }
}

fn out_of_range() -> StorageError {
    StorageError::InvalidFilter("report window out of range".to_string())
}

/// Everything a renderer needs: the window days, the entity/day groups and
/// their classifications.
#[derive(Debug, Clone, Serialize)]
pub struct Report {
    generated_at: DateTime<Utc>,
    /// Window days, newest first.
    days: Vec<NaiveDate>,
    entities: StatusMap,
}

impl Report {
    pub fn generated_at(&self) -> DateTime<Utc> {
        self.generated_at
    }

    pub fn days(&self) -> &[NaiveDate] {
        &self.days
    }

    /// Entity keys in sorted order.
    pub fn entities(&self) -> impl Iterator<Item = &str> {
        self.entities.keys().map(String::as_str)
    }

    pub fn map(&self) -> &StatusMap {
        &self.entities
    }

    pub fn group(&self, entity: &str, day: NaiveDate) -> Option<&RunGroup> {
        self.entities.get(entity).and_then(|days| days.get(&day))
    }

    /// `Empty` for any entity/day without runs, known or not.
    pub fn classification(&self, entity: &str, day: NaiveDate) -> Classification {
        self.group(entity, day)
            .map_or(Classification::Empty, RunGroup::classification)
    }

    /// One row per entity with a classification for every window day.
    pub fn rows(&self) -> Vec<(&str, Vec<(NaiveDate, Classification)>)> {
        self.entities()
            .map(|entity| {
                let cells = self
                    .days
                    .iter()
                    .map(|day| (*day, self.classification(entity, *day)))
                    .collect();
                (entity, cells)
            })
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }
}

impl fmt::Display for Report {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<12}", "Entity")?;
        for day in &self.days {
            write!(f, " | {:<6}", day.format("%m/%d").to_string())?;
        }
        writeln!(f)?;
        write!(f, "{:-<12}", "")?;
        for _ in &self.days {
            write!(f, "-|-{:-<6}", "")?;
        }
        writeln!(f)?;
        for (entity, cells) in self.rows() {
            write!(f, "{:<12}", entity)?;
            for (_, class) in cells {
                write!(f, " | {:<6}", class.as_str())?;
            }
            writeln!(f)?;
        }
        Ok(())
    }
}
