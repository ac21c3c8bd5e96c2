//! bobsled -- run history and daily status for scheduled jobs.
//!
//! This crate records task runs through a pluggable storage backend and turns
//! a trailing window of that history into a per-entity, per-day status grid.

pub mod config;
pub mod history;
pub mod status;
pub mod storage;

use anyhow::Result;

use crate::config::BobsledConfig;
use crate::status::{Report, ReportBuilder};

/// Open the configured storage and build a report over `days` (or the
/// configured default window).
pub async fn check_status(config: &BobsledConfig, days: Option<u32>) -> Result<Report> {
    let storage = storage::open(&config.storage).await?;
    let builder = ReportBuilder::new(storage, config.report.timezone()?);
    let report = builder.build(days.unwrap_or(config.report.days)).await?;
    Ok(report)
}
