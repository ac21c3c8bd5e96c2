//! TOML configuration for bobsled.
//!
//! Resolution order: an explicit path, the `BOBSLED_CONFIG` environment
//! variable, `/etc/bobsled/bobsled.toml`, then compiled-in defaults.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::FixedOffset;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::history::Task;

pub const CONFIG_ENV: &str = "BOBSLED_CONFIG";
pub const SYSTEM_CONFIG_PATH: &str = "/etc/bobsled/bobsled.toml";

// ---------------------------------------------------------------------------
// Top-level config
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BobsledConfig {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub report: ReportConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl BobsledConfig {
    /// Load configuration from a TOML file at `path`.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file: {}", path.display()))?;
        let config: Self = toml::from_str(&content)
            .with_context(|| format!("failed to parse config file: {}", path.display()))?;
        config.report.timezone()?;
        info!(path = %path.display(), "loaded configuration");
        Ok(config)
    }

    /// Resolve configuration. An explicit path must load; the fallbacks only
    /// warn when broken.
    pub fn resolve(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            return Self::load(path);
        }

        if let Ok(env_path) = std::env::var(CONFIG_ENV) {
            let path = Path::new(&env_path);
            match Self::load(path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %path.display(),
                        error = %e,
                        "BOBSLED_CONFIG set but file could not be loaded, trying fallback"
                    );
                }
            }
        }

        let system_path = Path::new(SYSTEM_CONFIG_PATH);
        if system_path.exists() {
            match Self::load(system_path) {
                Ok(cfg) => return Ok(cfg),
                Err(e) => {
                    warn!(
                        path = %system_path.display(),
                        error = %e,
                        "system config file exists but could not be loaded, using defaults"
                    );
                }
            }
        }

        debug!("no config file found, using compiled-in defaults");
        Ok(Self::default())
    }
}

// ---------------------------------------------------------------------------
// Storage
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Memory,
    Sqlite,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub backend: BackendKind,
    /// Database file for the sqlite backend.
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Sqlite,
            path: PathBuf::from("data/bobsled.db"),
        }
    }
}

// ---------------------------------------------------------------------------
// Report
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReportConfig {
    /// Trailing window length in days.
    pub days: u32,
    /// Offset from UTC that decides which calendar day a run falls on.
    pub utc_offset_minutes: i32,
}

impl Default for ReportConfig {
    fn default() -> Self {
        Self {
            days: 14,
            utc_offset_minutes: 0,
        }
    }
}

impl ReportConfig {
    pub fn timezone(&self) -> Result<FixedOffset> {
        self.utc_offset_minutes
            .checked_mul(60)
            .and_then(FixedOffset::east_opt)
            .with_context(|| format!("utc_offset_minutes out of range: {}", self.utc_offset_minutes))
    }
}

// ---------------------------------------------------------------------------
// Logging
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset.
    pub level: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

// ---------------------------------------------------------------------------
// Task directory file
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct TaskFile {
    #[serde(default, rename = "task")]
    tasks: Vec<toml::Table>,
}

/// Parse a task directory: `[[task]]` tables with a `name` key. Every other
/// key is kept as opaque metadata.
pub fn parse_tasks(content: &str) -> Result<Vec<Task>> {
    let file: TaskFile = toml::from_str(content).context("failed to parse task file")?;
    file.tasks
        .into_iter()
        .enumerate()
        .map(|(i, mut table)| {
            let name = match table.remove("name") {
                Some(toml::Value::String(name)) => name,
                _ => anyhow::bail!("task #{} is missing a string 'name'", i + 1),
            };
            let metadata = serde_json::to_value(&table)
                .with_context(|| format!("task '{}' has unrepresentable metadata", name))?;
            Ok(Task::new(name).with_metadata(metadata))
        })
        .collect()
}

pub fn load_tasks(path: &Path) -> Result<Vec<Task>> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read task file: {}", path.display()))?;
    parse_tasks(&content)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = BobsledConfig::default();
        assert_eq!(cfg.storage.backend, BackendKind::Sqlite);
        assert_eq!(cfg.report.days, 14);
        assert_eq!(cfg.report.timezone().unwrap().local_minus_utc(), 0);
        assert!(!cfg.logging.json);
    }

    #[test]
    fn test_partial_file_fills_defaults() {
        let cfg: BobsledConfig = toml::from_str(
            r#"
            [storage]
            backend = "memory"

            [report]
            utc_offset_minutes = -300
            "#,
        )
        .unwrap();
        assert_eq!(cfg.storage.backend, BackendKind::Memory);
        assert_eq!(cfg.storage.path, PathBuf::from("data/bobsled.db"));
        assert_eq!(cfg.report.days, 14);
        assert_eq!(cfg.report.timezone().unwrap().local_minus_utc(), -300 * 60);
    }

    #[test]
    fn test_offset_out_of_range_rejected() {
        let report = ReportConfig {
            days: 7,
            utc_offset_minutes: 25 * 60,
        };
        assert!(report.timezone().is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bobsled.toml");
        std::fs::write(&path, "[report]\ndays = 7\n").unwrap();
        let cfg = BobsledConfig::resolve(Some(&path)).unwrap();
        assert_eq!(cfg.report.days, 7);
    }

    #[test]
    fn test_explicit_missing_file_is_error() {
        let dir = tempfile::tempdir().unwrap();
        assert!(BobsledConfig::resolve(Some(&dir.path().join("nope.toml"))).is_err());
    }

    #[test]
    fn test_parse_tasks_keeps_metadata() {
        let tasks = parse_tasks(
            r#"
            [[task]]
            name = "nc-scrape"
            entrypoint = "scrape nc"
            timeout_minutes = 30

            [[task]]
            name = "ak-scrape"
            "#,
        )
        .unwrap();
        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].name, "nc-scrape");
        assert_eq!(tasks[0].metadata["entrypoint"], "scrape nc");
        assert_eq!(tasks[0].metadata["timeout_minutes"], 30);
        assert!(tasks[0].metadata.get("name").is_none());
    }

    #[test]
    fn test_parse_tasks_requires_name() {
        assert!(parse_tasks("[[task]]\nentrypoint = \"x\"\n").is_err());
    }
}
