use std::path::PathBuf;
use std::time::Duration;

use crate::model::ConflictGranularity;

/// Host settings, read from `KITROOM_*` environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub compact_threshold: u64,
    pub overdue_sweep: Duration,
    pub conflict_granularity: ConflictGranularity,
    /// JSON weekly schedule; without one every location is closed.
    pub hours_file: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            compact_threshold: 1000,
            overdue_sweep: Duration::from_secs(300),
            conflict_granularity: ConflictGranularity::Day,
            hours_file: None,
        }
    }
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Unparseable values fall back to the default with a warning.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();
        let parsed = |key: &str| -> Option<u64> {
            let raw = lookup(key)?;
            match raw.trim().parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    tracing::warn!("ignoring {key}={raw:?}: not a number");
                    None
                }
            }
        };

        let conflict_granularity = match lookup("KITROOM_CONFLICT_GRANULARITY").as_deref().map(str::trim) {
            None | Some("day") => ConflictGranularity::Day,
            Some("exact") => ConflictGranularity::Exact,
            Some(other) => {
                tracing::warn!("ignoring KITROOM_CONFLICT_GRANULARITY={other:?}: expected day or exact");
                defaults.conflict_granularity
            }
        };

        Self {
            data_dir: lookup("KITROOM_DATA_DIR").map(PathBuf::from).unwrap_or(defaults.data_dir),
            metrics_port: parsed("KITROOM_METRICS_PORT").and_then(|p| u16::try_from(p).ok()),
            compact_threshold: parsed("KITROOM_COMPACT_THRESHOLD").unwrap_or(defaults.compact_threshold),
            overdue_sweep: parsed("KITROOM_OVERDUE_SWEEP_SECS")
                .filter(|s| *s > 0)
                .map(Duration::from_secs)
                .unwrap_or(defaults.overdue_sweep),
            conflict_granularity,
            hours_file: lookup("KITROOM_HOURS_FILE").map(PathBuf::from),
        }
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("kitroom.wal")
    }
}
