// Engine configuration
// JSON file with every field optional, plus environment overrides for the two
// values that change per deployment (database path, listen address).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub const ENV_DB_PATH: &str = "MIGRATION_TRACKER_DB";
pub const ENV_SERVER_ADDR: &str = "MIGRATION_TRACKER_ADDR";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// SQLite file holding the five source tables
    pub database_path: PathBuf,

    /// Process cnpj_root partitions on the rayon pool
    pub parallel: bool,

    /// Default N for top-consumer rankings
    pub top_n: usize,

    /// Allowed deviation of a breakdown's percentage sum from 100
    pub percentage_tolerance: f64,

    /// Consumption tier thresholds (MWh)
    pub large_consumer_mwh: f64,
    pub medium_consumer_mwh: f64,

    /// Trailing window for migration summaries
    pub migration_window_years: u32,

    pub server_addr: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            database_path: PathBuf::from("migration_tracker.db"),
            parallel: true,
            top_n: 20,
            percentage_tolerance: 0.1,
            large_consumer_mwh: 10_000.0,
            medium_consumer_mwh: 5_000.0,
            migration_window_years: 5,
            server_addr: "0.0.0.0:3000".to_string(),
        }
    }
}

impl EngineConfig {
    /// Load config from JSON file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path.as_ref())
            .with_context(|| format!("Failed to read config file: {:?}", path.as_ref()))?;

        let config: EngineConfig =
            serde_json::from_str(&content).context("Failed to parse config JSON")?;

        config.validate()?;
        Ok(config)
    }

    /// File (when given) or defaults, then environment overrides
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let config = match path {
            Some(p) => Self::from_file(p)?,
            None => Self::default(),
        };
        Ok(config.with_env_overrides(|key| std::env::var(key).ok()))
    }

    /// Apply overrides from a lookup function (std::env::var in production)
    pub fn with_env_overrides<F>(mut self, lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(db) = lookup(ENV_DB_PATH).filter(|v| !v.trim().is_empty()) {
            self.database_path = PathBuf::from(db);
        }
        if let Some(addr) = lookup(ENV_SERVER_ADDR).filter(|v| !v.trim().is_empty()) {
            self.server_addr = addr;
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.medium_consumer_mwh > self.large_consumer_mwh {
            anyhow::bail!(
                "medium_consumer_mwh ({}) must not exceed large_consumer_mwh ({})",
                self.medium_consumer_mwh,
                self.large_consumer_mwh
            );
        }
        if self.percentage_tolerance < 0.0 {
            anyhow::bail!("percentage_tolerance must be non-negative");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"top_n": 5, "parallel": false}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.top_n, 5);
        assert!(!config.parallel);
        assert_eq!(config.large_consumer_mwh, 10_000.0);
        assert_eq!(config.migration_window_years, 5);
    }

    #[test]
    fn test_invalid_thresholds_rejected() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"large_consumer_mwh": 100.0, "medium_consumer_mwh": 500.0}}"#
        )
        .unwrap();

        assert!(EngineConfig::from_file(file.path()).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::default().with_env_overrides(|key| match key {
            ENV_DB_PATH => Some("/data/cnpj.db".to_string()),
            ENV_SERVER_ADDR => Some("127.0.0.1:8080".to_string()),
            _ => None,
        });
        assert_eq!(config.database_path, PathBuf::from("/data/cnpj.db"));
        assert_eq!(config.server_addr, "127.0.0.1:8080");
    }
}
