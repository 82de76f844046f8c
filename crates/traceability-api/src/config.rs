use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use traceability_core::EngineConfig;

pub const DEFAULT_DATABASE: &str = "./traceability.sqlite3";
pub const DEFAULT_CONFIG_FILE: &str = "./traceability.yaml";

/// Deployment settings shared by `lotctl` and the HTTP service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct TraceabilityConfig {
    pub database: PathBuf,
    pub log_filter: Option<String>,
    pub engine: EngineConfig,
}

impl Default for TraceabilityConfig {
    fn default() -> Self {
        Self {
            database: PathBuf::from(DEFAULT_DATABASE),
            log_filter: None,
            engine: EngineConfig::default(),
        }
    }
}

impl TraceabilityConfig {
    /// Parse and validate a YAML config document.
    ///
    /// # Errors
    /// Returns an error for malformed YAML, unknown keys, or blank configured values.
    pub fn parse(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml).context("failed to parse YAML config")?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicitly named config file, or [`DEFAULT_CONFIG_FILE`] when `path` is `None`.
    ///
    /// Only the default location may be absent, in which case defaults apply.
    ///
    /// # Errors
    /// Returns an error when an explicit `path` does not exist, or when the file exists but
    /// cannot be read or parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::load_file(path, true),
            None => Self::load_file(Path::new(DEFAULT_CONFIG_FILE), false),
        }
    }

    fn load_file(path: &Path, required: bool) -> Result<Self> {
        if !path.exists() {
            if required {
                return Err(anyhow!("config file not found: {}", path.display()));
            }
            tracing::debug!(path = %path.display(), "no config file; using defaults");
            return Ok(Self::default());
        }
        let yaml = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        Self::parse(&yaml).with_context(|| format!("invalid config file {}", path.display()))
    }

    fn validate(&self) -> Result<()> {
        if self.database.as_os_str().is_empty() {
            return Err(anyhow!("database path cannot be empty"));
        }
        if self.log_filter.as_deref().is_some_and(|filter| filter.trim().is_empty()) {
            return Err(anyhow!("log_filter cannot be blank"));
        }
        if let Some(blank) = self.engine.categories.iter().find(|value| value.trim().is_empty()) {
            return Err(anyhow!("engine.categories contains a blank entry: {blank:?}"));
        }
        if let Some(blank) = self.engine.units.iter().find(|value| value.trim().is_empty()) {
            return Err(anyhow!("engine.units contains a blank entry: {blank:?}"));
        }
        Ok(())
    }
}
