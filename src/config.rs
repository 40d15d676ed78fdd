use crate::messaging::Verb;
use crate::timeouts::{
    DEFINITIONS_UPDATE_TIMEOUT, MIGRATION_DELAY, MIGRATION_REQUEST_TIMEOUT, MUTATION_TIMEOUT,
    MUTATION_WORKERS, REQUEST_TIMEOUT,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),
    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Node-level tuning for the metadata subsystem. Every field may be omitted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetaConfig {
    pub mutation_timeout_ms: u64,
    pub request_timeout_ms: u64,
    pub definitions_update_timeout_ms: u64,
    pub migration_request_timeout_ms: u64,
    pub migration_delay_ms: u64,
    pub mutation_workers: usize,
    pub audit: AuditConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Announce a row-level audit entry for every applied ordinary mutation.
    pub row_mutations: bool,
    /// Targets whose registry entries are loaded into the cache at start.
    pub hydrate_targets: Vec<String>,
}

impl Default for MetaConfig {
    fn default() -> Self {
        Self {
            mutation_timeout_ms: MUTATION_TIMEOUT.as_millis() as u64,
            request_timeout_ms: REQUEST_TIMEOUT.as_millis() as u64,
            definitions_update_timeout_ms: DEFINITIONS_UPDATE_TIMEOUT.as_millis() as u64,
            migration_request_timeout_ms: MIGRATION_REQUEST_TIMEOUT.as_millis() as u64,
            migration_delay_ms: MIGRATION_DELAY.as_millis() as u64,
            mutation_workers: MUTATION_WORKERS,
            audit: AuditConfig::default(),
        }
    }
}

impl MetaConfig {
    pub fn timeout_for(&self, verb: Verb) -> Duration {
        let ms = match verb {
            Verb::Mutation => self.mutation_timeout_ms,
            Verb::RequestResponse => self.request_timeout_ms,
            Verb::DefinitionsUpdate => self.definitions_update_timeout_ms,
            Verb::MigrationRequest => self.migration_request_timeout_ms,
        };
        Duration::from_millis(ms)
    }

    pub fn migration_delay(&self) -> Duration {
        Duration::from_millis(self.migration_delay_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for verb in Verb::ALL {
            if self.timeout_for(verb).is_zero() {
                return Err(ConfigError::Invalid(format!(
                    "timeout for {} must be positive",
                    verb
                )));
            }
        }
        if self.mutation_workers == 0 {
            return Err(ConfigError::Invalid(
                "mutation_workers must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

pub fn load_config(path: &Path) -> Result<MetaConfig, ConfigError> {
    let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    let config: MetaConfig = serde_yaml::from_str(&raw)?;
    config.validate()?;
    Ok(config)
}
