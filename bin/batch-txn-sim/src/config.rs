use std::{fs, io, path::PathBuf};

use serde::Deserialize;
use strata_batch_txn::RetryConfig;
use thiserror::Error;
use toml::de::Error as TomlError;

use crate::args::Args;

#[derive(Debug, Error)]
pub(crate) enum ConfigError {
    #[error("failed to read config {0}: {1}")]
    Read(PathBuf, #[source] io::Error),

    #[error("failed to parse config: {0}")]
    Parse(#[from] TomlError),

    #[error("invalid config: {0}")]
    Invalid(String),
}

/// Shape of the generated load.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub(crate) struct LoadConfig {
    /// Concurrent caller threads.
    pub callers: usize,

    /// Updates issued by each caller.
    pub updates_per_caller: usize,

    /// Ledger accounts updates are spread over.
    pub accounts: u32,

    /// Updates one transaction takes before reporting it is full.
    pub max_batch: usize,

    /// Largest absolute balance change of a single update.
    pub max_delta: i64,

    /// Probability of a commit failing with a write conflict.
    pub conflict_rate: f64,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            callers: 8,
            updates_per_caller: 100,
            accounts: 16,
            max_batch: 32,
            max_delta: 50,
            conflict_rate: 0.05,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct LoggingConfig {
    /// Directory path for file-based logging.
    pub log_dir: Option<PathBuf>,

    /// Use JSON format for logs instead of compact format.
    pub json_format: bool,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub(crate) struct Config {
    pub retry: RetryConfig,
    pub load: LoadConfig,
    pub logging: LoggingConfig,
}

impl Config {
    /// Loads the config file, if any, then applies command line overrides.
    pub(crate) fn from_args(args: &Args) -> Result<Config, ConfigError> {
        let mut config = match &args.config {
            Some(path) => {
                let raw = fs::read_to_string(path)
                    .map_err(|e| ConfigError::Read(path.clone(), e))?;
                Self::parse(&raw)?
            }
            None => Config::default(),
        };

        let load = &mut config.load;
        if let Some(callers) = args.callers {
            load.callers = callers;
        }
        if let Some(updates) = args.updates {
            load.updates_per_caller = updates;
        }
        if let Some(accounts) = args.accounts {
            load.accounts = accounts;
        }
        if let Some(max_batch) = args.max_batch {
            load.max_batch = max_batch;
        }
        if let Some(rate) = args.conflict_rate {
            load.conflict_rate = rate;
        }
        if let Some(retries) = args.max_retries {
            config.retry.max_retries = retries;
        }
        if let Some(dir) = &args.log_dir {
            config.logging.log_dir = Some(dir.clone());
        }
        config.logging.json_format |= args.json;

        config.validate()?;
        Ok(config)
    }

    fn parse(raw: &str) -> Result<Config, ConfigError> {
        Ok(toml::from_str(raw)?)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let load = &self.load;
        if load.max_batch == 0 {
            return Err(ConfigError::Invalid("max_batch must be at least 1".into()));
        }
        if load.accounts == 0 {
            return Err(ConfigError::Invalid("accounts must be at least 1".into()));
        }
        if load.max_delta <= 0 {
            return Err(ConfigError::Invalid("max_delta must be positive".into()));
        }
        if !(0.0..=1.0).contains(&load.conflict_rate) {
            return Err(ConfigError::Invalid(format!(
                "conflict_rate {} is not a probability",
                load.conflict_rate
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_partial_config() {
        let raw = r#"
            [retry]
            max_retries = 2

            [load]
            callers = 3
            conflict_rate = 0.5
        "#;

        let config = Config::parse(raw).unwrap();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.retry.base_delay_ms, RetryConfig::default().base_delay_ms);
        assert_eq!(config.load.callers, 3);
        assert_eq!(config.load.max_batch, LoadConfig::default().max_batch);
        assert!(!config.logging.json_format);
    }

    #[test]
    fn test_validate_rejects_bad_rate() {
        let mut config = Config::default();
        config.load.conflict_rate = 1.5;
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_empty_batches() {
        let mut config = Config::default();
        config.load.max_batch = 0;
        assert!(config.validate().is_err());
    }
}
