//! Configuration loading
//!
//! A TOML file is layered under `JUDGED_*` environment variables (nested keys
//! separated by `__`, e.g. `JUDGED_CACHE__BUDGET_BYTES`) using the config crate.

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

use crate::config::{Config, ConfigError, ENV_PREFIX};

impl Config {
    /// Load configuration from a file with environment overrides
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        std::fs::metadata(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;

        let config = ConfigBuilder::builder()
            .add_source(File::from(path).format(FileFormat::Toml))
            .add_source(environment())
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn parse_toml(content: &str) -> Result<Self, ConfigError> {
        let config = ConfigBuilder::builder()
            .add_source(File::from_str(content, FileFormat::Toml))
            .build()?;

        let config: Config = config.try_deserialize()?;
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.slots == Some(0) {
            return Err(ConfigError::Invalid("slots must be at least 1".into()));
        }
        if self.cache.budget_bytes == 0 {
            return Err(ConfigError::Invalid("cache budget must be non-zero".into()));
        }
        if self.cache.safety_margin_bytes >= self.cache.budget_bytes {
            return Err(ConfigError::Invalid(
                "cache safety margin must be smaller than the budget".into(),
            ));
        }
        if self.broker.max_deliveries == 0 {
            return Err(ConfigError::Invalid(
                "broker max_deliveries must be at least 1".into(),
            ));
        }
        if self.broker.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "broker poll_interval_ms must be non-zero".into(),
            ));
        }

        for (id, lang) in &self.languages {
            if lang.name.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty name"
                )));
            }
            if lang.execute.is_empty() {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty execute command"
                )));
            }
            if let Some(ref compile) = lang.compile
                && compile.is_empty()
            {
                return Err(ConfigError::Invalid(format!(
                    "language '{id}' has empty compile command"
                )));
            }
            let constraints = std::iter::once(&lang.constraints).chain(&lang.compile_constraints);
            for constraints in constraints {
                if constraints.time_ms == 0 || constraints.memory_kb == 0 {
                    return Err(ConfigError::Invalid(format!(
                        "language '{id}' has zero time or memory limit"
                    )));
                }
            }
        }

        Ok(())
    }
}

fn environment() -> Environment {
    Environment::with_prefix(ENV_PREFIX)
        .prefix_separator("_")
        .separator("__")
        .try_parsing(true)
}
