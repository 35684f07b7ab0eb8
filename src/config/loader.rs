//! Configuration Loader
//!
//! Environment-aware layering of configuration sources with the `config` crate.
//! Missing files are skipped; only malformed files and failed validation are errors.

use super::error::{ConfigResult, ConfigurationError};
use super::TriggerMetricsConfig;
use std::env;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Base name of the configuration files inside the configuration directory
pub const CONFIG_FILE_STEM: &str = "trigger-metrics";

/// Prefix of environment variable overrides
pub const ENV_PREFIX: &str = "TRIGGER_METRICS";

/// Detect the deployment environment from the process environment
pub fn detect_environment() -> String {
    env::var("TRIGGER_METRICS_ENV")
        .or_else(|_| env::var("APP_ENV"))
        .unwrap_or_else(|_| "development".to_string())
        .to_lowercase()
}

/// Builder for a layered [`TriggerMetricsConfig`]
#[derive(Debug, Clone)]
pub struct ConfigLoader {
    config_directory: PathBuf,
    environment: String,
    env_overrides: bool,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new("config")
    }
}

impl ConfigLoader {
    pub fn new(config_directory: impl Into<PathBuf>) -> Self {
        Self {
            config_directory: config_directory.into(),
            environment: detect_environment(),
            env_overrides: true,
        }
    }

    /// Use an explicit environment instead of the detected one
    pub fn with_environment(mut self, environment: impl Into<String>) -> Self {
        self.environment = environment.into().to_lowercase();
        self
    }

    /// Skip `TRIGGER_METRICS_*` variables; tests use this to stay hermetic
    pub fn without_env_overrides(mut self) -> Self {
        self.env_overrides = false;
        self
    }

    pub fn environment(&self) -> &str {
        &self.environment
    }

    pub fn base_file(&self) -> PathBuf {
        self.config_directory.join(format!("{CONFIG_FILE_STEM}.toml"))
    }

    pub fn environment_file(&self) -> PathBuf {
        self.config_directory
            .join(format!("{CONFIG_FILE_STEM}.{}.toml", self.environment))
    }

    /// Layer every source, deserialize and validate
    pub fn load(&self) -> ConfigResult<TriggerMetricsConfig> {
        let mut builder = ::config::Config::builder();

        for path in [self.base_file(), self.environment_file()] {
            debug!(path = %path.display(), present = path.is_file(), "Configuration source");
            builder = builder.add_source(file_source(&path));
        }

        if self.env_overrides {
            builder = builder.add_source(
                ::config::Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );
        }

        let config: TriggerMetricsConfig = builder
            .build()
            .map_err(|e| ConfigurationError::parse_error(self.config_directory.display().to_string(), e))?
            .try_deserialize()
            .map_err(|e| ConfigurationError::parse_error("merged configuration", e))?;

        config.validate()?;

        info!(
            environment = %self.environment,
            store_backend = %config.store.backend,
            write_mode = ?config.recorder.mode,
            "Configuration loaded"
        );
        debug!(config = %config.sanitized(), "Effective configuration");

        Ok(config)
    }
}

fn file_source(path: &Path) -> ::config::File<::config::FileSourceFile, ::config::FileFormat> {
    ::config::File::from(path)
        .format(::config::FileFormat::Toml)
        .required(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriteMode;
    use std::fs;

    #[test]
    fn test_missing_directory_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigLoader::new(dir.path().join("absent"))
            .with_environment("test")
            .without_env_overrides()
            .load()
            .unwrap();
        assert_eq!(config, TriggerMetricsConfig::default());
    }

    #[test]
    fn test_environment_file_overrides_base_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("trigger-metrics.toml"),
            "[recorder]\nmode = \"direct\"\nbatch_size = 10\n\n[store]\nbackend = \"memory\"\n",
        )
        .unwrap();
        fs::write(
            dir.path().join("trigger-metrics.production.toml"),
            "[recorder]\nbatch_size = 250\n",
        )
        .unwrap();

        let config = ConfigLoader::new(dir.path())
            .with_environment("Production")
            .without_env_overrides()
            .load()
            .unwrap();

        assert_eq!(config.store.backend, "memory");
        assert_eq!(config.recorder.mode, WriteMode::Direct);
        assert_eq!(config.recorder.batch_size, 250);
    }

    #[test]
    fn test_invalid_values_fail_validation() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("trigger-metrics.toml"),
            "[exporter]\nscan_count = 0\n",
        )
        .unwrap();

        let result = ConfigLoader::new(dir.path())
            .with_environment("test")
            .without_env_overrides()
            .load();
        assert!(matches!(
            result,
            Err(ConfigurationError::ValidationError { .. })
        ));
    }

    #[test]
    fn test_malformed_file_is_a_parse_error() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("trigger-metrics.toml"), "[recorder\nbatch_size = ").unwrap();

        let result = ConfigLoader::new(dir.path())
            .with_environment("test")
            .without_env_overrides()
            .load();
        assert!(matches!(result, Err(ConfigurationError::ParseError { .. })));
    }
}
