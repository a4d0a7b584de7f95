//! Configuration Loader
//!
//! Environment-aware configuration loading: base YAML file, environment-specific
//! overrides and `ORCHESTRATOR__*` environment variables, merged with the
//! `config` crate and validated before use.

use super::error::{ConfigResult, ConfigurationError};
use super::OrchestratorConfig;
use config::{Config, Environment, File, FileFormat};
use std::env;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Base file name inside the configuration directory
pub const BASE_CONFIG_FILE: &str = "orchestrator.yaml";

/// Prefix for environment variable overrides (`ORCHESTRATOR__QUEUE__MAX_QUEUE_DEPTH`)
pub const ENV_PREFIX: &str = "ORCHESTRATOR";

/// Loaded configuration plus the context it was loaded from
#[derive(Debug)]
pub struct ConfigManager {
    config: OrchestratorConfig,
    environment: String,
    config_directory: PathBuf,
}

impl ConfigManager {
    /// Load configuration with environment auto-detection
    pub fn load() -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory(None)
    }

    /// Load configuration from a specific directory
    pub fn load_from_directory(config_dir: Option<PathBuf>) -> ConfigResult<Arc<ConfigManager>> {
        let environment = Self::detect_environment();
        Self::load_from_directory_with_env(config_dir, &environment)
    }

    /// Load configuration from a specific directory with explicit environment
    ///
    /// An explicitly given directory must contain `orchestrator.yaml`; the default
    /// directory may be absent, in which case code defaults apply.
    pub fn load_from_directory_with_env(
        config_dir: Option<PathBuf>,
        environment: &str,
    ) -> ConfigResult<Arc<ConfigManager>> {
        let explicit = config_dir.is_some();
        let config_directory = config_dir.unwrap_or_else(|| PathBuf::from("config"));
        let base_path = config_directory.join(BASE_CONFIG_FILE);

        if explicit && !base_path.is_file() {
            return Err(ConfigurationError::config_file_not_found(vec![base_path]));
        }

        debug!(
            environment = %environment,
            directory = %config_directory.display(),
            "Loading orchestrator configuration"
        );

        let config = Self::build(&config_directory, environment)?;
        config.validate()?;

        info!(
            environment = %environment,
            max_queue_depth = config.queue.max_queue_depth,
            scaling_policies = config.scaling.policies.len(),
            circuit_breakers_enabled = config.circuit_breakers.enabled,
            "⚙️ Configuration loaded successfully"
        );

        Ok(Arc::new(ConfigManager {
            config,
            environment: environment.to_string(),
            config_directory,
        }))
    }

    /// Wrap an in-memory configuration (embedding and tests)
    pub fn from_config(config: OrchestratorConfig) -> ConfigResult<Arc<ConfigManager>> {
        config.validate()?;
        let environment = config.environment.clone();
        Ok(Arc::new(ConfigManager {
            config,
            environment,
            config_directory: PathBuf::from("config"),
        }))
    }

    /// Re-read all sources from the same directory and environment
    pub fn reload(&self) -> ConfigResult<Arc<ConfigManager>> {
        Self::load_from_directory_with_env(Some(self.config_directory.clone()), &self.environment)
    }

    fn build(config_directory: &Path, environment: &str) -> ConfigResult<OrchestratorConfig> {
        let base_path = config_directory.join(BASE_CONFIG_FILE);
        let env_path = config_directory.join(format!("orchestrator.{environment}.yaml"));

        let merged = Config::builder()
            .add_source(
                File::from(base_path)
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                File::from(env_path)
                    .format(FileFormat::Yaml)
                    .required(false),
            )
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .set_override("environment", environment)
            .map_err(|e| ConfigurationError::LoadError {
                environment: environment.to_string(),
                error: e.to_string(),
            })?
            .build()
            .map_err(|e| ConfigurationError::LoadError {
                environment: environment.to_string(),
                error: e.to_string(),
            })?;

        Ok(merged.try_deserialize::<OrchestratorConfig>()?)
    }

    /// Get the loaded configuration
    pub fn config(&self) -> &OrchestratorConfig {
        &self.config
    }

    /// Get the current environment
    pub fn environment(&self) -> &str {
        &self.environment
    }

    /// Get the configuration directory
    pub fn config_directory(&self) -> &Path {
        &self.config_directory
    }

    /// Detect the current environment from environment variables
    pub fn detect_environment() -> String {
        env::var("ORCHESTRATOR_ENV")
            .or_else(|_| env::var("APP_ENV"))
            .unwrap_or_else(|_| "development".to_string())
            .to_lowercase()
    }
}
