//! Layered configuration for the dispatcher.
//!
//! Sources, highest priority first: explicit path, `YGGDRASIL_CONFIG`,
//! `yggdrasil.{env}.yaml`, `yggdrasil.yaml`, built-in defaults. The active
//! environment comes from `YGGDRASIL_ENV` (`dev`/`staging`/`prod`).
//! `YGGDRASIL__*` environment variables override file values.

mod models;
mod validation;

use std::path::Path;

use config::{Config as ConfigBuilder, Environment, File, FileFormat};

pub use models::{
    AppConfig, BreakerConfig, CloudConfig, HostConfig, LedgerConfig, ObservabilityConfig,
    RetryConfig,
};
use yggdrasil_errors::{DispatchError, DispatchResult};

const ENV_CONFIG_PATH: &str = "YGGDRASIL_CONFIG";
const ENV_ENVIRONMENT: &str = "YGGDRASIL_ENV";

impl AppConfig {
    /// Load and validate configuration. Fails fast on a missing explicit
    /// file or an invalid schema so the binary can exit with code 2.
    pub fn load(config_path: Option<&str>) -> DispatchResult<Self> {
        let mut builder = ConfigBuilder::builder();

        if let Some(path) = resolve_config_file(config_path)? {
            builder = builder.add_source(File::new(&path, FileFormat::Yaml));
        }

        builder = builder.add_source(
            Environment::with_prefix("YGGDRASIL")
                .separator("__")
                .try_parsing(true),
        );

        let config: AppConfig = builder
            .build()
            .map_err(|e| DispatchError::config_error(format!("failed to read config: {e}")))?
            .try_deserialize()
            .map_err(|e| DispatchError::config_error(format!("failed to parse config: {e}")))?;

        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml(yaml: &str) -> DispatchResult<Self> {
        let config: AppConfig = ConfigBuilder::builder()
            .add_source(File::from_str(yaml, FileFormat::Yaml))
            .build()
            .map_err(|e| DispatchError::config_error(format!("failed to read config: {e}")))?
            .try_deserialize()
            .map_err(|e| DispatchError::config_error(format!("failed to parse config: {e}")))?;
        config.validate()?;
        Ok(config)
    }
}

fn resolve_config_file(explicit: Option<&str>) -> DispatchResult<Option<String>> {
    if let Some(path) = explicit {
        if !Path::new(path).exists() {
            return Err(DispatchError::config_error(format!(
                "config file not found: {path}"
            )));
        }
        return Ok(Some(path.to_string()));
    }

    if let Ok(path) = std::env::var(ENV_CONFIG_PATH) {
        if !Path::new(&path).exists() {
            return Err(DispatchError::config_error(format!(
                "{ENV_CONFIG_PATH} points to a missing file: {path}"
            )));
        }
        return Ok(Some(path));
    }

    let env = std::env::var(ENV_ENVIRONMENT).unwrap_or_else(|_| "dev".to_string());
    for candidate in [format!("yggdrasil.{env}.yaml"), "yggdrasil.yaml".to_string()] {
        if Path::new(&candidate).exists() {
            return Ok(Some(candidate));
        }
    }

    Ok(None)
}
