use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::path::Path;

use stem_scan::{LiveSettings, ScanConfiguration};

#[derive(Debug, Deserialize, Serialize, Clone, Default)]
#[serde(default)]
pub struct AppConfig {
    pub scan: ScanConfiguration,
    pub live: LiveSettings,
    pub experiment_logging: ExperimentLoggingConfig,
    pub console: ConsoleConfig,
}

impl AppConfig {
    /// Validate all configuration values
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.scan
            .validate()
            .map_err(|e| ConfigError::Message(format!("Invalid scan settings: {e}")))?;

        if self.live.queue_capacity == 0 {
            return Err(ConfigError::Message(
                "live.queue_capacity must be greater than zero".to_string(),
            ));
        }

        Ok(())
    }
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ExperimentLoggingConfig {
    pub enabled: bool,
    pub output_path: String,
}

#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct ConsoleConfig {
    pub verbosity: String,
}

impl Default for ExperimentLoggingConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            output_path: "./scans".to_string(),
        }
    }
}

impl Default for ConsoleConfig {
    fn default() -> Self {
        Self {
            verbosity: "info".to_string(),
        }
    }
}

/// Load configuration as defaults, then a TOML file, then `STEM_SCAN__*` overrides
pub fn load_config(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    let mut builder = Config::builder().add_source(Config::try_from(&AppConfig::default())?);

    if let Some(path) = config_path {
        if !path.exists() {
            return Err(ConfigError::Message(format!(
                "Config file not found: {}",
                path.display()
            )));
        }
        builder = builder.add_source(File::from(path));
    } else if let Some(path) = ["stem_scan.toml", "config.toml"]
        .iter()
        .find(|p| Path::new(p).exists())
    {
        builder = builder.add_source(File::with_name(path));
    }

    // e.g. STEM_SCAN__SCAN__SETTLE_DELAY_MS=0
    builder = builder.add_source(
        Environment::with_prefix("STEM_SCAN")
            .separator("__")
            .try_parsing(true),
    );

    let app_config = builder.build()?.try_deserialize::<AppConfig>()?;
    app_config.validate()?;

    Ok(app_config)
}

/// Load configuration, falling back to defaults only when no file was requested
///
/// An explicitly requested file that fails to load is an error rather than a silent
/// switch to defaults.
pub fn load_config_or_default(config_path: Option<&Path>) -> Result<AppConfig, ConfigError> {
    match load_config(config_path) {
        Ok(config) => Ok(config),
        Err(e) if config_path.is_some() => Err(e),
        Err(e) => {
            log::warn!("Using default configuration: {e}");
            Ok(AppConfig::default())
        }
    }
}
