use config::{Config, ConfigError, Environment, File};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::coordination::{BlackSwanConfig, OrderGuardConfig};
use crate::error::{GuardrailError, Result};
use crate::strategy::DegradationConfig;
use crate::supervisor::ConnectivityConfig;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct GuardrailConfig {
    #[serde(default)]
    pub ledger: LedgerConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub connectivity: ConnectivityConfig,
    #[serde(default)]
    pub order_guard: OrderGuardConfig,
    /// Required: black-swan thresholds are never defaulted
    pub black_swan: BlackSwanConfig,
    /// Required: degradation thresholds are never defaulted
    pub degradation: DegradationConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct LedgerConfig {
    /// Directory holding one `<family>.jsonl` log per record family
    #[serde(default = "default_ledger_dir")]
    pub dir: PathBuf,
}

fn default_ledger_dir() -> PathBuf {
    PathBuf::from("data/ledger")
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            dir: default_ledger_dir(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error); `RUST_LOG` wins when set
    #[serde(default = "default_log_level")]
    pub level: String,
    /// Enable JSON formatted logs
    #[serde(default)]
    pub json: bool,
    /// Directory for daily-rolling log files
    #[serde(default = "default_log_dir")]
    pub dir: PathBuf,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_dir() -> PathBuf {
    PathBuf::from("logs")
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
            dir: default_log_dir(),
        }
    }
}

impl GuardrailConfig {
    /// Load configuration from files and environment
    pub fn load() -> std::result::Result<Self, ConfigError> {
        Self::load_from("config")
    }

    /// Load configuration from a specific directory
    pub fn load_from<P: AsRef<Path>>(config_dir: P) -> std::result::Result<Self, ConfigError> {
        let config_dir = config_dir.as_ref();

        let builder = Config::builder()
            .set_default("logging.level", "info")?
            .set_default("logging.json", false)?
            // Load default config file
            .add_source(File::from(config_dir.join("default.toml")).required(false))
            // Load environment-specific config (e.g., config/production.toml)
            .add_source(
                File::from(config_dir.join(
                    std::env::var("BULWARK_ENV").unwrap_or_else(|_| "development".to_string()),
                ))
                .required(false),
            )
            // Override with environment variables (BULWARK_BLACK_SWAN__DRAWDOWN__THRESHOLD, etc.)
            .add_source(
                Environment::with_prefix("BULWARK")
                    .prefix_separator("_")
                    .separator("__")
                    .try_parsing(true),
            );

        builder.build()?.try_deserialize()
    }

    /// Load from `config_dir` and reject invalid values.
    pub fn load_validated<P: AsRef<Path>>(config_dir: P) -> Result<Self> {
        let config = Self::load_from(config_dir)?;
        config.validate().map_err(GuardrailError::InvalidConfig)?;
        Ok(config)
    }

    /// Validate configuration values, collecting every problem
    pub fn validate(&self) -> std::result::Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if self.ledger.dir.as_os_str().is_empty() {
            errors.push("ledger.dir must not be empty".to_string());
        }
        errors.extend(self.connectivity.validate());
        errors.extend(self.order_guard.validate());
        errors.extend(self.black_swan.validate());
        errors.extend(self.degradation.validate());

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}
