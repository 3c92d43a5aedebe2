//! Process settings: the engine configuration plus the process-level knobs.
//!
//! The JSON file named by `PORTALJOBS_CONFIG` holds both; engine keys sit at
//! the top level next to `admin_addr` and `log_format`.

use std::net::SocketAddr;
use std::path::Path;

use serde::Deserialize;

use portaljobs_infra::config::{CONFIG_PATH_ENV, ConfigError, OrchestratorConfig};
use portaljobs_observability::{LogFormat, ParseLogFormatError};

pub const ADMIN_ADDR_ENV: &str = "PORTALJOBS_ADMIN_ADDR";
pub const LOG_FORMAT_ENV: &str = "PORTALJOBS_LOG_FORMAT";

#[derive(Debug, thiserror::Error)]
pub enum SettingsError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("invalid PORTALJOBS_ADMIN_ADDR '{0}'")]
    AdminAddr(String),
    #[error(transparent)]
    LogFormat(#[from] ParseLogFormatError),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Bind address of the admin HTTP surface.
    pub admin_addr: SocketAddr,
    pub log_format: LogFormat,
    #[serde(flatten)]
    pub engine: OrchestratorConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            log_format: LogFormat::default(),
            engine: OrchestratorConfig::default(),
        }
    }
}

impl Settings {
    pub fn from_env() -> Result<Self, SettingsError> {
        Self::load(|key| std::env::var(key).ok())
    }

    /// Resolve defaults, then the optional config file, then environment
    /// overrides, all read through `lookup`.
    pub fn load(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, SettingsError> {
        let mut settings = match lookup(CONFIG_PATH_ENV) {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };

        settings.engine.apply_env(&lookup);
        if let Some(addr) = lookup(ADMIN_ADDR_ENV) {
            settings.admin_addr = addr
                .parse()
                .map_err(|_| SettingsError::AdminAddr(addr.clone()))?;
        }
        if let Some(format) = lookup(LOG_FORMAT_ENV) {
            settings.log_format = format.parse()?;
        }

        settings.engine.validate()?;
        Ok(settings)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, SettingsError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let settings: Self = serde_json::from_str(&raw).map_err(ConfigError::Parse)?;
        Ok(settings)
    }
}
