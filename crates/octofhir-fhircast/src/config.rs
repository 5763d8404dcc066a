use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

use crate::error::{FhircastError, FhircastResult};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FhircastConfig {
    #[serde(default)]
    pub connection: ConnectionSettings,
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl FhircastConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.connection.outbound_buffer == 0 {
            return Err("connection.outbound_buffer must be > 0".into());
        }
        if self.connection.idle_timeout_ms == Some(0) {
            return Err("connection.idle_timeout_ms must be > 0 when set".into());
        }
        let lvl = self.logging.level.to_ascii_lowercase();
        let valid_levels = ["trace", "debug", "info", "warn", "error", "off"];
        if !valid_levels.contains(&lvl.as_str()) {
            return Err(format!("logging.level must be one of {valid_levels:?}"));
        }
        Ok(())
    }

    /// Parse and validate a TOML document.
    pub fn from_toml_str(source: &str) -> FhircastResult<Self> {
        let config: FhircastConfig = toml::from_str(source)?;
        config.validate().map_err(FhircastError::configuration)?;
        Ok(config)
    }

    /// Load and validate a TOML file.
    pub fn load(path: impl AsRef<Path>) -> FhircastResult<Self> {
        let path = path.as_ref();
        let source = std::fs::read_to_string(path)?;
        let config = Self::from_toml_str(&source)?;
        tracing::debug!(path = %path.display(), "Loaded FHIRcast configuration");
        Ok(config)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionSettings {
    /// Close the session when no frame arrives for this long. Disabled when unset.
    #[serde(default)]
    pub idle_timeout_ms: Option<u64>,
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for ConnectionSettings {
    fn default() -> Self {
        Self {
            idle_timeout_ms: None,
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

impl ConnectionSettings {
    pub fn idle_timeout(&self) -> Option<Duration> {
        self.idle_timeout_ms.map(Duration::from_millis)
    }
}

fn default_outbound_buffer() -> usize {
    64
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}
