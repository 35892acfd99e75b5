//! Run configuration.
//!
//! Loaded from a TOML file with `[backend]`, `[replay]` and `[logging]`
//! sections. `PHOTON_OFFLOAD_*` environment variables override file values;
//! anything unset falls back to the defaults below.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::client::ClientSettings;
use crate::error::{OffloadError, Result};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "photon-offload.toml";

const ENV_PREFIX: &str = "PHOTON_OFFLOAD_";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OffloadConfig {
    pub backend: BackendSection,
    pub replay: ReplaySection,
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendSection {
    pub endpoint: String,
    pub use_broker: bool,
    pub timeout_ms: u64,
    pub connect_timeout_ms: u64,
    pub max_retries: u32,
    pub output_filename: String,
}

impl Default for BackendSection {
    fn default() -> Self {
        Self {
            endpoint: "tcp://127.0.0.1:5554".to_string(),
            use_broker: false,
            timeout_ms: 30_000,
            connect_timeout_ms: 5_000,
            max_retries: 3,
            output_filename: String::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplaySection {
    /// SQLite replay file.
    pub table: PathBuf,
}

impl Default for ReplaySection {
    fn default() -> Self {
        Self {
            table: PathBuf::from("photons.sqlite"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingSection {
    /// Directory for daily log files. No file logging when unset.
    pub log_dir: Option<PathBuf>,
    pub retention_days: u64,
    pub level: Option<String>,
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            log_dir: None,
            retention_days: 7,
            level: None,
        }
    }
}

fn parse_bool(value: &str) -> bool {
    let lower = value.to_lowercase();
    lower == "1" || lower == "true" || lower == "yes" || lower == "on"
}

impl OffloadConfig {
    pub fn from_toml(contents: &str) -> Result<Self> {
        toml::from_str(contents).map_err(|e| OffloadError::Config(e.to_string()))
    }

    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path).map_err(|e| {
            OffloadError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config = Self::from_toml(&contents)?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Explicit path, else `photon-offload.toml` if present, else defaults;
    /// then environment overrides.
    pub fn resolve(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::load(path)?,
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_FILE);
                if default_path.exists() {
                    Self::load(default_path)?
                } else {
                    Self::default()
                }
            }
        };
        config.apply_env();
        Ok(config)
    }

    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(format!("{}{}", ENV_PREFIX, key)).ok());
    }

    /// Apply overrides looked up by key suffix (e.g. `ENDPOINT`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        fn number<T: std::str::FromStr>(key: &str, value: Option<String>) -> Option<T> {
            let value = value?;
            match value.parse() {
                Ok(v) => Some(v),
                Err(_) => {
                    warn!("Ignoring {}{}={}: not a number", ENV_PREFIX, key, value);
                    None
                }
            }
        }

        if let Some(endpoint) = lookup("ENDPOINT") {
            self.backend.endpoint = endpoint;
        }
        if let Some(value) = lookup("USE_BROKER") {
            self.backend.use_broker = parse_bool(&value);
        }
        if let Some(ms) = number("TIMEOUT_MS", lookup("TIMEOUT_MS")) {
            self.backend.timeout_ms = ms;
        }
        if let Some(ms) = number("CONNECT_TIMEOUT_MS", lookup("CONNECT_TIMEOUT_MS")) {
            self.backend.connect_timeout_ms = ms;
        }
        if let Some(n) = number("MAX_RETRIES", lookup("MAX_RETRIES")) {
            self.backend.max_retries = n;
        }
        if let Some(name) = lookup("OUTPUT") {
            self.backend.output_filename = name;
        }
        if let Some(path) = lookup("REPLAY_TABLE") {
            self.replay.table = PathBuf::from(path);
        }
        if let Some(dir) = lookup("LOG_DIR") {
            self.logging.log_dir = Some(PathBuf::from(dir));
        }
        if let Some(level) = lookup("LOG_LEVEL") {
            self.logging.level = Some(level);
        }
        debug!(
            "Backend config: endpoint={}, broker={}, timeout={}ms, retries={}",
            self.backend.endpoint,
            self.backend.use_broker,
            self.backend.timeout_ms,
            self.backend.max_retries
        );
    }

    pub fn client_settings(&self) -> ClientSettings {
        ClientSettings {
            endpoint: self.backend.endpoint.clone(),
            use_broker: self.backend.use_broker,
            timeout: Duration::from_millis(self.backend.timeout_ms),
            connect_timeout: Duration::from_millis(self.backend.connect_timeout_ms),
            max_retries: self.backend.max_retries,
            output_filename: self.backend.output_filename.clone(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[test]
    fn test_defaults() {
        let config = OffloadConfig::default();
        assert_eq!(config.backend.max_retries, 3);
        assert_eq!(config.logging.retention_days, 7);
        assert!(config.logging.log_dir.is_none());
    }

    #[test]
    fn test_partial_toml() {
        let config = OffloadConfig::from_toml(
            r#"
            [backend]
            endpoint = "tcp://gpu-node:7000"
            timeout_ms = 250

            [replay]
            table = "/data/run42.sqlite"
            "#,
        )
        .unwrap();
        assert_eq!(config.backend.endpoint, "tcp://gpu-node:7000");
        assert_eq!(config.backend.timeout_ms, 250);
        assert_eq!(config.backend.max_retries, 3);
        assert_eq!(config.replay.table, PathBuf::from("/data/run42.sqlite"));

        let settings = config.client_settings();
        assert_eq!(settings.timeout, Duration::from_millis(250));
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(
            OffloadConfig::from_toml("[backend]\nmax_retries = \"many\""),
            Err(OffloadError::Config(_))
        ));
    }

    #[test]
    fn test_overrides() {
        let vars: HashMap<&str, &str> = [
            ("ENDPOINT", "10.1.1.1:9000"),
            ("USE_BROKER", "yes"),
            ("MAX_RETRIES", "5"),
            ("TIMEOUT_MS", "soon"),
        ]
        .into_iter()
        .collect();

        let mut config = OffloadConfig::default();
        config.apply_overrides(|key| vars.get(key).map(|v| v.to_string()));

        assert_eq!(config.backend.endpoint, "10.1.1.1:9000");
        assert!(config.backend.use_broker);
        assert_eq!(config.backend.max_retries, 5);
        assert_eq!(config.backend.timeout_ms, 30_000);
    }
}
