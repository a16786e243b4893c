//! Ambient configuration layer (spec §4.G's options record, externalized).
//!
//! Mirrors the teacher binary's `AppConfig::load(&cli.config)` shape
//! (`src/bin/server.rs`): defaults, an optional file, then environment
//! variables layered on top via the `config` crate, ending in one
//! `try_deserialize` into a plain settings struct.

use config::{Config, Environment, File};
use serde::Deserialize;

use crate::connection::ConnectionOptions;
use crate::error::{Error, Result};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionConfig {
    #[serde(default = "default_mechanisms")]
    pub mechanisms: Vec<String>,
    #[serde(default)]
    pub size: Option<u64>,
    #[serde(default)]
    pub auto_schema: bool,
    #[serde(default)]
    pub auto_version: bool,
    #[serde(default)]
    pub use_text_store: bool,
}

fn default_mechanisms() -> Vec<String> {
    vec!["native-memory".to_string(), "relational-sql".to_string()]
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        ConnectionConfig {
            mechanisms: default_mechanisms(),
            size: None,
            auto_schema: false,
            auto_version: false,
            use_text_store: false,
        }
    }
}

impl ConnectionConfig {
    /// Layers defaults, an optional config file (`path`, any format the
    /// `config` crate recognizes by extension), and `POLYSTORE__*`
    /// environment variables, in that order of increasing precedence.
    pub fn load(path: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder()
            .set_default("mechanisms", default_mechanisms())
            .map_err(|e| Error::Internal(e.into()))?
            .set_default("autoSchema", false)
            .map_err(|e| Error::Internal(e.into()))?
            .set_default("autoVersion", false)
            .map_err(|e| Error::Internal(e.into()))?
            .set_default("useTextStore", false)
            .map_err(|e| Error::Internal(e.into()))?;

        if let Some(path) = path {
            builder = builder.add_source(File::with_name(path).required(false));
        }
        builder = builder.add_source(Environment::with_prefix("POLYSTORE").separator("__"));

        let config = builder.build().map_err(|e| Error::Internal(e.into()))?;
        config.try_deserialize().map_err(|e| Error::argument(e.to_string()))
    }

    pub fn validate(&self) -> Result<()> {
        if self.mechanisms.is_empty() {
            return Err(Error::argument("mechanisms list must not be empty"));
        }
        Ok(())
    }

    pub fn into_options(self) -> ConnectionOptions {
        ConnectionOptions {
            mechanisms: self.mechanisms,
            size: self.size,
            auto_schema: self.auto_schema,
            auto_version: self.auto_version,
            use_text_store: self.use_text_store,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_with_no_file_or_env() {
        let config = ConnectionConfig::load(None).unwrap();
        config.validate().unwrap();
        assert_eq!(config.mechanisms, default_mechanisms());
        assert!(!config.auto_schema);
    }

    #[test]
    fn empty_mechanisms_fails_validation() {
        let config = ConnectionConfig {
            mechanisms: vec![],
            ..ConnectionConfig::default()
        };
        assert!(config.validate().is_err());
    }
}
