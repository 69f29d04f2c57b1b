//! Server configuration.
//!
//! Layered with figment: built-in defaults, then an optional TOML file, then
//! `TASKPORT_*` environment variables, then command-line overrides.

use std::net::SocketAddr;
use std::path::Path;

use anyhow::{Context, Result};
use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

use crate::frame::FrameLimits;

/// Config file read when no explicit path is given.
pub const DEFAULT_CONFIG_FILE: &str = "taskport.toml";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Address of the RPC listener
    pub bind: SocketAddr,
    /// Address of the HTTP liveness server; disabled when unset
    pub health_bind: Option<SocketAddr>,
    pub max_frame_size: usize,
    pub max_message_size: usize,
    pub verbose: bool,
    pub json_logs: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = FrameLimits::default();
        Self {
            bind: SocketAddr::from(([127, 0, 0, 1], 9400)),
            health_bind: Some(SocketAddr::from(([127, 0, 0, 1], 9401))),
            max_frame_size: limits.max_frame_size,
            max_message_size: limits.max_message_size,
            verbose: false,
            json_logs: false,
        }
    }
}

impl ServerConfig {
    /// Load the configuration. `file` overrides [`DEFAULT_CONFIG_FILE`];
    /// a missing default file is not an error, a missing explicit one is.
    pub fn load<T: Serialize>(file: Option<&Path>, overrides: Option<&T>) -> Result<Self> {
        let mut figment = Figment::from(Serialized::defaults(ServerConfig::default()));

        match file {
            Some(path) => {
                if !path.exists() {
                    anyhow::bail!("config file {} does not exist", path.display());
                }
                figment = figment.merge(Toml::file(path));
            }
            None => figment = figment.merge(Toml::file(DEFAULT_CONFIG_FILE)),
        }

        figment = figment.merge(Env::prefixed("TASKPORT_"));

        if let Some(overrides) = overrides {
            figment = figment.merge(Serialized::defaults(overrides));
        }

        let config: ServerConfig = figment.extract().context("Failed to load configuration")?;
        config.validate()?;
        Ok(config)
    }

    pub fn frame_limits(&self) -> FrameLimits {
        FrameLimits {
            max_frame_size: self.max_frame_size,
            max_message_size: self.max_message_size,
        }
    }

    fn validate(&self) -> Result<()> {
        if self.max_frame_size == 0 {
            anyhow::bail!("max_frame_size must be greater than zero");
        }
        if self.max_message_size < self.max_frame_size {
            anyhow::bail!(
                "max_message_size ({}) must be at least max_frame_size ({})",
                self.max_message_size,
                self.max_frame_size
            );
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[derive(Serialize)]
    struct Overrides {
        #[serde(skip_serializing_if = "Option::is_none")]
        verbose: Option<bool>,
    }

    fn write_config(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    #[test]
    fn file_values_override_defaults() {
        let file = write_config("bind = \"0.0.0.0:7000\"\nmax_frame_size = 1024\n");
        let config = ServerConfig::load::<Overrides>(Some(file.path()), None).unwrap();
        assert_eq!(config.bind, "0.0.0.0:7000".parse().unwrap());
        assert_eq!(config.max_frame_size, 1024);
        assert_eq!(config.max_message_size, ServerConfig::default().max_message_size);
    }

    #[test]
    fn cli_overrides_win_over_file() {
        let file = write_config("verbose = false\n");
        let overrides = Overrides { verbose: Some(true) };
        let config = ServerConfig::load(Some(file.path()), Some(&overrides)).unwrap();
        assert!(config.verbose);
    }

    #[test]
    fn unset_overrides_keep_file_values() {
        let file = write_config("json_logs = true\n");
        let overrides = Overrides { verbose: None };
        let config = ServerConfig::load(Some(file.path()), Some(&overrides)).unwrap();
        assert!(config.json_logs);
        assert!(!config.verbose);
    }

    #[test]
    fn missing_explicit_file_is_an_error() {
        let dir = tempfile::tempdir().unwrap();
        let missing = dir.path().join("nope.toml");
        assert!(ServerConfig::load::<Overrides>(Some(&missing), None).is_err());
    }

    #[test]
    fn inconsistent_limits_are_rejected() {
        let file = write_config("max_frame_size = 4096\nmax_message_size = 1024\n");
        assert!(ServerConfig::load::<Overrides>(Some(file.path()), None).is_err());
    }
}
