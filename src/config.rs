//! Server configuration.
//!
//! Loaded from a TOML file; every option has a default so an empty file (or
//! none at all) yields a runnable standalone server. TLS applies only when
//! both certificate and key are set; naming one without the other is a
//! configuration error rather than a silent plain-text listener.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    #[error("cannot read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("cannot parse config file: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub server: ServerConfig,

    pub status: StatusConfig,

    /// The service's own logger.
    pub logger: LoggerConfig,

    /// Separate logger block for the KV driver.
    #[serde(rename = "kv-logger")]
    pub kv_logger: LoggerConfig,

    /// Where to record the daemon's PID.
    #[serde(rename = "pid-filename")]
    pub pid_filename: PathBuf,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            status: StatusConfig::default(),
            logger: LoggerConfig::default(),
            kv_logger: LoggerConfig {
                name: "kvbus-store".to_owned(),
                ..LoggerConfig::default()
            },
            pid_filename: PathBuf::from("kvbusd.pid"),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct ServerConfig {
    /// Address the API server listens on.
    pub listen: String,

    /// Placement-driver address list of the backing KV cluster. Ignored by
    /// the embedded memory backend.
    #[serde(rename = "pd-addrs")]
    pub pd_addrs: Vec<String>,

    #[serde(rename = "tls-cert")]
    pub tls_cert: Option<PathBuf>,

    #[serde(rename = "tls-key")]
    pub tls_key: Option<PathBuf>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7369".to_owned(),
            pd_addrs: Vec::new(),
            tls_cert: None,
            tls_key: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct StatusConfig {
    /// Address of the status/metrics listener.
    pub listen: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:7345".to_owned(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoggerConfig {
    /// Logger name, also the label on the log-entry counter.
    pub name: String,

    /// Log directory; events go to stderr when unset.
    pub path: Option<PathBuf>,

    /// Log level: trace, debug, info, warn or error.
    pub level: String,

    /// Recognised for config compatibility; rotated files are not
    /// compressed.
    pub compress: bool,

    #[serde(rename = "time-rotate")]
    pub rotation: Rotation,
}

impl Default for LoggerConfig {
    fn default() -> Self {
        Self {
            name: "kvbus".to_owned(),
            path: None,
            level: "info".to_owned(),
            compress: false,
            rotation: Rotation::Daily,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rotation {
    Minutely,
    Hourly,
    Daily,
    Never,
}

impl Config {
    pub fn load(path: &Path) -> Result<Self, Error> {
        let raw = std::fs::read_to_string(path)?;
        Self::parse(&raw)
    }

    pub fn parse(raw: &str) -> Result<Self, Error> {
        let config: Self = toml::from_str(raw)?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), Error> {
        if self.server.tls_cert.is_some() != self.server.tls_key.is_some() {
            return Err(Error::Invalid(
                "tls-cert and tls-key must be set together".to_owned(),
            ));
        }
        Ok(())
    }

    pub fn tls_enabled(&self) -> bool {
        self.server.tls_cert.is_some() && self.server.tls_key.is_some()
    }
}
