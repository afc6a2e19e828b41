//! Server configuration.
//!
//! Every field has a default, so an empty TOML document is a valid
//! configuration:
//!
//! ```toml
//! host = "0.0.0.0"
//! port = 8443
//! secure = true
//! name = "Capsela"
//!
//! [tls]
//! cert_path = "certs/server.pem"
//! key_path = "certs/server.key"
//! # optional: ask clients for certificates signed by these CAs
//! client_ca_path = "certs/clients.pem"
//! ```

use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while loading or validating a configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("secure = true requires a [tls] section with cert_path and key_path")]
    MissingTls,
}

/// Top-level server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Interface to bind.
    pub host: String,

    /// Port to listen on. `0` asks the OS for a free port.
    pub port: u16,

    /// Serve HTTPS instead of plain HTTP.
    pub secure: bool,

    /// Value of the `Server` header on every response.
    pub name: String,

    /// Certificate and key, required when `secure` is set.
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 80,
            secure: false,
            name: "Capsela".to_string(),
            tls: None,
        }
    }
}

/// PEM files for the TLS listener.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    /// CA certificates for verifying client certificates. Clients without
    /// one are still accepted; clients presenting one must pass.
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

impl ServerConfig {
    /// A default configuration listening on `port`.
    pub fn with_port(port: u16) -> Self {
        Self {
            port,
            ..Self::default()
        }
    }

    /// Parses and validates a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates the TOML file at `path`.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&content)
    }

    /// Semantic checks serde cannot express.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.secure && self.tls.is_none() {
            return Err(ConfigError::MissingTls);
        }
        Ok(())
    }

    /// `"https"` or `"http"`, as used in log lines.
    pub fn scheme(&self) -> &'static str {
        if self.secure { "https" } else { "http" }
    }
}
