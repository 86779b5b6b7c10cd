//! Backend configuration
//!
//! One engine instance is constructed per configured backend; the
//! transport flavor, address and port are validated up front so a bad
//! configuration fails at construction, not at bind time.

use common::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::net::{Ipv4Addr, Ipv6Addr};
use std::path::{Path, PathBuf};

/// Socket path used when a Unix transport omits one
pub const DEFAULT_SOCKET_PATH: &str = "/tmp/remote-usb.sock";

/// Maximum Unix socket path length (sun_path limit)
const MAX_SOCKET_PATH: usize = 107;

/// Transport flavor for the listening socket
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Transport {
    /// Unix-domain stream socket
    Unix {
        /// Socket path; [`DEFAULT_SOCKET_PATH`] when omitted
        #[serde(default)]
        path: Option<PathBuf>,
    },
    /// IPv4 TCP socket
    Tcp {
        /// Bind address; 0.0.0.0 when omitted
        #[serde(default)]
        addr: Option<Ipv4Addr>,
        port: u16,
    },
    /// IPv6 TCP socket
    Tcp6 {
        /// Bind address; :: when omitted
        #[serde(default)]
        addr: Option<Ipv6Addr>,
        port: u16,
    },
}

/// Configuration for one backend instance
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackendConfig {
    pub transport: Transport,
    /// Default log filter when RUST_LOG is unset
    #[serde(default = "BackendConfig::default_log_level")]
    pub log_level: String,
}

impl BackendConfig {
    fn default_log_level() -> String {
        "info".to_string()
    }

    /// Build a validated configuration
    pub fn new(transport: Transport) -> Result<Self> {
        let config = Self {
            transport,
            log_level: Self::default_log_level(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a configuration from a TOML file
    pub fn load(path: &Path) -> Result<Self> {
        let contents = fs::read_to_string(path)?;
        Self::from_toml(&contents)
    }

    /// Parse and validate a configuration from TOML text
    pub fn from_toml(contents: &str) -> Result<Self> {
        let config: Self = toml::from_str(contents)
            .map_err(|e| Error::Config(format!("Invalid configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Install the global tracing subscriber with this configuration's
    /// default filter (`RUST_LOG` still wins when set)
    pub fn init_logging(&self) -> Result<()> {
        common::setup_logging(&self.log_level)
    }

    /// Check transport parameters
    pub fn validate(&self) -> Result<()> {
        match &self.transport {
            Transport::Unix { path } => {
                if let Some(path) = path {
                    if path.as_os_str().len() > MAX_SOCKET_PATH {
                        return Err(Error::Config(format!(
                            "Socket path too long: {}",
                            path.display()
                        )));
                    }
                }
                Ok(())
            }
            Transport::Tcp { port, .. } | Transport::Tcp6 { port, .. } => {
                if *port == 0 {
                    return Err(Error::Config("Port must be specified".to_string()));
                }
                Ok(())
            }
        }
    }
}
